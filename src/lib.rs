//! WP Veiculos Desktop Library
//!
//! Core modules for the vehicle marketplace client: session handling,
//! listings, photo uploads and the route gate. The Tauri shell lives behind
//! the `desktop` feature.

pub mod assets;
pub mod auth;
pub mod backend;
pub mod config;
pub mod form;
pub mod gate;
pub mod listing;
pub mod logging;
pub mod storage;
pub mod validation;

#[cfg(feature = "desktop")]
pub mod commands;

#[cfg(test)]
mod testing;

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use assets::UploadPipeline;
use auth::{AuthState, AuthStore, Subscription};
use backend::firebase::FirebaseBackend;
use backend::{AuthProvider, BackendError, DocumentStore, ObjectStorage};
use config::{AppConfig, ConfigError};
use form::ListingForm;
use gate::{GateDecision, Route};
use listing::ListingRepository;
use storage::{SecureStorage, StorageError};

/// Application state shared across commands
pub struct AppState {
    pub auth: Arc<AuthStore>,
    pub listings: Arc<ListingRepository>,
    pub form: Arc<ListingForm>,
    // Clears the form when the signed-in user changes
    _form_reset: Subscription,
}

impl AppState {
    /// Wire the stores together over the given backends
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStorage>,
        storage: SecureStorage,
    ) -> Self {
        let auth = Arc::new(AuthStore::new(provider, storage));
        let listings = Arc::new(ListingRepository::new(documents, Arc::clone(&objects)));
        let form = Arc::new(ListingForm::new(
            UploadPipeline::new(objects),
            Arc::clone(&listings),
        ));

        let on_change = Arc::clone(&form);
        let last_uid: Mutex<Option<String>> = Mutex::new(None);
        let form_reset = auth.observe(move |state| {
            let uid = match state {
                AuthState::Loading => return,
                AuthState::SignedOut => None,
                AuthState::SignedIn(session) => Some(session.uid.clone()),
            };
            let mut last = last_uid.lock().unwrap_or_else(PoisonError::into_inner);
            if uid.is_none() || (last.is_some() && *last != uid) {
                on_change.reset();
            }
            *last = uid;
        });

        Self {
            auth,
            listings,
            form,
            _form_reset: form_reset,
        }
    }

    /// Build the state against the configured Firebase project
    pub fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let storage = SecureStorage::open(&config.data_dir)?;
        let firebase = Arc::new(FirebaseBackend::new(config)?);
        info!(
            "Using Firebase project {} (bucket {})",
            config.project_id, config.storage_bucket
        );

        let state = Self::new(firebase.clone(), firebase.clone(), firebase.clone(), storage);

        let auth = Arc::downgrade(&state.auth);
        firebase.on_refresh(move |credential| {
            if let Some(auth) = auth.upgrade() {
                auth.update_credential(credential.clone());
            }
        });
        Ok(state)
    }

    /// Restore the persisted session
    pub async fn start(&self) {
        self.auth.start().await;
    }

    /// Gate a navigation to `path`
    pub fn gate(&self, path: &str) -> GateDecision {
        gate::decide(&self.auth.state(), &Route::parse(path))
    }

    pub fn shutdown(&self) {
        self.auth.shutdown();
        info!("Application state shut down");
    }
}

/// Errors raised while building [`AppState`]
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Local storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}
