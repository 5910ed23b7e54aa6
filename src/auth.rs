//! Authentication Module
//!
//! Session model and the auth-state store: a single owned cell holding the
//! signed-in session, mirrored to local storage and observable through
//! disposable subscriptions.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{AuthProvider, BackendError};
use crate::storage::SecureStorage;

/// Storage key of the session mirror
pub const SESSION_KEY: &str = "session";

/// Provider credential attached to a session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Check if the ID token is expired
    pub fn is_expired(&self) -> bool {
        self.expires_within(chrono::Duration::zero())
    }

    /// Check if the ID token expires within `margin` from now
    pub fn expires_within(&self, margin: chrono::Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Authenticated identity of the current user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub uid: String,
    pub display_name: String,
    pub email: String,
    pub credential: Credential,
}

impl Session {
    /// Public part of the session, safe to hand to the UI
    pub fn view(&self) -> SessionView {
        SessionView {
            uid: self.uid.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
        }
    }
}

/// Session without its credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub uid: String,
    pub display_name: String,
    pub email: String,
}

/// Current authentication state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Not yet determined: no provider notification received
    Loading,
    SignedOut,
    SignedIn(Session),
}

impl AuthState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthState::SignedIn(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, AuthState::Loading)
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, AuthState::SignedIn(_))
    }
}

type Observer = Arc<dyn Fn(&AuthState) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(u64, Observer)>,
}

/// Disposer returned by [`AuthStore::observe`]; dropping it unregisters
/// the callback.
#[must_use = "dropping a Subscription immediately unregisters the observer"]
pub struct Subscription {
    id: u64,
    observers: Weak<Mutex<Observers>>,
}

impl Subscription {
    /// Unregister the callback now
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            let mut observers = observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.entries.retain(|(id, _)| *id != self.id);
            debug!("Auth observer {} unsubscribed", self.id);
        }
    }
}

/// Owns the signed-in state for the lifetime of the application
pub struct AuthStore {
    provider: Arc<dyn AuthProvider>,
    storage: SecureStorage,
    state: Mutex<AuthState>,
    observers: Arc<Mutex<Observers>>,
    // Serializes publication so observers see changes in order
    publish_lock: Mutex<()>,
}

impl AuthStore {
    /// Create a store in the `Loading` state
    pub fn new(provider: Arc<dyn AuthProvider>, storage: SecureStorage) -> Self {
        Self {
            provider,
            storage,
            state: Mutex::new(AuthState::Loading),
            observers: Arc::new(Mutex::new(Observers::default())),
            publish_lock: Mutex::new(()),
        }
    }

    /// Restore the persisted session and publish the first notification.
    ///
    /// Does nothing once the state has been determined.
    pub async fn start(&self) {
        if !self.is_loading() {
            debug!("Auth store already started");
            return;
        }

        let restored = match self.storage.load::<Session>(SESSION_KEY) {
            Ok(Some(stored)) => self.restore(stored).await,
            Ok(None) => {
                debug!("No stored session found");
                None
            }
            Err(e) => {
                warn!("Discarding unreadable stored session: {}", e);
                None
            }
        };

        self.notify(restored);
    }

    async fn restore(&self, stored: Session) -> Option<Session> {
        match self.provider.restore(stored.clone()).await {
            Ok(Some(session)) => {
                info!("Restored session for user: {}", session.uid);
                Some(session)
            }
            Ok(None) => {
                info!("Provider reports no active credential for user: {}", stored.uid);
                None
            }
            Err(e) => {
                warn!("Auth provider unreachable, keeping stored session: {}", e);
                Some(stored)
            }
        }
    }

    /// Apply a provider notification: overwrite the cell, mirror it to local
    /// storage and invoke every observer.
    ///
    /// Must not be called from inside an observer callback.
    pub fn notify(&self, session: Option<Session>) {
        let next = match session {
            Some(session) => AuthState::SignedIn(session),
            None => AuthState::SignedOut,
        };

        let _order = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next.clone();
        self.mirror(&next);

        match &next {
            AuthState::SignedIn(session) => info!("Auth state: signed in as {}", session.uid),
            _ => info!("Auth state: signed out"),
        }

        for observer in self.snapshot_observers() {
            observer(&next);
        }
    }

    fn mirror(&self, state: &AuthState) {
        let result = match state {
            AuthState::SignedIn(session) => self.storage.save(SESSION_KEY, session),
            _ => self.storage.delete(SESSION_KEY),
        };
        if let Err(e) = result {
            error!("Failed to mirror session to local storage: {}", e);
        }
    }

    fn snapshot_observers(&self) -> Vec<Observer> {
        let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.entries.iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    /// Register `callback`; it runs now with the current state and again on
    /// every change until the returned [`Subscription`] is dropped.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AuthState) + Send + Sync + 'static,
    {
        let _order = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let observer: Observer = Arc::new(callback);
        let id = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            let id = observers.next_id;
            observers.next_id += 1;
            observers.entries.push((id, Arc::clone(&observer)));
            id
        };
        debug!("Auth observer {} subscribed", id);

        observer(&self.state());

        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> AuthState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Last known session, if signed in
    pub fn current_session(&self) -> Option<Session> {
        self.state().session().cloned()
    }

    /// True until the first provider notification
    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    /// Sign in and publish the new session
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let session = self.provider.sign_in(email, password).await?;
        self.notify(Some(session.clone()));
        Ok(session)
    }

    /// Create an account and publish the new session
    pub async fn register(
        &self,
        display_name: &str,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let session = self.provider.register(email, password, display_name).await?;
        self.notify(Some(session.clone()));
        Ok(session)
    }

    /// Sign out at the provider; the cell is cleared only on success
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.provider.sign_out().await?;
        self.notify(None);
        Ok(())
    }

    /// Replace the credential of the signed-in session after the provider
    /// refreshed it, and re-save the mirror. Observers are not called: the
    /// signed-in user did not change.
    pub fn update_credential(&self, credential: Credential) {
        let _order = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let updated = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let AuthState::SignedIn(session) = &mut *state else {
                debug!("Ignoring refreshed credential while signed out");
                return;
            };
            session.credential = credential;
            state.clone()
        };
        self.mirror(&updated);
        debug!("Session credential refreshed");
    }

    /// Drop every observer; called when the application stops
    pub fn shutdown(&self) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let count = observers.entries.len();
        observers.entries.clear();
        info!("Auth store shut down ({} observers released)", count);
    }
}

/// Authentication errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid e-mail or password")]
    InvalidCredentials,

    #[error("E-mail already registered")]
    EmailInUse,

    #[error("Password too weak: {0}")]
    WeakPassword(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl From<BackendError> for AuthError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network(message) => AuthError::Network(message),
            other => AuthError::Provider(other.to_string()),
        }
    }
}
