//! Tauri Commands Module
//!
//! IPC commands exposed to the frontend.

use std::collections::BTreeMap;

use serde::Serialize;
use tauri::{command, AppHandle, Emitter, State};
use tauri_plugin_shell::ShellExt;
use tracing::{debug, error, info};

use crate::assets::{AssetError, ImageAsset, SelectedFile};
use crate::auth::{AuthError, AuthState, Session, SessionView, Subscription};
use crate::form::SubmissionError;
use crate::gate::GateDecision;
use crate::listing::{DeleteReport, Listing, ListingError};
use crate::validation::{FieldErrors, ListingDraft, RegisterForm, SignInForm, NO_IMAGES_MESSAGE};
use crate::AppState;

/// Event carrying every auth state change
pub const AUTH_CHANGED_EVENT: &str = "auth_changed";

// Response types for frontend

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub loading: bool,
    pub session: Option<SessionView>,
}

impl From<&AuthState> for AuthStatus {
    fn from(state: &AuthState) -> Self {
        Self {
            loading: state.is_loading(),
            session: state.session().map(Session::view),
        }
    }
}

/// Error payload returned to the frontend
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandError {
    pub message: String,
    /// Field name to message, for inline form errors
    pub fields: BTreeMap<String, String>,
}

impl CommandError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }
}

impl From<FieldErrors> for CommandError {
    fn from(errors: FieldErrors) -> Self {
        Self {
            message: "Verifique os campos destacados".into(),
            fields: errors
                .iter()
                .map(|(field, message)| (field.as_str().to_string(), message.to_string()))
                .collect(),
        }
    }
}

impl From<SubmissionError> for CommandError {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::Validation(validation) => {
                let mut out = CommandError::from(validation.fields);
                if validation.missing_images {
                    out.message = NO_IMAGES_MESSAGE.into();
                }
                out
            }
            other => CommandError::new(other.to_string()),
        }
    }
}

macro_rules! message_errors {
    ($($ty:ty),*) => {
        $(impl From<$ty> for CommandError {
            fn from(err: $ty) -> Self {
                CommandError::new(err.to_string())
            }
        })*
    };
}

message_errors!(AuthError, ListingError, AssetError);

fn require_session(state: &AppState) -> Result<Session, CommandError> {
    state
        .auth
        .current_session()
        .ok_or_else(|| CommandError::new("Faça login para continuar"))
}

async fn find_listing(state: &AppState, id: &str) -> Result<Listing, CommandError> {
    state
        .listings
        .get_listing(id)
        .await?
        .ok_or_else(|| CommandError::new(format!("Anúncio {id} não encontrado")))
}

/// Emit [`AUTH_CHANGED_EVENT`] on every auth state change while the
/// returned subscription lives
pub fn forward_auth_events(app: AppHandle, state: &AppState) -> Subscription {
    state.auth.observe(move |auth| {
        if let Err(e) = app.emit(AUTH_CHANGED_EVENT, AuthStatus::from(auth)) {
            error!("Failed to emit {}: {}", AUTH_CHANGED_EVENT, e);
        }
    })
}

// Commands

/// Current auth state
#[command]
pub fn get_auth_state(state: State<'_, AppState>) -> AuthStatus {
    AuthStatus::from(&state.auth.state())
}

#[command]
pub async fn sign_in(
    form: SignInForm,
    state: State<'_, AppState>,
) -> Result<SessionView, CommandError> {
    form.validate()?;
    let session = state.auth.sign_in(form.email.trim(), &form.password).await?;
    Ok(session.view())
}

#[command]
pub async fn register(
    form: RegisterForm,
    state: State<'_, AppState>,
) -> Result<SessionView, CommandError> {
    form.validate()?;
    let session = state
        .auth
        .register(form.name.trim(), form.email.trim(), &form.password)
        .await?;
    Ok(session.view())
}

#[command]
pub async fn sign_out(state: State<'_, AppState>) -> Result<(), CommandError> {
    info!("Signing out");
    state.auth.sign_out().await?;
    Ok(())
}

/// Gate a navigation
#[command]
pub fn resolve_route(path: String, state: State<'_, AppState>) -> GateDecision {
    state.gate(&path)
}

/// Every listing, optionally filtered by name
#[command]
pub async fn list_listings(
    search: Option<String>,
    state: State<'_, AppState>,
) -> Result<Vec<Listing>, CommandError> {
    let listings = match search {
        Some(term) => state.listings.search(&term).await?,
        None => state.listings.list_all().await?,
    };
    Ok(listings)
}

#[command]
pub async fn get_listing(
    id: String,
    state: State<'_, AppState>,
) -> Result<Option<Listing>, CommandError> {
    Ok(state.listings.get_listing(&id).await?)
}

/// Listings of the signed-in user
#[command]
pub async fn list_my_listings(state: State<'_, AppState>) -> Result<Vec<Listing>, CommandError> {
    let session = require_session(&state)?;
    Ok(state.listings.list_by_owner(&session.uid).await?)
}

#[command]
pub async fn delete_listing(
    id: String,
    state: State<'_, AppState>,
) -> Result<DeleteReport, CommandError> {
    let session = require_session(&state)?;
    let listing = find_listing(&state, &id).await?;
    Ok(state.listings.delete_listing(&session, &listing).await?)
}

/// Upload a photo for the new-listing form
#[command]
pub async fn upload_image(
    file: SelectedFile,
    state: State<'_, AppState>,
) -> Result<ImageAsset, CommandError> {
    let session = require_session(&state)?;
    debug!("Uploading {} ({} bytes)", file.file_name, file.bytes.len());
    Ok(state.form.add_image(file, &session).await?)
}

#[command]
pub async fn remove_image(asset_id: String, state: State<'_, AppState>) -> Result<(), CommandError> {
    state.form.remove_image(&asset_id).await?;
    Ok(())
}

/// Photos uploaded for the form so far
#[command]
pub fn pending_images(state: State<'_, AppState>) -> Vec<ImageAsset> {
    state.form.images()
}

#[command]
pub async fn submit_listing(
    draft: ListingDraft,
    state: State<'_, AppState>,
) -> Result<Listing, CommandError> {
    let session = require_session(&state)?;
    Ok(state.form.submit(&draft, &session).await?)
}

#[command]
pub async fn resume_submission(state: State<'_, AppState>) -> Result<Listing, CommandError> {
    let session = require_session(&state)?;
    Ok(state.form.resume_submission(&session).await?)
}

/// Open a WhatsApp chat with the seller
#[command]
pub async fn open_whatsapp(
    id: String,
    app: AppHandle,
    state: State<'_, AppState>,
) -> Result<(), CommandError> {
    let listing = find_listing(&state, &id).await?;
    let link = listing
        .whatsapp_link()
        .ok_or_else(|| CommandError::new("Contato indisponível"))?;

    #[allow(deprecated)]
    app.shell().open(link, None).map_err(|e| {
        error!("Failed to open WhatsApp link: {}", e);
        CommandError::new(e.to_string())
    })
}
