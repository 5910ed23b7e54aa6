//! Backend Module
//!
//! Seams to the hosted services the client depends on: an authentication
//! provider, a document store and an object store. The application only
//! talks to these traits; [`firebase::FirebaseBackend`] implements all
//! three over the Firebase REST APIs.

pub mod firebase;
pub mod firestore_value;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::auth::{AuthError, Session};

/// Plain JSON fields of a stored document
pub type Fields = Map<String, Value>;

/// Key of the single-entry object that marks a timestamp field
pub const TIMESTAMP_KEY: &str = "$timestamp";

/// Plain-JSON form of a timestamp field; stores that have a native
/// timestamp type write it as one
pub fn timestamp_value(time: DateTime<Utc>) -> Value {
    let mut marker = Map::new();
    marker.insert(
        TIMESTAMP_KEY.to_string(),
        Value::String(time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
    );
    Value::Object(marker)
}

/// Read a timestamp field written by [`timestamp_value`] or read back from
/// a store as RFC 3339 text
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Object(marker) => marker.get(TIMESTAMP_KEY)?.as_str()?,
        _ => return None,
    };
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A document read back from the document store
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub fields: Fields,
    /// Server-assigned creation time, when the backend reports one
    pub create_time: Option<DateTime<Utc>>,
}

/// Selection applied by [`DocumentStore::query`]
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    FieldEquals { field: String, value: Value },
}

impl Filter {
    /// Equality filter on a single string field
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        Filter::FieldEquals {
            field: field.to_string(),
            value: Value::String(value.into()),
        }
    }

    /// Whether `fields` satisfy this filter
    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::All => true,
            Filter::FieldEquals { field, value } => fields.get(field) == Some(value),
        }
    }
}

/// Reference to an object written to object storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub path: String,
    /// Access token the storage service attached to the object, if any
    pub download_token: Option<String>,
}

/// Hosted identity provider
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Sign in with e-mail and password
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    /// Create an account and set its display name
    async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Session, AuthError>;

    /// End the provider-side session
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Re-activate a session restored from local storage.
    ///
    /// - `Ok(Some(_))`: credential still active (possibly refreshed)
    /// - `Ok(None)`: the provider reports no active credential
    /// - `Err(_)`: the provider could not be asked
    async fn restore(&self, stored: Session) -> Result<Option<Session>, AuthError>;
}

/// Hosted document database
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document with a generated id
    async fn create(&self, collection: &str, fields: Fields) -> Result<Record, BackendError>;

    /// Fetch a single document; `Ok(None)` if it does not exist
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, BackendError>;

    /// Return every document of `collection` matching `filter`, in backend order
    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, BackendError>;

    /// Delete a document
    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError>;
}

/// Hosted object storage
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload `bytes` to `path`
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<AssetHandle, BackendError>;

    /// Resolve a durable download URL for an uploaded object
    async fn resolve_url(&self, handle: &AssetHandle) -> Result<String, BackendError>;

    /// Delete the object at `path`
    async fn delete(&self, path: &str) -> Result<(), BackendError>;
}

/// Errors raised by the hosted services
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not authenticated")]
    Unauthenticated,
}
