//! Firebase REST Backend
//!
//! Implements the three backend traits over the Identity Toolkit, Secure
//! Token, Firestore and Cloud Storage REST endpoints. The signed-in
//! credential lives here so document and storage calls can authenticate;
//! ID tokens are refreshed shortly before they expire.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::firestore_value::{decode_fields, encode, encode_fields};
use super::{
    AssetHandle, AuthProvider, BackendError, DocumentStore, Fields, Filter, ObjectStorage, Record,
};
use crate::auth::{AuthError, Credential, Session};
use crate::config::AppConfig;

const IDENTITY_BASE: &str = "https://identitytoolkit.googleapis.com/v1";
const TOKEN_BASE: &str = "https://securetoken.googleapis.com/v1";
const FIRESTORE_BASE: &str = "https://firestore.googleapis.com/v1";
const STORAGE_BASE: &str = "https://firebasestorage.googleapis.com/v0";

/// Refresh ID tokens this long before they expire
const REFRESH_MARGIN_SECS: i64 = 60;

/// Refresh-token failures that mean the account has no active credential
const REVOKED_CODES: &[&str] = &[
    "TOKEN_EXPIRED",
    "INVALID_REFRESH_TOKEN",
    "USER_NOT_FOUND",
    "USER_DISABLED",
];

type RefreshListener = Arc<dyn Fn(&Credential) + Send + Sync>;

/// Client for a single Firebase project
pub struct FirebaseBackend {
    api_key: String,
    project_id: String,
    bucket: String,
    token_base: String,
    client: reqwest::Client,
    credential: RwLock<Option<Credential>>,
    on_refresh: RwLock<Option<RefreshListener>>,
}

impl FirebaseBackend {
    /// Create a client from application configuration
    pub fn new(config: &AppConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            api_key: config.api_key.clone(),
            project_id: config.project_id.clone(),
            bucket: config.storage_bucket.clone(),
            token_base: TOKEN_BASE.to_string(),
            client,
            credential: RwLock::new(None),
            on_refresh: RwLock::new(None),
        })
    }

    /// Call `listener` with every credential refreshed behind a request
    pub fn on_refresh<F>(&self, listener: F)
    where
        F: Fn(&Credential) + Send + Sync + 'static,
    {
        *self.on_refresh.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = credential;
    }

    fn current_credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current ID token, refreshed first if it is about to expire
    async fn bearer(&self) -> Result<Option<String>, BackendError> {
        let Some(credential) = self.current_credential() else {
            return Ok(None);
        };
        if !credential.expires_within(chrono::Duration::seconds(REFRESH_MARGIN_SECS)) {
            return Ok(Some(credential.id_token));
        }

        debug!("ID token about to expire, refreshing");
        let refreshed = self.refresh(&credential.refresh_token).await?;
        self.set_credential(Some(refreshed.clone()));

        let listener = self
            .on_refresh
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(&refreshed);
        }
        Ok(Some(refreshed.id_token))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, BackendError> {
        let url = format!("{}/token", self.token_base);
        let request = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)]);

        let response: RefreshResponse = send_json(request).await?;
        Ok(Credential {
            id_token: response.id_token,
            refresh_token: response.refresh_token,
            expires_at: expires_at(&response.expires_in),
        })
    }

    fn identity_request(&self, method: &str) -> RequestBuilder {
        let url = format!("{IDENTITY_BASE}/accounts:{method}");
        debug!("Identity request: {}", url);
        self.client.post(url).query(&[("key", self.api_key.as_str())])
    }

    fn documents_base(&self) -> String {
        format!(
            "{FIRESTORE_BASE}/projects/{}/databases/(default)/documents",
            self.project_id
        )
    }

    fn document_url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url =
            Url::parse(&self.documents_base()).map_err(|e| BackendError::Parse(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Parse("documents URL cannot be a base".into()))?
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, path: &str) -> Result<Url, BackendError> {
        object_url(&self.bucket, path)
    }

    async fn with_bearer(
        &self,
        request: RequestBuilder,
        scheme: &str,
    ) -> Result<RequestBuilder, BackendError> {
        Ok(match self.bearer().await? {
            Some(token) => request.header("Authorization", format!("{scheme} {token}")),
            None => request,
        })
    }
}

#[async_trait]
impl AuthProvider for FirebaseBackend {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let request = self.identity_request("signInWithPassword").json(&PasswordRequest {
            email,
            password,
            return_secure_token: true,
        });
        let response: AccountResponse = send_json(request).await.map_err(auth_error)?;

        let session = response.into_session(None);
        self.set_credential(Some(session.credential.clone()));
        info!("Signed in user: {}", session.uid);
        Ok(session)
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Session, AuthError> {
        let request = self.identity_request("signUp").json(&PasswordRequest {
            email,
            password,
            return_secure_token: true,
        });
        let response: AccountResponse = send_json(request).await.map_err(auth_error)?;

        let update = self.identity_request("update").json(&json!({
            "idToken": response.id_token,
            "displayName": display_name,
            "returnSecureToken": false,
        }));
        let _: Value = send_json(update).await.map_err(auth_error)?;

        let session = response.into_session(Some(display_name));
        self.set_credential(Some(session.credential.clone()));
        info!("Registered user: {}", session.uid);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        // Password sessions have no server-side sign-out; dropping the token is enough
        self.set_credential(None);
        Ok(())
    }

    async fn restore(&self, stored: Session) -> Result<Option<Session>, AuthError> {
        if !stored
            .credential
            .expires_within(chrono::Duration::seconds(REFRESH_MARGIN_SECS))
        {
            self.set_credential(Some(stored.credential.clone()));
            return Ok(Some(stored));
        }

        match self.refresh(&stored.credential.refresh_token).await {
            Ok(credential) => {
                self.set_credential(Some(credential.clone()));
                Ok(Some(Session { credential, ..stored }))
            }
            Err(err) if is_revoked(&err) => {
                self.set_credential(None);
                Ok(None)
            }
            Err(err) => {
                // Keep the stored credential so later requests retry the refresh
                self.set_credential(Some(stored.credential.clone()));
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl DocumentStore for FirebaseBackend {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Record, BackendError> {
        let url = self.document_url(&[collection])?;
        debug!("Creating document in: {}", url);

        let request = self
            .client
            .post(url)
            .json(&json!({ "fields": encode_fields(&fields) }));
        let document: Value = send_json(self.with_bearer(request, "Bearer").await?).await?;
        record_from_document(&document)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, BackendError> {
        let url = self.document_url(&[collection, id])?;
        let request = self.with_bearer(self.client.get(url), "Bearer").await?;

        match send_json::<Value>(request).await {
            Ok(document) => record_from_document(&document).map(Some),
            Err(BackendError::Server { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, BackendError> {
        let url = format!("{}:runQuery", self.documents_base());
        let request = self
            .client
            .post(&url)
            .json(&structured_query(collection, filter));

        let rows: Vec<Value> = send_json(self.with_bearer(request, "Bearer").await?).await?;
        rows.iter()
            .filter_map(|row| row.get("document"))
            .map(record_from_document)
            .collect()
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
        let url = self.document_url(&[collection, id])?;
        let request = self.with_bearer(self.client.delete(url), "Bearer").await?;
        let _: Value = send_json(request).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for FirebaseBackend {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<AssetHandle, BackendError> {
        let url = format!("{STORAGE_BASE}/b/{}/o", self.bucket);
        debug!("Uploading {} bytes to: {}", bytes.len(), path);

        let request = self
            .client
            .post(&url)
            .query(&[("name", path)])
            .header("Content-Type", content_type)
            .body(bytes);
        let metadata: ObjectMetadata = send_json(self.with_bearer(request, "Firebase").await?).await?;

        Ok(metadata.into())
    }

    async fn resolve_url(&self, handle: &AssetHandle) -> Result<String, BackendError> {
        let token = match &handle.download_token {
            Some(token) => token.clone(),
            None => {
                let request = self
                    .with_bearer(self.client.get(self.object_url(&handle.path)?), "Firebase")
                    .await?;
                let metadata: ObjectMetadata = send_json(request).await?;
                metadata.first_token().ok_or_else(|| {
                    BackendError::Parse(format!("object {} has no download token", handle.path))
                })?
            }
        };
        download_url(&self.bucket, &handle.path, &token)
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        let request = self
            .with_bearer(self.client.delete(self.object_url(path)?), "Firebase")
            .await?;

        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                warn!("Object already gone: {}", path);
                Ok(())
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Err(error_from_body(status, &body))
            }
            Err(e) => Err(BackendError::Network(e.to_string())),
        }
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, BackendError> {
    let response = request
        .send()
        .await
        .map_err(|e| BackendError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(error_from_body(status.as_u16(), &body));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| BackendError::Parse(e.to_string()))
}

/// Map a failed response to a [`BackendError`]. Google APIs answer with
/// `{"error": {"code": .., "message": ..}}`.
fn error_from_body(status: u16, body: &str) -> BackendError {
    if status == 401 {
        return BackendError::Unauthenticated;
    }
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| format!("Status: {status}"));
    BackendError::Server { status, message }
}

fn auth_error(err: BackendError) -> AuthError {
    let message = match err {
        BackendError::Server { message, .. } => message,
        other => return other.into(),
    };

    // Identity Toolkit messages look like "WEAK_PASSWORD : Password should be ..."
    let (code, detail) = match message.split_once(" : ") {
        Some((code, detail)) => (code.trim(), detail.trim()),
        None => (message.trim(), ""),
    };

    match code {
        "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" | "USER_DISABLED"
        | "INVALID_EMAIL" => AuthError::InvalidCredentials,
        "EMAIL_EXISTS" => AuthError::EmailInUse,
        "WEAK_PASSWORD" => AuthError::WeakPassword(detail.to_string()),
        _ => AuthError::Provider(message.clone()),
    }
}

fn is_revoked(err: &BackendError) -> bool {
    match err {
        BackendError::Server { status: 400, message } => REVOKED_CODES
            .iter()
            .any(|code| message.trim().starts_with(code)),
        _ => false,
    }
}

fn expires_at(expires_in: &str) -> DateTime<Utc> {
    let secs = expires_in.trim().parse::<i64>().unwrap_or_else(|_| {
        warn!("Unparseable token lifetime {:?}, assuming one hour", expires_in);
        3600
    });
    Utc::now() + chrono::Duration::seconds(secs)
}

fn structured_query(collection: &str, filter: &Filter) -> Value {
    let mut query = json!({ "from": [{ "collectionId": collection }] });
    if let Filter::FieldEquals { field, value } = filter {
        query["where"] = json!({
            "fieldFilter": {
                "field": { "fieldPath": field },
                "op": "EQUAL",
                "value": encode(value),
            }
        });
    }
    json!({ "structuredQuery": query })
}

fn record_from_document(document: &Value) -> Result<Record, BackendError> {
    let name = document
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Parse("document has no name".into()))?;
    let id = name
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BackendError::Parse(format!("bad document name: {name}")))?;

    let create_time = document
        .get("createTime")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));

    Ok(Record {
        id: id.to_string(),
        fields: decode_fields(document.get("fields"))?,
        create_time,
    })
}

fn object_url(bucket: &str, path: &str) -> Result<Url, BackendError> {
    let mut url = Url::parse(&format!("{STORAGE_BASE}/b/{bucket}/o"))
        .map_err(|e| BackendError::Parse(e.to_string()))?;
    // A single segment, so the slashes in `path` are escaped as %2F
    url.path_segments_mut()
        .map_err(|_| BackendError::Parse("storage URL cannot be a base".into()))?
        .push(path);
    Ok(url)
}

fn download_url(bucket: &str, path: &str, token: &str) -> Result<String, BackendError> {
    let mut url = object_url(bucket, path)?;
    url.query_pairs_mut()
        .append_pair("alt", "media")
        .append_pair("token", token);
    Ok(url.to_string())
}

// Request/Response types

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    local_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

impl AccountResponse {
    fn into_session(self, display_name: Option<&str>) -> Session {
        let display_name = display_name
            .map(str::to_string)
            .or(self.display_name)
            .unwrap_or_default();
        Session {
            uid: self.local_id,
            display_name,
            email: self.email,
            credential: Credential {
                id_token: self.id_token,
                refresh_token: self.refresh_token,
                expires_at: expires_at(&self.expires_in),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    name: String,
    #[serde(default)]
    download_tokens: Option<String>,
}

impl ObjectMetadata {
    fn first_token(&self) -> Option<String> {
        self.download_tokens
            .as_deref()
            .and_then(|tokens| tokens.split(',').map(str::trim).find(|t| !t.is_empty()))
            .map(str::to_string)
    }
}

impl From<ObjectMetadata> for AssetHandle {
    fn from(metadata: ObjectMetadata) -> Self {
        let download_token = metadata.first_token();
        Self {
            path: metadata.name,
            download_token,
        }
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::session_for;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend whose token endpoint refuses connections
    fn unreachable_backend() -> FirebaseBackend {
        let config = AppConfig {
            api_key: "k".into(),
            project_id: "p".into(),
            storage_bucket: "b".into(),
            request_timeout: Duration::from_secs(2),
            data_dir: PathBuf::from("."),
        };
        let mut backend = FirebaseBackend::new(&config).unwrap();
        backend.token_base = "http://127.0.0.1:9/v1".into();
        backend
    }

    fn expired_session(uid: &str) -> Session {
        let mut session = session_for(uid);
        session.credential.expires_at = Utc::now() - chrono::Duration::minutes(5);
        session
    }

    fn server(status: u16, message: &str) -> BackendError {
        BackendError::Server {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn google_error_bodies_are_unwrapped() {
        let body = r#"{"error":{"code":400,"message":"EMAIL_EXISTS","errors":[]}}"#;
        assert_eq!(error_from_body(400, body), server(400, "EMAIL_EXISTS"));
        assert_eq!(error_from_body(502, "<html>"), server(502, "Status: 502"));
        assert_eq!(error_from_body(401, ""), BackendError::Unauthenticated);
    }

    #[test]
    fn identity_codes_map_to_auth_errors() {
        assert_eq!(
            auth_error(server(400, "INVALID_LOGIN_CREDENTIALS")),
            AuthError::InvalidCredentials
        );
        assert_eq!(auth_error(server(400, "EMAIL_EXISTS")), AuthError::EmailInUse);
        assert_eq!(
            auth_error(server(
                400,
                "WEAK_PASSWORD : Password should be at least 6 characters"
            )),
            AuthError::WeakPassword("Password should be at least 6 characters".into())
        );
        assert!(matches!(
            auth_error(BackendError::Network("timeout".into())),
            AuthError::Network(_)
        ));
        assert!(matches!(
            auth_error(server(400, "TOO_MANY_ATTEMPTS_TRY_LATER")),
            AuthError::Provider(_)
        ));
    }

    #[test]
    fn revoked_refresh_tokens_are_recognised() {
        assert!(is_revoked(&server(400, "TOKEN_EXPIRED")));
        assert!(is_revoked(&server(400, "USER_NOT_FOUND")));
        assert!(!is_revoked(&server(500, "TOKEN_EXPIRED")));
        assert!(!is_revoked(&BackendError::Network("down".into())));
    }

    #[test]
    fn documents_decode_into_records() {
        let document = json!({
            "name": "projects/p/databases/(default)/documents/cars/abc123",
            "fields": { "name": { "stringValue": "GOL" } },
            "createTime": "2024-05-01T10:00:00.123456Z",
            "updateTime": "2024-05-01T10:00:00.123456Z",
        });
        let record = record_from_document(&document).unwrap();

        assert_eq!(record.id, "abc123");
        assert_eq!(record.fields["name"], json!("GOL"));
        assert_eq!(
            record.create_time.map(|t| t.timestamp()),
            Some(1_714_557_600)
        );
        assert!(record_from_document(&json!({ "fields": {} })).is_err());
    }

    #[test]
    fn owner_query_uses_field_filter() {
        let query = structured_query("cars", &Filter::eq("uid", "u1"));
        let inner = &query["structuredQuery"];

        assert_eq!(inner["from"][0]["collectionId"], json!("cars"));
        assert_eq!(inner["where"]["fieldFilter"]["field"]["fieldPath"], json!("uid"));
        assert_eq!(inner["where"]["fieldFilter"]["op"], json!("EQUAL"));
        assert_eq!(
            inner["where"]["fieldFilter"]["value"],
            json!({ "stringValue": "u1" })
        );

        let all = structured_query("cars", &Filter::All);
        assert!(all["structuredQuery"].get("where").is_none());
    }

    #[test]
    fn object_paths_are_a_single_escaped_segment() {
        let url = download_url("bucket.app", "images/u1/a-1", "tok").unwrap();
        assert_eq!(
            url,
            "https://firebasestorage.googleapis.com/v0/b/bucket.app/o/images%2Fu1%2Fa-1?alt=media&token=tok"
        );
    }

    #[tokio::test]
    async fn offline_restore_keeps_credential_for_later_requests() {
        let backend = unreachable_backend();
        let stored = expired_session("u1");

        let err = backend.restore(stored.clone()).await.unwrap_err();

        assert!(matches!(err, AuthError::Network(_)));
        assert_eq!(backend.current_credential(), Some(stored.credential));
        // Requests retry the refresh instead of going out unauthenticated
        assert!(matches!(backend.bearer().await, Err(BackendError::Network(_))));
    }

    #[tokio::test]
    async fn fresh_credential_is_used_without_refresh() {
        let backend = unreachable_backend();
        let refreshed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&refreshed);
        backend.on_refresh(move |c: &Credential| seen.lock().unwrap().push(c.clone()));
        let stored = session_for("u1");

        let restored = backend.restore(stored.clone()).await.unwrap();

        assert_eq!(restored, Some(stored.clone()));
        assert_eq!(backend.bearer().await.unwrap(), Some(stored.credential.id_token));
        assert!(refreshed.lock().unwrap().is_empty());
    }

    #[test]
    fn upload_metadata_becomes_asset_handle() {
        let metadata = ObjectMetadata {
            name: "images/u1/a".into(),
            download_tokens: Some("t1,t2".into()),
        };
        assert_eq!(
            AssetHandle::from(metadata),
            AssetHandle {
                path: "images/u1/a".into(),
                download_token: Some("t1".into()),
            }
        );
    }

    #[test]
    fn first_download_token_is_used() {
        let metadata = ObjectMetadata {
            name: "images/u1/a".into(),
            download_tokens: Some(" t1 ,t2".into()),
        };
        assert_eq!(metadata.first_token(), Some("t1".to_string()));

        let empty = ObjectMetadata {
            name: "images/u1/a".into(),
            download_tokens: None,
        };
        assert_eq!(empty.first_token(), None);
    }

    #[test]
    fn token_lifetime_defaults_to_an_hour() {
        let soon = expires_at("garbage");
        let delta = soon - Utc::now();
        assert!(delta > chrono::Duration::minutes(59) && delta <= chrono::Duration::hours(1));
    }
}
