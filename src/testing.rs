//! In-memory stand-ins for the hosted services, used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use crate::assets::SelectedFile;
use crate::auth::{AuthError, Credential, Session};
use crate::backend::{
    AssetHandle, AuthProvider, BackendError, DocumentStore, Fields, Filter, ObjectStorage, Record,
};
use crate::validation::ListingDraft;

pub fn session_for(uid: &str) -> Session {
    Session {
        uid: uid.to_string(),
        display_name: format!("User {uid}"),
        email: format!("{uid}@example.com"),
        credential: Credential {
            id_token: format!("id-token-{uid}"),
            refresh_token: format!("refresh-token-{uid}"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        },
    }
}

pub fn selected_file(name: &str, media_type: &str) -> SelectedFile {
    SelectedFile {
        file_name: name.to_string(),
        media_type: media_type.to_string(),
        bytes: vec![0xFF, 0xD8, 0xFF, 0x00],
    }
}

pub fn valid_draft() -> ListingDraft {
    ListingDraft {
        name: "Audi RS3".into(),
        model: "RS3 Sportback".into(),
        year: "2019".into(),
        km: "10.000".into(),
        price: "159.999,99".into(),
        city: "Curitiba - PR".into(),
        description: "Único dono".into(),
        whatsapp: "41999998888".into(),
    }
}

fn offline() -> BackendError {
    BackendError::Network("connection refused".into())
}

#[derive(Default)]
pub struct FakeAuthProvider {
    // email -> (password, uid, display name)
    accounts: Mutex<HashMap<String, (String, String, String)>>,
    revoked: Mutex<HashSet<String>>,
    offline: AtomicBool,
}

impl FakeAuthProvider {
    pub fn add_account(&self, email: &str, password: &str, uid: &str, name: &str) {
        self.accounts.lock().unwrap().insert(
            email.to_string(),
            (password.to_string(), uid.to_string(), name.to_string()),
        );
    }

    pub fn revoke(&self, uid: &str) {
        self.revoked.lock().unwrap().insert(uid.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), AuthError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(offline().into());
        }
        Ok(())
    }

    fn session(uid: &str, name: &str, email: &str) -> Session {
        Session {
            display_name: name.to_string(),
            email: email.to_string(),
            ..session_for(uid)
        }
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.check_online()?;
        let accounts = self.accounts.lock().unwrap();
        match accounts.get(email) {
            Some((stored, uid, name)) if stored == password => Ok(Self::session(uid, name, email)),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Session, AuthError> {
        self.check_online()?;
        if password.len() < 6 {
            return Err(AuthError::WeakPassword("too short".into()));
        }
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.contains_key(email) {
            return Err(AuthError::EmailInUse);
        }
        let uid = format!("uid-{}", accounts.len() + 1);
        accounts.insert(
            email.to_string(),
            (password.to_string(), uid.clone(), display_name.to_string()),
        );
        Ok(Self::session(&uid, display_name, email))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.check_online()
    }

    async fn restore(&self, stored: Session) -> Result<Option<Session>, AuthError> {
        self.check_online()?;
        if self.revoked.lock().unwrap().contains(&stored.uid) {
            return Ok(None);
        }
        Ok(Some(stored))
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    records: Mutex<Vec<(String, Record)>>,
    next_id: AtomicUsize,
    pub fail_writes: AtomicBool,
    pub fail_reads: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub create_calls: Mutex<Vec<Fields>>,
}

impl MemoryDocumentStore {
    /// Insert a raw document, bypassing `create`
    pub fn seed(&self, collection: &str, id: &str, fields: Fields) {
        self.records.lock().unwrap().push((
            collection.to_string(),
            Record {
                id: id.to_string(),
                fields,
                create_time: Some(Utc::now()),
            },
        ));
    }

    pub fn len(&self, collection: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == collection)
            .count()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Record, BackendError> {
        self.create_calls.lock().unwrap().push(fields.clone());
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(offline());
        }
        let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let record = Record {
            id,
            fields,
            create_time: Some(Utc::now()),
        };
        self.records
            .lock()
            .unwrap()
            .push((collection.to_string(), record.clone()));
        Ok(record)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, BackendError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(offline());
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|(c, r)| c == collection && r.id == id)
            .map(|(_, r)| r.clone()))
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, BackendError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(offline());
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, r)| c == collection && filter.matches(&r.fields))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(offline());
        }
        self.records
            .lock()
            .unwrap()
            .retain(|(c, r)| !(c == collection && r.id == id));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    pub fail_puts: AtomicBool,
    pub fail_resolve: AtomicBool,
    failing_deletes: Mutex<HashSet<String>>,
    pub delete_attempts: Mutex<Vec<String>>,
    // content type -> signal that releases a pending upload
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl MemoryObjectStorage {
    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn fail_delete_of(&self, path: &str) {
        self.failing_deletes.lock().unwrap().insert(path.to_string());
    }

    /// Hold uploads of `content_type` until the returned sender fires
    pub fn gate(&self, content_type: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates
            .lock()
            .unwrap()
            .insert(content_type.to_string(), rx);
        tx
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<AssetHandle, BackendError> {
        let gate = self.gates.lock().unwrap().remove(content_type);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(offline());
        }
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(AssetHandle {
            path: path.to_string(),
            download_token: Some(format!("token-{path}")),
        })
    }

    async fn resolve_url(&self, handle: &AssetHandle) -> Result<String, BackendError> {
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(offline());
        }
        let token = handle.download_token.clone().unwrap_or_default();
        Ok(format!("https://storage.test/{}?token={}", handle.path, token))
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.delete_attempts.lock().unwrap().push(path.to_string());
        if self.failing_deletes.lock().unwrap().contains(path) {
            return Err(offline());
        }
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }
}
