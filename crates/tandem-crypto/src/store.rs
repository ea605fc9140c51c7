//! Seams to the device's secure credential store and the shared public-key
//! directory, plus in-memory implementations of both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{CryptoError, Result};

const KEYPAIR_KEY_PREFIX: &str = "tandem_e2ee_keypair_";

/// Secure-store entry name for a user's key pair.
///
/// Credential stores only accept `[A-Za-z0-9._-]`; every other byte
/// becomes `_`.
pub fn storage_key(user_id: &str) -> String {
    let sanitized: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{KEYPAIR_KEY_PREFIX}{sanitized}")
}

/// Device-local secure credential storage (keychain, keystore, ...).
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Read an entry. Errors mean the store itself is unavailable.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Shared directory mapping user ids to hex-encoded public keys.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn fetch_public_key(&self, user_id: &str) -> Result<Option<String>>;

    /// Insert or replace the user's row.
    async fn upsert_public_key(&self, user_id: &str, public_key_hex: &str) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── In-memory secure store ──────────────────────────────────────────────

/// Process-local `SecureStore`. Can be built "unavailable" to model a
/// device without secure storage.
#[derive(Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: bool,
    writes: AtomicUsize,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation fails with `StorageUnavailable`.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Number of successful `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn peek(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    /// Overwrite an entry directly, bypassing the write counter.
    pub fn insert_raw(&self, key: &str, value: &str) {
        lock(&self.entries).insert(key.to_owned(), value.to_owned());
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.unavailable {
            return Err(CryptoError::StorageUnavailable("secure storage not present".into()));
        }
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.unavailable {
            return Err(CryptoError::StorageUnavailable("secure storage not present".into()));
        }
        lock(&self.entries).insert(key.to_owned(), value.to_owned());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── In-memory directory ─────────────────────────────────────────────────

/// Process-local `KeyDirectory`, shared by every participant of a test or
/// a local session.
pub struct MemoryDirectory {
    rows: Mutex<HashMap<String, String>>,
    reachable: AtomicBool,
    fetches: AtomicUsize,
    upserts: AtomicUsize,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
            upserts: AtomicUsize::new(0),
        }
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the directory going offline (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn row(&self, user_id: &str) -> Option<String> {
        lock(&self.rows).get(user_id).cloned()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CryptoError::Directory("directory unreachable".into()))
        }
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn fetch_public_key(&self, user_id: &str) -> Result<Option<String>> {
        self.check_reachable()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.rows).get(user_id).cloned())
    }

    async fn upsert_public_key(&self, user_id: &str, public_key_hex: &str) -> Result<()> {
        self.check_reachable()?;
        lock(&self.rows).insert(user_id.to_owned(), public_key_hex.to_owned());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_sanitizes() {
        assert_eq!(storage_key("user-1.a_b"), "tandem_e2ee_keypair_user-1.a_b");
        assert_eq!(storage_key("a@b.com"), "tandem_e2ee_keypair_a_b.com");
        assert_eq!(storage_key("x/y z"), "tandem_e2ee_keypair_x_y_z");
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemorySecureStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemorySecureStore::unavailable();
        assert!(matches!(store.get("k").await, Err(CryptoError::StorageUnavailable(_))));
        assert!(matches!(store.set("k", "v").await, Err(CryptoError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn directory_upsert_replaces() {
        let dir = MemoryDirectory::new();
        dir.upsert_public_key("alice", "aa").await.unwrap();
        dir.upsert_public_key("alice", "bb").await.unwrap();
        assert_eq!(dir.fetch_public_key("alice").await.unwrap().as_deref(), Some("bb"));
        assert_eq!(dir.upsert_count(), 2);
    }

    #[tokio::test]
    async fn unreachable_directory_errors() {
        let dir = MemoryDirectory::new();
        dir.set_reachable(false);
        assert!(matches!(
            dir.fetch_public_key("alice").await,
            Err(CryptoError::Directory(_))
        ));
        assert!(dir.upsert_public_key("alice", "aa").await.is_err());
    }
}
