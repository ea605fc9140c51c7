//! The key-exchange service: identity keys, peer key cache, and
//! conversation-level encrypt/decrypt.
//!
//! All caches live on the service instance, so independent services (one
//! per signed-in user, or one per test) never share state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::{CryptoError, Result};
use crate::keys::{ConversationKey, LocalKeyPair, PublicKey, StoredKeyPair};
use crate::store::{storage_key, KeyDirectory, SecureStore};

/// How many times `decrypt` re-fetches the peer's key after a failed open.
pub const DECRYPT_REFRESH_RETRIES: usize = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyOptions {
    /// Bypass the peer key cache and re-read the directory.
    pub force_refresh_peer_key: bool,
}

impl KeyOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh_peer_key: true,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct E2eeService {
    store: Arc<dyn SecureStore>,
    directory: Arc<dyn KeyDirectory>,
    /// user_id → key pair cell. Concurrent callers for one user await the same cell.
    local_keys: Mutex<HashMap<String, Arc<OnceCell<LocalKeyPair>>>>,
    /// user_id → publish cell. Set once the upsert succeeded; concurrent
    /// callers wait on the in-flight upsert instead of skipping it.
    published: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    /// peer_id → last public key read from the directory.
    peer_keys: Mutex<HashMap<String, PublicKey>>,
}

impl E2eeService {
    pub fn new(store: Arc<dyn SecureStore>, directory: Arc<dyn KeyDirectory>) -> Self {
        Self {
            store,
            directory,
            local_keys: Mutex::new(HashMap::new()),
            published: Mutex::new(HashMap::new()),
            peer_keys: Mutex::new(HashMap::new()),
        }
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// Return the user's key pair, loading or creating it on first use, and
    /// make sure its public half is in the directory.
    ///
    /// Concurrent calls for the same user share one load/create; at most
    /// one key pair is ever generated per user per process.
    pub async fn ensure_local_key_pair(&self, user_id: &str) -> Result<LocalKeyPair> {
        let cell = {
            let mut keys = lock(&self.local_keys);
            keys.entry(user_id.to_owned()).or_default().clone()
        };
        let pair = cell
            .get_or_try_init(|| self.load_or_create(user_id))
            .await?
            .clone();
        self.publish_once(user_id, &pair).await?;
        Ok(pair)
    }

    /// Hex public key of the local user, creating the key pair if needed.
    pub async fn public_key_hex(&self, user_id: &str) -> Result<String> {
        Ok(self.ensure_local_key_pair(user_id).await?.public_key().to_hex())
    }

    async fn load_or_create(&self, user_id: &str) -> Result<LocalKeyPair> {
        let key = storage_key(user_id);
        let mut storage_ok = true;

        match self.store.get(&key).await {
            Ok(Some(json)) => match parse_stored(&json) {
                Ok(pair) => {
                    info!(user_id, "loaded identity key pair from secure storage");
                    return Ok(pair);
                }
                Err(e) => warn!(user_id, "stored key pair unusable, generating a new one: {e}"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(user_id, "secure storage unavailable, key pair will be memory-only: {e}");
                storage_ok = false;
            }
        }

        let pair = LocalKeyPair::generate()?;
        info!(user_id, public_key = %pair.public_key().to_hex(), "generated identity key pair");

        // Never overwrite an entry we could not read.
        if storage_ok {
            let json = serde_json::to_string(&pair.to_stored())?;
            if let Err(e) = self.store.set(&key, &json).await {
                warn!(user_id, "failed to persist key pair, it will not survive a restart: {e}");
            }
        }
        Ok(pair)
    }

    async fn publish_once(&self, user_id: &str, pair: &LocalKeyPair) -> Result<()> {
        let cell = {
            let mut published = lock(&self.published);
            published.entry(user_id.to_owned()).or_default().clone()
        };
        // A failed upsert leaves the cell empty: the next waiter retries it.
        cell.get_or_try_init(|| async {
            let hex = pair.public_key().to_hex();
            self.directory
                .upsert_public_key(user_id, &hex)
                .await
                .map_err(|e| CryptoError::PublishFailed(e.to_string()))?;
            info!(user_id, "published public key");
            Ok::<(), CryptoError>(())
        })
        .await?;
        Ok(())
    }

    // ── Peers ───────────────────────────────────────────────────────────

    /// The peer's public key, from cache unless `force_refresh` is set.
    pub async fn peer_public_key(&self, peer_id: &str, force_refresh: bool) -> Result<PublicKey> {
        if !force_refresh {
            if let Some(key) = lock(&self.peer_keys).get(peer_id).copied() {
                return Ok(key);
            }
        }

        let row = self.directory.fetch_public_key(peer_id).await?;
        let key = match row.as_deref().map(PublicKey::from_hex) {
            Some(Ok(key)) => key,
            Some(Err(e)) => {
                warn!(peer_id, "directory row is not a valid public key: {e}");
                lock(&self.peer_keys).remove(peer_id);
                return Err(CryptoError::PeerNotReady {
                    peer_id: peer_id.to_owned(),
                });
            }
            None => {
                lock(&self.peer_keys).remove(peer_id);
                return Err(CryptoError::PeerNotReady {
                    peer_id: peer_id.to_owned(),
                });
            }
        };

        if force_refresh {
            debug!(peer_id, "refreshed peer public key");
        }
        lock(&self.peer_keys).insert(peer_id.to_owned(), key);
        Ok(key)
    }

    /// Whether the peer has published a usable key.
    pub async fn has_secure_peer(&self, peer_id: &str) -> bool {
        self.peer_public_key(peer_id, false).await.is_ok()
    }

    pub fn forget_peer(&self, peer_id: &str) {
        lock(&self.peer_keys).remove(peer_id);
    }

    /// Drop every cached key pair, peer key and publish mark (e.g. on sign-out).
    pub fn clear_caches(&self) {
        lock(&self.local_keys).clear();
        lock(&self.published).clear();
        lock(&self.peer_keys).clear();
    }

    // ── Conversation keys ───────────────────────────────────────────────

    /// Derive the symmetric key for `(user_id, peer_id, conversation_id)`.
    /// Recomputed on every call, never stored.
    pub async fn derive_conversation_key(
        &self,
        conversation_id: &str,
        user_id: &str,
        peer_id: &str,
        options: KeyOptions,
    ) -> Result<ConversationKey> {
        let pair = self.ensure_local_key_pair(user_id).await?;
        let peer = self
            .peer_public_key(peer_id, options.force_refresh_peer_key)
            .await?;
        pair.conversation_key(&peer, conversation_id)
    }

    /// Seal `plaintext` into an `e2ee:v1` envelope.
    pub async fn encrypt(
        &self,
        conversation_id: &str,
        user_id: &str,
        peer_id: &str,
        plaintext: &str,
        options: KeyOptions,
    ) -> Result<String> {
        let key = self
            .derive_conversation_key(conversation_id, user_id, peer_id, options)
            .await?;
        Ok(Envelope::seal(&key, plaintext.as_bytes())?.to_string())
    }

    /// Open `body`. Non-envelope bodies come back unchanged.
    ///
    /// A failed open is retried with a refreshed peer key
    /// ([`DECRYPT_REFRESH_RETRIES`] times) to survive silent key rotation.
    pub async fn decrypt(
        &self,
        conversation_id: &str,
        user_id: &str,
        peer_id: &str,
        body: &str,
    ) -> Result<String> {
        let Some(envelope) = Envelope::parse(body) else {
            return Ok(body.to_owned());
        };

        let mut result = self
            .decrypt_once(conversation_id, user_id, peer_id, &envelope)
            .await;
        for attempt in 1..=DECRYPT_REFRESH_RETRIES {
            if !matches!(result, Err(CryptoError::DecryptionFailed)) {
                break;
            }
            debug!(peer_id, attempt, "open failed, retrying with refreshed peer key");
            result = self
                .decrypt_with_forced_refresh(conversation_id, user_id, peer_id, &envelope)
                .await;
        }

        if matches!(result, Err(CryptoError::DecryptionFailed)) {
            warn!(conversation_id, peer_id, "message could not be decrypted");
        }
        String::from_utf8(result?).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// One open attempt with the cached peer key.
    pub async fn decrypt_once(
        &self,
        conversation_id: &str,
        user_id: &str,
        peer_id: &str,
        envelope: &Envelope,
    ) -> Result<Vec<u8>> {
        let key = self
            .derive_conversation_key(conversation_id, user_id, peer_id, KeyOptions::default())
            .await?;
        envelope.open(&key)
    }

    /// One open attempt after re-reading the peer's key from the directory.
    pub async fn decrypt_with_forced_refresh(
        &self,
        conversation_id: &str,
        user_id: &str,
        peer_id: &str,
        envelope: &Envelope,
    ) -> Result<Vec<u8>> {
        let key = self
            .derive_conversation_key(conversation_id, user_id, peer_id, KeyOptions::refresh())
            .await?;
        envelope.open(&key)
    }

    // ── Structured payloads ─────────────────────────────────────────────

    /// Serialize `payload` as JSON and seal it.
    pub async fn encrypt_json<T: Serialize + ?Sized>(
        &self,
        conversation_id: &str,
        user_id: &str,
        peer_id: &str,
        payload: &T,
    ) -> Result<String> {
        let json = serde_json::to_string(payload)?;
        self.encrypt(conversation_id, user_id, peer_id, &json, KeyOptions::default())
            .await
    }

    /// Open `body` (or take it as-is if it is plain JSON) and deserialize it.
    pub async fn decrypt_json<T: DeserializeOwned>(
        &self,
        conversation_id: &str,
        user_id: &str,
        peer_id: &str,
        body: &str,
    ) -> Result<T> {
        let json = self.decrypt(conversation_id, user_id, peer_id, body).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn parse_stored(json: &str) -> Result<LocalKeyPair> {
    let stored: StoredKeyPair = serde_json::from_str(json)?;
    LocalKeyPair::from_stored(&stored)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde::Deserialize;

    use super::*;
    use crate::store::{MemoryDirectory, MemorySecureStore};

    fn service(dir: &Arc<MemoryDirectory>) -> E2eeService {
        E2eeService::new(Arc::new(MemorySecureStore::new()), dir.clone())
    }

    async fn pair_of_users() -> (Arc<MemoryDirectory>, E2eeService, E2eeService) {
        let dir = Arc::new(MemoryDirectory::new());
        let alice = service(&dir);
        let bob = service(&dir);
        alice.ensure_local_key_pair("alice").await.unwrap();
        bob.ensure_local_key_pair("bob").await.unwrap();
        (dir, alice, bob)
    }

    /// Yields on every call so concurrent callers interleave.
    #[derive(Default)]
    struct YieldingStore {
        inner: MemorySecureStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SecureStore for YieldingStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.set(key, value).await
        }
    }

    #[tokio::test]
    async fn roundtrip_between_two_users() {
        let (_dir, alice, bob) = pair_of_users().await;
        let long = "long ".repeat(500);
        for plaintext in ["", "gg", "ünïcødé 🧩", long.as_str()] {
            let sealed = alice
                .encrypt("conv", "alice", "bob", plaintext, KeyOptions::default())
                .await
                .unwrap();
            assert!(sealed.starts_with("e2ee:v1:"));
            let opened = bob.decrypt("conv", "bob", "alice", &sealed).await.unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[tokio::test]
    async fn same_plaintext_gives_different_envelopes() {
        let (_dir, alice, bob) = pair_of_users().await;
        let a = alice
            .encrypt("conv", "alice", "bob", "same", KeyOptions::default())
            .await
            .unwrap();
        let b = alice
            .encrypt("conv", "alice", "bob", "same", KeyOptions::default())
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(bob.decrypt("conv", "bob", "alice", &a).await.unwrap(), "same");
        assert_eq!(bob.decrypt("conv", "bob", "alice", &b).await.unwrap(), "same");
    }

    #[tokio::test]
    async fn plaintext_passes_through() {
        let (dir, _alice, bob) = pair_of_users().await;
        let fetches = dir.fetch_count();
        for body in ["hello", "e2ee:v1:nothex:00", "e2ee:v2:00:11", "a:b:c:d"] {
            assert_eq!(bob.decrypt("conv", "bob", "alice", body).await.unwrap(), body);
        }
        // Passthrough never touches the directory.
        assert_eq!(dir.fetch_count(), fetches);
    }

    #[tokio::test]
    async fn other_conversation_cannot_open() {
        let (_dir, alice, bob) = pair_of_users().await;
        let sealed = alice
            .encrypt("dm", "alice", "bob", "hi", KeyOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            bob.decrypt("match-1", "bob", "alice", &sealed).await,
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn failed_open_refreshes_exactly_once() {
        let (dir, alice, bob) = pair_of_users().await;
        let mut sealed = alice
            .encrypt("conv", "alice", "bob", "hi", KeyOptions::default())
            .await
            .unwrap();
        // Corrupt the last hex digit of the ciphertext.
        let last = sealed.pop().unwrap();
        sealed.push(if last == '0' { '1' } else { '0' });

        bob.peer_public_key("alice", false).await.unwrap();
        let before = dir.fetch_count();
        assert!(matches!(
            bob.decrypt("conv", "bob", "alice", &sealed).await,
            Err(CryptoError::DecryptionFailed)
        ));
        assert_eq!(dir.fetch_count() - before, DECRYPT_REFRESH_RETRIES);
    }

    #[tokio::test]
    async fn tolerates_peer_key_rotation() {
        let (dir, alice, bob) = pair_of_users().await;

        // Bob caches Alice's first key.
        let first = alice
            .encrypt("conv", "alice", "bob", "before", KeyOptions::default())
            .await
            .unwrap();
        assert_eq!(bob.decrypt("conv", "bob", "alice", &first).await.unwrap(), "before");

        // Alice reinstalls: new device storage, new key pair, republished.
        let alice_again = service(&dir);
        alice_again.ensure_local_key_pair("alice").await.unwrap();
        let rotated = alice_again
            .encrypt("conv", "alice", "bob", "after", KeyOptions::default())
            .await
            .unwrap();

        let envelope = Envelope::parse(&rotated).unwrap();
        assert!(matches!(
            bob.decrypt_once("conv", "bob", "alice", &envelope).await,
            Err(CryptoError::DecryptionFailed)
        ));
        assert_eq!(bob.decrypt("conv", "bob", "alice", &rotated).await.unwrap(), "after");
    }

    #[tokio::test]
    async fn missing_peer_is_not_ready() {
        let dir = Arc::new(MemoryDirectory::new());
        let alice = service(&dir);
        let err = alice
            .encrypt("conv", "alice", "ghost", "hi", KeyOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_peer_not_ready());
        assert!(!alice.has_secure_peer("ghost").await);
    }

    #[tokio::test]
    async fn malformed_directory_row_is_not_ready() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.upsert_public_key("bob", "not-a-key").await.unwrap();
        let alice = service(&dir);
        assert!(alice.peer_public_key("bob", false).await.unwrap_err().is_peer_not_ready());
    }

    #[tokio::test]
    async fn sequential_calls_return_same_pair() {
        let dir = Arc::new(MemoryDirectory::new());
        let store = Arc::new(MemorySecureStore::new());
        let svc = E2eeService::new(store.clone(), dir.clone());

        let a = svc.ensure_local_key_pair("alice").await.unwrap();
        let b = svc.ensure_local_key_pair("alice").await.unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(*a.secret_bytes(), *b.secret_bytes());
        assert_eq!(store.write_count(), 1);
        assert_eq!(dir.upsert_count(), 1);
        assert_eq!(dir.row("alice").unwrap(), a.public_key().to_hex());
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_creation() {
        let dir = Arc::new(MemoryDirectory::new());
        let store = Arc::new(YieldingStore::default());
        let svc = Arc::new(E2eeService::new(store.clone(), dir.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.ensure_local_key_pair("alice").await })
            })
            .collect();

        let mut publics = Vec::new();
        for handle in handles {
            publics.push(handle.await.unwrap().unwrap().public_key());
        }
        assert!(publics.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.inner.write_count(), 1);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(dir.upsert_count(), 1);
    }

    #[tokio::test]
    async fn restart_loads_persisted_pair() {
        let dir = Arc::new(MemoryDirectory::new());
        let store = Arc::new(MemorySecureStore::new());

        let first = E2eeService::new(store.clone(), dir.clone())
            .ensure_local_key_pair("alice")
            .await
            .unwrap();
        let second = E2eeService::new(store.clone(), dir.clone())
            .ensure_local_key_pair("alice")
            .await
            .unwrap();
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(store.write_count(), 1);
        // Republished once per process, which is an idempotent upsert.
        assert_eq!(dir.upsert_count(), 2);
    }

    #[tokio::test]
    async fn corrupt_stored_pair_is_replaced() {
        let dir = Arc::new(MemoryDirectory::new());
        let store = Arc::new(MemorySecureStore::new());
        store.insert_raw(&storage_key("alice"), r#"{"secretKey":"00","publicKey":"11"}"#);

        let svc = E2eeService::new(store.clone(), dir.clone());
        let pair = svc.ensure_local_key_pair("alice").await.unwrap();
        let stored: StoredKeyPair =
            serde_json::from_str(&store.peek(&storage_key("alice")).unwrap()).unwrap();
        assert_eq!(stored.public_key, pair.public_key().to_hex());
    }

    #[tokio::test]
    async fn unavailable_storage_degrades_to_memory() {
        let dir = Arc::new(MemoryDirectory::new());
        let svc = E2eeService::new(Arc::new(MemorySecureStore::unavailable()), dir.clone());

        let a = svc.ensure_local_key_pair("alice").await.unwrap();
        let b = svc.ensure_local_key_pair("alice").await.unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(dir.row("alice").unwrap(), a.public_key().to_hex());
    }

    /// Upserts take a while and fail until `recover()` is called.
    #[derive(Default)]
    struct SlowFailingDirectory {
        inner: MemoryDirectory,
        healthy: std::sync::atomic::AtomicBool,
        upserts: AtomicUsize,
    }

    impl SlowFailingDirectory {
        fn recover(&self) {
            self.healthy.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KeyDirectory for SlowFailingDirectory {
        async fn fetch_public_key(&self, user_id: &str) -> Result<Option<String>> {
            self.inner.fetch_public_key(user_id).await
        }

        async fn upsert_public_key(&self, user_id: &str, public_key_hex: &str) -> Result<()> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(CryptoError::Directory("directory offline".into()));
            }
            self.inner.upsert_public_key(user_id, public_key_hex).await
        }
    }

    #[tokio::test]
    async fn overlapping_callers_never_see_unpublished_key() {
        let dir = Arc::new(SlowFailingDirectory::default());
        let svc = Arc::new(E2eeService::new(Arc::new(MemorySecureStore::new()), dir.clone()));

        let first = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.ensure_local_key_pair("alice").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = svc.ensure_local_key_pair("alice").await;
        let first = first.await.unwrap();

        assert!(matches!(first, Err(CryptoError::PublishFailed(_))));
        assert!(matches!(second, Err(CryptoError::PublishFailed(_))));
        assert_eq!(dir.inner.row("alice"), None);

        dir.recover();
        let pair = svc.ensure_local_key_pair("alice").await.unwrap();
        assert_eq!(dir.inner.row("alice").unwrap(), pair.public_key().to_hex());
        let upserts = dir.upserts.load(Ordering::SeqCst);

        // Published now: later calls do not touch the directory.
        svc.ensure_local_key_pair("alice").await.unwrap();
        assert_eq!(dir.upserts.load(Ordering::SeqCst), upserts);
    }

    #[tokio::test]
    async fn publish_failure_is_hard_error_and_retried() {
        let dir = Arc::new(MemoryDirectory::new());
        let store = Arc::new(MemorySecureStore::new());
        let svc = E2eeService::new(store.clone(), dir.clone());

        dir.set_reachable(false);
        assert!(matches!(
            svc.ensure_local_key_pair("alice").await,
            Err(CryptoError::PublishFailed(_))
        ));

        dir.set_reachable(true);
        let pair = svc.ensure_local_key_pair("alice").await.unwrap();
        assert_eq!(dir.row("alice").unwrap(), pair.public_key().to_hex());
        // The key pair generated before the failure is the one that got published.
        assert_eq!(store.write_count(), 1);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        sdp: String,
        index: u32,
    }

    #[tokio::test]
    async fn json_payload_roundtrip() {
        let (_dir, alice, bob) = pair_of_users().await;
        let payload = Payload {
            sdp: "v=0".into(),
            index: 3,
        };
        let sealed = alice.encrypt_json("call", "alice", "bob", &payload).await.unwrap();
        let opened: Payload = bob.decrypt_json("call", "bob", "alice", &sealed).await.unwrap();
        assert_eq!(opened, payload);
    }

    #[tokio::test]
    async fn json_shape_error_is_serialization_not_crypto() {
        let (_dir, alice, bob) = pair_of_users().await;
        let sealed = alice
            .encrypt("call", "alice", "bob", "{\"unexpected\":true}", KeyOptions::default())
            .await
            .unwrap();
        let err = bob
            .decrypt_json::<Payload>("call", "bob", "alice", &sealed)
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::Serialization(_)));
    }

    #[tokio::test]
    async fn clear_caches_forgets_peers() {
        let (dir, _alice, bob) = pair_of_users().await;
        bob.peer_public_key("alice", false).await.unwrap();
        let before = dir.fetch_count();
        bob.peer_public_key("alice", false).await.unwrap();
        assert_eq!(dir.fetch_count(), before);

        bob.clear_caches();
        bob.peer_public_key("alice", false).await.unwrap();
        assert_eq!(dir.fetch_count(), before + 1);
    }
}
