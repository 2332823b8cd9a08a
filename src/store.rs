// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Token storage.
//!
//! [`TokenStore`] abstracts the platform's secure storage.  Two
//! implementations ship with the crate: [`MemoryTokenStore`] keeps records
//! in process memory, and [`EncryptedTokenStore`] seals every record with
//! ChaCha20-Poly1305 before handing it to a raw [`BlobStore`], binding the
//! ciphertext to the identity key.
//!
//! [`IdentityLocks`] serializes access per identity, so a de-registration
//! can never race a proof construction for the same identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Error, Result};
use crate::identity::{Identity, IdentityKey};
use crate::keys::DeviceSecretKey;
use crate::secret::Token;

/// Domain prefix of the associated data bound into sealed records.
const RECORD_AAD_DOMAIN: &[u8] = b"pinproof:token-record:v1:";

const NONCE_LENGTH: usize = 12;

/// A registered identity as kept on the device.
#[derive(Clone)]
pub struct Registration {
    /// The registered identity.
    pub identity: Identity,
    /// The PIN-stripped secret.
    pub token: Token,
    /// Device secret of a device-bound registration.
    pub device_secret: Option<DeviceSecretKey>,
    /// Number of digits of the registered PIN.
    pub pin_length: usize,
    /// Authorities whose shares make up the client secret.
    pub issuers: Vec<String>,
    /// Set once the verifier reports the identity revoked.
    pub revoked: bool,
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("identity", &self.identity)
            .field("pin_length", &self.pin_length)
            .field("issuers", &self.issuers)
            .field("revoked", &self.revoked)
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Store key of this registration.
    pub fn key(&self) -> IdentityKey {
        self.identity.key()
    }

    /// Fail with `RevokedIdentity` once the record is marked revoked.
    pub fn ensure_active(&self) -> Result<()> {
        if self.revoked {
            return Err(Error::RevokedIdentity);
        }
        Ok(())
    }
}

/// Serialized form of a [`Registration`], wiped after use.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct RegistrationRecord {
    #[zeroize(skip)]
    identity: Identity,
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_secret: Option<String>,
    pin_length: usize,
    issuers: Vec<String>,
    revoked: bool,
}

impl RegistrationRecord {
    fn from_registration(reg: &Registration) -> RegistrationRecord {
        RegistrationRecord {
            identity: reg.identity.clone(),
            token: hex::encode(reg.token.to_bytes()),
            device_secret: reg.device_secret.as_ref().map(|k| hex::encode(k.to_bytes())),
            pin_length: reg.pin_length,
            issuers: reg.issuers.clone(),
            revoked: reg.revoked,
        }
    }

    fn to_registration(&self) -> Result<Registration> {
        let mut token_bytes = hex::decode(&self.token)?;
        let token = Token::from_bytes(&token_bytes);
        token_bytes.zeroize();
        let device_secret = match &self.device_secret {
            Some(k) => {
                let mut bytes = hex::decode(k)?;
                let key = DeviceSecretKey::from_bytes(&bytes);
                bytes.zeroize();
                Some(key?)
            }
            None => None,
        };
        Ok(Registration {
            identity: self.identity.clone(),
            token: token?,
            device_secret,
            pin_length: self.pin_length,
            issuers: self.issuers.clone(),
            revoked: self.revoked,
        })
    }
}

/// Persistent storage of registrations.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the registration of `key`, if any.
    async fn load(&self, key: &IdentityKey) -> Result<Option<Registration>>;

    /// Insert or replace a registration.
    async fn save(&self, registration: &Registration) -> Result<()>;

    /// Destroy the registration of `key`.  Removing a missing key is not an
    /// error.
    async fn delete(&self, key: &IdentityKey) -> Result<()>;

    /// Keys of every stored registration.
    async fn keys(&self) -> Result<Vec<IdentityKey>>;

    /// Mark the registration of `key` revoked.
    async fn mark_revoked(&self, key: &IdentityKey) -> Result<()> {
        match self.load(key).await? {
            Some(mut reg) => {
                reg.revoked = true;
                self.save(&reg).await
            }
            None => Err(Error::UnknownIdentity(key.to_string())),
        }
    }
}

/// Registrations held in process memory.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: RwLock<HashMap<IdentityKey, Registration>>,
}

impl MemoryTokenStore {
    /// An empty store.
    pub fn new() -> MemoryTokenStore {
        MemoryTokenStore::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, key: &IdentityKey) -> Result<Option<Registration>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save(&self, registration: &Registration) -> Result<()> {
        self.records.write().await.insert(registration.key(), registration.clone());
        Ok(())
    }

    async fn delete(&self, key: &IdentityKey) -> Result<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<IdentityKey>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }
}

/// Raw byte storage beneath an [`EncryptedTokenStore`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the blob under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write the blob under `key`.
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<()>;

    /// Remove the blob under `key`.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Every key present.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Blobs held in process memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// An empty blob store.
    pub fn new() -> MemoryBlobStore {
        MemoryBlobStore::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(key.to_owned(), blob);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}

/// 32 byte key sealing stored records.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoreKey([u8; 32]);

impl core::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "StoreKey(..)")
    }
}

impl StoreKey {
    /// Wrap key bytes provisioned by the platform keystore.
    pub fn from_bytes(bytes: [u8; 32]) -> StoreKey {
        StoreKey(bytes)
    }

    /// A fresh random key.
    pub fn generate() -> StoreKey {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        StoreKey(bytes)
    }
}

/// Registrations sealed with ChaCha20-Poly1305 over a [`BlobStore`].
///
/// Blob layout: `nonce (12) ‖ ciphertext ‖ tag (16)`, with associated data
/// binding the blob to its identity key.
pub struct EncryptedTokenStore<B> {
    key: StoreKey,
    blobs: B,
}

impl<B: BlobStore> EncryptedTokenStore<B> {
    /// Seal records with `key` into `blobs`.
    pub fn new(key: StoreKey, blobs: B) -> EncryptedTokenStore<B> {
        EncryptedTokenStore { key, blobs }
    }

    /// The underlying blob store.
    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key.0))
    }

    fn aad(key: &IdentityKey) -> Vec<u8> {
        let mut aad = Vec::with_capacity(RECORD_AAD_DOMAIN.len() + key.as_str().len());
        aad.extend_from_slice(RECORD_AAD_DOMAIN);
        aad.extend_from_slice(key.as_str().as_bytes());
        aad
    }

    fn seal(&self, key: &IdentityKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let aad = Self::aad(key);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|e| Error::Storage(format!("seal failed: {}", e)))?;
        let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open(&self, key: &IdentityKey, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LENGTH {
            return Err(Error::Storage("sealed record too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LENGTH);
        let aad = Self::aad(key);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| Error::Storage(format!("cannot unseal record of {}", key)))
    }
}

#[async_trait]
impl<B: BlobStore> TokenStore for EncryptedTokenStore<B> {
    async fn load(&self, key: &IdentityKey) -> Result<Option<Registration>> {
        let blob = match self.blobs.get(key.as_str()).await? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        let mut plaintext = self.open(key, &blob)?;
        let record: core::result::Result<RegistrationRecord, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        let record = record.map_err(|e| Error::Storage(e.to_string()))?;
        record.to_registration().map(Some)
    }

    async fn save(&self, registration: &Registration) -> Result<()> {
        let key = registration.key();
        let record = RegistrationRecord::from_registration(registration);
        let mut plaintext = serde_json::to_vec(&record).map_err(|e| Error::Storage(e.to_string()))?;
        let sealed = self.seal(&key, &plaintext);
        plaintext.zeroize();
        self.blobs.put(key.as_str(), sealed?).await?;
        debug!(identity = %key, "sealed registration stored");
        Ok(())
    }

    async fn delete(&self, key: &IdentityKey) -> Result<()> {
        self.blobs.remove(key.as_str()).await
    }

    async fn keys(&self) -> Result<Vec<IdentityKey>> {
        Ok(self.blobs.list().await?.into_iter().map(IdentityKey).collect())
    }
}

/// Per-identity mutual exclusion.
#[derive(Default)]
pub struct IdentityLocks {
    locks: Arc<StdMutex<LockMap>>,
}

type LockMap = HashMap<IdentityKey, Arc<Mutex<()>>>;

fn lock_map(map: &StdMutex<LockMap>) -> MutexGuard<'_, LockMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while one identity's token is in use; released on drop.
///
/// The last guard of an identity with nobody waiting removes the
/// identity's entry.
#[derive(Debug)]
pub struct IdentityGuard {
    key: IdentityKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<LockMap>>,
}

impl IdentityGuard {
    /// The locked identity.
    pub fn key(&self) -> &IdentityKey {
        &self.key
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        if locks.get(&self.key).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl IdentityLocks {
    /// No identity locked.
    pub fn new() -> IdentityLocks {
        IdentityLocks::default()
    }

    /// Wait for exclusive use of `key`.
    pub async fn lock(&self, key: &IdentityKey) -> IdentityGuard {
        let lock = lock_map(&self.locks).entry(key.clone()).or_default().clone();
        IdentityGuard { key: key.clone(), guard: Some(lock.lock_owned().await), locks: self.locks.clone() }
    }

    /// Number of identities currently locked or awaited.
    pub fn tracked(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keys::DeviceKeypair;
    use crate::pairing::{Bls12Context, PairingContext};
    use crate::secret::{combine_shares, Pin, SecretShare};
    use crate::pairing::hex_codec;
    use std::time::Duration;

    fn registration(user: &str, bound: bool) -> Registration {
        let ctx = Bls12Context::new();
        let device = DeviceKeypair::generate(rand::thread_rng());
        let mut identity = Identity::new(user, "proj").unwrap();
        if bound {
            identity = identity.with_device_key(device.public);
        }
        let point = ctx.hash_to_g1(b"test", user.as_bytes()).unwrap();
        let share = SecretShare::from_hex(&hex_codec::g1(&point), "issuer").unwrap();
        let cs = combine_shares(&[share]).unwrap();
        let device_secret = if bound { Some(device.secret.clone()) } else { None };
        let pin = Pin::new("1234").unwrap();
        let token = Token::from_client_secret(&ctx, &identity, &cs, &pin, device_secret.as_ref()).unwrap();
        Registration { identity, token, device_secret, pin_length: 4, issuers: vec!["issuer".into()], revoked: false }
    }

    #[tokio::test]
    async fn memory_store_round_trip_and_revocation() {
        let store = MemoryTokenStore::new();
        let reg = registration("alice@example.com", false);
        store.save(&reg).await.unwrap();
        let loaded = store.load(&reg.key()).await.unwrap().unwrap();
        assert_eq!(loaded.token, reg.token);
        assert!(loaded.ensure_active().is_ok());

        store.mark_revoked(&reg.key()).await.unwrap();
        let loaded = store.load(&reg.key()).await.unwrap().unwrap();
        assert_eq!(loaded.ensure_active().unwrap_err(), Error::RevokedIdentity);

        store.delete(&reg.key()).await.unwrap();
        assert!(store.load(&reg.key()).await.unwrap().is_none());
        assert!(matches!(store.mark_revoked(&reg.key()).await, Err(Error::UnknownIdentity(_))));
    }

    #[tokio::test]
    async fn encrypted_store_never_holds_plain_tokens() {
        let store = EncryptedTokenStore::new(StoreKey::generate(), MemoryBlobStore::new());
        let reg = registration("alice@example.com", true);
        store.save(&reg).await.unwrap();

        let blob = store.blobs().get(reg.key().as_str()).await.unwrap().unwrap();
        let token_hex = hex::encode(reg.token.to_bytes());
        assert!(!blob.windows(token_hex.len()).any(|w| w == token_hex.as_bytes()));
        assert!(!blob.windows(48).any(|w| w == reg.token.to_bytes()));

        let loaded = store.load(&reg.key()).await.unwrap().unwrap();
        assert_eq!(loaded.token, reg.token);
        assert_eq!(loaded.device_secret, reg.device_secret);
        assert_eq!(loaded.identity, reg.identity);
        assert_eq!(store.keys().await.unwrap(), vec![reg.key()]);
    }

    #[tokio::test]
    async fn sealed_records_are_bound_to_their_identity() {
        let store = EncryptedTokenStore::new(StoreKey::generate(), MemoryBlobStore::new());
        let alice = registration("alice@example.com", false);
        store.save(&alice).await.unwrap();
        let blob = store.blobs().get(alice.key().as_str()).await.unwrap().unwrap();

        let bob = Identity::new("bob@example.com", "proj").unwrap().key();
        store.blobs().put(bob.as_str(), blob).await.unwrap();
        assert!(matches!(store.load(&bob).await, Err(Error::Storage(_))));

        let other = EncryptedTokenStore::new(StoreKey::generate(), MemoryBlobStore::new());
        let blob = store.blobs().get(alice.key().as_str()).await.unwrap().unwrap();
        other.blobs().put(alice.key().as_str(), blob).await.unwrap();
        assert!(matches!(other.load(&alice.key()).await, Err(Error::Storage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn identity_locks_serialize_one_identity() {
        let locks = Arc::new(IdentityLocks::new());
        let alice = Identity::new("alice@example.com", "proj").unwrap().key();
        let bob = Identity::new("bob@example.com", "proj").unwrap().key();

        let guard = locks.lock(&alice).await;
        assert_eq!(guard.key(), &alice);
        let _other = locks.lock(&bob).await;

        let waiting = {
            let locks = locks.clone();
            let alice = alice.clone();
            tokio::spawn(async move { locks.lock(&alice).await.key().clone() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        drop(guard);
        assert_eq!(waiting.await.unwrap(), alice);
    }

    #[tokio::test]
    async fn released_identities_are_forgotten() {
        let locks = IdentityLocks::new();
        let alice = Identity::new("alice@example.com", "proj").unwrap().key();
        let bob = Identity::new("bob@example.com", "proj").unwrap().key();

        let a = locks.lock(&alice).await;
        let b = locks.lock(&bob).await;
        assert_eq!(locks.tracked(), 2);
        drop(a);
        assert_eq!(locks.tracked(), 1);
        drop(b);
        assert_eq!(locks.tracked(), 0);

        drop(locks.lock(&alice).await);
        assert_eq!(locks.tracked(), 0);
    }
}
