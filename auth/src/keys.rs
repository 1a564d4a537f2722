//! Secret & key store: signing keys, sealing keys, password peppers.
//!
//! Three keysets, each an ordered list of versions with exactly one primary
//! (used for new operations) and zero or more retired versions (accepted for
//! verification only). Rotation swaps an immutable snapshot behind an
//! `RwLock`, so hot readers never block on a rotate or reload.
//!
//! Key material lives only in process memory. `Debug` output is redacted and
//! none of the key types implement `Serialize`.

use crate::error::{AuthError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Version number of a key inside a keyset.
pub type KeyVersion = u32;

/// AES-256-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// Minimum secret length for token-signing keys.
const MIN_SIGNING_KEY_LEN: usize = 32;
/// Exact key length for AES-256-GCM sealing keys.
const SEALING_KEY_LEN: usize = 32;

/// An ordered keyset: index 0 is the primary, the rest are retired.
#[derive(Clone)]
struct Keyset {
    versions: Vec<(KeyVersion, Vec<u8>)>,
}

impl Keyset {
    fn new(versions: Vec<(KeyVersion, Vec<u8>)>, name: &str, min_len: usize) -> Result<Self> {
        if versions.is_empty() {
            return Err(AuthError::InvalidInput(format!("{name} keyset cannot be empty")));
        }
        let mut seen = std::collections::HashSet::new();
        for (version, material) in &versions {
            if !seen.insert(*version) {
                return Err(AuthError::InvalidInput(format!(
                    "{name} keyset has duplicate version {version}"
                )));
            }
            if material.len() < min_len {
                return Err(AuthError::InvalidInput(format!(
                    "{name} key version {version} shorter than {min_len} bytes"
                )));
            }
        }
        Ok(Self { versions })
    }

    fn primary(&self) -> (KeyVersion, &[u8]) {
        let (version, material) = &self.versions[0];
        (*version, material)
    }

    fn get(&self, version: KeyVersion) -> Option<&[u8]> {
        self.versions
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, material)| material.as_slice())
    }

    fn active_versions(&self) -> Vec<KeyVersion> {
        self.versions.iter().map(|(v, _)| *v).collect()
    }

    fn rotate(&mut self, version: KeyVersion, material: Vec<u8>) -> Result<()> {
        if self.get(version).is_some() {
            return Err(AuthError::InvalidInput(format!(
                "key version {version} already present"
            )));
        }
        self.versions.insert(0, (version, material));
        Ok(())
    }

    fn retire(&mut self, version: KeyVersion) -> Result<()> {
        if self.primary().0 == version {
            return Err(AuthError::InvalidInput(
                "cannot retire the primary key version".into(),
            ));
        }
        let before = self.versions.len();
        self.versions.retain(|(v, _)| *v != version);
        if self.versions.len() == before {
            return Err(AuthError::InvalidInput(format!("key version {version} not found")));
        }
        Ok(())
    }
}

/// Immutable snapshot of all three keysets.
#[derive(Clone)]
struct KeyMaterial {
    signing: Keyset,
    sealing: Keyset,
    peppers: Keyset,
}

/// Startup / reload configuration. Index 0 of each list is the primary.
#[derive(Clone)]
pub struct KeyStoreConfig {
    /// Token-signing secrets (≥ 32 bytes each).
    pub signing_keys: Vec<(KeyVersion, Vec<u8>)>,
    /// AES-256-GCM sealing keys (exactly 32 bytes each).
    pub sealing_keys: Vec<(KeyVersion, Vec<u8>)>,
    /// Password peppers.
    pub pepper_versions: Vec<(KeyVersion, Vec<u8>)>,
}

impl std::fmt::Debug for KeyStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStoreConfig")
            .field("signing_keys", &self.signing_keys.len())
            .field("sealing_keys", &self.sealing_keys.len())
            .field("pepper_versions", &self.pepper_versions.len())
            .finish()
    }
}

impl KeyStoreConfig {
    /// Generate a single-version config with random material. For tests and
    /// first-boot provisioning.
    #[must_use]
    pub fn generate() -> Self {
        let mut signing = vec![0u8; 64];
        let mut sealing = vec![0u8; SEALING_KEY_LEN];
        let mut pepper = vec![0u8; 32];
        OsRng.fill_bytes(&mut signing);
        OsRng.fill_bytes(&mut sealing);
        OsRng.fill_bytes(&mut pepper);
        Self {
            signing_keys: vec![(1, signing)],
            sealing_keys: vec![(1, sealing)],
            pepper_versions: vec![(1, pepper)],
        }
    }
}

/// A secret sealed with a versioned AES-256-GCM key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Sealing key version used.
    pub key_version: KeyVersion,
    /// Random 96-bit nonce.
    pub nonce: Vec<u8>,
    /// Ciphertext + tag.
    pub ciphertext: Vec<u8>,
}

/// Process-wide key store.
///
/// Read-mostly: every operation reads an immutable `Arc` snapshot; rotation
/// and reload swap the snapshot atomically.
pub struct KeyStore {
    material: RwLock<Arc<KeyMaterial>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Load keysets from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] on empty keysets, duplicate
    /// versions, or undersized key material.
    pub fn from_config(config: KeyStoreConfig) -> Result<Self> {
        let material = Self::build_material(config)?;
        Ok(Self {
            material: RwLock::new(Arc::new(material)),
        })
    }

    fn build_material(config: KeyStoreConfig) -> Result<KeyMaterial> {
        Ok(KeyMaterial {
            signing: Keyset::new(config.signing_keys, "signing", MIN_SIGNING_KEY_LEN)?,
            sealing: Keyset::new(config.sealing_keys, "sealing", SEALING_KEY_LEN)?,
            peppers: Keyset::new(config.pepper_versions, "pepper", 1)?,
        })
    }

    fn snapshot(&self) -> Arc<KeyMaterial> {
        // Lock poisoning cannot happen: no panics occur under this lock.
        match self.material.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, material: KeyMaterial) {
        let material = Arc::new(material);
        match self.material.write() {
            Ok(mut guard) => *guard = material,
            Err(poisoned) => *poisoned.into_inner() = material,
        }
    }

    /// Operator-triggered reload: replace every keyset from fresh config.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] if the new config is invalid; the
    /// old material stays active in that case.
    pub fn reload(&self, config: KeyStoreConfig) -> Result<()> {
        let material = Self::build_material(config)?;
        self.swap(material);
        tracing::info!("key store reloaded");
        Ok(())
    }

    // ── signing ────────────────────────────────────────────────────────

    /// Primary signing secret: `(version, material)` for minting.
    #[must_use]
    pub fn current_signing_key(&self) -> (KeyVersion, Vec<u8>) {
        let snapshot = self.snapshot();
        let (version, material) = snapshot.signing.primary();
        (version, material.to_vec())
    }

    /// Signing secret for a given version, if still active.
    #[must_use]
    pub fn signing_key(&self, version: KeyVersion) -> Option<Vec<u8>> {
        self.snapshot().signing.get(version).map(<[u8]>::to_vec)
    }

    /// Add a new primary signing key, demoting the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] on duplicate version or short key.
    pub fn rotate_signing(&self, version: KeyVersion, material: Vec<u8>) -> Result<()> {
        if material.len() < MIN_SIGNING_KEY_LEN {
            return Err(AuthError::InvalidInput(format!(
                "signing key shorter than {MIN_SIGNING_KEY_LEN} bytes"
            )));
        }
        let mut material_snapshot = (*self.snapshot()).clone();
        material_snapshot.signing.rotate(version, material)?;
        self.swap(material_snapshot);
        tracing::info!(version, "signing key rotated");
        Ok(())
    }

    /// Remove a retired signing version. Only legal once every token signed
    /// by it could have expired; the caller schedules this.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] when retiring the primary or an
    /// unknown version.
    pub fn retire_signing(&self, version: KeyVersion) -> Result<()> {
        let mut material_snapshot = (*self.snapshot()).clone();
        material_snapshot.signing.retire(version)?;
        self.swap(material_snapshot);
        tracing::info!(version, "signing key retired");
        Ok(())
    }

    // ── sealing ────────────────────────────────────────────────────────

    /// Seal a secret with the primary sealing key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvariantViolation`] if encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedSecret> {
        let snapshot = self.snapshot();
        let (version, key_bytes) = snapshot.sealing.primary();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| AuthError::InvariantViolation("sealing failed".into()))?;

        Ok(SealedSecret {
            key_version: version,
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Open a sealed secret with whichever active key version sealed it.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvariantViolation`] on an unknown key version,
    /// [`AuthError::SerializationError`] on a damaged ciphertext or nonce.
    pub fn open(&self, sealed: &SealedSecret) -> Result<Vec<u8>> {
        let snapshot = self.snapshot();
        let key_bytes = snapshot.sealing.get(sealed.key_version).ok_or_else(|| {
            AuthError::InvariantViolation(format!(
                "sealing key version {} not active",
                sealed.key_version
            ))
        })?;
        if sealed.nonce.len() != NONCE_LEN {
            return Err(AuthError::SerializationError("sealed secret nonce malformed".into()));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
        cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| AuthError::SerializationError("sealed secret failed to open".into()))
    }

    /// Add a new primary sealing key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] on duplicate version or wrong size.
    pub fn rotate_sealing(&self, version: KeyVersion, material: Vec<u8>) -> Result<()> {
        if material.len() != SEALING_KEY_LEN {
            return Err(AuthError::InvalidInput(format!(
                "sealing key must be exactly {SEALING_KEY_LEN} bytes"
            )));
        }
        let mut material_snapshot = (*self.snapshot()).clone();
        material_snapshot.sealing.rotate(version, material)?;
        self.swap(material_snapshot);
        tracing::info!(version, "sealing key rotated");
        Ok(())
    }

    // ── peppers ────────────────────────────────────────────────────────

    /// Primary pepper for new password digests.
    #[must_use]
    pub fn current_pepper(&self) -> (KeyVersion, Vec<u8>) {
        let snapshot = self.snapshot();
        let (version, material) = snapshot.peppers.primary();
        (version, material.to_vec())
    }

    /// Pepper for a given version, if still in the active set.
    #[must_use]
    pub fn pepper(&self, version: KeyVersion) -> Option<Vec<u8>> {
        self.snapshot().peppers.get(version).map(<[u8]>::to_vec)
    }

    /// Versions currently accepted for password verification.
    #[must_use]
    pub fn active_pepper_versions(&self) -> Vec<KeyVersion> {
        self.snapshot().peppers.active_versions()
    }

    /// Add a new primary pepper, demoting the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] on duplicate version.
    pub fn rotate_pepper(&self, version: KeyVersion, material: Vec<u8>) -> Result<()> {
        let mut material_snapshot = (*self.snapshot()).clone();
        material_snapshot.peppers.rotate(version, material)?;
        self.swap(material_snapshot);
        tracing::info!(version, "pepper rotated");
        Ok(())
    }
}
