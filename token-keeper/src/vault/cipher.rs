//! AES-256-GCM keyring used by the SQLite backend.
//!
//! Each configured secret is stretched into a 256-bit key with HKDF-SHA256
//! and tagged with a short key id. Values are sealed with the primary key;
//! previous keys are kept only to open values written before a rotation.

use aes_gcm::aead::{Aead, AeadCore, OsRng, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use super::error::StorageError;

const HKDF_SALT: &[u8] = b"token-keeper/secret-store";
const HKDF_INFO: &[u8] = b"aes-256-gcm";
pub const NONCE_LEN: usize = 12;

/// A sealed value plus what is needed to open it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedValue {
    pub key_id: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

struct DerivedKey {
    id: String,
    cipher: Aes256Gcm,
}

impl DerivedKey {
    fn derive(secret: &str) -> Result<Self, StorageError> {
        if secret.is_empty() {
            return Err(StorageError::Crypto("encryption key is empty".to_string()));
        }
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|_| StorageError::Crypto("HKDF expand failed".to_string()))?;

        let digest = Sha256::digest(okm);
        let id = hex::encode(&digest[..8]);
        let cipher = Aes256Gcm::new_from_slice(&okm)
            .map_err(|_| StorageError::Crypto("invalid key length".to_string()))?;
        Ok(Self { id, cipher })
    }
}

/// Primary key plus retired keys still accepted for decryption.
pub struct Keyring {
    primary: DerivedKey,
    previous: Vec<DerivedKey>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("primary", &self.primary.id)
            .field(
                "previous",
                &self.previous.iter().map(|k| k.id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Keyring {
    pub fn new<S: AsRef<str>>(primary: &str, previous: &[S]) -> Result<Self, StorageError> {
        let primary = DerivedKey::derive(primary)?;
        let previous = previous
            .iter()
            .map(|s| DerivedKey::derive(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { primary, previous })
    }

    pub fn primary_key_id(&self) -> &str {
        &self.primary.id
    }

    /// Whether `key_id` is the primary key.
    pub fn is_primary(&self, key_id: &str) -> bool {
        self.primary.id == key_id
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.id.as_str()).chain(self.previous.iter().map(|k| k.id.as_str()))
    }

    /// Seal `plaintext` with the primary key. `aad` binds the ciphertext to its storage key.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<SealedValue, StorageError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .primary
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| StorageError::Crypto("AES-GCM encryption failed".to_string()))?;
        Ok(SealedValue {
            key_id: self.primary.id.clone(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Open a sealed value with whichever key it names.
    pub fn open(&self, aad: &[u8], sealed: &SealedValue) -> Result<Vec<u8>, StorageError> {
        if sealed.nonce.len() != NONCE_LEN {
            return Err(StorageError::Crypto(format!(
                "invalid nonce length {}",
                sealed.nonce.len()
            )));
        }
        let key = std::iter::once(&self.primary)
            .chain(self.previous.iter())
            .find(|key| key.id == sealed.key_id)
            .ok_or_else(|| StorageError::Crypto(format!("unknown key id {}", sealed.key_id)))?;

        key.cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad,
                },
            )
            .map_err(|_| StorageError::Crypto("AES-GCM authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "0123456789abcdef0123456789abcdef";
    const KEY_B: &str = "fedcba9876543210fedcba9876543210";

    #[test]
    fn test_seal_open() {
        let keyring = Keyring::new::<&str>(KEY_A, &[]).unwrap();
        let sealed = keyring.seal(b"live/u1", b"payload").unwrap();
        assert_ne!(sealed.ciphertext, b"payload");
        assert_eq!(keyring.open(b"live/u1", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_aad_mismatch_rejected() {
        let keyring = Keyring::new::<&str>(KEY_A, &[]).unwrap();
        let sealed = keyring.seal(b"live/u1", b"payload").unwrap();
        assert!(keyring.open(b"live/u2", &sealed).is_err());
    }

    #[test]
    fn test_previous_key_opens_old_values() {
        let old = Keyring::new::<&str>(KEY_A, &[]).unwrap();
        let sealed = old.seal(b"k", b"v").unwrap();

        let rotated = Keyring::new(KEY_B, &[KEY_A]).unwrap();
        assert!(!rotated.is_primary(&sealed.key_id));
        assert_eq!(rotated.open(b"k", &sealed).unwrap(), b"v");

        let without_old = Keyring::new::<&str>(KEY_B, &[]).unwrap();
        assert!(without_old.open(b"k", &sealed).is_err());
    }

    #[test]
    fn test_key_ids_are_stable() {
        let a = Keyring::new::<&str>(KEY_A, &[]).unwrap();
        let b = Keyring::new::<&str>(KEY_A, &[]).unwrap();
        assert_eq!(a.primary_key_id(), b.primary_key_id());
        assert_eq!(a.primary_key_id().len(), 16);
        assert!(Keyring::new::<&str>("", &[]).is_err());
    }
}
