use std::path::{Path, PathBuf};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::persist;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// OAuth2 token state (C3's persisted half). `expires_at` is an absolute epoch-millisecond
/// timestamp, matching the upstream's `expires_in` semantics converted at write time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

/// The on-disk shape of `data/spotify-tokens.json`: an AEAD record, not the plaintext tokens.
/// `aes-gcm` hands back the authentication tag appended to the ciphertext; this splits it back
/// into its own field to match the documented on-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct CipherRecord {
    iv: Vec<u8>,
    #[serde(rename = "encryptedData")]
    encrypted_data: Vec<u8>,
    tag: Vec<u8>,
}

/// Encrypted at-rest persistence for [`Tokens`] (C2). AES-256-GCM with a fresh random nonce
/// per write; the authentication tag is stored alongside `encryptedData` and verified on every
/// decrypt.
pub struct TokenStore {
    key_path: PathBuf,
    tokens_path: PathBuf,
}

impl TokenStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            key_path: data_dir.join("encryption-key"),
            tokens_path: data_dir.join("spotify-tokens.json"),
        }
    }

    fn load_or_create_key(&self) -> Result<[u8; KEY_LEN]> {
        match std::fs::read(&self.key_path) {
            Ok(bytes) if bytes.len() == KEY_LEN => {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&bytes);
                Ok(key)
            }
            _ => {
                let mut key = [0u8; KEY_LEN];
                rand::rng().fill_bytes(&mut key);
                persist::write_bytes_atomic(&self.key_path, &key)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(metadata) = std::fs::metadata(&self.key_path) {
                        let mut perms = metadata.permissions();
                        perms.set_mode(0o600);
                        let _ = std::fs::set_permissions(&self.key_path, perms);
                    }
                }
                Ok(key)
            }
        }
    }

    /// Encrypt and atomically persist `tokens`.
    pub fn save(&self, tokens: &Tokens) -> Result<()> {
        let key = self.load_or_create_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::Decrypt)?;

        let mut iv = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let plaintext = serde_json::to_vec(tokens)?;
        let mut sealed = cipher.encrypt(nonce, plaintext.as_slice())?;
        if sealed.len() < TAG_LEN {
            return Err(Error::Decrypt);
        }
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        persist::write_json_atomic(
            &self.tokens_path,
            &CipherRecord {
                iv: iv.to_vec(),
                encrypted_data: sealed,
                tag,
            },
        )
    }

    /// Decrypt the persisted tokens. Returns `Ok(None)` if nothing has been saved yet.
    /// Malformed ciphertext or a failed authentication tag is logged and treated as "no
    /// tokens" rather than propagated: a corrupt store should not crash the daemon, it should
    /// just force re-authorization.
    pub fn load(&self) -> Result<Option<Tokens>> {
        let record: Option<CipherRecord> = persist::read_json_opt(&self.tokens_path)?;
        let Some(record) = record else {
            return Ok(None);
        };

        if record.iv.len() != NONCE_LEN {
            log::error!("token store: malformed nonce length, discarding");
            return Ok(None);
        }

        let key = self.load_or_create_key()?;
        let cipher = match Aes256Gcm::new_from_slice(&key) {
            Ok(c) => c,
            Err(_) => {
                log::error!("token store: invalid encryption key, discarding");
                return Ok(None);
            }
        };
        let nonce = Nonce::from_slice(&record.iv);

        let mut sealed = record.encrypted_data;
        sealed.extend_from_slice(&record.tag);

        match cipher.decrypt(nonce, sealed.as_slice()) {
            Ok(plaintext) => match serde_json::from_slice::<Tokens>(&plaintext) {
                Ok(tokens) => Ok(Some(tokens)),
                Err(e) => {
                    log::error!("token store: could not parse decrypted tokens: {e}");
                    Ok(None)
                }
            },
            Err(_) => {
                log::error!("token store: authentication tag mismatch, discarding");
                Ok(None)
            }
        }
    }

    /// Remove any persisted tokens. The encryption key is left in place; it is harmless
    /// without a matching ciphertext file.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.tokens_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tokens() -> Tokens {
        Tokens {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn decrypt_of_encrypt_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path());

        store.save(&sample_tokens()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, Some(sample_tokens()));
    }

    #[test]
    fn load_with_no_prior_save_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path());
        store.save(&sample_tokens()).unwrap();

        let tokens_path = dir.path().join("spotify-tokens.json");
        let raw = std::fs::read_to_string(&tokens_path).unwrap();
        let mut record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        // Flip a byte in the authentication tag so decryption fails closed.
        let tag = record["tag"].as_array_mut().unwrap();
        let first = tag[0].as_u64().unwrap();
        tag[0] = serde_json::Value::from((first + 1) % 256);
        std::fs::write(&tokens_path, serde_json::to_string(&record).unwrap()).unwrap();

        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn clear_removes_tokens_but_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path());
        store.save(&sample_tokens()).unwrap();
        store.clear().unwrap();

        assert_eq!(store.load().unwrap(), None);
        assert!(dir.path().join("encryption-key").exists());
    }

    #[test]
    fn clear_without_prior_save_does_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path());
        store.clear().unwrap();
    }
}
