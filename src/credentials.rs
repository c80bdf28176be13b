use std::fmt;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// API client id / secret, held only in memory for the lifetime of the process. Never
/// persisted: on restart the process must be re-supplied with credentials (they are expected
/// to come from environment/CLI at startup, see `main`).
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Process-wide, thread-safe credential holder (C1). One instance lives on `Core`.
#[derive(Default)]
pub struct CredentialStore {
    inner: Mutex<Option<Credentials>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client id/secret. Fails with [`Error::InvalidCredentials`] if either is empty.
    pub fn set(&self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Result<()> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(Error::InvalidCredentials);
        }
        *self.inner.lock().unwrap() = Some(Credentials {
            client_id,
            client_secret,
        });
        Ok(())
    }

    pub fn get(&self) -> Option<Credentials> {
        self.inner.lock().unwrap().clone()
    }

    pub fn has(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Fail fast with [`Error::CredentialsUnset`] if no credentials were ever configured.
    pub fn ensure_set(&self) -> Result<Credentials> {
        self.get().ok_or(Error::CredentialsUnset)
    }
}
