use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::Shared;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::token_store::{TokenStore, Tokens};

const TOKEN_ENDPOINT: &str = "https://accounts.spotify.com/api/token";
/// Soft validity margin: a token within 60s of expiry is already considered invalid, to
/// avoid races against in-flight requests.
const VALIDITY_MARGIN_MS: i64 = 60_000;
/// `EnsureValid` pre-emptively refreshes this far ahead of expiry.
const REFRESH_LOOKAHEAD_MS: i64 = 300_000;

#[derive(Debug, Clone, Default)]
struct TokenState {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: i64,
}

/// Snapshot returned by [`TokenManager::info`].
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub has_access: bool,
    pub has_refresh: bool,
    pub is_valid: bool,
    pub expires_in_sec: i64,
}

type RefreshFuture = Shared<futures::future::BoxFuture<'static, Result<(), String>>>;

/// In-memory OAuth2 token state with single-flight refresh coalescing (C3).
///
/// `Refresh` calls are deduplicated with a `futures::future::Shared` slot: the first caller
/// to find the slot empty spawns the actual refresh and installs the shared future; every
/// other concurrent caller clones and awaits that same future, so there is exactly one POST
/// to the token endpoint no matter how many callers observed an expired/401'd token at once.
pub struct TokenManager {
    state: RwLock<TokenState>,
    in_flight: Mutex<Option<(u64, RefreshFuture)>>,
    next_generation: AtomicU64,
    store: TokenStore,
    credentials: Arc<CredentialStore>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    token_endpoint: String,
}

impl TokenManager {
    pub fn new(store: TokenStore, credentials: Arc<CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        let initial = store.load().ok().flatten().map(|t| TokenState {
            access_token: t.access_token,
            refresh_token: t.refresh_token,
            expires_at: t.expires_at,
        });

        Self {
            state: RwLock::new(initial.unwrap_or_default()),
            in_flight: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            store,
            credentials,
            http: reqwest::Client::new(),
            clock,
            token_endpoint: TOKEN_ENDPOINT.to_string(),
        }
    }

    /// Point the refresh POST at a different endpoint (a local mock server in integration
    /// tests instead of the real Spotify accounts host).
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Set tokens explicitly (e.g. after the initial OAuth code exchange) and persist them.
    pub async fn set(&self, access_token: String, refresh_token: Option<String>, expires_in_sec: i64) -> Result<()> {
        let expires_at = self.clock.now().timestamp_millis() + expires_in_sec * 1000;
        let mut state = self.state.write().await;
        state.access_token = access_token;
        if refresh_token.is_some() {
            state.refresh_token = refresh_token;
        }
        state.expires_at = expires_at;

        self.store.save(&Tokens {
            access_token: state.access_token.clone(),
            refresh_token: state.refresh_token.clone(),
            expires_at: state.expires_at,
        })
    }

    pub async fn get(&self) -> Option<String> {
        let state = self.state.read().await;
        if state.access_token.is_empty() {
            None
        } else {
            Some(state.access_token.clone())
        }
    }

    async fn is_valid_locked(&self, state: &TokenState) -> bool {
        !state.access_token.is_empty()
            && state.expires_at - self.clock.now().timestamp_millis() > VALIDITY_MARGIN_MS
    }

    pub async fn info(&self) -> TokenInfo {
        let state = self.state.read().await;
        let expires_in_sec = (state.expires_at - self.clock.now().timestamp_millis()).max(0) / 1000;
        TokenInfo {
            has_access: !state.access_token.is_empty(),
            has_refresh: state.refresh_token.is_some(),
            is_valid: self.is_valid_locked(&state).await,
            expires_in_sec,
        }
    }

    pub async fn clear(&self) -> Result<()> {
        *self.state.write().await = TokenState::default();
        self.store.clear()
    }

    /// Refresh now, coalescing concurrent callers onto a single upstream request.
    pub async fn refresh(&self) -> Result<()> {
        let refresh_token = {
            let state = self.state.read().await;
            state.refresh_token.clone()
        };
        let Some(refresh_token) = refresh_token else {
            return Err(Error::NoRefreshToken);
        };

        let (generation, shared) = {
            let mut guard = self.in_flight.lock().await;
            if let Some((generation, shared)) = guard.as_ref() {
                (*generation, shared.clone())
            } else {
                let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                let fut = self.do_refresh(refresh_token).boxed().shared();
                *guard = Some((generation, fut.clone()));
                (generation, fut)
            }
        };

        let result = shared.await;

        // Only clear the slot if it still holds *this* refresh's generation: a caller that
        // was slow to wake up must not clobber a newer refresh that has already started.
        {
            let mut guard = self.in_flight.lock().await;
            if matches!(guard.as_ref(), Some((g, _)) if *g == generation) {
                *guard = None;
            }
        }

        result.map_err(Error::RefreshFailed)
    }

    async fn do_refresh(&self, refresh_token: String) -> Result<(), String> {
        let credentials = self
            .credentials
            .ensure_set()
            .map_err(|e| e.to_string())?;

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("token endpoint returned {}", response.status()));
        }

        let body: RefreshResponse = response.json().await.map_err(|e| e.to_string())?;
        self.set(
            body.access_token,
            body.refresh_token.or(Some(refresh_token)),
            body.expires_in,
        )
        .await
        .map_err(|e| e.to_string())
    }

    /// Refresh if the token is invalid or about to expire within the lookahead window.
    pub async fn ensure_valid(&self) -> Result<()> {
        let needs_refresh = {
            let state = self.state.read().await;
            !self.is_valid_locked(&state).await
                || state.expires_at - self.clock.now().timestamp_millis() <= REFRESH_LOOKAHEAD_MS
        };
        if needs_refresh {
            self.refresh().await
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}
