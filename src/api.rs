//! Typed wrappers over the streaming service's Web API (C5), used exclusively by the
//! playback monitor (C6). Hand-written response DTOs rather than a general-purpose typed
//! client: the half-dozen endpoints this daemon touches are a small enough surface that a
//! full third-party model crate would import far more than it would save (see DESIGN.md).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::http_client::HttpClient;
use crate::token_manager::TokenManager;

const API_BASE: &str = "https://api.spotify.com/v1";
const AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Scopes required by every operation this daemon performs.
pub const REQUIRED_SCOPES: &[&str] = &[
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-library-read",
    "user-library-modify",
    "user-read-recently-played",
];

/// Track/episode metadata, the shape this adapter actually needs out of the upstream's much
/// larger track object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMeta {
    pub id: String,
    pub name: String,
    pub artist_id: String,
    pub artist_name: String,
    pub album_name: String,
    pub album_art: Option<String>,
    pub duration_ms: u32,
}

/// A point-in-time playback observation, emitted to the bus every tick. `in_library` is
/// filled in by the monitor after a separate `InLibrary` call — the upstream's `/me/player`
/// response has no such field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    pub track_id: Option<String>,
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub album_art: Option<String>,
    pub progress_ms: u32,
    pub duration_ms: u32,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub in_library: bool,
}

impl PlaybackSnapshot {
    /// The "nothing playing" snapshot emitted when there is no active device or the upstream
    /// returns 204.
    pub fn empty() -> Self {
        Self {
            is_playing: false,
            track_id: None,
            track_name: None,
            artist_name: None,
            album_name: None,
            album_art: None,
            progress_ms: 0,
            duration_ms: 0,
            device_id: None,
            device_type: None,
            in_library: false,
        }
    }
}

/// A row from the upstream's recently-played history.
#[derive(Debug, Clone)]
pub struct RecentlyPlayedItem {
    pub track_id: String,
    pub played_at: chrono::DateTime<chrono::Utc>,
}

/// The upstream Web API surface this daemon touches (C5).
pub struct Adapter {
    http: Arc<HttpClient>,
    tokens: Arc<TokenManager>,
    api_base: String,
}

impl Adapter {
    pub fn new(http: Arc<HttpClient>, tokens: Arc<TokenManager>) -> Self {
        Self {
            http,
            tokens,
            api_base: API_BASE.to_string(),
        }
    }

    /// Point every `/v1/...` call at a different host (a local mock server in integration
    /// tests instead of the real Spotify Web API).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Build the OAuth2 consent URL for the authorization-code flow. The core never opens a
    /// browser itself: the caller (the bus's `Authenticate` reply) hands this to the shell.
    pub fn authorization_url(&self, client_id: &str, redirect_uri: &str, state: &str) -> Url {
        let mut url = Url::parse(AUTHORIZE_URL).expect("static authorize URL is valid");
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &REQUIRED_SCOPES.join(" "))
            .append_pair("state", state);
        url
    }

    /// Exchange an authorization code for tokens and install them in the token manager.
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<()> {
        let client = reqwest::Client::new();
        let response = client
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Upstream { status, message });
        }

        let body: TokenExchangeResponse = response.json().await?;
        self.tokens
            .set(body.access_token, body.refresh_token, body.expires_in)
            .await
    }

    /// `GET /v1/me/player`. Returns `None` on HTTP 204 ("no active device") or when there is
    /// no `item` at all. A paused player still has an `item` and comes back 200 with
    /// `is_playing:false`, so that case is returned as `Some(..)` with `is_playing:false`
    /// rather than collapsed into `None` — the monitor needs to observe the pause edge.
    pub async fn current_playback(&self) -> Result<Option<PlaybackSnapshot>> {
        let url = format!("{}/me/player?additional_types=episode", self.api_base);
        let response = self.http.get(&url).await?;

        if response.status().as_u16() == 204 {
            return Ok(None);
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        let parsed: PlayerStateResponse = serde_json::from_str(&body)?;
        let Some(item) = parsed.item else {
            return Ok(None);
        };

        Ok(Some(PlaybackSnapshot {
            is_playing: parsed.is_playing,
            track_id: Some(item.id.clone()),
            track_name: Some(item.name.clone()),
            artist_name: item.artists.first().map(|a| a.name.clone()),
            album_name: Some(item.album.name.clone()),
            album_art: item.album.images.first().map(|i| i.url.clone()),
            progress_ms: parsed.progress_ms.unwrap_or(0),
            duration_ms: item.duration_ms,
            device_id: parsed.device.as_ref().map(|d| d.id.clone()),
            device_type: parsed.device.as_ref().map(|d| d.device_type.clone()),
            in_library: false,
        }))
    }

    /// `GET /v1/me/player/recently-played?limit=N`.
    pub async fn recently_played(&self, limit: u32) -> Result<Vec<RecentlyPlayedItem>> {
        let url = format!("{}/me/player/recently-played?limit={limit}", self.api_base);
        let response = self.http.get(&url).await?;
        let body: RecentlyPlayedResponse = response.json().await?;

        Ok(body
            .items
            .into_iter()
            .filter_map(|item| {
                let played_at = chrono::DateTime::parse_from_rfc3339(&item.played_at)
                    .ok()?
                    .with_timezone(&chrono::Utc);
                Some(RecentlyPlayedItem {
                    track_id: item.track.id,
                    played_at,
                })
            })
            .collect())
    }

    /// `GET /v1/tracks/{id}`. Returns `None` on 404.
    pub async fn track(&self, id: &str) -> Result<Option<TrackMeta>> {
        let url = format!("{}/tracks/{id}", self.api_base);
        match self.http.get(&url).await {
            Ok(response) => {
                let item: TrackItem = response.json().await?;
                Ok(Some(item.into()))
            }
            Err(Error::Upstream { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `GET /v1/me/tracks/contains?ids={id}`. `silent` suppresses the normal per-call
    /// logging when invoked from the monitor's hot loop.
    pub async fn in_library(&self, id: &str, silent: bool) -> Result<bool> {
        let url = format!("{}/me/tracks/contains?ids={id}", self.api_base);
        if !silent {
            log::debug!("checking library membership for {id}");
        }
        let response = self.http.get(&url).await?;
        let flags: Vec<bool> = response.json().await?;
        Ok(flags.first().copied().unwrap_or(false))
    }

    /// `PUT /v1/me/tracks?ids={id}`. 403/404 are treated as a soft "no active
    /// device"/"not found" failure rather than an error.
    pub async fn save_to_library(&self, id: &str) -> Result<bool> {
        let url = format!("{}/me/tracks?ids={id}", self.api_base);
        self.soft_fail_ok(self.http.put(&url, None).await)
    }

    /// `DELETE /v1/me/tracks?ids={id}`.
    pub async fn remove_from_library(&self, id: &str) -> Result<bool> {
        let url = format!("{}/me/tracks?ids={id}", self.api_base);
        self.soft_fail_ok(self.http.delete(&url).await)
    }

    /// `PUT /v1/me/player/play`.
    pub async fn resume(&self) -> Result<()> {
        let url = format!("{}/me/player/play", self.api_base);
        self.soft_fail_unit(self.http.put(&url, None).await)
    }

    /// `PUT /v1/me/player/pause`.
    pub async fn pause(&self) -> Result<()> {
        let url = format!("{}/me/player/pause", self.api_base);
        self.soft_fail_unit(self.http.put(&url, None).await)
    }

    /// `POST /v1/me/player/next`.
    pub async fn next(&self) -> Result<()> {
        let url = format!("{}/me/player/next", self.api_base);
        self.soft_fail_unit(self.http.post(&url, None).await)
    }

    /// `POST /v1/me/player/previous`.
    pub async fn previous(&self) -> Result<()> {
        let url = format!("{}/me/player/previous", self.api_base);
        self.soft_fail_unit(self.http.post(&url, None).await)
    }

    /// `GET /v1/me`, the user profile. Not consumed by any component in this core — kept
    /// because it is part of the documented upstream surface and is the natural place a
    /// shell would hook up a "signed in as..." display.
    pub async fn profile(&self) -> Result<Profile> {
        let url = format!("{}/me", self.api_base);
        let response = self.http.get(&url).await?;
        Ok(response.json().await?)
    }

    fn soft_fail_ok(&self, result: Result<reqwest::Response>) -> Result<bool> {
        match result {
            Ok(_) => Ok(true),
            Err(Error::Upstream { status: 403, .. }) | Err(Error::Upstream { status: 404, .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn soft_fail_unit(&self, result: Result<reqwest::Response>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(Error::Upstream { status: 403, .. }) | Err(Error::Upstream { status: 404, .. }) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct PlayerStateResponse {
    is_playing: bool,
    progress_ms: Option<u32>,
    item: Option<TrackItem>,
    device: Option<DeviceResponse>,
}

#[derive(Debug, Deserialize)]
struct DeviceResponse {
    id: String,
    #[serde(rename = "type")]
    device_type: String,
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    id: String,
    name: String,
    duration_ms: u32,
    album: AlbumResponse,
    artists: Vec<ArtistResponse>,
}

impl From<TrackItem> for TrackMeta {
    fn from(item: TrackItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            artist_id: item.artists.first().map(|a| a.id.clone()).unwrap_or_default(),
            artist_name: item.artists.first().map(|a| a.name.clone()).unwrap_or_default(),
            album_name: item.album.name,
            album_art: item.album.images.first().map(|i| i.url.clone()),
            duration_ms: item.duration_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlbumResponse {
    name: String,
    images: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ArtistResponse {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    items: Vec<RecentlyPlayedEntry>,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedEntry {
    track: TrackItem,
    played_at: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    pub id: String,
    pub display_name: Option<String>,
}
