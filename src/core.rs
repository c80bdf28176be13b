//! The process-wide context object (`Core`, §3a) and the command/event bus's inbound half
//! (C10): `Core::dispatch` is the single function allowed to call across component
//! boundaries, keeping the dependency graph in spec §2's dataflow diagram enforced in code.
//!
//! Grounded on the redesign note in spec §9 ("replace module-level state with a single
//! `Core` context passed explicitly") plus the teacher's `application.rs`, which is the one
//! place in that codebase every subsystem gets wired together.

use std::sync::{Arc, RwLock as StdRwLock};

use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;

use crate::api::Adapter;
use crate::clock::Clock;
use crate::config::Settings;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::events::{AuthStatus, Command, Event, EventBus, Reply};
use crate::http_client::{HttpClient, RetryPolicy};
use crate::log_store::LogStore;
use crate::monitor::{Monitor, MonitorCommand};
use crate::skip_store::SkipRecordStore;
use crate::statistics::StatisticsAggregator;
use crate::token_manager::TokenManager;
use crate::token_store::TokenStore;

/// Paths under the per-user data directory, resolved once at startup (spec §6).
pub struct DataPaths {
    pub data_dir: std::path::PathBuf,
    pub settings_path: std::path::PathBuf,
}

struct MonitorHandle {
    join: tokio::task::JoinHandle<()>,
    stop: tokio::sync::mpsc::UnboundedSender<MonitorCommand>,
}

/// The process-wide context: holds every component (C1-C9) and the outbound half of the bus
/// (C10). Constructed once in `main`, then threaded explicitly to whatever drives the event
/// loop (the CLI's `--foreground` path, or a future shell adapter).
pub struct Core {
    pub credentials: Arc<CredentialStore>,
    pub tokens: Arc<TokenManager>,
    pub adapter: Arc<Adapter>,
    pub skip_store: Arc<SkipRecordStore>,
    pub statistics: Arc<StatisticsAggregator>,
    pub logs: Arc<LogStore>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    settings: Arc<StdRwLock<Settings>>,
    settings_path: std::path::PathBuf,
    monitor: Arc<Monitor>,
    monitor_handle: AsyncMutex<Option<MonitorHandle>>,
}

impl Core {
    /// Wire every component together. `logs` must already be installed (see
    /// [`LogStore::init`]) since several components log during construction. `config` supplies
    /// the HTTP retry policy (spec §2a's static, process-startup `Config`, as distinct from
    /// the bus-mutable [`Settings`]).
    pub fn new(
        paths: DataPaths,
        clock: Arc<dyn Clock>,
        logs: Arc<LogStore>,
        config: crate::config::Config,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&paths.data_dir)?;

        let retry_policy = RetryPolicy {
            max_retries: config.max_retries,
            initial_backoff: std::time::Duration::from_millis(config.initial_backoff_ms),
            request_timeout: std::time::Duration::from_millis(config.request_timeout_ms),
        };

        let credentials = Arc::new(CredentialStore::new());
        let token_store = TokenStore::new(&paths.data_dir);
        let tokens = Arc::new(TokenManager::new(token_store, credentials.clone(), clock.clone()));
        let http = Arc::new(HttpClient::new(tokens.clone(), retry_policy));
        let adapter = Arc::new(Adapter::new(http, tokens.clone()));

        let skip_store = SkipRecordStore::new(&paths.data_dir)?;
        let statistics = StatisticsAggregator::new(&paths.data_dir, clock.clone())?;

        let settings = Settings::load(&paths.settings_path);
        let settings = Arc::new(StdRwLock::new(settings));

        let events = EventBus::new();
        let monitor = Monitor::new(
            adapter.clone(),
            skip_store.clone(),
            statistics.clone(),
            events.clone(),
            clock.clone(),
            settings.clone(),
        );

        Ok(Arc::new(Self {
            credentials,
            tokens,
            adapter,
            skip_store,
            statistics,
            logs,
            events,
            clock,
            settings,
            settings_path: paths.settings_path,
            monitor,
            monitor_handle: AsyncMutex::new(None),
        }))
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    /// The single entry point for every inbound [`Command`] (C10). Every cross-component call
    /// in this crate is reachable from here and nowhere else, which keeps the dependency graph
    /// in spec §2 enforced by the compiler rather than by convention.
    pub async fn dispatch(&self, command: Command) -> Result<Reply> {
        match command {
            Command::Authenticate { client_id, client_secret, redirect_uri, force } => {
                self.authenticate(client_id, client_secret, redirect_uri, force).await
            }
            Command::CompleteAuthentication { code, redirect_uri } => {
                self.complete_authentication(code, redirect_uri).await
            }
            Command::Logout => self.logout().await,
            Command::IsAuthenticated => {
                let info = self.tokens.info().await;
                Ok(Reply::Bool(info.is_valid))
            }
            Command::StartMonitoring => self.start_monitoring().await,
            Command::StopMonitoring => self.stop_monitoring().await,
            Command::IsMonitoring => Ok(Reply::Bool(self.monitor.is_running())),
            Command::Play => {
                self.adapter.resume().await?;
                Ok(Reply::Unit)
            }
            Command::Pause => {
                self.adapter.pause().await?;
                Ok(Reply::Unit)
            }
            Command::Next => {
                self.adapter.next().await?;
                Ok(Reply::Unit)
            }
            Command::Previous => {
                self.adapter.previous().await?;
                Ok(Reply::Unit)
            }
            Command::GetCurrentPlayback => {
                let snapshot = self.adapter.current_playback().await?;
                Ok(Reply::Playback(snapshot))
            }
            Command::GetSkippedTracks => Ok(Reply::SkippedTracks(self.skip_store.get_all())),
            Command::UpdateSkippedTrack(updated) => {
                let mut all = self.skip_store.get_all();
                if let Some(existing) = all.iter_mut().find(|r| r.id == updated.id) {
                    *existing = updated;
                } else {
                    all.push(updated);
                }
                self.skip_store.save_all(all)?;
                Ok(Reply::Unit)
            }
            Command::RemoveFromSkipped(id) => {
                self.skip_store.remove(&id)?;
                Ok(Reply::Unit)
            }
            Command::UnlikeTrack(id) => {
                let removed = self.adapter.remove_from_library(&id).await?;
                Ok(Reply::Bool(removed))
            }
            Command::GetSettings => Ok(Reply::Settings(self.settings())),
            Command::SaveSettings(new_settings) => {
                new_settings.save(&self.settings_path)?;
                *self.settings.write().unwrap() = new_settings;
                Ok(Reply::Unit)
            }
            Command::GetStatistics => Ok(Reply::Statistics(Box::new(self.statistics.snapshot()))),
            Command::ClearStatistics => {
                self.statistics.clear()?;
                Ok(Reply::Unit)
            }
            Command::GetLogs(n) => Ok(Reply::Logs(self.logs.get(n))),
            Command::ClearLogs => {
                self.logs.clear();
                Ok(Reply::Unit)
            }
        }
    }

    async fn authenticate(
        &self,
        client_id: Option<String>,
        client_secret: Option<String>,
        redirect_uri: String,
        force: bool,
    ) -> Result<Reply> {
        if force || !self.credentials.has() {
            let client_id = client_id.unwrap_or_else(|| crate::config::CLIENT_ID.to_string());
            let client_secret = client_secret.ok_or(Error::InvalidCredentials)?;
            self.credentials.set(client_id, client_secret)?;
        }
        let creds = self.credentials.ensure_set()?;

        self.events.publish(Event::AuthStatusChanged(AuthStatus::Authenticating));

        let state: String = rand::rng().sample_iter(&Alphanumeric).take(16).map(char::from).collect();
        let url = self.adapter.authorization_url(&creds.client_id, &redirect_uri, &state);
        Ok(Reply::AuthorizationUrl(url.to_string()))
    }

    async fn complete_authentication(&self, code: String, redirect_uri: String) -> Result<Reply> {
        let creds = match self.credentials.ensure_set() {
            Ok(creds) => creds,
            Err(e) => {
                self.events.publish(Event::AuthStatusChanged(AuthStatus::Unauthenticated));
                return Err(e);
            }
        };

        match self
            .adapter
            .exchange_code(&creds.client_id, &creds.client_secret, &code, &redirect_uri)
            .await
        {
            Ok(()) => {
                self.monitor.resume_after_auth();
                self.events.publish(Event::AuthStatusChanged(AuthStatus::Authenticated));
                Ok(Reply::Bool(true))
            }
            Err(e) => {
                self.events.publish(Event::AuthStatusChanged(AuthStatus::Unauthenticated));
                Err(e)
            }
        }
    }

    async fn logout(&self) -> Result<Reply> {
        self.stop_monitoring().await?;
        self.tokens.clear().await?;
        self.events.publish(Event::AuthStatusChanged(AuthStatus::Unauthenticated));
        Ok(Reply::Unit)
    }

    async fn start_monitoring(&self) -> Result<Reply> {
        let mut handle = self.monitor_handle.lock().await;
        if handle.is_some() {
            return Ok(Reply::Bool(true));
        }
        let (join, stop) = self.monitor.clone().spawn();
        *handle = Some(MonitorHandle { join, stop });
        Ok(Reply::Bool(true))
    }

    async fn stop_monitoring(&self) -> Result<Reply> {
        let mut handle = self.monitor_handle.lock().await;
        if let Some(MonitorHandle { join, stop }) = handle.take() {
            let _ = stop.send(MonitorCommand::Stop);
            let _ = join.await;
        }
        Ok(Reply::Bool(true))
    }

    /// Orderly shutdown (spec §5): cancel the monitor, then every store is already
    /// persisted-on-write so there is nothing left to flush beyond that.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_monitoring().await {
            log::error!("error stopping monitor during shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn core_for_test(dir: &std::path::Path) -> Arc<Core> {
        let paths = DataPaths {
            data_dir: dir.to_path_buf(),
            settings_path: dir.join("settings.json"),
        };
        let logs = LogStore::init(dir.join("logs"), crate::config::LogLevel::Error, None, Arc::new(SystemClock)).unwrap();
        Core::new(paths, Arc::new(SystemClock), logs, crate::config::Config::default()).unwrap()
    }

    #[tokio::test]
    async fn authenticate_without_credentials_or_secret_fails() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_for_test(dir.path());

        let result = core
            .dispatch(Command::Authenticate {
                client_id: None,
                client_secret: None,
                redirect_uri: "http://localhost/cb".into(),
                force: false,
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidCredentials)));
    }

    #[tokio::test]
    async fn authenticate_with_credentials_returns_authorization_url() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_for_test(dir.path());

        let result = core
            .dispatch(Command::Authenticate {
                client_id: Some("client".into()),
                client_secret: Some("secret".into()),
                redirect_uri: "http://localhost/cb".into(),
                force: false,
            })
            .await
            .unwrap();

        match result {
            Reply::AuthorizationUrl(url) => assert!(url.starts_with("https://accounts.spotify.com/authorize")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_settings_returns_documented_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_for_test(dir.path());

        let reply = core.dispatch(Command::GetSettings).await.unwrap();
        match reply {
            Reply::Settings(settings) => assert_eq!(settings, Settings::default()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_settings_persists_and_is_visible_to_get_settings() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_for_test(dir.path());

        let mut settings = Settings::default();
        settings.skip_threshold = 7;
        core.dispatch(Command::SaveSettings(settings.clone())).await.unwrap();

        let reply = core.dispatch(Command::GetSettings).await.unwrap();
        match reply {
            Reply::Settings(loaded) => assert_eq!(loaded.skip_threshold, 7),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn is_monitoring_reflects_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_for_test(dir.path());

        assert!(matches!(core.dispatch(Command::IsMonitoring).await.unwrap(), Reply::Bool(false)));
        core.dispatch(Command::StartMonitoring).await.unwrap();
        assert!(matches!(core.dispatch(Command::IsMonitoring).await.unwrap(), Reply::Bool(true)));
        core.dispatch(Command::StopMonitoring).await.unwrap();
        assert!(matches!(core.dispatch(Command::IsMonitoring).await.unwrap(), Reply::Bool(false)));
    }
}
