//! The command/event bus (C10): the sole external surface between the core and whatever
//! shell embeds it. Commands flow in through [`Core::dispatch`](crate::core::Core::dispatch);
//! domain events and playback snapshots flow out through an [`EventBus`] subscription.

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::api::PlaybackSnapshot;
use crate::config::Settings;
use crate::log_store::LogEntry;
use crate::skip_store::SkipRecord;
use crate::statistics::Statistics;

/// Authentication lifecycle state, the payload of [`Event::AuthStatusChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

/// Inbound commands accepted by [`Core::dispatch`](crate::core::Core::dispatch).
///
/// `CompleteAuthentication` completes the round trip `Authenticate` starts: `Authenticate`
/// only ever hands back an authorization URL, so a second command is needed for the shell to
/// hand back the redirect's `code` once the user has approved access.
#[derive(Debug, Clone)]
pub enum Command {
    Authenticate {
        client_id: Option<String>,
        client_secret: Option<String>,
        redirect_uri: String,
        force: bool,
    },
    CompleteAuthentication {
        code: String,
        redirect_uri: String,
    },
    Logout,
    IsAuthenticated,
    StartMonitoring,
    StopMonitoring,
    IsMonitoring,
    Play,
    Pause,
    Next,
    Previous,
    GetCurrentPlayback,
    GetSkippedTracks,
    UpdateSkippedTrack(SkipRecord),
    RemoveFromSkipped(String),
    UnlikeTrack(String),
    GetSettings,
    SaveSettings(Settings),
    GetStatistics,
    ClearStatistics,
    GetLogs(usize),
    ClearLogs,
}

/// Replies to [`Command`]s. Imperative commands reply with `Bool`/`Unit`; queries reply with
/// the matching domain object.
#[derive(Debug, Clone)]
pub enum Reply {
    Unit,
    Bool(bool),
    AuthorizationUrl(String),
    Playback(Option<PlaybackSnapshot>),
    SkippedTracks(Vec<SkipRecord>),
    Settings(Settings),
    Statistics(Box<Statistics>),
    Logs(Vec<LogEntry>),
}

/// Outbound domain events.
#[derive(Debug, Clone)]
pub enum Event {
    PlaybackUpdate(PlaybackSnapshot),
    AuthStatusChanged(AuthStatus),
    TrackSkipped(SkipRecord),
    TrackChanged(Option<crate::api::TrackMeta>),
}

/// Outbound half of the bus: an unbounded `crossbeam_channel`, mirroring this codebase's
/// existing cross-thread `EventManager`. There is no inbound command channel here — commands
/// are ordinary async calls into [`Core::dispatch`](crate::core::Core::dispatch); only the
/// one-way event stream needs a channel, since any number of components (the monitor on a
/// playback update or an auth failure, `Core` on login/logout) can emit events asynchronously.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Publish an event. Never blocks; the channel is unbounded so a slow/absent subscriber
    /// cannot stall whichever component is emitting (e.g. the monitor's poll loop).
    pub fn publish(&self, event: Event) {
        // The channel only disconnects if every receiver was dropped, which a shell that
        // cares about events would not do; if it happens there is nobody to tell anyway.
        let _ = self.tx.send(event);
    }

    /// Obtain a handle to drain events from. Clones share the same underlying queue (as in
    /// the teacher's `EventManager`): each event is delivered to exactly one drain, not
    /// broadcast to every clone.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.rx.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_events_are_observed_by_subscribers() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(Event::AuthStatusChanged(AuthStatus::Authenticated));

        match rx.try_recv().unwrap() {
            Event::AuthStatusChanged(status) => assert_eq!(status, AuthStatus::Authenticated),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::TrackSkipped(SkipRecord::new("id", "name", "artist")));
    }
}
