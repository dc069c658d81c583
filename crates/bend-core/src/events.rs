//! Session event system.
//!
//! Connection lifecycle changes that callers may want to react to without
//! polling the state channel. Samples are not events; they travel on the
//! [`crate::StreamBus`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use bend_types::{DeviceHandle, SampleRate};

/// Observable state of a [`crate::DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl SessionState {
    /// Connected, or trying to get back to connected after link loss.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnecting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Events emitted by a [`crate::DeviceSession`].
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged { state: SessionState },
    /// Link established and configured.
    Connected {
        device: DeviceHandle,
        sample_rate: SampleRate,
        stretch: bool,
        /// False when notifications could not be started.
        streaming: bool,
    },
    /// Link closed.
    Disconnected {
        device: DeviceHandle,
        reason: DisconnectReason,
    },
    /// Notifications could not be started; the session stays connected.
    NotificationsUnavailable { device: DeviceHandle, error: String },
    /// Automatic reconnection started after link loss.
    ReconnectStarted { device: DeviceHandle },
    /// Automatic reconnection succeeded.
    ReconnectSucceeded { device: DeviceHandle },
    /// Automatic reconnection used up its retry budget.
    ReconnectFailed { device: DeviceHandle, error: String },
}

/// Reason for disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Normal disconnection requested by user.
    UserRequested,
    /// The link dropped without being asked to.
    LinkLost,
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
