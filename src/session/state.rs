//! Connection state model shared by broker and client sessions.

use std::fmt;
use std::path::PathBuf;

/// Lifecycle position of a single logical MQTT endpoint.
///
/// Transitions are driven by session commands (Start/Stop, Connect/Disconnect)
/// and by the engine (connect completion, network loss). A failed attempt
/// settles back on [`SessionStatus::Idle`] so the command can simply be
/// retried; the failure itself travels in the `StateChanged` event.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// No engine attached; Start/Connect may be issued.
    #[default]
    Idle,
    /// Start/Connect issued, completion pending.
    Connecting,
    /// Endpoint is live (broker listening, client connected).
    Connected,
    /// Stop/Disconnect issued, engine ack pending.
    Disconnecting,
    /// Engine-initiated loss (network failure, peer close). Retriable.
    Disconnected,
    /// Command failed; carried in events, stored status returns to Idle.
    Failed,
}

impl SessionStatus {
    /// A Start/Connect or Stop/Disconnect is still resolving.
    pub fn in_flight(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Disconnecting)
    }

    /// A fresh Start/Connect may be issued from this status.
    pub fn accepts_start(self) -> bool {
        matches!(
            self,
            SessionStatus::Idle | SessionStatus::Disconnected | SessionStatus::Failed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Connected => "Connected",
            SessionStatus::Disconnecting => "Disconnecting",
            SessionStatus::Disconnected => "Disconnected",
            SessionStatus::Failed => "Failed",
        };
        write!(f, "{}", label)
    }
}

/// Snapshot of a session's state, handed out by `state()` and carried in
/// `StateChanged` events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: SessionStatus,
    /// Target (client) or bound (broker) endpoint, once one was issued.
    pub endpoint: Option<Endpoint>,
    /// Human-readable reason behind the most recent Failed/Disconnected.
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }
}

/// Remote broker target for a [`ClientSession`](crate::session::ClientSession).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            credentials: None,
            tls: None,
        }
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            tls: None,
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn tls(mut self, ca_file: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsOptions {
            ca_file: ca_file.into(),
        });
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Username/password pair sent in the CONNECT packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Client-side TLS settings. The CA file is loaded at connect time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_idle() {
        assert_eq!(SessionStatus::default(), SessionStatus::Idle);
        assert!(ConnectionState::default().endpoint.is_none());
    }

    #[test]
    fn start_accepted_only_when_settled() {
        assert!(SessionStatus::Idle.accepts_start());
        assert!(SessionStatus::Disconnected.accepts_start());
        assert!(SessionStatus::Failed.accepts_start());
        assert!(!SessionStatus::Connecting.accepts_start());
        assert!(!SessionStatus::Connected.accepts_start());
        assert!(!SessionStatus::Disconnecting.accepts_start());
    }

    #[test]
    fn in_flight_covers_pending_commands() {
        assert!(SessionStatus::Connecting.in_flight());
        assert!(SessionStatus::Disconnecting.in_flight());
        assert!(!SessionStatus::Connected.in_flight());
    }

    #[test]
    fn endpoint_display_and_builder() {
        let endpoint = Endpoint::new("broker.local", 8883)
            .credentials("user", "pw")
            .tls("/etc/ssl/ca.pem");
        assert_eq!(endpoint.to_string(), "broker.local:8883");
        assert_eq!(endpoint.credentials.as_ref().map(|c| c.username.as_str()), Some("user"));
        assert!(endpoint.tls.is_some());
    }
}
