//! Tenant connection state machine.

use serde::{Deserialize, Serialize};

/// Connection state of one tenant, derived from the WCL.
///
/// `Ready` is the only state in which send/edit/revoke/presence/group
/// operations succeed. `Disconnected` is recoverable by auto-reconnect;
/// `Failed` marks a permanent auth failure (token invalidated on device);
/// `Stopped` is an operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Unknown,
    /// No connection attached.
    UnPrepared,
    /// Not verified (never logged in).
    UnVerified,
    Starting,
    Connecting,
    Stopping,
    Stopped,
    Restarting,
    /// Socket is up; logging in with saved keys or waiting for a QR scan.
    Connected,
    /// Fetching offline messages from the servers.
    Fetching,
    /// Fully operational.
    Ready,
    Halting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Used by the health endpoints: a tenant is healthy when fully
    /// operational or deliberately stopped.
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Stopped)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::UnPrepared => "unprepared",
            ConnectionState::UnVerified => "unverified",
            ConnectionState::Starting => "starting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Restarting => "restarting",
            ConnectionState::Connected => "connected",
            ConnectionState::Fetching => "fetching",
            ConnectionState::Ready => "ready",
            ConnectionState::Halting => "halting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_states() {
        assert!(ConnectionState::Ready.is_healthy());
        assert!(ConnectionState::Stopped.is_healthy());
        assert!(!ConnectionState::Connecting.is_healthy());
        assert!(!ConnectionState::Failed.is_healthy());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Ready).unwrap(),
            "\"ready\""
        );
    }
}
