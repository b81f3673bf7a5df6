//! Structured error types for warm
//!
//! The connect-side taxonomy drives the attach/bootstrap decision: the two
//! "nobody listening" variants are recovered locally by the orchestrator,
//! while transport failures propagate to the caller unmodified.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from a single connection attempt to a rendezvous socket
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No socket file exists at the address; nothing to remove before
    /// bootstrapping a daemon
    #[error("no daemon is listening at {}", path.display())]
    NotListening { path: PathBuf },

    /// A socket file exists but nothing accepts on it; the artifact must be
    /// removed before bootstrapping
    #[error("stale socket at {}", path.display())]
    StaleArtifact { path: PathBuf },

    /// Any other connection-layer failure; never interpreted as "start a
    /// daemon"
    #[error("failed to connect to daemon: {0}")]
    Transport(#[source] io::Error),
}

impl ConnectError {
    /// True for the two failure shapes the orchestrator recovers from by
    /// bootstrapping a fresh daemon
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectError::NotListening { .. } | ConnectError::StaleArtifact { .. }
        )
    }
}

/// Errors from the daemon's bind-and-spawn startup sequence
#[derive(Debug, Error)]
pub enum ServerError {
    /// Another daemon already owns the rendezvous address
    #[error("another daemon already owns {}: {source}", path.display())]
    BindConflict {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Bind failed for a reason other than an existing owner
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The supervised command could not be spawned; fatal to this daemon
    /// instance, no retry
    #[error("failed to spawn '{command}': {source}")]
    ChildSpawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let not_listening = ConnectError::NotListening {
            path: PathBuf::from("/tmp/warm.sock"),
        };
        let stale = ConnectError::StaleArtifact {
            path: PathBuf::from("/tmp/warm.sock"),
        };
        let transport =
            ConnectError::Transport(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));

        assert!(not_listening.is_recoverable());
        assert!(stale.is_recoverable());
        assert!(!transport.is_recoverable());
    }

    #[test]
    fn test_display_carries_path() {
        let err = ConnectError::StaleArtifact {
            path: PathBuf::from("/run/warm/warm-deadbeef.sock"),
        };
        assert!(err.to_string().contains("warm-deadbeef.sock"));
    }

    #[test]
    fn test_bind_conflict_display() {
        let err = ServerError::BindConflict {
            path: PathBuf::from("/tmp/warm.sock"),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        let text = err.to_string();
        assert!(text.contains("already owns"));
        assert!(text.contains("/tmp/warm.sock"));
    }
}
