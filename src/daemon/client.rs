//! Client-side connector and attach/bootstrap orchestrator
//!
//! `connect` makes exactly one connection attempt and classifies its failure;
//! `obtain_connection` layers the two-phase "connect, else spawn-and-
//! reconnect" pattern on top. No coordination service is involved: bind
//! exclusivity on the rendezvous socket is the single-daemon-per-identity
//! lock, so the worst a racing bootstrap can do is lose the bind and exit.

use crate::daemon::socket;
use crate::error::ConnectError;
use crate::identity::CommandIdentity;
use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Grace period between spawning a daemon and the reconnect attempt
const BOOTSTRAP_GRACE: Duration = Duration::from_millis(200);

/// Environment override for the grace period, in milliseconds
pub const GRACE_ENV: &str = "WARM_GRACE_MS";

/// Name of the daemon binary, expected next to the client binary
const DAEMON_BINARY: &str = "warmd";

/// Make a single connection attempt to the rendezvous socket
///
/// No retry. `NotFound` means no artifact exists at all; `ConnectionRefused`
/// means a socket file exists but nothing is accepting (a stale artifact the
/// orchestrator should remove). Everything else propagates as a transport
/// failure and is never a signal to bootstrap.
pub fn connect(path: &Path) -> Result<UnixStream, ConnectError> {
    match UnixStream::connect(path) {
        Ok(stream) => Ok(stream),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ConnectError::NotListening {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => Err(ConnectError::StaleArtifact {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(ConnectError::Transport(e)),
    }
}

/// The bootstrap/restart grace period (`WARM_GRACE_MS` override)
pub fn grace_period() -> Duration {
    env::var(GRACE_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(BOOTSTRAP_GRACE)
}

/// Obtain a connection to the daemon for `identity`, bootstrapping one if
/// nobody is listening
///
/// 1. Try to connect.
/// 2. On a stale artifact, unlink it; on nothing-listening, fall through; on
///    any other failure, propagate without bootstrapping.
/// 3. Launch a detached daemon for the identity.
/// 4. Wait the grace period for its listener to bind.
/// 5. Try to connect once more; no further retries.
pub fn obtain_connection(identity: &CommandIdentity) -> Result<UnixStream> {
    let path = socket::socket_path(identity)?;

    match connect(&path) {
        Ok(stream) => return Ok(stream),
        Err(ConnectError::StaleArtifact { .. }) => {
            fs::remove_file(&path).with_context(|| {
                format!("failed to remove stale socket {}", path.display())
            })?;
        }
        Err(ConnectError::NotListening { .. }) => {}
        Err(e) => return Err(e).context("could not reach daemon"),
    }

    spawn_daemon(identity)?;
    std::thread::sleep(grace_period());

    connect(&path).with_context(|| {
        format!(
            "daemon did not come up at {} after bootstrap",
            path.display()
        )
    })
}

/// Launch a new daemon process for `identity`, fully detached
///
/// The daemon must outlive this client: it runs in its own process group with
/// stdin closed, and its stdout/stderr are appended to the per-identity log
/// file so nothing stays attached to the launching terminal.
pub fn spawn_daemon(identity: &CommandIdentity) -> Result<()> {
    let daemon_path = daemon_binary_path()?;
    let log_path = socket::log_path(identity)?;

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open daemon log {}", log_path.display()))?;
    let log_err = log_file
        .try_clone()
        .context("failed to clone daemon log handle")?;

    Command::new(&daemon_path)
        .arg("--dir")
        .arg(&identity.working_dir)
        .arg("--")
        .arg(&identity.program)
        .args(&identity.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed to launch {}", daemon_path.display()))?;

    Ok(())
}

/// Locate the daemon binary next to the current executable
fn daemon_binary_path() -> Result<PathBuf> {
    let exe_path = env::current_exe().context("cannot determine current executable path")?;
    let exe_dir = exe_path
        .parent()
        .context("cannot determine executable directory")?;

    let sibling = exe_dir.join(DAEMON_BINARY);
    if sibling.exists() {
        return Ok(sibling);
    }

    // Harness binaries live one level below the built executables
    if let Some(parent) = exe_dir.parent() {
        let candidate = parent.join(DAEMON_BINARY);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Ok(sibling)
}
