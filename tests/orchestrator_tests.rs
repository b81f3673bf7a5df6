//! Attach/bootstrap orchestrator tests against the real `warmd` binary.
//!
//! These spawn detached daemons, so they pin the runtime directory to a
//! tempdir via WARM_RUNTIME_DIR. The variable is process-wide, so every test
//! here serializes on one lock.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use warm::daemon::client::{connect, obtain_connection};
use warm::daemon::socket;
use warm::error::ConnectError;
use warm::identity::CommandIdentity;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn shell_identity(script: &str) -> CommandIdentity {
    // Canonicalized so the spawned warmd, which canonicalizes its --dir,
    // derives the identical address
    let dir = std::env::temp_dir().canonicalize().unwrap();
    CommandIdentity::new("sh", vec!["-c".to_string(), script.to_string()], dir)
}

fn read_exact(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn drain_to_eof(stream: &mut UnixStream) {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

/// Send a kill byte and wait for the daemon to finish tearing down
fn kill_and_wait(mut stream: UnixStream, path: &Path) {
    let _ = stream.write_all(b"x");
    drain_to_eof(&mut stream);
    drop(stream);

    let deadline = Instant::now() + Duration::from_secs(5);
    while path.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
}

/// NotListening bootstraps a daemon; the second connect attempt reaches it
#[test]
fn test_bootstrap_when_nothing_is_listening() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let runtime = tempfile::TempDir::new().unwrap();
    std::env::set_var(socket::RUNTIME_DIR_ENV, runtime.path());

    let identity = shell_identity("echo hi; sleep 30");
    let path = socket::socket_path(&identity).unwrap();
    assert!(matches!(
        connect(&path),
        Err(ConnectError::NotListening { .. })
    ));

    let mut stream = obtain_connection(&identity).expect("bootstrap failed");
    assert_eq!(read_exact(&mut stream, 3), b"hi\n");

    kill_and_wait(stream, &path);
    assert!(!path.exists());
    std::env::remove_var(socket::RUNTIME_DIR_ENV);
}

/// A stale socket artifact is removed before bootstrapping
#[test]
fn test_stale_artifact_is_removed_and_replaced() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let runtime = tempfile::TempDir::new().unwrap();
    std::env::set_var(socket::RUNTIME_DIR_ENV, runtime.path());

    let identity = shell_identity("echo fresh; sleep 30");
    let path = socket::socket_path(&identity).unwrap();

    // Leave a dead socket file at the exact derived address
    drop(UnixListener::bind(&path).unwrap());
    assert!(matches!(
        connect(&path),
        Err(ConnectError::StaleArtifact { .. })
    ));

    let mut stream = obtain_connection(&identity).expect("stale recovery failed");
    assert_eq!(read_exact(&mut stream, 6), b"fresh\n");

    kill_and_wait(stream, &path);
    std::env::remove_var(socket::RUNTIME_DIR_ENV);
}

/// After a kill, a fresh bootstrap serves an empty replay buffer: the new
/// daemon shares nothing with the old one
#[test]
fn test_restart_starts_with_empty_history() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let runtime = tempfile::TempDir::new().unwrap();
    std::env::set_var(socket::RUNTIME_DIR_ENV, runtime.path());

    // Emits only after a long delay, so a fresh attach sees an empty buffer
    let identity = shell_identity("sleep 20; echo too-late");
    let path = socket::socket_path(&identity).unwrap();

    let first = obtain_connection(&identity).expect("first bootstrap failed");
    kill_and_wait(first, &path);
    assert!(!path.exists(), "old daemon left its socket behind");

    let mut second = obtain_connection(&identity).expect("re-bootstrap failed");
    second
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    // Empty replay: the read must time out rather than yield old output
    let mut buf = [0u8; 64];
    match second.read(&mut buf) {
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
        Ok(0) => panic!("fresh daemon closed the connection immediately"),
        Ok(n) => panic!("fresh daemon replayed stale output: {:?}", &buf[..n]),
        Err(e) => panic!("unexpected read error: {}", e),
    }

    kill_and_wait(second, &path);
    std::env::remove_var(socket::RUNTIME_DIR_ENV);
}

/// Two near-simultaneous orchestrator calls end up sharing one daemon: the
/// bind loser exits and both connections see the same child
#[test]
fn test_concurrent_bootstrap_yields_one_daemon() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let runtime = tempfile::TempDir::new().unwrap();
    std::env::set_var(socket::RUNTIME_DIR_ENV, runtime.path());

    let identity = shell_identity("echo shared; sleep 30");
    let path = socket::socket_path(&identity).unwrap();

    let identity_clone = identity.clone();
    let racer = thread::spawn(move || obtain_connection(&identity_clone));
    let mut a = obtain_connection(&identity).expect("first orchestrator failed");
    let mut b = racer.join().unwrap().expect("second orchestrator failed");

    // Both observe the one child's output; "shared" is printed exactly once
    // per daemon, so each stream replaying it proves a single shared daemon
    assert_eq!(read_exact(&mut a, 7), b"shared\n");
    assert_eq!(read_exact(&mut b, 7), b"shared\n");

    drop(b);
    kill_and_wait(a, &path);
    std::env::remove_var(socket::RUNTIME_DIR_ENV);
}
