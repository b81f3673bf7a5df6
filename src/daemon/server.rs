//! Warm daemon: one listener, one child, many attached sessions
//!
//! The daemon binds the identity-derived socket, spawns the supervised
//! command exactly once, and streams everything the child ever wrote to every
//! client that attaches. Lifecycle is one-shot: when the child exits (on its
//! own or via a client kill byte) the daemon tears everything down and exits.

use crate::error::ServerError;
use crate::identity::CommandIdentity;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Accept-loop tick while no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Back-off after an accept-layer error
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Read buffer size for the child stdout pump
const OUTPUT_CHUNK_SIZE: usize = 8192;

/// Identifier for one attached client session
pub type SessionId = u64;

/// Daemon lifecycle states
///
/// Starting covers bind + spawn; spawn failure is fatal and the daemon never
/// lingers bound with no child. Running ends only when the child exits, which
/// drains every session and terminates the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Output history plus the attached-session set
///
/// Both live behind one mutex on purpose: the producer appends and fans out
/// in a single critical section, and a new session replays and registers in
/// another, so each session observes the complete history followed by the
/// live tail with no gap or duplicate at the splice point.
struct FanOut {
    /// Every byte the child has written to stdout since daemon start.
    /// Append-only, unbounded; daemon lifetime is bounded by the child's.
    buffer: Vec<u8>,
    sessions: HashMap<SessionId, UnixStream>,
}

impl FanOut {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            sessions: HashMap::new(),
        }
    }

    /// Append a child output chunk and forward it to every live session
    fn broadcast(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        let mut dead = Vec::new();
        for (id, stream) in &mut self.sessions {
            if stream.write_all(chunk).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.sessions.remove(&id);
        }
    }

    /// Replay the full history to a new session, then register it for live
    /// output. A session that dies mid-replay is never registered.
    fn attach(&mut self, id: SessionId, mut stream: UnixStream) -> bool {
        if stream.write_all(&self.buffer).is_err() {
            return false;
        }
        self.sessions.insert(id, stream);
        true
    }

    fn detach(&mut self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Force-close every session (Draining: no graceful flush)
    fn close_all(&mut self) {
        for (_, stream) in self.sessions.drain() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// The daemon process manager
///
/// One instance per daemon process, constructed at startup; owns the listener,
/// the child, and the fan-out state as fields.
pub struct DaemonServer {
    identity: CommandIdentity,
    socket_path: PathBuf,
    state: DaemonState,
    listener: Option<UnixListener>,
    fan_out: Arc<Mutex<FanOut>>,
    /// Set by SIGTERM/SIGINT; the accept loop turns it into a child-group kill
    shutdown: Arc<AtomicBool>,
    /// True once we own the socket file (guards cleanup on bind conflict)
    bound: bool,
    next_session_id: SessionId,
}

impl DaemonServer {
    /// Create a daemon for `identity`, rendezvousing at `socket_path`
    pub fn new(identity: CommandIdentity, socket_path: PathBuf) -> Self {
        Self {
            identity,
            socket_path,
            state: DaemonState::Starting,
            listener: None,
            fan_out: Arc::new(Mutex::new(FanOut::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            bound: false,
            next_session_id: 0,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Run the daemon to completion: bind, spawn, serve, drain
    ///
    /// Returns only after the child has exited and every session and the
    /// listener have been torn down; the caller then exits 0. A bind or spawn
    /// failure comes back as an error with nothing left behind on disk.
    pub fn run(&mut self) -> Result<(), ServerError> {
        if let Err(e) = crate::signal::register_shutdown_flag(&self.shutdown) {
            eprintln!("warmd: failed to install signal handlers: {}", e);
        }

        self.bind_socket()?;

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                // No partial state: a daemon must not linger bound with no child
                self.release_socket();
                return Err(e);
            }
        };

        self.state = DaemonState::Running;
        eprintln!(
            "warmd: supervising '{}' (pid {}) on {}",
            self.identity.display_command(),
            child.id(),
            self.socket_path.display()
        );

        self.accept_loop(&mut child);
        self.drain();

        Ok(())
    }

    /// Bind the rendezvous socket
    ///
    /// Never unlinks an existing path first: bind exclusivity on the address
    /// is the single-daemon-per-identity lock, and stale artifacts are the
    /// client-side orchestrator's to remove.
    fn bind_socket(&mut self) -> Result<(), ServerError> {
        let listener = UnixListener::bind(&self.socket_path).map_err(|source| {
            if source.kind() == ErrorKind::AddrInUse {
                ServerError::BindConflict {
                    path: self.socket_path.clone(),
                    source,
                }
            } else {
                ServerError::Bind {
                    path: self.socket_path.clone(),
                    source,
                }
            }
        })?;
        self.bound = true;

        // Socket permissions 0600 (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms_result = fs::metadata(&self.socket_path).and_then(|meta| {
                let mut perms = meta.permissions();
                perms.set_mode(0o600);
                fs::set_permissions(&self.socket_path, perms)
            });
            if let Err(source) = perms_result {
                drop(listener);
                self.release_socket();
                return Err(ServerError::Bind {
                    path: self.socket_path.clone(),
                    source,
                });
            }
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Spawn the supervised command as its own process-group leader
    ///
    /// Group leadership is what makes tree kill possible: signaling the group
    /// reaps stray descendants, not just the direct child. Stdout is piped to
    /// the output pump; stderr stays on the daemon's own stderr (the log).
    fn spawn_child(&mut self) -> Result<Child, ServerError> {
        let mut command = Command::new(&self.identity.program);
        command
            .args(&self.identity.args)
            .current_dir(&self.identity.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|source| ServerError::ChildSpawn {
            command: self.identity.display_command(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_output_pump(stdout);
        }

        Ok(child)
    }

    /// Single producer: read child stdout, append + fan out under one lock
    fn spawn_output_pump(&self, mut stdout: ChildStdout) {
        let fan_out = Arc::clone(&self.fan_out);

        thread::spawn(move || {
            let mut chunk = [0u8; OUTPUT_CHUNK_SIZE];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => fan_out.lock().unwrap().broadcast(&chunk[..n]),
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
    }

    /// Main accept loop: poll for connections, the shutdown flag, and child
    /// exit on a 10ms tick. Returns when the child is gone.
    fn accept_loop(&mut self, child: &mut Child) {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return,
        };

        if let Err(e) = listener.set_nonblocking(true) {
            // Without nonblocking accept the loop cannot watch the child;
            // treat as fatal and drain.
            eprintln!("warmd: failed to configure listener: {}", e);
            kill_child_group(child);
            let _ = child.wait();
            return;
        }

        let child_pid = Pid::from_raw(child.id() as i32);

        loop {
            // A termination signal kills the child group; teardown then rides
            // the normal child-exit path below.
            if self.shutdown.swap(false, Ordering::Relaxed) {
                eprintln!("warmd: termination signal received, killing child");
                kill_child_group(child);
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    eprintln!("warmd: child exited: {}", status);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    eprintln!("warmd: failed to poll child: {}", e);
                    break;
                }
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        eprintln!("warmd: failed to configure session socket: {}", e);
                        continue;
                    }
                    self.accept_session(stream, child_pid);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    // One bad accept must not take the daemon down
                    eprintln!("warmd: accept error: {}", e);
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }

        drop(listener);
    }

    /// Register a new session: replay history, then watch it for kill bytes
    fn accept_session(&mut self, stream: UnixStream, child_pid: Pid) {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                eprintln!("warmd: failed to clone session socket: {}", e);
                return;
            }
        };

        let attached = self.fan_out.lock().unwrap().attach(id, stream);
        if !attached {
            // Client vanished during replay
            return;
        }
        eprintln!("warmd: session {} attached", id);

        let fan_out = Arc::clone(&self.fan_out);
        thread::spawn(move || {
            session_reader(id, reader, child_pid, fan_out);
        });
    }

    /// Draining: force-close every session, close the listener, unlink the
    /// socket. The caller exits 0 afterwards.
    fn drain(&mut self) {
        self.state = DaemonState::Draining;

        let open = self.fan_out.lock().unwrap().session_count();
        if open > 0 {
            eprintln!("warmd: disconnecting {} session(s)", open);
        }
        self.fan_out.lock().unwrap().close_all();

        self.listener = None;
        self.release_socket();

        self.state = DaemonState::Terminated;
        eprintln!("warmd: terminated");
    }

    /// Unlink the socket file if this daemon owns it
    fn release_socket(&mut self) {
        if !self.bound {
            return;
        }
        self.bound = false;
        self.listener = None;
        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                eprintln!("warmd: failed to remove socket file: {}", e);
            }
        }
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        // Only if we own the file: on a bind conflict the socket belongs to
        // the daemon that won the bind.
        self.release_socket();
    }
}

/// Blocking per-session reader: any inbound byte is a kill command for the
/// whole child process tree; EOF is a plain disconnect.
fn session_reader(
    id: SessionId,
    mut stream: UnixStream,
    child_pid: Pid,
    fan_out: Arc<Mutex<FanOut>>,
) {
    let mut inbound = [0u8; 64];
    loop {
        match stream.read(&mut inbound) {
            Ok(0) => {
                eprintln!("warmd: session {} disconnected", id);
                break;
            }
            Ok(_) => {
                eprintln!("warmd: session {} requested kill", id);
                kill_process_group(child_pid);
                break;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    fan_out.lock().unwrap().detach(id);
}

/// Kill the child's entire process group (the child is its group leader)
///
/// Best effort: a group that is already gone is not an error, and any other
/// failure is logged without blocking the drain path.
fn kill_process_group(child_pid: Pid) {
    let group = Pid::from_raw(-child_pid.as_raw());
    if let Err(errno) = signal::kill(group, Signal::SIGKILL) {
        if errno != nix::errno::Errno::ESRCH {
            eprintln!(
                "warmd: failed to kill process group {}: {}",
                child_pid, errno
            );
        }
    }
}

fn kill_child_group(child: &Child) {
    kill_process_group(Pid::from_raw(child.id() as i32));
}
