//! Interactive session driver
//!
//! Thin client loop around an established daemon connection: relay everything
//! the daemon sends to the local terminal, and forward keystrokes as control
//! signals. The wire protocol has exactly one inbound meaning (any byte
//! kills the child), so "restart" is a client-side sequence: kill, wait the
//! grace period, bootstrap a fresh daemon, and keep relaying.

use crate::daemon::client::{grace_period, obtain_connection};
use crate::identity::CommandIdentity;
use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Keypress poll tick
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for the daemon to close after a kill byte
const CLOSE_WAIT_BOUND: Duration = Duration::from_secs(5);

/// The byte written to request a kill. Any byte would do at the protocol
/// level; a fixed one keeps logs and tests readable.
pub const KILL_BYTE: u8 = b'k';

/// What a keypress asks the driver to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    Kill,
    Restart,
    Detach,
    Ignore,
}

fn classify_key(code: KeyCode, modifiers: KeyModifiers) -> KeyAction {
    if modifiers.contains(KeyModifiers::CONTROL) {
        return match code {
            KeyCode::Char('c') => KeyAction::Detach,
            _ => KeyAction::Ignore,
        };
    }
    match code {
        KeyCode::Char('k') | KeyCode::Char('q') => KeyAction::Kill,
        KeyCode::Char('r') => KeyAction::Restart,
        _ => KeyAction::Ignore,
    }
}

/// One attached client session
pub struct SessionDriver {
    identity: CommandIdentity,
    stream: UnixStream,
}

impl SessionDriver {
    pub fn new(identity: CommandIdentity, stream: UnixStream) -> Self {
        Self { identity, stream }
    }

    /// Drive the session until the daemon disconnects, the user detaches, or
    /// the user kills the child
    pub fn run(mut self) -> Result<()> {
        let interactive = atty::is(atty::Stream::Stdin);
        let sigterm = crate::signal::sigterm_flag()?;

        if interactive {
            println!(
                "warm: attached to '{}'  (k/q = kill, r = restart, ctrl-c = detach)",
                self.identity.display_command()
            );
        }

        let _raw = if interactive {
            Some(RawModeGuard::enter()?)
        } else {
            None
        };

        let mut relay = Relay::spawn(self.stream.try_clone()?, interactive);

        loop {
            if relay.finished() {
                break;
            }

            // Terminate-style signal: ask the daemon to kill before exiting
            if sigterm.load(Ordering::Relaxed) {
                let _ = self.stream.write_all(&[KILL_BYTE]);
                relay.wait_until_closed(CLOSE_WAIT_BOUND);
                break;
            }

            if !interactive {
                thread::sleep(EVENT_POLL_INTERVAL);
                continue;
            }

            if !event::poll(EVENT_POLL_INTERVAL)? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };

            match classify_key(key.code, key.modifiers) {
                KeyAction::Kill => {
                    status_line(interactive, "warm: killing child");
                    self.stream
                        .write_all(&[KILL_BYTE])
                        .context("failed to send kill byte")?;
                    relay.wait_until_closed(CLOSE_WAIT_BOUND);
                    break;
                }
                KeyAction::Restart => {
                    status_line(interactive, "warm: restarting child");
                    let _ = self.stream.write_all(&[KILL_BYTE]);
                    relay.wait_until_closed(CLOSE_WAIT_BOUND);
                    thread::sleep(grace_period());

                    self.stream = obtain_connection(&self.identity)
                        .context("failed to reattach after restart")?;
                    relay = Relay::spawn(self.stream.try_clone()?, interactive);
                }
                KeyAction::Detach => {
                    // Leave the daemon running; just stop watching
                    status_line(interactive, "warm: detached (daemon keeps running)");
                    return Ok(());
                }
                KeyAction::Ignore => {}
            }
        }

        status_line(interactive, "warm: daemon closed the connection");
        Ok(())
    }
}

/// Print a status line that renders correctly under raw mode
fn status_line(interactive: bool, message: &str) {
    if interactive {
        print!("\r\n{}\r\n", message);
        let _ = io::stdout().flush();
    } else {
        eprintln!("{}", message);
    }
}

/// Background thread copying daemon output to local stdout
struct Relay {
    finished: Arc<AtomicBool>,
}

impl Relay {
    /// Spawn the relay; `translate` rewrites `\n` to `\r\n` for raw mode
    fn spawn(mut stream: UnixStream, translate: bool) -> Self {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        thread::spawn(move || {
            let mut stdout = io::stdout();
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let result = if translate {
                            write_translated(&mut stdout, &chunk[..n])
                        } else {
                            stdout.write_all(&chunk[..n])
                        };
                        if result.is_err() {
                            break;
                        }
                        let _ = stdout.flush();
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            flag.store(true, Ordering::Relaxed);
        });

        Self { finished }
    }

    fn finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Wait (bounded) for the daemon-side close after a kill byte
    fn wait_until_closed(&self, bound: Duration) {
        let deadline = Instant::now() + bound;
        while !self.finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Raw mode carriage handling: terminals in raw mode do not return the
/// cursor on bare `\n`
fn write_translated(out: &mut impl Write, chunk: &[u8]) -> io::Result<()> {
    let mut rest = chunk;
    while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
        out.write_all(&rest[..pos])?;
        out.write_all(b"\r\n")?;
        rest = &rest[pos + 1..];
    }
    out.write_all(rest)
}

struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
