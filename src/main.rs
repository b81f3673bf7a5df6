//! Warm client binary
//!
//! Attaches the terminal to the daemon serving a command identity, starting
//! one when nobody is listening. Also hosts the kill/restart/status modes,
//! which drive the same one-byte protocol from the command line instead of
//! from a keypress.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use std::env;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use warm::daemon::client::{connect, grace_period, obtain_connection};
use warm::daemon::socket;
use warm::error::ConnectError;
use warm::identity::CommandIdentity;
use warm::session::{SessionDriver, KILL_BYTE};

/// Upper bound on waiting for a killed daemon to close the connection
const KILL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Attach,
    Kill,
    Restart,
    Status,
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let parsed = match parse_args(&args[1..]) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            process::exit(2);
        }
    };

    if parsed.show_help {
        print_usage();
        return Ok(());
    }

    let working_dir = CommandIdentity::resolve_working_dir(parsed.dir)
        .context("failed to resolve working directory")?;
    let identity = CommandIdentity::new(parsed.program, parsed.args, working_dir);

    match parsed.mode {
        Mode::Attach => attach(identity),
        Mode::Kill => kill(&identity),
        Mode::Restart => restart(identity),
        Mode::Status => status(&identity),
    }
}

/// Default mode: obtain a connection (bootstrapping if needed) and hand it to
/// the session driver
fn attach(identity: CommandIdentity) -> Result<()> {
    let stream = obtain_connection(&identity)?;
    SessionDriver::new(identity, stream).run()
}

/// Tell a running daemon to kill its child; a no-op when none is running
fn kill(identity: &CommandIdentity) -> Result<()> {
    let path = socket::socket_path(identity)?;

    let mut stream = match connect(&path) {
        Ok(stream) => stream,
        Err(e) if e.is_recoverable() => {
            println!("warm: no daemon running for '{}'", identity.display_command());
            return Ok(());
        }
        Err(e) => return Err(e).context("could not reach daemon"),
    };

    stream
        .write_all(&[KILL_BYTE])
        .context("failed to send kill byte")?;
    drain_to_eof(&mut stream);

    println!("warm: killed '{}'", identity.display_command());
    Ok(())
}

/// Kill the current daemon (if any), wait the grace period, then attach to a
/// freshly bootstrapped one
fn restart(identity: CommandIdentity) -> Result<()> {
    let path = socket::socket_path(&identity)?;

    match connect(&path) {
        Ok(mut stream) => {
            let _ = stream.write_all(&[KILL_BYTE]);
            drain_to_eof(&mut stream);
            thread::sleep(grace_period());
        }
        Err(e) if e.is_recoverable() => {}
        Err(e) => return Err(e).context("could not reach daemon"),
    }

    attach(identity)
}

/// Report whether a daemon is serving this identity
fn status(identity: &CommandIdentity) -> Result<()> {
    let path = socket::socket_path(identity)?;

    match connect(&path) {
        Ok(_stream) => {
            println!(
                "warm: daemon for '{}' is running at {}",
                identity.display_command(),
                path.display()
            );
        }
        Err(ConnectError::StaleArtifact { .. }) => {
            println!(
                "warm: stale socket at {} (daemon is gone; it will be cleaned up on next attach)",
                path.display()
            );
        }
        Err(ConnectError::NotListening { .. }) => {
            println!(
                "warm: no daemon running for '{}'",
                identity.display_command()
            );
        }
        Err(e) => return Err(e).context("could not reach daemon"),
    }

    Ok(())
}

/// Read and discard until the daemon closes the connection, so teardown has
/// happened before we report success
fn drain_to_eof(stream: &mut UnixStream) {
    let _ = stream.set_read_timeout(Some(KILL_DRAIN_TIMEOUT));
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[derive(Debug)]
struct ParsedArgs {
    mode: Mode,
    dir: Option<PathBuf>,
    program: String,
    args: Vec<String>,
    show_help: bool,
}

fn parse_args(args: &[String]) -> Result<ParsedArgs, String> {
    let mut mode = Mode::Attach;
    let mut dir = None;
    let mut show_help = false;
    let mut command = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--kill" | "-k" => {
                mode = Mode::Kill;
                i += 1;
            }
            "--restart" | "-r" => {
                mode = Mode::Restart;
                i += 1;
            }
            "--status" | "-s" => {
                mode = Mode::Status;
                i += 1;
            }
            "--dir" => {
                if i + 1 >= args.len() {
                    return Err("--dir requires a path".to_string());
                }
                dir = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "-h" | "--help" => {
                show_help = true;
                i += 1;
            }
            "--" => {
                command.extend(args[i + 1..].iter().cloned());
                break;
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown option '{}'", flag));
            }
            _ => {
                command.extend(args[i..].iter().cloned());
                break;
            }
        }
    }

    if show_help {
        return Ok(ParsedArgs {
            mode,
            dir,
            program: String::new(),
            args: Vec::new(),
            show_help,
        });
    }

    if command.is_empty() {
        return Err("no command supplied".to_string());
    }

    let program = command.remove(0);
    Ok(ParsedArgs {
        mode,
        dir,
        program,
        args: command,
        show_help,
    })
}

fn print_usage() {
    println!("Warm v0.1.0 - keep expensive commands warm");
    println!();
    println!("Usage: warm [OPTIONS] [--] <command> [args...]");
    println!();
    println!("Attaches to the daemon running <command>, starting one if needed.");
    println!("Every attached terminal sees the command's full output history");
    println!("followed by its live output.");
    println!();
    println!("Options:");
    println!("  -k, --kill     Kill the daemon's command and exit");
    println!("  -r, --restart  Kill, then attach to a fresh daemon");
    println!("  -s, --status   Report whether a daemon is running");
    println!("  --dir <path>   Working directory for the command (default: current)");
    println!("  -h, --help     Show this help message");
    println!();
    println!("Keys while attached:");
    println!("  k or q         Kill the command (daemon exits)");
    println!("  r              Restart the command under a fresh daemon");
    println!("  ctrl-c         Detach, leaving the daemon running");
    println!();
    println!("Examples:");
    println!("  warm -- cargo watch          # start or join the watcher");
    println!("  warm --status -- cargo watch # is it running?");
    println!("  warm --kill -- cargo watch   # tear it down");
}
