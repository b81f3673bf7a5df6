//! Warm daemon binary
//!
//! Runs the daemon role for one command identity: binds the identity-derived
//! socket, spawns the command, serves attached clients, and exits 0 after the
//! child is gone and everything is torn down. Normally launched detached by
//! the `warm` client's bootstrap path, but can be started by hand.

use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;
use std::process;
use warm::daemon::{socket, DaemonServer};
use warm::error::ServerError;
use warm::identity::CommandIdentity;

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

    let working_dir = CommandIdentity::resolve_working_dir(parsed.dir)?;
    let identity = CommandIdentity::new(parsed.program, parsed.args, working_dir);
    let socket_path = socket::socket_path(&identity)?;

    let mut server = DaemonServer::new(identity, socket_path);
    match server.run() {
        Ok(()) => Ok(()),
        Err(ServerError::BindConflict { path, .. }) => {
            // The address is the lock: losing the bind means another daemon
            // for this identity is already serving.
            eprintln!(
                "warmd: a daemon for this command is already running at {}",
                path.display()
            );
            process::exit(1);
        }
        Err(e) => bail!(e),
    }
}

struct ParsedArgs {
    dir: Option<PathBuf>,
    program: String,
    args: Vec<String>,
    show_help: bool,
}

fn parse_args(args: &[String]) -> Result<ParsedArgs, String> {
    let mut dir = None;
    let mut show_help = false;
    let mut command = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
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
        dir,
        program,
        args: command,
        show_help,
    })
}

fn print_usage() {
    println!("Warm daemon v0.1.0");
    println!();
    println!("Usage: warmd [--dir <path>] -- <command> [args...]");
    println!();
    println!("Options:");
    println!("  --dir <path>  Working directory for the command (default: current)");
    println!("  -h, --help    Show this help message");
    println!();
    println!("The daemon binds a socket derived from the command identity, runs the");
    println!("command once, and streams its output to every attached 'warm' client.");
    println!("It exits when the command does. Use 'warm -- <command>' instead of");
    println!("invoking warmd directly; warm starts a daemon when none is running.");
}
