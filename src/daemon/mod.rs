/// Warm daemon implementation: persistent child processes behind
/// identity-derived rendezvous sockets
///
/// - `socket`: runtime directory resolution and per-identity socket/log paths
/// - `server`: the daemon process manager (listener, child, output fan-out)
/// - `client`: connector classification and the attach/bootstrap orchestrator
pub mod client;
pub mod server;
pub mod socket;

pub use client::{connect, obtain_connection, spawn_daemon};
pub use server::{DaemonServer, DaemonState, SessionId};
