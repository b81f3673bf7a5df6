//! Rendezvous socket and log file placement
//!
//! Socket names are pure functions of the command identity; directory
//! resolution is the only part that touches the filesystem. The runtime
//! directory is private to the user (0700) and the preference order is
//! `WARM_RUNTIME_DIR`, then `$XDG_RUNTIME_DIR/warm`, then `~/.warm`.

use crate::identity::CommandIdentity;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Environment override for the socket/log directory
pub const RUNTIME_DIR_ENV: &str = "WARM_RUNTIME_DIR";

/// File name of the rendezvous socket for an identity (pure)
pub fn socket_file_name(identity: &CommandIdentity) -> String {
    format!("warm-{}.sock", identity.digest())
}

/// File name of the daemon log for an identity (pure)
pub fn log_file_name(identity: &CommandIdentity) -> String {
    format!("warm-{}.log", identity.digest())
}

/// Named-pipe form of the rendezvous address on Windows-class platforms,
/// which have no Unix-domain socket at a stable filesystem location
#[cfg(windows)]
pub fn pipe_name(identity: &CommandIdentity) -> String {
    format!(r"\\.\pipe\warm-{}", identity.digest())
}

/// Resolve (and create, 0700) the directory holding sockets and logs
pub fn runtime_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var(RUNTIME_DIR_ENV) {
        return ensure_private_dir(PathBuf::from(dir));
    }

    if let Ok(dir) = env::var("XDG_RUNTIME_DIR") {
        return ensure_private_dir(PathBuf::from(dir).join("warm"));
    }

    let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
    ensure_private_dir(home.join(".warm"))
}

/// Full socket path for an identity
pub fn socket_path(identity: &CommandIdentity) -> Result<PathBuf> {
    Ok(runtime_dir()?.join(socket_file_name(identity)))
}

/// Full daemon log path for an identity
pub fn log_path(identity: &CommandIdentity) -> Result<PathBuf> {
    Ok(runtime_dir()?.join(log_file_name(identity)))
}

fn ensure_private_dir(dir: PathBuf) -> Result<PathBuf> {
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create runtime directory {}", dir.display()))?;

        // Owner-only: the socket grants control over the supervised process
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&dir)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(&dir, perms)?;
        }
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(program: &str, args: &[&str], dir: &str) -> CommandIdentity {
        CommandIdentity::new(
            program,
            args.iter().map(|s| s.to_string()).collect(),
            PathBuf::from(dir),
        )
    }

    #[test]
    fn test_socket_file_name_is_stable() {
        let a = identity("cargo", &["watch"], "/src/project");
        let b = identity("cargo", &["watch"], "/src/project");
        assert_eq!(socket_file_name(&a), socket_file_name(&b));
        assert!(socket_file_name(&a).starts_with("warm-"));
        assert!(socket_file_name(&a).ends_with(".sock"));
    }

    #[test]
    fn test_socket_and_log_share_digest() {
        let id = identity("cargo", &["watch"], "/src/project");
        let sock = socket_file_name(&id);
        let log = log_file_name(&id);
        assert_eq!(
            sock.trim_end_matches(".sock"),
            log.trim_end_matches(".log")
        );
    }

    #[test]
    fn test_different_identities_different_sockets() {
        let a = identity("cargo", &["watch"], "/src/project");
        let b = identity("cargo", &["watch"], "/src/other");
        assert_ne!(socket_file_name(&a), socket_file_name(&b));
    }

    #[test]
    fn test_runtime_dir_env_override() {
        let scratch = tempfile::TempDir::new().unwrap();
        let override_dir = scratch.path().join("custom");
        env::set_var(RUNTIME_DIR_ENV, &override_dir);

        let resolved = runtime_dir().unwrap();
        env::remove_var(RUNTIME_DIR_ENV);

        assert_eq!(resolved, override_dir);
        assert!(override_dir.is_dir());
    }
}
