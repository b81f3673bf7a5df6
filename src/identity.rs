//! Command identity and rendezvous digest derivation
//!
//! A daemon is addressed by what it runs: the executable, the argument list,
//! and the working directory. Hashing those three fields gives every command
//! a stable socket name, so repeated invocations of the same command find the
//! same daemon and different commands never collide by accident.

use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;

/// Hex characters of the digest used in socket/log file names (128 bits)
const DIGEST_LEN: usize = 32;

/// The identity of a supervised command
///
/// Two identities with identical fields derive the identical rendezvous
/// digest; a difference in any field (including argument order) derives a
/// different one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandIdentity {
    /// Executable path or name, resolved by the OS at spawn time
    pub program: String,
    /// Arguments in order
    pub args: Vec<String>,
    /// Working directory the child runs in
    pub working_dir: PathBuf,
}

impl CommandIdentity {
    /// Create an identity from explicit fields
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir,
        }
    }

    /// Create an identity rooted at the caller's current directory
    pub fn from_current_dir(program: impl Into<String>, args: Vec<String>) -> io::Result<Self> {
        Ok(Self::new(program, args, std::env::current_dir()?))
    }

    /// Resolve the working directory for an identity
    ///
    /// Canonicalizes so different spellings of the same directory derive the
    /// same address. The client and the daemon both resolve through here,
    /// which is what keeps their derived addresses identical.
    pub fn resolve_working_dir(dir: Option<PathBuf>) -> io::Result<PathBuf> {
        let dir = match dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        dir.canonicalize()
    }

    /// Derive the rendezvous digest for this identity
    ///
    /// Pure function of the three fields: each is fed to SHA-256 with a
    /// length prefix so field boundaries are unambiguous (["ab"] and
    /// ["a", "b"] hash differently). Returns the first 32 lowercase hex
    /// characters of the digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();

        hash_field(&mut hasher, self.program.as_bytes());
        hasher.update((self.args.len() as u64).to_le_bytes());
        for arg in &self.args {
            hash_field(&mut hasher, arg.as_bytes());
        }
        hash_field(&mut hasher, self.working_dir.as_os_str().as_encoded_bytes());

        let mut hex_digest = hex::encode(hasher.finalize());
        hex_digest.truncate(DIGEST_LEN);
        hex_digest
    }

    /// Human-readable command line for log messages
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
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
    fn test_digest_is_deterministic() {
        let a = identity("echo", &["hi"], "/tmp");
        let b = identity("echo", &["hi"], "/tmp");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.digest());
    }

    #[test]
    fn test_digest_shape() {
        let digest = identity("echo", &["hi"], "/tmp").digest();
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_lowercase());
    }

    #[test]
    fn test_digest_sensitive_to_program() {
        let a = identity("echo", &["hi"], "/tmp");
        let b = identity("printf", &["hi"], "/tmp");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_sensitive_to_args() {
        let a = identity("echo", &["hi"], "/tmp");
        let b = identity("echo", &["hi", "there"], "/tmp");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_sensitive_to_arg_order() {
        let a = identity("echo", &["one", "two"], "/tmp");
        let b = identity("echo", &["two", "one"], "/tmp");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_sensitive_to_working_dir() {
        let a = identity("echo", &["hi"], "/tmp");
        let b = identity("echo", &["hi"], "/var/tmp");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_field_boundaries_unambiguous() {
        // Concatenation alone would make these collide
        let a = identity("echo", &["ab"], "/tmp");
        let b = identity("echo", &["a", "b"], "/tmp");
        assert_ne!(a.digest(), b.digest());

        let c = identity("echoa", &["b"], "/tmp");
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_display_command() {
        assert_eq!(identity("make", &[], "/src").display_command(), "make");
        assert_eq!(
            identity("make", &["-j4", "all"], "/src").display_command(),
            "make -j4 all"
        );
    }

    #[test]
    fn test_from_current_dir() {
        let id = CommandIdentity::from_current_dir("echo", vec!["hi".to_string()]).unwrap();
        assert_eq!(id.working_dir, std::env::current_dir().unwrap());
    }
}
