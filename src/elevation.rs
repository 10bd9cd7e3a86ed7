//! Privilege elevation for `iptables` commands
//!
//! iptsync can run as an unprivileged user and elevates only to run the
//! configured `iptables` and `iptables-save` binaries.
//!
//! # Elevation Strategy
//!
//! - **Root**: commands run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `IPTSYNC_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules in cron jobs or provisioning scripts.
//!   Example: `IPTSYNC_ELEVATION_METHOD=sudo iptsync apply rules.json`
//!
//! - `IPTSYNC_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only binaries whose file name is an `iptables`/`ip6tables` tool can be elevated
//! - Arguments are passed as argv, never through a shell
//! - The elevation helper is checked for availability before use

use std::io;
use std::path::Path;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `IPTSYNC_ELEVATION_METHOD`
    #[error("Invalid IPTSYNC_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Program is not one of the iptables tools
    #[error("Refusing to elevate '{0}': only iptables binaries may be elevated")]
    ProgramNotAllowed(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ElevationError> for crate::core::error::Error {
    fn from(err: ElevationError) -> Self {
        crate::core::error::Error::Elevation(err.to_string())
    }
}

/// Binary names that may be run with elevated privileges.
const ALLOWED_PROGRAMS: &[&str] = &[
    "iptables",
    "iptables-save",
    "iptables-legacy",
    "iptables-legacy-save",
    "iptables-nft",
    "iptables-nft-save",
    "ip6tables",
    "ip6tables-save",
    "ip6tables-legacy",
    "ip6tables-legacy-save",
    "ip6tables-nft",
    "ip6tables-nft-save",
];

fn is_allowed_program(program: &str) -> bool {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| ALLOWED_PROGRAMS.contains(&name))
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(helper: &str, program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds a command that runs `program` with root privileges.
///
/// Under `IPTSYNC_TEST_NO_ELEVATION` any program may be run directly so that
/// tests can substitute mock scripts.
///
/// # Errors
///
/// Returns `Err` if `program` is not an iptables tool, the forced method is
/// unknown or unavailable, or no elevation helper can be found.
pub fn create_elevated_command(program: &str, args: &[String]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("IPTSYNC_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    if !is_allowed_program(program) {
        return Err(ElevationError::ProgramNotAllowed(program.to_string()));
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("IPTSYNC_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}
