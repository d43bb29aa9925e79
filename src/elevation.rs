//! Privilege elevation for system operations
//!
//! portsync normally runs as root from a systemd timer, but an operator may
//! run `status` or `sync` from a login shell. Only a fixed set of binaries
//! can ever be elevated, see [`PrivilegedProgram`].
//!
//! # Elevation Strategy
//!
//! - **Root**: commands run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Headless fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `PORTSYNC_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for scripts with sudoers NOPASSWD rules.
//! - `PORTSYNC_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - Arguments are validated by the callers (see [`crate::validators`])

use std::io;
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

    /// Invalid value for `PORTSYNC_ELEVATION_METHOD`
    #[error("Invalid PORTSYNC_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The only binaries portsync will ever run with elevated privileges
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::AsRefStr,
    strum::IntoStaticStr,
)]
pub enum PrivilegedProgram {
    #[strum(serialize = "iptables")]
    Iptables,
    #[strum(serialize = "iptables-save")]
    IptablesSave,
    #[strum(serialize = "netfilter-persistent")]
    NetfilterPersistent,
    #[strum(serialize = "install")]
    Install,
    #[strum(serialize = "systemctl")]
    Systemctl,
    #[strum(serialize = "rm")]
    Remove,
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

fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

/// Builds an elevated command for one of the approved programs.
///
/// # Errors
///
/// Returns `Err` if the forced elevation method is invalid or unavailable,
/// or no elevation helper can be found.
pub fn create_elevated_command(
    program: PrivilegedProgram,
    args: &[&str],
) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    let program = program.as_ref();

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("PORTSYNC_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct Root Execution (the systemd timer path)
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("PORTSYNC_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fallback to sudo/pkexec
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
