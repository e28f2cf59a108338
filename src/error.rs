//! Error types for the vShell launch and lifecycle core.

use std::path::PathBuf;

/// Alias for `Result<T, vshell::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by budgeting, launch planning, sessions and the controller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A configured host port is outside `1..=65535`.
    #[error("invalid port {value} for {service}")]
    InvalidPort {
        /// Symbolic service name (`ssh`, `p5678`, ...).
        service: &'static str,
        /// The rejected value as stored in preferences.
        value: i32,
    },

    /// Two services were configured with the same host port.
    #[error("host port {port} is assigned to both {first} and {second}")]
    PortCollision {
        port: u16,
        first: &'static str,
        second: &'static str,
    },

    /// A resource budget outside the configured windows.
    #[error("invalid resource budget: tcg={tcg_mib} MiB, ram={ram_mib} MiB")]
    InvalidBudget { tcg_mib: i64, ram_mib: i64 },

    /// A disk image referenced by the launch plan does not exist.
    #[error("disk image missing: {}", path.display())]
    MissingImage { path: PathBuf },

    /// The VM process could not be started.
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No executable QEMU binary was found on the search path.
    #[error("{name} not found on PATH; install QEMU or set VSHELL_QEMU to the emulator binary")]
    QemuNotFound {
        name: &'static str,
        #[source]
        source: which::Error,
    },

    /// The same service appears more than once in a port plan.
    #[error("port plan lists {service} more than once")]
    DuplicateService { service: &'static str },

    /// A default SSH user name that does not match `[a-z_][a-z0-9_-]{0,31}`.
    #[error("invalid user name: {0:?}")]
    InvalidUsername(String),

    /// `start()` while a session is launching, running or shutting down.
    #[error("virtual machine is already running")]
    AlreadyRunning,

    /// An input operation with no live session.
    #[error("virtual machine is not running")]
    NotRunning,

    /// The controller reached its terminal state and cannot be restarted.
    #[error("controller has terminated")]
    ControllerTerminated,

    /// The preferences file exists but is not valid TOML for the known keys.
    #[error("malformed preferences file {}: {source}", path.display())]
    PreferencesFormat {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// An I/O error from preferences, memory probing or session plumbing.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
