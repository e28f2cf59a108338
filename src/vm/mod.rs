//! VM management module for vShell.
//!
//! Sizes the guest from host memory, plans host port forwards, assembles the
//! QEMU command line, and drives the VM session through its lifecycle while
//! keeping the foreground status and wake holds truthful.

pub mod args;
pub mod budget;
pub mod foreground;
pub mod lifecycle;
pub mod ports;

// ---------------------------------------------------------------------------
// Policy constants
// ---------------------------------------------------------------------------

/// Name presented to the VM process as argv[0] and used in SSH URIs.
pub const PROGRAM_NAME: &str = "vShell";

/// TCG translation-cache window, MiB.
pub const QEMU_MIN_TCG_BUF: u32 = 32;
pub const QEMU_MAX_TCG_BUF: u32 = 512;

/// Guest RAM window, MiB.
pub const QEMU_MIN_SAFE_RAM: u32 = 256;
pub const QEMU_MAX_SAFE_RAM: u32 = 2048;

/// Boot ISO and persistent disk, both relative to the install root.
pub const CDROM_IMAGE_NAME: &str = "alpine-x86_64.iso";
pub const HDD_IMAGE_NAME: &str = "userdata.qcow2";

/// Emulator binary searched for on `PATH`.
pub const QEMU_BINARY_NAME: &str = "qemu-system-x86_64";

pub const QEMU_UPSTREAM_DNS_V4: &str = "8.8.8.8";
pub const QEMU_UPSTREAM_DNS_V6: &str = "2001:4860:4860::8888";

/// Shared storage root exported over 9P on Android hosts.
pub const DEFAULT_HOST_SHARE_ROOT: &str = "/storage/self/primary";

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use args::{ArgBuilder, LaunchLayout, LaunchPlan, locate_qemu};
pub use budget::{BudgetLimits, MemoryProbe, MemorySnapshot, ProcMeminfo, ResourceBudget};
pub use foreground::{
    Hold, HoldBackend, LoggingHoldBackend, StatusSink, TracingStatusSink, WakeHolds,
};
pub use lifecycle::{
    ControlAction, ControllerHandle, ControllerOptions, ControllerState, LifecycleController,
    SessionObserver,
};
pub use ports::{PortMap, Service};
