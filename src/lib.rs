//! vShell: launch and lifecycle control for a QEMU Linux VM whose serial
//! console is exposed through a terminal emulator.

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod session;
pub mod vm;

mod state_machine;

pub use error::{Error, Result};
