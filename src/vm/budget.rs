//! Memory budgeting for the guest.
//!
//! Turns a host memory snapshot into a TCG translation-cache size and a guest
//! RAM size, both in MiB and both clamped to fixed windows.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::vm::{QEMU_MAX_SAFE_RAM, QEMU_MAX_TCG_BUF, QEMU_MIN_SAFE_RAM, QEMU_MIN_TCG_BUF};

const MIB: f64 = 1_048_576.0;
const AVAILABLE_SHARE: f64 = 0.8;
const TCG_SHARE: f64 = 0.12;

/// Host memory state captured once per launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub oom_threshold_bytes: u64,
    pub low_memory_flag: bool,
}

/// Floors and ceilings for the computed budget, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub min_tcg_mib: u32,
    pub max_tcg_mib: u32,
    pub min_ram_mib: u32,
    pub max_ram_mib: u32,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            min_tcg_mib: QEMU_MIN_TCG_BUF,
            max_tcg_mib: QEMU_MAX_TCG_BUF,
            min_ram_mib: QEMU_MIN_SAFE_RAM,
            max_ram_mib: QEMU_MAX_SAFE_RAM,
        }
    }
}

/// `(tcg_buffer, guest_ram)` in MiB, always inside its [`BudgetLimits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceBudget {
    tcg_mib: u32,
    ram_mib: u32,
}

impl ResourceBudget {
    /// Validate an explicit budget against `limits`.
    pub fn new(tcg_mib: i64, ram_mib: i64, limits: &BudgetLimits) -> Result<Self> {
        let tcg_ok = (limits.min_tcg_mib as i64..=limits.max_tcg_mib as i64).contains(&tcg_mib);
        let ram_ok = (limits.min_ram_mib as i64..=limits.max_ram_mib as i64).contains(&ram_mib);
        if !(tcg_ok && ram_ok) {
            return Err(Error::InvalidBudget { tcg_mib, ram_mib });
        }
        Ok(Self {
            tcg_mib: tcg_mib as u32,
            ram_mib: ram_mib as u32,
        })
    }

    /// The smallest budget allowed by `limits`.
    pub fn minimum(limits: &BudgetLimits) -> Self {
        Self {
            tcg_mib: limits.min_tcg_mib,
            ram_mib: limits.min_ram_mib,
        }
    }

    /// Derive the budget from a memory snapshot.
    ///
    /// The TCG share is taken from the truncated safe size, and the RAM share
    /// subtracts the unclamped TCG product before truncating.
    pub fn compute(snapshot: &MemorySnapshot, limits: &BudgetLimits) -> Self {
        let safe = ((snapshot.available_bytes as f64 * AVAILABLE_SHARE
            - snapshot.oom_threshold_bytes as f64)
            / MIB) as i64;
        let tcg_product = safe as f64 * TCG_SHARE;

        let tcg = clamp(tcg_product as i64, limits.min_tcg_mib, limits.max_tcg_mib);
        let ram = clamp(
            (safe as f64 - tcg_product) as i64,
            limits.min_ram_mib,
            limits.max_ram_mib,
        );

        Self {
            tcg_mib: tcg,
            ram_mib: ram,
        }
    }

    /// Query `probe` and compute, falling back to the minimum budget when the
    /// host cannot be queried.
    pub fn from_probe(probe: &dyn MemoryProbe, limits: &BudgetLimits) -> Self {
        match probe.snapshot() {
            Ok(snapshot) => {
                let budget = Self::compute(&snapshot, limits);
                info!(
                    total = snapshot.total_bytes,
                    available = snapshot.available_bytes,
                    threshold = snapshot.oom_threshold_bytes,
                    low_memory = snapshot.low_memory_flag,
                    tcg_mib = budget.tcg_mib,
                    ram_mib = budget.ram_mib,
                    "resource budget computed"
                );
                budget
            }
            Err(e) => {
                warn!(error = %e, "memory snapshot unavailable, using minimum budget");
                Self::minimum(limits)
            }
        }
    }

    pub fn tcg_mib(&self) -> u32 {
        self.tcg_mib
    }

    pub fn ram_mib(&self) -> u32 {
        self.ram_mib
    }
}

fn clamp(value: i64, min: u32, max: u32) -> u32 {
    value.clamp(min as i64, max as i64) as u32
}

// ---------------------------------------------------------------------------
// Memory probes
// ---------------------------------------------------------------------------

/// Source of host memory snapshots.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> std::io::Result<MemorySnapshot>;
}

/// A fixed snapshot, for callers that already measured the host.
impl MemoryProbe for MemorySnapshot {
    fn snapshot(&self) -> std::io::Result<MemorySnapshot> {
        Ok(*self)
    }
}

/// Linux probe reading `/proc/meminfo` and `/proc/sys/vm/min_free_kbytes`.
///
/// `MemAvailable` is the available figure, `min_free_kbytes` stands in for
/// the low-memory killer threshold.
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    root: PathBuf,
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcMeminfo {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl MemoryProbe for ProcMeminfo {
    fn snapshot(&self) -> std::io::Result<MemorySnapshot> {
        let meminfo = std::fs::read_to_string(self.root.join("meminfo"))?;
        let total_kib = meminfo_field(&meminfo, "MemTotal")?;
        let available_kib = meminfo_field(&meminfo, "MemAvailable")?;

        let threshold_kib: u64 = std::fs::read_to_string(self.root.join("sys/vm/min_free_kbytes"))?
            .trim()
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let available_bytes = available_kib * 1024;
        let oom_threshold_bytes = threshold_kib * 1024;
        Ok(MemorySnapshot {
            total_bytes: total_kib * 1024,
            available_bytes,
            oom_threshold_bytes,
            low_memory_flag: available_bytes <= oom_threshold_bytes,
        })
    }
}

fn meminfo_field(meminfo: &str, key: &str) -> std::io::Result<u64> {
    meminfo
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix(key)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse().ok()
        })
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{key} missing from meminfo"),
            )
        })
}
