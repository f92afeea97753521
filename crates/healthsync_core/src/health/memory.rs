//! Resident memory probing and the accessor's cooperative budget.
//!
//! The budget is a synchronous pre-check, not an OS limit: it keeps a
//! memory-constrained secondary process from starting work that would get it
//! terminated by its host.

use crate::error::StoreError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, System};

const BYTES_PER_MB: u64 = 1024 * 1024;

pub trait MemoryProbe: Send + Sync {
    /// Resident set size of the current process, if it can be measured.
    fn resident_bytes(&self) -> Option<u64>;

    fn resident_mb(&self) -> Option<u64> {
        self.resident_bytes().map(|bytes| bytes / BYTES_PER_MB)
    }
}

/// Measures the current process through `sysinfo`.
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

/// Probe returning a caller-controlled value, for simulation and tests.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    resident_bytes: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(resident_bytes: u64) -> Self {
        Self {
            resident_bytes: AtomicU64::new(resident_bytes),
        }
    }

    pub fn set_resident_bytes(&self, resident_bytes: u64) {
        self.resident_bytes.store(resident_bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.resident_bytes.load(Ordering::SeqCst))
    }
}

/// Ceiling on resident memory checked before store work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    ceiling_bytes: u64,
}

impl MemoryBudget {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self { ceiling_bytes }
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    /// Fails when measured memory is above the ceiling. An unmeasurable
    /// process is allowed to proceed.
    pub fn check(&self, probe: &dyn MemoryProbe) -> Result<(), StoreError> {
        match probe.resident_bytes() {
            Some(resident_bytes) if resident_bytes > self.ceiling_bytes => {
                Err(StoreError::MemoryLimitExceeded {
                    resident_bytes,
                    ceiling_bytes: self.ceiling_bytes,
                })
            }
            _ => Ok(()),
        }
    }
}
