//! Store health reporting and memory-pressure handling.
//!
//! # Invariants
//! - Reporting never mutates stored data.
//! - The read probe goes through the same serialized worker as every other
//!   store operation.

use crate::clock::{Clock, SystemClock};
use crate::health::memory::MemoryProbe;
use crate::store::StoreHandle;
use log::{info, warn};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClass {
    Healthy,
    /// Data exists on disk but this process cannot read it right now.
    Degraded,
    /// Nothing to read: the container or the data file is missing.
    Unavailable,
}

impl Display for HealthClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub is_available: bool,
    pub can_read_probe: bool,
    pub resident_memory_mb: Option<u64>,
    pub has_shared_data_file: bool,
    pub container_reachable: bool,
    pub last_error: Option<String>,
    pub timestamp_ms: i64,
}

impl HealthReport {
    pub fn classification(&self) -> HealthClass {
        if self.is_available && self.can_read_probe {
            HealthClass::Healthy
        } else if self.container_reachable && self.has_shared_data_file {
            HealthClass::Degraded
        } else {
            HealthClass::Unavailable
        }
    }
}

pub struct HealthMonitor {
    store: Arc<StoreHandle>,
    memory: Arc<dyn MemoryProbe>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(store: Arc<StoreHandle>, memory: Arc<dyn MemoryProbe>) -> Self {
        Self {
            store,
            memory,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn report(&self) -> HealthReport {
        let probe = self.store.probe().await;
        if let Err(err) = &probe {
            warn!(
                "event=health_probe module=health status=error error={}",
                err
            );
        }

        let container_dir = self.store.container_dir();
        let report = HealthReport {
            is_available: self.store.is_available(),
            can_read_probe: probe.is_ok(),
            resident_memory_mb: self.memory.resident_mb(),
            has_shared_data_file: self.store.db_path().is_file(),
            container_reachable: container_dir.is_dir(),
            last_error: self.store.last_error(),
            timestamp_ms: self.clock.now_ms(),
        };

        info!(
            "event=health_report module=health status={} available={} probe={} memory_mb={}",
            report.classification(),
            report.is_available,
            report.can_read_probe,
            report
                .resident_memory_mb
                .map_or_else(|| "unknown".to_string(), |mb| mb.to_string())
        );
        report
    }

    /// Drops in-process caches and reports the resulting state.
    pub async fn handle_memory_pressure(&self) -> HealthReport {
        let before_mb = self.memory.resident_mb();
        if let Err(err) = self.store.drop_caches().await {
            warn!(
                "event=memory_pressure module=health status=error error={}",
                err
            );
        }
        let report = self.report().await;
        info!(
            "event=memory_pressure module=health status=ok before_mb={:?} after_mb={:?}",
            before_mb, report.resident_memory_mb
        );
        report
    }
}
