pub mod monitor;
pub mod sampler;

pub use monitor::{CleanupDecision, MemoryEvent, MemoryMonitor, ThresholdPolicy};
pub use sampler::{total_system_memory, MemoryInfo, MemorySampler, ScriptedSampler, SysinfoSampler};

/// Why a cleanup pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Warning,
    Critical,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    /// Cache entries or history entries dropped by compaction.
    pub evicted_entries: usize,
    /// Buffers whose pixels were freed by reclamation.
    pub reclaimed_buffers: usize,
    pub reclaimed_bytes: usize,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.evicted_entries += other.evicted_entries;
        self.reclaimed_buffers += other.reclaimed_buffers;
        self.reclaimed_bytes += other.reclaimed_bytes;
    }
}

/// Something the memory monitor can shrink.
///
/// Implementations lock their own state, so a cleanup pass on the monitor
/// thread is serialized against edits on the interaction thread.
pub trait MemoryTarget: Send + Sync {
    fn target_name(&self) -> &'static str;

    /// Drop entries that are not needed right now.
    fn compact(&self, pressure: Pressure) -> CleanupReport;

    /// Free storage that compaction left unreferenced.
    fn reclaim(&self) -> CleanupReport {
        CleanupReport::default()
    }
}
