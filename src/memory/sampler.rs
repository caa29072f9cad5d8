use anyhow::{bail, Result};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One reading of system (and, when available, process) memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    /// Resident size of this process.
    pub process_bytes: Option<u64>,
    /// `used / total`, in percent.
    pub percent: f64,
}

impl MemoryInfo {
    pub fn new(
        total_bytes: u64,
        used_bytes: u64,
        available_bytes: u64,
        process_bytes: Option<u64>,
    ) -> Self {
        let percent = if total_bytes > 0 {
            used_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_bytes,
            used_bytes,
            available_bytes,
            process_bytes,
            percent,
        }
    }

    /// A synthetic reading at `percent` of a 16 GiB machine.
    pub fn at_percent(percent: f64) -> Self {
        let total = 16 * 1024 * 1024 * 1024_u64;
        let used = (total as f64 * percent.clamp(0.0, 100.0) / 100.0) as u64;
        Self::new(total, used, total - used, None)
    }
}

pub trait MemorySampler: Send {
    fn sample(&mut self) -> Result<MemoryInfo>;
}

/// Reads memory through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::warn!(err, "process memory unavailable");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&mut self) -> Result<MemoryInfo> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            bail!("system reported zero total memory");
        }
        let process_bytes = self.pid.and_then(|pid| {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            self.system.process(pid).map(|process| process.memory())
        });
        Ok(MemoryInfo::new(
            total,
            self.system.used_memory(),
            self.system.available_memory(),
            process_bytes,
        ))
    }
}

/// Replays a fixed list of readings, repeating the last one.
pub struct ScriptedSampler {
    readings: Vec<MemoryInfo>,
    next: usize,
}

impl ScriptedSampler {
    pub fn new(readings: Vec<MemoryInfo>) -> Self {
        Self { readings, next: 0 }
    }
}

impl MemorySampler for ScriptedSampler {
    fn sample(&mut self) -> Result<MemoryInfo> {
        let Some(last) = self.readings.len().checked_sub(1) else {
            bail!("no scripted memory readings");
        };
        let reading = self.readings[self.next.min(last)];
        self.next += 1;
        Ok(reading)
    }
}

/// Total physical memory in bytes, or 0 when it cannot be read.
pub fn total_system_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

#[cfg(test)]
mod tests {
    use super::{MemoryInfo, MemorySampler, ScriptedSampler};

    #[test]
    fn percent_is_derived_from_used_over_total() {
        let info = MemoryInfo::new(200, 150, 50, None);
        assert_eq!(info.percent, 75.0);
        assert_eq!(MemoryInfo::new(0, 0, 0, None).percent, 0.0);
    }

    #[test]
    fn scripted_sampler_repeats_last_reading() {
        let mut sampler =
            ScriptedSampler::new(vec![MemoryInfo::at_percent(10.0), MemoryInfo::at_percent(90.0)]);
        let first = sampler.sample().expect("first").percent;
        assert!((first - 10.0).abs() < 0.01);
        for _ in 0..3 {
            let p = sampler.sample().expect("repeat").percent;
            assert!((p - 90.0).abs() < 0.01);
        }
        assert!(ScriptedSampler::new(Vec::new()).sample().is_err());
    }
}
