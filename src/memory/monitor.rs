use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::memory::sampler::{MemoryInfo, MemorySampler, SysinfoSampler};
use crate::memory::{CleanupReport, MemoryTarget, Pressure};
use crate::session::EventBus;
use crate::settings::SessionConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum MemoryEvent {
    /// Emitted for every sample.
    Status(MemoryInfo),
    Warning(f64),
    Critical(f64),
    CleanupFinished {
        pressure: Pressure,
        report: CleanupReport,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupDecision {
    Normal,
    Warning { cleanup: bool },
    Critical,
}

/// Maps a usage percentage to what the monitor should do about it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub warning: f64,
    pub critical: f64,
    pub cleanup_interval: Duration,
}

impl ThresholdPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            warning: config.warning_threshold,
            critical: config.critical_threshold,
            cleanup_interval: config.cleanup_interval,
        }
    }

    /// `since_last_cleanup` is `None` when no cleanup has run yet. Critical
    /// pressure ignores the interval gate.
    pub fn evaluate(&self, percent: f64, since_last_cleanup: Option<Duration>) -> CleanupDecision {
        if percent >= self.critical {
            CleanupDecision::Critical
        } else if percent >= self.warning {
            CleanupDecision::Warning {
                cleanup: since_last_cleanup.map_or(true, |elapsed| elapsed >= self.cleanup_interval),
            }
        } else {
            CleanupDecision::Normal
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("memory monitor lock poisoned; continuing with inner state");
        poisoned.into_inner()
    })
}

fn live_targets(slot: &Mutex<Vec<Weak<dyn MemoryTarget>>>) -> Vec<Arc<dyn MemoryTarget>> {
    let mut targets = lock(slot);
    targets.retain(|target| target.strong_count() > 0);
    targets.iter().filter_map(Weak::upgrade).collect()
}

struct MonitorShared {
    policy: ThresholdPolicy,
    caches: Mutex<Vec<Weak<dyn MemoryTarget>>>,
    sessions: Mutex<Vec<Weak<dyn MemoryTarget>>>,
    events: Mutex<EventBus<MemoryEvent>>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl MonitorShared {
    fn handle_sample(&self, info: MemoryInfo) -> CleanupDecision {
        self.emit(MemoryEvent::Status(info));
        let since_last = (*lock(&self.last_cleanup)).map(|at| at.elapsed());
        let decision = self.policy.evaluate(info.percent, since_last);
        match decision {
            CleanupDecision::Critical => {
                tracing::warn!(percent = info.percent, "memory usage critical");
                self.emit(MemoryEvent::Critical(info.percent));
                self.cleanup(Pressure::Critical);
            }
            CleanupDecision::Warning { cleanup } => {
                tracing::warn!(percent = info.percent, cleanup, "memory usage high");
                self.emit(MemoryEvent::Warning(info.percent));
                if cleanup {
                    self.cleanup(Pressure::Warning);
                }
            }
            CleanupDecision::Normal => {}
        }
        decision
    }

    /// Caches shrink first, then sessions thin their history, then every
    /// target frees what became unreferenced.
    fn cleanup(&self, pressure: Pressure) -> CleanupReport {
        let caches = live_targets(&self.caches);
        let sessions = live_targets(&self.sessions);
        let mut report = CleanupReport::default();

        for target in caches.iter().chain(sessions.iter()) {
            let compacted = target.compact(pressure);
            tracing::debug!(
                name = target.target_name(),
                evicted = compacted.evicted_entries,
                "compacted"
            );
            report.merge(compacted);
        }
        for target in caches.iter().chain(sessions.iter()) {
            report.merge(target.reclaim());
        }

        *lock(&self.last_cleanup) = Some(Instant::now());
        tracing::info!(
            ?pressure,
            evicted = report.evicted_entries,
            buffers = report.reclaimed_buffers,
            bytes = report.reclaimed_bytes,
            "memory cleanup finished"
        );
        self.emit(MemoryEvent::CleanupFinished { pressure, report });
        report
    }

    fn emit(&self, event: MemoryEvent) {
        lock(&self.events).emit(event);
    }
}

struct MonitorWorker {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Samples memory on its own thread and coordinates cleanup across the
/// registered sessions and caches.
///
/// Targets are held weakly; dropping a session or cache unregisters it.
pub struct MemoryMonitor {
    shared: Arc<MonitorShared>,
    sample_interval: Duration,
    worker: Option<MonitorWorker>,
}

impl MemoryMonitor {
    pub fn new(config: Arc<SessionConfig>) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                policy: ThresholdPolicy::from_config(&config),
                caches: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                events: Mutex::new(EventBus::default()),
                last_cleanup: Mutex::new(None),
            }),
            sample_interval: config.sample_interval,
            worker: None,
        }
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.shared.policy
    }

    pub fn register_session<T: MemoryTarget + 'static>(&self, session: &Arc<T>) {
        let target: Arc<dyn MemoryTarget> = session.clone();
        lock(&self.shared.sessions).push(Arc::downgrade(&target));
    }

    pub fn register_cache<T: MemoryTarget + 'static>(&self, cache: &Arc<T>) {
        let target: Arc<dyn MemoryTarget> = cache.clone();
        lock(&self.shared.caches).push(Arc::downgrade(&target));
    }

    pub fn subscribe(&self) -> Receiver<MemoryEvent> {
        lock(&self.shared.events).subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Start sampling system memory through `sysinfo`.
    pub fn start(&mut self) -> Result<()> {
        self.start_with(Box::new(SysinfoSampler::new()))
    }

    pub fn start_with(&mut self, sampler: Box<dyn MemorySampler>) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.sample_interval;
        let join = thread::Builder::new()
            .name("retouch-memory-monitor".into())
            .spawn(move || monitor_loop(shared, sampler, stop_rx, interval))
            .context("spawn memory monitor thread")?;
        tracing::info!(?interval, "memory monitor started");
        self.worker = Some(MonitorWorker { stop_tx, join });
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.join.join().is_err() {
                tracing::error!("memory monitor thread panicked");
            }
            tracing::info!("memory monitor stopped");
        }
    }

    /// Evaluate one reading as if the sampling thread had taken it.
    pub fn check(&self, info: MemoryInfo) -> CleanupDecision {
        self.shared.handle_sample(info)
    }

    /// Run a full cleanup now, regardless of thresholds and intervals.
    pub fn force_cleanup(&self) -> CleanupReport {
        self.shared.cleanup(Pressure::Manual)
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(
    shared: Arc<MonitorShared>,
    mut sampler: Box<dyn MemorySampler>,
    stop_rx: Receiver<()>,
    interval: Duration,
) {
    loop {
        match sampler.sample() {
            Ok(info) => {
                shared.handle_sample(info);
            }
            Err(err) => tracing::error!(?err, "memory sampling failed"),
        }
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
