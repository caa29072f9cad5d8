use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::session::image::{ImageBuffer, SharedImage};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

type TransformFn = dyn Fn(&ImageBuffer) -> anyhow::Result<ImageBuffer> + Send + Sync;

/// A named pixel operation. The input is only ever borrowed, so a transform
/// cannot modify the buffer it reads from.
#[derive(Clone)]
pub struct Transform {
    name: Arc<str>,
    func: Arc<TransformFn>,
}

impl Transform {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&ImageBuffer) -> anyhow::Result<ImageBuffer> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run on the calling thread. Errors and panics both come back as
    /// [`SessionError::TransformFailed`].
    pub fn run(&self, input: &ImageBuffer) -> Result<ImageBuffer> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.func)(input))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(SessionError::TransformFailed(format!(
                "{}: {err:#}",
                self.name
            ))),
            Err(payload) => Err(SessionError::TransformFailed(format!(
                "{} panicked: {}",
                self.name,
                panic_message(payload.as_ref())
            ))),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transform").field(&self.name).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Run inline on the interaction thread.
    Synchronous,
    /// Hand off to the worker thread and wait for its reply.
    Queued,
}

struct Task {
    transform: Transform,
    input: SharedImage,
    reply: SyncSender<Result<ImageBuffer>>,
}

enum WorkerMessage {
    Run(Task),
    Shutdown,
}

/// Reply slot for a queued task.
///
/// Dropping it (or timing out in [`PendingResult::wait`]) does not abort the
/// task: the worker finishes it and the result is discarded.
pub struct PendingResult {
    name: Arc<str>,
    reply: Receiver<Result<ImageBuffer>>,
}

impl PendingResult {
    pub fn wait(self, timeout: Option<Duration>) -> Result<ImageBuffer> {
        let Some(timeout) = timeout else {
            return self.reply.recv().unwrap_or_else(|_| {
                Err(SessionError::WorkerQueue(format!(
                    "worker dropped the reply for {}",
                    self.name
                )))
            });
        };
        match self.reply.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(transform = %self.name, ?timeout, "stopped waiting for queued transform");
                Err(SessionError::WorkerQueue(format!(
                    "timed out after {timeout:?} waiting for {}",
                    self.name
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::WorkerQueue(format!(
                "worker dropped the reply for {}",
                self.name
            ))),
        }
    }

    /// Non-blocking poll; `None` while the task is still queued or running.
    pub fn try_take(&self) -> Option<Result<ImageBuffer>> {
        match self.reply.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SessionError::WorkerQueue(format!(
                "worker dropped the reply for {}",
                self.name
            )))),
        }
    }
}

/// Runs transforms inline or on a single long-lived worker thread.
pub struct OperationExecutor {
    queue: Option<SyncSender<WorkerMessage>>,
    worker: Option<JoinHandle<()>>,
    timeout: Option<Duration>,
}

impl OperationExecutor {
    pub fn new(queue_depth: usize, timeout: Option<Duration>) -> Self {
        let (queue_tx, queue_rx) = mpsc::sync_channel(queue_depth.max(1));
        let spawned = thread::Builder::new()
            .name("retouch-worker".into())
            .spawn(move || worker_loop(queue_rx));
        match spawned {
            Ok(join) => Self {
                queue: Some(queue_tx),
                worker: Some(join),
                timeout,
            },
            Err(err) => {
                tracing::error!(?err, "failed to spawn transform worker; queued mode disabled");
                Self {
                    queue: None,
                    worker: None,
                    timeout,
                }
            }
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn execute(
        &self,
        transform: &Transform,
        input: &SharedImage,
        mode: ExecMode,
    ) -> Result<ImageBuffer> {
        match mode {
            ExecMode::Synchronous => transform.run(input),
            ExecMode::Queued => self.submit(transform, input)?.wait(self.timeout),
        }
    }

    /// Enqueue without waiting.
    pub fn submit(&self, transform: &Transform, input: &SharedImage) -> Result<PendingResult> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| SessionError::WorkerQueue("worker is not running".into()))?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let task = Task {
            transform: transform.clone(),
            input: input.clone(),
            reply: reply_tx,
        };
        match queue.try_send(WorkerMessage::Run(task)) {
            Ok(()) => Ok(PendingResult {
                name: transform.name.clone(),
                reply: reply_rx,
            }),
            Err(TrySendError::Full(_)) => Err(SessionError::WorkerQueue(format!(
                "task queue is full, rejected {}",
                transform.name()
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(SessionError::WorkerQueue("worker has stopped".into()))
            }
        }
    }
}

impl Drop for OperationExecutor {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            // A full queue cannot take the shutdown message; dropping the
            // sender still ends the worker once the queue drains.
            if let Err(TrySendError::Full(_)) = queue.try_send(WorkerMessage::Shutdown) {
                tracing::debug!("task queue full at shutdown; closing it instead");
            }
        }
        let Some(handle) = self.worker.take() else {
            return;
        };

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = done_tx.send(handle.join());
        });
        match done_rx.recv_timeout(WORKER_JOIN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("transform worker panicked while shutting down"),
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!("transform worker join timed out; leaving it detached")
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!("transform worker join channel disconnected")
            }
        }
    }
}

fn worker_loop(queue: Receiver<WorkerMessage>) {
    while let Ok(message) = queue.recv() {
        match message {
            WorkerMessage::Run(task) => {
                tracing::debug!(transform = task.transform.name(), "worker running transform");
                let result = task.transform.run(&task.input);
                if let Err(err) = &result {
                    tracing::error!(%err, "queued transform failed");
                }
                if task.reply.send(result).is_err() {
                    tracing::debug!(
                        transform = task.transform.name(),
                        "caller stopped waiting; discarding result"
                    );
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }
    tracing::debug!("transform worker exiting");
}

#[cfg(test)]
mod tests {
    use super::{ExecMode, OperationExecutor, Transform};
    use crate::error::SessionError;
    use crate::session::image::ImageBuffer;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn invert() -> Transform {
        Transform::new("invert", |img: &ImageBuffer| {
            let pixels = img.pixels().iter().map(|p| 255 - p).collect();
            Ok(ImageBuffer::new(img.width(), img.height(), img.channels(), pixels)?)
        })
    }

    #[test]
    fn synchronous_and_queued_agree() {
        let executor = OperationExecutor::new(4, None);
        let input = ImageBuffer::filled(2, 2, 3, 10).expect("input").into_shared();
        let sync = executor
            .execute(&invert(), &input, ExecMode::Synchronous)
            .expect("sync");
        let queued = executor
            .execute(&invert(), &input, ExecMode::Queued)
            .expect("queued");
        assert!(sync.same_content(&queued));
        assert_ne!(sync.id(), input.id());
        assert_eq!(input.pixels()[0], 10);
    }

    #[test]
    fn worker_survives_a_panicking_transform() {
        let executor = OperationExecutor::new(4, None);
        let input = ImageBuffer::filled(1, 1, 1, 0).expect("input").into_shared();
        let boom = Transform::new("boom", |_: &ImageBuffer| -> anyhow::Result<ImageBuffer> {
            panic!("kaboom")
        });

        let err = executor
            .execute(&boom, &input, ExecMode::Queued)
            .expect_err("panic is reported");
        assert!(matches!(err, SessionError::TransformFailed(ref m) if m.contains("kaboom")));

        assert!(executor.execute(&invert(), &input, ExecMode::Queued).is_ok());
    }

    #[test]
    fn transform_errors_are_wrapped() {
        let failing = Transform::new("fails", |_: &ImageBuffer| -> anyhow::Result<ImageBuffer> {
            anyhow::bail!("unsupported kernel")
        });
        let input = ImageBuffer::filled(1, 1, 1, 0).expect("input");
        let err = failing.run(&input).expect_err("error");
        assert_eq!(
            err,
            SessionError::TransformFailed("fails: unsupported kernel".into())
        );
    }

    #[test]
    fn timed_out_wait_does_not_stop_the_worker() {
        let executor = OperationExecutor::new(4, Some(Duration::from_millis(10)));
        let input = ImageBuffer::filled(1, 1, 1, 0).expect("input").into_shared();
        let slow = Transform::new("slow", |img: &ImageBuffer| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(ImageBuffer::filled(img.width(), img.height(), img.channels(), 1)?)
        });

        let err = executor
            .execute(&slow, &input, ExecMode::Queued)
            .expect_err("timeout");
        assert!(matches!(err, SessionError::WorkerQueue(_)));

        let pending = executor.submit(&invert(), &input).expect("submit");
        let output = pending.wait(Some(Duration::from_secs(5))).expect("next task");
        assert_eq!(output.pixels(), &[255]);
    }

    /// A transform that reports when it starts and then blocks until the
    /// returned sender fires (or is dropped).
    fn gated() -> (Transform, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (open_tx, open_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let open_rx = Mutex::new(open_rx);
        let transform = Transform::new("gated", move |img: &ImageBuffer| {
            if let Ok(started) = started_tx.lock() {
                let _ = started.send(());
            }
            if let Ok(open) = open_rx.lock() {
                let _ = open.recv();
            }
            Ok(ImageBuffer::filled(img.width(), img.height(), img.channels(), 7)?)
        });
        (transform, started_rx, open_tx)
    }

    #[test]
    fn full_queue_rejects_and_pending_results_can_be_polled() {
        let executor = OperationExecutor::new(1, None);
        let input = ImageBuffer::filled(1, 1, 1, 0).expect("input").into_shared();
        let (blocker, started, open) = gated();

        let running = executor.submit(&blocker, &input).expect("first");
        started
            .recv_timeout(Duration::from_secs(5))
            .expect("worker picked up the first task");
        let queued = executor.submit(&invert(), &input).expect("second fills the queue");

        let rejected = executor.submit(&invert(), &input);
        assert!(matches!(rejected, Err(SessionError::WorkerQueue(ref m)) if m.contains("full")));
        assert!(running.try_take().is_none());
        assert!(queued.try_take().is_none());

        open.send(()).expect("open gate");
        let first = running.wait(Some(Duration::from_secs(5))).expect("first result");
        assert_eq!(first.pixels(), &[7]);

        let deadline = Instant::now() + Duration::from_secs(5);
        let second = loop {
            if let Some(result) = queued.try_take() {
                break result;
            }
            assert!(Instant::now() < deadline, "queued task never finished");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(second.expect("second result").pixels(), &[255]);
    }

    #[test]
    fn drop_with_a_full_queue_does_not_hang() {
        let executor = OperationExecutor::new(1, None);
        let input = ImageBuffer::filled(1, 1, 1, 0).expect("input").into_shared();
        let (blocker, started, open) = gated();

        let _running = executor.submit(&blocker, &input).expect("first");
        started
            .recv_timeout(Duration::from_secs(5))
            .expect("worker picked up the first task");
        let _queued = executor.submit(&invert(), &input).expect("second fills the queue");

        let dropped_at = Instant::now();
        drop(executor);
        assert!(dropped_at.elapsed() < Duration::from_secs(5));
        drop(open);
    }
}
