use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::error::DhtError;
use super::timeout::{TimeoutDispatcher, TimeoutId};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Submission side of a [`MainLoop`]; cheap to clone.
pub struct LoopHandle<S> {
    jobs: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<S: 'static> LoopHandle<S> {
    /// Runs `job` on the loop without waiting for it.
    ///
    /// A panic inside `job` terminates the loop.
    pub fn queue(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<(), DhtError> {
        self.jobs
            .send(Box::new(job))
            .map_err(|_| DhtError::MainLoopClosed)
    }

    /// Runs `job` on the loop and returns its result.
    ///
    /// A panic inside `job` is caught on the loop and resumed here.
    pub async fn queue_wait<R, F>(&self, job: F) -> Result<R, DhtError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let rx = self.submit_waiting(job)?;
        unwrap_outcome(rx.await)
    }

    /// Blocking form of [`queue_wait`](Self::queue_wait) for threads outside
    /// the runtime. Panics if called from within an async context.
    pub fn queue_wait_blocking<R, F>(&self, job: F) -> Result<R, DhtError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let rx = self.submit_waiting(job)?;
        unwrap_outcome(rx.blocking_recv())
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }

    pub(super) fn submit_waiting<R, F>(&self, job: F) -> Result<oneshot::Receiver<thread::Result<R>>, DhtError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue(move |state: &mut S| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| job(state)));
            let _ = tx.send(result);
        })?;
        Ok(rx)
    }
}

fn unwrap_outcome<R>(
    outcome: Result<thread::Result<R>, oneshot::error::RecvError>,
) -> Result<R, DhtError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => panic::resume_unwind(payload),
        Err(_) => Err(DhtError::MainLoopClosed),
    }
}

/// Single-writer executor: one tokio task owns `S` and runs submitted closures
/// against it one at a time, in submission order.
///
/// Periodic work is registered with [`queue_timeout`](Self::queue_timeout)
/// and also runs on the loop, so `S` never needs a lock.
pub struct MainLoop<S> {
    handle: LoopHandle<S>,
    timeouts: TimeoutDispatcher<S>,
    supervisor: JoinHandle<()>,
}

impl<S: Send + 'static> MainLoop<S> {
    /// Moves `state` onto a new worker task. Requires a tokio runtime.
    pub fn spawn(mut state: S) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job(&mut state);
            }
        });
        let supervisor = tokio::spawn(async move {
            match worker.await {
                Ok(()) => debug!("main loop finished"),
                Err(e) if e.is_panic() => {
                    error!("main loop crashed: {}", panic_message(&*e.into_panic()))
                }
                Err(_) => debug!("main loop cancelled"),
            }
        });

        let handle = LoopHandle { jobs };
        let timeouts = TimeoutDispatcher::spawn(handle.clone());
        Self {
            handle,
            timeouts,
            supervisor,
        }
    }

    pub fn handle(&self) -> LoopHandle<S> {
        self.handle.clone()
    }

    pub fn queue(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<(), DhtError> {
        self.handle.queue(job)
    }

    pub async fn queue_wait<R, F>(&self, job: F) -> Result<R, DhtError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.queue_wait(job).await
    }

    pub fn queue_wait_blocking<R, F>(&self, job: F) -> Result<R, DhtError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.queue_wait_blocking(job)
    }

    /// Runs `callback` on the loop every `period` for as long as it returns
    /// `true`.
    pub fn queue_timeout(
        &self,
        period: Duration,
        callback: impl FnMut(&mut S) -> bool + Send + 'static,
    ) -> TimeoutId {
        self.timeouts.add(period, callback)
    }

    pub fn cancel_timeout(&self, id: TimeoutId) -> bool {
        self.timeouts.remove(id)
    }

    /// Cancels every periodic callback.
    pub fn clear_timeouts(&self) {
        self.timeouts.clear();
    }

    /// False once the worker has exited, normally or by panic.
    pub fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
