use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, trace};

use super::main_loop::{panic_message, LoopHandle};

pub type TimeoutId = u64;

type Callback<S> = Box<dyn FnMut(&mut S) -> bool + Send>;

struct Entry<S> {
    id: TimeoutId,
    period: Duration,
    trigger: Instant,
    callback: Callback<S>,
}

impl<S> PartialEq for Entry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.trigger == other.trigger && self.id == other.id
    }
}

impl<S> Eq for Entry<S> {}

impl<S> Ord for Entry<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.trigger, self.id).cmp(&(other.trigger, other.id))
    }
}

impl<S> PartialOrd for Entry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Schedule<S> {
    entries: BinaryHeap<Reverse<Entry<S>>>,
    /// Removed while its callback was running on the loop.
    cancelled: HashSet<TimeoutId>,
    running: Option<TimeoutId>,
    next_id: TimeoutId,
}

struct Shared<S> {
    schedule: Mutex<Schedule<S>>,
    wake: Notify,
}

/// Fires periodic callbacks on a [`MainLoop`](super::main_loop::MainLoop).
///
/// Runs as its own task, sleeping until the earliest trigger; the callback
/// itself is posted to the loop. Periods missed while the loop was busy are
/// skipped rather than replayed.
pub struct TimeoutDispatcher<S> {
    shared: Arc<Shared<S>>,
    task: JoinHandle<()>,
}

impl<S: Send + 'static> TimeoutDispatcher<S> {
    pub fn spawn(handle: LoopHandle<S>) -> Self {
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule {
                entries: BinaryHeap::new(),
                cancelled: HashSet::new(),
                running: None,
                next_id: 0,
            }),
            wake: Notify::new(),
        });
        let task = tokio::spawn(run(Arc::clone(&shared), handle));
        Self { shared, task }
    }

    pub fn add(
        &self,
        period: Duration,
        callback: impl FnMut(&mut S) -> bool + Send + 'static,
    ) -> TimeoutId {
        let mut schedule = self.shared.schedule.lock();
        let id = schedule.next_id;
        schedule.next_id += 1;
        schedule.entries.push(Reverse(Entry {
            id,
            period,
            trigger: Instant::now() + period,
            callback: Box::new(callback),
        }));
        drop(schedule);
        self.shared.wake.notify_one();
        id
    }

    pub fn remove(&self, id: TimeoutId) -> bool {
        let mut schedule = self.shared.schedule.lock();
        let before = schedule.entries.len();
        schedule.entries.retain(|Reverse(entry)| entry.id != id);
        let mut removed = schedule.entries.len() != before;
        if schedule.running == Some(id) {
            schedule.cancelled.insert(id);
            removed = true;
        }
        drop(schedule);
        self.shared.wake.notify_one();
        removed
    }

    pub fn clear(&self) {
        let mut schedule = self.shared.schedule.lock();
        schedule.entries.clear();
        if let Some(id) = schedule.running {
            schedule.cancelled.insert(id);
        }
        drop(schedule);
        self.shared.wake.notify_one();
    }
}

impl<S> Drop for TimeoutDispatcher<S> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S: Send + 'static>(shared: Arc<Shared<S>>, handle: LoopHandle<S>) {
    loop {
        let next = shared
            .schedule
            .lock()
            .entries
            .peek()
            .map(|Reverse(entry)| entry.trigger);

        match next {
            None => shared.wake.notified().await,
            Some(trigger) => {
                tokio::select! {
                    _ = sleep_until(trigger) => {}
                    _ = shared.wake.notified() => continue,
                }
            }
        }

        let due = {
            let mut schedule = shared.schedule.lock();
            let now = Instant::now();
            if schedule
                .entries
                .peek()
                .is_some_and(|Reverse(entry)| entry.trigger <= now)
            {
                let due = schedule.entries.pop().map(|Reverse(entry)| entry);
                schedule.running = due.as_ref().map(|entry| entry.id);
                due
            } else {
                None
            }
        };
        let Some(Entry {
            id,
            period,
            trigger,
            mut callback,
        }) = due
        else {
            continue;
        };

        let fired = match handle.submit_waiting(move |state| {
            let again = callback(state);
            (callback, again)
        }) {
            Ok(rx) => rx.await,
            Err(_) => {
                trace!("main loop closed, timeout dispatcher exiting");
                return;
            }
        };

        let mut schedule = shared.schedule.lock();
        schedule.running = None;
        let cancelled = schedule.cancelled.remove(&id);
        let (callback, again) = match fired {
            Ok(Ok(fired)) => fired,
            Ok(Err(payload)) => {
                error!(
                    "timeout {} dropped, callback panicked: {}",
                    id,
                    panic_message(&*payload)
                );
                continue;
            }
            Err(_) => {
                trace!("main loop closed, timeout dispatcher exiting");
                return;
            }
        };
        if again && !cancelled {
            let now = Instant::now();
            let mut next = trigger + period;
            if next <= now {
                next = now + period;
            }
            schedule.entries.push(Reverse(Entry {
                id,
                period,
                trigger: next,
                callback,
            }));
        }
    }
}
