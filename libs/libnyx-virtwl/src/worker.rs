//! Notification-driven work threads
//!
//! A [`Worker`] runs one job on its own thread each time it is notified.
//! Notifications that arrive while the job is already scheduled collapse
//! into a single run; one that arrives while the job is running schedules
//! exactly one more.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::queue::QueueCallback;

#[derive(Default)]
struct Schedule {
    scheduled: bool,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    schedule: Mutex<Schedule>,
    wake: Condvar,
    runs: AtomicU64,
}

impl Shared {
    fn schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules a run of its worker's job
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    pub fn notify(&self) {
        let mut schedule = self.shared.schedule();
        if schedule.scheduled || schedule.stopped {
            return;
        }
        schedule.scheduled = true;
        drop(schedule);
        self.shared.wake.notify_one();
    }

    /// As a ring completion callback
    pub fn into_callback(self) -> QueueCallback {
        Arc::new(move || self.notify())
    }
}

/// A named thread running one job on demand
pub struct Worker {
    name: String,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, mut job: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let schedule = thread_shared.schedule();
                let mut schedule = thread_shared
                    .wake
                    .wait_while(schedule, |s| !s.scheduled && !s.stopped)
                    .unwrap_or_else(PoisonError::into_inner);
                if schedule.stopped {
                    break;
                }
                schedule.scheduled = false;
                drop(schedule);
                job();
                thread_shared.runs.fetch_add(1, Ordering::Relaxed);
            })
            .map_err(|err| {
                error!("virtwl: failed to start worker {}: {}", name, err);
                Error::OutOfMemory
            })?;
        debug!("virtwl: started worker {}", name);
        Ok(Self {
            name: name.to_string(),
            shared,
            thread: Some(thread),
        })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            shared: self.shared.clone(),
        }
    }

    /// Completed job runs
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::Relaxed)
    }

    /// Stop the thread after any run in progress and join it.
    pub fn stop(&mut self) {
        self.shared.schedule().stopped = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("virtwl: worker {} panicked", self.name);
            }
            debug!("virtwl: stopped worker {}", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
