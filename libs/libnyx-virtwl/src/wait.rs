//! Blocking primitives: one-shot completions and cancellation tokens

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

use crate::error::{Error, Result};
use crate::queue::UsedChain;

struct CompletionInner {
    result: Mutex<Option<Result<UsedChain>>>,
    done: Condvar,
}

/// One outstanding outbound request's reply signal.
///
/// Fulfilled exactly once: with the used chain when the host answers, or
/// with a failure when the transport is torn down.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                result: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// Fulfil the completion. Later calls are ignored.
    pub fn complete(&self, result: Result<UsedChain>) {
        let mut slot = self
            .inner
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
            self.inner.done.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Block until fulfilled. No timeout: the transport resolves every
    /// completion, on teardown if nothing else.
    pub fn wait(self) -> Result<UsedChain> {
        let slot = self
            .inner
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut slot = self
            .inner
            .done
            .wait_while(slot, |result| result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take().unwrap_or(Err(Error::Disconnected))
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Something a cancellation must wake.
pub trait Wakeable: Send + Sync {
    /// Wake every waiter. Implementations take the lock their waiters
    /// check the condition under, so the wake cannot be lost.
    fn wake_all(&self);
}

struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<dyn Wakeable>>>,
}

/// Cancels blocking receives from another thread.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel every current and future wait bound to this token.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let waiters: Vec<_> = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.wake_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a waiter to be woken by [`cancel`](Self::cancel).
    pub(crate) fn register(&self, waiter: Weak<dyn Wakeable>) {
        let mut waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(waiter);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
