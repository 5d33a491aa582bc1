//! Descriptor ring seam
//!
//! [`Virtqueue`] is the narrow interface the transport drives: hand the
//! device a descriptor chain, pop the chains it has finished with, reclaim
//! chains it never touched. [`mem_queue`] builds an in-memory split ring
//! whose device half ([`DeviceQueue`]) plays the host in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Driver-chosen cookie returned with a used chain
pub type Token = u64;

/// Called by the device after it returns chains to the used ring
pub type QueueCallback = Arc<dyn Fn() + Send + Sync>;

/// Ring errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("no free descriptors")]
    NoSpace,
    #[error("descriptor chain is empty")]
    EmptyChain,
    #[error("ring is broken")]
    Broken,
}

/// A device-readable part followed by a device-writable part
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DescChain {
    /// Bytes the device reads
    pub readable: Vec<u8>,
    /// Space the device may write; its length is the capacity offered
    pub writable: Vec<u8>,
}

impl DescChain {
    pub fn readable(bytes: Vec<u8>) -> Self {
        Self {
            readable: bytes,
            writable: Vec::new(),
        }
    }

    pub fn writable(len: usize) -> Self {
        Self {
            readable: Vec::new(),
            writable: vec![0; len],
        }
    }

    /// Descriptors this chain occupies while posted
    pub fn desc_count(&self) -> usize {
        usize::from(!self.readable.is_empty()) + usize::from(!self.writable.is_empty())
    }
}

/// A chain handed back by the device
#[derive(Debug)]
pub struct UsedChain {
    pub token: Token,
    pub chain: DescChain,
    /// Bytes the device wrote into `chain.writable`
    pub written: usize,
}

/// A rejected chain, returned to the caller for reuse or release
#[derive(Debug)]
pub struct AddError {
    pub kind: QueueError,
    pub chain: DescChain,
}

/// Driver side of a descriptor ring
pub trait Virtqueue: Send {
    /// Expose a chain to the device. Not visible to a sleeping device until [`kick`](Self::kick).
    fn add(&mut self, token: Token, chain: DescChain) -> Result<(), AddError>;

    /// Take the next chain the device has finished with.
    fn pop_used(&mut self) -> Option<UsedChain>;

    /// Reclaim a chain the device has not started on.
    fn detach_unused(&mut self) -> Option<(Token, DescChain)>;

    /// Free descriptors.
    fn num_free(&self) -> usize;

    /// Notify the device that new chains are available.
    fn kick(&mut self);

    /// Install the used-ring notification.
    fn set_callback(&mut self, callback: QueueCallback);
}

struct RingState {
    num_free: usize,
    avail: VecDeque<(Token, DescChain)>,
    used: VecDeque<UsedChain>,
    kicks: u64,
    broken: bool,
}

struct Shared {
    name: &'static str,
    size: usize,
    state: Mutex<RingState>,
    kicked: Condvar,
    callback: Mutex<Option<QueueCallback>>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build an in-memory ring of `size` descriptors.
pub fn mem_queue(name: &'static str, size: usize) -> (MemQueue, DeviceQueue) {
    let shared = Arc::new(Shared {
        name,
        size,
        state: Mutex::new(RingState {
            num_free: size,
            avail: VecDeque::new(),
            used: VecDeque::new(),
            kicks: 0,
            broken: false,
        }),
        kicked: Condvar::new(),
        callback: Mutex::new(None),
    });
    (
        MemQueue {
            shared: shared.clone(),
        },
        DeviceQueue { shared },
    )
}

/// Driver half of an in-memory ring
pub struct MemQueue {
    shared: Arc<Shared>,
}

impl MemQueue {
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }
}

impl Virtqueue for MemQueue {
    fn add(&mut self, token: Token, chain: DescChain) -> Result<(), AddError> {
        let needed = chain.desc_count();
        let mut state = self.shared.state();
        let kind = if state.broken {
            QueueError::Broken
        } else if needed == 0 {
            QueueError::EmptyChain
        } else if needed > state.num_free {
            QueueError::NoSpace
        } else {
            state.num_free -= needed;
            state.avail.push_back((token, chain));
            return Ok(());
        };
        Err(AddError { kind, chain })
    }

    fn pop_used(&mut self) -> Option<UsedChain> {
        let mut state = self.shared.state();
        let used = state.used.pop_front()?;
        state.num_free += used.chain.desc_count();
        Some(used)
    }

    fn detach_unused(&mut self) -> Option<(Token, DescChain)> {
        let mut state = self.shared.state();
        let (token, chain) = state.avail.pop_front()?;
        state.num_free += chain.desc_count();
        Some((token, chain))
    }

    fn num_free(&self) -> usize {
        self.shared.state().num_free
    }

    fn kick(&mut self) {
        let mut state = self.shared.state();
        state.kicks += 1;
        drop(state);
        self.shared.kicked.notify_all();
    }

    fn set_callback(&mut self, callback: QueueCallback) {
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }
}

/// A chain the device has taken off the available ring
#[derive(Debug)]
pub struct AvailChain {
    pub token: Token,
    pub chain: DescChain,
}

/// Device half of an in-memory ring
#[derive(Clone)]
pub struct DeviceQueue {
    shared: Arc<Shared>,
}

impl DeviceQueue {
    /// Take the oldest available chain.
    pub fn pop_avail(&self) -> Option<AvailChain> {
        let (token, chain) = self.shared.state().avail.pop_front()?;
        Some(AvailChain { token, chain })
    }

    /// Wait up to `timeout` for an available chain.
    pub fn wait_avail(&self, timeout: Duration) -> Option<AvailChain> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state();
        loop {
            if let Some((token, chain)) = state.avail.pop_front() {
                return Some(AvailChain { token, chain });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .kicked
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Return a chain to the driver and fire its callback.
    pub fn push_used(&self, avail: AvailChain, written: usize) {
        let written = written.min(avail.chain.writable.len());
        self.shared.state().used.push_back(UsedChain {
            token: avail.token,
            chain: avail.chain,
            written,
        });
        let callback = self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Make every later `add` fail.
    pub fn break_ring(&self) {
        self.shared.state().broken = true;
    }

    /// Number of kicks received so far
    pub fn kicks(&self) -> u64 {
        self.shared.state().kicks
    }

    /// Chains waiting on the available ring
    pub fn num_avail(&self) -> usize {
        self.shared.state().avail.len()
    }

    /// Chains the driver has not popped from the used ring yet
    pub fn num_used(&self) -> usize {
        self.shared.state().used.len()
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_descriptor_accounting() {
        let (mut queue, device) = mem_queue("test", 3);
        assert_eq!(device.size(), 3);
        let txn = DescChain {
            readable: vec![1, 2, 3],
            writable: vec![0; 8],
        };
        assert_eq!(txn.desc_count(), 2);
        queue.add(1, txn).unwrap();
        assert_eq!(queue.num_free(), 1);

        let err = queue
            .add(2, DescChain {
                readable: vec![1],
                writable: vec![0; 1],
            })
            .unwrap_err();
        assert_eq!(err.kind, QueueError::NoSpace);
        assert_eq!(err.chain.readable, vec![1]);

        queue.add(3, DescChain::writable(4)).unwrap();
        assert_eq!(queue.num_free(), 0);

        // In flight on the device: still counted as used descriptors.
        let mut avail = device.pop_avail().unwrap();
        assert_eq!(avail.token, 1);
        assert_eq!(queue.num_free(), 0);

        avail.chain.writable[..2].copy_from_slice(&[9, 9]);
        device.push_used(avail, 2);
        assert_eq!(device.num_used(), 1);
        let used = queue.pop_used().unwrap();
        assert_eq!(device.num_used(), 0);
        assert_eq!(used.token, 1);
        assert_eq!(used.written, 2);
        assert_eq!(&used.chain.writable[..2], &[9, 9]);
        assert_eq!(queue.num_free(), 2);

        let (token, _) = queue.detach_unused().unwrap();
        assert_eq!(token, 3);
        assert_eq!(queue.num_free(), 3);
        assert!(queue.detach_unused().is_none());
    }

    #[test]
    fn test_empty_and_broken() {
        let (mut queue, device) = mem_queue("test", 4);
        assert_eq!(
            queue.add(1, DescChain::default()).unwrap_err().kind,
            QueueError::EmptyChain
        );
        device.break_ring();
        assert_eq!(
            queue.add(1, DescChain::writable(1)).unwrap_err().kind,
            QueueError::Broken
        );
    }

    #[test]
    fn test_push_used_fires_callback() {
        let (mut queue, device) = mem_queue("test", 4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        queue.set_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        queue.add(7, DescChain::writable(16)).unwrap();
        queue.kick();
        assert_eq!(device.kicks(), 1);

        let avail = device.wait_avail(Duration::from_millis(10)).unwrap();
        device.push_used(avail, 100);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Clamped to the writable capacity.
        assert_eq!(queue.pop_used().unwrap().written, 16);
    }

    #[test]
    fn test_wait_avail_times_out() {
        let (_queue, device) = mem_queue("test", 2);
        assert!(device.wait_avail(Duration::from_millis(5)).is_none());
    }
}
