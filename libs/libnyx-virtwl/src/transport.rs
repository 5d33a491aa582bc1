//! Ring transport
//!
//! Owns the two descriptor rings. The "in" ring carries host -> guest
//! messages in page-sized receive slots the guest keeps posted; the "out"
//! ring carries guest requests, each paired with space for the host's
//! synchronous reply. The halves are locked independently, so draining one
//! never waits on submission to the other.

use std::collections::HashMap;
use std::sync::{Arc, Condvar};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::queue::{AddError, DescChain, QueueError, Token, UsedChain, Virtqueue};
use crate::stats::Stats;
use crate::sync::RingLock;
use crate::wait::Completion;

/// Blocking behaviour of a call that may have to wait
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitMode {
    #[default]
    Blocking,
    NonBlocking,
}

impl WaitMode {
    pub fn is_nonblocking(self) -> bool {
        self == WaitMode::NonBlocking
    }
}

/// A receive slot and the number of bytes the host wrote into it
#[derive(Debug)]
pub struct InBuffer {
    data: Vec<u8>,
    len: usize,
}

impl InBuffer {
    /// Allocate an empty slot of `size` bytes.
    pub fn alloc(size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
        data.resize(size, 0);
        Ok(Self { data, len: 0 })
    }

    /// The bytes the host wrote
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn from_used(used: UsedChain) -> Self {
        let len = used.written.min(used.chain.writable.len());
        Self {
            data: used.chain.writable,
            len,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_contents(bytes: &[u8]) -> Self {
        let mut data = vec![0; bytes.len().max(4096)];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            data,
            len: bytes.len(),
        }
    }

    fn into_chain(self) -> DescChain {
        DescChain {
            readable: Vec::new(),
            writable: self.data,
        }
    }
}

struct InRing {
    queue: Box<dyn Virtqueue>,
    closed: bool,
}

struct OutRing {
    queue: Box<dyn Virtqueue>,
    pending: HashMap<Token, Completion>,
    next_token: Token,
    closed: bool,
}

/// The in/out descriptor ring pair
pub struct RingTransport {
    in_ring: RingLock<InRing>,
    out_ring: RingLock<OutRing>,
    /// Signalled whenever out-ring descriptors are freed
    out_space: Condvar,
    buffer_size: usize,
    capacity_wait: Duration,
    stats: Arc<Stats>,
}

impl RingTransport {
    pub fn new(
        in_queue: Box<dyn Virtqueue>,
        out_queue: Box<dyn Virtqueue>,
        buffer_size: usize,
        capacity_wait: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            in_ring: RingLock::new(
                InRing {
                    queue: in_queue,
                    closed: false,
                },
                "in_ring",
            ),
            out_ring: RingLock::new(
                OutRing {
                    queue: out_queue,
                    pending: HashMap::new(),
                    next_token: 1,
                    closed: false,
                },
                "out_ring",
            ),
            out_space: Condvar::new(),
            buffer_size,
            capacity_wait,
            stats,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity_wait(&self) -> Duration {
        self.capacity_wait
    }

    /// Post receive slots until the in ring has no free descriptors.
    ///
    /// On failure every slot already posted is reclaimed.
    pub fn fill_inbound(&self) -> Result<usize> {
        let mut ring = self.in_ring.lock();
        let mut posted = 0;
        while ring.queue.num_free() > 0 {
            let result = InBuffer::alloc(self.buffer_size).and_then(|buf| {
                ring.queue
                    .add(0, buf.into_chain())
                    .map_err(|err| Error::Queue(err.kind))
            });
            if let Err(err) = result {
                let mut reclaimed = 0;
                while ring.queue.detach_unused().is_some() {
                    reclaimed += 1;
                }
                error!("virtwl: failed to fill in ring: {} ({} slots reclaimed)", err, reclaimed);
                return Err(err);
            }
            posted += 1;
        }
        debug!("virtwl: posted {} receive slots", posted);
        Ok(posted)
    }

    /// Hand one slot back to the in ring without notifying the host.
    ///
    /// A slot the ring refuses is logged and released.
    pub fn post_receive_buffer(&self, buf: InBuffer) -> bool {
        let mut ring = self.in_ring.lock();
        self.post_locked(&mut ring, buf)
    }

    fn post_locked(&self, ring: &mut InRing, buf: InBuffer) -> bool {
        if ring.closed {
            Stats::bump(&self.stats.buffers_dropped);
            return false;
        }
        match ring.queue.add(0, buf.into_chain()) {
            Ok(()) => {
                Stats::bump(&self.stats.buffers_recycled);
                true
            }
            Err(AddError { kind, .. }) => {
                warn!("virtwl: failed to give inbuf to host: {}", kind);
                Stats::bump(&self.stats.buffers_dropped);
                false
            }
        }
    }

    /// Return consumed slots and notify the host once.
    pub fn recycle<I>(&self, bufs: I)
    where
        I: IntoIterator<Item = InBuffer>,
    {
        let mut ring = self.in_ring.lock();
        let mut posted = false;
        for buf in bufs {
            posted |= self.post_locked(&mut ring, buf);
        }
        if posted {
            ring.queue.kick();
        }
    }

    /// Notify the host that receive slots are available.
    pub fn kick_inbound(&self) {
        self.in_ring.lock().queue.kick();
    }

    /// Queue one request plus its reply space on the out ring.
    ///
    /// With no free descriptors a non-blocking caller gets
    /// [`Error::WouldBlock`]; a blocking caller waits up to the capacity
    /// wait for space per attempt and gets [`Error::Busy`] if none appears.
    pub fn submit(&self, chain: DescChain, completion: Completion, mode: WaitMode) -> Result<()> {
        let mut ring = self.out_ring.lock();
        let mut chain = chain;
        loop {
            if ring.closed {
                return Err(Error::Disconnected);
            }
            let token = ring.next_token;
            match ring.queue.add(token, chain) {
                Ok(()) => {
                    ring.next_token = ring.next_token.wrapping_add(1);
                    ring.pending.insert(token, completion);
                    ring.queue.kick();
                    trace!("virtwl: submitted out txn {}", token);
                    return Ok(());
                }
                Err(AddError {
                    kind: QueueError::NoSpace,
                    chain: back,
                }) => {
                    if mode.is_nonblocking() {
                        return Err(Error::WouldBlock);
                    }
                    let needed = back.desc_count();
                    chain = back;
                    let (guard, timed_out) = ring.wait_timeout_while(
                        &self.out_space,
                        self.capacity_wait,
                        |ring| !ring.closed && ring.queue.num_free() < needed,
                    );
                    ring = guard;
                    if timed_out {
                        return Err(Error::Busy(self.capacity_wait));
                    }
                }
                Err(AddError { kind, .. }) => {
                    error!("virtwl: out ring rejected txn: {}", kind);
                    return Err(Error::Queue(kind));
                }
            }
        }
    }

    /// Pop every finished out-ring chain and fulfil its completion.
    pub fn drain_outbound(&self) -> usize {
        let mut ring = self.out_ring.lock();
        let mut drained = 0;
        while let Some(used) = ring.queue.pop_used() {
            drained += 1;
            match ring.pending.remove(&used.token) {
                Some(completion) => completion.complete(Ok(used)),
                None => warn!("virtwl: out ring returned unknown txn {}", used.token),
            }
        }
        drop(ring);
        if drained > 0 {
            self.out_space.notify_all();
        }
        drained
    }

    /// Pop every filled receive slot and hand it to `dispatch`.
    ///
    /// Slots `dispatch` gives back are reposted; the host is notified once
    /// after the whole pass.
    pub fn drain_inbound<F>(&self, mut dispatch: F) -> usize
    where
        F: FnMut(InBuffer) -> Option<InBuffer>,
    {
        let mut drained = 0;
        let mut kick = false;
        loop {
            let used = self.in_ring.lock().queue.pop_used();
            let Some(used) = used else {
                break;
            };
            drained += 1;
            if let Some(buf) = dispatch(InBuffer::from_used(used)) {
                kick |= self.post_receive_buffer(buf);
            }
        }
        if kick {
            self.kick_inbound();
        }
        drained
    }

    /// Whether the out ring can take a request right now.
    pub fn out_has_capacity(&self) -> bool {
        let ring = self.out_ring.lock();
        !ring.closed && ring.queue.num_free() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.out_ring.lock().closed
    }

    /// Tear the transport down.
    ///
    /// Unconsumed receive slots are reclaimed, finished requests are
    /// completed, every other pending completion fails with
    /// [`Error::Disconnected`], and capacity waiters are woken.
    pub fn shutdown(&self) {
        {
            let mut ring = self.in_ring.lock();
            ring.closed = true;
            let mut reclaimed = 0;
            while ring.queue.detach_unused().is_some() {
                reclaimed += 1;
            }
            debug!("virtwl: reclaimed {} receive slots", reclaimed);
        }

        let mut ring = self.out_ring.lock();
        ring.closed = true;
        while let Some(used) = ring.queue.pop_used() {
            if let Some(completion) = ring.pending.remove(&used.token) {
                completion.complete(Ok(used));
            }
        }
        while let Some((token, _)) = ring.queue.detach_unused() {
            trace!("virtwl: detached unsent txn {}", token);
        }
        for (_, completion) in ring.pending.drain() {
            completion.complete(Err(Error::Disconnected));
        }
        drop(ring);
        self.out_space.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{mem_queue, DeviceQueue};
    use std::thread;
    use std::time::Instant;

    fn transport(
        in_size: usize,
        out_size: usize,
        wait: Duration,
    ) -> (RingTransport, DeviceQueue, DeviceQueue) {
        let (in_q, in_dev) = mem_queue("in", in_size);
        let (out_q, out_dev) = mem_queue("out", out_size);
        let transport = RingTransport::new(
            Box::new(in_q),
            Box::new(out_q),
            4096,
            wait,
            Arc::new(Stats::default()),
        );
        (transport, in_dev, out_dev)
    }

    fn txn() -> DescChain {
        DescChain {
            readable: vec![1; 12],
            writable: vec![0; 8],
        }
    }

    #[test]
    fn test_fill_inbound_posts_every_slot() {
        let (transport, in_dev, _) = transport(4, 2, Duration::from_millis(10));
        assert_eq!(transport.fill_inbound().unwrap(), 4);
        assert_eq!(in_dev.num_avail(), 4);
        let slot = in_dev.pop_avail().unwrap();
        assert_eq!(slot.chain.writable.len(), 4096);
        assert!(slot.chain.readable.is_empty());
    }

    #[test]
    fn test_nonblocking_submit_without_capacity() {
        let (transport, _, out_dev) = transport(1, 2, Duration::from_secs(5));
        transport
            .submit(txn(), Completion::new(), WaitMode::NonBlocking)
            .unwrap();
        assert_eq!(out_dev.kicks(), 1);

        let started = Instant::now();
        assert_eq!(
            transport.submit(txn(), Completion::new(), WaitMode::NonBlocking),
            Err(Error::WouldBlock)
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!transport.out_has_capacity());
    }

    #[test]
    fn test_blocking_submit_times_out_busy() {
        let (transport, _, _) = transport(1, 2, Duration::from_millis(20));
        transport
            .submit(txn(), Completion::new(), WaitMode::Blocking)
            .unwrap();
        assert_eq!(
            transport.submit(txn(), Completion::new(), WaitMode::Blocking),
            Err(Error::Busy(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_blocking_submit_resumes_when_space_frees() {
        let (transport, _, out_dev) = transport(1, 2, Duration::from_secs(5));
        let transport = Arc::new(transport);
        let first = Completion::new();
        transport
            .submit(txn(), first.clone(), WaitMode::Blocking)
            .unwrap();

        let host = {
            let transport = transport.clone();
            thread::spawn(move || {
                let avail = out_dev.wait_avail(Duration::from_secs(5)).unwrap();
                thread::sleep(Duration::from_millis(20));
                out_dev.push_used(avail, 8);
                transport.drain_outbound();
            })
        };

        transport
            .submit(txn(), Completion::new(), WaitMode::Blocking)
            .unwrap();
        host.join().unwrap();
        assert_eq!(first.wait().unwrap().written, 8);
    }

    #[test]
    fn test_drain_inbound_recycles_and_kicks_once() {
        let (transport, in_dev, _) = transport(3, 2, Duration::from_millis(10));
        transport.fill_inbound().unwrap();
        let kicks = in_dev.kicks();
        for _ in 0..3 {
            let avail = in_dev.pop_avail().unwrap();
            in_dev.push_used(avail, 16);
        }

        let mut seen = Vec::new();
        let drained = transport.drain_inbound(|buf| {
            seen.push(buf.len());
            Some(buf)
        });
        assert_eq!(drained, 3);
        assert_eq!(seen, vec![16, 16, 16]);
        assert_eq!(in_dev.num_avail(), 3);
        assert_eq!(in_dev.kicks(), kicks + 1);
    }

    #[test]
    fn test_drain_inbound_keeps_retained_buffers() {
        let (transport, in_dev, _) = transport(2, 2, Duration::from_millis(10));
        transport.fill_inbound().unwrap();
        let kicks = in_dev.kicks();
        let avail = in_dev.pop_avail().unwrap();
        in_dev.push_used(avail, 8);

        let mut kept = Vec::new();
        transport.drain_inbound(|buf| {
            kept.push(buf);
            None
        });
        assert_eq!(kept.len(), 1);
        assert_eq!(in_dev.num_avail(), 1);
        assert_eq!(in_dev.kicks(), kicks);

        transport.recycle(kept);
        assert_eq!(in_dev.num_avail(), 2);
        assert_eq!(in_dev.kicks(), kicks + 1);
    }

    #[test]
    fn test_shutdown_resolves_pending_completions() {
        let (transport, in_dev, out_dev) = transport(2, 4, Duration::from_secs(5));
        transport.fill_inbound().unwrap();
        let answered = Completion::new();
        let abandoned = Completion::new();
        transport
            .submit(txn(), answered.clone(), WaitMode::Blocking)
            .unwrap();
        transport
            .submit(txn(), abandoned.clone(), WaitMode::Blocking)
            .unwrap();
        let first = out_dev.pop_avail().unwrap();
        out_dev.push_used(first, 8);

        transport.shutdown();
        assert!(answered.wait().is_ok());
        assert_eq!(abandoned.wait().unwrap_err(), Error::Disconnected);
        assert_eq!(in_dev.num_avail(), 0);
        assert_eq!(
            transport.submit(txn(), Completion::new(), WaitMode::NonBlocking),
            Err(Error::Disconnected)
        );
        assert!(!transport.post_receive_buffer(InBuffer::alloc(64).unwrap()));
    }
}
