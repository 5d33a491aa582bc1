//! Virtual file descriptors
//!
//! A [`Vfd`] is a connection context or a shared-memory region known to
//! both guest and host by a numeric id. Inbound RECV messages addressed to
//! it wait in its [`Inbox`] as [`QueueEntry`]s, which keep the receive slot
//! they arrived in until a reader has consumed every byte and every
//! attached id.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar};

use tracing::warn;

use crate::protocol::{VfdTransfer, VFD_HOST_VFD_ID_BIT, VFD_ILLEGAL_SIGN_BIT};
use crate::sync::{ObjectLock, OrderedGuard, OBJECT};
use crate::transport::InBuffer;
use crate::wait::{CancelToken, Wakeable};

/// Shared numeric VFD identifier
pub type VfdId = u32;

/// Sentinel id: "no vfd"
pub const VFD_ID_NONE: VfdId = 0;

bitflags::bitflags! {
    /// VFD capability flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VfdFlags: u32 {
        /// Guest may write the backing memory
        const WRITE = 1 << 0;
        /// Guest may map the backing memory
        const MAP = 1 << 1;
        /// Carries wayland control messages
        const CONTROL = 1 << 2;
    }
}

/// Whether `id` is a well-formed host-assigned id.
pub fn is_host_id(id: VfdId) -> bool {
    id & VFD_HOST_VFD_ID_BIT != 0 && id & VFD_ILLEGAL_SIGN_BIT == 0
}

/// A retained RECV slot and how far the reader has got through it
#[derive(Debug)]
pub struct QueueEntry {
    buf: InBuffer,
    msg: VfdTransfer,
    /// Attached ids already handed out
    vfd_offset: u32,
    /// Payload bytes already handed out
    data_offset: usize,
}

impl QueueEntry {
    /// `msg` must have been decoded from `buf`.
    pub fn new(buf: InBuffer, msg: VfdTransfer) -> Self {
        Self {
            buf,
            msg,
            vfd_offset: 0,
            data_offset: 0,
        }
    }

    pub fn data_len(&self) -> usize {
        self.buf.len().saturating_sub(self.msg.data_offset())
    }

    fn data_remaining(&self) -> usize {
        self.data_len() - self.data_offset
    }

    fn vfds_remaining(&self) -> u32 {
        self.msg.vfd_count - self.vfd_offset
    }

    /// Both cursors are at their ends
    pub fn is_consumed(&self) -> bool {
        self.vfd_offset >= self.msg.vfd_count && self.data_offset >= self.data_len()
    }

    pub fn into_buffer(self) -> InBuffer {
        self.buf
    }
}

/// FIFO of not yet fully consumed RECV messages
#[derive(Debug, Default)]
pub struct Inbox {
    entries: VecDeque<QueueEntry>,
    /// Bumped on every insertion; readers wait for it to move
    arrivals: u64,
}

impl Inbox {
    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
        self.arrivals = self.arrivals.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn arrivals(&self) -> u64 {
        self.arrivals
    }

    /// Remove entry `index` if consumed, moving its slot to `released`.
    /// Returns whether the entry stayed.
    fn settle(&mut self, index: usize, released: &mut Vec<InBuffer>) -> bool {
        if !self.entries[index].is_consumed() {
            return true;
        }
        if let Some(entry) = self.entries.remove(index) {
            released.push(entry.into_buffer());
        }
        false
    }

    /// Copy queued payload bytes into `out` in arrival order.
    ///
    /// Never blocks. Slots whose both cursors reach their ends are moved to
    /// `released` for the caller to hand back to the ring.
    pub fn read_bytes(&mut self, out: &mut [u8], released: &mut Vec<InBuffer>) -> usize {
        let mut read = 0;
        let mut index = 0;
        while index < self.entries.len() {
            if read >= out.len() {
                break;
            }
            let entry = &mut self.entries[index];
            let remaining = entry.data_remaining();
            if remaining > 0 {
                let count = remaining.min(out.len() - read);
                let start = entry.msg.data_offset() + entry.data_offset;
                out[read..read + count].copy_from_slice(&entry.buf.bytes()[start..start + count]);
                entry.data_offset += count;
                read += count;
            }
            if self.settle(index, released) {
                index += 1;
            }
        }
        read
    }

    /// Hand out up to `max` attached ids in arrival order, resolved through
    /// `resolve`. Ids that do not resolve are skipped with a diagnostic but
    /// still consumed.
    pub fn read_descriptors<F>(
        &mut self,
        max: usize,
        mut resolve: F,
        released: &mut Vec<InBuffer>,
    ) -> Vec<Arc<Vfd>>
    where
        F: FnMut(VfdId) -> Option<Arc<Vfd>>,
    {
        let mut vfds = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if vfds.len() >= max {
                break;
            }
            let entry = &mut self.entries[index];
            while entry.vfds_remaining() > 0 && vfds.len() < max {
                let id = entry.msg.vfd_id_at(entry.buf.bytes(), entry.vfd_offset);
                entry.vfd_offset += 1;
                match resolve(id) {
                    Some(vfd) => vfds.push(vfd),
                    None => warn!("virtwl: received a vfd with unrecognized id: {}", id),
                }
            }
            if self.settle(index, released) {
                index += 1;
            }
        }
        vfds
    }

    /// Release fully consumed entries anywhere in the queue.
    pub fn sweep(&mut self, released: &mut Vec<InBuffer>) {
        let mut index = 0;
        while index < self.entries.len() {
            if self.settle(index, released) {
                index += 1;
            }
        }
    }

    /// Take every queued slot, consumed or not.
    pub fn drain(&mut self) -> Vec<InBuffer> {
        self.entries.drain(..).map(QueueEntry::into_buffer).collect()
    }
}

/// Mutable VFD state, guarded by the VFD's own lock
#[derive(Debug, Default)]
pub struct VfdState {
    pub flags: VfdFlags,
    /// First backing page frame when mappable
    pub pfn: u64,
    /// Backing size in bytes when mappable
    pub size: u32,
    pub inbox: Inbox,
    /// Removed from the registry; nothing may be queued any more
    pub unlinked: bool,
    /// Host closed its end
    pub hung_up: bool,
}

/// One virtual file descriptor
#[derive(Debug)]
pub struct Vfd {
    id: VfdId,
    state: ObjectLock<VfdState>,
    /// Signalled on inbox insertion, hang-up, unlink and cancellation
    readable: Condvar,
    /// Set once the host has confirmed the VFD
    published: AtomicBool,
    /// Live user handles; the last one to go closes the VFD
    handles: AtomicUsize,
}

impl Vfd {
    /// A guest-created VFD awaiting the host's confirmation.
    pub fn pending(id: VfdId) -> Self {
        Self {
            id,
            state: ObjectLock::new(VfdState::default(), "vfd"),
            readable: Condvar::new(),
            published: AtomicBool::new(false),
            handles: AtomicUsize::new(0),
        }
    }

    /// A fully described VFD.
    pub fn new(id: VfdId, flags: VfdFlags, pfn: u64, size: u32) -> Self {
        let vfd = Self::pending(id);
        {
            let mut state = vfd.lock();
            state.flags = flags;
            state.pfn = pfn;
            state.size = size;
        }
        vfd.publish();
        vfd
    }

    pub fn id(&self) -> VfdId {
        self.id
    }

    pub fn lock(&self) -> OrderedGuard<'_, VfdState, OBJECT> {
        self.state.lock()
    }

    pub fn publish(&self) {
        self.published.store(true, Ordering::Release);
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Count a new user handle.
    pub fn acquire_handle(&self) {
        self.handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a user handle. Returns true for the last one.
    pub fn release_handle(&self) -> bool {
        self.handles.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    /// Queue an entry and wake readers. The caller holds this VFD's lock.
    pub fn deliver(&self, state: &mut VfdState, entry: QueueEntry) {
        state.inbox.push(entry);
        self.readable.notify_all();
    }

    /// Wake readers after a state change made under this VFD's lock.
    pub fn notify(&self) {
        self.readable.notify_all();
    }

    /// Sleep until something arrives after `seen`, the VFD is unlinked or
    /// hung up, or `cancel` fires.
    pub fn wait_readable<'a>(
        &'a self,
        guard: OrderedGuard<'a, VfdState, OBJECT>,
        seen: u64,
        cancel: Option<&CancelToken>,
    ) -> OrderedGuard<'a, VfdState, OBJECT> {
        guard.wait_while(&self.readable, |state| {
            state.inbox.arrivals() == seen
                && !state.unlinked
                && !state.hung_up
                && !cancel.is_some_and(CancelToken::is_cancelled)
        })
    }
}

impl Wakeable for Vfd {
    fn wake_all(&self) {
        let _state = self.lock();
        self.readable.notify_all();
    }
}
