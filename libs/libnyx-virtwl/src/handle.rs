//! Per-VFD user handles
//!
//! A [`VfdHandle`] is what a client holds for one VFD: it sends and
//! receives on it, maps its memory, polls it, and closes it. Dropping an
//! open handle closes it.

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::device::Core;
use crate::error::{Error, Result};
use crate::memory::{is_page_aligned, page_align, Access, Mapping};
use crate::stats::Stats;
use crate::transport::{InBuffer, WaitMode};
use crate::vfd::{Vfd, VfdFlags, VfdId};
use crate::wait::{CancelToken, Wakeable};

bitflags::bitflags! {
    /// Readiness reported by [`VfdHandle::poll`]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        const IN = 0x001;
        const OUT = 0x004;
        const HUP = 0x010;
        const RDNORM = 0x040;
        const WRNORM = 0x100;
    }
}

/// Result of a receive
#[derive(Debug, Default)]
pub struct Received {
    /// Payload bytes copied into the caller's buffer
    pub bytes: usize,
    /// Descriptors that arrived with the payload
    pub vfds: Vec<VfdHandle>,
}

impl Received {
    /// Nothing was received: the host hung up and the inbox is empty.
    pub fn is_eof(&self) -> bool {
        self.bytes == 0 && self.vfds.is_empty()
    }
}

/// An open VFD
pub struct VfdHandle {
    core: Arc<Core>,
    vfd: Arc<Vfd>,
    mode: WaitMode,
    open: bool,
}

impl fmt::Debug for VfdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfdHandle")
            .field("id", &self.vfd.id())
            .field("mode", &self.mode)
            .field("open", &self.open)
            .finish()
    }
}

impl VfdHandle {
    pub(crate) fn new(core: Arc<Core>, vfd: Arc<Vfd>, mode: WaitMode) -> Self {
        vfd.acquire_handle();
        Self {
            core,
            vfd,
            mode,
            open: true,
        }
    }

    pub fn id(&self) -> VfdId {
        self.vfd.id()
    }

    pub fn flags(&self) -> VfdFlags {
        self.vfd.lock().flags
    }

    /// Backing size in bytes, zero for contexts
    pub fn size(&self) -> u32 {
        self.vfd.lock().size
    }

    pub fn mode(&self) -> WaitMode {
        self.mode
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.mode = if nonblocking {
            WaitMode::NonBlocking
        } else {
            WaitMode::Blocking
        };
    }

    /// Send `data` with up to the configured maximum of attached handles.
    pub fn send(&self, data: &[u8], attached: &[&VfdHandle]) -> Result<()> {
        if attached.len() > self.core.config.limits.send_max_vfds {
            return Err(Error::InvalidArgument("too many descriptors"));
        }
        let mut vfds = Vec::with_capacity(attached.len());
        for handle in attached {
            if !Arc::ptr_eq(&handle.core, &self.core) {
                return Err(Error::InvalidArgument("descriptor belongs to another device"));
            }
            vfds.push(&handle.vfd);
        }
        self.core.send(&self.vfd, data, &vfds, self.mode)
    }

    /// Receive bytes into `buf` and up to `max_vfds` descriptors.
    pub fn recv(&self, buf: &mut [u8], max_vfds: usize) -> Result<Received> {
        self.recv_inner(buf, max_vfds, None)
    }

    /// Like [`recv`](Self::recv); a blocked wait returns
    /// [`Error::Interrupted`] once `cancel` fires.
    pub fn recv_with_cancel(
        &self,
        buf: &mut [u8],
        max_vfds: usize,
        cancel: &CancelToken,
    ) -> Result<Received> {
        self.recv_inner(buf, max_vfds, Some(cancel))
    }

    /// Error for an operation on a VFD that is no longer registered.
    fn unlinked_error(&self) -> Error {
        if self.core.transport.is_closed() {
            Error::Disconnected
        } else {
            Error::BadHandle
        }
    }

    fn recv_inner(
        &self,
        buf: &mut [u8],
        max_vfds: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<Received> {
        if buf.is_empty() && max_vfds == 0 {
            return Ok(Received::default());
        }
        let mut registered = false;

        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(Error::Interrupted);
            }

            let mut released: Vec<InBuffer> = Vec::new();
            let table = self.core.registry.lock();
            let mut state = self.vfd.lock();
            if state.unlinked {
                return Err(self.unlinked_error());
            }

            let bytes = state.inbox.read_bytes(buf, &mut released);
            let vfds = if max_vfds > 0 {
                state.inbox.read_descriptors(
                    max_vfds,
                    |id| {
                        let found = table.get(id).filter(|vfd| vfd.is_published());
                        if found.is_none() {
                            Stats::bump(&self.core.stats.unknown_descriptor_ids);
                        }
                        found
                    },
                    &mut released,
                )
            } else {
                Vec::new()
            };
            state.inbox.sweep(&mut released);
            drop(table);

            let seen = state.inbox.arrivals();
            let hung_up = state.hung_up;
            let produced = bytes > 0 || !vfds.is_empty();

            if produced || hung_up || self.mode.is_nonblocking() {
                drop(state);
                self.core.transport.recycle(released);
                if produced {
                    trace!(
                        "virtwl: vfd {} received {} bytes, {} vfds",
                        self.id(),
                        bytes,
                        vfds.len()
                    );
                    let vfds = vfds
                        .into_iter()
                        .map(|vfd| VfdHandle::new(self.core.clone(), vfd, WaitMode::Blocking))
                        .collect();
                    return Ok(Received { bytes, vfds });
                }
                if hung_up {
                    return Ok(Received::default());
                }
                return Err(Error::WouldBlock);
            }

            drop(state);
            self.core.transport.recycle(released);

            if let Some(cancel) = cancel {
                if !registered {
                    let waiter: Arc<dyn Wakeable> = self.vfd.clone();
                    cancel.register(Arc::downgrade(&waiter));
                    registered = true;
                }
            }
            let state = self.vfd.lock();
            drop(self.vfd.wait_readable(state, seen, cancel));
        }
    }

    /// Map `len` bytes of the VFD's memory starting at page-aligned `offset`.
    pub fn mmap(&self, offset: u64, len: usize, writable: bool) -> Result<Mapping> {
        let state = self.vfd.lock();
        if state.unlinked {
            return Err(self.unlinked_error());
        }
        if !state.flags.contains(VfdFlags::MAP) {
            return Err(Error::AccessDenied);
        }
        if writable && !state.flags.contains(VfdFlags::WRITE) {
            return Err(Error::AccessDenied);
        }
        if !is_page_aligned(offset) {
            return Err(Error::InvalidArgument("mapping offset not page aligned"));
        }
        let limit = page_align(u64::from(state.size)).unwrap_or(u64::MAX);
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::InvalidArgument("mapping range overflows"))?;
        if end > limit {
            return Err(Error::InvalidArgument("mapping exceeds vfd size"));
        }
        let access = if writable {
            Access::ReadWrite
        } else {
            Access::ReadOnly
        };
        self.core.memory.map(state.pfn, offset, len, access)
    }

    /// Current readiness.
    pub fn poll(&self) -> PollFlags {
        let mut mask = PollFlags::empty();
        {
            let state = self.vfd.lock();
            if !state.inbox.is_empty() {
                mask |= PollFlags::IN | PollFlags::RDNORM;
            }
            if state.hung_up {
                mask |= PollFlags::HUP;
            }
        }
        if self.core.transport.out_has_capacity() {
            mask |= PollFlags::OUT | PollFlags::WRNORM;
        }
        mask
    }

    /// Give up this handle. The last handle to a VFD closes it with the
    /// host and releases everything queued on it.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        if !self.vfd.release_handle() {
            trace!("virtwl: vfd {} still has open handles", self.id());
            return Ok(());
        }
        self.core.close(&self.vfd)
    }
}

impl Drop for VfdHandle {
    fn drop(&mut self) {
        match self.release() {
            Ok(()) | Err(Error::BadHandle) => {}
            Err(err) => warn!("virtwl: failed to release vfd id {}: {}", self.vfd.id(), err),
        }
    }
}
