//! Outbound request engine
//!
//! NEW/NEW_CTX, CLOSE and SEND. Each request travels on the out ring with
//! space for the host's reply and the caller blocks until the reply lands.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::Core;
use crate::error::{Error, Result};
use crate::memory::page_align;
use crate::protocol::{
    encode_send, CtrlHeader, CtrlType, CtrlVfd, VfdNew, HDR_SIZE, VFD_NEW_SIZE,
};
use crate::queue::DescChain;
use crate::transport::WaitMode;
use crate::vfd::{Vfd, VfdFlags, VfdId};
use crate::wait::Completion;

/// Raw control-surface number for a connection context
pub const NEW_CTX: u32 = 0;
/// Raw control-surface number for a shared-memory allocation
pub const NEW_ALLOC: u32 = 1;

/// What a create request asks the host for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewVfd {
    /// A wayland connection context
    Context,
    /// A shared-memory region of at least `size` bytes
    Alloc { size: u32 },
}

impl NewVfd {
    /// Validate a raw control-surface request.
    pub fn from_raw(ty: u32, size: u32) -> Result<Self> {
        match ty {
            NEW_CTX => Ok(NewVfd::Context),
            NEW_ALLOC => Ok(NewVfd::Alloc { size }),
            _ => Err(Error::InvalidArgument("unknown vfd type")),
        }
    }

    fn request(self, vfd_id: VfdId) -> Result<VfdNew> {
        Ok(match self {
            NewVfd::Context => VfdNew {
                hdr: CtrlHeader::new(CtrlType::VfdNewCtx),
                vfd_id,
                flags: VfdFlags::CONTROL,
                ..VfdNew::default()
            },
            NewVfd::Alloc { size } => {
                let size = page_align(u64::from(size))
                    .and_then(|s| u32::try_from(s).ok())
                    .ok_or(Error::InvalidArgument("allocation size overflows"))?;
                VfdNew {
                    hdr: CtrlHeader::new(CtrlType::VfdNew),
                    vfd_id,
                    flags: VfdFlags::WRITE | VfdFlags::MAP,
                    pfn: 0,
                    size,
                }
            }
        })
    }
}

fn reply_header(reply: &[u8]) -> Result<CtrlHeader> {
    CtrlHeader::decode(reply).map_err(|err| {
        warn!("virtwl: short reply from host: {}", err);
        Error::NoDevice
    })
}

impl Core {
    /// Submit `request` with `reply_len` bytes of reply space and wait for
    /// the host to answer. Returns the bytes the host wrote.
    pub(crate) fn transact(
        &self,
        request: Vec<u8>,
        reply_len: usize,
        mode: WaitMode,
    ) -> Result<Vec<u8>> {
        let completion = Completion::new();
        let chain = DescChain {
            readable: request,
            writable: vec![0; reply_len],
        };
        self.transport.submit(chain, completion.clone(), mode)?;
        let used = completion.wait()?;
        let mut reply = used.chain.writable;
        reply.truncate(used.written);
        Ok(reply)
    }

    /// Ask the host for a new VFD.
    ///
    /// The VFD is registered under a fresh guest id but stays unpublished
    /// until the host answers. Its lock is not held across the round trip,
    /// so inbound traffic for the id queues normally. On any failure it is
    /// unlinked again before the error is returned.
    pub(crate) fn create(&self, kind: NewVfd, mode: WaitMode) -> Result<Arc<Vfd>> {
        let vfd = self.registry.lock().insert_pending()?;

        let result = kind.request(vfd.id()).and_then(|request| {
            let reply = self.transact(request.encode(), VFD_NEW_SIZE, mode)?;
            Error::from_response(reply_header(&reply)?.ty)?;
            VfdNew::decode(&reply).map_err(|err| {
                warn!("virtwl: bad vfd_new reply: {}", err);
                Error::NoDevice
            })
        });

        let result = result.and_then(|reply| {
            let mut state = vfd.lock();
            // Torn down with the device while the request was in flight.
            if state.unlinked {
                return Err(Error::Disconnected);
            }
            if reply.vfd_id != vfd.id() {
                warn!(
                    "virtwl: host answered vfd {} with id {}, keeping {}",
                    vfd.id(),
                    reply.vfd_id,
                    vfd.id()
                );
            }
            state.flags = reply.flags;
            state.pfn = reply.pfn;
            state.size = reply.size;
            vfd.publish();
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!("virtwl: created vfd {} ({:?})", vfd.id(), kind);
                Ok(vfd)
            }
            Err(err) => {
                self.release(&vfd);
                debug!("virtwl: create of vfd {} failed: {}", vfd.id(), err);
                Err(err)
            }
        }
    }

    /// Unlink `vfd` and give its queued slots back to the ring.
    /// Returns how many slots were released.
    pub(crate) fn release(&self, vfd: &Vfd) -> usize {
        let mut state = self.registry.unlink(vfd);
        let bufs = state.inbox.drain();
        drop(state);
        let count = bufs.len();
        self.transport.recycle(bufs);
        count
    }

    /// Close `vfd` with the host, then unlink it locally.
    ///
    /// The local teardown happens whatever the host says; a failed
    /// exchange is still reported. A VFD that is already gone (closed
    /// through another handle, or torn down with the device) gives
    /// [`Error::BadHandle`].
    pub(crate) fn close(&self, vfd: &Vfd) -> Result<()> {
        if vfd.lock().unlinked {
            return Err(Error::BadHandle);
        }
        let result = self
            .transact(CtrlVfd::close(vfd.id()).encode(), HDR_SIZE, WaitMode::Blocking)
            .and_then(|reply| Error::from_response(reply_header(&reply)?.ty));
        let released = self.release(vfd);
        match &result {
            Ok(()) => debug!("virtwl: closed vfd {} ({} slots released)", vfd.id(), released),
            Err(err) => warn!("virtwl: failed to close vfd {}: {}", vfd.id(), err),
        }
        result
    }

    /// Send `data` and `attached` on `vfd`. Every attached VFD must be live
    /// in this registry and confirmed by the host.
    pub(crate) fn send(
        &self,
        vfd: &Vfd,
        data: &[u8],
        attached: &[&Arc<Vfd>],
        mode: WaitMode,
    ) -> Result<()> {
        if attached.len() > self.config.limits.send_max_vfds {
            return Err(Error::InvalidArgument("too many descriptors"));
        }
        let ids = {
            let table = self.registry.lock();
            let mut ids = Vec::with_capacity(attached.len());
            for other in attached {
                if !table.contains(other) {
                    return Err(Error::BadHandle);
                }
                if !other.is_published() {
                    return Err(Error::InvalidArgument("descriptor not yet created"));
                }
                ids.push(other.id());
            }
            ids
        };

        let reply = self.transact(encode_send(vfd.id(), &ids, data), HDR_SIZE, mode)?;
        Error::from_response(reply_header(&reply)?.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        assert_eq!(NewVfd::from_raw(0, 99).unwrap(), NewVfd::Context);
        assert_eq!(NewVfd::from_raw(1, 10).unwrap(), NewVfd::Alloc { size: 10 });
        assert_eq!(
            NewVfd::from_raw(2, 0),
            Err(Error::InvalidArgument("unknown vfd type"))
        );
    }

    #[test]
    fn test_requests() {
        let ctx = NewVfd::Context.request(3).unwrap();
        assert_eq!(ctx.hdr.ty, CtrlType::VfdNewCtx as u32);
        assert_eq!(ctx.flags, VfdFlags::CONTROL);
        assert_eq!(ctx.size, 0);

        let alloc = NewVfd::Alloc { size: 100 }.request(4).unwrap();
        assert_eq!(alloc.hdr.ty, CtrlType::VfdNew as u32);
        assert_eq!(alloc.vfd_id, 4);
        assert_eq!(alloc.flags, VfdFlags::WRITE | VfdFlags::MAP);
        assert_eq!(alloc.size, 4096);

        assert!(NewVfd::Alloc { size: u32::MAX }.request(5).is_err());
    }

    #[test]
    fn test_reply_header_rejects_short_reply() {
        assert_eq!(reply_header(&[0; 4]).unwrap_err(), Error::NoDevice);
        assert_eq!(
            reply_header(&(CtrlType::RespOk as u32).to_le_bytes().repeat(2)).unwrap().ty,
            CtrlType::RespOk as u32
        );
    }
}
