//! Inbound dispatcher
//!
//! Routes each filled receive slot: VFD_NEW registers a host VFD, RECV
//! moves the slot into the target VFD's inbox, CLOSE marks the target hung
//! up. Anything else is logged and the slot handed straight back.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::device::Core;
use crate::protocol::{Inbound, ProtocolError, VfdNew, VfdTransfer};
use crate::stats::Stats;
use crate::transport::InBuffer;
use crate::vfd::{is_host_id, QueueEntry, Vfd, VfdId, VFD_ID_NONE};

impl Core {
    /// Handle one receive slot. Returns the slot when it should go back on
    /// the ring, `None` when an inbox kept it.
    pub(crate) fn dispatch_inbound(&self, buf: InBuffer) -> Option<InBuffer> {
        let msg = match Inbound::decode(buf.bytes()) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(ty)) => {
                warn!("virtwl: unhandled ctrl command: {:#x}", ty);
                Stats::bump(&self.stats.unknown_commands);
                return Some(buf);
            }
            Err(err) => {
                warn!("virtwl: dropping malformed message: {}", err);
                Stats::bump(&self.stats.malformed_messages);
                return Some(buf);
            }
        };

        match msg {
            Inbound::VfdNew(new) => {
                self.accept_vfd_new(&new);
                Some(buf)
            }
            Inbound::VfdRecv(xfer) => self.queue_recv(buf, xfer),
            Inbound::VfdClose(close) => {
                self.hang_up(close.vfd_id);
                Some(buf)
            }
        }
    }

    /// Drain the in ring through the dispatcher.
    pub(crate) fn drain_inbound(&self) -> usize {
        self.transport.drain_inbound(|buf| self.dispatch_inbound(buf))
    }

    fn accept_vfd_new(&self, new: &VfdNew) {
        if new.vfd_id == VFD_ID_NONE {
            trace!("virtwl: ignoring vfd_new without an id");
            return;
        }
        if !is_host_id(new.vfd_id) {
            warn!("virtwl: received a vfd with invalid id: {:#x}", new.vfd_id);
            Stats::bump(&self.stats.vfd_new_rejected);
            return;
        }

        let vfd = Arc::new(Vfd::new(new.vfd_id, new.flags, new.pfn, new.size));
        match self.registry.lock().insert_host(vfd) {
            Ok(()) => {
                debug!(
                    "virtwl: host vfd {:#x} registered (flags {:?}, {} bytes)",
                    new.vfd_id, new.flags, new.size
                );
                Stats::bump(&self.stats.vfds_accepted);
            }
            Err(err) => {
                warn!("virtwl: failed to register host vfd {:#x}: {}", new.vfd_id, err);
                Stats::bump(&self.stats.vfd_new_rejected);
            }
        }
    }

    fn queue_recv(&self, buf: InBuffer, xfer: VfdTransfer) -> Option<InBuffer> {
        let Some(vfd) = self.registry.lookup(xfer.vfd_id) else {
            warn!("virtwl: recv for unknown vfd {:#x}", xfer.vfd_id);
            Stats::bump(&self.stats.recv_unknown_vfd);
            return Some(buf);
        };

        let mut state = vfd.lock();
        // Lost a race with close; the inbox is already drained.
        if state.unlinked {
            trace!("virtwl: recv for closing vfd {:#x}", xfer.vfd_id);
            return Some(buf);
        }
        vfd.deliver(&mut state, QueueEntry::new(buf, xfer));
        Stats::bump(&self.stats.recv_queued);
        None
    }

    fn hang_up(&self, id: VfdId) {
        let Some(vfd) = self.registry.lookup(id) else {
            warn!("virtwl: close for unknown vfd {:#x}", id);
            return;
        };
        let mut state = vfd.lock();
        state.hung_up = true;
        vfd.notify();
        Stats::bump(&self.stats.hangups);
        debug!("virtwl: host hung up vfd {:#x}", id);
    }
}

#[cfg(test)]
mod tests {
    use crate::device::Core;
    use crate::protocol::{encode_recv, CtrlHeader, CtrlType, CtrlVfd, VfdNew};
    use crate::transport::InBuffer;
    use crate::vfd::VfdFlags;

    fn vfd_new(id: u32) -> InBuffer {
        InBuffer::with_contents(
            &VfdNew {
                hdr: CtrlHeader::new(CtrlType::VfdNew),
                vfd_id: id,
                flags: VfdFlags::MAP | VfdFlags::WRITE,
                pfn: 0x40,
                size: 4096,
            }
            .encode(),
        )
    }

    fn recv(id: u32, data: &[u8]) -> InBuffer {
        InBuffer::with_contents(&encode_recv(id, &[], data))
    }

    #[test]
    fn test_vfd_new_registers_host_vfd() {
        let core = Core::for_test();
        assert!(core.dispatch_inbound(vfd_new(0x4000_0002)).is_some());
        let vfd = core.registry.lookup(0x4000_0002).unwrap();
        assert!(vfd.is_published());
        let state = vfd.lock();
        assert_eq!(state.pfn, 0x40);
        assert_eq!(state.size, 4096);
        assert_eq!(core.stats.snapshot().vfds_accepted, 1);
    }

    #[test]
    fn test_vfd_new_rejections() {
        let core = Core::for_test();
        core.dispatch_inbound(vfd_new(0));
        core.dispatch_inbound(vfd_new(7));
        core.dispatch_inbound(vfd_new(0xC000_0001));
        core.dispatch_inbound(vfd_new(0x4000_0001));
        core.dispatch_inbound(vfd_new(0x4000_0001));
        let stats = core.stats.snapshot();
        assert_eq!(stats.vfds_accepted, 1);
        // The "none" id is dropped without counting as a rejection.
        assert_eq!(stats.vfd_new_rejected, 3);
        assert_eq!(core.registry.lock().len(), 1);
    }

    #[test]
    fn test_recv_retained_by_known_vfd() {
        let core = Core::for_test();
        core.dispatch_inbound(vfd_new(0x4000_0001));
        let kept = core.dispatch_inbound(recv(0x4000_0001, b"hi"));
        assert!(kept.is_none());
        let vfd = core.registry.lookup(0x4000_0001).unwrap();
        assert_eq!(vfd.lock().inbox.len(), 1);

        let unknown = core.dispatch_inbound(recv(9, b"hi"));
        assert!(unknown.is_some());
        assert_eq!(core.stats.snapshot().recv_unknown_vfd, 1);
    }

    #[test]
    fn test_recv_after_unlink_is_recycled() {
        let core = Core::for_test();
        core.dispatch_inbound(vfd_new(0x4000_0001));
        let vfd = core.registry.lookup(0x4000_0001).unwrap();
        drop(core.registry.unlink(&vfd));
        let back = core.dispatch_inbound(recv(0x4000_0001, b"x"));
        assert!(back.is_some());
        assert!(vfd.lock().inbox.is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_messages() {
        let core = Core::for_test();
        // RECV claiming more ids than the slot holds.
        let mut lying = encode_recv(0x4000_0001, &[], b"");
        lying[12..16].copy_from_slice(&1000u32.to_le_bytes());
        assert!(core.dispatch_inbound(InBuffer::with_contents(&lying)).is_some());
        assert!(core.dispatch_inbound(InBuffer::with_contents(&[1, 2])).is_some());

        let mut unknown = Vec::new();
        CtrlHeader { ty: 0x999, flags: 0 }.encode_into(&mut unknown);
        assert!(core.dispatch_inbound(InBuffer::with_contents(&unknown)).is_some());

        let stats = core.stats.snapshot();
        assert_eq!(stats.malformed_messages, 2);
        assert_eq!(stats.unknown_commands, 1);
    }

    #[test]
    fn test_close_marks_hung_up() {
        let core = Core::for_test();
        core.dispatch_inbound(vfd_new(0x4000_0001));
        core.dispatch_inbound(InBuffer::with_contents(&CtrlVfd::close(0x4000_0001).encode()));
        core.dispatch_inbound(InBuffer::with_contents(&CtrlVfd::close(0x4000_0077).encode()));
        let vfd = core.registry.lookup(0x4000_0001).unwrap();
        assert!(vfd.lock().hung_up);
        assert_eq!(core.stats.snapshot().hangups, 1);
    }
}
