//! Virtio wayland control messages
//!
//! Every message starts with an 8 byte little-endian header (type + reserved
//! flags). Payload layouts:
//!
//! ```text
//! CtrlVfd      hdr | vfd_id                                   (12 bytes)
//! VfdNew       hdr | vfd_id | flags | pfn(u64) | size | pad   (32 bytes)
//! VfdSend/Recv hdr | vfd_id | vfd_count | ids[vfd_count] | data
//! ```

use crate::vfd::{VfdFlags, VfdId};

/// Size of [`CtrlHeader`] on the wire
pub const HDR_SIZE: usize = 8;
/// Size of a CLOSE message
pub const CTRL_VFD_SIZE: usize = 12;
/// Size of a NEW / NEW_CTX / VFD_NEW message
pub const VFD_NEW_SIZE: usize = 32;
/// Bytes of VFD_NEW a sender must fill (the tail is padding)
pub const VFD_NEW_MIN_SIZE: usize = 28;
/// Fixed part of SEND / RECV before the id list
pub const VFD_XFER_SIZE: usize = 16;
/// Size of one attached vfd id
pub const VFD_ID_SIZE: usize = 4;

/// Maximum number of VFDs attached to one send or receive
pub const SEND_MAX_ALLOCS: usize = 28;
/// Exclusive upper bound of guest-assigned ids
pub const MAX_ALLOC: u32 = 0x800;

/// Reserved: ids never carry this bit
pub const VFD_ILLEGAL_SIGN_BIT: u32 = 0x8000_0000;
/// Set on every host-assigned id
pub const VFD_HOST_VFD_ID_BIT: u32 = 0x4000_0000;

/// Control message types
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtrlType {
    /// Guest -> host allocation request; host -> guest unsolicited delivery
    VfdNew = 0x100,
    /// Close a VFD
    VfdClose = 0x101,
    /// Guest -> host payload with attached ids
    VfdSend = 0x102,
    /// Host -> guest payload with attached ids
    VfdRecv = 0x103,
    /// Guest -> host connection context request
    VfdNewCtx = 0x104,

    RespOk = 0x1000,
    RespVfdNew = 0x1001,

    RespErr = 0x1100,
    RespOutOfMemory = 0x1101,
    RespInvalidId = 0x1102,
    RespInvalidType = 0x1103,
}

impl CtrlType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x100 => CtrlType::VfdNew,
            0x101 => CtrlType::VfdClose,
            0x102 => CtrlType::VfdSend,
            0x103 => CtrlType::VfdRecv,
            0x104 => CtrlType::VfdNewCtx,
            0x1000 => CtrlType::RespOk,
            0x1001 => CtrlType::RespVfdNew,
            0x1100 => CtrlType::RespErr,
            0x1101 => CtrlType::RespOutOfMemory,
            0x1102 => CtrlType::RespInvalidId,
            0x1103 => CtrlType::RespInvalidType,
            _ => return None,
        })
    }
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message of {len} bytes is shorter than the {need} byte {what}")]
    Truncated {
        what: &'static str,
        len: usize,
        need: usize,
    },
    #[error("message declares {count} vfd ids but only has {len} bytes")]
    VfdCountOverflow { count: u32, len: usize },
    #[error("unhandled ctrl command {0:#x}")]
    UnknownType(u32),
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3],
        buf[offset + 4], buf[offset + 5], buf[offset + 6], buf[offset + 7],
    ])
}

fn check_len(buf: &[u8], need: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.len() < need {
        return Err(ProtocolError::Truncated {
            what,
            len: buf.len(),
            need,
        });
    }
    Ok(())
}

/// Message header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CtrlHeader {
    /// Raw message type (see [`CtrlType`])
    pub ty: u32,
    /// Reserved, always 0
    pub flags: u32,
}

impl CtrlHeader {
    pub fn new(ty: CtrlType) -> Self {
        Self {
            ty: ty as u32,
            flags: 0,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, HDR_SIZE, "header")?;
        Ok(Self {
            ty: read_u32(buf, 0),
            flags: read_u32(buf, 4),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ty.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }
}

/// NEW / NEW_CTX request, the host's reply to them, and VFD_NEW delivery
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VfdNew {
    pub hdr: CtrlHeader,
    pub vfd_id: VfdId,
    pub flags: VfdFlags,
    /// First page frame of the backing memory when mappable
    pub pfn: u64,
    /// Size in bytes when mappable
    pub size: u32,
}

impl VfdNew {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VFD_NEW_SIZE);
        self.hdr.encode_into(&mut out);
        out.extend_from_slice(&self.vfd_id.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.pfn.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let hdr = CtrlHeader::decode(buf)?;
        check_len(buf, VFD_NEW_MIN_SIZE, "vfd_new")?;
        Ok(Self {
            hdr,
            vfd_id: read_u32(buf, 8),
            flags: VfdFlags::from_bits_retain(read_u32(buf, 12)),
            pfn: read_u64(buf, 16),
            size: read_u32(buf, 24),
        })
    }
}

/// CLOSE in either direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtrlVfd {
    pub hdr: CtrlHeader,
    pub vfd_id: VfdId,
}

impl CtrlVfd {
    pub fn close(vfd_id: VfdId) -> Self {
        Self {
            hdr: CtrlHeader::new(CtrlType::VfdClose),
            vfd_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CTRL_VFD_SIZE);
        self.hdr.encode_into(&mut out);
        out.extend_from_slice(&self.vfd_id.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let hdr = CtrlHeader::decode(buf)?;
        check_len(buf, CTRL_VFD_SIZE, "ctrl_vfd")?;
        Ok(Self {
            hdr,
            vfd_id: read_u32(buf, 8),
        })
    }
}

/// Fixed part of a SEND or RECV message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VfdTransfer {
    pub hdr: CtrlHeader,
    /// Connection the payload travels on
    pub vfd_id: VfdId,
    /// Number of attached ids following the fixed part
    pub vfd_count: u32,
}

impl VfdTransfer {
    /// Byte offset of the first attached id
    pub const fn ids_offset() -> usize {
        VFD_XFER_SIZE
    }

    /// Byte offset of the payload
    pub fn data_offset(&self) -> usize {
        VFD_XFER_SIZE + self.vfd_count as usize * VFD_ID_SIZE
    }

    /// Decode and check that the declared id list fits in `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let hdr = CtrlHeader::decode(buf)?;
        check_len(buf, VFD_XFER_SIZE, "vfd transfer")?;
        let vfd_count = read_u32(buf, 12);
        let ids_end = (vfd_count as u64) * (VFD_ID_SIZE as u64) + VFD_XFER_SIZE as u64;
        if ids_end > buf.len() as u64 {
            return Err(ProtocolError::VfdCountOverflow {
                count: vfd_count,
                len: buf.len(),
            });
        }
        Ok(Self {
            hdr,
            vfd_id: read_u32(buf, 8),
            vfd_count,
        })
    }

    /// Attached id at `index`; `buf` must be the buffer this was decoded from.
    pub fn vfd_id_at(&self, buf: &[u8], index: u32) -> VfdId {
        read_u32(buf, VFD_XFER_SIZE + index as usize * VFD_ID_SIZE)
    }
}

/// Build a SEND message: fixed part, attached ids, then payload.
pub fn encode_send(vfd_id: VfdId, ids: &[VfdId], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VFD_XFER_SIZE + ids.len() * VFD_ID_SIZE + data.len());
    CtrlHeader::new(CtrlType::VfdSend).encode_into(&mut out);
    out.extend_from_slice(&vfd_id.to_le_bytes());
    out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

/// Build a RECV message as the host would deliver it.
pub fn encode_recv(vfd_id: VfdId, ids: &[VfdId], data: &[u8]) -> Vec<u8> {
    let mut out = encode_send(vfd_id, ids, data);
    out[..4].copy_from_slice(&(CtrlType::VfdRecv as u32).to_le_bytes());
    out
}

/// Inbound (host -> guest) messages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Unsolicited VFD delivery
    VfdNew(VfdNew),
    /// Payload for a VFD's inbox
    VfdRecv(VfdTransfer),
    /// Host hung up a VFD
    VfdClose(CtrlVfd),
}

impl Inbound {
    /// Decode the `len` bytes the host wrote.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let hdr = CtrlHeader::decode(buf)?;
        match CtrlType::from_u32(hdr.ty) {
            Some(CtrlType::VfdNew) => Ok(Inbound::VfdNew(VfdNew::decode(buf)?)),
            Some(CtrlType::VfdRecv) => Ok(Inbound::VfdRecv(VfdTransfer::decode(buf)?)),
            Some(CtrlType::VfdClose) => Ok(Inbound::VfdClose(CtrlVfd::decode(buf)?)),
            _ => Err(ProtocolError::UnknownType(hdr.ty)),
        }
    }
}
