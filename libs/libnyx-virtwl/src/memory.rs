//! Guest memory regions
//!
//! Host-allocated VFD memory is addressed by page frame number. A
//! [`GuestMemory`] turns (pfn, offset, length) into a [`Mapping`] the
//! caller can read and write. [`FrameArena`] is the in-process backing used
//! by the test host: page-aligned regions keyed by their first frame.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::{Error, Result};

/// Guest page size
pub const PAGE_SIZE: u64 = 4096;

/// Round `size` up to a whole number of pages. `None` on overflow.
pub fn page_align(size: u64) -> Option<u64> {
    size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

pub fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

bitflags::bitflags! {
    /// Attributes of a VFD mapping
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Raw frames, no struct page behind them
        const PFNMAP = 1 << 0;
        /// Device memory
        const IO = 1 << 1;
        /// Mapping cannot grow
        const DONTEXPAND = 1 << 2;
        /// Excluded from core dumps
        const DONTDUMP = 1 << 3;
    }
}

impl MapFlags {
    /// Attributes every VFD mapping carries
    pub const VFD: MapFlags = MapFlags::PFNMAP
        .union(MapFlags::IO)
        .union(MapFlags::DONTEXPAND)
        .union(MapFlags::DONTDUMP);
}

/// Requested access to a mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Resolves host page frames to mappings
pub trait GuestMemory: Send + Sync {
    /// Map `len` bytes starting `offset` bytes into the region at `pfn`.
    fn map(&self, pfn: u64, offset: u64, len: usize, access: Access) -> Result<Mapping>;
}

/// Backing bytes of one region
#[derive(Debug)]
pub struct Region {
    bytes: Box<[AtomicU8]>,
}

impl Region {
    fn zeroed(len: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory)?;
        bytes.extend((0..len).map(|_| AtomicU8::new(0)));
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A window onto a region
#[derive(Debug, Clone)]
pub struct Mapping {
    region: Arc<Region>,
    start: usize,
    len: usize,
    access: Access,
    flags: MapFlags,
}

impl Mapping {
    pub fn new(region: Arc<Region>, start: usize, len: usize, access: Access) -> Result<Self> {
        let end = start
            .checked_add(len)
            .ok_or(Error::InvalidArgument("mapping range overflows"))?;
        if end > region.len() {
            return Err(Error::InvalidArgument("mapping exceeds region"));
        }
        Ok(Self {
            region,
            start,
            len,
            access,
            flags: MapFlags::VFD,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    fn window(&self, offset: usize, count: usize) -> Result<&[AtomicU8]> {
        let end = offset
            .checked_add(count)
            .filter(|end| *end <= self.len)
            .ok_or(Error::InvalidArgument("access outside mapping"))?;
        Ok(&self.region.bytes[self.start + offset..self.start + end])
    }

    /// Copy bytes at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let window = self.window(offset, out.len())?;
        for (dst, src) in out.iter_mut().zip(window) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy `data` to `offset`. Fails on a read-only mapping.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        if self.access != Access::ReadWrite {
            return Err(Error::AccessDenied);
        }
        let window = self.window(offset, data.len())?;
        for (dst, src) in window.iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
        Ok(())
    }
}

struct ArenaState {
    regions: BTreeMap<u64, Arc<Region>>,
    next_pfn: u64,
}

/// Page-frame allocator over process memory
pub struct FrameArena {
    state: Mutex<ArenaState>,
}

impl FrameArena {
    /// Frames are handed out from `first_pfn` upwards.
    pub fn new(first_pfn: u64) -> Self {
        Self {
            state: Mutex::new(ArenaState {
                regions: BTreeMap::new(),
                next_pfn: first_pfn,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a zeroed region of at least `size` bytes. Returns its pfn.
    pub fn alloc(&self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized region"));
        }
        let aligned = page_align(size).ok_or(Error::InvalidArgument("region size overflows"))?;
        let len = usize::try_from(aligned).map_err(|_| Error::OutOfMemory)?;
        let region = Arc::new(Region::zeroed(len)?);

        let mut state = self.state();
        let pfn = state.next_pfn;
        state.next_pfn = pfn
            .checked_add(aligned / PAGE_SIZE)
            .ok_or(Error::OutOfMemory)?;
        state.regions.insert(pfn, region);
        debug!("virtwl: allocated {} bytes at pfn {:#x}", aligned, pfn);
        Ok(pfn)
    }

    /// Release the region at `pfn`. Live mappings keep their bytes.
    pub fn free(&self, pfn: u64) -> bool {
        self.state().regions.remove(&pfn).is_some()
    }

    pub fn region_count(&self) -> usize {
        self.state().regions.len()
    }
}

impl GuestMemory for FrameArena {
    fn map(&self, pfn: u64, offset: u64, len: usize, access: Access) -> Result<Mapping> {
        let region = self
            .state()
            .regions
            .get(&pfn)
            .cloned()
            .ok_or(Error::InvalidArgument("no region at pfn"))?;
        let start =
            usize::try_from(offset).map_err(|_| Error::InvalidArgument("offset too large"))?;
        Mapping::new(region, start, len, access)
    }
}
