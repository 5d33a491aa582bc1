//! VFD registry
//!
//! Maps ids to live VFDs. Guest-created VFDs take the lowest free id in
//! `[1, max_guest)`; host-created ones arrive with ids carrying the host
//! bit. The table lock is the top of the lock hierarchy.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sync::{OrderedGuard, RegistryLock, OBJECT, REGISTRY};
use crate::vfd::{is_host_id, Vfd, VfdId, VfdState};

/// The id -> VFD table
pub struct VfdRegistry {
    table: RegistryLock<BTreeMap<VfdId, Arc<Vfd>>>,
    max_guest: VfdId,
}

/// The locked table
pub struct RegistryGuard<'a> {
    table: OrderedGuard<'a, BTreeMap<VfdId, Arc<Vfd>>, REGISTRY>,
    max_guest: VfdId,
}

impl<'a> RegistryGuard<'a> {
    pub fn get(&self, id: VfdId) -> Option<Arc<Vfd>> {
        self.table.get(&id).cloned()
    }

    /// Whether `vfd` itself (not just its id) is registered.
    pub fn contains(&self, vfd: &Vfd) -> bool {
        self.table
            .get(&vfd.id())
            .is_some_and(|live| std::ptr::eq(Arc::as_ptr(live), vfd))
    }

    /// Lowest unused guest id.
    pub fn alloc_guest_id(&self) -> Result<VfdId> {
        let mut candidate: VfdId = 1;
        for &id in self.table.range(1..self.max_guest).map(|(id, _)| id) {
            if id != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= self.max_guest {
            return Err(Error::NoSpace);
        }
        Ok(candidate)
    }

    /// Create and register a guest VFD awaiting host confirmation.
    pub fn insert_pending(&mut self) -> Result<Arc<Vfd>> {
        let id = self.alloc_guest_id()?;
        let vfd = Arc::new(Vfd::pending(id));
        self.table.insert(id, vfd.clone());
        Ok(vfd)
    }

    /// Register a host-created VFD.
    pub fn insert_host(&mut self, vfd: Arc<Vfd>) -> Result<()> {
        let id = vfd.id();
        if !is_host_id(id) {
            return Err(Error::InvalidArgument("not a host vfd id"));
        }
        if self.table.contains_key(&id) {
            return Err(Error::InvalidArgument("vfd id already in use"));
        }
        self.table.insert(id, vfd);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl VfdRegistry {
    pub fn new(max_guest: VfdId) -> Self {
        Self {
            table: RegistryLock::new(BTreeMap::new(), "vfd_registry"),
            max_guest,
        }
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            table: self.table.lock(),
            max_guest: self.max_guest,
        }
    }

    /// Find a VFD; the table is unlocked again on return.
    pub fn lookup(&self, id: VfdId) -> Option<Arc<Vfd>> {
        self.lock().get(id)
    }

    /// Remove `vfd` from the table and mark it unlinked.
    ///
    /// Returns the VFD's own guard so the caller can drain its inbox with
    /// no window for new messages to be queued.
    pub fn unlink<'v>(&self, vfd: &'v Vfd) -> OrderedGuard<'v, VfdState, OBJECT> {
        let mut table = self.table.lock();
        let mut state = vfd.lock();
        let ours = table
            .get(&vfd.id())
            .is_some_and(|live| std::ptr::eq(Arc::as_ptr(live), vfd));
        if ours {
            table.remove(&vfd.id());
            debug!("virtwl: unlinked vfd {}", vfd.id());
        } else if !state.unlinked {
            warn!("virtwl: vfd {} was not registered", vfd.id());
        }
        state.unlinked = true;
        drop(table);
        vfd.notify();
        state
    }

    /// Remove every VFD, marking each unlinked and waking its readers.
    pub fn clear(&self) -> Vec<Arc<Vfd>> {
        let mut table = self.table.lock();
        let vfds: Vec<_> = std::mem::take(&mut *table).into_values().collect();
        for vfd in &vfds {
            let mut state = vfd.lock();
            state.unlinked = true;
            vfd.notify();
        }
        vfds
    }
}
