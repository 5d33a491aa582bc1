//! Device bring-up and teardown
//!
//! [`VirtwlDevice`] owns the shared [`Core`] (config, rings, registry,
//! guest memory, counters) and the two completion workers that drain the
//! rings when the host signals them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tracing::{debug, info};

use crate::config::VirtwlConfig;
use crate::error::{Error, Result};
use crate::handle::VfdHandle;
use crate::memory::GuestMemory;
use crate::queue::Virtqueue;
use crate::registry::VfdRegistry;
use crate::request::NewVfd;
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::{RingTransport, WaitMode};
use crate::worker::Worker;

/// State shared by the device, its workers and every handle
pub(crate) struct Core {
    pub(crate) config: VirtwlConfig,
    pub(crate) transport: RingTransport,
    pub(crate) registry: VfdRegistry,
    pub(crate) memory: Arc<dyn GuestMemory>,
    pub(crate) stats: Arc<Stats>,
}

impl Core {
    fn new(
        config: VirtwlConfig,
        in_queue: Box<dyn Virtqueue>,
        out_queue: Box<dyn Virtqueue>,
        memory: Arc<dyn GuestMemory>,
    ) -> Self {
        let stats = Arc::new(Stats::default());
        let transport = RingTransport::new(
            in_queue,
            out_queue,
            config.transport.buffer_size,
            config.transport.capacity_wait(),
            stats.clone(),
        );
        Self {
            registry: VfdRegistry::new(config.limits.max_guest_vfds),
            config,
            transport,
            memory,
            stats,
        }
    }

    /// A core over fresh in-memory rings with no host attached.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        use crate::memory::FrameArena;
        use crate::queue::mem_queue;

        let (in_queue, _) = mem_queue("in", 4);
        let (out_queue, _) = mem_queue("out", 4);
        Self::new(
            VirtwlConfig::default(),
            Box::new(in_queue),
            Box::new(out_queue),
            Arc::new(FrameArena::new(1)),
        )
    }
}

/// A probed virtio wayland device
pub struct VirtwlDevice {
    core: Arc<Core>,
    workers: Mutex<Vec<Worker>>,
    shut_down: AtomicBool,
}

impl VirtwlDevice {
    /// Bring the device up on a pair of rings.
    ///
    /// Fills the in ring with receive slots and kicks it. With
    /// `spawn_workers` set, each ring's completion callback wakes a worker
    /// that drains it; otherwise the caller pumps
    /// [`drain_inbound`](Self::drain_inbound) and
    /// [`drain_outbound`](Self::drain_outbound) itself.
    pub fn probe(
        config: VirtwlConfig,
        mut in_queue: Box<dyn Virtqueue>,
        mut out_queue: Box<dyn Virtqueue>,
        memory: Arc<dyn GuestMemory>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|_| Error::InvalidArgument("invalid configuration"))?;

        let spawn_workers = config.transport.spawn_workers;
        let mut workers = Vec::new();
        let core = if spawn_workers {
            // Workers need the core and the rings need the workers'
            // notifiers; the core is built once the callbacks are wired.
            let (in_worker, in_slot) = Self::deferred_worker("virtwl-in", |core| {
                core.drain_inbound();
            })?;
            let (out_worker, out_slot) = Self::deferred_worker("virtwl-out", |core| {
                core.transport.drain_outbound();
            })?;
            in_queue.set_callback(in_worker.notifier().into_callback());
            out_queue.set_callback(out_worker.notifier().into_callback());
            let core = Arc::new(Core::new(config, in_queue, out_queue, memory));
            in_slot.set(&core);
            out_slot.set(&core);
            workers.push(in_worker);
            workers.push(out_worker);
            core
        } else {
            Arc::new(Core::new(config, in_queue, out_queue, memory))
        };

        for worker in &workers {
            // Anything the host finishes before the first kick lands.
            worker.notifier().notify();
        }
        let device = Self {
            core,
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        };
        device.core.transport.fill_inbound()?;
        device.core.transport.kick_inbound();
        info!(
            "virtwl: device up ({} byte slots, workers: {})",
            device.core.transport.buffer_size(),
            spawn_workers
        );
        Ok(device)
    }

    fn deferred_worker<F>(name: &str, job: F) -> Result<(Worker, CoreSlot)>
    where
        F: Fn(&Core) + Send + 'static,
    {
        let slot = CoreSlot::default();
        let reader = slot.clone();
        let worker = Worker::spawn(name, move || {
            if let Some(core) = reader.get() {
                job(&core);
            }
        })?;
        Ok((worker, slot))
    }

    /// Open a new wayland connection context.
    pub fn new_context(&self, mode: WaitMode) -> Result<VfdHandle> {
        self.create(NewVfd::Context, mode)
    }

    /// Allocate at least `size` bytes of shared memory.
    pub fn new_alloc(&self, size: u32, mode: WaitMode) -> Result<VfdHandle> {
        self.create(NewVfd::Alloc { size }, mode)
    }

    /// Create a VFD of the given kind.
    pub fn create(&self, kind: NewVfd, mode: WaitMode) -> Result<VfdHandle> {
        let vfd = self.core.create(kind, mode)?;
        Ok(VfdHandle::new(self.core.clone(), vfd, mode))
    }

    /// Process everything the host has put on the in ring.
    pub fn drain_inbound(&self) -> usize {
        self.core.drain_inbound()
    }

    /// Complete every request the host has answered.
    pub fn drain_outbound(&self) -> usize {
        self.core.transport.drain_outbound()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    pub fn config(&self) -> &VirtwlConfig {
        &self.core.config
    }

    /// Live VFDs in the registry
    pub fn vfd_count(&self) -> usize {
        self.core.registry.lock().len()
    }

    /// Tear the transport down and stop the workers. Every pending request
    /// completes with [`Error::Disconnected`] and every open VFD is
    /// unlinked. Idempotent; callable while other threads are blocked in
    /// requests on this device.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Fail outstanding completions first: a worker may be waiting on a
        // request that only teardown resolves.
        self.core.transport.shutdown();
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter_mut() {
            worker.stop();
        }
        drop(workers);

        let vfds = self.core.registry.clear();
        let mut released = Vec::new();
        for vfd in &vfds {
            released.extend(vfd.lock().inbox.drain());
        }
        debug!(
            "virtwl: shut down ({} vfds unlinked, {} queued slots dropped)",
            vfds.len(),
            released.len()
        );
    }
}

impl Drop for VirtwlDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Late-bound reference from a worker to the core it drains
#[derive(Clone, Default)]
struct CoreSlot {
    core: Arc<OnceLock<Weak<Core>>>,
}

impl CoreSlot {
    fn set(&self, core: &Arc<Core>) {
        let _ = self.core.set(Arc::downgrade(core));
    }

    fn get(&self) -> Option<Arc<Core>> {
        self.core.get().and_then(Weak::upgrade)
    }
}
