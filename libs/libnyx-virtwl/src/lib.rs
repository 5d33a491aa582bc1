//! # libnyx-virtwl
//!
//! Guest side of the virtio wayland transport. Clients open connection
//! contexts and shared-memory allocations (VFDs) on a host they can only
//! reach through two descriptor rings, then exchange bytes and VFDs over
//! them.
//!
//! ## Layers
//!
//! - **Rings** - [`queue::Virtqueue`] is the ring seam; [`transport`] keeps
//!   the in ring stocked with receive slots and pairs each out-ring request
//!   with its reply.
//! - **Codec** - [`protocol`] encodes and validates the wire messages.
//! - **VFDs** - [`registry`] maps ids to [`vfd::Vfd`]s; each VFD's inbox
//!   keeps received slots until both their bytes and attached ids are read.
//! - **Dispatch / requests** - inbound messages are routed by `dispatch`;
//!   create, close and send travel through `request`.
//! - **Handles** - [`VfdHandle`] is the per-VFD client API.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use libnyx_virtwl::{mem_queue, FrameArena, VirtwlConfig, VirtwlDevice, WaitMode};
//!
//! # fn main() -> libnyx_virtwl::Result<()> {
//! let (in_queue, _host_in) = mem_queue("in", 16);
//! let (out_queue, _host_out) = mem_queue("out", 16);
//! let device = VirtwlDevice::probe(
//!     VirtwlConfig::default(),
//!     Box::new(in_queue),
//!     Box::new(out_queue),
//!     Arc::new(FrameArena::new(0x1000)),
//! )?;
//!
//! let ctx = device.new_context(WaitMode::Blocking)?;
//! ctx.send(b"hello", &[])?;
//!
//! let mut buf = [0u8; 4096];
//! let received = ctx.recv(&mut buf, 28)?;
//! println!("{} bytes, {} vfds", received.bytes, received.vfds.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Locking
//!
//! Registry, then a single VFD, then one ring half. See [`sync`].

pub mod config;
pub mod device;
mod dispatch;
pub mod error;
pub mod handle;
pub mod memory;
pub mod protocol;
pub mod queue;
pub mod registry;
mod request;
pub mod stats;
pub mod sync;
pub mod transport;
pub mod vfd;
pub mod wait;
pub mod worker;

pub use config::{ConfigError, VirtwlConfig};
pub use device::VirtwlDevice;
pub use error::{Error, Result};
pub use handle::{PollFlags, Received, VfdHandle};
pub use memory::{Access, FrameArena, GuestMemory, MapFlags, Mapping, PAGE_SIZE};
pub use queue::{mem_queue, DeviceQueue, MemQueue, Virtqueue};
pub use request::{NewVfd, NEW_ALLOC, NEW_CTX};
pub use stats::StatsSnapshot;
pub use transport::WaitMode;
pub use vfd::{VfdFlags, VfdId};
pub use wait::CancelToken;
