//! Scripted host for integration tests
//!
//! Services the device half of the out ring on its own thread (answering
//! NEW, NEW_CTX, CLOSE and SEND) and pushes host -> guest messages into the
//! in ring on demand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use libnyx_virtwl::protocol::{
    encode_recv, CtrlHeader, CtrlType, CtrlVfd, VfdNew, VfdTransfer, HDR_SIZE,
};
use libnyx_virtwl::queue::AvailChain;
use libnyx_virtwl::{
    mem_queue, DeviceQueue, FrameArena, GuestMemory, VfdFlags, VfdId, VirtwlConfig, VirtwlDevice,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A SEND as the host saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub vfd_id: VfdId,
    pub ids: Vec<VfdId>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct HostState {
    /// Stop taking requests off the out ring
    pub paused: bool,
    /// The host thread has seen `paused` and is idle
    parked: bool,
    /// Reply code for NEW / NEW_CTX instead of success
    pub new_reply: Option<CtrlType>,
    /// Reply code for SEND instead of OK
    pub send_reply: Option<CtrlType>,
    /// Reply code for CLOSE instead of OK
    pub close_reply: Option<CtrlType>,
    pub created: Vec<VfdNew>,
    pub sent: Vec<Sent>,
    pub closed: Vec<VfdId>,
    /// pfn of each live allocation
    pub allocations: HashMap<VfdId, u64>,
}

pub struct FakeHost {
    in_dev: DeviceQueue,
    out_dev: DeviceQueue,
    pub arena: Arc<FrameArena>,
    state: Arc<Mutex<HostState>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

fn header(ty: CtrlType) -> Vec<u8> {
    let mut out = Vec::with_capacity(HDR_SIZE);
    CtrlHeader::new(ty).encode_into(&mut out);
    out
}

fn reply(out_dev: &DeviceQueue, mut avail: AvailChain, bytes: &[u8]) {
    let len = bytes.len().min(avail.chain.writable.len());
    avail.chain.writable[..len].copy_from_slice(&bytes[..len]);
    out_dev.push_used(avail, len);
}

fn serve(out_dev: &DeviceQueue, arena: &FrameArena, state: &Mutex<HostState>, avail: AvailChain) {
    let request = avail.chain.readable.clone();
    let ty = CtrlHeader::decode(&request).map(|h| h.ty).unwrap_or(0);
    let mut state = state.lock().unwrap();
    match CtrlType::from_u32(ty) {
        Some(CtrlType::VfdNew) | Some(CtrlType::VfdNewCtx) => {
            let new = VfdNew::decode(&request).unwrap();
            if let Some(code) = state.new_reply {
                drop(state);
                return reply(out_dev, avail, &header(code));
            }
            let mut answer = new;
            answer.hdr = CtrlHeader::new(CtrlType::RespVfdNew);
            if new.flags.contains(VfdFlags::MAP) {
                let pfn = arena.alloc(u64::from(new.size)).unwrap();
                answer.pfn = pfn;
                state.allocations.insert(new.vfd_id, pfn);
            }
            state.created.push(new);
            drop(state);
            reply(out_dev, avail, &answer.encode());
        }
        Some(CtrlType::VfdClose) => {
            let close = CtrlVfd::decode(&request).unwrap();
            state.closed.push(close.vfd_id);
            if let Some(pfn) = state.allocations.remove(&close.vfd_id) {
                arena.free(pfn);
            }
            let code = state.close_reply.unwrap_or(CtrlType::RespOk);
            drop(state);
            reply(out_dev, avail, &header(code));
        }
        Some(CtrlType::VfdSend) => {
            let xfer = VfdTransfer::decode(&request).unwrap();
            let ids = (0..xfer.vfd_count)
                .map(|i| xfer.vfd_id_at(&request, i))
                .collect();
            state.sent.push(Sent {
                vfd_id: xfer.vfd_id,
                ids,
                data: request[xfer.data_offset()..].to_vec(),
            });
            let code = state.send_reply.unwrap_or(CtrlType::RespOk);
            drop(state);
            reply(out_dev, avail, &header(code));
        }
        _ => {
            drop(state);
            reply(out_dev, avail, &header(CtrlType::RespInvalidType));
        }
    }
}

impl FakeHost {
    fn start(in_dev: DeviceQueue, out_dev: DeviceQueue, arena: Arc<FrameArena>) -> Self {
        let state = Arc::new(Mutex::new(HostState::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let out_dev = out_dev.clone();
            let arena = arena.clone();
            let state = state.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("fake-host".into())
                .spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        {
                            let mut state = state.lock().unwrap();
                            state.parked = state.paused;
                            if state.parked {
                                drop(state);
                                thread::sleep(Duration::from_millis(2));
                                continue;
                            }
                        }
                        if let Some(avail) = out_dev.wait_avail(Duration::from_millis(10)) {
                            serve(&out_dev, &arena, &state, avail);
                        }
                    }
                })
                .unwrap()
        };
        Self {
            in_dev,
            out_dev,
            arena,
            state,
            stop,
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    /// Stop serving the out ring. Returns once the host thread is idle.
    pub fn pause(&self) {
        self.state().paused = true;
        assert!(wait_until(|| self.state().parked), "host did not park");
    }

    pub fn resume(&self) {
        self.state().paused = false;
    }

    /// Requests sitting on the out ring, not yet taken by the host
    pub fn pending_requests(&self) -> usize {
        self.out_dev.num_avail()
    }

    /// Receive slots the guest currently has posted
    pub fn posted_slots(&self) -> usize {
        self.in_dev.num_avail()
    }

    /// Push one host -> guest message into a posted receive slot.
    pub fn deliver(&self, message: &[u8]) {
        let mut avail = self
            .in_dev
            .wait_avail(TIMEOUT)
            .expect("guest posted no receive slot");
        avail.chain.writable[..message.len()].copy_from_slice(message);
        self.in_dev.push_used(avail, message.len());
    }

    pub fn deliver_recv(&self, vfd_id: VfdId, ids: &[VfdId], data: &[u8]) {
        self.deliver(&encode_recv(vfd_id, ids, data));
    }

    pub fn deliver_close(&self, vfd_id: VfdId) {
        self.deliver(&CtrlVfd::close(vfd_id).encode());
    }

    /// Hand the guest a host-allocated region. Returns its pfn.
    pub fn deliver_vfd_new(&self, vfd_id: VfdId, flags: VfdFlags, size: u32) -> u64 {
        let pfn = self.arena.alloc(u64::from(size)).unwrap();
        self.state().allocations.insert(vfd_id, pfn);
        let message = VfdNew {
            hdr: CtrlHeader::new(CtrlType::VfdNew),
            vfd_id,
            flags,
            pfn,
            size,
        };
        self.deliver(&message.encode());
        pfn
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A probed device wired to a running fake host
pub struct Harness {
    pub device: VirtwlDevice,
    pub host: FakeHost,
}

pub fn config() -> VirtwlConfig {
    let mut config = VirtwlConfig::default();
    config.transport.capacity_wait_ms = 1000;
    config
}

pub fn harness() -> Harness {
    harness_with(config(), 16, 16)
}

pub fn harness_with(config: VirtwlConfig, in_size: usize, out_size: usize) -> Harness {
    init_tracing();
    let (in_queue, in_dev) = mem_queue("in", in_size);
    let (out_queue, out_dev) = mem_queue("out", out_size);
    let arena = Arc::new(FrameArena::new(0x1000));
    let host = FakeHost::start(in_dev, out_dev, arena.clone());
    let memory: Arc<dyn GuestMemory> = arena;
    let device =
        VirtwlDevice::probe(config, Box::new(in_queue), Box::new(out_queue), memory).unwrap();
    Harness { device, host }
}

/// Poll `condition` until it holds or the test timeout passes.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
