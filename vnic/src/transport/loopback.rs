//! In-memory RDMA fabric.
//!
//! Regions are plain byte vectors addressed by `(addr, rkey)`. Queue pairs
//! pair up through listeners keyed by `(gid, service)`. Sends are matched to
//! posted receives in order and RDMA writes copy directly into the target
//! region, so a write followed by a send is visible before the send
//! completes, as on a reliable-connected queue pair.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use super::{
    CompletionStatus, ConnectRequest, EventSink, MemoryRegion, QueuePair, RemoteAddr, Sge,
    Transport, TransportEvent,
};
use crate::error::{Result, VnicError};
use crate::types::{Gid, ServiceId};

const REGION_BASE: u64 = 0x1_0000_0000;
const PAGE: u64 = 4096;

#[derive(Default)]
struct FabricState {
    next_addr: u64,
    next_rkey: u32,
    next_qp: u32,
    regions: HashMap<u32, Weak<LoopbackRegion>>,
    listeners: HashMap<(Gid, ServiceId), mpsc::UnboundedSender<IncomingConnection>>,
    qps: HashMap<u32, Weak<LoopbackQp>>,
    down_ports: HashSet<Gid>,
}

struct FabricInner {
    state: Mutex<FabricState>,
}

impl FabricInner {
    fn state(&self) -> std::sync::MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Shared handle to one in-memory fabric.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state();
        f.debug_struct("LoopbackFabric")
            .field("regions", &st.regions.len())
            .field("queue_pairs", &st.qps.len())
            .field("listeners", &st.listeners.len())
            .finish()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                state: Mutex::new(FabricState {
                    next_addr: REGION_BASE,
                    next_rkey: 0x100,
                    next_qp: 1,
                    ..Default::default()
                }),
            }),
        }
    }

    /// Register a listener for connection requests to `(gid, service)`.
    pub fn listen(&self, gid: Gid, service: ServiceId) -> Result<Listener> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.inner.state();
        if st.listeners.contains_key(&(gid, service)) {
            return Err(VnicError::transport(format!(
                "service {:#x} already bound on {gid}",
                service.0
            )));
        }
        st.listeners.insert((gid, service), tx);
        Ok(Listener {
            rx,
            key: (gid, service),
            fabric: Arc::downgrade(&self.inner),
        })
    }

    /// Take a port down: every queue pair using it is disconnected and new
    /// connections through it are rejected until [`restore_port`] is called.
    ///
    /// [`restore_port`]: LoopbackFabric::restore_port
    pub fn fail_port(&self, gid: Gid) {
        let victims: Vec<Arc<LoopbackQp>> = {
            let mut st = self.inner.state();
            st.down_ports.insert(gid);
            st.qps
                .values()
                .filter_map(Weak::upgrade)
                .filter(|qp| qp.local_gid == gid || qp.remote_gid == gid)
                .collect()
        };
        tracing::debug!(%gid, queue_pairs = victims.len(), "loopback port down");
        for qp in victims {
            qp.drop_connection(true);
        }
    }

    pub fn restore_port(&self, gid: Gid) {
        self.inner.state().down_ports.remove(&gid);
    }

    /// Live registered regions.
    pub fn region_count(&self) -> usize {
        self.inner
            .state()
            .regions
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn new_qp(&self, local_gid: Gid, remote_gid: Gid, events: EventSink) -> Arc<LoopbackQp> {
        let mut st = self.inner.state();
        let num = st.next_qp;
        st.next_qp += 1;
        let qp = Arc::new(LoopbackQp {
            num,
            local_gid,
            remote_gid,
            fabric: Arc::downgrade(&self.inner),
            events,
            state: Mutex::new(QpState::default()),
        });
        st.qps.retain(|_, w| w.strong_count() > 0);
        st.qps.insert(num, Arc::downgrade(&qp));
        qp
    }
}

impl Transport for LoopbackFabric {
    fn register_memory(&self, len: usize) -> Result<Arc<dyn MemoryRegion>> {
        let mut st = self.inner.state();
        let addr = st.next_addr;
        let rkey = st.next_rkey;
        st.next_addr += (len as u64).div_ceil(PAGE) * PAGE + PAGE;
        st.next_rkey += 1;
        let region = Arc::new(LoopbackRegion {
            addr,
            rkey,
            bytes: Mutex::new(vec![0; len]),
            fabric: Arc::downgrade(&self.inner),
        });
        st.regions.insert(rkey, Arc::downgrade(&region));
        Ok(region)
    }

    fn connect(&self, request: ConnectRequest, events: EventSink) -> Result<Arc<dyn QueuePair>> {
        let qp = self.new_qp(request.source_gid, request.dest_gid, events.clone());
        let (down, listener) = {
            let st = self.inner.state();
            let down =
                st.down_ports.contains(&request.source_gid) || st.down_ports.contains(&request.dest_gid);
            let listener = st.listeners.get(&(request.dest_gid, request.service)).cloned();
            (down, listener)
        };
        let reject = |reason: &str| {
            events.deliver(TransportEvent::Rejected {
                reason: reason.to_string(),
            })
        };
        if down {
            reject("port down");
        } else {
            match listener {
                None => reject("no listener for service"),
                Some(tx) => {
                    let incoming = IncomingConnection {
                        request,
                        active: Arc::clone(&qp),
                        fabric: self.clone(),
                    };
                    if tx.send(incoming).is_err() {
                        reject("listener closed");
                    }
                }
            }
        }
        Ok(qp)
    }
}

/// Incoming connection requests for one `(gid, service)`.
pub struct Listener {
    rx: mpsc::UnboundedReceiver<IncomingConnection>,
    key: (Gid, ServiceId),
    fabric: Weak<FabricInner>,
}

impl Listener {
    pub async fn accept(&mut self) -> Option<IncomingConnection> {
        self.rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.state().listeners.remove(&self.key);
        }
    }
}

/// A connection request waiting for the passive side to decide.
pub struct IncomingConnection {
    pub request: ConnectRequest,
    active: Arc<LoopbackQp>,
    fabric: LoopbackFabric,
}

impl IncomingConnection {
    /// Accept, creating the passive queue pair. The active side sees
    /// [`TransportEvent::Connected`].
    pub fn accept(self, events: EventSink) -> Result<Arc<dyn QueuePair>> {
        let passive = self
            .fabric
            .new_qp(self.request.dest_gid, self.request.source_gid, events);
        {
            let mut a = self.active.state();
            if a.closed {
                return Err(VnicError::transport("connection withdrawn by requester"));
            }
            a.peer = Some(Arc::downgrade(&passive));
            a.connected = true;
        }
        {
            let mut p = passive.state();
            p.peer = Some(Arc::downgrade(&self.active));
            p.connected = true;
        }
        self.active.events.deliver(TransportEvent::Connected);
        Ok(passive)
    }

    pub fn reject(self, reason: impl Into<String>) {
        self.active.events.deliver(TransportEvent::Rejected {
            reason: reason.into(),
        });
    }
}

pub struct LoopbackRegion {
    addr: u64,
    rkey: u32,
    bytes: Mutex<Vec<u8>>,
    fabric: Weak<FabricInner>,
}

impl LoopbackRegion {
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.len();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(VnicError::transport(format!(
                "access of {len} bytes at offset {offset} outside {size}-byte region {:#x}",
                self.rkey
            )));
        }
        Ok(())
    }
}

impl MemoryRegion for LoopbackRegion {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn rkey(&self) -> u32 {
        self.rkey
    }

    fn len(&self) -> usize {
        self.bytes.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        let bytes = self
            .bytes
            .lock()
            .map_err(|_| VnicError::LockPoisoned("loopback region"))?;
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| VnicError::LockPoisoned("loopback region"))?;
        bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl Drop for LoopbackRegion {
    fn drop(&mut self) {
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.state().regions.remove(&self.rkey);
        }
    }
}

#[derive(Default)]
struct QpState {
    peer: Option<Weak<LoopbackQp>>,
    connected: bool,
    closed: bool,
    recvs: VecDeque<(u64, usize)>,
    backlog: VecDeque<Vec<u8>>,
}

pub struct LoopbackQp {
    num: u32,
    local_gid: Gid,
    remote_gid: Gid,
    fabric: Weak<FabricInner>,
    events: EventSink,
    state: Mutex<QpState>,
}

impl LoopbackQp {
    fn state(&self) -> std::sync::MutexGuard<'_, QpState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn connected_peer(&self) -> Result<Arc<LoopbackQp>> {
        let st = self.state();
        if !st.connected {
            return Err(VnicError::transport(format!(
                "queue pair {} is not connected",
                self.num
            )));
        }
        st.peer
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| VnicError::transport(format!("queue pair {} lost its peer", self.num)))
    }

    fn deliver_message(&self, data: Vec<u8>) -> Result<()> {
        let matched = {
            let mut st = self.state();
            if st.closed || !st.connected {
                return Err(VnicError::transport("remote queue pair is closed"));
            }
            match st.recvs.pop_front() {
                Some((wr_id, capacity)) => {
                    if data.len() > capacity {
                        return Err(VnicError::transport(format!(
                            "message of {} bytes overruns {capacity}-byte receive",
                            data.len()
                        )));
                    }
                    Some(wr_id)
                }
                None => {
                    st.backlog.push_back(data.clone());
                    None
                }
            }
        };
        if let Some(wr_id) = matched {
            self.events
                .deliver(TransportEvent::RecvComplete { wr_id, data });
        }
        Ok(())
    }

    /// Close this side; with `notify_self` the local owner also sees
    /// [`TransportEvent::Disconnected`].
    fn drop_connection(&self, notify_self: bool) {
        let (peer, was_connected) = {
            let mut st = self.state();
            let was = st.connected;
            st.connected = false;
            st.closed = true;
            st.recvs.clear();
            (st.peer.take().and_then(|w| w.upgrade()), was)
        };
        if was_connected && notify_self {
            self.events.deliver(TransportEvent::Disconnected);
        }
        if let Some(peer) = peer {
            let peer_was_connected = {
                let mut st = peer.state();
                let was = st.connected;
                st.connected = false;
                st.closed = true;
                st.peer = None;
                st.recvs.clear();
                was
            };
            if peer_was_connected {
                peer.events.deliver(TransportEvent::Disconnected);
            }
        }
    }
}

impl QueuePair for LoopbackQp {
    fn qp_num(&self) -> u32 {
        self.num
    }

    fn post_send(&self, wr_id: u64, data: &[u8]) -> Result<()> {
        let peer = self.connected_peer()?;
        peer.deliver_message(data.to_vec())?;
        self.events.deliver(TransportEvent::SendComplete {
            wr_id,
            status: CompletionStatus::Success,
        });
        Ok(())
    }

    fn post_recv(&self, wr_id: u64, capacity: usize) -> Result<()> {
        let ready = {
            let mut st = self.state();
            if st.closed {
                return Err(VnicError::transport("queue pair is closed"));
            }
            match st.backlog.pop_front() {
                Some(data) if data.len() <= capacity => Some(data),
                Some(data) => {
                    let len = data.len();
                    st.backlog.push_front(data);
                    return Err(VnicError::transport(format!(
                        "pending message of {len} bytes overruns {capacity}-byte receive"
                    )));
                }
                None => {
                    st.recvs.push_back((wr_id, capacity));
                    None
                }
            }
        };
        if let Some(data) = ready {
            self.events
                .deliver(TransportEvent::RecvComplete { wr_id, data });
        }
        Ok(())
    }

    fn rdma_write(
        &self,
        wr_id: u64,
        local: Sge<'_>,
        remote: RemoteAddr,
        signaled: bool,
    ) -> Result<()> {
        self.connected_peer()?;
        let mut buf = vec![0u8; local.len];
        local.region.read(local.offset, &mut buf)?;
        let fabric = self
            .fabric
            .upgrade()
            .ok_or_else(|| VnicError::transport("fabric torn down"))?;
        let target = fabric
            .state()
            .regions
            .get(&remote.rkey)
            .and_then(Weak::upgrade);
        let Some(target) = target else {
            return Err(VnicError::transport(format!(
                "remote access error: unknown rkey {:#x}",
                remote.rkey
            )));
        };
        let offset = remote
            .addr
            .checked_sub(target.addr)
            .ok_or_else(|| VnicError::transport("remote access error: address below region"))?;
        target.write(offset as usize, &buf)?;
        if signaled {
            self.events.deliver(TransportEvent::WriteComplete {
                wr_id,
                status: CompletionStatus::Success,
            });
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.drop_connection(false);
    }
}

impl Drop for LoopbackQp {
    fn drop(&mut self) {
        let peer = self.state().peer.take().and_then(|w| w.upgrade());
        if let Some(peer) = peer {
            let was = {
                let mut st = peer.state();
                let was = st.connected;
                st.connected = false;
                st.closed = true;
                st.peer = None;
                was
            };
            if was {
                peer.events.deliver(TransportEvent::Disconnected);
            }
        }
    }
}
