//! A scriptable I/O controller living on a [`LoopbackFabric`].
//!
//! It listens for the control and data services of one interface instance
//! on each of its ports, answers every control command with a well-formed
//! response, owns a real receive ring that the host transmits into, and
//! writes frames into the host's receive ring on request. Each control
//! connection is paired with its data connection through the path id in the
//! connection private data.
//!
//! [`IocBehavior`] makes it misbehave on demand: wrong version or counts,
//! silent commands, error packets, mismatched responses, rejected connections
//! and withheld transmit buffers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::data::KICK_MESSAGE;
use crate::error::{Result, VnicError};
use crate::protocol::trailer::{POOL_ENTRY_SIZE, TRAILER_SIZE, frame_image, pkt_flags};
use crate::protocol::{
    AddressOp, BufferPoolEntry, Command, ConfigLink, ConnectionData, ControlBody, ControlMessage,
    ControlRequest, ControlResponse, ExchangePools, FeatureFlags, InitVnicResponse,
    IocStatistics, LanSwitch, MAX_CONTROL_PACKET, PROTOCOL_MAJOR, PROTOCOL_MINOR, PoolParams,
    StatusReport, Trailer,
};
use crate::transport::loopback::{IncomingConnection, Listener, LoopbackFabric};
use crate::transport::{
    EventSink, MemoryRegion, QueuePair, RemoteAddr, Sge, Transport, TransportEvent,
};
use crate::types::{Gid, MacAddress, ServiceId};

const CONTROL_RECVS: u64 = 8;
const KICK_RECVS: u64 = 4;
const KICK_CAPACITY: usize = 64;

/// How the emulated controller answers.
#[derive(Debug, Clone)]
pub struct IocBehavior {
    /// Protocol version reported in the init response.
    pub version: (u16, u16),
    /// Overrides the data path count granted in the init response.
    pub num_data_paths: Option<u8>,
    pub num_lan_switches: Option<u8>,
    /// Overrides the instance echoed in the init response.
    pub instance: Option<u8>,
    /// Address table capacity; the init response grants the smaller of
    /// this and the host's request.
    pub address_entries: u16,
    pub features: u32,
    pub mac: MacAddress,
    pub default_vlan: u16,
    /// Commands that get no answer at all.
    pub silent: HashSet<Command>,
    /// Commands answered with a response for a different command.
    pub mismatch: HashSet<Command>,
    /// Commands answered with an error packet.
    pub error_packet: HashSet<Command>,
    pub reject_control: bool,
    pub reject_data: bool,
    /// Consumed receive buffers are kept until
    /// [`EmulatedIoc::release_xmit_buffers`].
    pub hold_xmit_buffers: bool,
    /// Overrides the host receive ring size echoed by configure-data-path.
    pub host_entry_count: Option<u32>,
    /// Receive checksum flags placed in injected frame trailers.
    pub rx_csum_flags: u8,
    pub stats: IocStatistics,
    /// How often the receive ring is scanned without a kick.
    pub poll_interval: Duration,
}

impl Default for IocBehavior {
    fn default() -> Self {
        Self {
            version: (PROTOCOL_MAJOR, PROTOCOL_MINOR),
            num_data_paths: None,
            num_lan_switches: None,
            instance: None,
            address_entries: 64,
            features: FeatureFlags::IPV4_CSUM_RX
                | FeatureFlags::TCP_CSUM_RX
                | FeatureFlags::UDP_CSUM_RX
                | FeatureFlags::IPV4_CSUM_TX
                | FeatureFlags::TCP_CSUM_TX
                | FeatureFlags::UDP_CSUM_TX,
            mac: MacAddress([0x02, 0x00, 0x5e, 0x10, 0x00, 0x01]),
            default_vlan: 0,
            silent: HashSet::new(),
            mismatch: HashSet::new(),
            error_packet: HashSet::new(),
            reject_control: false,
            reject_data: false,
            hold_xmit_buffers: false,
            host_entry_count: None,
            rx_csum_flags: 0,
            stats: IocStatistics::default(),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// A frame the host wrote into the controller's receive ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocFrame {
    pub data: Vec<u8>,
    pub dest_mac: MacAddress,
    pub vlan: Option<u16>,
    /// The trailer asked the controller to process the ring now.
    pub kick: bool,
    pub tx_csum_flags: u8,
}

struct Rings {
    host: PoolParams,
    ioc: PoolParams,
    /// Controller receive buffers the host writes frames into.
    buffers: Arc<dyn MemoryRegion>,
    /// Host receive buffers, pushed here by the host.
    free_table: Arc<dyn MemoryRegion>,
    entry_scratch: Arc<dyn MemoryRegion>,
    frame_scratch: Arc<dyn MemoryRegion>,
    host_xmit_table: RemoteAddr,
    next_rx: u32,
    next_tx: u32,
    held: Vec<u32>,
}

#[derive(Default)]
struct Session {
    control: Option<Arc<dyn QueuePair>>,
    data: Option<Arc<dyn QueuePair>>,
    pools: Option<(PoolParams, PoolParams)>,
    rings: Option<Rings>,
}

struct IocInner {
    fabric: LoopbackFabric,
    behavior: Mutex<IocBehavior>,
    sessions: Mutex<HashMap<u64, Session>>,
    requests: Mutex<Vec<ControlRequest>>,
    frames: Mutex<Vec<IocFrame>>,
    addresses: Mutex<BTreeMap<u16, AddressOp>>,
    last_link: Mutex<Option<ConfigLink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_wr: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Handle to a running emulated controller. Dropping it stops every task.
pub struct EmulatedIoc {
    inner: Arc<IocInner>,
}

impl Rings {
    /// Offer controller buffer `index` in slot `index` of the host's
    /// transmit table.
    fn advertise(&self, qp: &dyn QueuePair, index: u32) -> Result<()> {
        let entry = BufferPoolEntry {
            addr: self.buffers.addr() + index as u64 * self.ioc.entry_size as u64,
            rkey: self.buffers.rkey(),
            valid: true,
        };
        self.entry_scratch.write(0, &entry.encode())?;
        qp.rdma_write(
            0,
            Sge {
                region: self.entry_scratch.as_ref(),
                offset: 0,
                len: POOL_ENTRY_SIZE,
            },
            RemoteAddr {
                addr: self.host_xmit_table.addr + (index as usize * POOL_ENTRY_SIZE) as u64,
                rkey: self.host_xmit_table.rkey,
            },
            false,
        )
    }

    /// Take every frame the host completed, in ring order.
    fn drain(&mut self, qp: &dyn QueuePair, hold: bool) -> Result<(Vec<IocFrame>, u32)> {
        let entry = self.ioc.entry_size as usize;
        let mut frames = Vec::new();
        let mut reposted = 0;
        loop {
            let index = self.next_rx;
            let base = index as usize * entry;
            let mut raw = [0u8; TRAILER_SIZE];
            self.buffers.read(base + entry - TRAILER_SIZE, &mut raw)?;
            let t = Trailer::decode(&raw)?;
            if !t.is_valid() {
                break;
            }
            let start = t.data_start(entry)?;
            let mut data = vec![0u8; t.data_length as usize];
            self.buffers.read(base + start, &mut data)?;
            frames.push(IocFrame {
                data,
                dest_mac: t.dest_mac,
                vlan: t.has_flag(pkt_flags::VLAN_INSERT).then_some(t.vlan),
                kick: t.has_flag(pkt_flags::KICK),
                tx_csum_flags: t.tx_csum_flags,
            });
            self.buffers
                .write(base + entry - TRAILER_SIZE, &[0u8; TRAILER_SIZE])?;
            self.next_rx = (index + 1) % self.ioc.entry_count;
            if hold {
                self.held.push(index);
            } else {
                self.advertise(qp, index)?;
                reposted += 1;
            }
        }
        Ok((frames, reposted))
    }

    /// Write `frame` into the next free host buffer. Returns false when the
    /// host has not pushed one.
    fn inject(&mut self, qp: &dyn QueuePair, frame: &[u8], rx_csum: u8) -> Result<bool> {
        let slot = self.next_tx as usize * POOL_ENTRY_SIZE;
        let mut raw = [0u8; POOL_ENTRY_SIZE];
        self.free_table.read(slot, &mut raw)?;
        let entry = BufferPoolEntry::decode(&raw)?;
        if !entry.valid {
            return Ok(false);
        }
        let dest = frame
            .get(..6)
            .and_then(|b| <[u8; 6]>::try_from(b).ok())
            .map(MacAddress)
            .unwrap_or(MacAddress::BROADCAST);
        let mut trailer = Trailer::for_frame(frame.len(), dest);
        trailer.rx_csum_flags = rx_csum;
        let image = frame_image(frame, &trailer);
        let host_entry = self.host.entry_size as usize;
        if image.len() > host_entry {
            return Err(VnicError::FrameTooLarge {
                len: frame.len(),
                max: host_entry - TRAILER_SIZE,
            });
        }
        self.frame_scratch.write(0, &image)?;
        qp.rdma_write(
            0,
            Sge {
                region: self.frame_scratch.as_ref(),
                offset: 0,
                len: image.len(),
            },
            RemoteAddr {
                addr: entry.addr + (host_entry - image.len()) as u64,
                rkey: entry.rkey,
            },
            false,
        )?;
        self.free_table.write(slot, &BufferPoolEntry::INVALID.encode())?;
        self.next_tx = (self.next_tx + 1) % self.host.entry_count;
        Ok(true)
    }
}

impl IocInner {
    fn wr_id(&self) -> u64 {
        self.next_wr.fetch_add(1, Ordering::Relaxed)
    }

    fn kick(&self, qp: &dyn QueuePair) -> Result<()> {
        qp.post_send(self.wr_id(), &KICK_MESSAGE)
    }

    fn behavior(&self) -> IocBehavior {
        lock(&self.behavior).clone()
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn on_control_connect(self: &Arc<Self>, incoming: IncomingConnection) -> Result<()> {
        let cd = ConnectionData::decode(&incoming.request.private_data)?;
        if self.behavior().reject_control {
            tracing::debug!(path_id = cd.path_id, "emulated controller rejecting control");
            incoming.reject("control connection refused");
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let qp = incoming.accept(EventSink::channel(tx, |ev| ev))?;
        for wr_id in 0..CONTROL_RECVS {
            qp.post_recv(wr_id, MAX_CONTROL_PACKET)?;
        }
        lock(&self.sessions).entry(cd.path_id).or_default().control = Some(Arc::clone(&qp));
        tracing::debug!(path_id = cd.path_id, node = %cd.node_name, "control connection accepted");
        let inner = Arc::clone(self);
        self.track(tokio::spawn(inner.run_control(cd.path_id, qp, rx)));
        Ok(())
    }

    fn on_data_connect(self: &Arc<Self>, incoming: IncomingConnection) -> Result<()> {
        let cd = ConnectionData::decode(&incoming.request.private_data)?;
        let behavior = self.behavior();
        if behavior.reject_data {
            tracing::debug!(path_id = cd.path_id, "emulated controller rejecting data");
            incoming.reject("data connection refused");
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let qp = incoming.accept(EventSink::channel(tx, |ev| ev))?;
        for wr_id in 0..KICK_RECVS {
            qp.post_recv(wr_id, KICK_CAPACITY)?;
        }
        lock(&self.sessions).entry(cd.path_id).or_default().data = Some(Arc::clone(&qp));
        let inner = Arc::clone(self);
        self.track(tokio::spawn(inner.run_data(
            cd.path_id,
            qp,
            rx,
            behavior.poll_interval,
        )));
        Ok(())
    }

    async fn run_control(
        self: Arc<Self>,
        path_id: u64,
        qp: Arc<dyn QueuePair>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(ev) = events.recv().await {
            match ev {
                TransportEvent::RecvComplete { wr_id, data } => {
                    if let Err(e) = qp.post_recv(wr_id, MAX_CONTROL_PACKET) {
                        tracing::warn!(path_id, error = %e, "control repost failed");
                        break;
                    }
                    match ControlMessage::decode(&data) {
                        Ok(ControlMessage {
                            header,
                            body: ControlBody::Request(req),
                        }) => self.on_request(path_id, qp.as_ref(), header.sequence, req),
                        Ok(other) => {
                            tracing::debug!(path_id, command = ?other.header.command, "ignoring non-request")
                        }
                        Err(e) => tracing::warn!(path_id, error = %e, "undecodable control packet"),
                    }
                }
                TransportEvent::Disconnected => break,
                _ => {}
            }
        }
        lock(&self.sessions).remove(&path_id);
        tracing::debug!(path_id, "control session closed");
    }

    async fn run_data(
        self: Arc<Self>,
        path_id: u64,
        qp: Arc<dyn QueuePair>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        poll: Duration,
    ) {
        let mut tick = tokio::time::interval(poll);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(TransportEvent::RecvComplete { wr_id, .. }) => {
                        if qp.post_recv(wr_id, KICK_CAPACITY).is_err() {
                            break;
                        }
                        self.scan(path_id);
                    }
                    Some(TransportEvent::Disconnected) | None => break,
                    Some(_) => {}
                },
                _ = tick.tick() => self.scan(path_id),
            }
        }
        tracing::debug!(path_id, "data session closed");
    }

    fn scan(&self, path_id: u64) {
        let hold = lock(&self.behavior).hold_xmit_buffers;
        let result = {
            let mut sessions = lock(&self.sessions);
            let Some(s) = sessions.get_mut(&path_id) else {
                return;
            };
            let (Some(rings), Some(qp)) = (s.rings.as_mut(), s.data.as_ref()) else {
                return;
            };
            rings.drain(qp.as_ref(), hold).and_then(|(frames, reposted)| {
                if reposted > 0 {
                    self.kick(qp.as_ref())?;
                }
                Ok(frames)
            })
        };
        match result {
            Ok(frames) if !frames.is_empty() => {
                tracing::trace!(path_id, frames = frames.len(), "controller received frames");
                lock(&self.frames).extend(frames);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(path_id, error = %e, "receive ring scan failed"),
        }
    }

    fn on_request(&self, path_id: u64, qp: &dyn QueuePair, seq: u8, req: ControlRequest) {
        let cmd = req.command();
        lock(&self.requests).push(req.clone());
        let b = self.behavior();
        if b.silent.contains(&cmd) {
            tracing::debug!(path_id, command = ?cmd, "staying silent");
            return;
        }
        let reply = if b.error_packet.contains(&cmd) {
            ControlMessage::error(cmd, seq)
        } else if b.mismatch.contains(&cmd) {
            let wrong = if cmd == Command::Heartbeat {
                ControlResponse::Reset
            } else {
                ControlResponse::Heartbeat
            };
            ControlMessage::response(wrong, seq)
        } else {
            match self.respond(path_id, req, &b) {
                Ok(rsp) => ControlMessage::response(rsp, seq),
                Err(e) => {
                    tracing::warn!(path_id, command = ?cmd, error = %e, "answering with error packet");
                    ControlMessage::error(cmd, seq)
                }
            }
        };
        if let Err(e) = qp.post_send(self.wr_id(), &reply.encode()) {
            tracing::warn!(path_id, command = ?cmd, error = %e, "control reply failed");
        }
    }

    fn respond(&self, path_id: u64, req: ControlRequest, b: &IocBehavior) -> Result<ControlResponse> {
        let rsp = match req {
            ControlRequest::InitVnic(r) => ControlResponse::InitVnic(InitVnicResponse {
                major: b.version.0,
                minor: b.version.1,
                instance: b.instance.unwrap_or(r.instance),
                num_lan_switches: b.num_lan_switches.unwrap_or(1),
                num_data_paths: b.num_data_paths.unwrap_or(1),
                num_address_entries: r.num_address_entries.min(b.address_entries),
                features: FeatureFlags(b.features),
                lan_switch: LanSwitch {
                    number: 0,
                    num_enet_ports: 1,
                    default_vlan: b.default_vlan,
                    mac: b.mac,
                },
            }),
            ControlRequest::ConfigDataPath(mut c) => {
                if let Some(n) = b.host_entry_count {
                    c.host.entry_count = n;
                }
                lock(&self.sessions).entry(path_id).or_default().pools = Some((c.host, c.ioc));
                ControlResponse::ConfigDataPath(c)
            }
            ControlRequest::ExchangePools(x) => ControlResponse::ExchangePools(self.exchange(path_id, x, b)?),
            ControlRequest::ConfigAddresses(c) => {
                let mut table = lock(&self.addresses);
                for op in &c.ops {
                    if op.valid {
                        table.insert(op.index, *op);
                    } else {
                        table.remove(&op.index);
                    }
                }
                ControlResponse::ConfigAddresses(c)
            }
            ControlRequest::ConfigLink(l) => {
                *lock(&self.last_link) = Some(l);
                ControlResponse::ConfigLink(ConfigLink {
                    default_vlan: b.default_vlan,
                    mac: b.mac,
                    ..l
                })
            }
            ControlRequest::ReportStatistics { lan_switch } => ControlResponse::ReportStatistics {
                lan_switch,
                stats: b.stats,
            },
            ControlRequest::ClearStatistics { .. } => ControlResponse::ClearStatistics,
            ControlRequest::Reset => ControlResponse::Reset,
            ControlRequest::Heartbeat(_) => ControlResponse::Heartbeat,
        };
        Ok(rsp)
    }

    /// Build the controller's receive ring and offer it to the host.
    fn exchange(&self, path_id: u64, x: ExchangePools, b: &IocBehavior) -> Result<ExchangePools> {
        let mut sessions = lock(&self.sessions);
        let s = sessions.entry(path_id).or_default();
        let (host, ioc) = s.pools.ok_or_else(|| VnicError::ProtocolMismatch {
            command: Command::ExchangePools,
            reason: "pools not configured".into(),
        })?;
        let qp = s.data.clone().ok_or(VnicError::NotConnected)?;
        let mut rings = Rings {
            host,
            ioc,
            buffers: self
                .fabric
                .register_memory(ioc.entry_count as usize * ioc.entry_size as usize)?,
            free_table: self
                .fabric
                .register_memory(host.entry_count as usize * POOL_ENTRY_SIZE)?,
            entry_scratch: self.fabric.register_memory(POOL_ENTRY_SIZE)?,
            frame_scratch: self.fabric.register_memory(host.entry_size as usize)?,
            host_xmit_table: RemoteAddr {
                addr: x.addr,
                rkey: x.rkey,
            },
            next_rx: 0,
            next_tx: 0,
            held: Vec::new(),
        };
        if b.hold_xmit_buffers {
            rings.held.extend(0..ioc.entry_count);
        } else {
            for i in 0..ioc.entry_count {
                rings.advertise(qp.as_ref(), i)?;
            }
        }
        let table = ExchangePools {
            data_path: x.data_path,
            rkey: rings.free_table.rkey(),
            addr: rings.free_table.addr(),
        };
        s.rings = Some(rings);
        tracing::debug!(path_id, buffers = ioc.entry_count, "controller pools exchanged");
        Ok(table)
    }
}

async fn accept_loop(
    inner: Arc<IocInner>,
    mut listener: Listener,
    on_connect: fn(&Arc<IocInner>, IncomingConnection) -> Result<()>,
) {
    while let Some(incoming) = listener.accept().await {
        if let Err(e) = on_connect(&inner, incoming) {
            tracing::warn!(error = %e, "emulated controller failed to accept");
        }
    }
}

impl EmulatedIoc {
    /// Listen on every port in `ports` for interface `instance`.
    pub fn start(
        fabric: &LoopbackFabric,
        ports: &[Gid],
        instance: u8,
        behavior: IocBehavior,
    ) -> Result<Self> {
        let inner = Arc::new(IocInner {
            fabric: fabric.clone(),
            behavior: Mutex::new(behavior),
            sessions: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            addresses: Mutex::new(BTreeMap::new()),
            last_link: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            next_wr: AtomicU64::new(1 << 32),
        });
        for gid in ports {
            let control = fabric.listen(*gid, ServiceId::control(instance))?;
            let data = fabric.listen(*gid, ServiceId::data(instance))?;
            inner.track(tokio::spawn(accept_loop(
                Arc::clone(&inner),
                control,
                IocInner::on_control_connect,
            )));
            inner.track(tokio::spawn(accept_loop(
                Arc::clone(&inner),
                data,
                IocInner::on_data_connect,
            )));
        }
        tracing::debug!(ports = ports.len(), instance, "emulated controller listening");
        Ok(Self { inner })
    }

    /// Change how later requests and connections are answered.
    pub fn set_behavior(&self, f: impl FnOnce(&mut IocBehavior)) {
        f(&mut lock(&self.inner.behavior));
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<ControlRequest> {
        lock(&self.inner.requests).clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        lock(&self.inner.requests)
            .iter()
            .map(ControlRequest::command)
            .collect()
    }

    pub fn clear_requests(&self) {
        lock(&self.inner.requests).clear();
    }

    /// Frames the host has written so far.
    pub fn received_frames(&self) -> Vec<IocFrame> {
        lock(&self.inner.frames).clone()
    }

    /// Valid address-table entries, by index.
    pub fn addresses(&self) -> Vec<AddressOp> {
        lock(&self.inner.addresses).values().copied().collect()
    }

    pub fn last_link(&self) -> Option<ConfigLink> {
        *lock(&self.inner.last_link)
    }

    /// Live control connections.
    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions)
            .values()
            .filter(|s| s.control.is_some())
            .count()
    }

    /// Write `frame` into every live session's host receive ring and kick.
    /// Returns how many sessions took it.
    pub fn inject(&self, frame: &[u8]) -> Result<usize> {
        let rx_csum = lock(&self.inner.behavior).rx_csum_flags;
        let mut delivered = 0;
        let mut sessions = lock(&self.inner.sessions);
        for (path_id, s) in sessions.iter_mut() {
            let (Some(rings), Some(qp)) = (s.rings.as_mut(), s.data.as_ref()) else {
                continue;
            };
            if rings.inject(qp.as_ref(), frame, rx_csum)? {
                self.inner.kick(qp.as_ref())?;
                delivered += 1;
            } else {
                tracing::debug!(path_id, "no free host buffer, frame dropped");
            }
        }
        Ok(delivered)
    }

    /// Offer back every receive buffer withheld so far.
    pub fn release_xmit_buffers(&self) -> Result<usize> {
        let mut released = 0;
        let mut sessions = lock(&self.inner.sessions);
        for s in sessions.values_mut() {
            let (Some(rings), Some(qp)) = (s.rings.as_mut(), s.data.as_ref()) else {
                continue;
            };
            let held = std::mem::take(&mut rings.held);
            for index in &held {
                rings.advertise(qp.as_ref(), *index)?;
            }
            if !held.is_empty() {
                self.inner.kick(qp.as_ref())?;
            }
            released += held.len();
        }
        Ok(released)
    }

    /// Send an asynchronous status report on every control connection.
    pub fn send_status(&self, report: StatusReport) -> Result<()> {
        let packet = ControlMessage::info(report).encode();
        let qps: Vec<_> = lock(&self.inner.sessions)
            .values()
            .filter_map(|s| s.control.clone())
            .collect();
        for qp in qps {
            qp.post_send(self.inner.wr_id(), &packet)?;
        }
        Ok(())
    }

    /// Drop every connection from the controller side.
    pub fn disconnect_all(&self) {
        let sessions: Vec<Session> = lock(&self.inner.sessions)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for s in sessions {
            if let Some(qp) = s.data {
                qp.disconnect();
            }
            if let Some(qp) = s.control {
                qp.disconnect();
            }
        }
    }
}

impl Drop for EmulatedIoc {
    fn drop(&mut self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for EmulatedIoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedIoc")
            .field("sessions", &self.session_count())
            .field("requests", &lock(&self.inner.requests).len())
            .finish()
    }
}
