//! Viport: one control channel and one data channel bound to one path to a
//! remote controller.
//!
//! Each viport runs a single drain task that owns its [`ControlChannel`] and
//! consumes transport events, timers and wake-ups from one queue. The
//! [`Viport`] handle is the only way other code reaches it: transmit goes
//! straight to the data channel, everything else is requested through the
//! pending-work bitmask or the event queue.

pub mod state;
pub mod work;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::{VnicConfig, buffer_size};
use crate::control::address::{AddressTable, MulticastMode};
use crate::control::{ControlChannel, ResponsePoll};
use crate::data::{DataChannel, DataStatistics, ReceivedFrame, WriteCompletion};
use crate::error::{Result, VnicError};
use crate::protocol::{
    Command, ConfigAddresses, ConfigDataPath, ConfigLink, ConnectionData, ControlRequest,
    ControlResponse, ExchangePools, FeatureFlags, Heartbeat, InitVnicRequest, InitVnicResponse,
    IocStatistics, LinkFlags, MAX_CONTROL_PACKET, PROTOCOL_MAJOR, PROTOCOL_MINOR, PoolParams,
    status,
};
use crate::transport::{
    CompletionStatus, ConnectRequest, EventSink, QueuePair, RemoteAddr, Transport, TransportEvent,
};
use crate::types::{
    FrameId, LinkIndication, MacAddress, NetpathKind, OffloadCaps, PacketFilter, PathRecord,
    SendStatus, ServiceId, TransmitOutcome, TxFrame,
};

use state::{Effect, Input, Machine};
use work::PendingWork;

pub use state::{TeardownReason, ViportState};
pub use work::WorkItem;

/// Checksum offloads this host can drive, advertised in connection data.
pub const SUPPORTED_FEATURES: u32 = FeatureFlags::IPV4_CSUM_RX
    | FeatureFlags::TCP_CSUM_RX
    | FeatureFlags::UDP_CSUM_RX
    | FeatureFlags::IPV4_CSUM_TX
    | FeatureFlags::TCP_CSUM_TX
    | FeatureFlags::UDP_CSUM_TX;

/// Link configuration the upstream layer wants applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub mtu: u16,
    pub filter: PacketFilter,
    pub multicast: Vec<MacAddress>,
}

/// Identity and initial settings of one viport.
#[derive(Debug, Clone)]
pub struct ViportParams {
    /// Pairs the control and data connections at the controller.
    pub path_id: u64,
    pub instance: u8,
    pub kind: NetpathKind,
    pub path: PathRecord,
    /// Distinguishes this viport from earlier ones on the same netpath.
    pub generation: u64,
    pub link: LinkSettings,
    pub accepting: bool,
    pub offloads: OffloadCaps,
}

/// What the controller granted during capability negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub mac: MacAddress,
    pub default_vlan: u16,
    pub lan_switch: u8,
    pub address_entries: u16,
    pub features: FeatureFlags,
}

impl Negotiated {
    pub fn offloads(&self) -> OffloadCaps {
        let f = self.features;
        OffloadCaps {
            ipv4_rx: f.contains(FeatureFlags::IPV4_CSUM_RX),
            tcp_rx: f.contains(FeatureFlags::TCP_CSUM_RX),
            udp_rx: f.contains(FeatureFlags::UDP_CSUM_RX),
            ipv4_tx: f.contains(FeatureFlags::IPV4_CSUM_TX),
            tcp_tx: f.contains(FeatureFlags::TCP_CSUM_TX),
            udp_tx: f.contains(FeatureFlags::UDP_CSUM_TX),
        }
    }
}

/// Controller counters plus the local data channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViportStatistics {
    pub ioc: IocStatistics,
    pub data: DataStatistics,
}

/// Status changes a viport reports to its owner.
#[derive(Debug)]
pub enum ViportStatus {
    /// Bring-up and initial configuration completed.
    Connected(LinkIndication),
    LinkChanged(LinkIndication),
    /// Transmit buffers returned after an exhaustion.
    BuffersAvailable,
    Received(Vec<ReceivedFrame>),
    SendComplete(FrameId, SendStatus),
    Down {
        reason: TeardownReason,
        error: Option<String>,
    },
}

#[derive(Debug)]
pub struct ViportNotice {
    pub kind: NetpathKind,
    pub generation: u64,
    pub status: ViportStatus,
}

enum Event {
    Control(TransportEvent),
    Data(TransportEvent),
    Wake,
    Statistics(oneshot::Sender<Result<ViportStatistics>>),
    Shutdown,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Shared {
    work: PendingWork,
    data: Mutex<Option<Arc<DataChannel>>>,
    link: Mutex<LinkSettings>,
    link_dirty: AtomicBool,
    negotiated: Mutex<Option<Negotiated>>,
    offloads: Mutex<OffloadCaps>,
    accepting: AtomicBool,
}

pub struct Viport {
    params: ViportParams,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ViportState>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats_timeout: Duration,
}

impl Viport {
    /// Start bring-up on `params.path`. Status changes are sent to `notices`.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: Arc<VnicConfig>,
        params: ViportParams,
        notices: mpsc::UnboundedSender<ViportNotice>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ViportState::Uninitialized);
        let shared = Arc::new(Shared {
            work: PendingWork::new(),
            data: Mutex::new(None),
            link: Mutex::new(params.link.clone()),
            link_dirty: AtomicBool::new(false),
            negotiated: Mutex::new(None),
            offloads: Mutex::new(params.offloads),
            accepting: AtomicBool::new(params.accepting),
        });
        let runner = Runner {
            control: ControlChannel::new(&config.control),
            stats_timeout: config.viport.stats_query_timeout,
            config,
            transport,
            params: params.clone(),
            shared: Arc::clone(&shared),
            events_tx: events_tx.clone(),
            notices,
            state_tx,
            machine: Machine::new(),
            control_qp: None,
            next_control_wr: AtomicU64::new(0),
            data: None,
            data_wake: None,
            addresses: None,
            pools: None,
            remote_table: None,
            remote_link_up: true,
            applied_link: None,
            stats_waiters: Vec::new(),
            error: None,
        };
        let stats_timeout = runner.stats_timeout;
        let task = tokio::spawn(runner.run(events_rx));
        Self {
            params,
            events: events_tx,
            state: state_rx,
            shared,
            task: Mutex::new(Some(task)),
            stats_timeout,
        }
    }

    pub fn path_id(&self) -> u64 {
        self.params.path_id
    }

    pub fn kind(&self) -> NetpathKind {
        self.params.kind
    }

    pub fn generation(&self) -> u64 {
        self.params.generation
    }

    pub fn path(&self) -> &PathRecord {
        &self.params.path
    }

    pub fn state(&self) -> ViportState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViportState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ViportState::Connected
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        *lock(&self.shared.negotiated)
    }

    fn data(&self) -> Option<Arc<DataChannel>> {
        lock(&self.shared.data).clone()
    }

    fn wake(&self) {
        let _ = self.events.send(Event::Wake);
    }

    pub fn transmit(&self, frame: TxFrame) -> Result<TransmitOutcome> {
        let dc = self.data().ok_or(VnicError::NotConnected)?;
        dc.transmit(frame)
    }

    /// Report the frame aborted when its write completes.
    pub fn cancel(&self, id: FrameId) -> bool {
        self.data().is_some_and(|dc| dc.cancel(id))
    }

    /// Replace the link settings; changes are pushed to the controller.
    pub fn set_link(&self, link: LinkSettings) {
        *lock(&self.shared.link) = link;
        self.shared.link_dirty.store(true, Ordering::Release);
        self.shared.work.request(WorkItem::ConfigLink);
        self.shared.work.request(WorkItem::ConfigAddresses);
        self.wake();
    }

    /// Whether received frames go upstream or are recycled at once.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::Release);
        if let Some(dc) = self.data() {
            dc.set_accepting(accepting);
        }
    }

    /// Enable the offloads in `caps` that the controller supports. Returns
    /// the offloads now enabled.
    pub fn set_offloads(&self, caps: OffloadCaps) -> OffloadCaps {
        let enabled = match self.negotiated() {
            Some(n) => caps.intersect(&n.offloads()),
            None => caps,
        };
        *lock(&self.shared.offloads) = enabled;
        if let Some(dc) = self.data() {
            dc.set_offloads(enabled);
        }
        enabled
    }

    /// Fetch fresh controller counters, bounded by the configured timeout.
    pub async fn query_statistics(&self) -> Result<ViportStatistics> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Statistics(tx))
            .map_err(|_| VnicError::NotConnected)?;
        match tokio::time::timeout(self.stats_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VnicError::NotConnected),
            Err(_) => Err(VnicError::Timeout {
                command: Command::ReportStatistics,
                retries: 0,
            }),
        }
    }

    pub fn data_statistics(&self) -> Option<DataStatistics> {
        self.data().map(|dc| dc.stats())
    }

    /// Ask the controller to reset this viport; it then tears down cleanly.
    pub fn reset(&self) {
        self.shared.work.request(WorkItem::Reset);
        self.wake();
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    /// Shut down and wait for the drain task to finish.
    pub async fn close(&self) {
        self.shutdown();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Viport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Viport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viport")
            .field("path_id", &self.params.path_id)
            .field("kind", &self.params.kind)
            .field("generation", &self.params.generation)
            .field("state", &self.state())
            .finish()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn notified_opt(wake: Option<&Notify>) {
    match wake {
        Some(n) => n.notified().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: Option<&mut Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn periodic(period: Duration) -> Interval {
    let mut i = tokio::time::interval_at(Instant::now() + period, period);
    i.set_missed_tick_behavior(MissedTickBehavior::Delay);
    i
}

struct Runner {
    config: Arc<VnicConfig>,
    transport: Arc<dyn Transport>,
    params: ViportParams,
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<Event>,
    notices: mpsc::UnboundedSender<ViportNotice>,
    state_tx: watch::Sender<ViportState>,
    machine: Machine,
    control: ControlChannel,
    control_qp: Option<Arc<dyn QueuePair>>,
    next_control_wr: AtomicU64,
    data: Option<Arc<DataChannel>>,
    data_wake: Option<Arc<Notify>>,
    addresses: Option<AddressTable>,
    pools: Option<(PoolParams, PoolParams)>,
    remote_table: Option<RemoteAddr>,
    remote_link_up: bool,
    applied_link: Option<ConfigLink>,
    stats_waiters: Vec<oneshot::Sender<Result<ViportStatistics>>>,
    stats_timeout: Duration,
    error: Option<String>,
}

impl Runner {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut heartbeat = periodic(self.config.viport.heartbeat_interval);
        let mut stats = self.config.viport.stats_interval.map(periodic);
        if let Err(e) = self.apply(Input::Start) {
            self.fail(e);
        }

        while !self.machine.state().is_terminal() {
            let control_deadline = self.control.deadline();
            let kick_deadline = self.data.as_ref().and_then(|dc| dc.kick_deadline());
            let wake = self.data_wake.clone();
            let running = self.machine.state().is_running();

            let result = tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.on_event(ev),
                    None => self.apply(Input::Shutdown),
                },
                _ = sleep_until_opt(control_deadline) => self.poll_control(),
                _ = sleep_until_opt(kick_deadline) => self.on_kick_timer(),
                _ = notified_opt(wake.as_deref()) => self.on_data_wake(),
                _ = heartbeat.tick(), if running => {
                    self.shared.work.request(WorkItem::Heartbeat);
                    Ok(())
                }
                _ = tick_opt(stats.as_mut()), if running => {
                    self.shared.work.request(WorkItem::Statistics);
                    Ok(())
                }
            };
            if let Err(e) = result.and_then(|()| self.drain_work()) {
                self.fail(e);
            }
        }
        tracing::debug!(viport = self.params.path_id, state = %self.machine.state(), "viport task exiting");
    }

    fn notify(&self, status: ViportStatus) {
        // owner gone means it is shutting down
        let _ = self.notices.send(ViportNotice {
            kind: self.params.kind,
            generation: self.params.generation,
            status,
        });
    }

    fn fail(&mut self, err: VnicError) {
        if self.machine.state().is_terminal() {
            return;
        }
        tracing::error!(
            viport = self.params.path_id,
            netpath = %self.params.kind,
            state = %self.machine.state(),
            class = ?err.class(),
            error = %err,
            "viport failed"
        );
        self.error = Some(err.to_string());
        let _ = self.apply(Input::Failure);
    }

    fn apply(&mut self, input: Input) -> Result<()> {
        let before = self.machine.state();
        let (next, effects) = self.machine.step(input);
        self.machine = next;
        if next.state() != before {
            tracing::debug!(
                viport = self.params.path_id,
                from = %before,
                to = %next.state(),
                "viport state"
            );
            self.state_tx.send_replace(next.state());
        }
        for effect in effects {
            self.execute(effect)?;
        }
        Ok(())
    }

    fn execute(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::ConnectControl => self.connect_control(),
            Effect::SendRequest(cmd) => self.send_request(cmd),
            Effect::ConnectData => self.connect_data(),
            Effect::StartDataPath => self.start_data_path(),
            Effect::AnnounceUp => {
                let link = self.link_indication();
                tracing::info!(
                    viport = self.params.path_id,
                    netpath = %self.params.kind,
                    mac = %link.mac,
                    mtu = link.mtu,
                    "viport connected"
                );
                self.notify(ViportStatus::Connected(link));
                Ok(())
            }
            Effect::Defer(cmd) => {
                if let Some(item) = WorkItem::from_command(cmd) {
                    self.shared.work.request(item);
                }
                Ok(())
            }
            Effect::TearDown(reason) => {
                self.tear_down(reason);
                Ok(())
            }
        }
    }

    fn connection_request(&self, service: ServiceId) -> ConnectRequest {
        let private = ConnectionData {
            path_id: self.params.path_id,
            instance: self.params.instance,
            path_num: self.params.kind.path_num(),
            node_name: self.config.viport.node_name.clone(),
            features: SUPPORTED_FEATURES,
        };
        ConnectRequest {
            source_gid: self.params.path.source_gid,
            dest_gid: self.params.path.dest_gid,
            service,
            private_data: private.encode(),
        }
    }

    fn connect_control(&mut self) -> Result<()> {
        let request = self.connection_request(ServiceId::control(self.params.instance));
        let sink = EventSink::channel(self.events_tx.clone(), Event::Control);
        let qp = self.transport.connect(request, sink)?;
        for wr_id in 0..self.config.control.recv_buffers as u64 {
            qp.post_recv(wr_id, MAX_CONTROL_PACKET)?;
        }
        tracing::debug!(
            viport = self.params.path_id,
            dest = %self.params.path.dest_gid,
            qp = qp.qp_num(),
            "connecting control channel"
        );
        self.control_qp = Some(qp);
        Ok(())
    }

    fn connect_data(&mut self) -> Result<()> {
        let (host, ioc) = self.pools.ok_or_else(|| VnicError::ProtocolMismatch {
            command: Command::ConfigDataPath,
            reason: "data connect before pools were negotiated".into(),
        })?;
        let request = self.connection_request(ServiceId::data(self.params.instance));
        let sink = EventSink::channel(self.events_tx.clone(), Event::Data);
        let qp = self.transport.connect(request, sink)?;
        let dc = DataChannel::new(self.transport.as_ref(), qp, host, ioc, &self.config.data)?;
        dc.set_offloads(*lock(&self.shared.offloads));
        self.data_wake = Some(dc.wake());
        self.data = Some(Arc::new(dc));
        Ok(())
    }

    fn start_data_path(&mut self) -> Result<()> {
        let dc = self.data.clone().ok_or(VnicError::NotConnected)?;
        let remote = self.remote_table.ok_or_else(|| VnicError::ProtocolMismatch {
            command: Command::ExchangePools,
            reason: "no controller pool table".into(),
        })?;
        dc.start(remote)?;
        dc.set_accepting(self.shared.accepting.load(Ordering::Acquire));
        *lock(&self.shared.data) = Some(dc);
        self.shared.work.request(WorkItem::ConfigLink);
        self.shared.work.request(WorkItem::ConfigAddresses);
        tracing::info!(viport = self.params.path_id, "viport data path running");
        Ok(())
    }

    fn tear_down(&mut self, reason: TeardownReason) {
        let dc = lock(&self.shared.data).take().or_else(|| self.data.take());
        self.data = None;
        self.data_wake = None;
        if let Some(dc) = dc {
            dc.disconnect();
            for id in dc.abort_in_flight() {
                self.notify(ViportStatus::SendComplete(id, SendStatus::Aborted));
            }
        }
        if let Some(qp) = self.control_qp.take() {
            qp.disconnect();
        }
        self.shared.work.clear();
        for waiter in self.stats_waiters.drain(..) {
            let _ = waiter.send(Err(VnicError::NotConnected));
        }
        match reason {
            TeardownReason::Failed => {}
            TeardownReason::Shutdown => {
                tracing::info!(viport = self.params.path_id, "viport shut down")
            }
            TeardownReason::Reset => {
                tracing::info!(viport = self.params.path_id, "viport reset by request")
            }
        }
        self.notify(ViportStatus::Down {
            reason,
            error: self.error.clone(),
        });
    }

    fn link_indication(&self) -> LinkIndication {
        let mtu = match &self.applied_link {
            Some(l) => l.mtu,
            None => lock(&self.shared.link).mtu,
        };
        LinkIndication {
            up: self.remote_link_up,
            mtu,
            mac: lock(&self.shared.negotiated)
                .map(|n| n.mac)
                .unwrap_or(MacAddress::ZERO),
        }
    }

    fn negotiated(&self, command: Command) -> Result<Negotiated> {
        lock(&self.shared.negotiated).ok_or_else(|| VnicError::ProtocolMismatch {
            command,
            reason: "capabilities not negotiated".into(),
        })
    }

    fn build_request(&mut self, cmd: Command) -> Result<ControlRequest> {
        let req = match cmd {
            Command::InitVnic => ControlRequest::InitVnic(InitVnicRequest {
                major: PROTOCOL_MAJOR,
                minor: PROTOCOL_MINOR,
                instance: self.params.instance,
                num_data_paths: 1,
                num_address_entries: self.config.control.max_address_entries,
            }),
            Command::ConfigDataPath => {
                let data = &self.config.data;
                ControlRequest::ConfigDataPath(ConfigDataPath {
                    path_id: self.params.path_id,
                    data_path: 0,
                    host: data.host_bounds.normalize(data.host_pool)?,
                    ioc: data.ioc_bounds.normalize(data.ioc_pool)?,
                })
            }
            Command::ExchangePools => {
                let dc = self.data.as_ref().ok_or(VnicError::NotConnected)?;
                let table = dc.xmit_table();
                ControlRequest::ExchangePools(ExchangePools {
                    data_path: 0,
                    rkey: table.rkey,
                    addr: table.addr,
                })
            }
            Command::ConfigAddresses => {
                let batch = self.addresses.as_mut().and_then(AddressTable::next_batch);
                ControlRequest::ConfigAddresses(batch.ok_or_else(|| {
                    VnicError::ProtocolMismatch {
                        command: cmd,
                        reason: "no address updates pending".into(),
                    }
                })?)
            }
            Command::ConfigLink => ControlRequest::ConfigLink(self.link_request()?),
            Command::ReportStatistics => ControlRequest::ReportStatistics {
                lan_switch: self.negotiated(cmd)?.lan_switch,
            },
            Command::Reset => ControlRequest::Reset,
            Command::Heartbeat => {
                let us = self.config.viport.heartbeat_timeout.as_micros();
                ControlRequest::Heartbeat(Heartbeat {
                    timeout_us: u32::try_from(us).unwrap_or(u32::MAX),
                })
            }
            Command::ClearStatistics | Command::ReportStatus => {
                return Err(VnicError::ProtocolMismatch {
                    command: cmd,
                    reason: "not issued by the host".into(),
                });
            }
        };
        Ok(req)
    }

    fn link_request(&self) -> Result<ConfigLink> {
        let n = self.negotiated(Command::ConfigLink)?;
        let link = lock(&self.shared.link).clone();
        let overflow = self
            .addresses
            .as_ref()
            .is_some_and(|t| t.multicast_mode() == MulticastMode::Overflow);
        let f = link.filter;
        let pick = |on: bool, enable: u8, disable: u8| if on { enable } else { disable };
        let flags = pick(f.is_enabled(), LinkFlags::ENABLE_NIC, LinkFlags::DISABLE_NIC)
            | pick(
                f.all_multicast || overflow,
                LinkFlags::ENABLE_MCAST_ALL,
                LinkFlags::DISABLE_MCAST_ALL,
            )
            | pick(f.promiscuous, LinkFlags::ENABLE_PROMISC, LinkFlags::DISABLE_PROMISC)
            | LinkFlags::SET_MTU;
        Ok(ConfigLink {
            flags: LinkFlags(flags),
            lan_switch: n.lan_switch,
            mtu: link.mtu,
            default_vlan: n.default_vlan,
            mac: n.mac,
        })
    }

    fn send_request(&mut self, cmd: Command) -> Result<()> {
        let req = self.build_request(cmd)?;
        let packet = self.control.send_request(req, Instant::now())?;
        self.post_control(&packet)
    }

    fn post_control(&self, packet: &[u8]) -> Result<()> {
        let qp = self.control_qp.as_ref().ok_or(VnicError::NotConnected)?;
        let wr_id = self.next_control_wr.fetch_add(1, Ordering::Relaxed);
        qp.post_send(wr_id, packet)
    }

    fn on_event(&mut self, ev: Event) -> Result<()> {
        match ev {
            Event::Control(ev) => self.on_control_event(ev),
            Event::Data(ev) => self.on_data_event(ev),
            Event::Wake => Ok(()),
            Event::Statistics(tx) => {
                self.stats_waiters.push(tx);
                self.shared.work.request(WorkItem::Statistics);
                Ok(())
            }
            Event::Shutdown => self.apply(Input::Shutdown),
        }
    }

    fn on_control_event(&mut self, ev: TransportEvent) -> Result<()> {
        match ev {
            TransportEvent::Connected => {
                tracing::debug!(viport = self.params.path_id, "control channel connected");
                self.apply(Input::ControlConnected)
            }
            TransportEvent::Rejected { reason } => {
                tracing::warn!(viport = self.params.path_id, %reason, "control connection rejected");
                Err(VnicError::ConnectionRejected { reason })
            }
            TransportEvent::Disconnected => Err(VnicError::transport("control connection lost")),
            TransportEvent::SendComplete { status, .. } => match status {
                CompletionStatus::Success => Ok(()),
                other => Err(VnicError::transport(format!("control send failed: {other:?}"))),
            },
            TransportEvent::RecvComplete { wr_id, data } => {
                self.control.handle_receive(&data)?;
                if let Some(qp) = &self.control_qp {
                    qp.post_recv(wr_id, MAX_CONTROL_PACKET)?;
                }
                self.process_notifications();
                self.poll_control()
            }
            TransportEvent::WriteComplete { .. } => Ok(()),
        }
    }

    fn poll_control(&mut self) -> Result<()> {
        match self.control.poll_response(Instant::now())? {
            ResponsePoll::Ready(rsp) => self.on_response(rsp),
            ResponsePoll::Retransmit(packet) => self.post_control(&packet),
            ResponsePoll::Pending | ResponsePoll::Idle => Ok(()),
        }
    }

    fn process_notifications(&mut self) {
        while let Some(report) = self.control.take_notification() {
            match report.status {
                status::LINK_UP | status::LINK_DOWN => {
                    let up = report.status == status::LINK_UP;
                    if up == self.remote_link_up {
                        continue;
                    }
                    self.remote_link_up = up;
                    tracing::info!(viport = self.params.path_id, up, "controller link state changed");
                    if self.machine.state() == ViportState::Connected {
                        self.notify(ViportStatus::LinkChanged(self.link_indication()));
                    }
                }
                status::AGGREGATION_CHANGE => {
                    tracing::info!(viport = self.params.path_id, info = report.info, "aggregation changed");
                }
                other => {
                    tracing::debug!(viport = self.params.path_id, status = other, "status report");
                }
            }
        }
    }

    fn on_response(&mut self, rsp: ControlResponse) -> Result<()> {
        let cmd = rsp.command();
        tracing::debug!(viport = self.params.path_id, command = ?cmd, "control response");
        match rsp {
            ControlResponse::InitVnic(r) => self.on_init(r)?,
            ControlResponse::ConfigDataPath(r) => self.on_config_data_path(r)?,
            ControlResponse::ExchangePools(r) => {
                if r.data_path != 0 {
                    return Err(VnicError::InvalidResponse {
                        command: cmd,
                        reason: format!("data path {} not requested", r.data_path),
                    });
                }
                self.remote_table = Some(RemoteAddr {
                    addr: r.addr,
                    rkey: r.rkey,
                });
            }
            ControlResponse::ConfigAddresses(r) => self.on_config_addresses(r)?,
            ControlResponse::ConfigLink(r) => self.on_config_link(r)?,
            ControlResponse::ReportStatistics { lan_switch, stats } => {
                let expected = self.negotiated(cmd)?.lan_switch;
                if lan_switch != expected {
                    return Err(VnicError::InvalidResponse {
                        command: cmd,
                        reason: format!("lan switch {lan_switch} does not match {expected}"),
                    });
                }
                let snapshot = ViportStatistics {
                    ioc: stats,
                    data: self.data.as_ref().map(|dc| dc.stats()).unwrap_or_default(),
                };
                for waiter in self.stats_waiters.drain(..) {
                    let _ = waiter.send(Ok(snapshot));
                }
            }
            ControlResponse::ClearStatistics | ControlResponse::Reset | ControlResponse::Heartbeat => {}
        }
        self.apply(Input::Response(cmd))
    }

    fn on_init(&mut self, r: InitVnicResponse) -> Result<()> {
        if r.major != PROTOCOL_MAJOR || r.minor < PROTOCOL_MINOR {
            return Err(VnicError::VersionMismatch {
                local_major: PROTOCOL_MAJOR,
                local_minor: PROTOCOL_MINOR,
                remote_major: r.major,
                remote_minor: r.minor,
            });
        }
        let invalid = |reason: String| VnicError::InvalidResponse {
            command: Command::InitVnic,
            reason,
        };
        if r.instance != self.params.instance {
            return Err(invalid(format!(
                "answered for instance {}, requested {}",
                r.instance, self.params.instance
            )));
        }
        if r.num_data_paths != 1 {
            return Err(invalid(format!("{} data paths granted, 1 requested", r.num_data_paths)));
        }
        if r.num_lan_switches != 1 {
            return Err(invalid(format!("{} lan switches reported", r.num_lan_switches)));
        }
        let min = self.config.control.min_address_entries;
        let max = self.config.control.max_address_entries;
        if !(min..=max).contains(&r.num_address_entries) {
            return Err(VnicError::ParameterOutOfRange {
                name: "num_address_entries",
                value: r.num_address_entries as u64,
                min: min as u64,
                max: max as u64,
            });
        }
        let lan = r.lan_switch;
        let negotiated = Negotiated {
            mac: lan.mac,
            default_vlan: lan.default_vlan,
            lan_switch: lan.number,
            address_entries: r.num_address_entries,
            features: r.features,
        };
        let mut table = AddressTable::new(r.num_address_entries, lan.number, lan.mac, lan.default_vlan);
        self.shared.link_dirty.store(false, Ordering::Release);
        table.set_multicast(&lock(&self.shared.link).multicast);
        self.addresses = Some(table);
        {
            let mut offloads = lock(&self.shared.offloads);
            *offloads = offloads.intersect(&negotiated.offloads());
        }
        *lock(&self.shared.negotiated) = Some(negotiated);
        tracing::info!(
            viport = self.params.path_id,
            version = %format!("{}.{}", r.major, r.minor),
            mac = %lan.mac,
            address_entries = r.num_address_entries,
            features = r.features.0,
            "capabilities negotiated"
        );
        Ok(())
    }

    fn on_config_data_path(&mut self, r: ConfigDataPath) -> Result<()> {
        let cmd = Command::ConfigDataPath;
        if r.path_id != self.params.path_id {
            return Err(VnicError::InvalidResponse {
                command: cmd,
                reason: format!("path id {:#x} does not match {:#x}", r.path_id, self.params.path_id),
            });
        }
        if r.data_path != 0 {
            return Err(VnicError::InvalidResponse {
                command: cmd,
                reason: format!("data path {} not requested", r.data_path),
            });
        }
        self.config.data.host_bounds.check(&r.host)?;
        self.config.data.ioc_bounds.check(&r.ioc)?;
        let needed = buffer_size(lock(&self.shared.link).mtu);
        for (pool, p) in [("host", &r.host), ("ioc", &r.ioc)] {
            if p.entry_size < needed {
                return Err(VnicError::InvalidResponse {
                    command: cmd,
                    reason: format!("{pool} entry size {} below {needed}", p.entry_size),
                });
            }
        }
        tracing::debug!(
            viport = self.params.path_id,
            host_count = r.host.entry_count,
            ioc_count = r.ioc.entry_count,
            entry_size = r.host.entry_size,
            "data path configured"
        );
        self.pools = Some((r.host, r.ioc));
        Ok(())
    }

    fn on_config_addresses(&mut self, r: ConfigAddresses) -> Result<()> {
        let table = self.addresses.as_mut().ok_or_else(|| VnicError::ProtocolMismatch {
            command: Command::ConfigAddresses,
            reason: "no address table".into(),
        })?;
        table.complete_batch(&r)?;
        if table.has_pending() {
            self.shared.work.request(WorkItem::ConfigAddresses);
        }
        Ok(())
    }

    fn on_config_link(&mut self, r: ConfigLink) -> Result<()> {
        let n = self.negotiated(Command::ConfigLink)?;
        if r.lan_switch != n.lan_switch {
            return Err(VnicError::InvalidResponse {
                command: Command::ConfigLink,
                reason: format!("lan switch {} does not match {}", r.lan_switch, n.lan_switch),
            });
        }
        let previous = self.applied_link.replace(r);
        let mtu_changed = previous.is_some_and(|p| p.mtu != r.mtu);
        if mtu_changed && self.machine.state() == ViportState::Connected {
            self.notify(ViportStatus::LinkChanged(self.link_indication()));
        }
        Ok(())
    }

    fn on_data_event(&mut self, ev: TransportEvent) -> Result<()> {
        let Some(dc) = self.data.clone() else {
            return Ok(());
        };
        match ev {
            TransportEvent::Connected => {
                tracing::debug!(viport = self.params.path_id, "data channel connected");
                self.apply(Input::DataConnected)
            }
            TransportEvent::Rejected { reason } => {
                tracing::warn!(viport = self.params.path_id, %reason, "data connection rejected");
                Err(VnicError::ConnectionRejected { reason })
            }
            TransportEvent::Disconnected => Err(VnicError::transport("data connection lost")),
            TransportEvent::WriteComplete { wr_id, status } => {
                if let WriteCompletion::Frame(id, st) = dc.on_write_complete(wr_id, status) {
                    self.notify(ViportStatus::SendComplete(id, st));
                }
                match status {
                    CompletionStatus::Success => Ok(()),
                    other => Err(VnicError::transport(format!("rdma write failed: {other:?}"))),
                }
            }
            TransportEvent::RecvComplete { wr_id, .. } => {
                if dc.on_recv_complete(wr_id)? {
                    self.service_data(&dc)?;
                }
                Ok(())
            }
            TransportEvent::SendComplete { status, .. } => match status {
                CompletionStatus::Success => Ok(()),
                other => Err(VnicError::transport(format!("kick send failed: {other:?}"))),
            },
        }
    }

    fn service_data(&self, dc: &DataChannel) -> Result<()> {
        let frames = dc.poll_receive()?;
        if !frames.is_empty() {
            self.notify(ViportStatus::Received(frames));
        }
        if dc.take_buffers_available()? {
            self.notify(ViportStatus::BuffersAvailable);
        }
        Ok(())
    }

    fn on_data_wake(&mut self) -> Result<()> {
        let Some(dc) = self.data.clone() else {
            return Ok(());
        };
        if dc.is_faulted() {
            return Err(VnicError::transport("data channel fault"));
        }
        if !self.machine.state().is_running() {
            return Ok(());
        }
        dc.replenish()?;
        if dc.take_buffers_available()? {
            self.notify(ViportStatus::BuffersAvailable);
        }
        Ok(())
    }

    fn on_kick_timer(&mut self) -> Result<()> {
        if let Some(dc) = &self.data {
            dc.on_kick_timer(Instant::now())?;
        }
        Ok(())
    }

    fn sync_multicast(&mut self) {
        let Some(table) = self.addresses.as_mut() else {
            return;
        };
        if !self.shared.link_dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let list = lock(&self.shared.link).multicast.clone();
        let before = table.multicast_mode();
        let mode = table.set_multicast(&list);
        if mode != before {
            tracing::info!(
                viport = self.params.path_id,
                entries = list.len(),
                overflow = mode == MulticastMode::Overflow,
                "multicast filtering mode changed"
            );
            self.shared.work.request(WorkItem::ConfigLink);
        }
        if table.has_pending() {
            self.shared.work.request(WorkItem::ConfigAddresses);
        }
    }

    /// Issue pending work one request at a time.
    fn drain_work(&mut self) -> Result<()> {
        if self.machine.state().is_terminal() {
            return Ok(());
        }
        self.sync_multicast();
        while self.machine.can_issue() {
            let Some(item) = self.shared.work.take_next() else {
                break;
            };
            if item == WorkItem::ConfigAddresses
                && !self.addresses.as_ref().is_some_and(AddressTable::has_pending)
            {
                continue;
            }
            self.apply(Input::Issue(item.command()))?;
        }
        if self.machine.can_issue() && self.shared.work.is_empty() {
            self.apply(Input::Idle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated_ioc::{EmulatedIoc, IocBehavior};
    use crate::transport::loopback::LoopbackFabric;
    use crate::types::{Gid, IocGuid, PacketFilter};

    fn port() -> Gid {
        Gid::new(0xfe80 << 48, 0x100)
    }

    fn config() -> VnicConfig {
        let mut c = VnicConfig::default();
        c.control.response_timeout = Duration::from_millis(100);
        c.control.max_retries = 2;
        c.data.host_pool.entry_count = 64;
        c.data.ioc_pool.entry_count = 16;
        c.data.xmit_buffers = 16;
        c.data.kick_recvs = 4;
        c
    }

    fn spawn(fabric: &LoopbackFabric, cfg: VnicConfig) -> (Viport, mpsc::UnboundedReceiver<ViportNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = PathRecord {
            ioc_guid: IocGuid(1),
            source_gid: Gid::new(0xfe80 << 48, 1),
            dest_gid: port(),
            source_lid: 1,
            dest_lid: 0x100,
            pkey: 0xffff,
            service_level: 0,
            rate: 3,
            mtu: 4,
            packet_lifetime: 18,
        };
        let v = Viport::spawn(
            Arc::new(fabric.clone()),
            Arc::new(cfg),
            ViportParams {
                path_id: 7,
                instance: 0,
                kind: NetpathKind::Primary,
                path,
                generation: 1,
                link: LinkSettings {
                    mtu: 1500,
                    filter: PacketFilter::standard(),
                    multicast: Vec::new(),
                },
                accepting: true,
                offloads: OffloadCaps::default(),
            },
            tx,
        );
        (v, rx)
    }

    async fn until_connected(v: &Viport) {
        let mut rx = v.subscribe();
        rx.wait_for(|s| *s == ViportState::Connected).await.unwrap();
    }

    async fn until_down(rx: &mut mpsc::UnboundedReceiver<ViportNotice>) -> (TeardownReason, Option<String>) {
        loop {
            let n = rx.recv().await.unwrap();
            if let ViportStatus::Down { reason, error } = n.status {
                return (reason, error);
            }
        }
    }

    fn heartbeats(ioc: &EmulatedIoc) -> Vec<u32> {
        ioc.requests()
            .into_iter()
            .filter_map(|r| match r {
                ControlRequest::Heartbeat(h) => Some(h.timeout_us),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_each_interval() {
        let fabric = LoopbackFabric::new();
        let ioc = EmulatedIoc::start(&fabric, &[port()], 0, IocBehavior::default()).unwrap();
        let (v, _rx) = spawn(&fabric, config());
        until_connected(&v).await;
        ioc.clear_requests();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let hb = heartbeats(&ioc);
        assert_eq!(hb.len(), 3);
        // requested peer timeout is the configured 20 s in microseconds
        assert!(hb.iter().all(|t| *t == 20_000_000));
        v.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_heartbeat_fails_viport() {
        let fabric = LoopbackFabric::new();
        let ioc = EmulatedIoc::start(&fabric, &[port()], 0, IocBehavior::default()).unwrap();
        let (v, mut rx) = spawn(&fabric, config());
        until_connected(&v).await;
        ioc.set_behavior(|b| {
            b.silent.insert(Command::Heartbeat);
        });

        let (reason, error) = until_down(&mut rx).await;
        assert_eq!(reason, TeardownReason::Failed);
        assert_eq!(error.as_deref(), Some("Heartbeat timed out after 2 retries"));
        assert_eq!(v.state(), ViportState::Failed);
        assert!(matches!(
            v.transmit(TxFrame::new(1, vec![0; 64])),
            Err(VnicError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_state_published_through_bring_up() {
        let fabric = LoopbackFabric::new();
        let _ioc = EmulatedIoc::start(&fabric, &[port()], 0, IocBehavior::default()).unwrap();
        let (v, mut rx) = spawn(&fabric, config());
        assert!(!v.is_connected());
        until_connected(&v).await;
        assert!(v.is_connected());

        let n = v.negotiated().unwrap();
        assert_eq!(n.mac, IocBehavior::default().mac);
        assert!(v.data_statistics().is_some());

        v.close().await;
        assert_eq!(v.state(), ViportState::Disconnected);
        let (reason, error) = until_down(&mut rx).await;
        assert_eq!(reason, TeardownReason::Shutdown);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_init_for_other_instance_fails_viport() {
        let fabric = LoopbackFabric::new();
        let behavior = IocBehavior {
            instance: Some(4),
            ..Default::default()
        };
        let ioc = EmulatedIoc::start(&fabric, &[port()], 0, behavior).unwrap();
        let (v, mut rx) = spawn(&fabric, config());
        let (reason, error) = until_down(&mut rx).await;
        assert_eq!(reason, TeardownReason::Failed);
        assert_eq!(
            error.as_deref(),
            Some("invalid response to InitVnic: answered for instance 4, requested 0")
        );
        assert_eq!(v.state(), ViportState::Failed);
        assert!(
            !ioc.requests()
                .iter()
                .any(|r| matches!(r, ControlRequest::ConfigDataPath(_)))
        );
    }

    #[tokio::test]
    async fn test_statistics_query_times_out_on_silent_controller() {
        let fabric = LoopbackFabric::new();
        let mut behavior = IocBehavior::default();
        behavior.silent.insert(Command::ReportStatistics);
        let _ioc = EmulatedIoc::start(&fabric, &[port()], 0, behavior).unwrap();
        let mut cfg = config();
        cfg.viport.stats_query_timeout = Duration::from_millis(50);
        let (v, _rx) = spawn(&fabric, cfg);
        until_connected(&v).await;
        assert!(v.query_statistics().await.is_err());
        v.close().await;
    }
}
