use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use vnic::viport::{LinkSettings, ViportNotice, ViportParams, ViportStatus, TeardownReason};
use vnic::{
    Adapter, ChannelSink, EmulatedIoc, Gid, InterfaceSpec, IocBehavior, IocGuid, LoopbackFabric,
    NetpathKind, OffloadCaps, PacketFilter, PathRecord, UpstreamEvent, Viport, VnicConfig,
    VnicDriver,
};

pub const IOC: IocGuid = IocGuid(0x0002_c903_0000_1000);
const PREFIX: u64 = 0xfe80 << 48;

pub fn host_gid() -> Gid {
    Gid::new(PREFIX, 1)
}

pub fn ioc_port(n: u64) -> Gid {
    Gid::new(PREFIX, 0x100 + n)
}

pub fn path_to(port: Gid) -> PathRecord {
    PathRecord {
        ioc_guid: IOC,
        source_gid: host_gid(),
        dest_gid: port,
        source_lid: 1,
        dest_lid: port.interface_id() as u16,
        pkey: 0xffff,
        service_level: 0,
        rate: 3,
        mtu: 4,
        packet_lifetime: 18,
    }
}

/// Small pools, fast retries, no background heartbeats.
pub fn test_config(secondary: bool) -> VnicConfig {
    let mut c = VnicConfig::default();
    c.control.response_timeout = Duration::from_millis(100);
    c.control.max_retries = 2;
    c.viport.heartbeat_interval = Duration::from_secs(3600);
    c.adapter.secondary_path = secondary;
    c.adapter.reconnect_delay = Duration::from_millis(20);
    c.data.host_pool.entry_count = 64;
    c.data.ioc_pool.entry_count = 16;
    c.data.xmit_buffers = 16;
    c.data.kick_recvs = 4;
    c
}

pub struct Rig {
    pub fabric: LoopbackFabric,
    pub ioc: EmulatedIoc,
    pub driver: VnicDriver,
    pub ports: Vec<Gid>,
}

pub struct Host {
    pub adapter: Arc<Adapter>,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

pub fn rig(ports: u64, behavior: IocBehavior, config: VnicConfig) -> Rig {
    let fabric = LoopbackFabric::new();
    let ports: Vec<Gid> = (0..ports).map(ioc_port).collect();
    let ioc = EmulatedIoc::start(&fabric, &ports, 0, behavior).unwrap();
    let driver = VnicDriver::new(Arc::new(fabric.clone()), config).unwrap();
    Rig {
        fabric,
        ioc,
        driver,
        ports,
    }
}

impl Rig {
    pub fn interface(&self, instance: u8, bundle: u32) -> Host {
        let (sink, events) = ChannelSink::new();
        let adapter = self
            .driver
            .create_interface(
                InterfaceSpec {
                    ioc: IOC,
                    instance,
                    bundle,
                },
                Arc::new(sink),
            )
            .unwrap();
        Host { adapter, events }
    }

    pub fn add_paths(&self) {
        for port in &self.ports {
            self.driver.path_added(path_to(*port));
        }
    }
}

impl Host {
    /// Drain upstream events queued so far.
    pub fn take_events(&mut self) -> Vec<UpstreamEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Wait for the next event matching `pred`, discarding others.
    pub async fn next_event(&mut self, mut pred: impl FnMut(&UpstreamEvent) -> bool) -> UpstreamEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = self.events.recv().await.expect("upstream sink closed");
                if pred(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for upstream event")
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub async fn carrier(adapter: &Adapter, up: bool) {
    let mut rx = adapter.subscribe_carrier();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|c| *c == up))
        .await
        .expect("timed out waiting for carrier")
        .expect("adapter dropped");
}

/// A standalone viport on `port`, reporting into the returned channel.
pub fn viport(
    fabric: &LoopbackFabric,
    config: VnicConfig,
    port: Gid,
) -> (Viport, mpsc::UnboundedReceiver<ViportNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let v = Viport::spawn(
        Arc::new(fabric.clone()),
        Arc::new(config),
        ViportParams {
            path_id: 0x42,
            instance: 0,
            kind: NetpathKind::Primary,
            path: path_to(port),
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

/// Wait for the viport to go down; returns the reason and error text.
pub async fn viport_down(
    notices: &mut mpsc::UnboundedReceiver<ViportNotice>,
) -> (TeardownReason, Option<String>) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let n = notices.recv().await.expect("viport notices closed");
            if let ViportStatus::Down { reason, error } = n.status {
                return (reason, error);
            }
        }
    })
    .await
    .expect("timed out waiting for viport teardown")
}

pub fn frame(id: u64, len: usize) -> Vec<u8> {
    let mut data = vec![(id & 0xff) as u8; len];
    data[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x99]);
    data[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    data
}
