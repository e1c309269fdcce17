use std::fmt;

/// 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// 128-bit InfiniBand global identifier of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// Build a link-local style GID from a subnet prefix and interface id.
    pub fn new(prefix: u64, interface_id: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&prefix.to_be_bytes());
        raw[8..].copy_from_slice(&interface_id.to_be_bytes());
        Gid(raw)
    }

    pub fn interface_id(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(b)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// GUID of a remote I/O controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IocGuid(pub u64);

impl fmt::Display for IocGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Connection-manager service identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u64);

const CONTROL_SERVICE_BASE: u64 = 0x1000_0066_a000_0100;

impl ServiceId {
    /// Service the controller listens on for the control channel of `instance`.
    pub const fn control(instance: u8) -> Self {
        ServiceId(CONTROL_SERVICE_BASE + (instance as u64) * 2)
    }

    /// Service the controller listens on for the data channel of `instance`.
    pub const fn data(instance: u8) -> Self {
        ServiceId(CONTROL_SERVICE_BASE + (instance as u64) * 2 + 1)
    }

    pub const fn is_control(&self) -> bool {
        self.0 >= CONTROL_SERVICE_BASE && (self.0 - CONTROL_SERVICE_BASE) % 2 == 0
    }
}

/// Identity of a path record: two records with the same key describe the
/// same route and the newer one supersedes the older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    pub source_gid: Gid,
    pub dest_gid: Gid,
    pub pkey: u16,
}

/// Immutable snapshot of a routable RDMA path to a remote controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub ioc_guid: IocGuid,
    pub source_gid: Gid,
    pub dest_gid: Gid,
    pub source_lid: u16,
    pub dest_lid: u16,
    pub pkey: u16,
    pub service_level: u8,
    /// Encoded IB link rate.
    pub rate: u8,
    /// Encoded path MTU.
    pub mtu: u8,
    pub packet_lifetime: u8,
}

impl PathRecord {
    pub fn key(&self) -> PathKey {
        PathKey {
            source_gid: self.source_gid,
            dest_gid: self.dest_gid,
            pkey: self.pkey,
        }
    }
}

/// One of the two failover slots of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetpathKind {
    Primary,
    Secondary,
}

impl NetpathKind {
    pub const fn other(self) -> Self {
        match self {
            NetpathKind::Primary => NetpathKind::Secondary,
            NetpathKind::Secondary => NetpathKind::Primary,
        }
    }

    /// Path number carried in connection private data.
    pub const fn path_num(self) -> u8 {
        match self {
            NetpathKind::Primary => 0,
            NetpathKind::Secondary => 1,
        }
    }
}

impl fmt::Display for NetpathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetpathKind::Primary => f.write_str("primary"),
            NetpathKind::Secondary => f.write_str("secondary"),
        }
    }
}

/// Identifier of a virtual interface (adapter) within a driver.
pub type AdapterId = u64;

/// Caller-chosen identifier of a transmitted frame, used for completion and
/// cancellation.
pub type FrameId = u64;

/// Upstream packet filter bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFilter {
    pub directed: bool,
    pub broadcast: bool,
    pub multicast: bool,
    pub all_multicast: bool,
    pub promiscuous: bool,
}

impl PacketFilter {
    pub const fn is_enabled(&self) -> bool {
        self.directed || self.broadcast || self.multicast || self.all_multicast || self.promiscuous
    }

    pub const fn standard() -> Self {
        PacketFilter {
            directed: true,
            broadcast: true,
            multicast: true,
            all_multicast: false,
            promiscuous: false,
        }
    }
}

/// Checksum offloads the controller can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffloadCaps {
    pub ipv4_rx: bool,
    pub tcp_rx: bool,
    pub udp_rx: bool,
    pub ipv4_tx: bool,
    pub tcp_tx: bool,
    pub udp_tx: bool,
}

impl OffloadCaps {
    /// Offloads present in both `self` and `other`.
    pub fn intersect(&self, other: &OffloadCaps) -> OffloadCaps {
        OffloadCaps {
            ipv4_rx: self.ipv4_rx && other.ipv4_rx,
            tcp_rx: self.tcp_rx && other.tcp_rx,
            udp_rx: self.udp_rx && other.udp_rx,
            ipv4_tx: self.ipv4_tx && other.ipv4_tx,
            tcp_tx: self.tcp_tx && other.tcp_tx,
            udp_tx: self.udp_tx && other.udp_tx,
        }
    }
}

/// Per-frame transmit checksum requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxChecksum {
    pub ipv4: bool,
    pub tcp: bool,
    pub udp: bool,
}

/// A frame handed down by the network stack for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub id: FrameId,
    /// Full Ethernet frame starting at the destination MAC.
    pub data: Vec<u8>,
    pub vlan: Option<u16>,
    pub checksum: TxChecksum,
}

impl TxFrame {
    pub fn new(id: FrameId, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            vlan: None,
            checksum: TxChecksum::default(),
        }
    }

    /// Destination MAC taken from the Ethernet header.
    pub fn dest_mac(&self) -> MacAddress {
        let mut mac = [0u8; 6];
        let n = self.data.len().min(6);
        mac[..n].copy_from_slice(&self.data[..n]);
        MacAddress(mac)
    }
}

/// Result of a transmit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// The frame was written to the peer, or queued behind earlier frames.
    Queued,
    /// No peer slot or staging buffer is available; the frame is returned and
    /// the caller must wait for the buffers-available notification.
    BufferExhausted(TxFrame),
}

/// Final status reported for a transmitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Aborted,
    Failed,
}

/// Result of receive checksum validation reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxChecksum {
    pub ip_ok: bool,
    pub tcp_ok: bool,
    pub udp_ok: bool,
    pub failed: bool,
}

/// Link state announced to the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkIndication {
    pub up: bool,
    pub mtu: u16,
    pub mac: MacAddress,
}
