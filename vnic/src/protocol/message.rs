//! Control command payloads.
//!
//! Every multi-byte field is big-endian. Payloads follow the 8-byte
//! [`ControlHeader`]; the whole packet never exceeds
//! [`MAX_CONTROL_PACKET`] bytes.

use super::codec::{WireReader, WireWriter};
use super::header::{Command, ControlHeader, MAX_CONTROL_PACKET, PacketType};
use crate::error::{Result, VnicError};
use crate::types::MacAddress;

/// Address operations carried by one configure-addresses packet.
pub const MAX_ADDRESS_OPS_PER_PACKET: usize = 16;

/// Feature bits advertised in the init response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags(pub u32);

impl FeatureFlags {
    pub const IPV4_CSUM_RX: u32 = 0x0001;
    pub const TCP_CSUM_RX: u32 = 0x0002;
    pub const UDP_CSUM_RX: u32 = 0x0004;
    pub const IPV4_CSUM_TX: u32 = 0x0010;
    pub const TCP_CSUM_TX: u32 = 0x0020;
    pub const UDP_CSUM_TX: u32 = 0x0040;
    pub const TSO: u32 = 0x0100;
    pub const IPV4_OPTS: u32 = 0x0200;
    pub const IPV6_OPTS: u32 = 0x0400;
    pub const INBOUND_IB_MC: u32 = 0x0800;
    pub const OUTBOUND_IB_MC: u32 = 0x1000;
    pub const RX_MULTIBUF: u32 = 0x2000;

    pub const fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// `CMD_INIT_VNIC` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitVnicRequest {
    pub major: u16,
    pub minor: u16,
    pub instance: u8,
    pub num_data_paths: u8,
    pub num_address_entries: u16,
}

/// Attributes of the controller-side LAN switch the interface attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LanSwitch {
    pub number: u8,
    pub num_enet_ports: u8,
    pub default_vlan: u16,
    pub mac: MacAddress,
}

/// `CMD_INIT_VNIC` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitVnicResponse {
    pub major: u16,
    pub minor: u16,
    /// Echo of the instance the request was made for.
    pub instance: u8,
    pub num_lan_switches: u8,
    pub num_data_paths: u8,
    pub num_address_entries: u16,
    pub features: FeatureFlags,
    pub lan_switch: LanSwitch,
}

/// The six ring-pool tunables negotiated for one receive pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolParams {
    /// Bytes per buffer, trailer included.
    pub entry_size: u32,
    /// Ring slots; a power of two.
    pub entry_count: u32,
    /// Microseconds the sender may hold un-kicked frames.
    pub kick_timeout_us: u32,
    /// Un-kicked frames that force a kick.
    pub kick_entries: u32,
    /// Un-kicked bytes that force a kick; 0 disables the byte threshold.
    pub kick_bytes: u32,
    /// Free buffers pushed to the peer per RDMA write; a power of two.
    pub free_per_update: u32,
}

impl PoolParams {
    fn encode(&self, w: &mut WireWriter) {
        w.u32(self.entry_size)
            .u32(self.entry_count)
            .u32(self.kick_timeout_us)
            .u32(self.kick_entries)
            .u32(self.kick_bytes)
            .u32(self.free_per_update);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(PoolParams {
            entry_size: r.u32()?,
            entry_count: r.u32()?,
            kick_timeout_us: r.u32()?,
            kick_entries: r.u32()?,
            kick_bytes: r.u32()?,
            free_per_update: r.u32()?,
        })
    }
}

/// `CMD_CONFIG_DATA_PATH` request and response.
///
/// `host` describes the pool the controller writes into (host receive);
/// `ioc` the pool the host writes into (controller receive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDataPath {
    pub path_id: u64,
    pub data_path: u8,
    pub host: PoolParams,
    pub ioc: PoolParams,
}

/// `CMD_EXCHANGE_POOLS` request and response: where the sender's
/// buffer-pool descriptor table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangePools {
    pub data_path: u8,
    pub rkey: u32,
    pub addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressOperation {
    Set = 1,
    Get = 2,
}

/// One address-table update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressOp {
    pub index: u16,
    pub operation: AddressOperation,
    pub valid: bool,
    pub mac: MacAddress,
    pub vlan: u16,
}

/// `CMD_CONFIG_ADDRESSES` request and response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAddresses {
    pub lan_switch: u8,
    pub ops: Vec<AddressOp>,
}

/// Flags of a configure-link request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkFlags(pub u8);

impl LinkFlags {
    pub const ENABLE_NIC: u8 = 0x01;
    pub const DISABLE_NIC: u8 = 0x02;
    pub const ENABLE_MCAST_ALL: u8 = 0x04;
    pub const DISABLE_MCAST_ALL: u8 = 0x08;
    pub const ENABLE_PROMISC: u8 = 0x10;
    pub const DISABLE_PROMISC: u8 = 0x20;
    pub const SET_MTU: u8 = 0x40;

    pub const fn contains(&self, bits: u8) -> bool {
        self.0 & bits == bits
    }
}

/// `CMD_CONFIG_LINK` request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigLink {
    pub flags: LinkFlags,
    pub lan_switch: u8,
    pub mtu: u16,
    pub default_vlan: u16,
    pub mac: MacAddress,
}

/// Counters returned by `CMD_REPORT_STATISTICS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IocStatistics {
    pub in_broadcast_pkts: u64,
    pub in_multicast_pkts: u64,
    pub in_octets: u64,
    pub in_ucast_pkts: u64,
    pub in_nucast_pkts: u64,
    pub in_underrun: u64,
    pub in_errors: u64,
    pub out_errors: u64,
    pub out_octets: u64,
    pub out_ucast_pkts: u64,
    pub out_multicast_pkts: u64,
    pub out_broadcast_pkts: u64,
    pub out_nucast_pkts: u64,
    pub out_ok: u64,
    pub in_ok: u64,
    pub out_ucast_bytes: u64,
    pub out_multicast_bytes: u64,
    pub out_broadcast_bytes: u64,
    pub in_ucast_bytes: u64,
    pub in_multicast_bytes: u64,
    pub in_broadcast_bytes: u64,
    pub ethernet_status: u64,
}

impl IocStatistics {
    fn fields(&self) -> [u64; 22] {
        [
            self.in_broadcast_pkts,
            self.in_multicast_pkts,
            self.in_octets,
            self.in_ucast_pkts,
            self.in_nucast_pkts,
            self.in_underrun,
            self.in_errors,
            self.out_errors,
            self.out_octets,
            self.out_ucast_pkts,
            self.out_multicast_pkts,
            self.out_broadcast_pkts,
            self.out_nucast_pkts,
            self.out_ok,
            self.in_ok,
            self.out_ucast_bytes,
            self.out_multicast_bytes,
            self.out_broadcast_bytes,
            self.in_ucast_bytes,
            self.in_multicast_bytes,
            self.in_broadcast_bytes,
            self.ethernet_status,
        ]
    }

    fn from_fields(f: [u64; 22]) -> Self {
        IocStatistics {
            in_broadcast_pkts: f[0],
            in_multicast_pkts: f[1],
            in_octets: f[2],
            in_ucast_pkts: f[3],
            in_nucast_pkts: f[4],
            in_underrun: f[5],
            in_errors: f[6],
            out_errors: f[7],
            out_octets: f[8],
            out_ucast_pkts: f[9],
            out_multicast_pkts: f[10],
            out_broadcast_pkts: f[11],
            out_nucast_pkts: f[12],
            out_ok: f[13],
            in_ok: f[14],
            out_ucast_bytes: f[15],
            out_multicast_bytes: f[16],
            out_broadcast_bytes: f[17],
            in_ucast_bytes: f[18],
            in_multicast_bytes: f[19],
            in_broadcast_bytes: f[20],
            ethernet_status: f[21],
        }
    }
}

/// `CMD_HEARTBEAT` request: how long the controller should wait for the
/// next heartbeat before declaring the host dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub timeout_us: u32,
}

/// Status numbers carried by `CMD_REPORT_STATUS` notifications.
pub mod status {
    pub const LINK_UP: u32 = 1;
    pub const LINK_DOWN: u32 = 2;
    pub const AGGREGATION_CHANGE: u32 = 3;
    pub const IOC_SHUTDOWN: u32 = 4;
    pub const CONTROL_ERROR: u32 = 5;
    pub const IOC_ERROR: u32 = 6;
}

/// Asynchronous status notification from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusReport {
    pub lan_switch: u8,
    pub fatal: bool,
    pub status: u32,
    pub info: u32,
    pub file: String,
    pub routine: String,
    pub line: u32,
    pub error_param: u32,
    pub description: String,
}

const STATUS_FILE_LEN: usize = 32;
const STATUS_ROUTINE_LEN: usize = 32;
const STATUS_DESC_LEN: usize = 128;

impl StatusReport {
    fn encode(&self, w: &mut WireWriter) {
        w.u8(self.lan_switch)
            .u8(self.fatal as u8)
            .zeros(2)
            .u32(self.status)
            .u32(self.info)
            .fixed(self.file.as_bytes(), STATUS_FILE_LEN)
            .fixed(self.routine.as_bytes(), STATUS_ROUTINE_LEN)
            .u32(self.line)
            .u32(self.error_param)
            .fixed(self.description.as_bytes(), STATUS_DESC_LEN);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let lan_switch = r.u8()?;
        let fatal = r.u8()? != 0;
        r.skip(2)?;
        Ok(StatusReport {
            lan_switch,
            fatal,
            status: r.u32()?,
            info: r.u32()?,
            file: r.text(STATUS_FILE_LEN)?,
            routine: r.text(STATUS_ROUTINE_LEN)?,
            line: r.u32()?,
            error_param: r.u32()?,
            description: r.text(STATUS_DESC_LEN)?,
        })
    }
}

/// A request sent from host to controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    InitVnic(InitVnicRequest),
    ConfigDataPath(ConfigDataPath),
    ExchangePools(ExchangePools),
    ConfigAddresses(ConfigAddresses),
    ConfigLink(ConfigLink),
    ReportStatistics { lan_switch: u8 },
    ClearStatistics { lan_switch: u8 },
    Reset,
    Heartbeat(Heartbeat),
}

impl ControlRequest {
    pub fn command(&self) -> Command {
        match self {
            ControlRequest::InitVnic(_) => Command::InitVnic,
            ControlRequest::ConfigDataPath(_) => Command::ConfigDataPath,
            ControlRequest::ExchangePools(_) => Command::ExchangePools,
            ControlRequest::ConfigAddresses(_) => Command::ConfigAddresses,
            ControlRequest::ConfigLink(_) => Command::ConfigLink,
            ControlRequest::ReportStatistics { .. } => Command::ReportStatistics,
            ControlRequest::ClearStatistics { .. } => Command::ClearStatistics,
            ControlRequest::Reset => Command::Reset,
            ControlRequest::Heartbeat(_) => Command::Heartbeat,
        }
    }

    fn encode_payload(&self, w: &mut WireWriter) {
        match self {
            ControlRequest::InitVnic(req) => {
                w.u16(req.major)
                    .u16(req.minor)
                    .u8(req.instance)
                    .u8(req.num_data_paths)
                    .u16(req.num_address_entries);
            }
            ControlRequest::ConfigDataPath(cfg) => encode_config_data_path(cfg, w),
            ControlRequest::ExchangePools(x) => encode_exchange_pools(x, w),
            ControlRequest::ConfigAddresses(a) => encode_config_addresses(a, w),
            ControlRequest::ConfigLink(l) => encode_config_link(l, w),
            ControlRequest::ReportStatistics { lan_switch }
            | ControlRequest::ClearStatistics { lan_switch } => {
                w.u8(*lan_switch);
            }
            ControlRequest::Reset => {}
            ControlRequest::Heartbeat(hb) => {
                w.u32(hb.timeout_us);
            }
        }
    }

    fn decode_payload(command: Command, r: &mut WireReader<'_>) -> Result<Self> {
        Ok(match command {
            Command::InitVnic => ControlRequest::InitVnic(InitVnicRequest {
                major: r.u16()?,
                minor: r.u16()?,
                instance: r.u8()?,
                num_data_paths: r.u8()?,
                num_address_entries: r.u16()?,
            }),
            Command::ConfigDataPath => ControlRequest::ConfigDataPath(decode_config_data_path(r)?),
            Command::ExchangePools => ControlRequest::ExchangePools(decode_exchange_pools(r)?),
            Command::ConfigAddresses => {
                ControlRequest::ConfigAddresses(decode_config_addresses(r)?)
            }
            Command::ConfigLink => ControlRequest::ConfigLink(decode_config_link(r)?),
            Command::ReportStatistics => ControlRequest::ReportStatistics {
                lan_switch: r.u8()?,
            },
            Command::ClearStatistics => ControlRequest::ClearStatistics {
                lan_switch: r.u8()?,
            },
            Command::Reset => ControlRequest::Reset,
            Command::Heartbeat => ControlRequest::Heartbeat(Heartbeat {
                timeout_us: r.u32()?,
            }),
            Command::ReportStatus => {
                return Err(VnicError::decode("report-status is not a request"));
            }
        })
    }
}

/// A response sent from controller to host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    InitVnic(InitVnicResponse),
    ConfigDataPath(ConfigDataPath),
    ExchangePools(ExchangePools),
    ConfigAddresses(ConfigAddresses),
    ConfigLink(ConfigLink),
    ReportStatistics {
        lan_switch: u8,
        stats: IocStatistics,
    },
    ClearStatistics,
    Reset,
    Heartbeat,
}

impl ControlResponse {
    pub fn command(&self) -> Command {
        match self {
            ControlResponse::InitVnic(_) => Command::InitVnic,
            ControlResponse::ConfigDataPath(_) => Command::ConfigDataPath,
            ControlResponse::ExchangePools(_) => Command::ExchangePools,
            ControlResponse::ConfigAddresses(_) => Command::ConfigAddresses,
            ControlResponse::ConfigLink(_) => Command::ConfigLink,
            ControlResponse::ReportStatistics { .. } => Command::ReportStatistics,
            ControlResponse::ClearStatistics => Command::ClearStatistics,
            ControlResponse::Reset => Command::Reset,
            ControlResponse::Heartbeat => Command::Heartbeat,
        }
    }

    fn encode_payload(&self, w: &mut WireWriter) {
        match self {
            ControlResponse::InitVnic(rsp) => {
                w.u16(rsp.major)
                    .u16(rsp.minor)
                    .u8(rsp.instance)
                    .u8(rsp.num_lan_switches)
                    .u8(rsp.num_data_paths)
                    .zeros(1)
                    .u16(rsp.num_address_entries)
                    .u32(rsp.features.0)
                    .u8(rsp.lan_switch.number)
                    .u8(rsp.lan_switch.num_enet_ports)
                    .u16(rsp.lan_switch.default_vlan)
                    .bytes(&rsp.lan_switch.mac.0);
            }
            ControlResponse::ConfigDataPath(cfg) => encode_config_data_path(cfg, w),
            ControlResponse::ExchangePools(x) => encode_exchange_pools(x, w),
            ControlResponse::ConfigAddresses(a) => encode_config_addresses(a, w),
            ControlResponse::ConfigLink(l) => encode_config_link(l, w),
            ControlResponse::ReportStatistics { lan_switch, stats } => {
                w.u8(*lan_switch).zeros(7);
                for v in stats.fields() {
                    w.u64(v);
                }
            }
            ControlResponse::ClearStatistics
            | ControlResponse::Reset
            | ControlResponse::Heartbeat => {}
        }
    }

    fn decode_payload(command: Command, r: &mut WireReader<'_>) -> Result<Self> {
        Ok(match command {
            Command::InitVnic => ControlResponse::InitVnic(InitVnicResponse {
                major: r.u16()?,
                minor: r.u16()?,
                instance: r.u8()?,
                num_lan_switches: r.u8()?,
                num_data_paths: {
                    let n = r.u8()?;
                    r.skip(1)?;
                    n
                },
                num_address_entries: r.u16()?,
                features: FeatureFlags(r.u32()?),
                lan_switch: LanSwitch {
                    number: r.u8()?,
                    num_enet_ports: r.u8()?,
                    default_vlan: r.u16()?,
                    mac: MacAddress(r.array()?),
                },
            }),
            Command::ConfigDataPath => {
                ControlResponse::ConfigDataPath(decode_config_data_path(r)?)
            }
            Command::ExchangePools => ControlResponse::ExchangePools(decode_exchange_pools(r)?),
            Command::ConfigAddresses => {
                ControlResponse::ConfigAddresses(decode_config_addresses(r)?)
            }
            Command::ConfigLink => ControlResponse::ConfigLink(decode_config_link(r)?),
            Command::ReportStatistics => {
                let lan_switch = r.u8()?;
                r.skip(7)?;
                let mut f = [0u64; 22];
                for v in f.iter_mut() {
                    *v = r.u64()?;
                }
                ControlResponse::ReportStatistics {
                    lan_switch,
                    stats: IocStatistics::from_fields(f),
                }
            }
            Command::ClearStatistics => ControlResponse::ClearStatistics,
            Command::Reset => ControlResponse::Reset,
            Command::Heartbeat => ControlResponse::Heartbeat,
            Command::ReportStatus => {
                return Err(VnicError::decode("report-status is not a response"));
            }
        })
    }
}

fn encode_config_data_path(cfg: &ConfigDataPath, w: &mut WireWriter) {
    w.u64(cfg.path_id).u8(cfg.data_path).zeros(3);
    cfg.host.encode(w);
    cfg.ioc.encode(w);
}

fn decode_config_data_path(r: &mut WireReader<'_>) -> Result<ConfigDataPath> {
    let path_id = r.u64()?;
    let data_path = r.u8()?;
    r.skip(3)?;
    Ok(ConfigDataPath {
        path_id,
        data_path,
        host: PoolParams::decode(r)?,
        ioc: PoolParams::decode(r)?,
    })
}

fn encode_exchange_pools(x: &ExchangePools, w: &mut WireWriter) {
    w.u8(x.data_path).zeros(3).u32(x.rkey).u64(x.addr);
}

fn decode_exchange_pools(r: &mut WireReader<'_>) -> Result<ExchangePools> {
    let data_path = r.u8()?;
    r.skip(3)?;
    Ok(ExchangePools {
        data_path,
        rkey: r.u32()?,
        addr: r.u64()?,
    })
}

fn encode_config_addresses(a: &ConfigAddresses, w: &mut WireWriter) {
    w.u8(a.ops.len() as u8).u8(a.lan_switch);
    for op in &a.ops {
        w.u16(op.index)
            .u8(op.operation as u8)
            .u8(op.valid as u8)
            .bytes(&op.mac.0)
            .u16(op.vlan);
    }
}

fn decode_config_addresses(r: &mut WireReader<'_>) -> Result<ConfigAddresses> {
    let count = r.u8()? as usize;
    let lan_switch = r.u8()?;
    if count > MAX_ADDRESS_OPS_PER_PACKET {
        return Err(VnicError::decode(format!(
            "{count} address operations exceed the per-packet limit of {MAX_ADDRESS_OPS_PER_PACKET}"
        )));
    }
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        let index = r.u16()?;
        let operation = match r.u8()? {
            1 => AddressOperation::Set,
            2 => AddressOperation::Get,
            other => {
                return Err(VnicError::decode(format!(
                    "unknown address operation {other}"
                )));
            }
        };
        ops.push(AddressOp {
            index,
            operation,
            valid: r.u8()? != 0,
            mac: MacAddress(r.array()?),
            vlan: r.u16()?,
        });
    }
    Ok(ConfigAddresses { lan_switch, ops })
}

fn encode_config_link(l: &ConfigLink, w: &mut WireWriter) {
    w.u8(l.flags.0)
        .u8(l.lan_switch)
        .u16(l.mtu)
        .u16(l.default_vlan)
        .bytes(&l.mac.0)
        .zeros(4);
}

fn decode_config_link(r: &mut WireReader<'_>) -> Result<ConfigLink> {
    let link = ConfigLink {
        flags: LinkFlags(r.u8()?),
        lan_switch: r.u8()?,
        mtu: r.u16()?,
        default_vlan: r.u16()?,
        mac: MacAddress(r.array()?),
    };
    r.skip(4)?;
    Ok(link)
}

/// Body of a decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlBody {
    Request(ControlRequest),
    Response(ControlResponse),
    Info(StatusReport),
    /// The controller rejected the request named in the header.
    Error,
}

/// A complete control packet: header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub header: ControlHeader,
    pub body: ControlBody,
}

impl ControlMessage {
    pub fn request(req: ControlRequest, sequence: u8, retry_count: u8) -> Self {
        ControlMessage {
            header: ControlHeader {
                packet_type: PacketType::Request,
                command: req.command(),
                sequence,
                retry_count,
            },
            body: ControlBody::Request(req),
        }
    }

    pub fn response(rsp: ControlResponse, sequence: u8) -> Self {
        ControlMessage {
            header: ControlHeader {
                packet_type: PacketType::Response,
                command: rsp.command(),
                sequence,
                retry_count: 0,
            },
            body: ControlBody::Response(rsp),
        }
    }

    pub fn info(report: StatusReport) -> Self {
        ControlMessage {
            header: ControlHeader {
                packet_type: PacketType::Info,
                command: Command::ReportStatus,
                sequence: 0,
                retry_count: 0,
            },
            body: ControlBody::Info(report),
        }
    }

    pub fn error(command: Command, sequence: u8) -> Self {
        ControlMessage {
            header: ControlHeader {
                packet_type: PacketType::Error,
                command,
                sequence,
                retry_count: 0,
            },
            body: ControlBody::Error,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(MAX_CONTROL_PACKET);
        w.bytes(&self.header.encode());
        match &self.body {
            ControlBody::Request(req) => req.encode_payload(&mut w),
            ControlBody::Response(rsp) => rsp.encode_payload(&mut w),
            ControlBody::Info(report) => report.encode(&mut w),
            ControlBody::Error => {}
        }
        debug_assert!(w.len() <= MAX_CONTROL_PACKET);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() > MAX_CONTROL_PACKET {
            return Err(VnicError::decode(format!(
                "control packet of {} bytes exceeds {MAX_CONTROL_PACKET}",
                buf.len()
            )));
        }
        let header = ControlHeader::decode(buf)?;
        let mut r = WireReader::new(&buf[super::header::HEADER_SIZE..], "control payload");
        let body = match header.packet_type {
            PacketType::Request => {
                ControlBody::Request(ControlRequest::decode_payload(header.command, &mut r)?)
            }
            PacketType::Response => {
                ControlBody::Response(ControlResponse::decode_payload(header.command, &mut r)?)
            }
            PacketType::Info => {
                if header.command != Command::ReportStatus {
                    return Err(VnicError::decode(format!(
                        "unexpected info command {:?}",
                        header.command
                    )));
                }
                ControlBody::Info(StatusReport::decode(&mut r)?)
            }
            PacketType::Error => ControlBody::Error,
        };
        Ok(ControlMessage { header, body })
    }
}
