//! Wire formats: control packets, connection private data and the data
//! channel buffer trailer.

pub mod codec;
pub mod connect;
pub mod header;
pub mod message;
pub mod trailer;

pub use connect::ConnectionData;
pub use header::{
    Command, ControlHeader, HEADER_SIZE, MAX_CONTROL_PACKET, MAX_CONTROL_PAYLOAD, PROTOCOL_MAJOR,
    PROTOCOL_MINOR, PacketType,
};
pub use message::{
    AddressOp, AddressOperation, ConfigAddresses, ConfigDataPath, ConfigLink, ControlBody,
    ControlMessage, ControlRequest, ControlResponse, ExchangePools, FeatureFlags, Heartbeat,
    InitVnicRequest, InitVnicResponse, IocStatistics, LanSwitch, LinkFlags,
    MAX_ADDRESS_OPS_PER_PACKET, PoolParams, StatusReport, status,
};
pub use trailer::{BufferPoolEntry, Trailer};
