use crate::error::{Result, VnicError};

/// Size of the control packet header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest control packet either side may send.
pub const MAX_CONTROL_PACKET: usize = 256;

/// Largest payload following the header.
pub const MAX_CONTROL_PAYLOAD: usize = MAX_CONTROL_PACKET - HEADER_SIZE;

/// Control protocol version spoken by this host.
pub const PROTOCOL_MAJOR: u16 = 1;
pub const PROTOCOL_MINOR: u16 = 1;

/// Kind of control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Unsolicited notification from the controller.
    Info = 0,
    Request = 1,
    Response = 2,
    /// The controller could not process the request.
    Error = 3,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PacketType::Info),
            1 => Some(PacketType::Request),
            2 => Some(PacketType::Response),
            3 => Some(PacketType::Error),
            _ => None,
        }
    }
}

/// Control command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Command {
    InitVnic = 1,
    ConfigDataPath = 2,
    ExchangePools = 3,
    ConfigAddresses = 4,
    ConfigLink = 5,
    ReportStatistics = 6,
    ClearStatistics = 7,
    ReportStatus = 8,
    Reset = 9,
    Heartbeat = 10,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Command::InitVnic),
            2 => Some(Command::ConfigDataPath),
            3 => Some(Command::ExchangePools),
            4 => Some(Command::ConfigAddresses),
            5 => Some(Command::ConfigLink),
            6 => Some(Command::ReportStatistics),
            7 => Some(Command::ClearStatistics),
            8 => Some(Command::ReportStatus),
            9 => Some(Command::Reset),
            10 => Some(Command::Heartbeat),
            _ => None,
        }
    }
}

/// 8-byte header at the start of every control packet.
///
/// ```text
/// [0]    packet_type: u8
/// [1]    command: u8
/// [2]    sequence: u8
/// [3]    retry_count: u8
/// [4..8] reserved: u32 (must be 0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub packet_type: PacketType,
    pub command: Command,
    pub sequence: u8,
    pub retry_count: u8,
}

impl ControlHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.packet_type as u8;
        buf[1] = self.command as u8;
        buf[2] = self.sequence;
        buf[3] = self.retry_count;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(VnicError::decode(format!(
                "control header truncated ({} bytes)",
                buf.len()
            )));
        }
        let packet_type = PacketType::from_u8(buf[0])
            .ok_or_else(|| VnicError::decode(format!("unknown packet type {}", buf[0])))?;
        let command = Command::from_u8(buf[1])
            .ok_or_else(|| VnicError::decode(format!("unknown command code {}", buf[1])))?;
        Ok(ControlHeader {
            packet_type,
            command,
            sequence: buf[2],
            retry_count: buf[3],
        })
    }
}
