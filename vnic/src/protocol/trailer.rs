//! Data-channel buffer layout: the per-frame trailer and the buffer-pool
//! descriptor entries exchanged through RDMA writes.
//!
//! A frame buffer is `entry_size` bytes. The sender writes the frame so that
//! the 32-byte trailer occupies the last bytes of the buffer and the payload
//! ends, padded to [`BUFFER_ALIGNMENT`], immediately before it:
//!
//! ```text
//! | unused ... | pad | payload ... | pad to 32 | trailer (32) |
//!                    ^ data start = trailer - align(offset + len) + offset
//! ```

use super::codec::{WireReader, WireWriter};
use crate::error::{Result, VnicError};
use crate::types::MacAddress;

pub const TRAILER_SIZE: usize = 32;
pub const BUFFER_ALIGNMENT: usize = 32;
pub const POOL_ENTRY_SIZE: usize = 16;

/// `pkt_flags` bits.
pub mod pkt_flags {
    pub const CHASH_VALID: u8 = 0x01;
    pub const IPSEC_VALID: u8 = 0x02;
    pub const TCP_SEGMENT: u8 = 0x04;
    /// Sender asks the receiver to re-check its pool bookkeeping.
    pub const KICK: u8 = 0x08;
    pub const VLAN_INSERT: u8 = 0x10;
    pub const PVID_OVERRIDDEN: u8 = 0x20;
    pub const FCS_INCLUDED: u8 = 0x40;
    pub const FORCE_ROUTE: u8 = 0x80;
}

/// `tx_csum_flags` bits.
pub mod tx_csum {
    pub const IPV4: u8 = 0x01;
    pub const IPV6: u8 = 0x02;
    pub const TCP: u8 = 0x04;
    pub const UDP: u8 = 0x08;
}

/// `rx_csum_flags` bits.
pub mod rx_csum {
    pub const TCP_FAILED: u8 = 0x01;
    pub const UDP_FAILED: u8 = 0x02;
    pub const IP_FAILED: u8 = 0x04;
    pub const TCP_OK: u8 = 0x08;
    pub const UDP_OK: u8 = 0x10;
    pub const IP_OK: u8 = 0x20;
    pub const LOOPBACK: u8 = 0x40;
}

/// Set in `hash_and_valid` once the trailer describes a complete frame.
pub const CHV_VALID: u8 = 0x40;
pub const CHV_HASH_MASK: u8 = 0x3f;

/// Round `n` up to a multiple of `align` (a power of two).
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Bytes an RDMA write of a `len`-byte frame covers, trailer included.
pub const fn write_len(len: usize) -> usize {
    align_up(len, BUFFER_ALIGNMENT) + TRAILER_SIZE
}

/// Largest frame that fits in a buffer of `entry_size` bytes.
pub const fn max_frame_len(entry_size: usize) -> usize {
    if entry_size < TRAILER_SIZE {
        0
    } else {
        (entry_size - TRAILER_SIZE) & !(BUFFER_ALIGNMENT - 1)
    }
}

/// Metadata block written after every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trailer {
    pub align_offset: i8,
    pub rndis_header_len: u8,
    pub data_length: u16,
    pub pkt_flags: u8,
    pub tx_csum_flags: u8,
    pub rx_csum_flags: u8,
    pub ipsec_flags: u8,
    pub tcp_seq: u32,
    pub ipsec_offload_handle: u32,
    pub ipsec_next_offload_handle: u32,
    pub dest_mac: MacAddress,
    pub vlan: u16,
    pub timestamp: u16,
    pub origin: u8,
    pub hash_and_valid: u8,
}

impl Trailer {
    /// Trailer for a frame of `len` bytes placed at alignment offset 0.
    pub fn for_frame(len: usize, dest_mac: MacAddress) -> Self {
        Trailer {
            data_length: len as u16,
            dest_mac,
            hash_and_valid: CHV_VALID,
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.hash_and_valid & CHV_VALID != 0
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.pkt_flags & flag != 0
    }

    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut w = WireWriter::with_capacity(TRAILER_SIZE);
        w.u8(self.align_offset as u8)
            .u8(self.rndis_header_len)
            .u16(self.data_length)
            .u8(self.pkt_flags)
            .u8(self.tx_csum_flags)
            .u8(self.rx_csum_flags)
            .u8(self.ipsec_flags)
            .u32(self.tcp_seq)
            .u32(self.ipsec_offload_handle)
            .u32(self.ipsec_next_offload_handle)
            .bytes(&self.dest_mac.0)
            .u16(self.vlan)
            .u16(self.timestamp)
            .u8(self.origin)
            .u8(self.hash_and_valid);
        let mut out = [0u8; TRAILER_SIZE];
        out.copy_from_slice(&w.finish());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf, "frame trailer");
        Ok(Trailer {
            align_offset: r.u8()? as i8,
            rndis_header_len: r.u8()?,
            data_length: r.u16()?,
            pkt_flags: r.u8()?,
            tx_csum_flags: r.u8()?,
            rx_csum_flags: r.u8()?,
            ipsec_flags: r.u8()?,
            tcp_seq: r.u32()?,
            ipsec_offload_handle: r.u32()?,
            ipsec_next_offload_handle: r.u32()?,
            dest_mac: MacAddress(r.array()?),
            vlan: r.u16()?,
            timestamp: r.u16()?,
            origin: r.u8()?,
            hash_and_valid: r.u8()?,
        })
    }

    /// Offset of the first payload byte within a buffer of `entry_size`
    /// bytes, or an error if the trailer describes a frame that cannot fit.
    pub fn data_start(&self, entry_size: usize) -> Result<usize> {
        let offset = self.align_offset;
        if offset < 0 {
            return Err(VnicError::decode(format!(
                "negative alignment offset {offset}"
            )));
        }
        let offset = offset as usize;
        let span = align_up(offset + self.data_length as usize, BUFFER_ALIGNMENT);
        let trailer_pos = entry_size
            .checked_sub(TRAILER_SIZE)
            .ok_or_else(|| VnicError::decode("buffer smaller than trailer"))?;
        if span > trailer_pos {
            return Err(VnicError::decode(format!(
                "frame of {} bytes does not fit a {entry_size}-byte buffer",
                self.data_length
            )));
        }
        Ok(trailer_pos - span + offset)
    }
}

/// Serialize `frame` followed by `trailer` into the exact byte image an RDMA
/// write places at the end of a peer buffer.
pub fn frame_image(frame: &[u8], trailer: &Trailer) -> Vec<u8> {
    let mut out = vec![0u8; write_len(frame.len())];
    out[..frame.len()].copy_from_slice(frame);
    let at = out.len() - TRAILER_SIZE;
    out[at..].copy_from_slice(&trailer.encode());
    out
}

/// One slot of a buffer-pool descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferPoolEntry {
    pub addr: u64,
    pub rkey: u32,
    pub valid: bool,
}

impl BufferPoolEntry {
    pub const INVALID: BufferPoolEntry = BufferPoolEntry {
        addr: 0,
        rkey: 0,
        valid: false,
    };

    pub fn encode(&self) -> [u8; POOL_ENTRY_SIZE] {
        let mut out = [0u8; POOL_ENTRY_SIZE];
        out[..8].copy_from_slice(&self.addr.to_be_bytes());
        out[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        out[12..].copy_from_slice(&(self.valid as u32).to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf, "buffer pool entry");
        Ok(BufferPoolEntry {
            addr: r.u64()?,
            rkey: r.u32()?,
            valid: r.u32()? != 0,
        })
    }
}
