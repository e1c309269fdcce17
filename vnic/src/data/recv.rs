//! Host receive pool: buffers the controller writes frames into.
//!
//! Free buffers are advertised by writing [`BufferPoolEntry`] records into
//! the controller's table in ring order. The controller consumes the table
//! in the same order, so the host finds filled buffers by walking its posted
//! slots from `next_full` while their trailers are valid.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

use super::ring::{BufferSlot, Delivered, Free, Posted, Ring};
use crate::error::Result;
use crate::protocol::trailer::{POOL_ENTRY_SIZE, TRAILER_SIZE, rx_csum};
use crate::protocol::{BufferPoolEntry, Trailer, trailer::pkt_flags};
use crate::transport::{MemoryRegion, RemoteAddr};
use crate::types::{MacAddress, RxChecksum};

/// One RDMA write that pushes a run of free entries to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntryWrite {
    /// Byte offset in the local table image (and the remote table).
    pub offset: usize,
    pub len: usize,
    pub remote: RemoteAddr,
    pub entries: u32,
}

/// Outcome of examining the next posted slot.
pub enum FullSlot {
    Frame(ReceivedFrame),
    /// The slot held a malformed frame and was recycled.
    Malformed,
}

pub struct RecvPool {
    ring: Ring,
    entry_size: usize,
    bundle: u32,
    buffers: Arc<dyn MemoryRegion>,
    table: Arc<dyn MemoryRegion>,
    remote_table: Option<RemoteAddr>,
    posted: Vec<Option<BufferSlot<Posted>>>,
    next_free: u32,
    next_full: u32,
    num_posted: u32,
    recycled: Arc<ArrayQueue<BufferSlot<Free>>>,
    wake: Arc<Notify>,
}

impl RecvPool {
    /// `buffers` must hold `ring.size()` buffers of `entry_size` bytes and
    /// `table` `ring.size()` pool entries.
    pub fn new(
        ring: Ring,
        entry_size: usize,
        bundle: u32,
        buffers: Arc<dyn MemoryRegion>,
        table: Arc<dyn MemoryRegion>,
        wake: Arc<Notify>,
    ) -> Self {
        let size = ring.size();
        let recycled = Arc::new(ArrayQueue::new(size as usize));
        for i in 0..size {
            let _ = recycled.push(BufferSlot::<Free>::new(i));
        }
        Self {
            ring,
            entry_size,
            bundle: bundle.clamp(1, size),
            buffers,
            table,
            remote_table: None,
            posted: (0..size).map(|_| None).collect(),
            next_free: 0,
            next_full: 0,
            num_posted: 0,
            recycled,
            wake,
        }
    }

    pub fn set_remote_table(&mut self, remote: RemoteAddr) {
        self.remote_table = Some(remote);
    }

    pub fn table_region(&self) -> &Arc<dyn MemoryRegion> {
        &self.table
    }

    /// Free buffers not yet advertised to the controller.
    pub fn num_free(&self) -> u32 {
        self.recycled.len() as u32
    }

    pub fn num_posted(&self) -> u32 {
        self.num_posted
    }

    pub fn size(&self) -> u32 {
        self.ring.size()
    }

    fn buffer_offset(&self, slot_index: u32) -> usize {
        slot_index as usize * self.entry_size
    }

    /// Advertise free buffers in bundles of `free_per_update`. Consecutive
    /// bundles are coalesced into one write until the table wraps. Returns
    /// `None` when fewer than a bundle is free or the table has no room.
    pub fn prepare_free_entries(&mut self) -> Result<Option<FreeEntryWrite>> {
        let Some(remote) = self.remote_table else {
            return Ok(None);
        };
        let start = self.next_free;
        let mut entries = 0u32;
        while self.num_free() >= self.bundle && self.num_posted + self.bundle <= self.ring.size() {
            for _ in 0..self.bundle {
                let Some(slot) = self.recycled.pop() else {
                    break;
                };
                let offset = self.buffer_offset(slot.index());
                // clear a stale valid marker before the controller can reuse it
                self.buffers
                    .write(offset + self.entry_size - 1, &[0])?;
                let entry = BufferPoolEntry {
                    addr: self.buffers.addr() + offset as u64,
                    rkey: self.buffers.rkey(),
                    valid: true,
                };
                self.table
                    .write(self.next_free as usize * POOL_ENTRY_SIZE, &entry.encode())?;
                self.posted[self.next_free as usize] = Some(slot.post());
                self.next_free = self.ring.advance(self.next_free, 1);
                self.num_posted += 1;
                entries += 1;
            }
            if self.next_free == 0 {
                break;
            }
        }
        if entries == 0 {
            return Ok(None);
        }
        let offset = start as usize * POOL_ENTRY_SIZE;
        Ok(Some(FreeEntryWrite {
            offset,
            len: entries as usize * POOL_ENTRY_SIZE,
            remote: RemoteAddr {
                addr: remote.addr + offset as u64,
                rkey: remote.rkey,
            },
            entries,
        }))
    }

    /// Take the next filled buffer, if the controller has completed it.
    pub fn next_full(&mut self) -> Result<Option<FullSlot>> {
        let index = self.next_full as usize;
        let Some(slot) = self.posted[index].as_ref() else {
            return Ok(None);
        };
        let base = self.buffer_offset(slot.index());
        let mut raw = [0u8; TRAILER_SIZE];
        self.buffers
            .read(base + self.entry_size - TRAILER_SIZE, &mut raw)?;
        let trailer = Trailer::decode(&raw)?;
        if !trailer.is_valid() {
            return Ok(None);
        }
        let start = match trailer.data_start(self.entry_size) {
            Ok(s) => s,
            Err(e) => {
                let Some(slot) = self.consume_posted(index) else {
                    return Ok(None);
                };
                tracing::warn!(slot = slot.index(), error = %e, "malformed receive trailer");
                let _ = self.recycled.push(slot.reclaim());
                return Ok(Some(FullSlot::Malformed));
            }
        };
        // a failed read leaves the slot posted for the next pass
        let mut data = vec![0u8; trailer.data_length as usize];
        self.buffers.read(base + start, &mut data)?;
        let Some(slot) = self.consume_posted(index) else {
            return Ok(None);
        };
        let lease = SlotLease {
            slot: Some(slot.deliver()),
            home: Arc::clone(&self.recycled),
            wake: Arc::clone(&self.wake),
        };
        Ok(Some(FullSlot::Frame(ReceivedFrame {
            data,
            dest_mac: trailer.dest_mac,
            vlan: trailer
                .has_flag(pkt_flags::VLAN_INSERT)
                .then_some(trailer.vlan),
            checksum: rx_checksum(trailer.rx_csum_flags),
            _lease: lease,
        })))
    }

    fn consume_posted(&mut self, index: usize) -> Option<BufferSlot<Posted>> {
        let slot = self.posted[index].take()?;
        self.next_full = self.ring.advance(self.next_full, 1);
        self.num_posted -= 1;
        Some(slot)
    }

    /// Posted slots the controller never filled go back to the free list.
    pub fn reclaim_posted(&mut self) {
        for entry in self.posted.iter_mut() {
            if let Some(slot) = entry.take() {
                let _ = self.recycled.push(slot.reclaim());
            }
        }
        self.num_posted = 0;
    }
}

fn rx_checksum(flags: u8) -> RxChecksum {
    RxChecksum {
        ip_ok: flags & rx_csum::IP_OK != 0,
        tcp_ok: flags & rx_csum::TCP_OK != 0,
        udp_ok: flags & rx_csum::UDP_OK != 0,
        failed: flags & (rx_csum::IP_FAILED | rx_csum::TCP_FAILED | rx_csum::UDP_FAILED) != 0,
    }
}

/// Holds a delivered buffer until the frame is dropped.
struct SlotLease {
    slot: Option<BufferSlot<Delivered>>,
    home: Arc<ArrayQueue<BufferSlot<Free>>>,
    wake: Arc<Notify>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let _ = self.home.push(slot.release());
            self.wake.notify_one();
        }
    }
}

/// A frame received from the controller. Its receive buffer is returned to
/// the pool when the frame is dropped.
pub struct ReceivedFrame {
    data: Vec<u8>,
    dest_mac: MacAddress,
    vlan: Option<u16>,
    checksum: RxChecksum,
    _lease: SlotLease,
}

impl std::fmt::Debug for ReceivedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedFrame")
            .field("len", &self.data.len())
            .field("dest_mac", &self.dest_mac)
            .field("vlan", &self.vlan)
            .finish()
    }
}

impl ReceivedFrame {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dest_mac(&self) -> MacAddress {
        self.dest_mac
    }

    pub fn vlan(&self) -> Option<u16> {
        self.vlan
    }

    pub fn checksum(&self) -> RxChecksum {
        self.checksum
    }

    /// Take the payload, releasing the receive buffer.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
