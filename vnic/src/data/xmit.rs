//! Host transmit pool: the table of controller receive buffers the
//! controller keeps replenished, plus local staging buffers frames are
//! written from.

use std::collections::HashMap;
use std::sync::Arc;

use super::ring::Ring;
use crate::error::Result;
use crate::protocol::trailer::{POOL_ENTRY_SIZE, frame_image};
use crate::protocol::{BufferPoolEntry, Trailer};
use crate::transport::{MemoryRegion, RemoteAddr};
use crate::types::{FrameId, SendStatus};

/// A frame staged locally and bound to a controller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedWrite {
    pub wr_id: u64,
    pub staging_offset: usize,
    pub len: usize,
    pub remote: RemoteAddr,
}

#[derive(Debug)]
struct InFlight {
    frame: FrameId,
    staging: u32,
    aborted: bool,
}

pub struct XmitPool {
    ring: Ring,
    peer_entry_size: usize,
    table: Arc<dyn MemoryRegion>,
    next_xmit: u32,
    need_buffers: bool,
    staging: Arc<dyn MemoryRegion>,
    staging_size: usize,
    free_staging: Vec<u32>,
    in_flight: HashMap<u64, InFlight>,
    next_wr: u64,
    wr_tag: u64,
}

impl XmitPool {
    /// `table` holds `ring.size()` entries written by the controller;
    /// `staging` holds `staging_count` buffers of `peer_entry_size` bytes.
    pub fn new(
        ring: Ring,
        peer_entry_size: usize,
        table: Arc<dyn MemoryRegion>,
        staging: Arc<dyn MemoryRegion>,
        staging_count: u32,
        wr_tag: u64,
    ) -> Self {
        Self {
            ring,
            peer_entry_size,
            table,
            next_xmit: 0,
            need_buffers: false,
            staging,
            staging_size: peer_entry_size,
            free_staging: (0..staging_count).rev().collect(),
            in_flight: HashMap::new(),
            next_wr: 0,
            wr_tag,
        }
    }

    pub fn table_region(&self) -> &Arc<dyn MemoryRegion> {
        &self.table
    }

    pub fn staging_region(&self) -> &Arc<dyn MemoryRegion> {
        &self.staging
    }

    fn peer_entry(&self) -> Result<BufferPoolEntry> {
        let mut raw = [0u8; POOL_ENTRY_SIZE];
        self.table
            .read(self.next_xmit as usize * POOL_ENTRY_SIZE, &mut raw)?;
        BufferPoolEntry::decode(&raw)
    }

    /// Whether the next frame can go out now. Records the shortage so
    /// [`take_buffers_available`](Self::take_buffers_available) can report
    /// the recovery.
    pub fn has_capacity(&mut self) -> Result<bool> {
        let ok = !self.free_staging.is_empty() && self.peer_entry()?.valid;
        if !ok {
            self.need_buffers = true;
        }
        Ok(ok)
    }

    /// Copy `frame` and `trailer` into a staging buffer and claim the next
    /// controller buffer. The caller checks [`has_capacity`](Self::has_capacity)
    /// first under the same lock.
    pub fn stage(&mut self, id: FrameId, frame: &[u8], trailer: &Trailer) -> Result<Option<StagedWrite>> {
        let entry = self.peer_entry()?;
        if !entry.valid {
            self.need_buffers = true;
            return Ok(None);
        }
        let Some(staging) = self.free_staging.pop() else {
            self.need_buffers = true;
            return Ok(None);
        };
        let image = frame_image(frame, trailer);
        let staging_offset = staging as usize * self.staging_size;
        if let Err(e) = self.staging.write(staging_offset, &image) {
            self.free_staging.push(staging);
            return Err(e);
        }
        self.table.write(
            self.next_xmit as usize * POOL_ENTRY_SIZE,
            &BufferPoolEntry::INVALID.encode(),
        )?;
        self.next_xmit = self.ring.advance(self.next_xmit, 1);

        let wr_id = self.wr_tag | self.next_wr;
        self.next_wr = (self.next_wr + 1) & 0x00ff_ffff_ffff_ffff;
        self.in_flight.insert(
            wr_id,
            InFlight {
                frame: id,
                staging,
                aborted: false,
            },
        );
        let remote = RemoteAddr {
            addr: entry.addr + (self.peer_entry_size - image.len()) as u64,
            rkey: entry.rkey,
        };
        Ok(Some(StagedWrite {
            wr_id,
            staging_offset,
            len: image.len(),
            remote,
        }))
    }

    /// Retire a completed write.
    pub fn complete(&mut self, wr_id: u64, success: bool) -> Option<(FrameId, SendStatus)> {
        let f = self.in_flight.remove(&wr_id)?;
        self.free_staging.push(f.staging);
        let status = if f.aborted {
            SendStatus::Aborted
        } else if success {
            SendStatus::Success
        } else {
            SendStatus::Failed
        };
        Some((f.frame, status))
    }

    /// Mark a submitted frame so its completion reports it aborted.
    pub fn cancel(&mut self, id: FrameId) -> bool {
        let mut found = false;
        for f in self.in_flight.values_mut().filter(|f| f.frame == id) {
            f.aborted = true;
            found = true;
        }
        found
    }

    /// True once, when buffers return after a shortage.
    pub fn take_buffers_available(&mut self) -> Result<bool> {
        if !self.need_buffers {
            return Ok(false);
        }
        if !self.free_staging.is_empty() && self.peer_entry()?.valid {
            self.need_buffers = false;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn need_buffers(&self) -> bool {
        self.need_buffers
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget every in-flight frame, returning their ids.
    pub fn drain_in_flight(&mut self) -> Vec<FrameId> {
        let mut out: Vec<(u64, InFlight)> = self.in_flight.drain().collect();
        out.sort_by_key(|(wr, _)| *wr);
        out.into_iter()
            .map(|(_, f)| {
                self.free_staging.push(f.staging);
                f.frame
            })
            .collect()
    }
}
