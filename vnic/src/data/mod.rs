//! Data channel: frames move by RDMA write into buffers the peer advertised,
//! with kicks and free-buffer updates in place of per-frame acknowledgement.
//!
//! The receive and transmit rings each sit behind their own lock, held only
//! while cursors move. RDMA posts happen after the lock is released.

pub mod kick;
pub mod recv;
pub mod ring;
pub mod xmit;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::DataConfig;
use crate::error::{Result, VnicError};
use crate::protocol::trailer::{POOL_ENTRY_SIZE, max_frame_len, pkt_flags, tx_csum};
use crate::protocol::{PoolParams, Trailer};
use crate::transport::{CompletionStatus, QueuePair, RemoteAddr, Sge, Transport};
use crate::types::{FrameId, OffloadCaps, SendStatus, TransmitOutcome, TxFrame};

use kick::KickTracker;
use recv::{FullSlot, RecvPool};
use ring::Ring;
use xmit::XmitPool;

pub use recv::ReceivedFrame;

const WR_TAG_SHIFT: u32 = 56;
const WR_XMIT: u64 = 1 << WR_TAG_SHIFT;
const WR_FREE: u64 = 2 << WR_TAG_SHIFT;
const WR_KICK: u64 = 3 << WR_TAG_SHIFT;
const WR_KICK_RECV: u64 = 4 << WR_TAG_SHIFT;
const WR_TAG_MASK: u64 = 0xff << WR_TAG_SHIFT;

/// Kick messages carry no information beyond their arrival.
pub const KICK_MESSAGE: [u8; 1] = [0];
const KICK_RECV_CAPACITY: usize = 64;

/// Snapshot of the data channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataStatistics {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub tx_aborted: u64,
    pub tx_exhausted: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub kicks_sent: u64,
    pub kicks_received: u64,
    pub free_updates: u64,
}

#[derive(Default)]
struct DataCounters {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_errors: AtomicU64,
    tx_aborted: AtomicU64,
    tx_exhausted: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
    rx_errors: AtomicU64,
    kicks_sent: AtomicU64,
    kicks_received: AtomicU64,
    free_updates: AtomicU64,
}

fn bump(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

struct XmitState {
    pool: XmitPool,
    kick: KickTracker,
}

/// Result of a completed RDMA write on the data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCompletion {
    Frame(FrameId, SendStatus),
    Other,
}

pub struct DataChannel {
    qp: Arc<dyn QueuePair>,
    host: PoolParams,
    ioc: PoolParams,
    recv: Mutex<RecvPool>,
    xmit: Mutex<XmitState>,
    counters: DataCounters,
    accepting: AtomicBool,
    stopped: AtomicBool,
    faulted: AtomicBool,
    offloads: Mutex<OffloadCaps>,
    wake: Arc<Notify>,
    kick_recvs: u32,
    max_frame: usize,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl DataChannel {
    /// Register the pools negotiated by configure-data-path. `host` sizes
    /// the buffers the controller writes into, `ioc` the controller buffers
    /// this side writes into.
    pub fn new(
        transport: &dyn Transport,
        qp: Arc<dyn QueuePair>,
        host: PoolParams,
        ioc: PoolParams,
        cfg: &DataConfig,
    ) -> Result<Self> {
        let recv_ring = Ring::new(host.entry_count)?;
        let xmit_ring = Ring::new(ioc.entry_count)?;
        let host_entry = host.entry_size as usize;
        let ioc_entry = ioc.entry_size as usize;
        let wake = Arc::new(Notify::new());

        let buffers = transport.register_memory(host.entry_count as usize * host_entry)?;
        let free_table = transport.register_memory(host.entry_count as usize * POOL_ENTRY_SIZE)?;
        let xmit_table = transport.register_memory(ioc.entry_count as usize * POOL_ENTRY_SIZE)?;
        let staging = transport.register_memory(cfg.xmit_buffers as usize * ioc_entry)?;

        let recv = RecvPool::new(
            recv_ring,
            host_entry,
            host.free_per_update,
            buffers,
            free_table,
            Arc::clone(&wake),
        );
        let pool = XmitPool::new(xmit_ring, ioc_entry, xmit_table, staging, cfg.xmit_buffers, WR_XMIT);
        tracing::debug!(
            recv_buffers = host.entry_count,
            recv_entry = host_entry,
            xmit_slots = ioc.entry_count,
            xmit_entry = ioc_entry,
            "data channel pools registered"
        );
        Ok(Self {
            qp,
            host,
            ioc,
            recv: Mutex::new(recv),
            xmit: Mutex::new(XmitState {
                pool,
                kick: KickTracker::new(&ioc),
            }),
            counters: DataCounters::default(),
            accepting: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            faulted: AtomicBool::new(false),
            offloads: Mutex::new(OffloadCaps::default()),
            wake,
            kick_recvs: cfg.kick_recvs,
            max_frame: max_frame_len(ioc_entry).min(max_frame_len(host_entry)),
        })
    }

    pub fn host_params(&self) -> &PoolParams {
        &self.host
    }

    pub fn ioc_params(&self) -> &PoolParams {
        &self.ioc
    }

    /// Where the controller writes free-buffer entries for our transmits.
    pub fn xmit_table(&self) -> RemoteAddr {
        let x = lock(&self.xmit);
        let t = x.pool.table_region();
        RemoteAddr {
            addr: t.addr(),
            rkey: t.rkey(),
        }
    }

    /// Notified when receive buffers are released or the kick timer is
    /// armed; the owner then re-runs [`replenish`](Self::replenish) and
    /// re-reads [`kick_deadline`](Self::kick_deadline).
    pub fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame
    }

    /// Begin moving frames once the controller's table is known.
    pub fn start(&self, remote_table: RemoteAddr) -> Result<()> {
        lock(&self.recv).set_remote_table(remote_table);
        for i in 0..self.kick_recvs as u64 {
            self.qp.post_recv(WR_KICK_RECV | i, KICK_RECV_CAPACITY)?;
        }
        let pushed = self.replenish()?;
        self.stopped.store(false, Ordering::Release);
        tracing::debug!(free_entries = pushed, "data channel started");
        Ok(())
    }

    /// Stop transmission; later transmits fail with `NotConnected`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether received frames are handed upstream or recycled at once.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub fn set_offloads(&self, caps: OffloadCaps) {
        *lock(&self.offloads) = caps;
    }

    fn fault(&self, err: VnicError) -> VnicError {
        if !self.faulted.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %err, "data channel fault");
        }
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
        err
    }

    fn trailer_for(&self, frame: &TxFrame, kick: bool) -> Trailer {
        let mut t = Trailer::for_frame(frame.data.len(), frame.dest_mac());
        if kick {
            t.pkt_flags |= pkt_flags::KICK;
        }
        if let Some(vlan) = frame.vlan {
            t.pkt_flags |= pkt_flags::VLAN_INSERT;
            t.vlan = vlan;
        }
        let caps = *lock(&self.offloads);
        if caps.ipv4_tx && frame.checksum.ipv4 {
            t.tx_csum_flags |= tx_csum::IPV4;
        }
        if caps.tcp_tx && frame.checksum.tcp {
            t.tx_csum_flags |= tx_csum::TCP;
        }
        if caps.udp_tx && frame.checksum.udp {
            t.tx_csum_flags |= tx_csum::UDP;
        }
        t
    }

    /// Write `frame` into the next controller buffer. Returns the frame
    /// back when no controller buffer or staging buffer is free.
    pub fn transmit(&self, frame: TxFrame) -> Result<TransmitOutcome> {
        if self.is_stopped() {
            return Err(VnicError::NotConnected);
        }
        if frame.data.len() > self.max_frame {
            bump(&self.counters.tx_errors, 1);
            return Err(VnicError::FrameTooLarge {
                len: frame.data.len(),
                max: self.max_frame,
            });
        }
        let (write, staging, armed) = {
            let mut x = lock(&self.xmit);
            if !x.pool.has_capacity()? {
                bump(&self.counters.tx_exhausted, 1);
                return Ok(TransmitOutcome::BufferExhausted(frame));
            }
            let had_deadline = x.kick.deadline().is_some();
            let kick = x.kick.record(frame.data.len(), Instant::now());
            let armed = !had_deadline && x.kick.deadline().is_some();
            let trailer = self.trailer_for(&frame, kick);
            match x.pool.stage(frame.id, &frame.data, &trailer)? {
                Some(w) => (w, Arc::clone(x.pool.staging_region()), armed),
                None => {
                    bump(&self.counters.tx_exhausted, 1);
                    return Ok(TransmitOutcome::BufferExhausted(frame));
                }
            }
        };
        if armed {
            self.wake.notify_one();
        }
        let posted = self.qp.rdma_write(
            write.wr_id,
            Sge {
                region: staging.as_ref(),
                offset: write.staging_offset,
                len: write.len,
            },
            write.remote,
            true,
        );
        if let Err(e) = posted {
            lock(&self.xmit).pool.complete(write.wr_id, false);
            bump(&self.counters.tx_errors, 1);
            return Err(self.fault(e));
        }
        bump(&self.counters.tx_bytes, frame.data.len() as u64);
        tracing::trace!(frame = frame.id, len = frame.data.len(), "frame written");
        Ok(TransmitOutcome::Queued)
    }

    /// Mark an in-flight frame aborted. Returns false if it is not in flight.
    pub fn cancel(&self, id: FrameId) -> bool {
        lock(&self.xmit).pool.cancel(id)
    }

    /// Retire a write completion from the data connection.
    pub fn on_write_complete(&self, wr_id: u64, status: CompletionStatus) -> WriteCompletion {
        if wr_id & WR_TAG_MASK != WR_XMIT {
            return WriteCompletion::Other;
        }
        let ok = status == CompletionStatus::Success;
        let done = lock(&self.xmit).pool.complete(wr_id, ok);
        match done {
            Some((id, st)) => {
                match st {
                    SendStatus::Success => bump(&self.counters.tx_packets, 1),
                    SendStatus::Aborted => bump(&self.counters.tx_aborted, 1),
                    SendStatus::Failed => bump(&self.counters.tx_errors, 1),
                }
                WriteCompletion::Frame(id, st)
            }
            None => WriteCompletion::Other,
        }
    }

    /// Handle a kick message from the controller and re-arm its receive.
    /// Returns false for receives that are not kicks.
    pub fn on_recv_complete(&self, wr_id: u64) -> Result<bool> {
        if wr_id & WR_TAG_MASK != WR_KICK_RECV {
            return Ok(false);
        }
        bump(&self.counters.kicks_received, 1);
        if let Err(e) = self.qp.post_recv(wr_id, KICK_RECV_CAPACITY) {
            return Err(self.fault(e));
        }
        Ok(true)
    }

    /// Collect every frame the controller has completed. Frames are
    /// returned only while accepting; otherwise they are counted as dropped
    /// and their buffers recycled.
    pub fn poll_receive(&self) -> Result<Vec<ReceivedFrame>> {
        let mut frames = Vec::new();
        let mut malformed = 0u64;
        {
            let mut r = lock(&self.recv);
            loop {
                match r.next_full() {
                    Ok(Some(FullSlot::Frame(f))) => frames.push(f),
                    Ok(Some(FullSlot::Malformed)) => malformed += 1,
                    Ok(None) => break,
                    Err(e) => return Err(self.fault(e)),
                }
            }
        }
        if malformed > 0 {
            bump(&self.counters.rx_errors, malformed);
        }
        if !frames.is_empty() {
            if self.is_accepting() {
                bump(&self.counters.rx_packets, frames.len() as u64);
                let bytes: usize = frames.iter().map(ReceivedFrame::len).sum();
                bump(&self.counters.rx_bytes, bytes as u64);
            } else {
                bump(&self.counters.rx_dropped, frames.len() as u64);
                frames.clear();
            }
        }
        self.replenish()?;
        Ok(frames)
    }

    /// Push free receive buffers to the controller. Returns the number of
    /// entries written.
    pub fn replenish(&self) -> Result<u32> {
        let mut total = 0;
        loop {
            let (write, table) = {
                let mut r = lock(&self.recv);
                let write = match r.prepare_free_entries() {
                    Ok(Some(w)) => w,
                    Ok(None) => break,
                    Err(e) => return Err(self.fault(e)),
                };
                (write, Arc::clone(r.table_region()))
            };
            let posted = self.qp.rdma_write(
                WR_FREE | total as u64,
                Sge {
                    region: table.as_ref(),
                    offset: write.offset,
                    len: write.len,
                },
                write.remote,
                false,
            );
            if let Err(e) = posted {
                return Err(self.fault(e));
            }
            bump(&self.counters.free_updates, 1);
            total += write.entries;
        }
        Ok(total)
    }

    pub fn kick_deadline(&self) -> Option<Instant> {
        lock(&self.xmit).kick.deadline()
    }

    /// Send a kick message if the kick timer has expired with frames
    /// outstanding. Returns whether a kick was sent.
    pub fn on_kick_timer(&self, now: Instant) -> Result<bool> {
        let due = lock(&self.xmit).kick.expire(now);
        if !due {
            return Ok(false);
        }
        let seq = self.counters.kicks_sent.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.qp.post_send(WR_KICK | (seq & 0xffff_ffff), &KICK_MESSAGE) {
            return Err(self.fault(e));
        }
        Ok(true)
    }

    /// True once, when transmit buffers return after an exhaustion.
    pub fn take_buffers_available(&self) -> Result<bool> {
        lock(&self.xmit).pool.take_buffers_available()
    }

    /// Forget in-flight frames on teardown, returning their ids.
    pub fn abort_in_flight(&self) -> Vec<FrameId> {
        lock(&self.xmit).pool.drain_in_flight()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.xmit).pool.in_flight()
    }

    /// Receive buffers free plus posted; never exceeds the pool size.
    pub fn recv_occupancy(&self) -> (u32, u32, u32) {
        let r = lock(&self.recv);
        (r.num_free(), r.num_posted(), r.size())
    }

    pub fn stats(&self) -> DataStatistics {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        DataStatistics {
            tx_packets: get(&c.tx_packets),
            tx_bytes: get(&c.tx_bytes),
            tx_errors: get(&c.tx_errors),
            tx_aborted: get(&c.tx_aborted),
            tx_exhausted: get(&c.tx_exhausted),
            rx_packets: get(&c.rx_packets),
            rx_bytes: get(&c.rx_bytes),
            rx_dropped: get(&c.rx_dropped),
            rx_errors: get(&c.rx_errors),
            kicks_sent: get(&c.kicks_sent),
            kicks_received: get(&c.kicks_received),
            free_updates: get(&c.free_updates),
        }
    }

    pub fn disconnect(&self) {
        self.stop();
        self.qp.disconnect();
        lock(&self.recv).reclaim_posted();
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("qp", &self.qp.qp_num())
            .field("stopped", &self.is_stopped())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BufferPoolEntry;
    use crate::protocol::trailer::{TRAILER_SIZE, frame_image};
    use crate::transport::loopback::LoopbackFabric;
    use crate::transport::{ConnectRequest, EventSink, MemoryRegion, TransportEvent};
    use crate::types::{Gid, MacAddress, ServiceId};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ENTRY: u32 = 256;

    struct Rig {
        fabric: LoopbackFabric,
        dc: DataChannel,
        host_events: mpsc::UnboundedReceiver<TransportEvent>,
        peer: Arc<dyn QueuePair>,
        peer_events: mpsc::UnboundedReceiver<TransportEvent>,
        /// Controller-side table the host pushes free entries into.
        peer_table: Arc<dyn MemoryRegion>,
        /// Controller-side buffers the host transmits into.
        peer_buffers: Arc<dyn MemoryRegion>,
    }

    fn params(count: u32, kick_entries: u32) -> PoolParams {
        PoolParams {
            entry_size: ENTRY,
            entry_count: count,
            kick_timeout_us: 100,
            kick_entries,
            kick_bytes: 0,
            free_per_update: 2,
        }
    }

    async fn rig(kick_entries: u32) -> Rig {
        let fabric = LoopbackFabric::new();
        let host_gid = Gid::new(0xfe80 << 48, 1);
        let ioc_gid = Gid::new(0xfe80 << 48, 2);
        let mut listener = fabric.listen(ioc_gid, ServiceId::data(0)).unwrap();
        let (htx, mut host_events) = mpsc::unbounded_channel();
        let qp = fabric
            .connect(
                ConnectRequest {
                    source_gid: host_gid,
                    dest_gid: ioc_gid,
                    service: ServiceId::data(0),
                    private_data: Vec::new(),
                },
                EventSink::channel(htx, |ev| ev),
            )
            .unwrap();
        let (ptx, peer_events) = mpsc::unbounded_channel();
        let peer = listener
            .accept()
            .await
            .unwrap()
            .accept(EventSink::channel(ptx, |ev| ev))
            .unwrap();
        assert_eq!(host_events.recv().await.unwrap(), TransportEvent::Connected);

        let cfg = DataConfig {
            xmit_buffers: 8,
            kick_recvs: 2,
            ..Default::default()
        };
        let dc = DataChannel::new(&fabric, qp, params(8, 16), params(4, kick_entries), &cfg).unwrap();
        let peer_table = fabric.register_memory(8 * POOL_ENTRY_SIZE).unwrap();
        let peer_buffers = fabric.register_memory(4 * ENTRY as usize).unwrap();
        dc.start(RemoteAddr {
            addr: peer_table.addr(),
            rkey: peer_table.rkey(),
        })
        .unwrap();
        Rig {
            fabric,
            dc,
            host_events,
            peer,
            peer_events,
            peer_table,
            peer_buffers,
        }
    }

    impl Rig {
        /// Controller advertises its buffer `index` in the host xmit table.
        fn offer(&self, index: u32) {
            let entry = BufferPoolEntry {
                addr: self.peer_buffers.addr() + (index * ENTRY) as u64,
                rkey: self.peer_buffers.rkey(),
                valid: true,
            };
            let scratch = self.fabric.register_memory(POOL_ENTRY_SIZE).unwrap();
            scratch.write(0, &entry.encode()).unwrap();
            let table = self.dc.xmit_table();
            self.peer
                .rdma_write(
                    0,
                    Sge {
                        region: scratch.as_ref(),
                        offset: 0,
                        len: POOL_ENTRY_SIZE,
                    },
                    RemoteAddr {
                        addr: table.addr + (index as usize * POOL_ENTRY_SIZE) as u64,
                        rkey: table.rkey,
                    },
                    false,
                )
                .unwrap();
        }

        fn host_free_entry(&self, index: usize) -> BufferPoolEntry {
            let mut raw = [0u8; POOL_ENTRY_SIZE];
            self.peer_table
                .read(index * POOL_ENTRY_SIZE, &mut raw)
                .unwrap();
            BufferPoolEntry::decode(&raw).unwrap()
        }

        /// Controller writes `payload` into the host buffer at `index`.
        fn deliver(&self, index: usize, payload: &[u8]) {
            let entry = self.host_free_entry(index);
            assert!(entry.valid);
            let image = frame_image(payload, &Trailer::for_frame(payload.len(), MacAddress::BROADCAST));
            let scratch = self.fabric.register_memory(image.len()).unwrap();
            scratch.write(0, &image).unwrap();
            self.peer
                .rdma_write(
                    0,
                    Sge {
                        region: scratch.as_ref(),
                        offset: 0,
                        len: image.len(),
                    },
                    RemoteAddr {
                        addr: entry.addr + (ENTRY as usize - image.len()) as u64,
                        rkey: entry.rkey,
                    },
                    false,
                )
                .unwrap();
        }
    }

    fn frame(id: FrameId, len: usize) -> TxFrame {
        let mut data = vec![0xabu8; len];
        data[..6].copy_from_slice(&[2, 0, 0, 0, 0, 9]);
        TxFrame::new(id, data)
    }

    #[tokio::test]
    async fn test_start_advertises_every_receive_buffer() {
        let r = rig(16).await;
        for i in 0..8 {
            assert!(r.host_free_entry(i).valid, "entry {i}");
        }
        assert_eq!(r.dc.recv_occupancy(), (0, 8, 8));
        assert_eq!(r.dc.stats().free_updates, 1);
    }

    #[tokio::test]
    async fn test_transmit_waits_for_controller_buffers() {
        let r = rig(16).await;
        let out = r.dc.transmit(frame(1, 60)).unwrap();
        assert_eq!(out, TransmitOutcome::BufferExhausted(frame(1, 60)));
        assert_eq!(r.dc.stats().tx_exhausted, 1);
        assert!(!r.dc.take_buffers_available().unwrap());
        r.offer(0);
        assert!(r.dc.take_buffers_available().unwrap());
        assert_eq!(r.dc.transmit(frame(1, 60)).unwrap(), TransmitOutcome::Queued);
    }

    #[tokio::test]
    async fn test_transmit_lands_at_end_of_controller_buffer() {
        let mut r = rig(16).await;
        r.offer(0);
        let mut f = frame(42, 100);
        f.vlan = Some(7);
        r.dc.transmit(f).unwrap();

        let mut raw = [0u8; TRAILER_SIZE];
        r.peer_buffers
            .read(ENTRY as usize - TRAILER_SIZE, &mut raw)
            .unwrap();
        let t = Trailer::decode(&raw).unwrap();
        assert!(t.is_valid());
        assert_eq!(t.data_length, 100);
        assert!(t.has_flag(pkt_flags::VLAN_INSERT));
        assert_eq!(t.vlan, 7);
        assert_eq!(t.dest_mac, MacAddress([2, 0, 0, 0, 0, 9]));
        let start = t.data_start(ENTRY as usize).unwrap();
        let mut data = vec![0u8; 100];
        r.peer_buffers.read(start, &mut data).unwrap();
        assert_eq!(&data[6..], &[0xab; 94][..]);

        let TransportEvent::WriteComplete { wr_id, status } = r.host_events.recv().await.unwrap() else {
            panic!("expected write completion");
        };
        assert_eq!(
            r.dc.on_write_complete(wr_id, status),
            WriteCompletion::Frame(42, SendStatus::Success)
        );
        assert_eq!(r.dc.stats().tx_packets, 1);
        assert_eq!(r.dc.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_kick_flag_on_threshold() {
        let r = rig(2).await;
        r.offer(0);
        r.offer(1);
        r.dc.transmit(frame(1, 60)).unwrap();
        r.dc.transmit(frame(2, 60)).unwrap();
        let read = |index: u32| {
            let mut raw = [0u8; TRAILER_SIZE];
            r.peer_buffers
                .read(((index + 1) * ENTRY) as usize - TRAILER_SIZE, &mut raw)
                .unwrap();
            Trailer::decode(&raw).unwrap()
        };
        assert!(!read(0).has_flag(pkt_flags::KICK));
        assert!(read(1).has_flag(pkt_flags::KICK));
        assert!(r.dc.kick_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_timer_sends_message() {
        let mut r = rig(16).await;
        r.peer.post_recv(99, 8).unwrap();
        r.offer(0);
        let wake = r.dc.wake();
        let armed = wake.notified();
        r.dc.transmit(frame(1, 60)).unwrap();
        armed.await;
        let deadline = r.dc.kick_deadline().unwrap();
        assert!(!r.dc.on_kick_timer(Instant::now()).unwrap());
        tokio::time::sleep_until(deadline).await;
        assert!(r.dc.on_kick_timer(Instant::now()).unwrap());
        assert!(!r.dc.on_kick_timer(Instant::now() + Duration::from_secs(1)).unwrap());
        assert_eq!(
            r.peer_events.recv().await.unwrap(),
            TransportEvent::RecvComplete {
                wr_id: 99,
                data: KICK_MESSAGE.to_vec()
            }
        );
        assert_eq!(r.dc.stats().kicks_sent, 1);
    }

    #[tokio::test]
    async fn test_receive_recycles_buffers() {
        let r = rig(16).await;
        r.dc.set_accepting(true);
        r.deliver(0, b"hello");
        r.deliver(1, b"world");
        let frames = r.dc.poll_receive().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), b"hello");
        assert_eq!(r.dc.recv_occupancy(), (0, 6, 8));
        drop(frames);
        // two released buffers make one bundle
        assert_eq!(r.dc.replenish().unwrap(), 2);
        assert_eq!(r.dc.recv_occupancy(), (0, 8, 8));
        let s = r.dc.stats();
        assert_eq!(s.rx_packets, 2);
        assert_eq!(s.rx_bytes, 10);
    }

    #[tokio::test]
    async fn test_receive_dropped_while_not_accepting() {
        let r = rig(16).await;
        r.deliver(0, b"early");
        assert!(r.dc.poll_receive().unwrap().is_empty());
        assert_eq!(r.dc.stats().rx_dropped, 1);
        let (free, posted, size) = r.dc.recv_occupancy();
        assert!(free + posted <= size);
        assert_eq!(free + posted, 8);
    }

    #[tokio::test]
    async fn test_kick_receive_is_reposted() {
        let mut r = rig(16).await;
        r.peer.post_send(1, &KICK_MESSAGE).unwrap();
        let TransportEvent::RecvComplete { wr_id, .. } = r.host_events.recv().await.unwrap() else {
            panic!("expected kick");
        };
        assert!(r.dc.on_recv_complete(wr_id).unwrap());
        assert_eq!(r.dc.stats().kicks_received, 1);
        // the reposted receive catches the next kick
        r.peer.post_send(2, &KICK_MESSAGE).unwrap();
        assert!(matches!(
            r.host_events.recv().await.unwrap(),
            TransportEvent::RecvComplete { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_rejects_transmit_and_reports_in_flight() {
        let r = rig(16).await;
        r.offer(0);
        assert!(matches!(
            r.dc.transmit(frame(1, 2000)),
            Err(VnicError::FrameTooLarge { .. })
        ));
        r.dc.transmit(frame(5, 60)).unwrap();
        r.dc.stop();
        assert!(matches!(r.dc.transmit(frame(6, 60)), Err(VnicError::NotConnected)));
        assert_eq!(r.dc.abort_in_flight(), vec![5]);
    }
}
