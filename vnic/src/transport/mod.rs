//! RDMA transport capability surface.
//!
//! The engine never talks to hardware directly. It registers memory, opens
//! reliable-connected queue pairs through the connection manager and posts
//! work requests through these traits; completions and connection events come
//! back through an [`EventSink`]. [`loopback`] implements the surface in
//! memory.

pub mod loopback;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Gid, ServiceId};

/// A registered memory region the peer may target with RDMA writes.
pub trait MemoryRegion: Send + Sync {
    /// Address the peer uses to target this region.
    fn addr(&self) -> u64;
    fn rkey(&self) -> u32;
    fn len(&self) -> usize;
    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()>;
    fn write(&self, offset: usize, src: &[u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local scatter-gather element: `len` bytes at `offset` of `region`.
#[derive(Clone, Copy)]
pub struct Sge<'a> {
    pub region: &'a dyn MemoryRegion,
    pub offset: usize,
    pub len: usize,
}

impl fmt::Debug for Sge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sge")
            .field("rkey", &self.region.rkey())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Remote target of an RDMA write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: u32,
}

/// A reliable-connected queue pair.
pub trait QueuePair: Send + Sync {
    fn qp_num(&self) -> u32;
    /// Send a message; the peer must have a receive posted (or will when it
    /// posts one).
    fn post_send(&self, wr_id: u64, data: &[u8]) -> Result<()>;
    /// Post a receive of up to `capacity` bytes.
    fn post_recv(&self, wr_id: u64, capacity: usize) -> Result<()>;
    /// Copy `local` into the peer's memory. A [`TransportEvent::WriteComplete`]
    /// follows only when `signaled` is set.
    fn rdma_write(&self, wr_id: u64, local: Sge<'_>, remote: RemoteAddr, signaled: bool)
    -> Result<()>;
    /// Tear the connection down; the peer sees [`TransportEvent::Disconnected`].
    fn disconnect(&self);
}

/// Connection-manager request issued by the active side.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub source_gid: Gid,
    pub dest_gid: Gid,
    pub service: ServiceId,
    pub private_data: Vec<u8>,
}

/// Completion status of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Flushed,
    RemoteAccessError,
    Error,
}

/// Asynchronous events delivered for a queue pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Rejected { reason: String },
    Disconnected,
    SendComplete {
        wr_id: u64,
        status: CompletionStatus,
    },
    RecvComplete {
        wr_id: u64,
        data: Vec<u8>,
    },
    WriteComplete {
        wr_id: u64,
        status: CompletionStatus,
    },
}

/// Where a queue pair delivers its [`TransportEvent`]s.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

impl EventSink {
    pub fn new(deliver: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Forward events into a channel, wrapping each one with `wrap`.
    pub fn channel<T: Send + 'static>(
        tx: mpsc::UnboundedSender<T>,
        wrap: impl Fn(TransportEvent) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |ev| {
            // receiver gone means the owner is shutting down
            let _ = tx.send(wrap(ev));
        })
    }

    pub fn deliver(&self, event: TransportEvent) {
        (self.deliver)(event)
    }
}

/// The transport operations the engine depends on.
pub trait Transport: Send + Sync + 'static {
    /// Register a zeroed region of `len` bytes for local and remote access.
    fn register_memory(&self, len: usize) -> Result<Arc<dyn MemoryRegion>>;

    /// Start connecting to `request.dest_gid`. The outcome arrives on
    /// `events` as [`TransportEvent::Connected`] or
    /// [`TransportEvent::Rejected`].
    fn connect(&self, request: ConnectRequest, events: EventSink) -> Result<Arc<dyn QueuePair>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_wraps_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::channel(tx, |ev| (7u8, ev));
        sink.deliver(TransportEvent::Connected);
        assert_eq!(rx.recv().await.unwrap(), (7, TransportEvent::Connected));
    }

    #[test]
    fn test_sink_survives_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel::<TransportEvent>();
        drop(rx);
        EventSink::channel(tx, |ev| ev).deliver(TransportEvent::Disconnected);
    }
}
