//! The network-stack side of an adapter.

use tokio::sync::mpsc;

use crate::data::ReceivedFrame;
use crate::types::{FrameId, LinkIndication, SendStatus};

/// Receives what an adapter reports upward. Calls come from the adapter's
/// event task and must not block.
pub trait UpstreamSink: Send + Sync + 'static {
    /// Carrier or MTU changed. `up == false` means carrier loss.
    fn link_changed(&self, link: LinkIndication);
    /// Frames received on the current netpath. Dropping a frame releases
    /// its receive buffer.
    fn receive(&self, frames: Vec<ReceivedFrame>);
    fn send_complete(&self, id: FrameId, status: SendStatus);
    /// Transmit buffers are available again after an exhaustion.
    fn transmit_resumed(&self);
}

/// One upstream notification, as delivered by [`ChannelSink`].
#[derive(Debug)]
pub enum UpstreamEvent {
    Link(LinkIndication),
    Receive(Vec<ReceivedFrame>),
    SendComplete(FrameId, SendStatus),
    TransmitResumed,
}

/// Forwards upstream notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, ev: UpstreamEvent) {
        let _ = self.tx.send(ev);
    }
}

impl UpstreamSink for ChannelSink {
    fn link_changed(&self, link: LinkIndication) {
        self.send(UpstreamEvent::Link(link));
    }

    fn receive(&self, frames: Vec<ReceivedFrame>) {
        self.send(UpstreamEvent::Receive(frames));
    }

    fn send_complete(&self, id: FrameId, status: SendStatus) {
        self.send(UpstreamEvent::SendComplete(id, status));
    }

    fn transmit_resumed(&self) {
        self.send(UpstreamEvent::TransmitResumed);
    }
}
