//! Control channel: the single-outstanding request/response protocol used to
//! negotiate and configure a viport.
//!
//! [`ControlChannel`] does no I/O. The viport task hands it received packets
//! and the current time, and posts the packets it returns. Keeping it owned
//! by that one task means a second request can never overwrite the one in
//! flight; [`ControlChannel::send_request`] rejects it instead.

pub mod address;
pub mod params;

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ControlConfig;
use crate::error::{Result, VnicError};
use crate::protocol::{
    Command, ControlBody, ControlMessage, ControlRequest, ControlResponse, StatusReport, status,
};

/// Outcome of [`ControlChannel::poll_response`].
#[derive(Debug)]
pub enum ResponsePoll {
    /// The response to the outstanding request arrived and matched.
    Ready(ControlResponse),
    /// Still waiting; nothing to do before [`ControlChannel::deadline`].
    Pending,
    /// The timeout elapsed; post this packet again.
    Retransmit(Vec<u8>),
    /// No request is outstanding.
    Idle,
}

#[derive(Debug)]
struct Outstanding {
    request: ControlRequest,
    sequence: u8,
    retries: u32,
    deadline: Instant,
}

/// Counters kept by the channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStats {
    pub requests: u64,
    pub retransmits: u64,
    pub responses: u64,
    /// Responses dropped because their sequence matched no outstanding request.
    pub stale_responses: u64,
    pub notifications: u64,
}

#[derive(Debug)]
pub struct ControlChannel {
    timeout: Duration,
    max_retries: u32,
    sequence: u8,
    last_completed: Option<u8>,
    outstanding: Option<Outstanding>,
    response: Option<ControlResponse>,
    notifications: VecDeque<StatusReport>,
    failed: bool,
    stats: ControlStats,
}

fn is_known_status(code: u32) -> bool {
    (status::LINK_UP..=status::IOC_ERROR).contains(&code)
}

fn is_fatal_status(code: u32) -> bool {
    matches!(
        code,
        status::IOC_SHUTDOWN | status::CONTROL_ERROR | status::IOC_ERROR
    )
}

impl ControlChannel {
    pub fn new(cfg: &ControlConfig) -> Self {
        Self {
            timeout: cfg.response_timeout,
            max_retries: cfg.max_retries,
            sequence: 0,
            last_completed: None,
            outstanding: None,
            response: None,
            notifications: VecDeque::new(),
            failed: false,
            stats: ControlStats::default(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Command of the request awaiting a response, if any.
    pub fn outstanding(&self) -> Option<Command> {
        self.outstanding.as_ref().map(|o| o.request.command())
    }

    /// When the outstanding request must be retransmitted or given up.
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|o| o.deadline)
    }

    pub fn stats(&self) -> ControlStats {
        self.stats
    }

    fn fail(&mut self, err: VnicError) -> VnicError {
        if !self.failed {
            tracing::warn!(error = %err, "control channel failed");
        }
        self.failed = true;
        self.outstanding = None;
        self.response = None;
        err
    }

    /// Encode `request` for transmission. Fails fast, leaving the in-flight
    /// request untouched, if one is already outstanding or unconsumed.
    pub fn send_request(&mut self, request: ControlRequest, now: Instant) -> Result<Vec<u8>> {
        if self.failed {
            return Err(VnicError::ChannelFailed);
        }
        if let Some(o) = &self.outstanding {
            return Err(VnicError::RequestOutstanding {
                outstanding: o.request.command(),
            });
        }
        if let Some(rsp) = &self.response {
            return Err(VnicError::RequestOutstanding {
                outstanding: rsp.command(),
            });
        }
        self.sequence = self.sequence.wrapping_add(1);
        let packet = ControlMessage::request(request.clone(), self.sequence, 0).encode();
        tracing::debug!(command = ?request.command(), seq = self.sequence, "control request");
        self.outstanding = Some(Outstanding {
            request,
            sequence: self.sequence,
            retries: 0,
            deadline: now + self.timeout,
        });
        self.stats.requests += 1;
        Ok(packet)
    }

    /// Process one received packet. Any error returned has already failed
    /// the channel.
    pub fn handle_receive(&mut self, buf: &[u8]) -> Result<()> {
        if self.failed {
            return Err(VnicError::ChannelFailed);
        }
        let msg = match ControlMessage::decode(buf) {
            Ok(msg) => msg,
            Err(e) => return Err(self.fail(e)),
        };
        match msg.body {
            ControlBody::Info(report) => {
                self.stats.notifications += 1;
                if report.fatal || is_fatal_status(report.status) || !is_known_status(report.status)
                {
                    return Err(self.fail(VnicError::PeerStatus {
                        status: report.status,
                        fatal: true,
                        description: report.description,
                    }));
                }
                self.notifications.push_back(report);
                Ok(())
            }
            ControlBody::Error => Err(self.fail(VnicError::PeerError {
                command: msg.header.command,
            })),
            ControlBody::Request(req) => Err(self.fail(VnicError::ProtocolMismatch {
                command: req.command(),
                reason: "request received from controller".into(),
            })),
            ControlBody::Response(rsp) => {
                let seq = msg.header.sequence;
                let Some(o) = self.outstanding.as_ref().filter(|o| o.sequence == seq) else {
                    // late copy of an answered request, or a reply to a
                    // sequence this side never sent
                    tracing::debug!(
                        command = ?rsp.command(),
                        seq,
                        outstanding_seq = self.outstanding.as_ref().map(|o| o.sequence),
                        duplicate = self.last_completed == Some(seq),
                        "dropping stale control response"
                    );
                    self.stats.stale_responses += 1;
                    return Ok(());
                };
                let expected = o.request.command();
                if rsp.command() != expected {
                    return Err(self.fail(VnicError::UnexpectedResponse {
                        expected,
                        actual: rsp.command(),
                    }));
                }
                self.outstanding = None;
                self.last_completed = Some(seq);
                self.stats.responses += 1;
                self.response = Some(rsp);
                Ok(())
            }
        }
    }

    /// Collect the response, retransmit on timeout, or give up once the
    /// retry limit is spent.
    pub fn poll_response(&mut self, now: Instant) -> Result<ResponsePoll> {
        if self.failed {
            return Err(VnicError::ChannelFailed);
        }
        if let Some(rsp) = self.response.take() {
            return Ok(ResponsePoll::Ready(rsp));
        }
        let Some(o) = self.outstanding.as_mut() else {
            return Ok(ResponsePoll::Idle);
        };
        if now < o.deadline {
            return Ok(ResponsePoll::Pending);
        }
        let command = o.request.command();
        if o.retries >= self.max_retries {
            let retries = o.retries;
            return Err(self.fail(VnicError::Timeout { command, retries }));
        }
        o.retries += 1;
        o.deadline = now + self.timeout;
        tracing::warn!(command = ?command, seq = o.sequence, retry = o.retries, "control request timed out, retransmitting");
        let retry = u8::try_from(o.retries).unwrap_or(u8::MAX);
        let packet = ControlMessage::request(o.request.clone(), o.sequence, retry).encode();
        self.stats.retransmits += 1;
        Ok(ResponsePoll::Retransmit(packet))
    }

    /// Next queued non-fatal status notification.
    pub fn take_notification(&mut self) -> Option<StatusReport> {
        self.notifications.pop_front()
    }
}
