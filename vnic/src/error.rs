use crate::protocol::Command;

pub type Result<T> = std::result::Result<T, VnicError>;

/// Coarse classification of a [`VnicError`], recorded when a viport fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource exhaustion or invalid state reported by the RDMA transport.
    Transport,
    /// The peer answered with something the protocol does not allow.
    Protocol,
    /// No answer within the configured timeout and retry budget.
    Timeout,
    /// The peer reported an error on its own initiative.
    Peer,
    /// The caller used an API in a state that does not allow it.
    Usage,
    /// Invalid local configuration.
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum VnicError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection rejected by peer: {reason}")]
    ConnectionRejected { reason: String },

    #[error("protocol version mismatch: local={local_major}.{local_minor}, remote={remote_major}.{remote_minor}")]
    VersionMismatch {
        local_major: u16,
        local_minor: u16,
        remote_major: u16,
        remote_minor: u16,
    },

    #[error("unexpected response: expected {expected:?}, got {actual:?}")]
    UnexpectedResponse { expected: Command, actual: Command },

    #[error("{name} = {value} out of range [{min}, {max}]")]
    ParameterOutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("protocol mismatch in {command:?}: {reason}")]
    ProtocolMismatch { command: Command, reason: String },

    #[error("invalid response to {command:?}: {reason}")]
    InvalidResponse { command: Command, reason: String },

    #[error("{command:?} timed out after {retries} retries")]
    Timeout { command: Command, retries: u32 },

    #[error("peer reported status {status} (fatal={fatal}): {description}")]
    PeerStatus {
        status: u32,
        fatal: bool,
        description: String,
    },

    #[error("peer returned an error packet for {command:?}")]
    PeerError { command: Command },

    #[error("a {outstanding:?} request is already outstanding")]
    RequestOutstanding { outstanding: Command },

    #[error("control channel has failed")]
    ChannelFailed,

    #[error("not connected")]
    NotConnected,

    #[error("no interface with id {0}")]
    UnknownInterface(u64),

    #[error("message decode failed: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("frame of {len} bytes exceeds the {max}-byte payload limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("shut down")]
    ShutDown,

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl VnicError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(_) | Self::ConnectionRejected { .. } | Self::LockPoisoned(_) => {
                ErrorClass::Transport
            }
            Self::VersionMismatch { .. }
            | Self::UnexpectedResponse { .. }
            | Self::ParameterOutOfRange { .. }
            | Self::ProtocolMismatch { .. }
            | Self::InvalidResponse { .. }
            | Self::Decode(_) => ErrorClass::Protocol,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::PeerStatus { .. } | Self::PeerError { .. } => ErrorClass::Peer,
            Self::RequestOutstanding { .. }
            | Self::ChannelFailed
            | Self::NotConnected
            | Self::UnknownInterface(_)
            | Self::FrameTooLarge { .. }
            | Self::ShutDown => ErrorClass::Usage,
            Self::Config(_) => ErrorClass::Config,
        }
    }
}
