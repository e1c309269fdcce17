//! Viport bring-up and steady-state transitions as a total function.
//!
//! [`Machine::step`] maps the current state and one input to the next state
//! and the side effects the drain task must carry out. It performs no I/O,
//! so every transition can be checked in isolation.

use std::fmt;

use crate::protocol::Command;

/// Externally visible viport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViportState {
    Uninitialized,
    ControlConnect,
    NegotiateCapabilities,
    ConfigureDataPath,
    DataConnect,
    ExchangePools,
    /// Data path running; initial link and address configuration pending.
    Initialized,
    Connected,
    Failed,
    Disconnected,
}

impl ViportState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, ViportState::Failed | ViportState::Disconnected)
    }

    /// Whether the data channel has been started.
    pub const fn is_running(self) -> bool {
        matches!(self, ViportState::Initialized | ViportState::Connected)
    }
}

impl fmt::Display for ViportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViportState::Uninitialized => "uninitialized",
            ViportState::ControlConnect => "control-connect",
            ViportState::NegotiateCapabilities => "negotiate-capabilities",
            ViportState::ConfigureDataPath => "configure-data-path",
            ViportState::DataConnect => "data-connect",
            ViportState::ExchangePools => "exchange-pools",
            ViportState::Initialized => "initialized",
            ViportState::Connected => "connected",
            ViportState::Failed => "failed",
            ViportState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Start,
    ControlConnected,
    DataConnected,
    /// A validated response to the outstanding request arrived.
    Response(Command),
    /// Pending work wants to send this request.
    Issue(Command),
    /// No work is pending and nothing is in flight.
    Idle,
    Failure,
    Shutdown,
}

/// Why a viport is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    Failed,
    Shutdown,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ConnectControl,
    SendRequest(Command),
    ConnectData,
    StartDataPath,
    AnnounceUp,
    /// The request could not be issued now; keep it pending.
    Defer(Command),
    TearDown(TeardownReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    state: ViportState,
    in_flight: Option<Command>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub const fn new() -> Self {
        Self {
            state: ViportState::Uninitialized,
            in_flight: None,
        }
    }

    pub const fn state(&self) -> ViportState {
        self.state
    }

    /// Request awaiting its response, during bring-up or after.
    pub const fn in_flight(&self) -> Option<Command> {
        self.in_flight
    }

    /// Whether steady-state work may be issued now.
    pub const fn can_issue(&self) -> bool {
        self.state.is_running() && self.in_flight.is_none()
    }

    fn to(state: ViportState, in_flight: Option<Command>, effects: Vec<Effect>) -> (Self, Vec<Effect>) {
        (Self { state, in_flight }, effects)
    }

    fn send(state: ViportState, cmd: Command) -> (Self, Vec<Effect>) {
        Self::to(state, Some(cmd), vec![Effect::SendRequest(cmd)])
    }

    fn fail(self) -> (Self, Vec<Effect>) {
        Self::to(
            ViportState::Failed,
            None,
            vec![Effect::TearDown(TeardownReason::Failed)],
        )
    }

    pub fn step(self, input: Input) -> (Self, Vec<Effect>) {
        use ViportState as S;

        if self.state.is_terminal() {
            return (self, Vec::new());
        }
        match (self.state, input) {
            (_, Input::Failure) => self.fail(),
            (_, Input::Shutdown) => Self::to(
                S::Disconnected,
                None,
                vec![Effect::TearDown(TeardownReason::Shutdown)],
            ),

            (S::Uninitialized, Input::Start) => {
                Self::to(S::ControlConnect, None, vec![Effect::ConnectControl])
            }
            (S::ControlConnect, Input::ControlConnected) => {
                Self::send(S::NegotiateCapabilities, Command::InitVnic)
            }
            (S::NegotiateCapabilities, Input::Response(Command::InitVnic))
                if self.in_flight == Some(Command::InitVnic) =>
            {
                Self::send(S::ConfigureDataPath, Command::ConfigDataPath)
            }
            (S::ConfigureDataPath, Input::Response(Command::ConfigDataPath))
                if self.in_flight == Some(Command::ConfigDataPath) =>
            {
                Self::to(S::DataConnect, None, vec![Effect::ConnectData])
            }
            (S::DataConnect, Input::DataConnected) => {
                Self::send(S::ExchangePools, Command::ExchangePools)
            }
            (S::ExchangePools, Input::Response(Command::ExchangePools))
                if self.in_flight == Some(Command::ExchangePools) =>
            {
                Self::to(S::Initialized, None, vec![Effect::StartDataPath])
            }

            // work raised during bring-up waits for it to finish
            (s, Input::Issue(cmd)) if !s.is_running() || self.in_flight.is_some() => {
                (self, vec![Effect::Defer(cmd)])
            }
            (s, Input::Issue(cmd)) => Self::send(s, cmd),

            (s, Input::Response(cmd)) if s.is_running() && self.in_flight == Some(cmd) => {
                if cmd == Command::Reset {
                    return Self::to(
                        S::Disconnected,
                        None,
                        vec![Effect::TearDown(TeardownReason::Reset)],
                    );
                }
                Self::to(s, None, Vec::new())
            }

            (S::Initialized, Input::Idle) if self.in_flight.is_none() => {
                Self::to(S::Connected, None, vec![Effect::AnnounceUp])
            }
            (_, Input::Idle) => (self, Vec::new()),

            _ => self.fail(),
        }
    }
}
