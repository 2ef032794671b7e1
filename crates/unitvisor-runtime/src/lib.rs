use std::fmt;

use serde::{Deserialize, Serialize};

mod execution;

pub use execution::{
    DispatchRequest, ExecutionError, ExecutionEvent, ExecutionService, HandlerType,
};

pub type UnitId = String;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Installing,
    Updating,
    Running,
    Stopped,
    Crashed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Installing => "installing",
            UnitStatus::Updating => "updating",
            UnitStatus::Running => "running",
            UnitStatus::Stopped => "stopped",
            UnitStatus::Crashed => "crashed",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            UnitStatus::Installing => "Installing",
            UnitStatus::Updating => "Updating",
            UnitStatus::Running => "Running",
            UnitStatus::Stopped => "Stopped",
            UnitStatus::Crashed => "Crashed",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "installing" | "install" => Some(UnitStatus::Installing),
            "updating" | "update" => Some(UnitStatus::Updating),
            "running" | "started" => Some(UnitStatus::Running),
            "stopped" => Some(UnitStatus::Stopped),
            "crashed" => Some(UnitStatus::Crashed),
            _ => None,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    Start,
    Stop,
    Crash,
    Update,
}

impl StatusEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusEvent::Start => "start",
            StatusEvent::Stop => "stop",
            StatusEvent::Crash => "crash",
            StatusEvent::Update => "update",
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a running unit is being taken down.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Crash,
}

impl StopReason {
    pub fn event(self) -> StatusEvent {
        match self {
            StopReason::Stop => StatusEvent::Stop,
            StopReason::Crash => StatusEvent::Crash,
        }
    }
}

/// Context consulted by guarded transitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitionGuard {
    pub enabled: bool,
}

impl TransitionGuard {
    pub fn enabled(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot apply `{event}` to a unit that is {state}")]
    Invalid {
        state: UnitStatus,
        event: StatusEvent,
    },
    #[error("cannot apply `{event}` to a disabled unit")]
    Disabled { event: StatusEvent },
}

/// Applies `event` to `state`, reporting why the pair is rejected.
pub fn transition(
    state: UnitStatus,
    event: StatusEvent,
    guard: TransitionGuard,
) -> Result<UnitStatus, TransitionError> {
    use StatusEvent as E;
    use UnitStatus as S;

    let (target, guarded) = match (state, event) {
        (S::Installing | S::Updating | S::Stopped | S::Crashed, E::Start) => (S::Running, true),
        (S::Running, E::Stop) => (S::Stopped, false),
        (S::Running, E::Crash) => (S::Crashed, false),
        (S::Stopped | S::Crashed, E::Update) => (S::Updating, false),
        _ => return Err(TransitionError::Invalid { state, event }),
    };
    if guarded && !guard.enabled {
        return Err(TransitionError::Disabled { event });
    }
    Ok(target)
}

/// Pure transition table: `None` for any pair the table does not allow.
pub fn next(state: UnitStatus, event: StatusEvent, guard: TransitionGuard) -> Option<UnitStatus> {
    transition(state, event, guard).ok()
}

/// Interpreter bound to a single unit.
#[derive(Clone, Debug, Default)]
pub struct StatusMachine {
    state: UnitStatus,
}

impl StatusMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: UnitStatus) -> Self {
        Self { state }
    }

    pub fn state(&self) -> UnitStatus {
        self.state
    }

    pub fn send(
        &mut self,
        event: StatusEvent,
        guard: TransitionGuard,
    ) -> Result<UnitStatus, TransitionError> {
        let target = transition(self.state, event, guard)?;
        self.state = target;
        Ok(target)
    }

    /// Forces the interpreter to `state`, bypassing the table. Used when a
    /// prior record is restored wholesale.
    pub fn reset(&mut self, state: UnitStatus) {
        self.state = state;
    }
}
