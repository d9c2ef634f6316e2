//! Session controller state management

/// Session controller state machine
///
/// State transitions are validated so the controller never skips a phase.
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No stream has been requested yet
    Uninitialized,

    /// Stream created, waiting for the backend to report ready
    Starting,

    /// Backend accepts frames
    Ready,

    /// Latency above the configured budget
    Degraded,

    /// No frame accepted within the staleness window
    Stale,

    /// A non-recoverable error was recorded for the current generation
    Erroring,

    /// Tearing down the generation and waiting out the backoff
    Restarting,

    /// Stream torn down, no further operations accepted
    Stopped,
}

impl ControllerState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &ControllerState) -> bool {
        use ControllerState::*;

        match (self, target) {
            // From Stopped - no transitions allowed
            (Stopped, _) => false,

            // Every live state can be stopped
            (_, Stopped) => true,

            (Uninitialized, Starting) => true,

            (Starting, Ready) => true,
            (Starting, Erroring) => true,
            (Starting, Restarting) => true, // ready handshake timed out

            (Ready, Degraded) | (Ready, Stale) => true,
            (Degraded, Ready) | (Stale, Ready) => true,
            (Degraded, Stale) | (Stale, Degraded) => true,

            (Ready | Degraded | Stale, Erroring) => true,
            (Ready | Degraded | Stale, Restarting) => true,

            (Erroring, Restarting) => true,
            (Restarting, Starting) => true,
            (Restarting, Erroring) => true, // restart attempt failed

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            ControllerState::Uninitialized => "Uninitialized",
            ControllerState::Starting => "Starting",
            ControllerState::Ready => "Ready",
            ControllerState::Degraded => "Degraded",
            ControllerState::Stale => "Stale",
            ControllerState::Erroring => "Erroring",
            ControllerState::Restarting => "Restarting",
            ControllerState::Stopped => "Stopped",
        }
    }

    /// Whether the backend currently accepts frames
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            ControllerState::Ready | ControllerState::Degraded | ControllerState::Stale
        )
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ControllerState::Stopped)
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
