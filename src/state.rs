use serde::{Deserialize, Serialize};

/// Lifecycle phase of a supervised process.
///
/// `Starting` and `Stopping` are transient: they only exist while the
/// supervisor holds its lifecycle lock, so concurrent observers see the
/// process move directly between the settled phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ProcessState::NotStarted => "not-started",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
        };
        write!(f, "{value}")
    }
}

impl ProcessState {
    /// A new start is accepted only from the settled non-running phases.
    pub fn accepts_start(&self) -> bool {
        matches!(self, ProcessState::NotStarted | ProcessState::Stopped)
    }
}

/// Point-in-time snapshot of one supervised process, taken under the
/// lifecycle lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    /// Identity of the current start-to-stop episode. Incremented on every
    /// start; background tasks bound to an older value are stale.
    pub epoch: u64,
    /// Milliseconds since activity was last recorded.
    pub idle_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::{ProcessState, SupervisorStatus};

    #[test]
    fn state_display_matches_wire_names() {
        assert_eq!(ProcessState::NotStarted.to_string(), "not-started");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn only_settled_phases_accept_start() {
        assert!(ProcessState::NotStarted.accepts_start());
        assert!(ProcessState::Stopped.accepts_start());
        assert!(!ProcessState::Starting.accepts_start());
        assert!(!ProcessState::Running.accepts_start());
        assert!(!ProcessState::Stopping.accepts_start());
    }

    #[test]
    fn status_round_trips_through_json() {
        let status = SupervisorStatus {
            state: ProcessState::Running,
            pid: Some(4321),
            port: Some(49152),
            epoch: 3,
            idle_ms: 250,
        };

        let encoded = serde_json::to_string(&status).expect("failed to encode status");
        assert!(
            encoded.contains("\"running\""),
            "expected snake_case state in {encoded}"
        );
        let decoded: SupervisorStatus =
            serde_json::from_str(&encoded).expect("failed to decode status");
        assert_eq!(decoded.state, ProcessState::Running);
        assert_eq!(decoded.pid, Some(4321));
        assert_eq!(decoded.port, Some(49152));
        assert_eq!(decoded.epoch, 3);
    }
}
