use std::fmt;

/// Errors raised by the simulation surface, the transport and the startup path.
///
/// Controllers never handle these themselves: a tick returns the error and the
/// scheduler logs it and retries on the next tick.
#[derive(Debug)]
pub enum ControlError {
    /// The simulation is not loaded or not running.
    SimulationUnavailable,
    /// A single simulation query or command failed.
    Simulation(String),
    /// The simulation does not know the referenced object.
    UnknownObject { kind: &'static str, id: String },
    /// Topology, route or settings input is malformed, or a controller references
    /// something the plan does not contain.
    Configuration(String),
    /// No path exists between the two edges.
    NoRoute { from: String, to: String },
    /// Sending or receiving a message failed.
    Transport(String),
    Io(std::io::Error),
    Json(serde_json::Error),
    Csv(csv::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn unknown(kind: &'static str, id: impl Into<String>) -> Self {
        ControlError::UnknownObject {
            kind,
            id: id.into(),
        }
    }

    /// Transient errors abandon the current tick only.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlError::SimulationUnavailable
                | ControlError::Simulation(_)
                | ControlError::UnknownObject { .. }
                | ControlError::Transport(_)
        )
    }

    /// Maps a missing object into a configuration error. Used at startup, where an
    /// unknown intersection means the plan is wrong rather than the vehicle left.
    pub fn into_configuration(self) -> Self {
        match self {
            ControlError::UnknownObject { kind, id } => {
                ControlError::Configuration(format!("unknown {kind} '{id}'"))
            }
            other => other,
        }
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::SimulationUnavailable => write!(f, "simulation is not available"),
            ControlError::Simulation(msg) => write!(f, "simulation call failed: {msg}"),
            ControlError::UnknownObject { kind, id } => write!(f, "unknown {kind} '{id}'"),
            ControlError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            ControlError::NoRoute { from, to } => write!(f, "no route from {from} to {to}"),
            ControlError::Transport(msg) => write!(f, "transport error: {msg}"),
            ControlError::Io(e) => write!(f, "I/O error: {e}"),
            ControlError::Json(e) => write!(f, "JSON error: {e}"),
            ControlError::Csv(e) => write!(f, "CSV error: {e}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Io(e) => Some(e),
            ControlError::Json(e) => Some(e),
            ControlError::Csv(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ControlError {
    fn from(e: std::io::Error) -> Self {
        ControlError::Io(e)
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Json(e)
    }
}

impl From<csv::Error> for ControlError {
    fn from(e: csv::Error) -> Self {
        ControlError::Csv(e)
    }
}

impl From<amiquip::Error> for ControlError {
    fn from(e: amiquip::Error) -> Self {
        ControlError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ControlError::SimulationUnavailable.is_transient());
        assert!(ControlError::Simulation("lane query".into()).is_transient());
        assert!(ControlError::unknown("vehicle", "veh1").is_transient());
        assert!(!ControlError::Configuration("bad".into()).is_transient());
        assert!(!ControlError::NoRoute {
            from: "E0".into(),
            to: "E9".into()
        }
        .is_transient());
    }

    #[test]
    fn unknown_intersection_becomes_configuration_error() {
        let err = ControlError::unknown("intersection", "J9").into_configuration();
        assert!(matches!(err, ControlError::Configuration(_)));
        assert_eq!(err.to_string(), "configuration error: unknown intersection 'J9'");
    }
}
