use std::fmt;

use crate::line_map::{CodePosition, SourcePosition};
use crate::types::ItemId;

/// Which of the three scheduler queues an operation targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    LoadUnload,
    Event,
    Checkpoint,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::LoadUnload => write!(f, "load/unload"),
            QueueKind::Event => write!(f, "event"),
            QueueKind::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{queue} queue is at its capacity of {capacity} items")]
    QueueSaturated { queue: QueueKind, capacity: usize },
    #[error("no script is registered for item {0}")]
    UnknownScript(ItemId),
    #[error("script {0} is being removed")]
    PendingRemoval(ItemId),
    #[error("object does not accept events right now")]
    EventsBlocked,
    #[error("scheduler has not been started")]
    NotStarted,
    #[error("scheduler has been shut down")]
    ShutDown,
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// A fault raised by script code while handling an event
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeFault {
    pub message: String,
    pub location: Option<CodePosition>,
}

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: CodePosition) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeFault {}

/// A fault together with the source line it maps back to, for reporting
#[derive(Debug, Clone, PartialEq)]
pub struct MappedFault {
    pub fault: RuntimeFault,
    pub source: Option<SourcePosition>,
}

impl fmt::Display for MappedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(pos) => write!(f, "{} (line {}, column {})", self.fault, pos.line, pos.column),
            None => write!(f, "{}", self.fault),
        }
    }
}

/// Result of one load or reupload attempt, retrievable once per attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled,
    Failed(Vec<String>),
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Compiled)
    }

    /// Error lines, empty on success
    pub fn errors(&self) -> &[String] {
        match self {
            CompileOutcome::Compiled => &[],
            CompileOutcome::Failed(errors) => errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturated_message_names_queue() {
        let err = SchedulerError::QueueSaturated {
            queue: QueueKind::Event,
            capacity: 300,
        };
        assert_eq!(err.to_string(), "event queue is at its capacity of 300 items");
    }

    #[test]
    fn test_mapped_fault_display() {
        let mapped = MappedFault {
            fault: RuntimeFault::new("unreachable executed"),
            source: Some(SourcePosition { line: 12, column: 4 }),
        };
        assert_eq!(mapped.to_string(), "unreachable executed (line 12, column 4)");
    }

    #[test]
    fn test_outcome_errors() {
        assert!(CompileOutcome::Compiled.errors().is_empty());
        let failed = CompileOutcome::Failed(vec!["bad token".into()]);
        assert!(!failed.is_success());
        assert_eq!(failed.errors(), ["bad token".to_string()]);
    }
}
