//! Saga and step status state machines.

use serde::{Deserialize, Serialize};

/// The status of a saga run.
///
/// State transitions:
/// ```text
/// Started ──┬──► Completed
///           ├──► Cancelled
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// Compensated | Failed ──(retry)──► Started
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps are being executed in order.
    #[default]
    Started,

    /// A step failed irrecoverably; completed steps are being undone.
    Compensating,

    /// Every step completed (terminal).
    Completed,

    /// Every completed step was undone (terminal).
    Compensated,

    /// A compensation could not be confirmed; needs an operator (terminal).
    Failed,

    /// Aborted by a caller before completion (terminal).
    Cancelled,
}

impl SagaStatus {
    /// Returns true if a caller may cancel the saga.
    pub fn can_cancel(&self) -> bool {
        matches!(self, SagaStatus::Started)
    }

    /// Returns true if an operator may restart the saga from step 0.
    pub fn can_retry(&self) -> bool {
        matches!(self, SagaStatus::Failed | SagaStatus::Compensated)
    }

    /// Returns true if compensation may begin.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Started)
    }

    /// Returns true if no further transition happens without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Compensated
                | SagaStatus::Failed
                | SagaStatus::Cancelled
        )
    }

    /// Returns true if the saga still has work for a driver loop.
    pub fn is_active(&self) -> bool {
        matches!(self, SagaStatus::Started | SagaStatus::Compensating)
    }

    /// Returns the status name as stored and reported.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "started",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensated => "compensated",
            SagaStatus::Failed => "failed",
            SagaStatus::Cancelled => "cancelled",
        }
    }

    /// Parses a status name produced by [`SagaStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(SagaStatus::Started),
            "compensating" => Some(SagaStatus::Compensating),
            "completed" => Some(SagaStatus::Completed),
            "compensated" => Some(SagaStatus::Compensated),
            "failed" => Some(SagaStatus::Failed),
            "cancelled" => Some(SagaStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of a single step within a saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// The forward effect completed and was later undone.
    Compensated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SagaStatus; 6] = [
        SagaStatus::Started,
        SagaStatus::Compensating,
        SagaStatus::Completed,
        SagaStatus::Compensated,
        SagaStatus::Failed,
        SagaStatus::Cancelled,
    ];

    #[test]
    fn test_default_status_is_started() {
        assert_eq!(SagaStatus::default(), SagaStatus::Started);
        assert_eq!(StepStatus::default(), StepStatus::Pending);
    }

    #[test]
    fn test_can_cancel_only_while_started() {
        for status in ALL {
            assert_eq!(status.can_cancel(), status == SagaStatus::Started, "{status}");
        }
    }

    #[test]
    fn test_can_retry() {
        assert!(SagaStatus::Failed.can_retry());
        assert!(SagaStatus::Compensated.can_retry());
        assert!(!SagaStatus::Started.can_retry());
        assert!(!SagaStatus::Compensating.can_retry());
        assert!(!SagaStatus::Completed.can_retry());
        assert!(!SagaStatus::Cancelled.can_retry());
    }

    #[test]
    fn test_terminal_and_active_are_disjoint() {
        for status in ALL {
            assert_ne!(status.is_terminal(), status.is_active(), "{status}");
        }
    }

    #[test]
    fn test_parse_round_trips_as_str() {
        for status in ALL {
            assert_eq!(SagaStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SagaStatus::parse("running"), None);
    }

    #[test]
    fn test_serialization_uses_snake_case() {
        let json = serde_json::to_string(&SagaStatus::Compensating).unwrap();
        assert_eq!(json, "\"compensating\"");
        let step: StepStatus = serde_json::from_str("\"compensated\"").unwrap();
        assert_eq!(step, StepStatus::Compensated);
    }
}
