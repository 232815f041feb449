//! Error taxonomy for the reconciliation workflow
//!
//! Steps return typed results instead of letting errors cross step
//! boundaries unlabelled: the driver needs to know which step failed
//! so the failure record carries an accurate partial step list.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The six workflow steps plus the initial load, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Load,
    AccuracyAnalysis,
    LearningClassification,
    EntityKnowledgeUpdate,
    PairingMemoryUpdate,
    MemoryDecay,
    CompletionLogging,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Load => "load",
            StepName::AccuracyAnalysis => "accuracy_analysis",
            StepName::LearningClassification => "learning_classification",
            StepName::EntityKnowledgeUpdate => "entity_knowledge_update",
            StepName::PairingMemoryUpdate => "pairing_memory_update",
            StepName::MemoryDecay => "memory_decay",
            StepName::CompletionLogging => "completion_logging",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a workflow run did not complete.
///
/// Retry exhaustion is deliberately absent: the monitor surfaces parked
/// events through `status()`, it never throws for them.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The event outcome or its forecasts are absent. Raised before
    /// step 1 runs; nothing has been mutated yet.
    #[error("event {event_id}: missing {what}")]
    DataMissing { event_id: String, what: String },

    /// A step's own computation failed (unknown category, malformed
    /// payload, arithmetic on absent scores).
    #[error("step {step} failed: {source}")]
    Step {
        step: StepName,
        #[source]
        source: anyhow::Error,
    },

    /// An adapter write or read failed inside a step.
    #[error("persistence failed in step {step}: {source}")]
    Persistence {
        step: StepName,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkflowError {
    /// The step this error aborted the run in.
    pub fn failed_step(&self) -> StepName {
        match self {
            WorkflowError::DataMissing { .. } => StepName::Load,
            WorkflowError::Step { step, .. } => *step,
            WorkflowError::Persistence { step, .. } => *step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name_display() {
        assert_eq!(StepName::AccuracyAnalysis.to_string(), "accuracy_analysis");
        assert_eq!(StepName::MemoryDecay.as_str(), "memory_decay");
    }

    #[test]
    fn test_failed_step_mapping() {
        let err = WorkflowError::DataMissing {
            event_id: "evt-1".into(),
            what: "forecasts".into(),
        };
        assert_eq!(err.failed_step(), StepName::Load);

        let err = WorkflowError::Step {
            step: StepName::PairingMemoryUpdate,
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.failed_step(), StepName::PairingMemoryUpdate);
    }
}
