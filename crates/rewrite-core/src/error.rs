use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::kinds::{PhaseKind, StageKind};

/// Failures raised while driving one job through the pipeline.
///
/// Every variant is job-scoped: the batch driver records it against the job
/// and moves on to the next one.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("external tool failed: {command}: {stderr}")]
    ExternalToolFailure { command: String, stderr: String },
    #[error("external tool timed out after {timeout_secs}s: {command}")]
    ToolTimeout { command: String, timeout_secs: u64 },
    #[error(
        "stage '{stage}' failed validation after {attempts} attempts \
         (expected {expected} entries, found {found})"
    )]
    StageValidationFailure {
        stage: StageKind,
        attempts: u32,
        expected: usize,
        found: usize,
    },
    #[error("{phase} generation failed at trial {trial} after {attempts} attempts: {reason}")]
    TrialGenerationFailure {
        phase: PhaseKind,
        trial: usize,
        attempts: u32,
        reason: String,
    },
    #[error("artifact missing: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("artifact malformed: {}: {reason}", path.display())]
    ArtifactMalformed { path: PathBuf, reason: String },
    #[error("output already exists: {}", .0.display())]
    OutputConflict(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Conditions a retry loop may absorb. Nonzero tool exits never qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ToolTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = PipelineError::ToolTimeout {
            command: "replay".to_string(),
            timeout_secs: 5,
        };
        let exit = PipelineError::ExternalToolFailure {
            command: "replay".to_string(),
            stderr: "boom".to_string(),
        };
        assert!(timeout.is_retryable());
        assert!(!exit.is_retryable());
        assert!(!PipelineError::OutputConflict(PathBuf::from("/tmp/x")).is_retryable());
    }

    #[test]
    fn stage_failure_message_names_stage() {
        let err = PipelineError::StageValidationFailure {
            stage: StageKind::Heavy,
            attempts: 3,
            expected: 12,
            found: 11,
        };
        let msg = err.to_string();
        assert!(msg.contains("'heavy'"), "unexpected message: {}", msg);
        assert!(msg.contains("3 attempts"), "unexpected message: {}", msg);
    }
}
