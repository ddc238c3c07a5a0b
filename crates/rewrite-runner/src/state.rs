use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rewrite_core::{atomic_write_json_pretty, ArtifactStore, OpaqueDocument, PipelineError, StageKind};
use serde::{Deserialize, Serialize};

use crate::job::{artifacts, Job};
use crate::trials::{PhaseCollector, RootsCollector, SignatureCollector, TimingCollector};

/// Position of a job in the pipeline. States run strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Roots,
    Timings,
    Signatures,
    FinalSignature,
    Rewrite,
    CopyOutput,
    Done,
}

impl JobState {
    pub const ORDER: [JobState; 7] = [
        JobState::Roots,
        JobState::Timings,
        JobState::Signatures,
        JobState::FinalSignature,
        JobState::Rewrite,
        JobState::CopyOutput,
        JobState::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Roots => "roots",
            JobState::Timings => "timings",
            JobState::Signatures => "signatures",
            JobState::FinalSignature => "final_signature",
            JobState::Rewrite => "rewrite",
            JobState::CopyOutput => "copy_output",
            JobState::Done => "done",
        }
    }

    /// Recompute the first state whose output is not yet in place.
    pub fn detect(work_dir: &Path, output_dir: &Path) -> JobState {
        let store = ArtifactStore::new(work_dir);
        Self::ORDER
            .into_iter()
            .find(|state| !state.is_complete(&store, output_dir))
            .unwrap_or(JobState::Done)
    }

    pub fn detect_job(job: &Job) -> JobState {
        Self::detect(&job.work_dir, &job.output_dir)
    }

    fn is_complete(self, store: &ArtifactStore, output_dir: &Path) -> bool {
        match self {
            JobState::Roots => RootsCollector::existing(store).is_some(),
            JobState::Timings => TimingCollector::existing(store).is_some(),
            JobState::Signatures => SignatureCollector::existing(store).is_some(),
            JobState::FinalSignature => store
                .read_valid::<OpaqueDocument>(artifacts::FINAL_SIGNATURE)
                .is_some(),
            JobState::Rewrite => store.root().join(StageKind::Rewrite.dir_name()).is_dir(),
            JobState::CopyOutput => output_dir.is_dir(),
            JobState::Done => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// Persisted as `job_state.json` in the job's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub schema_version: String,
    pub job_id: String,
    pub state: JobState,
    pub status: JobStatus,
    pub error: Option<String>,
    pub updated_at: String,
}

impl JobStateRecord {
    pub fn read(work_dir: &Path) -> Option<JobStateRecord> {
        let bytes = std::fs::read(work_dir.join(artifacts::JOB_STATE)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

fn write_job_state(
    work_dir: &Path,
    job_id: &str,
    state: JobState,
    status: JobStatus,
    error: Option<&str>,
) -> Result<(), PipelineError> {
    let record = JobStateRecord {
        schema_version: "job_state_v1".to_string(),
        job_id: job_id.to_string(),
        state,
        status,
        error: error.map(str::to_string),
        updated_at: Utc::now().to_rfc3339(),
    };
    atomic_write_json_pretty(&work_dir.join(artifacts::JOB_STATE), &record)?;
    Ok(())
}

/// Tracks the job's current state on disk. If dropped before `complete` or
/// `fail`, the record is left as failed.
pub struct JobStateGuard {
    work_dir: PathBuf,
    job_id: String,
    state: JobState,
    done: bool,
}

impl JobStateGuard {
    pub fn start(job: &Job, state: JobState) -> Result<Self, PipelineError> {
        write_job_state(&job.work_dir, &job.id, state, JobStatus::Running, None)?;
        Ok(Self {
            work_dir: job.work_dir.clone(),
            job_id: job.id.clone(),
            state,
            done: false,
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn advance(&mut self, state: JobState) -> Result<(), PipelineError> {
        self.state = state;
        write_job_state(&self.work_dir, &self.job_id, state, JobStatus::Running, None)
    }

    pub fn complete(mut self) -> Result<(), PipelineError> {
        self.done = true;
        write_job_state(
            &self.work_dir,
            &self.job_id,
            JobState::Done,
            JobStatus::Completed,
            None,
        )
    }

    pub fn fail(mut self, err: &PipelineError) {
        self.done = true;
        let message = err.to_string();
        if let Err(write_err) = write_job_state(
            &self.work_dir,
            &self.job_id,
            self.state,
            JobStatus::Failed,
            Some(&message),
        ) {
            tracing::warn!(job = %self.job_id, error = %write_err, "could not record job failure");
        }
    }
}

impl Drop for JobStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_job_state(
                &self.work_dir,
                &self.job_id,
                self.state,
                JobStatus::Failed,
                Some("aborted"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Sandbox;
    use rewrite_core::ensure_dir;
    use std::fs;

    #[test]
    fn fresh_job_starts_at_roots() {
        let sandbox = Sandbox::new("state_fresh");
        let job = sandbox.job("example.com", 1);
        assert_eq!(JobState::detect_job(&job), JobState::Roots);
    }

    #[test]
    fn detection_follows_artifact_presence() {
        let sandbox = Sandbox::new("state_detect");
        let job = sandbox.job("example.com", 1);
        fs::write(job.artifact(artifacts::SUPER_ROOTS), b"[\"a.js:1\"]").expect("roots");
        fs::write(job.artifact(artifacts::SUPER_CALL_GRAPH), b"{}").expect("graph");
        assert_eq!(JobState::detect_job(&job), JobState::Timings);

        fs::write(job.artifact(artifacts::TIMING), br#"{"type":"object","value":null}"#)
            .expect("timing");
        fs::write(job.artifact(artifacts::PLT_TIMING), b"{}").expect("plt");
        assert_eq!(
            JobState::detect_job(&job),
            JobState::Timings,
            "null timing value must not count as complete"
        );

        fs::write(job.artifact(artifacts::TIMING), br#"{"type":"object","value":{"a":1}}"#)
            .expect("timing");
        fs::write(
            job.artifact(artifacts::SUPER_SIGNATURE),
            br#"{"type":"object","value":{}}"#,
        )
        .expect("signature");
        fs::write(job.artifact(artifacts::FINAL_SIGNATURE), b"{}").expect("final");
        assert_eq!(JobState::detect_job(&job), JobState::Rewrite);

        ensure_dir(&job.stage_dir(StageKind::Rewrite)).expect("rewrite");
        assert_eq!(JobState::detect_job(&job), JobState::CopyOutput);
        ensure_dir(&job.output_dir).expect("output");
        assert_eq!(JobState::detect_job(&job), JobState::Done);
    }

    #[test]
    fn dropped_guard_records_failure() {
        let sandbox = Sandbox::new("state_guard");
        let job = sandbox.job("example.com", 1);
        {
            let mut guard = JobStateGuard::start(&job, JobState::Roots).expect("start");
            guard.advance(JobState::Signatures).expect("advance");
        }
        let record = JobStateRecord::read(&job.work_dir).expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.state, JobState::Signatures);
        assert_eq!(record.error.as_deref(), Some("aborted"));
    }

    #[test]
    fn failure_records_error_message() {
        let sandbox = Sandbox::new("state_fail");
        let job = sandbox.job("example.com", 1);
        let guard = JobStateGuard::start(&job, JobState::Rewrite).expect("start");
        guard.fail(&PipelineError::OutputConflict(job.output_dir.clone()));
        let record = JobStateRecord::read(&job.work_dir).expect("record");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("output already exists"));
    }
}
