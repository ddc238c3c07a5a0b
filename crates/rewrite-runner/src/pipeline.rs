//! Drives one job through every pipeline state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rewrite_core::{
    copy_dir, ensure_dir, CommandRunner, OpaqueDocument, PipelineError, ProcessRunner, StageKind,
    ToolCommand,
};
use tracing::info;

use crate::config::PipelineConfig;
use crate::job::{artifacts, Job};
use crate::ports::{PortAllocator, RandomPorts};
use crate::stage::{stage_inputs, StageRunner};
use crate::state::{JobState, JobStateGuard};
use crate::trials::{RootsCollector, SignatureCollector, TimingCollector, TrialLoop};

/// What a finished job went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: String,
    /// State detected when the job started; earlier states were skipped.
    pub resumed_from: JobState,
    pub elapsed_ms: u128,
}

pub struct Pipeline {
    config: PipelineConfig,
    runner: Arc<dyn CommandRunner>,
    ports: Arc<dyn PortAllocator>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn CommandRunner>,
        ports: Arc<dyn PortAllocator>,
    ) -> Self {
        Self {
            config,
            runner,
            ports,
        }
    }

    /// Real child processes and randomized ports, as configured.
    pub fn from_config(config: PipelineConfig) -> Self {
        let runner = Arc::new(ProcessRunner::new(config.tool_timeout()));
        let ports = Arc::new(RandomPorts::new(config.port_range, config.port_seed));
        Self::new(config, runner, ports)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `job` from its detected state to completion. The first failure
    /// stops the job and is recorded in its state file.
    pub fn run_job(&self, job: &Job) -> Result<JobReport, PipelineError> {
        let started = Instant::now();
        ensure_dir(&job.work_dir)?;
        let resumed_from = JobState::detect_job(job);
        info!(job = %job.id, state = %resumed_from, "starting job");

        let mut guard = JobStateGuard::start(job, resumed_from)?;
        match self.run_states(job, resumed_from, &mut guard) {
            Ok(()) => {
                guard.complete()?;
                let elapsed_ms = started.elapsed().as_millis();
                info!(job = %job.id, elapsed_ms, "job done");
                Ok(JobReport {
                    job_id: job.id.clone(),
                    resumed_from,
                    elapsed_ms,
                })
            }
            Err(err) => {
                guard.fail(&err);
                Err(err)
            }
        }
    }

    fn run_states(
        &self,
        job: &Job,
        from: JobState,
        guard: &mut JobStateGuard,
    ) -> Result<(), PipelineError> {
        for state in JobState::ORDER.into_iter().filter(|s| *s >= from) {
            if state != guard.state() {
                guard.advance(state)?;
            }
            self.run_state(job, state)?;
        }
        Ok(())
    }

    fn run_state(&self, job: &Job, state: JobState) -> Result<(), PipelineError> {
        let trials = TrialLoop::new(&self.config, self.runner.as_ref(), self.ports.as_ref());
        match state {
            JobState::Roots => {
                trials.run_trials(job, RootsCollector::default(), self.config.trial_count)?;
            }
            JobState::Timings => {
                trials.run_trials(
                    job,
                    TimingCollector::default(),
                    self.config.timing_trial_count,
                )?;
            }
            JobState::Signatures => {
                trials.run_trials(job, SignatureCollector::default(), self.config.trial_count)?;
            }
            JobState::FinalSignature => self.process_final_signature(job)?,
            JobState::Rewrite => {
                let stages = StageRunner::new(
                    self.runner.as_ref(),
                    &self.config.instrument_command,
                    self.config.tools_dir.as_deref(),
                    self.config.retry_policy(),
                );
                stages.run_stage(
                    StageKind::Rewrite,
                    job,
                    &stage_inputs(StageKind::Rewrite, job),
                )?;
            }
            JobState::CopyOutput => self.copy_output(job)?,
            JobState::Done => {}
        }
        Ok(())
    }

    fn process_final_signature(&self, job: &Job) -> Result<(), PipelineError> {
        let store = job.store();
        if store
            .read_valid::<OpaqueDocument>(artifacts::FINAL_SIGNATURE)
            .is_some()
        {
            return Ok(());
        }
        // A truncated file from an interrupted run; the tool must not find it.
        let target = store.path(artifacts::FINAL_SIGNATURE);
        if target.exists() {
            fs::remove_file(&target)?;
        }
        let inputs = [
            ("-r", artifacts::SUPER_ROOTS),
            ("-t", artifacts::TIMING),
            ("-s", artifacts::SUPER_SIGNATURE),
        ];
        let mut command = ToolCommand::from_parts(&self.config.postprocess_command);
        for (flag, name) in inputs {
            let path = store.path(name);
            if !path.is_file() {
                return Err(PipelineError::ArtifactMissing(path));
            }
            command = command.arg(flag).arg_path(&path);
        }
        let command = command
            .arg("-o")
            .arg_path(&store.path(artifacts::FINAL_SIGNATURE))
            .current_dir(self.config.tools_dir.as_deref());
        self.runner.run(&command)?;

        // The tool's own output is opaque, but it has to be there and parse.
        store.read::<OpaqueDocument>(artifacts::FINAL_SIGNATURE)?;
        info!(job = %job.id, "final signature generated");
        Ok(())
    }

    fn copy_output(&self, job: &Job) -> Result<(), PipelineError> {
        if job.output_dir.exists() {
            return Err(PipelineError::OutputConflict(job.output_dir.clone()));
        }
        let rewritten = job.stage_dir(StageKind::Rewrite);
        if !rewritten.is_dir() {
            return Err(PipelineError::ArtifactMissing(rewritten));
        }
        // Stage next to the destination so a failed copy never leaves a
        // partial output_dir that would read as a finished job.
        let staging = staging_dir(&job.output_dir);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        if let Err(err) = copy_dir(&rewritten, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err.into());
        }
        fs::rename(&staging, &job.output_dir)?;
        info!(job = %job.id, output = %job.output_dir.display(), "rewritten page copied");
        Ok(())
    }
}

fn staging_dir(output_dir: &Path) -> PathBuf {
    let name = output_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_dir.with_file_name(format!(".{}.partial", name))
}
