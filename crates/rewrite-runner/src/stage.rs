//! One instrumentation pass, validated and committed by rename.

use std::fs;
use std::path::{Path, PathBuf};

use rewrite_core::{
    count_entries, ensure_dir, AttemptError, CommandRunner, PipelineError, RetryError,
    RetryPolicy, StageKind, ToolCommand,
};
use tracing::info;

use crate::job::{artifacts, Job};

/// Extra input file handed to the instrumentation engine, e.g. `--cgInfo <path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInput {
    pub flag: &'static str,
    pub path: PathBuf,
}

/// Prior aggregate artifacts each stage consumes.
pub fn stage_inputs(stage: StageKind, job: &Job) -> Vec<StageInput> {
    let roots = StageInput {
        flag: "--cgInfo",
        path: job.artifact(artifacts::SUPER_ROOTS),
    };
    match stage {
        StageKind::Light => Vec::new(),
        StageKind::Timing | StageKind::Heavy => vec![roots],
        StageKind::Rewrite => vec![
            roots,
            StageInput {
                flag: "--callGraph",
                path: job.artifact(artifacts::SUPER_CALL_GRAPH),
            },
            StageInput {
                flag: "--signature",
                path: job.artifact(artifacts::FINAL_SIGNATURE),
            },
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    AlreadyCommitted,
    Committed { attempts: u32 },
}

pub struct StageRunner<'a> {
    runner: &'a dyn CommandRunner,
    instrument_command: &'a [String],
    tools_dir: Option<&'a Path>,
    retry: RetryPolicy,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        instrument_command: &'a [String],
        tools_dir: Option<&'a Path>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runner,
            instrument_command,
            tools_dir,
            retry,
        }
    }

    /// Instrument `job.input_dir` in `stage` mode and commit the result as
    /// `<work_dir>/<stage>`. A committed stage is never re-run.
    pub fn run_stage(
        &self,
        stage: StageKind,
        job: &Job,
        extra_inputs: &[StageInput],
    ) -> Result<StageOutcome, PipelineError> {
        let committed = job.stage_dir(stage);
        if committed.is_dir() {
            return Ok(StageOutcome::AlreadyCommitted);
        }
        for input in extra_inputs {
            if !input.path.is_file() {
                return Err(PipelineError::ArtifactMissing(input.path.clone()));
            }
        }
        ensure_dir(&job.work_dir)?;

        let expected = count_entries(&job.input_dir)?;
        let generated = job.generated_dir();
        let command = self.instrument_command(stage, job, extra_inputs);
        let label = format!("{} instrumentation of {}", stage, job.id);

        let mut found = 0;
        let result = self.retry.run(&label, |attempt| {
            if generated.exists() {
                fs::remove_dir_all(&generated)?;
            }
            tracing::debug!(job = %job.id, %stage, attempt, "instrumenting");
            let stdout = self.runner.run(&command)?;
            if !stdout.is_empty() {
                tracing::debug!(job = %job.id, %stage, output = %stdout, "instrumentation output");
            }
            found = count_entries(&generated)?;
            if found == expected {
                Ok(attempt)
            } else {
                Err(AttemptError::Retryable(format!(
                    "expected {} entries in {}, found {}",
                    expected,
                    generated.display(),
                    found
                )))
            }
        });

        match result {
            Ok(attempts) => {
                fs::rename(&generated, &committed)?;
                info!(job = %job.id, %stage, attempts, "stage committed");
                Ok(StageOutcome::Committed { attempts })
            }
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { attempts, .. }) => {
                Err(PipelineError::StageValidationFailure {
                    stage,
                    attempts,
                    expected,
                    found,
                })
            }
        }
    }

    fn instrument_command(
        &self,
        stage: StageKind,
        job: &Job,
        extra_inputs: &[StageInput],
    ) -> ToolCommand {
        let mut command = ToolCommand::from_parts(self.instrument_command);
        for input in extra_inputs {
            command = command.arg(input.flag).arg_path(&input.path);
        }
        command
            .arg_path(&job.input_dir)
            .arg_path(&job.work_dir)
            .arg(stage.mode_token())
            .arg_path(&job.log_dir(stage))
            .current_dir(self.tools_dir)
    }
}
