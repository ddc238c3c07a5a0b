//! Job discovery and the per-batch driver loop.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::job::{Job, WORK_DIR_NAME};
use crate::pipeline::Pipeline;
use crate::state::{JobState, JobStateRecord, JobStatus};

/// Page identifiers to process, one per line. Blank lines and `#` comments
/// are ignored.
pub fn read_allow_list(path: &Path) -> Result<BTreeSet<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read filter {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Jobs selected from `input_root`, in name order.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub jobs: Vec<Job>,
    /// Capture directories left out by the allow-list.
    pub filtered_out: usize,
}

pub fn discover_jobs(
    input_root: &Path,
    output_root: &Path,
    allow_list: Option<&BTreeSet<String>>,
) -> Result<Discovery> {
    if !input_root.is_dir() {
        return Err(anyhow!("input root is not a directory: {}", input_root.display()));
    }
    let allow_list = allow_list.filter(|list| {
        if list.is_empty() {
            warn!("filter is empty; processing every capture");
        }
        !list.is_empty()
    });

    let mut names = Vec::new();
    for entry in fs::read_dir(input_root)
        .with_context(|| format!("failed to list {}", input_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();

    let mut discovery = Discovery::default();
    for name in names {
        if allow_list.is_some_and(|list| !list.contains(&name)) {
            discovery.filtered_out += 1;
            continue;
        }
        discovery.jobs.push(Job::new(&name, input_root, output_root));
    }
    Ok(discovery)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { resumed_from: JobState },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub jobs: Vec<JobSummary>,
    pub skipped: usize,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| matches!(j.outcome, JobOutcome::Completed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.len() - self.completed()
    }
}

/// Run every discovered job. Failures are recorded per job and never stop
/// the batch.
pub fn run_batch(pipeline: &Pipeline, discovery: Discovery) -> BatchReport {
    let Discovery { jobs, filtered_out } = discovery;
    let workers = pipeline.config().jobs.clamp(1, jobs.len().max(1));
    info!(jobs = jobs.len(), skipped = filtered_out, workers, "starting batch");

    let cursor = AtomicUsize::new(0);
    let results: Mutex<Vec<(usize, JobSummary)>> = Mutex::new(Vec::with_capacity(jobs.len()));
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(job) = jobs.get(index) else {
                    break;
                };
                let summary = run_one(pipeline, job);
                let mut results = match results.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                results.push((index, summary));
            });
        }
    });

    let mut results = match results.into_inner() {
        Ok(results) => results,
        Err(poisoned) => poisoned.into_inner(),
    };
    results.sort_by_key(|(index, _)| *index);
    let report = BatchReport {
        jobs: results.into_iter().map(|(_, summary)| summary).collect(),
        skipped: filtered_out,
    };
    info!(
        completed = report.completed(),
        failed = report.failed(),
        skipped = report.skipped,
        "batch finished"
    );
    report
}

fn run_one(pipeline: &Pipeline, job: &Job) -> JobSummary {
    let started = Instant::now();
    let outcome = clear_stale_output(job)
        .map_err(|err| err.to_string())
        .and_then(|()| pipeline.run_job(job).map_err(|err| err.to_string()));
    let outcome = match outcome {
        Ok(report) => JobOutcome::Completed {
            resumed_from: report.resumed_from,
        },
        Err(error) => {
            warn!(job = %job.id, %error, "job failed");
            JobOutcome::Failed { error }
        }
    };
    JobSummary {
        job_id: job.id.clone(),
        outcome,
        elapsed_ms: started.elapsed().as_millis(),
    }
}

/// A final output left by an earlier run is rebuilt from the working
/// directory, never trusted.
fn clear_stale_output(job: &Job) -> std::io::Result<()> {
    if job.output_dir.exists() {
        info!(job = %job.id, output = %job.output_dir.display(), "removing previous output");
        fs::remove_dir_all(&job.output_dir)?;
    }
    Ok(())
}

/// Recorded and recomputed state of one working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInspection {
    pub job_id: String,
    pub state: JobState,
    pub status: Option<JobStatus>,
    pub error: Option<String>,
}

/// Look at every working directory under `output_root` without running
/// anything.
pub fn inspect_jobs(output_root: &Path) -> Result<Vec<JobInspection>> {
    let work_root = output_root.join(WORK_DIR_NAME);
    if !work_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut inspections = Vec::new();
    for entry in fs::read_dir(&work_root)
        .with_context(|| format!("failed to list {}", work_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(job_id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let work_dir = entry.path();
        let record = JobStateRecord::read(&work_dir);
        inspections.push(JobInspection {
            state: JobState::detect(&work_dir, &output_root.join(&job_id)),
            status: record.as_ref().map(|r| r.status),
            error: record.and_then(|r| r.error),
            job_id,
        });
    }
    inspections.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(inspections)
}

/// Remove working data and/or final outputs under `output_root`. Returns the
/// removed paths.
pub fn clean(output_root: &Path, work: bool, outputs: bool) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !output_root.is_dir() {
        return Ok(removed);
    }
    let work_root = output_root.join(WORK_DIR_NAME);
    if outputs {
        for entry in fs::read_dir(output_root)
            .with_context(|| format!("failed to list {}", output_root.display()))?
        {
            let path = entry?.path();
            if path.is_dir() && path != work_root {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed.push(path);
            }
        }
    }
    if work && work_root.is_dir() {
        fs::remove_dir_all(&work_root)
            .with_context(|| format!("failed to remove {}", work_root.display()))?;
        removed.push(work_root);
    }
    removed.sort();
    Ok(removed)
}
