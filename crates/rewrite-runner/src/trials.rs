//! Repeated replay of an instrumented capture, merged into phase aggregates.
//!
//! The loop itself is shared by the three replay-driven phases. A
//! [`PhaseCollector`] supplies what differs between them: the trial output
//! files, how one trial's documents are folded into the accumulator, and the
//! aggregate written at the end.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use rewrite_core::merge::{merge_call_graph, merge_roots, merge_signatures};
use rewrite_core::{
    ArtifactStore, AttemptError, CallGraphDocument, CommandRunner, OpaqueDocument, PhaseKind,
    PipelineError, RetryError, RetryPolicy, RootsDocument, SignatureDocument, StageKind,
    SuperCallGraph, SuperRoots, TimingDocument, ToolCommand,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::job::{artifacts, Job};
use crate::ports::PortAllocator;
use crate::stage::{stage_inputs, StageRunner};

/// Files one trial asks the harness to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialOutputs {
    pub primary: String,
    pub extra: Option<String>,
}

impl TrialOutputs {
    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.extra.as_deref())
    }
}

pub trait PhaseCollector {
    type Aggregate;

    const PHASE: PhaseKind;

    /// The committed aggregate, if a previous run already produced a valid one.
    fn existing(store: &ArtifactStore) -> Option<Self::Aggregate>;

    fn outputs(trial: usize) -> TrialOutputs;

    /// Read and validate every output of one trial, then merge. Nothing is
    /// merged unless all outputs are valid.
    fn absorb(&mut self, store: &ArtifactStore, outputs: &TrialOutputs)
        -> Result<(), PipelineError>;

    fn finish(self, store: &ArtifactStore) -> Result<Self::Aggregate, PipelineError>;
}

/// Super roots and super call graph of the light phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RootsAggregate {
    pub roots: SuperRoots,
    pub call_graph: SuperCallGraph,
}

#[derive(Debug, Default)]
pub struct RootsCollector {
    roots: BTreeSet<String>,
    call_graph: BTreeMap<String, BTreeSet<String>>,
}

impl PhaseCollector for RootsCollector {
    type Aggregate = RootsAggregate;

    const PHASE: PhaseKind = PhaseKind::Roots;

    fn existing(store: &ArtifactStore) -> Option<RootsAggregate> {
        if !store.exists(artifacts::SUPER_CALL_GRAPH) {
            return None;
        }
        let roots = store.read_valid::<SuperRoots>(artifacts::SUPER_ROOTS)?;
        let call_graph = store.read_valid::<SuperCallGraph>(artifacts::SUPER_CALL_GRAPH)?;
        Some(RootsAggregate { roots, call_graph })
    }

    fn outputs(trial: usize) -> TrialOutputs {
        TrialOutputs {
            primary: artifacts::roots_trial(trial),
            extra: Some(artifacts::call_graph_trial(trial)),
        }
    }

    fn absorb(
        &mut self,
        store: &ArtifactStore,
        outputs: &TrialOutputs,
    ) -> Result<(), PipelineError> {
        let roots: RootsDocument = store.read(&outputs.primary)?;
        let graph: CallGraphDocument = match &outputs.extra {
            Some(name) => store.read(name)?,
            None => CallGraphDocument::default(),
        };
        merge_roots(&mut self.roots, &roots.value);
        merge_call_graph(&mut self.call_graph, &graph.value);
        Ok(())
    }

    fn finish(self, store: &ArtifactStore) -> Result<RootsAggregate, PipelineError> {
        let aggregate = RootsAggregate {
            roots: SuperRoots(self.roots),
            call_graph: SuperCallGraph(self.call_graph),
        };
        store.write(artifacts::SUPER_ROOTS, &aggregate.roots)?;
        store.write(artifacts::SUPER_CALL_GRAPH, &aggregate.call_graph)?;
        Ok(aggregate)
    }
}

/// Timing and page-load timing of the timing phase.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingAggregate {
    pub timing: TimingDocument,
    pub plt: OpaqueDocument,
}

/// Timings are measurements rather than presence facts, so the last valid
/// trial is kept instead of merging.
#[derive(Debug, Default)]
pub struct TimingCollector {
    latest: Option<TimingAggregate>,
}

impl PhaseCollector for TimingCollector {
    type Aggregate = TimingAggregate;

    const PHASE: PhaseKind = PhaseKind::Timings;

    fn existing(store: &ArtifactStore) -> Option<TimingAggregate> {
        let plt = store.read_valid::<OpaqueDocument>(artifacts::PLT_TIMING)?;
        let timing = store.read_valid::<TimingDocument>(artifacts::TIMING)?;
        Some(TimingAggregate { timing, plt })
    }

    fn outputs(trial: usize) -> TrialOutputs {
        TrialOutputs {
            primary: artifacts::timing_trial(trial),
            extra: Some(artifacts::plt_timing_trial(trial)),
        }
    }

    fn absorb(
        &mut self,
        store: &ArtifactStore,
        outputs: &TrialOutputs,
    ) -> Result<(), PipelineError> {
        let timing: TimingDocument = store.read(&outputs.primary)?;
        let plt: OpaqueDocument = match &outputs.extra {
            Some(name) => store.read(name)?,
            None => OpaqueDocument(Value::Null),
        };
        self.latest = Some(TimingAggregate { timing, plt });
        Ok(())
    }

    fn finish(self, store: &ArtifactStore) -> Result<TimingAggregate, PipelineError> {
        let aggregate = self
            .latest
            .ok_or_else(|| PipelineError::ArtifactMissing(store.path(artifacts::TIMING)))?;
        store.write(artifacts::PLT_TIMING, &aggregate.plt)?;
        store.write(artifacts::TIMING, &aggregate.timing)?;
        Ok(aggregate)
    }
}

#[derive(Debug, Default)]
pub struct SignatureCollector {
    signatures: BTreeMap<String, Vec<Value>>,
}

impl PhaseCollector for SignatureCollector {
    type Aggregate = SignatureDocument;

    const PHASE: PhaseKind = PhaseKind::Signatures;

    /// An aggregate without a single signature is treated as not generated.
    fn existing(store: &ArtifactStore) -> Option<SignatureDocument> {
        store
            .read_valid::<SignatureDocument>(artifacts::SUPER_SIGNATURE)
            .filter(|doc| !doc.value.is_empty())
    }

    fn outputs(trial: usize) -> TrialOutputs {
        TrialOutputs {
            primary: artifacts::signature_trial(trial),
            extra: None,
        }
    }

    fn absorb(
        &mut self,
        store: &ArtifactStore,
        outputs: &TrialOutputs,
    ) -> Result<(), PipelineError> {
        let signatures: SignatureDocument = store.read(&outputs.primary)?;
        let before = self.signatures.len();
        merge_signatures(&mut self.signatures, signatures.value);
        debug!(
            invocations_before = before,
            invocations_after = self.signatures.len(),
            "merged signatures"
        );
        Ok(())
    }

    fn finish(self, store: &ArtifactStore) -> Result<SignatureDocument, PipelineError> {
        let aggregate = SignatureDocument::object(self.signatures);
        store.write(artifacts::SUPER_SIGNATURE, &aggregate)?;
        Ok(aggregate)
    }
}

pub struct TrialLoop<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn CommandRunner,
    ports: &'a dyn PortAllocator,
    retry: RetryPolicy,
}

impl<'a> TrialLoop<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        runner: &'a dyn CommandRunner,
        ports: &'a dyn PortAllocator,
    ) -> Self {
        Self {
            config,
            runner,
            ports,
            retry: config.retry_policy(),
        }
    }

    /// Ensure the phase's instrumented capture exists, then replay it
    /// `trial_count` times and write the merged aggregate.
    pub fn run_trials<C: PhaseCollector>(
        &self,
        job: &Job,
        mut collector: C,
        trial_count: usize,
    ) -> Result<C::Aggregate, PipelineError> {
        let phase = C::PHASE;
        let stage = phase.stage();
        let store = job.store();

        let stages = StageRunner::new(
            self.runner,
            &self.config.instrument_command,
            self.config.tools_dir.as_deref(),
            self.retry,
        );
        stages.run_stage(stage, job, &stage_inputs(stage, job))?;

        if let Some(existing) = C::existing(&store) {
            debug!(job = %job.id, %phase, "aggregate already present");
            return Ok(existing);
        }

        for trial in 0..trial_count {
            let outputs = C::outputs(trial);
            let label = format!("{} trial {} of {}", phase, trial, job.id);
            let result = self.retry.run(&label, |attempt| {
                for name in outputs.names() {
                    remove_if_present(&store.path(name))?;
                }
                let port = self.ports.next_port();
                debug!(job = %job.id, %phase, trial, attempt, port, "replaying");
                let command = self.replay_command(job, stage, port, &store, &outputs);
                let stdout = self.runner.run(&command)?;
                if !stdout.is_empty() {
                    debug!(job = %job.id, %phase, trial, output = %stdout, "replay output");
                }
                collector.absorb(&store, &outputs).map_err(|err| match err {
                    PipelineError::ArtifactMissing(_) | PipelineError::ArtifactMalformed { .. } => {
                        AttemptError::Retryable(err.to_string())
                    }
                    other => AttemptError::from(other),
                })
            });
            match result {
                Ok(()) => {}
                Err(RetryError::Fatal(err)) => return Err(err),
                Err(RetryError::Exhausted {
                    attempts,
                    last_reason,
                }) => {
                    return Err(PipelineError::TrialGenerationFailure {
                        phase,
                        trial,
                        attempts,
                        reason: last_reason,
                    })
                }
            }
        }

        let aggregate = collector.finish(&store)?;
        info!(job = %job.id, %phase, trials = trial_count, "aggregate written");
        Ok(aggregate)
    }

    fn replay_command(
        &self,
        job: &Job,
        stage: StageKind,
        port: u16,
        store: &ArtifactStore,
        outputs: &TrialOutputs,
    ) -> ToolCommand {
        let mut command = ToolCommand::from_parts(&self.config.replay_command)
            .arg_path(&job.stage_dir(stage))
            .args(self.config.client_command.iter().cloned())
            .arg("-u")
            .arg(format!("{}{}", self.config.url_scheme, job.id))
            .arg("-p")
            .arg(port.to_string())
            .arg("-m")
            .arg(stage.as_str())
            .arg("-o")
            .arg_path(&store.path(&outputs.primary));
        if let Some(extra) = &outputs.extra {
            command = match stage {
                StageKind::Light => command.arg("-g").arg_path(&store.path(extra)),
                StageKind::Timing => command.arg("-t").arg("-l").arg_path(&store.path(extra)),
                _ => command,
            };
        }
        command.current_dir(self.config.tools_dir.as_deref())
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
