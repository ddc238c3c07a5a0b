//! Per-job pipeline orchestration for page rewriting: instrumentation stages,
//! replay trials, post-processing and the batch driver around them.

pub mod batch;
pub mod config;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod stage;
pub mod state;
pub mod trials;

#[cfg(test)]
mod test_support;

pub use batch::{
    clean, discover_jobs, inspect_jobs, read_allow_list, run_batch, BatchReport, Discovery,
    JobInspection, JobOutcome, JobSummary,
};
pub use config::{PipelineConfig, PortRange};
pub use job::{artifacts, Job, WORK_DIR_NAME};
pub use pipeline::{JobReport, Pipeline};
pub use ports::{PortAllocator, RandomPorts, SequentialPorts};
pub use stage::{stage_inputs, StageInput, StageOutcome, StageRunner};
pub use state::{JobState, JobStateGuard, JobStateRecord, JobStatus};
pub use trials::{
    PhaseCollector, RootsAggregate, RootsCollector, SignatureCollector, TimingAggregate,
    TimingCollector, TrialLoop, TrialOutputs,
};
