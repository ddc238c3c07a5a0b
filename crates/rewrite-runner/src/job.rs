use std::path::{Path, PathBuf};

use rewrite_core::{ArtifactStore, StageKind};

/// File names of the documents kept in a job's working directory.
pub mod artifacts {
    pub const SUPER_ROOTS: &str = "roots-nc.json";
    pub const SUPER_CALL_GRAPH: &str = "call-graph-nc.json";
    pub const TIMING: &str = "timing.json";
    pub const PLT_TIMING: &str = "plt-timing.json";
    pub const SUPER_SIGNATURE: &str = "signature-super.json";
    pub const FINAL_SIGNATURE: &str = "signature-final.json";
    pub const JOB_STATE: &str = "job_state.json";

    pub fn roots_trial(trial: usize) -> String {
        format!("roots-{}.json", trial)
    }

    pub fn call_graph_trial(trial: usize) -> String {
        format!("call-graph-{}.json", trial)
    }

    pub fn timing_trial(trial: usize) -> String {
        format!("timing-{}.json", trial)
    }

    pub fn plt_timing_trial(trial: usize) -> String {
        format!("plt-timing-{}.json", trial)
    }

    pub fn signature_trial(trial: usize) -> String {
        format!("signature-{}.json", trial)
    }
}

/// Name of the directory holding per-job working data under the output root.
pub const WORK_DIR_NAME: &str = "temp";

/// One page capture moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Page identifier, taken from the capture directory name.
    pub id: String,
    pub input_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Job {
    pub fn new(id: &str, input_root: &Path, output_root: &Path) -> Self {
        Self {
            id: id.to_string(),
            input_dir: input_root.join(id),
            work_dir: output_root.join(WORK_DIR_NAME).join(id),
            output_dir: output_root.join(id),
        }
    }

    pub fn store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.work_dir)
    }

    /// Committed output directory of `stage`.
    pub fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.work_dir.join(stage.dir_name())
    }

    /// Raw directory the instrumentation engine writes before commit.
    pub fn generated_dir(&self) -> PathBuf {
        self.work_dir.join(&self.id)
    }

    pub fn log_dir(&self, stage: StageKind) -> PathBuf {
        self.work_dir.join(stage.log_dir_name())
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }
}
