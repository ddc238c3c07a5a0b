//! Building blocks of the page rewrite pipeline: typed artifacts, the
//! artifact store, trial merging, bounded retries and the process boundary.

pub mod command;
pub mod documents;
pub mod error;
pub mod fsutil;
pub mod ids;
pub mod kinds;
pub mod merge;
pub mod retry;
pub mod store;

pub use command::{CommandRunner, ProcessRunner, ToolCommand};
pub use documents::{
    CallGraphDocument, Document, OpaqueDocument, RootsDocument, SignatureDocument, SuperCallGraph,
    SuperRoots, TimingDocument,
};
pub use error::PipelineError;
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, copy_dir, count_entries, ensure_dir};
pub use kinds::{PhaseKind, StageKind};
pub use retry::{AttemptError, RetryError, RetryPolicy};
pub use store::ArtifactStore;
