use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::documents::Document;
use crate::error::PipelineError;
use crate::fsutil::{atomic_write_json_pretty, ensure_dir};

/// Named JSON documents inside one job's working directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    pub fn read<D: Document>(&self, name: &str) -> Result<D, PipelineError> {
        let path = self.path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PipelineError::ArtifactMissing(path))
            }
            Err(e) => return Err(e.into()),
        };
        let doc: D =
            serde_json::from_slice(&bytes).map_err(|e| PipelineError::ArtifactMalformed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        doc.validate()
            .map_err(|reason| PipelineError::ArtifactMalformed { path, reason })?;
        Ok(doc)
    }

    /// Reads `name` if it exists and validates, otherwise `None`. Used for
    /// idempotency gates, where a broken document just means "regenerate".
    pub fn read_valid<D: Document>(&self, name: &str) -> Option<D> {
        match self.read::<D>(name) {
            Ok(doc) => Some(doc),
            Err(PipelineError::ArtifactMissing(_)) => None,
            Err(err) => {
                tracing::warn!(artifact = name, error = %err, "ignoring invalid artifact");
                None
            }
        }
    }

    pub fn write<D: Document>(&self, name: &str, doc: &D) -> Result<(), PipelineError> {
        ensure_dir(&self.root)?;
        atomic_write_json_pretty(&self.path(name), doc)?;
        Ok(())
    }
}
