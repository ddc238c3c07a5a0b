//! Typed views of every JSON document exchanged with the external tools.
//!
//! Trial output written by the replay harness arrives in the tracer's result
//! envelope, `{"type": "object", "value": ...}`; the `value` key is the
//! validity marker. Deserializing into these types is the validation step: a
//! document without the marker, or with a marker of the wrong shape, fails to
//! parse and surfaces as [`crate::PipelineError::ArtifactMalformed`].

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document the artifact store can read and write.
pub trait Document: Serialize + DeserializeOwned {
    /// Checks that cannot be expressed through the serde shape alone.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Root invocations observed in one light trial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootsDocument {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub value: Vec<String>,
}

impl Document for RootsDocument {}

/// Caller to callees, as observed in one light trial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGraphDocument {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub value: BTreeMap<String, Vec<String>>,
}

impl Document for CallGraphDocument {}

/// Per-occurrence dependency records. Used both for heavy trial output and
/// for the merged `signature-super.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureDocument {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub value: BTreeMap<String, Vec<Value>>,
}

impl SignatureDocument {
    pub fn object(value: BTreeMap<String, Vec<Value>>) -> Self {
        Self {
            kind: Some("object".to_string()),
            value,
        }
    }
}

impl Document for SignatureDocument {}

/// Timing information collected during a timing trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingDocument {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub value: Value,
}

impl Document for TimingDocument {
    fn validate(&self) -> Result<(), String> {
        let empty = match &self.value {
            Value::Null => return Err("timing value is null".to_string()),
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if empty {
            return Err("timing value is empty".to_string());
        }
        Ok(())
    }
}

/// Merged, counter-free root invocations (`roots-nc.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuperRoots(pub BTreeSet<String>);

impl Document for SuperRoots {}

/// Merged, counter-free call graph (`call-graph-nc.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuperCallGraph(pub BTreeMap<String, BTreeSet<String>>);

impl Document for SuperCallGraph {}

/// Any JSON document whose contents the pipeline passes through untouched,
/// such as page-load timings or the post-processed final signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueDocument(pub Value);

impl Document for OpaqueDocument {}
