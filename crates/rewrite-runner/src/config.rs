use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rewrite_core::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Inclusive range the replay harness ports are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 9000,
            end: 9500,
        }
    }
}

/// Everything the pipeline needs to know about its external tools.
///
/// Loaded from an optional YAML file; fields left out keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Working directory for every tool invocation.
    pub tools_dir: Option<PathBuf>,
    pub instrument_command: Vec<String>,
    /// Network replay shell, e.g. `mm-webreplay`.
    pub replay_command: Vec<String>,
    /// Browser client run inside the replay shell.
    pub client_command: Vec<String>,
    pub postprocess_command: Vec<String>,
    pub url_scheme: String,
    pub trial_count: usize,
    pub timing_trial_count: usize,
    pub max_attempts: u32,
    pub port_range: PortRange,
    pub port_seed: Option<u64>,
    /// Per-invocation deadline; 0 disables it.
    pub tool_timeout_secs: u64,
    pub jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tools_dir: None,
            instrument_command: vec!["python2".to_string(), "readHTTPResponse.py".to_string()],
            replay_command: vec!["mm-webreplay".to_string()],
            client_command: vec!["node".to_string(), "chrome.js".to_string()],
            postprocess_command: vec![
                "node".to_string(),
                "../scripts/process-root-signatures.js".to_string(),
            ],
            url_scheme: "https://".to_string(),
            trial_count: 1,
            timing_trial_count: 1,
            max_attempts: 3,
            port_range: PortRange::default(),
            port_seed: None,
            tool_timeout_secs: 900,
            jobs: 1,
        }
    }
}

impl PipelineConfig {
    /// Defaults, overlaid with `path` when given. A relative `tools_dir` is
    /// resolved against the config file's directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        if let Some(dir) = config.tools_dir.as_ref().filter(|d| d.is_relative()) {
            let base = path.parent().unwrap_or(Path::new("."));
            config.tools_dir = Some(base.join(dir));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let commands = [
            ("instrument_command", &self.instrument_command),
            ("replay_command", &self.replay_command),
            ("client_command", &self.client_command),
            ("postprocess_command", &self.postprocess_command),
        ];
        for (name, command) in commands {
            if command.first().map_or(true, |p| p.trim().is_empty()) {
                return Err(anyhow!("{} must name a program", name));
            }
        }
        if self.trial_count == 0 || self.timing_trial_count == 0 {
            return Err(anyhow!("trial counts must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        if self.port_range.start > self.port_range.end {
            return Err(anyhow!(
                "empty port range {}..={}",
                self.port_range.start,
                self.port_range.end
            ));
        }
        if self.jobs == 0 {
            return Err(anyhow!("jobs must be at least 1"));
        }
        if let Some(dir) = &self.tools_dir {
            if !dir.is_dir() {
                return Err(anyhow!("tools_dir is not a directory: {}", dir.display()));
            }
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }
}
