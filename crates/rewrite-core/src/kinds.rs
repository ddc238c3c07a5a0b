use std::fmt;

use serde::Serialize;

/// One pass of the instrumentation engine over a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Light,
    Timing,
    Heavy,
    Rewrite,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Light,
        StageKind::Timing,
        StageKind::Heavy,
        StageKind::Rewrite,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Light => "light",
            StageKind::Timing => "timing",
            StageKind::Heavy => "heavy",
            StageKind::Rewrite => "rewrite",
        }
    }

    /// Canonical directory name the stage is committed under.
    pub fn dir_name(self) -> &'static str {
        self.as_str()
    }

    /// Working-mode token understood by the instrumentation engine.
    /// Light and timing share the call-graph mode; they differ by the roots input.
    pub fn mode_token(self) -> &'static str {
        match self {
            StageKind::Light | StageKind::Timing => "cg",
            StageKind::Heavy => "record",
            StageKind::Rewrite => "rewrite",
        }
    }

    pub fn log_dir_name(self) -> String {
        format!("logs-{}", self.as_str())
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The replay-driven phases that aggregate trial output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Roots,
    Timings,
    Signatures,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Roots => "roots",
            PhaseKind::Timings => "timings",
            PhaseKind::Signatures => "signatures",
        }
    }

    /// Instrumented capture the phase replays.
    pub fn stage(self) -> StageKind {
        match self {
            PhaseKind::Roots => StageKind::Light,
            PhaseKind::Timings => StageKind::Timing,
            PhaseKind::Signatures => StageKind::Heavy,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_replay_their_stage() {
        assert_eq!(PhaseKind::Roots.stage(), StageKind::Light);
        assert_eq!(PhaseKind::Timings.stage(), StageKind::Timing);
        assert_eq!(PhaseKind::Signatures.stage(), StageKind::Heavy);
    }

    #[test]
    fn mode_tokens_match_engine_modes() {
        assert_eq!(StageKind::Light.mode_token(), "cg");
        assert_eq!(StageKind::Timing.mode_token(), "cg");
        assert_eq!(StageKind::Heavy.mode_token(), "record");
        assert_eq!(StageKind::Rewrite.mode_token(), "rewrite");
        assert_eq!(StageKind::Heavy.log_dir_name(), "logs-heavy");
    }
}
