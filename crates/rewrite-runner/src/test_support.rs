//! In-process stand-ins for the instrumentation engine, replay harness and
//! signature post-processor.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use rewrite_core::{ensure_dir, CommandRunner, PipelineError, StageKind, ToolCommand};
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::job::Job;

pub(crate) struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub(crate) fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "rewrite_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("sandbox root");
        Self { root }
    }

    pub(crate) fn input_root(&self) -> PathBuf {
        self.root.join("captures")
    }

    pub(crate) fn output_root(&self) -> PathBuf {
        self.root.join("rewritten")
    }

    /// Capture directory `id` with `entries` recorded responses, plus its
    /// (empty) working directory.
    pub(crate) fn job(&self, id: &str, entries: usize) -> Job {
        let job = Job::new(id, &self.input_root(), &self.output_root());
        ensure_dir(&job.input_dir).expect("capture dir");
        for i in 0..entries {
            fs::write(job.input_dir.join(format!("save.{}", i)), b"response").expect("entry");
        }
        ensure_dir(&job.work_dir).expect("work dir");
        job
    }

    pub(crate) fn config(&self) -> PipelineConfig {
        PipelineConfig {
            instrument_command: vec!["instrument".to_string()],
            replay_command: vec!["replay".to_string()],
            client_command: vec!["client".to_string()],
            postprocess_command: vec!["postprocess".to_string()],
            tool_timeout_secs: 0,
            ..PipelineConfig::default()
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[derive(Default)]
pub(crate) struct FakeTools {
    calls: Mutex<Vec<ToolCommand>>,
    short_stages: Vec<(String, StageKind)>,
    failing_programs: Vec<String>,
    malformed_replays: usize,
    silent_replays: usize,
    replays: AtomicUsize,
    timing_replays: AtomicUsize,
    heavy_replays: AtomicUsize,
}

impl FakeTools {
    /// Instrumenting `page` in `stage` drops one response.
    pub(crate) fn short_stage(mut self, page: &str, stage: StageKind) -> Self {
        self.short_stages.push((page.to_string(), stage));
        self
    }

    pub(crate) fn failing_program(mut self, program: &str) -> Self {
        self.failing_programs.push(program.to_string());
        self
    }

    /// The first `count` replays write output without the `value` marker.
    pub(crate) fn malformed_replays(mut self, count: usize) -> Self {
        self.malformed_replays = count;
        self
    }

    /// The first `count` replays exit cleanly without writing anything.
    pub(crate) fn silent_replays(mut self, count: usize) -> Self {
        self.silent_replays = count;
        self
    }

    pub(crate) fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn replay_count(&self) -> usize {
        self.replays.load(Ordering::SeqCst)
    }

    fn instrument(&self, args: &[String]) -> Result<String, PipelineError> {
        let positional = &args[args.len() - 4..];
        let input = Path::new(&positional[0]);
        let output = Path::new(&positional[1]);
        let stage = match positional[2].as_str() {
            "record" => StageKind::Heavy,
            "rewrite" => StageKind::Rewrite,
            _ if args.iter().any(|a| a == "--cgInfo") => StageKind::Timing,
            _ => StageKind::Light,
        };
        let page = input
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let generated = output.join(&page);
        ensure_dir(&generated)?;
        let mut entries: Vec<PathBuf> = fs::read_dir(input)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();
        if self.short_stages.iter().any(|(p, s)| *p == page && *s == stage) {
            entries.pop();
        }
        for entry in entries {
            if let Some(name) = entry.file_name() {
                fs::copy(&entry, generated.join(name))?;
            }
        }
        Ok(format!("instrumented {} in {} mode", page, stage))
    }

    fn replay(&self, index: usize, args: &[String]) -> Result<String, PipelineError> {
        let flag = |name: &str| {
            args.windows(2)
                .find(|w| w[0] == name)
                .map(|w| PathBuf::from(&w[1]))
        };
        let mode = flag("-m").unwrap_or_default();
        let output = flag("-o").unwrap_or_default();
        if index < self.silent_replays {
            return Ok(String::new());
        }
        if index < self.malformed_replays {
            write_json(&output, &json!({"type": "undefined"}))?;
            return Ok("page load time: -1".to_string());
        }
        match mode.to_str().unwrap_or_default() {
            "light" => {
                write_json(
                    &output,
                    &json!({
                        "type": "object",
                        "value": ["a.js:10_count1", "a.js:10_count2", "b.js:4_count1"]
                    }),
                )?;
                if let Some(graph) = flag("-g") {
                    write_json(
                        &graph,
                        &json!({"type": "object", "value": {"a.js:10_count1": ["b.js:4_count1"]}}),
                    )?;
                }
            }
            "timing" => {
                let trial = self.timing_replays.fetch_add(1, Ordering::SeqCst);
                write_json(&output, &json!({"type": "object", "value": {"trial": trial}}))?;
                if let Some(plt) = flag("-l") {
                    write_json(&plt, &json!({"start": 1.0, "fired": 2.5, "plt": 1.5}))?;
                }
            }
            "heavy" => {
                let trial = self.heavy_replays.fetch_add(1, Ordering::SeqCst);
                write_json(
                    &output,
                    &json!({"type": "object", "value": {"f.js:2_count1": [["read", "x", trial]]}}),
                )?;
            }
            other => {
                return Err(PipelineError::ExternalToolFailure {
                    command: "replay".to_string(),
                    stderr: format!("unknown mode {}", other),
                })
            }
        }
        Ok("page load time: 1.5".to_string())
    }

    fn postprocess(&self, args: &[String]) -> Result<String, PipelineError> {
        let output = args
            .windows(2)
            .find(|w| w[0] == "-o")
            .map(|w| PathBuf::from(&w[1]))
            .unwrap_or_default();
        write_json(&output, &json!({"type": "object", "value": {"a.js:10": "cacheable"}}))?;
        Ok(String::new())
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), PipelineError> {
    fs::write(path, serde_json::to_vec_pretty(value).expect("encode"))?;
    Ok(())
}

impl CommandRunner for FakeTools {
    fn run(&self, command: &ToolCommand) -> Result<String, PipelineError> {
        self.calls.lock().expect("calls lock").push(command.clone());
        let replay_index = self.replays.fetch_add(
            usize::from(command.program == "replay"),
            Ordering::SeqCst,
        );
        if self.failing_programs.contains(&command.program) {
            return Err(PipelineError::ExternalToolFailure {
                command: command.display(),
                stderr: "exit 1: simulated failure".to_string(),
            });
        }
        match command.program.as_str() {
            "instrument" => self.instrument(&command.args),
            "replay" => self.replay(replay_index, &command.args),
            "postprocess" => self.postprocess(&command.args),
            other => panic!("unexpected program {}", other),
        }
    }
}
