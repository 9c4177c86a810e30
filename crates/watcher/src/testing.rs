//! Scripted stand-in for the external tools used by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use crate::error::RunError;
use crate::job::JobOutcome;
use crate::progress::{Reporter, Step};
use crate::probe::fixtures;
use crate::runner::{ToolCommand, ToolOutput, ToolRunner};

/// Fakes HandBrakeCLI, ffmpeg-normalize and ffmpeg by writing small files where
/// the real tools would write their outputs
#[derive(Debug)]
pub struct ScriptedRunner {
    video_codec: String,
    audio_tracks: usize,
    fail_scan: bool,
    fail_transcode: bool,
    fail_normalize: bool,
    hang_normalize: bool,
    invocations: Mutex<Vec<ToolCommand>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            video_codec: "h264".to_string(),
            audio_tracks: 2,
            fail_scan: false,
            fail_transcode: false,
            fail_normalize: false,
            hang_normalize: false,
            invocations: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedRunner {
    pub fn with_codec(mut self, codec: &str, audio_tracks: usize) -> Self {
        self.video_codec = codec.to_string();
        self.audio_tracks = audio_tracks;
        self
    }

    pub fn fail_scan(mut self) -> Self {
        self.fail_scan = true;
        self
    }

    pub fn fail_transcode(mut self) -> Self {
        self.fail_transcode = true;
        self
    }

    pub fn fail_normalize(mut self) -> Self {
        self.fail_normalize = true;
        self
    }

    /// ffmpeg-normalize never exits
    pub fn hang_normalize(mut self) -> Self {
        self.hang_normalize = true;
        self
    }

    pub fn invocations(&self) -> Vec<ToolCommand> {
        self.invocations.lock().unwrap().clone()
    }

    /// Encode invocations (HandBrake runs that are not scans or self-tests)
    pub fn encodes(&self) -> Vec<ToolCommand> {
        self.invocations()
            .into_iter()
            .filter(|c| c.program_name() == "HandBrakeCLI" && !c.has_arg("--scan") && !c.has_arg("null"))
            .collect()
    }

    pub fn normalizes(&self) -> Vec<ToolCommand> {
        self.invocations()
            .into_iter()
            .filter(|c| c.program_name() == "ffmpeg-normalize")
            .collect()
    }

    fn failure(command: &ToolCommand, message: &str) -> RunError {
        RunError::Failed {
            program: command.program_name(),
            code: Some(1),
            stderr: vec![message.to_string()],
        }
    }
}

fn output_path(command: &ToolCommand) -> Option<PathBuf> {
    command.arg_after("-o").map(PathBuf::from)
}

impl ToolRunner for ScriptedRunner {
    async fn run_streaming(
        &self,
        command: &ToolCommand,
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ToolOutput, RunError> {
        self.invocations.lock().unwrap().push(command.clone());

        match command.program_name().as_str() {
            "HandBrakeCLI" if command.has_arg("--scan") => {
                if self.fail_scan {
                    return Err(Self::failure(command, "scan: unrecognized file type"));
                }
                for line in fixtures::scan_output(&self.video_codec, self.audio_tracks).lines() {
                    on_line(line);
                }
            }
            "HandBrakeCLI" if command.has_arg("null") => {
                return Err(Self::failure(command, "No title found."));
            }
            "HandBrakeCLI" => {
                if self.fail_transcode {
                    return Err(Self::failure(command, "Encode failed (error 3)"));
                }
                for fraction in ["0.25", "0.5", "1.0"] {
                    on_line(&format!("        \"Progress\": {},", fraction));
                }
                if let Some(out) = output_path(command) {
                    std::fs::write(&out, b"transcoded").map_err(|source| RunError::Io {
                        program: command.program_name(),
                        source,
                    })?;
                }
            }
            "ffmpeg-normalize" => {
                on_line("Normalizing file 1 of 1");
                if self.hang_normalize {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                }
                if self.fail_normalize {
                    return Err(Self::failure(command, "ffmpeg exited with code 1"));
                }
                if let Some(out) = output_path(command) {
                    std::fs::write(&out, b"normalized").map_err(|source| RunError::Io {
                        program: command.program_name(),
                        source,
                    })?;
                }
            }
            _ => {
                if let Some(image) = command.args.last() {
                    let _ = std::fs::write(PathBuf::from(image), b"png");
                }
            }
        }

        Ok(ToolOutput {
            code: Some(0),
            stderr: Vec::new(),
        })
    }
}

/// Reporter that keeps everything it is told
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub progress: Mutex<Vec<f64>>,
    pub lines: Mutex<Vec<String>>,
    pub outcomes: Mutex<Vec<String>>,
}

impl Reporter for RecordingReporter {
    fn progress(&self, _input: &Path, _step: Step, percent: f64) {
        self.progress.lock().unwrap().push(percent);
    }

    fn tool_output(&self, _input: &Path, _step: Step, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn outcome(&self, _input: &Path, outcome: &JobOutcome) {
        self.outcomes.lock().unwrap().push(outcome.to_string());
    }
}
