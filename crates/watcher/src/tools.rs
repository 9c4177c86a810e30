//! Command lines for the external tools and interpretation of their output.
//!
//! HandBrakeCLI does the transcoding and scanning, ffmpeg-normalize the loudness
//! normalization and ffmpeg renders waveform images. Nothing here spawns a
//! process; commands are handed to a [`ToolRunner`].

use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, error, info, warn};
use crate::config::WatchConfig;
use crate::error::{RunError, StartupError};
use crate::runner::{ToolCommand, ToolOutput, ToolRunner};

/// Marker HandBrake puts in front of the fraction in its `--json` progress records
pub const PROGRESS_MARKER: &str = "\"Progress\":";

/// HandBrake reports this when the self-test input (`null`) has no titles,
/// which proves the preset was accepted
pub const NO_TITLE_FOUND: &str = "No title found";

/// Filter graph for the waveform images
const WAVEFORM_FILTER: &str = "showwavespic=s=2000x1000:split_channels=1";

/// The dry run only parses options; a hang here means a broken install
pub const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A HandBrake preset, optionally imported from a preset file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub name: String,
    pub file: Option<PathBuf>,
}

impl Preset {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["--preset".to_string(), self.name.clone()];
        if let Some(file) = &self.file {
            args.push("--preset-import-file".to_string());
            args.push(file.to_string_lossy().to_string());
        }
        args
    }
}

/// Locations and shared settings for the external tools
#[derive(Debug, Clone)]
pub struct Tools {
    pub handbrake_bin: PathBuf,
    pub normalize_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub normalized_audio_codec: String,
}

impl Tools {
    pub fn from_config(cfg: &WatchConfig) -> Self {
        Self {
            handbrake_bin: cfg.handbrake_bin.clone(),
            normalize_bin: cfg.normalize_bin.clone(),
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            normalized_audio_codec: cfg.normalized_audio_codec.clone(),
        }
    }

    /// Dry run against a non-existent input to validate the preset
    pub fn handbrake_self_test(&self, preset: &Preset) -> ToolCommand {
        ToolCommand::new(&self.handbrake_bin)
            .args(preset.args())
            .args(["-i", "null", "-o", "null"])
            .timeout(Some(SELF_TEST_TIMEOUT))
    }

    /// Title scan; the JSON title set is printed on stdout
    pub fn handbrake_scan(&self, input: &Path) -> ToolCommand {
        ToolCommand::new(&self.handbrake_bin)
            .args(["--json", "--scan", "-i"])
            .arg(input)
    }

    pub fn handbrake_encode(&self, preset: &Preset, input: &Path, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.handbrake_bin)
            .arg("--json")
            .args(preset.args())
            .arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
    }

    pub fn normalize(&self, input: &Path, output: &Path, overwrite: bool) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.normalize_bin)
            .arg(input)
            .arg("-o")
            .arg(output)
            .args(["-v", "-c:a"])
            .arg(&self.normalized_audio_codec)
            .args(["--keep-loudness-range-target", "--progress"]);
        if overwrite {
            cmd = cmd.arg("-f");
        }
        cmd.merge_stderr(true)
    }

    pub fn waveform(&self, input: &Path, image: &Path) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg_bin)
            .arg("-i")
            .arg(input)
            .args(["-y", "-filter_complex", WAVEFORM_FILTER, "-frames:v", "1"])
            .arg(image)
            .merge_stderr(true)
    }
}

/// Extract a percentage from a HandBrake `"Progress": 0.4213,` line
pub fn parse_progress(line: &str) -> Option<f64> {
    let start = line.find(PROGRESS_MARKER)? + PROGRESS_MARKER.len();
    let value = line[start..].trim().trim_end_matches(',').trim();
    let fraction: f64 = value.parse().ok()?;
    if !fraction.is_finite() {
        return None;
    }
    Some((fraction * 100.0).clamp(0.0, 100.0))
}

/// How a HandBrake self-test ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfTestVerdict {
    /// Exited zero
    Passed,
    /// Failed only because the dummy input has no titles
    NoTitleFound,
    /// Any other failure; the preset or the binary is unusable
    Failed,
}

impl SelfTestVerdict {
    pub fn is_usable(&self) -> bool {
        !matches!(self, SelfTestVerdict::Failed)
    }
}

pub fn classify_self_test(result: &Result<ToolOutput, RunError>) -> SelfTestVerdict {
    match result {
        Ok(_) => SelfTestVerdict::Passed,
        Err(RunError::Failed { stderr, .. }) if stderr.iter().any(|l| l.contains(NO_TITLE_FOUND)) => {
            SelfTestVerdict::NoTitleFound
        }
        Err(_) => SelfTestVerdict::Failed,
    }
}

/// Run the HandBrake self-test, logging the captured stderr on failure
pub async fn self_test<R: ToolRunner>(
    runner: &R,
    tools: &Tools,
    preset: &Preset,
) -> Result<SelfTestVerdict, StartupError> {
    debug!("Testing HandBrake options");
    let result = runner
        .run_streaming(&tools.handbrake_self_test(preset), &mut |line: &str| debug!("{}", line))
        .await;

    match (classify_self_test(&result), result) {
        (SelfTestVerdict::Failed, Err(source)) => {
            error!("HandBrake error: {}", source);
            for line in source.stderr() {
                error!("{}", line);
            }
            Err(StartupError::SelfTest {
                preset: preset.name.clone(),
                source,
            })
        }
        (verdict, _) => {
            if verdict == SelfTestVerdict::NoTitleFound {
                debug!("HandBrake self-test reported no titles for the dummy input");
            }
            info!("Using HandBrake preset of {}", preset.name);
            Ok(verdict)
        }
    }
}

/// Render a waveform image, logging instead of failing
pub async fn render_waveform<R: ToolRunner>(runner: &R, tools: &Tools, input: &Path, image: &Path) -> bool {
    info!("Rendering waveform of {} to {}", input.display(), image.display());
    let result = runner
        .run_streaming(&tools.waveform(input, image), &mut |line: &str| debug!("{}", line))
        .await;
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("Waveform rendering failed for {}: {}", input.display(), e);
            for line in e.stderr() {
                warn!("{}", line);
            }
            false
        }
    }
}
