use std::path::Path;
use std::fmt;
use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::Deserialize;
use crate::runner::ToolRunner;
use crate::tools::Tools;

/// Literal that precedes the title set JSON in `HandBrakeCLI --json --scan` output
pub const TITLE_SET_MARKER: &str = "JSON Title Set:";

/// Complete HandBrake scan output structure
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TitleSet {
    pub main_feature: i64,
    pub title_list: Vec<Title>,
}

/// One title of a scanned source
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Title {
    pub video_codec: String,
    pub geometry: Geometry,
    pub frame_rate: FrameRate,
    pub duration: Duration,
    #[serde(default)]
    pub audio_list: Vec<AudioTrack>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FrameRate {
    pub num: u64,
    pub den: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Duration {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

/// Audio track metadata from the scan
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AudioTrack {
    pub language: String,
    pub bit_rate: u64,
    pub sample_rate: u64,
    pub codec_name: String,
    pub channel_layout_name: String,
}

/// The facts about a file's main title that eligibility is decided on
#[derive(Debug, Clone)]
pub struct MediaProbeResult {
    pub video_codec: String,
    pub geometry: Geometry,
    pub frame_rate: FrameRate,
    pub duration: Duration,
    pub audio_streams: Vec<AudioTrack>,
}

impl FrameRate {
    pub fn fps(&self) -> Option<f64> {
        if self.den == 0 {
            None
        } else {
            Some(self.num as f64 / self.den as f64)
        }
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}m:{:02}s", self.hours, self.minutes, self.seconds)
    }
}

impl fmt::Display for AudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}bps @{}Hz {} {})",
            self.language, self.bit_rate, self.sample_rate, self.codec_name, self.channel_layout_name
        )
    }
}

impl MediaProbeResult {
    /// `1920x1080 @23.976fps h264 1:42m:07s`
    pub fn summary(&self) -> String {
        let fps = self
            .frame_rate
            .fps()
            .map(|f| format!("{:.3}", f))
            .unwrap_or_else(|| "?".to_string());
        format!(
            "{}x{} @{}fps {} {}",
            self.geometry.width, self.geometry.height, fps, self.video_codec, self.duration
        )
    }

    pub fn audio_summary(&self) -> String {
        self.audio_streams
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse the scan output of HandBrake and select the main title
pub fn parse_scan_output(output: &str) -> Result<MediaProbeResult> {
    let (_, json) = output
        .split_once(TITLE_SET_MARKER)
        .ok_or_else(|| anyhow!("scan output has no {:?} marker", TITLE_SET_MARKER))?;

    // HandBrake may keep printing after the object; only the first value matters
    let title_set: TitleSet = serde_json::Deserializer::from_str(json)
        .into_iter::<TitleSet>()
        .next()
        .ok_or_else(|| anyhow!("scan output ends after the title set marker"))?
        .context("Failed to parse HandBrake title set")?;

    let index = usize::try_from(title_set.main_feature)
        .with_context(|| format!("invalid main feature index {}", title_set.main_feature))?;
    let title = title_set
        .title_list
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow!("main feature {} is not in the title list", index))?;

    Ok(MediaProbeResult {
        video_codec: title.video_codec,
        geometry: title.geometry,
        frame_rate: title.frame_rate,
        duration: title.duration,
        audio_streams: title.audio_list,
    })
}

/// Run a HandBrake title scan and parse the main title
pub async fn probe_file<R: ToolRunner>(runner: &R, tools: &Tools, file_path: &Path) -> Result<MediaProbeResult> {
    // Verify file exists before trying to probe
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    let command = tools.handbrake_scan(file_path);
    debug!("scan command: {}", command.display());

    let mut output = String::new();
    runner
        .run_streaming(&command, &mut |line: &str| {
            output.push_str(line);
            output.push('\n');
        })
        .await
        .with_context(|| format!("HandBrake scan failed for: {}", file_path.display()))?;

    parse_scan_output(&output).with_context(|| format!("Failed to read scan of: {}", file_path.display()))
}
