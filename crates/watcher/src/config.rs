use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::StartupError;

/// Container extensions HandBrake can read that we are willing to hand it
pub const DEFAULT_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm", "ts", "mpg"];

/// Configuration for the watch-and-convert daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory to watch for finished video files
    pub watch_dir: Option<PathBuf>,
    /// Root directory that converted files are written under
    pub output_dir: Option<PathBuf>,
    /// Where processed inputs are moved; inputs are deleted when unset
    pub completed_dir: Option<PathBuf>,
    /// HandBrake preset name
    pub preset: String,
    /// Optional HandBrake preset file imported before the preset is selected
    pub preset_file: Option<PathBuf>,
    /// Replace outputs that already exist
    pub overwrite: bool,
    /// Run ffmpeg-normalize after the transcode
    pub normalize_audio: bool,
    /// Render before/after waveform images next to the output
    pub generate_waveforms: bool,
    /// Watch subdirectories as well as the root
    pub recursive: bool,
    /// Queue files that already exist when the watcher starts
    pub process_existing: bool,
    /// Skip native notifications and re-scan the tree instead (network shares)
    pub force_polling: bool,
    /// Interval in seconds between polling scans
    pub poll_interval_secs: u64,
    /// Fail a job, killing its running tool, once it runs longer than this many seconds
    pub job_timeout_secs: Option<u64>,
    /// Path to HandBrakeCLI
    pub handbrake_bin: PathBuf,
    /// Path to ffmpeg-normalize
    pub normalize_bin: PathBuf,
    /// Path to ffmpeg (waveform rendering only)
    pub ffmpeg_bin: PathBuf,
    /// Lower-case file extensions accepted as conversion input
    pub accepted_extensions: Vec<String>,
    /// Inputs whose main title already uses this codec are left alone
    pub excluded_video_codec: String,
    /// Container extension for transcoded output
    pub output_extension: String,
    /// Audio codec ffmpeg-normalize encodes to
    pub normalized_audio_codec: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl WatchConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            watch_dir: None,
            output_dir: None,
            completed_dir: None,
            preset: "CLI Default".to_string(),
            preset_file: None,
            overwrite: false,
            normalize_audio: true,
            generate_waveforms: false,
            recursive: true,
            process_existing: true,
            force_polling: false,
            poll_interval_secs: 5,
            job_timeout_secs: None,
            handbrake_bin: PathBuf::from("HandBrakeCLI"),
            normalize_bin: PathBuf::from("ffmpeg-normalize"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            accepted_extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            excluded_video_codec: "libav1".to_string(),
            output_extension: "mkv".to_string(),
            normalized_audio_codec: "aac".to_string(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.accepted_extensions = config
            .accepted_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect();

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Check the watch directory and create the output and completed
    /// directories, replacing all three with canonical paths
    pub fn resolve_directories(&mut self) -> std::result::Result<(), StartupError> {
        let watch = self.watch_dir.as_deref().ok_or(StartupError::Missing("watch directory"))?;
        let watch = match watch.canonicalize() {
            Ok(p) if p.is_dir() => p,
            _ => return Err(StartupError::WatchDir(watch.to_path_buf())),
        };

        let output = self.output_dir.as_deref().ok_or(StartupError::Missing("output directory"))?;
        let output = create_canonical(output)?;
        if output == watch {
            return Err(StartupError::OutputIsWatchDir(output));
        }

        if let Some(completed) = self.completed_dir.as_deref() {
            let completed = create_canonical(completed)?;
            // archiving onto the input or the output would lose a file
            if completed == watch || completed == output {
                return Err(StartupError::CompletedDirConflict(completed));
            }
            self.completed_dir = Some(completed);
        }
        self.watch_dir = Some(watch);
        self.output_dir = Some(output);
        Ok(())
    }
}

fn create_canonical(dir: &Path) -> std::result::Result<PathBuf, StartupError> {
    let io_error = |source| StartupError::OutputDir {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_error)?;
    dir.canonicalize().map_err(io_error)
}
