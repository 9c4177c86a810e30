use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use uuid::Uuid;
use crate::config::WatchConfig;
use crate::error::{JobFailure, RunError, StartupError};
use crate::progress::{ProgressState, Reporter, Step};
use crate::runner::{ToolCommand, ToolRunner};
use crate::tools::{self, parse_progress, Preset, Tools};
use crate::validator::{Eligibility, EligibilityRules, MediaValidator};

/// Marker for the HandBrake output before it is complete
pub const TRANSCODING_MARKER: &str = "transcoding";
/// Marker for the ffmpeg-normalize output before it is complete
pub const NORMALIZING_MARKER: &str = "normalizing";

/// Which external steps a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// HandBrake, then optionally ffmpeg-normalize on its output
    Transcode { normalize: bool },
    /// ffmpeg-normalize only; the container is kept
    NormalizeOnly,
}

impl Pipeline {
    pub fn transcodes(&self) -> bool {
        matches!(self, Pipeline::Transcode { .. })
    }

    pub fn normalizes(&self) -> bool {
        matches!(self, Pipeline::Transcode { normalize: true } | Pipeline::NormalizeOnly)
    }
}

/// Everything one job needs; built per dispatched path
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub id: Uuid,
    pub input: PathBuf,
    pub watch_root: PathBuf,
    pub output_root: PathBuf,
    pub preset: Preset,
    pub overwrite: bool,
    pub archive_dir: Option<PathBuf>,
    pub pipeline: Pipeline,
    pub waveforms: bool,
    pub output_extension: String,
    /// Wall-clock limit for the whole job, tools included
    pub timeout: Option<Duration>,
}

impl ConversionRequest {
    /// Input path relative to the watch root, or just its file name when it
    /// lies outside the root
    pub fn relative_input(&self) -> PathBuf {
        match self.input.strip_prefix(&self.watch_root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => self.input.file_name().map(PathBuf::from).unwrap_or_default(),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        let target = self.output_root.join(self.relative_input());
        if self.pipeline.transcodes() {
            target.with_extension(&self.output_extension)
        } else {
            target
        }
    }

    pub fn transcode_temp(&self) -> PathBuf {
        temp_sibling(&self.output_path(), TRANSCODING_MARKER)
    }

    pub fn normalize_temp(&self) -> PathBuf {
        temp_sibling(&self.output_path(), NORMALIZING_MARKER)
    }

    pub fn archive_path(&self) -> Option<PathBuf> {
        self.archive_dir.as_ref().map(|dir| dir.join(self.relative_input()))
    }

    fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// `out/show.mkv` + `transcoding` -> `out/show.transcoding.mkv`
pub fn temp_sibling(path: &Path, marker: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, marker, ext.to_string_lossy()),
        None => format!("{}.{}", stem, marker),
    };
    path.with_file_name(name)
}

/// Settings shared by every request; turns a stable path into a `ConversionRequest`
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub watch_root: PathBuf,
    pub output_root: PathBuf,
    pub preset: Preset,
    pub overwrite: bool,
    pub archive_dir: Option<PathBuf>,
    pub pipeline: Pipeline,
    pub waveforms: bool,
    pub output_extension: String,
    pub timeout: Option<Duration>,
}

impl RequestTemplate {
    pub fn from_config(cfg: &WatchConfig, pipeline: Pipeline) -> Result<Self, StartupError> {
        let watch_root = cfg.watch_dir.clone().ok_or(StartupError::Missing("watch directory"))?;
        let output_root = cfg.output_dir.clone().ok_or(StartupError::Missing("output directory"))?;
        Ok(Self {
            watch_root,
            output_root,
            preset: Preset {
                name: cfg.preset.clone(),
                file: cfg.preset_file.clone(),
            },
            overwrite: cfg.overwrite,
            archive_dir: cfg.completed_dir.clone(),
            pipeline,
            waveforms: cfg.generate_waveforms,
            output_extension: cfg.output_extension.clone(),
            timeout: cfg.job_timeout(),
        })
    }

    pub fn request_for(&self, input: PathBuf) -> ConversionRequest {
        ConversionRequest {
            id: Uuid::new_v4(),
            input,
            watch_root: self.watch_root.clone(),
            output_root: self.output_root.clone(),
            preset: self.preset.clone(),
            overwrite: self.overwrite,
            archive_dir: self.archive_dir.clone(),
            pipeline: self.pipeline,
            waveforms: self.waveforms,
            output_extension: self.output_extension.clone(),
            timeout: self.timeout,
        }
    }
}

/// Terminal result of one job
#[derive(Debug)]
pub enum JobOutcome {
    Success(PathBuf),
    SkippedExisting(PathBuf),
    SkippedIneligible(Eligibility),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success(path) => write!(f, "success: {}", path.display()),
            JobOutcome::SkippedExisting(path) => write!(f, "skipped, {} exists", path.display()),
            JobOutcome::SkippedIneligible(reason) => write!(f, "skipped, {}", reason),
            JobOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Runs conversion jobs against a `ToolRunner`
pub struct Converter<R> {
    runner: Arc<R>,
    tools: Tools,
    validator: MediaValidator<R>,
    reporter: Arc<dyn Reporter>,
}

impl<R: ToolRunner> Converter<R> {
    pub fn new(runner: Arc<R>, tools: Tools, rules: EligibilityRules, reporter: Arc<dyn Reporter>) -> Self {
        let validator = MediaValidator::new(runner.clone(), tools.clone(), rules);
        Self {
            runner,
            tools,
            validator,
            reporter,
        }
    }

    pub async fn convert(&self, request: &ConversionRequest) -> JobOutcome {
        let started = Instant::now();
        info!("[{}] Processing {}", request.short_id(), request.input.display());
        let input_size = fs::metadata(&request.input).map(|m| m.len()).ok();

        // dropping the job future kills the running tool
        let outcome = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run(request)).await {
                Ok(outcome) => outcome,
                Err(_) => JobOutcome::Failed(JobFailure::TimedOut { secs: limit.as_secs() }),
            },
            None => self.run(request).await,
        };

        if let JobOutcome::Success(output) = &outcome {
            let output_size = fs::metadata(output).map(|m| m.len()).ok();
            info!(
                "[{}] {} -> {} in {:.1?}",
                request.short_id(),
                input_size.map(|s| format_size(s, DECIMAL)).unwrap_or_else(|| "?".to_string()),
                output_size.map(|s| format_size(s, DECIMAL)).unwrap_or_else(|| "?".to_string()),
                started.elapsed()
            );
        }
        self.reporter.outcome(&request.input, &outcome);
        outcome
    }

    async fn run(&self, request: &ConversionRequest) -> JobOutcome {
        let input = &request.input;

        // 1. paths
        if !input.is_file() {
            return JobOutcome::Failed(JobFailure::InvalidInput(input.clone()));
        }
        if let Err(source) = ensure_dir(&request.output_root) {
            return JobOutcome::Failed(JobFailure::OutputDir {
                path: request.output_root.clone(),
                source,
            });
        }

        // 2-3. output and idempotence
        let output = request.output_path();
        if output.exists() && !request.overwrite {
            return JobOutcome::SkippedExisting(output);
        }

        // 4. eligibility
        let eligibility = if request.pipeline.transcodes() {
            self.validator.check(input).await
        } else {
            self.validator.rules().check_extension(input)
        };
        if !eligibility.is_eligible() {
            return JobOutcome::SkippedIneligible(eligibility);
        }

        if let Some(parent) = output.parent() {
            if let Err(source) = fs::create_dir_all(parent) {
                return JobOutcome::Failed(JobFailure::Filesystem {
                    action: "create",
                    path: parent.to_path_buf(),
                    source,
                });
            }
        }

        // 5. transcode
        let mut current = input.clone();
        if request.pipeline.transcodes() {
            let temp = request.transcode_temp();
            if let Err(failure) = remove_stale(&temp) {
                return JobOutcome::Failed(failure);
            }
            info!("Transcoding {} with preset {}", input.display(), request.preset.name);
            let command = self.tools.handbrake_encode(&request.preset, &current, &temp);
            if let Err(e) = self.run_step(Step::Transcode, request, &command).await {
                return JobOutcome::Failed(JobFailure::Transcode(e));
            }
            current = temp;
        }

        // 6. normalize
        if request.pipeline.normalizes() {
            let temp = request.normalize_temp();
            if let Err(failure) = remove_stale(&temp) {
                return JobOutcome::Failed(failure);
            }
            info!("Normalizing {} to {}", current.display(), temp.display());
            let command = self.tools.normalize(&current, &temp, request.overwrite);
            if let Err(e) = self.run_step(Step::Normalize, request, &command).await {
                return JobOutcome::Failed(JobFailure::Normalize(e));
            }
            if current != *input {
                if let Err(e) = fs::remove_file(&current) {
                    warn!("Failed to remove {}: {}", current.display(), e);
                }
            }
            current = temp;
        }

        // 7. finalize
        if let Err(source) = fs::rename(&current, &output) {
            return JobOutcome::Failed(JobFailure::Filesystem {
                action: "rename",
                path: current,
                source,
            });
        }

        if request.waveforms {
            self.render_waveforms(request, &output).await;
        }

        if let Err(failure) = dispose_input(request) {
            return JobOutcome::Failed(failure);
        }

        JobOutcome::Success(output)
    }

    async fn run_step(&self, step: Step, request: &ConversionRequest, command: &ToolCommand) -> Result<(), RunError> {
        let input = request.input.as_path();
        let reporter = self.reporter.as_ref();
        let mut progress = ProgressState::default();

        let mut on_line = |line: &str| match parse_progress(line) {
            Some(percent) if step == Step::Transcode => {
                if let Some(percent) = progress.update(percent) {
                    reporter.progress(input, step, percent);
                }
            }
            _ => reporter.tool_output(input, step, line),
        };

        match self.runner.run_streaming(command, &mut on_line).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Error running {} on {}: {}", step.label(), input.display(), e);
                for line in e.stderr() {
                    error!("{}", line);
                }
                Err(e)
            }
        }
    }

    async fn render_waveforms(&self, request: &ConversionRequest, output: &Path) {
        let name = |path: &Path| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        let dir = output.parent().unwrap_or(&request.output_root);
        let before = dir.join(format!("{}.before.waveform.png", name(&request.input)));
        let after = dir.join(format!("{}.after.waveform.png", name(output)));

        tools::render_waveform(self.runner.as_ref(), &self.tools, &request.input, &before).await;
        tools::render_waveform(self.runner.as_ref(), &self.tools, output, &after).await;
    }
}

fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{} is not a directory", dir.display()),
        ));
    }
    Ok(())
}

/// Remove a temporary left behind by an interrupted run
fn remove_stale(temp: &Path) -> Result<(), JobFailure> {
    if !temp.exists() {
        return Ok(());
    }
    debug!("Removing stale temporary {}", temp.display());
    fs::remove_file(temp).map_err(|source| JobFailure::Filesystem {
        action: "remove stale",
        path: temp.to_path_buf(),
        source,
    })
}

/// Archive or delete the input of a finished job
fn dispose_input(request: &ConversionRequest) -> Result<(), JobFailure> {
    let input = &request.input;
    match request.archive_path() {
        Some(target) => {
            info!("Moving {} to {}", input.display(), target.display());
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| JobFailure::Filesystem {
                    action: "create",
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            move_file(input, &target).map_err(|source| JobFailure::Filesystem {
                action: "archive",
                path: input.clone(),
                source,
            })
        }
        None => {
            info!("Removing {}", input.display());
            fs::remove_file(input).map_err(|source| JobFailure::Filesystem {
                action: "remove",
                path: input.clone(),
                source,
            })
        }
    }
}

/// Rename, falling back to copy + delete across filesystems
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename {} failed ({}), copying instead", from.display(), e);
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
