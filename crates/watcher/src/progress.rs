use std::path::Path;
use log::{debug, error, info, warn};
use crate::job::JobOutcome;

/// Which external step a progress or output line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Transcode,
    Normalize,
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Step::Transcode => "transcode",
            Step::Normalize => "normalize",
        }
    }
}

/// Observability handle passed to the conversion pipeline
pub trait Reporter: Send + Sync {
    /// Whole-percent progress of a running step
    fn progress(&self, input: &Path, step: Step, percent: f64);

    /// A line of human-readable tool output
    fn tool_output(&self, input: &Path, step: Step, line: &str);

    fn outcome(&self, input: &Path, outcome: &JobOutcome);
}

/// Reports through the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn progress(&self, input: &Path, step: Step, percent: f64) {
        // every 10% at info, the rest at debug
        if (percent as u32) % 10 == 0 {
            info!("{} {}: {:.0}%", step.label(), display_name(input), percent);
        } else {
            debug!("{} {}: {:.0}%", step.label(), display_name(input), percent);
        }
    }

    fn tool_output(&self, _input: &Path, step: Step, line: &str) {
        match step {
            Step::Normalize => info!("{}", line),
            Step::Transcode => debug!("{}", line),
        }
    }

    fn outcome(&self, input: &Path, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Success(output) => {
                info!("Completed conversion of {} -> {}", input.display(), output.display())
            }
            JobOutcome::SkippedExisting(output) => info!(
                "Output file {} already exists, not overwriting {}",
                output.display(),
                input.display()
            ),
            JobOutcome::SkippedIneligible(reason) => {
                warn!("{} is not an eligible video file ({}). Skipping", input.display(), reason)
            }
            JobOutcome::Failed(reason) => error!("Conversion of {} failed: {}", input.display(), reason),
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Percent complete of one running step
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    percent: f64,
    reported: Option<u32>,
}

impl ProgressState {
    pub fn percent(&self) -> f64 {
        self.percent
    }

    /// Record a new value; returns it when the whole-percent value changed
    /// and should be reported
    pub fn update(&mut self, percent: f64) -> Option<f64> {
        if !percent.is_finite() {
            return None;
        }
        self.percent = percent.clamp(0.0, 100.0);
        let whole = self.percent.floor() as u32;
        if self.reported == Some(whole) {
            return None;
        }
        self.reported = Some(whole);
        Some(self.percent)
    }
}
