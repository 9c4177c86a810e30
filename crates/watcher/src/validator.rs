use std::fmt;
use std::path::Path;
use std::sync::Arc;
use log::{debug, info};
use crate::config::WatchConfig;
use crate::probe::{self, MediaProbeResult};
use crate::runner::ToolRunner;
use crate::tools::Tools;

/// Result of checking a candidate file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Extension is not one of the accepted containers
    UnsupportedExtension(String),
    /// Probe failed or its output could not be read
    ProbeFailed(String),
    /// Main title already uses the excluded codec
    ExcludedCodec(String),
    NoAudio,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::Eligible => write!(f, "eligible"),
            Eligibility::UnsupportedExtension(ext) => write!(f, "unsupported extension {:?}", ext),
            Eligibility::ProbeFailed(reason) => write!(f, "probe failed: {}", reason),
            Eligibility::ExcludedCodec(codec) => write!(f, "video codec is already {}", codec),
            Eligibility::NoAudio => write!(f, "no audio streams"),
        }
    }
}

/// Eligibility rules that do not depend on the probe
#[derive(Debug, Clone)]
pub struct EligibilityRules {
    pub accepted_extensions: Vec<String>,
    pub excluded_video_codec: String,
}

impl EligibilityRules {
    pub fn from_config(cfg: &WatchConfig) -> Self {
        Self {
            accepted_extensions: cfg.accepted_extensions.clone(),
            excluded_video_codec: cfg.excluded_video_codec.clone(),
        }
    }

    pub fn check_extension(&self, path: &Path) -> Eligibility {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        if self.accepted_extensions.iter().any(|a| *a == ext) {
            Eligibility::Eligible
        } else {
            Eligibility::UnsupportedExtension(ext)
        }
    }

    /// Codec rule first, then audio presence
    pub fn check_probe(&self, probe: &MediaProbeResult) -> Eligibility {
        if probe.video_codec == self.excluded_video_codec {
            return Eligibility::ExcludedCodec(probe.video_codec.clone());
        }
        if probe.audio_streams.is_empty() {
            return Eligibility::NoAudio;
        }
        Eligibility::Eligible
    }
}

/// Decides whether a file is worth handing to HandBrake.
///
/// Fails closed: any probe problem makes the file ineligible rather than
/// surfacing as an error.
pub struct MediaValidator<R> {
    runner: Arc<R>,
    tools: Tools,
    rules: EligibilityRules,
}

impl<R: ToolRunner> MediaValidator<R> {
    pub fn new(runner: Arc<R>, tools: Tools, rules: EligibilityRules) -> Self {
        Self { runner, tools, rules }
    }

    pub fn rules(&self) -> &EligibilityRules {
        &self.rules
    }

    pub async fn is_eligible(&self, path: &Path) -> bool {
        self.check(path).await.is_eligible()
    }

    pub async fn check(&self, path: &Path) -> Eligibility {
        let by_extension = self.rules.check_extension(path);
        if !by_extension.is_eligible() {
            debug!("{}: {}", path.display(), by_extension);
            return by_extension;
        }

        let probe = match probe::probe_file(self.runner.as_ref(), &self.tools, path).await {
            Ok(probe) => probe,
            Err(e) => {
                debug!("Probe of {} failed: {:#}", path.display(), e);
                return Eligibility::ProbeFailed(format!("{:#}", e));
            }
        };

        info!("main title: {}", probe.summary());
        info!(
            "Found {} audio streams in source: {}",
            probe.audio_streams.len(),
            probe.audio_summary()
        );

        self.rules.check_probe(&probe)
    }
}
