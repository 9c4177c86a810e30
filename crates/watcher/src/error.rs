use std::path::PathBuf;
use thiserror::Error;

/// Failure while running an external tool
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {secs} seconds and was killed")]
    TimedOut { program: String, secs: u64 },

    #[error("{program} exited with {}", describe_exit(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: Vec<String>,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl RunError {
    /// Captured stderr lines, empty unless the tool ran and failed
    pub fn stderr(&self) -> &[String] {
        match self {
            RunError::Failed { stderr, .. } => stderr,
            _ => &[],
        }
    }
}

/// Why a conversion job ended in `JobOutcome::Failed`
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error("input is not a regular file: {}", .0.display())]
    InvalidInput(PathBuf),

    #[error("output directory {} is unusable: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transcode failed: {0}")]
    Transcode(#[source] RunError),

    #[error("normalize failed: {0}")]
    Normalize(#[source] RunError),

    #[error("job did not finish within {secs} seconds; the running tool was killed")]
    TimedOut { secs: u64 },

    #[error("failed to {action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that stop the process before any file is handled
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("HandBrake self-test failed for preset {preset:?}")]
    SelfTest {
        preset: String,
        #[source]
        source: RunError,
    },

    #[error("watch directory {} does not exist or is not a directory", .0.display())]
    WatchDir(PathBuf),

    #[error("output directory {} cannot be created: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output directory must differ from the watch directory ({})", .0.display())]
    OutputIsWatchDir(PathBuf),

    #[error("completed directory must differ from the watch and output directories ({})", .0.display())]
    CompletedDirConflict(PathBuf),

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// The watcher could not be started
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {}: {source}", path.display())]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("watch root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
}
