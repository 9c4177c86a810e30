pub mod config;
pub mod error;
pub mod runner;
pub mod tools;
pub mod probe;
pub mod validator;
pub mod progress;
pub mod job;
pub mod scan;
pub mod watch;

#[cfg(test)]
mod testing;

pub use config::WatchConfig;
pub use error::{JobFailure, RunError, StartupError, WatchError};
pub use job::{ConversionRequest, Converter, JobOutcome, Pipeline, RequestTemplate};
pub use progress::{LogReporter, Reporter};
pub use runner::{ProcessRunner, ToolCommand, ToolRunner};
pub use validator::{Eligibility, EligibilityRules, MediaValidator};
pub use watch::{DirectoryWatcher, WatchStrategy, WatchTarget};
