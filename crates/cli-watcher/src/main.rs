use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use watcher::{
    config::WatchConfig,
    job::{Converter, Pipeline, RequestTemplate},
    progress::LogReporter,
    runner::ProcessRunner,
    tools::{self, Tools},
    validator::EligibilityRules,
    watch::{DirectoryWatcher, WatchTarget},
};

/// Watch a directory and convert finished videos with HandBrakeCLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcode stable files with HandBrake, then normalize their audio
    Convert {
        #[command(flatten)]
        watch: WatchArgs,

        /// HandBrake preset file to import
        #[arg(long)]
        preset_file: Option<PathBuf>,

        /// HandBrake preset name
        #[arg(long)]
        preset: Option<String>,

        /// Skip ffmpeg-normalize after the transcode
        #[arg(long)]
        no_normalize: bool,

        /// Render before/after waveform images next to each output
        #[arg(long)]
        waveforms: bool,
    },

    /// Normalize the audio of stable files without transcoding
    Normalize {
        #[command(flatten)]
        watch: WatchArgs,
    },

    /// Render the waveform image of a single file next to it
    Waveform {
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Log stable-file events without converting anything
    Events {
        #[arg(short, long)]
        watch: PathBuf,

        /// Re-scan the tree instead of using native notifications; needed
        /// for network shares (NFS, SMB), which never report remote writes
        #[arg(long)]
        poll: bool,

        /// Only watch the top-level directory
        #[arg(long)]
        non_recursive: bool,
    },
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// Directory to watch
    #[arg(short, long)]
    watch: Option<PathBuf>,

    /// Directory converted files are written to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Move processed inputs here instead of deleting them
    #[arg(long)]
    completed: Option<PathBuf>,

    /// Replace outputs that already exist
    #[arg(long)]
    overwrite: bool,

    /// Re-scan the tree instead of using native notifications; needed
    /// for network shares (NFS, SMB), which never report remote writes
    #[arg(long)]
    poll: bool,

    /// Seconds between polling scans
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Ignore files that exist before the watcher starts
    #[arg(long)]
    no_existing: bool,

    /// Only watch the top-level directory
    #[arg(long)]
    non_recursive: bool,

    /// Fail a job, killing its running tool, after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl WatchArgs {
    /// Command-line flags win over the configuration file
    fn apply(&self, cfg: &mut WatchConfig) {
        if let Some(dir) = &self.watch {
            cfg.watch_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.output {
            cfg.output_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.completed {
            cfg.completed_dir = Some(dir.clone());
        }
        if let Some(secs) = self.poll_interval {
            cfg.poll_interval_secs = secs;
        }
        if let Some(secs) = self.timeout {
            cfg.job_timeout_secs = Some(secs);
        }
        cfg.overwrite |= self.overwrite;
        cfg.force_polling |= self.poll;
        cfg.process_existing &= !self.no_existing;
        cfg.recursive &= !self.non_recursive;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins unless --debug is given; info by default
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    logger.format_timestamp_secs();
    if args.debug {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    let mut cfg = WatchConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Convert {
            watch,
            preset_file,
            preset,
            no_normalize,
            waveforms,
        } => {
            watch.apply(&mut cfg);
            if let Some(file) = preset_file {
                cfg.preset_file = Some(file);
            }
            if let Some(name) = preset {
                cfg.preset = name;
            }
            cfg.normalize_audio &= !no_normalize;
            cfg.generate_waveforms |= waveforms;
            let pipeline = Pipeline::Transcode {
                normalize: cfg.normalize_audio,
            };
            watch_and_convert(cfg, pipeline).await
        }
        Command::Normalize { watch } => {
            watch.apply(&mut cfg);
            watch_and_convert(cfg, Pipeline::NormalizeOnly).await
        }
        Command::Waveform { input } => render_one_waveform(&cfg, &input).await,
        Command::Events {
            watch,
            poll,
            non_recursive,
        } => {
            cfg.force_polling |= poll;
            cfg.recursive &= !non_recursive;
            log_events(&cfg, watch).await
        }
    }
}

async fn watch_and_convert(mut cfg: WatchConfig, pipeline: Pipeline) -> Result<()> {
    cfg.resolve_directories().context("Invalid directories")?;
    let template = RequestTemplate::from_config(&cfg, pipeline)?;

    info!("HandBrake watcher starting");
    info!("Configuration loaded:");
    info!("  Watch dir: {}", template.watch_root.display());
    info!("  Output dir: {}", template.output_root.display());
    match &template.archive_dir {
        Some(dir) => info!("  Completed dir: {}", dir.display()),
        None => info!("  Completed dir: none, inputs are deleted after conversion"),
    }
    info!("  Pipeline: {:?}", pipeline);
    info!("  Overwrite: {}", template.overwrite);

    let runner = Arc::new(ProcessRunner);
    let tools = Tools::from_config(&cfg);

    if pipeline.transcodes() {
        tools::self_test(runner.as_ref(), &tools, &template.preset)
            .await
            .context("HandBrake cannot run with the configured preset")?;
    }

    let converter = Arc::new(Converter::new(
        runner,
        tools,
        EligibilityRules::from_config(&cfg),
        Arc::new(LogReporter),
    ));

    let mut target = WatchTarget::from_config(&cfg, template.watch_root.clone()).exclude(&template.output_root);
    if let Some(archive) = &template.archive_dir {
        target = target.exclude(archive);
    }
    let watcher = DirectoryWatcher::new(target)?;

    let template = Arc::new(template);
    watcher
        .run(
            move |path| {
                let converter = converter.clone();
                let template = template.clone();
                async move {
                    let request = template.request_for(path);
                    converter.convert(&request).await;
                    anyhow::Ok(())
                }
            },
            shutdown_signal(),
        )
        .await?;

    info!("HandBrake watcher stopped");
    Ok(())
}

async fn log_events(cfg: &WatchConfig, root: PathBuf) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Watch directory does not exist: {}", root.display()))?;
    DirectoryWatcher::new(WatchTarget::from_config(cfg, root))?
        .run(
            |path| async move {
                info!("Stable file: {}", path.display());
                anyhow::Ok(())
            },
            shutdown_signal(),
        )
        .await?;
    Ok(())
}

async fn render_one_waveform(cfg: &WatchConfig, input: &Path) -> Result<()> {
    if !input.is_file() {
        bail!("Input file does not exist: {}", input.display());
    }
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let image = input.with_file_name(format!("{}.waveform.png", name));

    if !tools::render_waveform(&ProcessRunner, &Tools::from_config(cfg), input, &image).await {
        bail!("Failed to render waveform for {}", input.display());
    }
    info!("Wrote {}", image.display());
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown requested");
}
