//! rootstrap - main entry point

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rootstrap::command::{CommandRunner, RecordingRunner, SystemRunner};
use rootstrap::config_file::InstallationConfig;
use rootstrap::installer::{InstallOutcome, InstallationContext, Installer, DEFAULT_TARGET_ROOT};
use rootstrap::process_guard;
use rootstrap::progress::{CancellationToken, ProgressSink};

use crate::cli::{Cli, Commands};

/// Log to stderr; `RUST_LOG` overrides the default `info` level
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    match cli.command {
        Commands::Validate { config } => {
            info!("Validating configuration file: {}", config.display());
            let loaded = InstallationConfig::load_from_file(&config)?;
            match loaded.validate() {
                Ok(()) => {
                    println!("✓ Configuration file is valid: {}", config.display());
                    Ok(())
                }
                Err(e) => {
                    error!("Configuration validation failed: {:#}", e);
                    eprintln!("✗ Configuration validation failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Install {
            config,
            target_root,
            settle_delay,
        } => {
            let code = run_install(&config, target_root, Duration::from_secs(settle_delay), cli.dry_run)?;
            std::process::exit(code);
        }
    }
}

/// Scratch target root for dry runs
fn dry_run_root() -> anyhow::Result<PathBuf> {
    let root = std::env::temp_dir().join(format!("rootstrap-dry-run-{}", std::process::id()));
    std::fs::create_dir_all(&root).with_context(|| format!("Failed to create {}", root.display()))?;
    Ok(root)
}

fn run_install(config_path: &Path, target_root: Option<PathBuf>, settle_delay: Duration, dry_run: bool) -> anyhow::Result<i32> {
    let config = InstallationConfig::load_from_file(config_path)?;
    config.validate().context("Configuration validation failed")?;

    let token = CancellationToken::new();
    if let Err(e) = process_guard::init_signal_handlers(token.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let target_root = match (target_root, dry_run) {
        (Some(root), _) => root,
        (None, true) => dry_run_root()?,
        (None, false) => PathBuf::from(DEFAULT_TARGET_ROOT),
    };

    let sink: ProgressSink = Arc::new(|message: &str, fraction: Option<f64>| match fraction {
        Some(f) => eprintln!("[{:>3.0}%] {}", f * 100.0, message),
        None => eprintln!("       {}", message),
    });
    let context = InstallationContext::default()
        .with_target_root(&target_root)
        .with_cancellation(token)
        .with_sink(sink)
        .with_settle_delay(if dry_run { Duration::ZERO } else { settle_delay });

    let recorder = Arc::new(RecordingRunner::new());
    let runner: Arc<dyn CommandRunner> = if dry_run {
        info!("Dry run: commands are recorded, not executed");
        recorder.clone() as Arc<dyn CommandRunner>
    } else {
        Arc::new(SystemRunner::new()) as Arc<dyn CommandRunner>
    };

    let handle = Installer::new(config, context, runner)
        .spawn()
        .context("Failed to start installation worker")?;
    let result = handle
        .join()
        .map_err(|_| anyhow::anyhow!("Installation worker panicked"))?;

    if dry_run {
        println!("# Commands that would run:");
        for line in recorder.command_lines() {
            println!("{}", line);
        }
    }

    for warning in &result.warnings {
        println!("warning: {}", warning);
    }

    let code = match &result.outcome {
        InstallOutcome::Success => {
            println!("✓ Installation completed ({} warning(s))", result.warnings.len());
            0
        }
        InstallOutcome::StoppedByUser => {
            println!("Installation stopped by user");
            130
        }
        InstallOutcome::Failed(message) => {
            eprintln!("✗ Installation failed at {:.0}%: {}", result.fraction * 100.0, message);
            for diagnostic in result.diagnostics.iter().skip(1) {
                eprintln!("{}", diagnostic);
            }
            1
        }
    };
    Ok(code)
}
