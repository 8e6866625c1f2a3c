// ============================================================================
// src/main.rs – Host harness for headless and console installs
// ============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use recovery_bootstrap::cmd::{CommandRunner, SystemRunner};
use recovery_bootstrap::config::{Config, StoreBackend};
use recovery_bootstrap::orchestrator::{RecoveryOrchestrator, Terminal};
use recovery_bootstrap::reboot::UdevRemovalWatcher;
use recovery_bootstrap::store::{AnswerStore, DebconfStore, FileStore};
use recovery_bootstrap::ui::{ConsolePresenter, HeadlessPresenter, Presenter};
use recovery_bootstrap::RecoveryMode;

#[derive(Parser)]
#[command(name = "recovery-bootstrap")]
#[command(version, about = "Build the factory recovery partition and reboot into it")]
struct Cli {
    /// Config file (TOML by extension, YAML otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Choose a recovery type and carry it out
    Run {
        /// automatic, interactive or factory; skips the prompt
        #[arg(long, value_parser = parse_mode)]
        mode: Option<RecoveryMode>,
        /// Prompt on the terminal even when stdin is not a tty
        #[arg(long)]
        console: bool,
    },
    /// Trim to the recovery layout and reinstall the bootloader
    Finalize,
    /// Reboot without recovering
    Cancel,
}

fn parse_mode(value: &str) -> std::result::Result<RecoveryMode, String> {
    match RecoveryMode::parse(value) {
        RecoveryMode::Unset | RecoveryMode::Hdd => Err(format!(
            "`{value}` is not a selectable recovery type (automatic, interactive, factory)"
        )),
        mode => Ok(mode),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_runner(config: &Config) -> SystemRunner {
    let mut runner = SystemRunner::new(config.privilege.elevate.clone(), config.privilege.timeout());
    if let Some(program) = config.genuine.command.as_ref().and_then(|c| c.first()) {
        runner = runner.allow(program);
    }
    runner
}

fn build_store(config: &Config, runner: Arc<dyn CommandRunner>) -> Box<dyn AnswerStore> {
    match config.store.backend {
        StoreBackend::Debconf => Box::new(DebconfStore::new(runner)),
        StoreBackend::File => Box::new(FileStore::new(&config.store.path)),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let system = build_runner(&config);
    let watcher = UdevRemovalWatcher::new(system.clone());
    let runner: Arc<dyn CommandRunner> = Arc::new(system);
    let store = build_store(&config, runner.clone());
    let orchestrator = RecoveryOrchestrator::new(config, runner, store, Box::new(watcher))
        .context("invalid configuration")?;

    let terminal = match cli.command {
        Commands::Run { mode, console } => {
            // OEM first-boot configuration has nobody at the console
            let oem = std::env::var_os("UBIQUITY_OEM_USER_CONFIG").is_some();
            let interactive =
                !oem && (console || (mode.is_none() && atty::is(atty::Stream::Stdin)));
            let mut presenter: Box<dyn Presenter> = if interactive {
                Box::new(ConsolePresenter::new())
            } else {
                Box::new(HeadlessPresenter::new(mode))
            };
            orchestrator
                .run(presenter.as_mut())
                .context("recovery run failed")?
        }
        Commands::Finalize => {
            let mut presenter = HeadlessPresenter::new(Some(RecoveryMode::Factory));
            let prepared = orchestrator.prepare(&mut presenter)?;
            let run = orchestrator.commit_selection(&prepared, RecoveryMode::Factory)?;
            orchestrator
                .cleanup(&run, &mut presenter)
                .context("factory finalize failed")?
        }
        Commands::Cancel => {
            orchestrator.cancel().context("reboot failed")?;
            Terminal::Cancelled
        }
    };

    info!(outcome = ?terminal, "done");
    Ok(())
}
