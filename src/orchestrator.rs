// ============================================================================
// src/orchestrator.rs – Mode selection and sequencing of the recovery run
// ============================================================================
//
// Init → ModeSelected → {AutomaticBuild | InteractiveDefer | FactoryFinalize}
// → Terminal. Each phase hands a typed value to the next; nothing about the
// run is kept in mutable fields.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cmd::{CommandRunner, Invocation};
use crate::config::Config;
use crate::device::{DeviceResolver, TargetDevice};
use crate::error::{RecoveryError, Result, Step};
use crate::mode::RecoveryMode;
use crate::reboot::{FastRebootCoordinator, RebootPath, RemovalWatcher};
use crate::store::{
    parse_bool, AnswerStore, DEFAULT_DISK, DRIVE_PRESEEDS, FAST_REBOOT, PARTITIONER_OVERRIDES,
    RECOVERY_TYPE, TARGET_DISK,
};
use crate::swap::SwapGuard;
use crate::ui::{Presenter, Selection};
use crate::util::audit::audit_log;
use crate::util::tree::TreeFilter;
use crate::writer::{BuildOutcome, DiskWriter};

const PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// What `prepare` learned from the store and the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    /// Value found in the store before it was cleared.
    pub persisted: RecoveryMode,
    pub fast_reboot: bool,
    pub disk: PathBuf,
    pub genuine: bool,
}

/// Fixed for the rest of the run once the selection is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub mode: RecoveryMode,
    pub device: PathBuf,
    pub fast_reboot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Automatic build done; the machine is on its way into recovery.
    Rebooting(RebootPath),
    /// Interactive: the downstream partitioner takes over.
    Deferred,
    /// Factory: layout trimmed and bootloader reinstalled.
    Finalized,
    Cancelled,
}

pub struct RecoveryOrchestrator {
    config: Config,
    filter: TreeFilter,
    runner: Arc<dyn CommandRunner>,
    store: Box<dyn AnswerStore>,
    watcher: Box<dyn RemovalWatcher>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        store: Box<dyn AnswerStore>,
        watcher: Box<dyn RemovalWatcher>,
    ) -> Result<Self> {
        let filter = TreeFilter::new(&config.build.tree_filter)?;
        Ok(Self {
            config,
            filter,
            runner,
            store,
            watcher,
        })
    }

    /// Read the persisted answers and put the page into its initial state.
    pub fn prepare(&self, presenter: &mut dyn Presenter) -> Result<Prepared> {
        let persisted = self
            .store
            .get(RECOVERY_TYPE)?
            .map(|v| RecoveryMode::parse(&v))
            .unwrap_or(RecoveryMode::Unset);

        // anything but factory needs the operator, even in an automatic install
        if persisted == RecoveryMode::Factory {
            self.store.set_seen(RECOVERY_TYPE, true)?;
        } else {
            self.store.set(RECOVERY_TYPE, "")?;
            self.store.set_seen(RECOVERY_TYPE, false)?;
        }

        let fast_reboot = self
            .store
            .get(FAST_REBOOT)?
            .map(|v| parse_bool(&v))
            .unwrap_or(true);
        let disk = self
            .store
            .get(TARGET_DISK)?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DISK.to_string());

        let genuine = self.genuine_check();
        presenter.set_genuine(genuine);
        presenter.set_mode(persisted);
        if !genuine {
            presenter.allow_forward(false);
        }

        info!(mode = %persisted, fast_reboot, disk = %disk, genuine, "recovery prepared");
        Ok(Prepared {
            persisted,
            fast_reboot,
            disk: PathBuf::from(disk),
            genuine,
        })
    }

    /// Vendor platform check; genuine when none is configured.
    fn genuine_check(&self) -> bool {
        let Some((program, args)) = self
            .config
            .genuine
            .command
            .as_deref()
            .and_then(|c| c.split_first())
        else {
            return true;
        };
        let check = Invocation::root(program).args(args);
        match self.runner.run(Step::GenuineCheck, &check) {
            Ok(out) => out.success(),
            Err(err) => {
                warn!(error = %err, "platform check could not run");
                false
            }
        }
    }

    /// Persist the operator's choice; it overrides whatever was stored.
    pub fn commit_selection(&self, prepared: &Prepared, mode: RecoveryMode) -> Result<RunConfig> {
        let needs_genuine = matches!(mode, RecoveryMode::Automatic | RecoveryMode::Interactive);
        if needs_genuine && !prepared.genuine {
            return Err(RecoveryError::NotGenuine(mode));
        }
        self.store.set(RECOVERY_TYPE, mode.as_str())?;
        Ok(RunConfig {
            mode,
            device: prepared.disk.clone(),
            fast_reboot: prepared.fast_reboot,
        })
    }

    /// Carry out the committed mode. Failures are shown to the operator
    /// before they are returned; nothing reboots after a failure.
    pub fn cleanup(&self, run: &RunConfig, presenter: &mut dyn Presenter) -> Result<Terminal> {
        let result = self.execute(run, presenter);
        if let Err(err) = &result {
            presenter.hide_progress();
            presenter.show_error(&err.to_string());
            audit_log(&self.config.layout.audit_log, "RECOVERY_FAIL", &err.to_string());
        }
        result
    }

    fn execute(&self, run: &RunConfig, presenter: &mut dyn Presenter) -> Result<Terminal> {
        if run.mode.is_blocked() {
            return Err(RecoveryError::ModeBlocked(run.mode));
        }

        let device = DeviceResolver::new(self.runner.as_ref(), &self.config.layout)
            .resolve(TargetDevice::new(&run.device))?;

        match run.mode {
            RecoveryMode::Automatic => self.automatic_build(run, device, presenter),
            RecoveryMode::Interactive => self.interactive_defer(),
            RecoveryMode::Factory => self.factory_finalize(&device),
            RecoveryMode::Hdd | RecoveryMode::Unset => Err(RecoveryError::ModeBlocked(run.mode)),
        }
    }

    fn writer(&self) -> DiskWriter {
        DiskWriter::new(
            self.runner.clone(),
            self.config.layout.clone(),
            self.config.build.clone(),
            self.filter.clone(),
        )
    }

    fn swap_guard(&self) -> SwapGuard<'_> {
        SwapGuard::new(self.runner.as_ref(), &self.config.layout)
    }

    fn automatic_build(
        &self,
        run: &RunConfig,
        device: TargetDevice,
        presenter: &mut dyn Presenter,
    ) -> Result<Terminal> {
        presenter.show_progress("Building the recovery partition");
        self.swap_guard().disable(&device)?;

        let rx = Arc::new(self.writer()).spawn_build(device, run.fast_reboot)?;
        let report = wait_for_outcome(&rx, presenter)?;
        presenter.hide_progress();
        info!(
            utility_mb = report.plan.utility_mb,
            recovery_mb = report.plan.recovery_mb,
            kernel_staged = report.kernel_staged,
            "recovery partition built"
        );

        let path = FastRebootCoordinator::new(
            self.runner.as_ref(),
            &self.config.layout,
            &self.config.reboot,
            self.watcher.as_ref(),
        )
        .reboot(presenter, run.fast_reboot, report.kernel_staged)?;
        Ok(Terminal::Rebooting(path))
    }

    /// Hand the disk to the installer's own partitioner.
    fn interactive_defer(&self) -> Result<Terminal> {
        for key in DRIVE_PRESEEDS {
            self.store.set_seen(key, false)?;
            self.store.set(key, "")?;
        }
        for (key, value) in PARTITIONER_OVERRIDES {
            self.store.set(key, value)?;
        }
        info!("drive preseeds cleared for interactive recovery");
        Ok(Terminal::Deferred)
    }

    fn factory_finalize(&self, device: &TargetDevice) -> Result<Terminal> {
        self.swap_guard().disable(device)?;
        let writer = self.writer();
        writer.trim_to_recovery_layout(device)?;
        writer.reinstall_bootloader(device)?;
        audit_log(
            &self.config.layout.audit_log,
            "FACTORY_FINALIZE",
            &device.path.display().to_string(),
        );
        Ok(Terminal::Finalized)
    }

    /// Operator declined recovery: plain reboot, no fast path.
    pub fn cancel(&self) -> Result<()> {
        info!("recovery cancelled; rebooting");
        FastRebootCoordinator::new(
            self.runner.as_ref(),
            &self.config.layout,
            &self.config.reboot,
            self.watcher.as_ref(),
        )
        .full_reboot(&self.config.layout.reboot_binary)
    }

    /// The whole page lifecycle for hosts that drive it in one go.
    pub fn run(&self, presenter: &mut dyn Presenter) -> Result<Terminal> {
        let prepared = self.prepare(presenter)?;
        match presenter.await_selection() {
            Selection::Cancel => {
                self.cancel()?;
                Ok(Terminal::Cancelled)
            }
            Selection::Proceed(mode) => {
                let run = self.commit_selection(&prepared, mode)?;
                self.cleanup(&run, presenter)
            }
        }
    }
}

/// Keep the presenter alive while the worker builds.
fn wait_for_outcome(rx: &Receiver<BuildOutcome>, presenter: &mut dyn Presenter) -> BuildOutcome {
    loop {
        match rx.recv_timeout(PUMP_INTERVAL) {
            Ok(outcome) => return outcome,
            Err(RecvTimeoutError::Timeout) => presenter.pump(),
            Err(RecvTimeoutError::Disconnected) => return Err(RecoveryError::WorkerLost),
        }
    }
}
