// ============================================================================
// src/reboot.rs – Eject the medium, wait for it to go, then boot recovery
// ============================================================================

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::cmd::{run_checked, CommandRunner, Invocation, SystemRunner};
use crate::config::{Layout, RebootCfg};
use crate::device::backing_device;
use crate::error::{RecoveryError, Result, Step};
use crate::ui::Presenter;
use crate::util::audit::audit_log;

/// How the machine was sent into the recovery partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPath {
    KernelExec,
    FullReboot,
}

/// One armed notification of a removable device going away.
pub trait RemovalSubscription {
    /// True when a removal arrived within `timeout`.
    fn wait(&mut self, timeout: Duration) -> bool;
}

pub trait RemovalWatcher {
    /// Arm before ejecting so the removal cannot be missed. `node` is the
    /// medium's kernel name (`sdb1`); `None` accepts any block removal.
    fn subscribe(&self, node: Option<&str>) -> Result<Box<dyn RemovalSubscription>>;
}

/// Watches udev block events for the medium's `remove` action.
#[derive(Debug, Clone)]
pub struct UdevRemovalWatcher {
    runner: SystemRunner,
    program: PathBuf,
}

impl UdevRemovalWatcher {
    pub fn new(runner: SystemRunner) -> Self {
        Self {
            runner,
            program: PathBuf::from("udevadm"),
        }
    }
}

impl RemovalWatcher for UdevRemovalWatcher {
    fn subscribe(&self, node: Option<&str>) -> Result<Box<dyn RemovalSubscription>> {
        let monitor = Invocation::new(self.program.to_string_lossy())
            .args(["monitor", "--udev", "--subsystem-match=block"]);
        let mut child = self.runner.stream(Step::Eject, &monitor)?;

        let node = node.map(str::to_string);
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    if is_removal_event(&line, node.as_deref()) && tx.send(()).is_err() {
                        break;
                    }
                }
            });
        }
        Ok(Box::new(UdevSubscription { child, events: rx }))
    }
}

/// `UDEV  [1234.5] remove   /devices/.../block/sdb/sdb1 (block)`
///
/// With a `node`, only that device or the disk holding it counts.
pub fn is_removal_event(line: &str, node: Option<&str>) -> bool {
    let mut words = line.split_whitespace();
    if !words.any(|word| word == "remove") {
        return false;
    }
    let Some(node) = node else {
        return true;
    };
    let Some(devpath) = words.next() else {
        return false;
    };
    let name = devpath.rsplit('/').next().unwrap_or(devpath);
    if name.is_empty() {
        return false;
    }
    match node.strip_prefix(name) {
        Some("") => true,
        Some(rest) => {
            let rest = rest.strip_prefix('p').unwrap_or(rest);
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Kernel name of the device mounted at `mount_point`, from a mount table.
fn medium_node(mounts_file: &Path, mount_point: &Path) -> Option<String> {
    let mounts = fs::read_to_string(mounts_file).ok()?;
    let device = backing_device(&mounts, mount_point)?;
    let device = fs::canonicalize(&device).unwrap_or_else(|_| PathBuf::from(device));
    device
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

struct UdevSubscription {
    child: Child,
    events: Receiver<()>,
}

impl RemovalSubscription for UdevSubscription {
    fn wait(&mut self, timeout: Duration) -> bool {
        match self.events.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

impl Drop for UdevSubscription {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Copies of the helpers that survive the medium being ejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedHelpers {
    pub reboot: PathBuf,
    pub kexec: Option<PathBuf>,
}

pub struct FastRebootCoordinator<'a> {
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
    cfg: &'a RebootCfg,
    watcher: &'a dyn RemovalWatcher,
}

impl<'a> FastRebootCoordinator<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        layout: &'a Layout,
        cfg: &'a RebootCfg,
        watcher: &'a dyn RemovalWatcher,
    ) -> Self {
        Self {
            runner,
            layout,
            cfg,
            watcher,
        }
    }

    /// Copy `reboot` (and `kexec` when wanted) into the staging directory.
    pub fn stage_helpers(&self, fast_reboot: bool) -> StagedHelpers {
        let reboot = match self.stage(&self.layout.reboot_binary) {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "reboot helper not staged; using the installed one");
                self.layout.reboot_binary.clone()
            }
        };

        let helper = self.layout.kexec_helper();
        let kexec = if fast_reboot && helper.exists() {
            self.stage(&helper)
                .map_err(|err| warn!(error = %err, "kexec helper not staged"))
                .ok()
        } else {
            None
        };

        StagedHelpers { reboot, kexec }
    }

    fn stage(&self, helper: &Path) -> Result<PathBuf> {
        let name = helper.file_name().unwrap_or(helper.as_os_str());
        let dest = self.layout.staging_dir.join(name);
        fs::copy(helper, &dest).map_err(|e| {
            RecoveryError::io(
                Step::StageHelpers,
                format!("copying {} to {}", helper.display(), dest.display()),
                e,
            )
        })?;
        Ok(dest)
    }

    /// Final step of an automatic build. Only returns when the reboot
    /// command itself returned; a real reboot never gets that far.
    pub fn reboot(
        &self,
        presenter: &mut dyn Presenter,
        fast_reboot: bool,
        kernel_staged: bool,
    ) -> Result<RebootPath> {
        let helpers = self.stage_helpers(fast_reboot);

        let node = medium_node(&self.layout.mounts_file, &self.layout.source_root);
        if node.is_none() {
            warn!("installation medium not in the mount table; any block removal counts");
        }
        let mut subscription = match self.watcher.subscribe(node.as_deref()) {
            Ok(sub) => Some(sub),
            Err(err) => {
                warn!(error = %err, "removal notifications unavailable");
                None
            }
        };

        if self.cfg.eject {
            let eject = Invocation::root("eject")
                .args(["-p", "-m"])
                .arg_path(&self.layout.source_root);
            if let Err(err) = run_checked(self.runner, Step::Eject, &eject) {
                warn!(error = %err, "eject failed");
            }
        }

        presenter.show_reboot();

        if let Some(sub) = subscription.as_mut() {
            if sub.wait(self.cfg.removal_wait()) {
                info!("installation medium removed");
            } else {
                warn!(
                    secs = self.cfg.removal_wait_secs,
                    "no removal seen; rebooting anyway"
                );
            }
        }
        drop(subscription);

        if let (Some(kexec), true) = (&helpers.kexec, kernel_staged) {
            let exec = Invocation::root(kexec.to_string_lossy()).arg("-e");
            match run_checked(self.runner, Step::KernelExec, &exec) {
                Ok(_) => {
                    audit_log(&self.layout.audit_log, "REBOOT", "kexec");
                    return Ok(RebootPath::KernelExec);
                }
                Err(err) => warn!(error = %err, "kexec -e failed; falling back to reboot"),
            }
        }

        self.full_reboot(&helpers.reboot)?;
        Ok(RebootPath::FullReboot)
    }

    /// Plain `reboot -n`, bypassing the fast path.
    pub fn full_reboot(&self, binary: &Path) -> Result<()> {
        let reboot = Invocation::root(binary.to_string_lossy()).arg("-n");
        run_checked(self.runner, Step::Reboot, &reboot)?;
        audit_log(&self.layout.audit_log, "REBOOT", "full");
        Ok(())
    }
}
