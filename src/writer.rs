// ============================================================================
// src/writer.rs – Destructive recovery-partition build sequence
// ============================================================================
//
// Steps run strictly in order and stop at the first failure. Nothing is rolled
// back: a failed run leaves the disk exactly as the completed prefix left it,
// and the returned error names the step that stopped it.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::cmd::{pipe_checked, run_checked, CommandRunner, Invocation};
use crate::config::{BuildCfg, Layout};
use crate::device::TargetDevice;
use crate::error::{RecoveryError, Result, Step};
use crate::plan::{PartitionPlan, PartitionPlanner};
use crate::util::audit::audit_log;
use crate::util::tree::{tree_manifest, TreeFilter};

const RECOVERY_TYPE_MARKERS: &[&str] = &[
    "dell-recovery/recovery_type=dvd",
    "dell-recovery/recovery_type=hdd",
];
const FACTORY_MARKER: &str = "dell-recovery/recovery_type=factory";

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub plan: PartitionPlan,
    /// Steps that ran, in order.
    pub steps: Vec<Step>,
    /// A recovery kernel is loaded and ready for `kexec -e`.
    pub kernel_staged: bool,
}

/// Result handed from the build worker back to the orchestrator.
pub type BuildOutcome = Result<BuildReport>;

/// Boot the recovery copy straight into factory finalization.
pub fn factory_cmdline(cmdline: &str) -> String {
    let mut line = cmdline.trim_end_matches('\n').to_string();
    for marker in RECOVERY_TYPE_MARKERS {
        line = line.replace(marker, FACTORY_MARKER);
    }
    line
}

pub struct DiskWriter {
    runner: Arc<dyn CommandRunner>,
    layout: Layout,
    build: BuildCfg,
    filter: TreeFilter,
}

impl DiskWriter {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        layout: Layout,
        build: BuildCfg,
        filter: TreeFilter,
    ) -> Self {
        Self {
            runner,
            layout,
            build,
            filter,
        }
    }

    fn run(&self, step: Step, invocation: Invocation) -> Result<()> {
        run_checked(self.runner.as_ref(), step, &invocation)?;
        Ok(())
    }

    /// Run the full build on `device`. Planning happens first so the two
    /// partitions are sized from the same filtered tree that gets copied.
    pub fn build(&self, device: &TargetDevice, fast_reboot: bool) -> BuildOutcome {
        let plan = PartitionPlanner::new(
            self.runner.as_ref(),
            &self.layout,
            &self.filter,
            self.build.cushion_mb,
        )
        .plan()?;

        let mut steps = Vec::new();
        let dev = device.path.as_path();
        let utility_part = device.partition(1);
        let recovery_part = device.partition(2);
        let mount_point = self.layout.mount_point.as_path();
        let has_utility = self.layout.utility_image_path().exists();

        self.step(&mut steps, Step::ZeroBootSector, || {
            self.run(
                Step::ZeroBootSector,
                Invocation::root("dd")
                    .arg("if=/dev/zero")
                    .arg(format!("of={}", dev.display()))
                    .args(["bs=1024", "count=1"]),
            )
        })?;

        self.step(&mut steps, Step::Partition, || {
            self.run(
                Step::Partition,
                Invocation::root("fdisk")
                    .arg_path(dev)
                    .stdin(plan.fdisk_transcript()),
            )
        })?;

        // bytes 0..404 only; the table written above starts at 446
        self.step(&mut steps, Step::WriteMbr, || {
            self.run(
                Step::WriteMbr,
                Invocation::root("dd")
                    .arg(format!("if={}", self.layout.mbr_image.display()))
                    .arg(format!("of={}", dev.display()))
                    .args(["bs=404", "count=1", "conv=notrunc"]),
            )
        })?;

        if has_utility {
            self.step(&mut steps, Step::RestoreUtility, || {
                let decompress = Invocation::new("gzip")
                    .arg("-dc")
                    .arg_path(&self.layout.utility_image_path());
                let write = Invocation::root("dd")
                    .arg(format!("of={}", utility_part.display()))
                    .arg("bs=1M");
                pipe_checked(self.runner.as_ref(), Step::RestoreUtility, &decompress, &write)
                    .map(|_| ())
            })?;
        }

        self.step(&mut steps, Step::MakeFilesystem, || {
            self.run(
                Step::MakeFilesystem,
                Invocation::root("mkfs.msdos")
                    .arg("-n")
                    .arg(&self.build.filesystem_label)
                    .arg_path(&recovery_part),
            )
        })?;

        self.step(&mut steps, Step::MountRecovery, || {
            self.run(
                Step::MountRecovery,
                Invocation::root("mount")
                    .args(["-t", "vfat"])
                    .arg_path(&recovery_part)
                    .arg_path(mount_point),
            )
        })?;

        self.step(&mut steps, Step::CopyTree, || {
            let source = &self.layout.source_root;
            let manifest = tree_manifest(source, &self.filter).map_err(|e| {
                RecoveryError::io(Step::CopyTree, format!("walking {}", source.display()), e)
            })?;
            // trailing slashes: copy contents, not the directory itself
            self.run(
                Step::CopyTree,
                Invocation::root("rsync")
                    .args(["--dirs", "--from0", "--files-from=-"])
                    .arg(format!("{}/", source.display()))
                    .arg(format!("{}/", mount_point.display()))
                    .stdin(manifest.files_from()),
            )?;
            info!(
                entries = manifest.entries.len(),
                bytes = manifest.bytes,
                "recovery tree copied"
            );
            Ok(())
        })?;

        self.step(&mut steps, Step::InstallBootloader, || {
            self.install_bootloader(&recovery_part)
        })?;

        self.step(&mut steps, Step::RegenerateUuid, || {
            self.run(
                Step::RegenerateUuid,
                Invocation::root("casper-new-uuid")
                    .arg_path(&self.layout.source_initrd())
                    .arg_path(&mount_point.join("casper"))
                    .arg_path(&mount_point.join(".disk")),
            )
        })?;

        let kernel_staged = if fast_reboot && self.layout.kexec_helper().exists() {
            steps.push(Step::StageKernel);
            self.stage_kernel()
        } else {
            false
        };

        self.step(&mut steps, Step::UnmountRecovery, || {
            self.run(
                Step::UnmountRecovery,
                Invocation::root("umount").arg_path(mount_point),
            )
        })?;

        audit_log(
            &self.layout.audit_log,
            "BUILD_COMPLETE",
            &format!(
                "device={} utility_mb={} recovery_mb={} kexec={}",
                dev.display(),
                plan.utility_mb,
                plan.recovery_mb,
                kernel_staged
            ),
        );
        Ok(BuildReport {
            plan,
            steps,
            kernel_staged,
        })
    }

    fn step<F>(&self, done: &mut Vec<Step>, step: Step, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        info!(step = %step, "build step");
        match f() {
            Ok(()) => {
                done.push(step);
                audit_log(&self.layout.audit_log, "BUILD_STEP", step.label());
                Ok(())
            }
            Err(err) => {
                audit_log(&self.layout.audit_log, "BUILD_FAIL", &err.to_string());
                Err(err)
            }
        }
    }

    fn install_bootloader(&self, partition: &Path) -> Result<()> {
        self.run(
            Step::InstallBootloader,
            Invocation::root("grub-install")
                .arg("--force")
                .arg(format!("--boot-directory={}", self.layout.mount_point.display()))
                .arg_path(partition),
        )
    }

    /// Load the freshly copied kernel for a fast reboot. Never fatal.
    fn stage_kernel(&self) -> bool {
        let cmdline = match fs::read_to_string(&self.layout.cmdline_file) {
            Ok(line) => factory_cmdline(&line),
            Err(err) => {
                warn!(error = %err, "kernel command line unreadable; full reboot instead");
                return false;
            }
        };

        let load = Invocation::root(self.layout.kexec_helper().to_string_lossy())
            .arg("-l")
            .arg_path(&self.layout.recovery_kernel())
            .arg(format!("--initrd={}", self.layout.recovery_initrd().display()))
            .arg(format!("--command-line={cmdline}"));
        match run_checked(self.runner.as_ref(), Step::StageKernel, &load) {
            Ok(_) => {
                info!("recovery kernel staged for fast reboot");
                true
            }
            Err(err) => {
                warn!(error = %err, "kexec loading of kernel and initrd failed");
                audit_log(&self.layout.audit_log, "KEXEC_STAGE_FAIL", &err.to_string());
                false
            }
        }
    }

    /// Finalize path: make partition 2 active, drop partitions 3 and 4.
    pub fn trim_to_recovery_layout(&self, device: &TargetDevice) -> Result<()> {
        let dev = device.path.as_path();
        let active = Invocation::root("sfdisk").arg("-A2").arg_path(dev);
        if let Err(err) = run_checked(self.runner.as_ref(), Step::SetActive, &active) {
            warn!(error = %err, "failed to set partition 2 active");
        }
        for number in ["3", "4"] {
            self.run(
                Step::RemovePartition,
                Invocation::root("parted")
                    .arg("-s")
                    .arg_path(dev)
                    .args(["rm", number]),
            )?;
            info!(partition = number, "extra partition removed");
        }
        Ok(())
    }

    /// Finalize path: reinstall the bootloader onto partition 2 using the
    /// read-only medium bound over the mount point.
    pub fn reinstall_bootloader(&self, device: &TargetDevice) -> Result<()> {
        let source = self.layout.source_root.as_path();
        let mount_point = self.layout.mount_point.as_path();

        self.run(
            Step::RemountSource,
            Invocation::root("mount").args(["-o", "remount,rw"]).arg_path(source),
        )?;
        self.run(
            Step::BindSource,
            Invocation::root("mount")
                .args(["-o", "bind"])
                .arg_path(source)
                .arg_path(mount_point),
        )?;
        self.install_bootloader(&device.partition(2))?;
        self.run(
            Step::ReleaseSource,
            Invocation::root("umount").arg_path(mount_point),
        )?;
        self.run(
            Step::ReleaseSource,
            Invocation::root("mount").args(["-o", "remount,ro"]).arg_path(source),
        )?;
        info!(device = %device.path.display(), "bootloader reinstalled");
        Ok(())
    }

    /// Run [`DiskWriter::build`] on a dedicated worker. The receiver yields
    /// exactly one outcome; panics inside the worker are captured into it.
    pub fn spawn_build(
        self: Arc<Self>,
        device: TargetDevice,
        fast_reboot: bool,
    ) -> Result<Receiver<BuildOutcome>> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("rp-builder".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.build(&device, fast_reboot)
                }))
                .unwrap_or_else(|payload| Err(RecoveryError::WorkerPanicked(panic_text(&payload))));
                let _ = tx.send(outcome);
            })
            .map_err(|_| RecoveryError::WorkerLost)?;
        Ok(rx)
    }
}

fn panic_text(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
