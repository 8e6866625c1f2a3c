//! Target-device resolution.
//!
//! The configured disk is often an EDD by-id alias (`/dev/disk/by-id/edd-*`).
//! When the installer itself was booted from a removable stick, firmware may
//! report that stick as the first EDD device, so the alias has to be pointed
//! back at the real fixed disk before anything destructive happens.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cmd::{run_checked, CommandRunner, Invocation};
use crate::config::Layout;
use crate::error::{RecoveryError, Result, Step};
use crate::util::audit::audit_log;

const MAX_LINK_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
    /// Working path; after resolution a real device node.
    pub path: PathBuf,
    /// Node name the configured link pointed at (e.g. `sda`).
    pub node: Option<String>,
    /// Configured path when it was a link, kept for diagnostics.
    pub alias: Option<PathBuf>,
}

impl TargetDevice {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            node: None,
            alias: None,
        }
    }

    /// Partition node `n`: `/dev/sda2`, or `/dev/nvme0n1p2` when the disk name
    /// ends in a digit.
    pub fn partition(&self, n: u8) -> PathBuf {
        let base = self.path.to_string_lossy();
        let sep = if base.ends_with(|c: char| c.is_ascii_digit()) {
            "p"
        } else {
            ""
        };
        PathBuf::from(format!("{base}{sep}{n}"))
    }
}

/// True for indirect firmware aliases that may point at the boot medium.
pub fn is_indirect_alias(path: &Path) -> bool {
    path.to_string_lossy().contains("edd")
}

/// Device backing `mount_point` in a `/proc/mounts`-style table.
pub fn backing_device(mounts: &str, mount_point: &Path) -> Option<String> {
    let wanted = mount_point.to_string_lossy();
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        let target = fields.next()?;
        (target == wanted).then(|| device.to_string())
    })
}

fn disk_name(node: &str) -> &str {
    node.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// First fixed-disk node (`sd*`) in `names` that is not the boot medium's disk.
pub fn pick_fixed_sibling<I, S>(names: I, boot_device: &str) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let boot_node = Path::new(boot_device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let boot_disk = disk_name(&boot_node);

    names
        .into_iter()
        .filter(|name| name.as_ref().starts_with("sd"))
        .map(|name| disk_name(name.as_ref()).to_string())
        .filter(|disk| disk != boot_disk)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .next()
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub struct DeviceResolver<'a> {
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
}

impl<'a> DeviceResolver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: &'a Layout) -> Self {
        Self { runner, layout }
    }

    /// Canonicalize `device`. Running this on an already resolved device is a
    /// no-op.
    pub fn resolve(&self, device: TargetDevice) -> Result<TargetDevice> {
        let mut device = device;

        if is_indirect_alias(&device.path) {
            if let Some(boot) = self.removable_boot_device()? {
                match self.fixed_sibling(&boot)? {
                    Some(node) => self.relink(&device.path, &node)?,
                    None => warn!(boot = %boot, "no fixed disk found beside boot medium"),
                }
            }
        }

        for _ in 0..MAX_LINK_HOPS {
            let is_link = fs::symlink_metadata(&device.path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if !is_link {
                break;
            }
            let target = fs::read_link(&device.path).map_err(|e| {
                RecoveryError::io(
                    Step::ResolveDevice,
                    format!("reading link {}", device.path.display()),
                    e,
                )
            })?;
            let parent = device.path.parent().unwrap_or_else(|| Path::new("/"));
            if device.alias.is_none() {
                device.alias = Some(device.path.clone());
            }
            device.node = target.file_name().map(|n| n.to_string_lossy().into_owned());
            device.path = normalize(&parent.join(&target));
        }

        info!(
            device = %device.path.display(),
            node = ?device.node,
            alias = ?device.alias,
            "target device resolved"
        );
        Ok(device)
    }

    /// The medium's backing device, if it is not a fixed ATA disk.
    fn removable_boot_device(&self) -> Result<Option<String>> {
        let mounts = fs::read_to_string(&self.layout.mounts_file).map_err(|e| {
            RecoveryError::io(
                Step::ResolveDevice,
                format!("reading {}", self.layout.mounts_file.display()),
                e,
            )
        })?;
        let Some(device) = backing_device(&mounts, &self.layout.source_root) else {
            debug!("installation medium not found in mount table");
            return Ok(None);
        };

        let probe = Invocation::new(self.layout.ata_id.to_string_lossy()).arg(&device);
        match self.runner.run(Step::ResolveDevice, &probe) {
            Ok(out) if out.success() => {
                debug!(device = %device, "boot medium is a fixed disk");
                Ok(None)
            }
            Ok(_) => Ok(Some(device)),
            Err(err) => {
                warn!(error = %err, "ata_id probe unavailable; leaving device untouched");
                Ok(None)
            }
        }
    }

    fn fixed_sibling(&self, boot_device: &str) -> Result<Option<String>> {
        let entries = fs::read_dir(&self.layout.device_dir).map_err(|e| {
            RecoveryError::io(
                Step::ResolveDevice,
                format!("scanning {}", self.layout.device_dir.display()),
                e,
            )
        })?;
        let names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        Ok(pick_fixed_sibling(names, boot_device))
    }

    fn relink(&self, alias: &Path, node: &str) -> Result<()> {
        let ln = Invocation::root("ln")
            .arg("-sfn")
            .arg(format!("../../{node}"))
            .arg_path(alias);
        run_checked(self.runner, Step::ResolveDevice, &ln)?;
        info!(alias = %alias.display(), node, "alias repointed at fixed disk");
        audit_log(
            &self.layout.audit_log,
            "DEVICE_FIXUP",
            &format!("alias={} node={}", alias.display(), node),
        );
        Ok(())
    }
}
