// ============================================================================
// src/config.rs – strict config loader (layout, privilege, reboot, store)
// ============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plan::DEFAULT_CUSHION_MB;

/// Filesystem locations the workflow reads from and writes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    /// Read-only installation medium mount point.
    pub source_root: PathBuf,
    /// Compressed utility-partition image, relative to `source_root`.
    pub utility_image: String,
    /// Transient mount point for the recovery partition.
    pub mount_point: PathBuf,
    /// Directory whose contents survive ejecting the medium.
    pub staging_dir: PathBuf,
    pub mbr_image: PathBuf,
    pub device_dir: PathBuf,
    pub mounts_file: PathBuf,
    pub swaps_file: PathBuf,
    pub cmdline_file: PathBuf,
    pub reboot_binary: PathBuf,
    pub ata_id: PathBuf,
    /// Append-only record of destructive actions.
    pub audit_log: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("/cdrom"),
            utility_image: "upimg.bin".to_string(),
            mount_point: PathBuf::from("/boot"),
            staging_dir: PathBuf::from("/tmp"),
            mbr_image: PathBuf::from("/usr/lib/syslinux/mbr.bin"),
            device_dir: PathBuf::from("/dev"),
            mounts_file: PathBuf::from("/proc/mounts"),
            swaps_file: PathBuf::from("/proc/swaps"),
            cmdline_file: PathBuf::from("/proc/cmdline"),
            reboot_binary: PathBuf::from("/sbin/reboot"),
            ata_id: PathBuf::from("/lib/udev/ata_id"),
            audit_log: PathBuf::from("/var/log/recovery-bootstrap.log"),
        }
    }
}

impl Layout {
    pub fn utility_image_path(&self) -> PathBuf {
        self.source_root.join(&self.utility_image)
    }

    /// Kernel-reload helper shipped on the installation medium.
    pub fn kexec_helper(&self) -> PathBuf {
        self.source_root.join("misc").join("kexec")
    }

    pub fn source_initrd(&self) -> PathBuf {
        self.source_root.join("casper").join("initrd.lz")
    }

    pub fn recovery_kernel(&self) -> PathBuf {
        self.mount_point.join("casper").join("vmlinuz")
    }

    pub fn recovery_initrd(&self) -> PathBuf {
        self.mount_point.join("casper").join("initrd.lz")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildCfg {
    /// Extra megabytes added to the measured recovery tree.
    pub cushion_mb: u64,
    /// Regex selecting which source entries are measured and copied.
    pub tree_filter: String,
    pub filesystem_label: String,
}

impl Default for BuildCfg {
    fn default() -> Self {
        Self {
            cushion_mb: DEFAULT_CUSHION_MB,
            tree_filter: "/".to_string(),
            filesystem_label: "install".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeCfg {
    /// Prefix for root-only helpers; skipped when already running as root.
    pub elevate: Vec<String>,
    /// Off unless set; a hung helper otherwise hangs the run.
    pub timeout_secs: Option<u64>,
}

impl Default for PrivilegeCfg {
    fn default() -> Self {
        Self {
            elevate: vec!["sudo".to_string(), "-n".to_string()],
            timeout_secs: None,
        }
    }
}

impl PrivilegeCfg {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootCfg {
    pub eject: bool,
    /// How long to wait for the medium to disappear before rebooting anyway.
    pub removal_wait_secs: u64,
}

impl Default for RebootCfg {
    fn default() -> Self {
        Self {
            eject: true,
            removal_wait_secs: 30,
        }
    }
}

impl RebootCfg {
    pub fn removal_wait(&self) -> Duration {
        Duration::from_secs(self.removal_wait_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenuineCfg {
    /// Vendor check run with elevated privilege; non-zero exit ⇒ not genuine.
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Debconf,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreCfg {
    pub backend: StoreBackend,
    /// Answers file for the `file` backend.
    pub path: PathBuf,
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Debconf,
            path: PathBuf::from("/var/lib/recovery-bootstrap/answers.toml"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub layout: Layout,
    pub build: BuildCfg,
    pub privilege: PrivilegeCfg,
    pub reboot: RebootCfg,
    pub genuine: GenuineCfg,
    pub store: StoreCfg,
}

impl Config {
    pub fn load<P: AsRef<Path>>(p: P) -> Result<Self> {
        let s = fs::read_to_string(&p)
            .with_context(|| format!("read config: {}", p.as_ref().display()))?;
        let cfg: Self = if p.as_ref().extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&s).context("toml parse")?
        } else {
            serde_yaml::from_str(&s).context("yaml parse")?
        };
        Ok(cfg)
    }
}
