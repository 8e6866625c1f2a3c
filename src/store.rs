// ============================================================================
// src/store.rs – Installer answer store (debconf or a local TOML file)
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cmd::{CommandRunner, Invocation};
use crate::error::{RecoveryError, Result, Step};
use crate::util::atomic::atomic_write_toml;

pub const RECOVERY_TYPE: &str = "dell-recovery/recovery_type";
pub const FAST_REBOOT: &str = "dell-recovery/kexec";
pub const TARGET_DISK: &str = "partman-auto/disk";
pub const DEFAULT_DISK: &str = "/dev/sda";

/// Drive-related preseeds cleared before handing off to the partitioner.
pub const DRIVE_PRESEEDS: [&str; 9] = [
    "partman-auto/init_automatically_partition",
    "partman-auto/disk",
    "partman-auto/expert_recipe",
    "partman-basicfilesystems/no_swap",
    "grub-installer/only_debian",
    "grub-installer/with_other_os",
    "grub-installer/bootdev",
    "grub-installer/make_active",
    "ubiquity/reboot",
];

/// Values forced after the drive preseeds are cleared.
pub const PARTITIONER_OVERRIDES: [(&str, &str); 2] = [
    ("ubiquity/partman-skip-unmount", "false"),
    ("partman/filter_mounted", "true"),
];

const DEBCONF_OK: i32 = 0;
const DEBCONF_UNAVAILABLE: i32 = 10;

/// Key/value questions shared with the hosting installer.
pub trait AnswerStore {
    /// `Ok(None)` when the key is not available; callers apply a default.
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn set_seen(&self, key: &str, seen: bool) -> Result<()>;
}

/// Interpret a boolean answer the way debconf writes them.
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "true" | "yes" | "1")
}

/// Talks to debconf through `debconf-communicate`, one request per spawn.
pub struct DebconfStore {
    runner: Arc<dyn CommandRunner>,
}

impl DebconfStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Send one protocol line. Returns the value on code 0, `None` on 10.
    fn request(&self, line: &str) -> Result<Option<String>> {
        let invocation = Invocation::root("debconf-communicate").stdin(format!("{line}\n"));
        let out = self.runner.run(Step::AnswerStore, &invocation)?;
        let reply = out.stdout.lines().next().unwrap_or("").trim();
        let (code, value) = reply.split_once(' ').unwrap_or((reply, ""));
        match code.parse::<i32>() {
            Ok(DEBCONF_OK) => Ok(Some(value.to_string())),
            Ok(DEBCONF_UNAVAILABLE) => {
                debug!(request = line, "debconf question not available");
                Ok(None)
            }
            _ => Err(RecoveryError::Store(format!(
                "`{line}` rejected (exit {}): {}",
                out.status,
                if reply.is_empty() { out.stderr.trim() } else { reply }
            ))),
        }
    }
}

impl AnswerStore for DebconfStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.request(&format!("GET {key}"))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.request(&format!("SET {key} {value}")).map(|_| ())
    }

    fn set_seen(&self, key: &str, seen: bool) -> Result<()> {
        self.request(&format!("FSET {key} seen {seen}")).map(|_| ())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub seen: bool,
}

/// Answers kept in a private TOML file for hosts without debconf.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<BTreeMap<String, Answer>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| RecoveryError::Store(format!("read {}: {e}", self.path.display())))?;
        toml::from_str(&text)
            .map_err(|e| RecoveryError::Store(format!("parse {}: {e}", self.path.display())))
    }

    fn update<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Answer),
    {
        let mut answers = self.load()?;
        f(answers.entry(key.to_string()).or_default());
        atomic_write_toml(&self.path, &answers, true)
            .map_err(|e| RecoveryError::Store(format!("{e:#}")))
    }
}

impl AnswerStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key).map(|a| a.value))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(key, |a| a.value = value.to_string())
    }

    fn set_seen(&self, key: &str, seen: bool) -> Result<()> {
        self.update(key, |a| a.seen = seen)
    }
}
