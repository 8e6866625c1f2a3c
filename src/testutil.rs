// ============================================================================
// src/testutil.rs – Doubles for the command runner, store, presenter, udev
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::TempDir;

use crate::cmd::{CommandRunner, Invocation, OutputData, Privilege};
use crate::config::Layout;
use crate::error::{RecoveryError, Result, Step};
use crate::mode::RecoveryMode;
use crate::reboot::{RemovalSubscription, RemovalWatcher};
use crate::store::AnswerStore;
use crate::ui::{ChoiceState, Presenter, Selection};

/// A layout rooted in a fresh temp directory with the directories and
/// `/proc`-style files the workflow expects.
pub fn fixture_layout() -> (TempDir, Layout) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for sub in ["dev/disk/by-id", "cdrom", "boot", "tmp", "sbin", "proc", "lib"] {
        fs::create_dir_all(root.join(sub)).unwrap();
    }
    let layout = Layout {
        source_root: root.join("cdrom"),
        utility_image: "upimg.bin".to_string(),
        mount_point: root.join("boot"),
        staging_dir: root.join("tmp"),
        mbr_image: root.join("lib/mbr.bin"),
        device_dir: root.join("dev"),
        mounts_file: root.join("proc/mounts"),
        swaps_file: root.join("proc/swaps"),
        cmdline_file: root.join("proc/cmdline"),
        reboot_binary: root.join("sbin/reboot"),
        ata_id: root.join("lib/ata_id"),
        audit_log: root.join("audit.log"),
    };
    fs::write(&layout.mounts_file, "").unwrap();
    fs::write(
        &layout.swaps_file,
        "Filename\t\t\t\tType\t\tSize\tUsed\tPriority\n",
    )
    .unwrap();
    fs::write(&layout.reboot_binary, b"#!reboot").unwrap();
    fs::write(&layout.mbr_image, vec![0u8; 440]).unwrap();
    (dir, layout)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub step: Step,
    /// Basename.
    pub program: String,
    pub command_line: String,
    pub stdin: Option<Vec<u8>>,
    pub root: bool,
}

/// Records every invocation; succeeds unless told otherwise per program.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Call>>,
    statuses: HashMap<String, i32>,
    stdouts: HashMap<String, String>,
}

impl RecordingRunner {
    pub fn with_status(mut self, program: &str, status: i32) -> Self {
        self.statuses.insert(program.to_string(), status);
        self
    }

    pub fn with_stdout(mut self, program: &str, stdout: &str) -> Self {
        self.stdouts.insert(program.to_string(), stdout.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command_line).collect()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    fn respond(&self, program: &str) -> OutputData {
        OutputData {
            status: self.statuses.get(program).copied().unwrap_or(0),
            stdout: self.stdouts.get(program).cloned().unwrap_or_default(),
            stderr: String::new(),
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, step: Step, invocation: &Invocation) -> Result<OutputData> {
        let program = invocation.program_name().to_string();
        self.calls.lock().unwrap().push(Call {
            step,
            program: program.clone(),
            command_line: invocation.command_line(),
            stdin: invocation.stdin.clone(),
            root: invocation.privilege == Privilege::Root,
        });
        Ok(self.respond(&program))
    }

    fn pipe(&self, step: Step, from: &Invocation, into: &Invocation) -> Result<OutputData> {
        let program = from.program_name().to_string();
        self.calls.lock().unwrap().push(Call {
            step,
            program: program.clone(),
            command_line: format!("{} | {}", from.command_line(), into.command_line()),
            stdin: None,
            root: into.privilege == Privilege::Root,
        });
        let produced = self.respond(&program);
        if !produced.success() {
            return Ok(produced);
        }
        Ok(self.respond(into.program_name()))
    }
}

/// In-memory answer store; missing keys read as not available.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
    seen: Mutex<BTreeMap<String, bool>>,
    writes: Mutex<Vec<String>>,
    /// Number of `set` calls that succeed before every later one fails.
    fail_after: Option<usize>,
}

impl MemoryStore {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        let store = Self::default();
        {
            let mut values = store.values.lock().unwrap();
            for (k, v) in entries {
                values.insert(k.to_string(), v.to_string());
            }
        }
        store
    }

    pub fn failing_writes(self) -> Self {
        self.failing_after(0)
    }

    pub fn failing_after(mut self, writes: usize) -> Self {
        self.fail_after = Some(writes);
        self
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn seen(&self, key: &str) -> Option<bool> {
        self.seen.lock().unwrap().get(key).copied()
    }

    /// Keys written with `set`, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

impl AnswerStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut writes = self.writes.lock().unwrap();
        if matches!(self.fail_after, Some(limit) if writes.len() >= limit) {
            return Err(RecoveryError::Store(format!("SET {key} refused")));
        }
        writes.push(key.to_string());
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_seen(&self, key: &str, seen: bool) -> Result<()> {
        self.seen.lock().unwrap().insert(key.to_string(), seen);
        Ok(())
    }
}

/// Presenter that remembers what it was asked to show.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    pub state: ChoiceState,
    pub selection: Option<Selection>,
    events: Vec<String>,
    pub pumps: usize,
}

impl RecordingPresenter {
    pub fn choosing(selection: Selection) -> Self {
        Self {
            selection: Some(selection),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.clone()
    }
}

impl Presenter for RecordingPresenter {
    fn mode(&self) -> RecoveryMode {
        self.state.mode
    }

    fn set_mode(&mut self, mode: RecoveryMode) {
        self.events.push(format!("set_mode {mode}"));
        self.state.set_mode(mode);
    }

    fn allow_forward(&mut self, allowed: bool) {
        self.state.forward = allowed;
    }

    fn set_genuine(&mut self, genuine: bool) {
        self.events.push(format!("genuine {genuine}"));
        self.state.set_genuine(genuine);
    }

    fn show_progress(&mut self, _message: &str) {
        self.events.push("progress".to_string());
    }

    fn pump(&mut self) {
        self.pumps += 1;
    }

    fn hide_progress(&mut self) {
        self.events.push("hide".to_string());
    }

    fn show_error(&mut self, message: &str) {
        self.events.push(format!("error {message}"));
    }

    fn show_reboot(&mut self) {
        self.events.push("reboot".to_string());
    }

    fn await_selection(&mut self) -> Selection {
        match self.selection {
            Some(Selection::Proceed(mode)) => {
                self.state.select(mode);
                Selection::Proceed(self.state.mode)
            }
            Some(Selection::Cancel) => Selection::Cancel,
            None => Selection::Proceed(self.state.mode),
        }
    }
}

/// Removal watcher whose subscriptions either fire at once or never.
pub struct StaticWatcher {
    fires: bool,
    subscribed: Mutex<Vec<Option<String>>>,
}

impl StaticWatcher {
    pub fn removed() -> Self {
        Self {
            fires: true,
            subscribed: Mutex::new(Vec::new()),
        }
    }

    pub fn silent() -> Self {
        Self {
            fires: false,
            ..Self::removed()
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.subscribed.lock().unwrap().len()
    }

    /// Device node each subscription was scoped to.
    pub fn nodes(&self) -> Vec<Option<String>> {
        self.subscribed.lock().unwrap().clone()
    }
}

struct StaticSubscription(bool);

impl RemovalSubscription for StaticSubscription {
    fn wait(&mut self, _timeout: Duration) -> bool {
        self.0
    }
}

impl RemovalWatcher for StaticWatcher {
    fn subscribe(&self, node: Option<&str>) -> Result<Box<dyn RemovalSubscription>> {
        self.subscribed.lock().unwrap().push(node.map(str::to_string));
        Ok(Box::new(StaticSubscription(self.fires)))
    }
}
