use std::fs;

use tracing::info;

use crate::cmd::{run_checked, CommandRunner, Invocation};
use crate::config::Layout;
use crate::device::TargetDevice;
use crate::error::{RecoveryError, Result, Step};
use crate::util::audit::audit_log;

/// Device column of a `/proc/swaps`-style listing, header skipped.
pub fn swap_devices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|line| !line.starts_with("Filename"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Textual match of a swap device against the target; kept deliberately
/// loose so `/dev/sda5` matches `/dev/sda` and the `sda` node name.
pub fn swap_entry_matches(entry: &str, device: &TargetDevice) -> bool {
    let path = device.path.to_string_lossy();
    if !path.is_empty() && entry.contains(path.as_ref()) {
        return true;
    }
    matches!(device.node.as_deref(), Some(node) if !node.is_empty() && entry.contains(node))
}

pub struct SwapGuard<'a> {
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
}

impl<'a> SwapGuard<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: &'a Layout) -> Self {
        Self { runner, layout }
    }

    /// Deactivate every swap area on `device`. Returns what was turned off.
    pub fn disable(&self, device: &TargetDevice) -> Result<Vec<String>> {
        let swaps_file = &self.layout.swaps_file;
        let listing = fs::read_to_string(swaps_file).map_err(|e| {
            RecoveryError::io(
                Step::DisableSwap,
                format!("reading {}", swaps_file.display()),
                e,
            )
        })?;

        let mut disabled = Vec::new();
        for entry in swap_devices(&listing) {
            if !swap_entry_matches(&entry, device) {
                continue;
            }
            run_checked(
                self.runner,
                Step::DisableSwap,
                &Invocation::root("swapoff").arg(&entry),
            )?;
            info!(swap = %entry, "swap disabled");
            audit_log(&self.layout.audit_log, "SWAPOFF", &entry);
            disabled.push(entry);
        }
        Ok(disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixture_layout, RecordingRunner};

    const SWAPS: &str = "\
Filename\t\t\t\tType\t\tSize\tUsed\tPriority
/dev/sda5                               partition\t4000180\t0\t-2
/dev/sdb2                               partition\t1048572\t0\t-3
/swapfile                               file\t\t2097148\t0\t-4
";

    fn target(path: &str, node: Option<&str>) -> TargetDevice {
        TargetDevice {
            path: path.into(),
            node: node.map(str::to_string),
            alias: None,
        }
    }

    #[test]
    fn header_is_not_an_entry() {
        assert_eq!(swap_devices(SWAPS), ["/dev/sda5", "/dev/sdb2", "/swapfile"]);
    }

    #[test]
    fn matches_path_or_node() {
        let dev = target("/dev/sda", Some("sda"));
        assert!(swap_entry_matches("/dev/sda5", &dev));
        assert!(!swap_entry_matches("/dev/sdb2", &dev));
        assert!(!swap_entry_matches("/swapfile", &dev));

        let by_node = target("/dev/mapper/disk0", Some("sdb"));
        assert!(swap_entry_matches("/dev/sdb2", &by_node));
    }

    #[test]
    fn empty_node_matches_nothing() {
        let dev = target("/dev/sdc", Some(""));
        assert!(swap_devices(SWAPS).iter().all(|e| !swap_entry_matches(e, &dev)));
    }

    #[test]
    fn disables_only_matching_entries() {
        let (_dir, layout) = fixture_layout();
        fs::write(&layout.swaps_file, SWAPS).unwrap();
        let runner = RecordingRunner::default();

        let disabled = SwapGuard::new(&runner, &layout)
            .disable(&target("/dev/sda", Some("sda")))
            .unwrap();

        assert_eq!(disabled, ["/dev/sda5"]);
        assert_eq!(runner.command_lines(), ["swapoff /dev/sda5"]);
        assert!(runner.calls()[0].root);
        let audit = fs::read_to_string(&layout.audit_log).unwrap();
        assert!(audit.contains("SWAPOFF: /dev/sda5"));
    }

    #[test]
    fn swapoff_failure_is_fatal() {
        let (_dir, layout) = fixture_layout();
        fs::write(&layout.swaps_file, SWAPS).unwrap();
        let runner = RecordingRunner::default().with_status("swapoff", 255);

        let err = SwapGuard::new(&runner, &layout)
            .disable(&target("/dev/sda", None))
            .unwrap_err();
        assert_eq!(err.step(), Some(Step::DisableSwap));
    }
}
