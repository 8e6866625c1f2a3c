// ============================================================================
// src/util/audit.rs – Minimal append-only audit trail
// ============================================================================

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Append a timestamped event to the audit log at `log` (0600 permissions).
/// Silent failure if log is unwritable – avoids blocking main logic.
pub fn audit_log(log: &Path, event: &str, detail: &str) {
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(log)
    {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(file, "[{ts}] {event}: {detail}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn events_append_to_the_configured_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("audit.log");
        audit_log(&log, "BUILD_STEP", "partition");
        audit_log(&log, "BUILD_COMPLETE", "/dev/sda");

        let text = fs::read_to_string(&log).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] BUILD_STEP: partition"));
        assert!(lines[1].ends_with("] BUILD_COMPLETE: /dev/sda"));
        let mode = fs::metadata(&log).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn unwritable_log_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        audit_log(&dir.path().join("missing/audit.log"), "REBOOT", "full");
    }
}
