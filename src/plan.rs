// ============================================================================
// src/plan.rs – Partition sizing and the fdisk transcript
// ============================================================================

use tracing::info;

use crate::cmd::{run_checked, CommandRunner, Invocation};
use crate::config::Layout;
use crate::error::{RecoveryError, Result, Step};
use crate::util::tree::{tree_size, TreeFilter};

pub const MIB: u64 = 1_048_576;
pub const DEFAULT_CUSHION_MB: u64 = 300;

/// Sizes for the two-partition recovery layout, in whole megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    pub utility_mb: u64,
    /// Includes the cushion.
    pub recovery_mb: u64,
}

impl PartitionPlan {
    pub fn from_sizes(utility_bytes: Option<u64>, tree_bytes: u64, cushion_mb: u64) -> Self {
        Self {
            utility_mb: utility_bytes.map_or(0, |b| b / MIB),
            recovery_mb: tree_bytes / MIB + cushion_mb,
        }
    }

    /// Keystrokes for fdisk's interactive menu: partition 1 (type `de`),
    /// partition 2 (type `0b`), partition 2 active, write. fdisk reads this
    /// prompt-by-prompt, so the byte sequence must not drift.
    pub fn fdisk_transcript(&self) -> String {
        let mut data = String::from("n\np\n1\n\n");
        data += &format!("+{}M\n\nt\nde\n\n", self.utility_mb);
        data += "n\np\n2\n\n";
        data += &format!("+{}M\n\nt\n2\n0b\n\n", self.recovery_mb);
        data += "a\n2\n\n";
        data += "w\n";
        data
    }
}

/// Uncompressed size from `gzip -lq` (`compressed uncompressed ratio name`).
pub fn parse_gzip_listing(output: &str) -> Option<u64> {
    output.split_whitespace().nth(1)?.parse().ok()
}

pub struct PartitionPlanner<'a> {
    runner: &'a dyn CommandRunner,
    layout: &'a Layout,
    filter: &'a TreeFilter,
    cushion_mb: u64,
}

impl<'a> PartitionPlanner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        layout: &'a Layout,
        filter: &'a TreeFilter,
        cushion_mb: u64,
    ) -> Self {
        Self {
            runner,
            layout,
            filter,
            cushion_mb,
        }
    }

    /// Uncompressed byte size of the utility image, or `None` without one.
    pub fn utility_image_bytes(&self) -> Result<Option<u64>> {
        let image = self.layout.utility_image_path();
        if !image.exists() {
            return Ok(None);
        }
        let listing = Invocation::new("gzip").arg("-lq").arg_path(&image);
        let out = run_checked(self.runner, Step::MeasureUtility, &listing)?;
        parse_gzip_listing(&out.stdout)
            .map(Some)
            .ok_or_else(|| RecoveryError::UnexpectedOutput {
                step: Step::MeasureUtility,
                command: listing.command_line(),
                output: out.stdout.trim().to_string(),
            })
    }

    pub fn plan(&self) -> Result<PartitionPlan> {
        let utility = self.utility_image_bytes()?;
        let tree = tree_size(&self.layout.source_root, self.filter).map_err(|e| {
            RecoveryError::io(
                Step::MeasureTree,
                format!("measuring {}", self.layout.source_root.display()),
                e,
            )
        })?;
        let plan = PartitionPlan::from_sizes(utility, tree, self.cushion_mb);
        info!(
            utility_mb = plan.utility_mb,
            recovery_mb = plan.recovery_mb,
            "partition plan computed"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixture_layout, RecordingRunner};
    use std::fs;

    #[test]
    fn sizes_floor_to_megabytes() {
        let plan = PartitionPlan::from_sizes(Some(3 * MIB - 1), 800 * MIB + 12345, 300);
        assert_eq!(plan.utility_mb, 2);
        assert_eq!(plan.recovery_mb, 1100);

        let empty = PartitionPlan::from_sizes(None, 0, 300);
        assert_eq!(empty, PartitionPlan { utility_mb: 0, recovery_mb: 300 });
    }

    #[test]
    fn sizes_hold_across_a_range() {
        for mb in [0u64, 1, 523, 4096, 65_535] {
            for extra in [0u64, 1, MIB - 1] {
                let bytes = mb * MIB + extra;
                let plan = PartitionPlan::from_sizes(Some(bytes), bytes, 300);
                assert_eq!(plan.utility_mb, mb);
                assert_eq!(plan.recovery_mb, mb + 300);
            }
        }
    }

    #[test]
    fn transcript_is_byte_exact() {
        let plan = PartitionPlan { utility_mb: 0, recovery_mb: 524 };
        assert_eq!(
            plan.fdisk_transcript(),
            "n\np\n1\n\n+0M\n\nt\nde\n\nn\np\n2\n\n+524M\n\nt\n2\n0b\n\na\n2\n\nw\n"
        );
    }

    #[test]
    fn gzip_listing_second_field_is_uncompressed() {
        assert_eq!(
            parse_gzip_listing("  31457280 104857600  70.0% /cdrom/upimg.bin\n"),
            Some(104_857_600)
        );
        assert_eq!(parse_gzip_listing("gzip: not in gzip format"), None);
    }

    #[test]
    fn plan_without_utility_image_skips_gzip() {
        let (_dir, layout) = fixture_layout();
        fs::write(layout.source_root.join("filesystem.squashfs"), vec![0u8; 2 * MIB as usize])
            .unwrap();
        let runner = RecordingRunner::default();
        let filter = TreeFilter::new("/").unwrap();

        let plan = PartitionPlanner::new(&runner, &layout, &filter, 300).plan().unwrap();
        assert_eq!(plan, PartitionPlan { utility_mb: 0, recovery_mb: 302 });
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn plan_reads_utility_size_from_gzip() {
        let (_dir, layout) = fixture_layout();
        fs::write(layout.utility_image_path(), b"\x1f\x8b").unwrap();
        let runner = RecordingRunner::default()
            .with_stdout("gzip", "      1024   52428800  99.9% upimg.bin\n");
        let filter = TreeFilter::new("/").unwrap();

        let plan = PartitionPlanner::new(&runner, &layout, &filter, 300).plan().unwrap();
        assert_eq!(plan.utility_mb, 50);
        // the image itself lives in the tree
        assert_eq!(plan.recovery_mb, 300);
        assert_eq!(
            runner.command_lines(),
            [format!("gzip -lq {}", layout.utility_image_path().display())]
        );
    }

    #[test]
    fn garbled_gzip_output_is_an_error() {
        let (_dir, layout) = fixture_layout();
        fs::write(layout.utility_image_path(), b"junk").unwrap();
        let runner = RecordingRunner::default().with_stdout("gzip", "???");
        let filter = TreeFilter::new("/").unwrap();

        let err = PartitionPlanner::new(&runner, &layout, &filter, 300)
            .plan()
            .unwrap_err();
        assert!(matches!(err, RecoveryError::UnexpectedOutput { .. }));
    }
}
