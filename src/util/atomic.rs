// ============================================================================
// src/util/atomic.rs – Durable, permissioned atomic writes (answers file)
// ============================================================================

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Return the parent directory path or error with context.
fn parent_dir(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(|p| p.to_path_buf())
        .context("Target path has no parent directory")
}

/// Fsync a directory to persist metadata (like rename).
fn fsync_dir(dir: &Path) -> Result<()> {
    let f = File::open(dir).with_context(|| format!("Open dir for fsync: {dir:?}"))?;
    f.sync_all()
        .with_context(|| format!("Fsync dir failed: {dir:?}"))?;
    Ok(())
}

/// Reject writes if target is a symlink.
fn reject_symlink_target(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            bail!("Refusing to write to symlink: {}", path.display());
        }
    }
    Ok(())
}

/// Writes bytes to a temp file in the same directory, fsyncs it, renames it
/// into place, then fsyncs the parent directory. Applies exact POSIX mode.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8], mode: u32, force: bool) -> Result<()> {
    reject_symlink_target(path)?;

    let dir = parent_dir(path)?;
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Create parent directory failed: {dir:?}"))?;
    }

    if !force && path.exists() {
        bail!("File already exists: {}", path.display());
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Target path missing file name")?;

    let mut tmp = dir.join(format!("{file_name}.tmp"));
    for _ in 0..8 {
        tmp.set_file_name(format!("{}.tmp-{}", file_name, nanoid::nanoid!(8)));
        if !tmp.exists() {
            break;
        }
    }

    let mut f = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(mode)
        .open(&tmp)
        .with_context(|| format!("Open temp file failed: {tmp:?}"))?;

    f.write_all(bytes).context("Write to temp file failed")?;
    f.sync_all().context("Fsync temp file failed")?;

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "Atomic rename failed ({} -> {})",
            tmp.display(),
            path.display()
        )
    })?;

    // umask may have narrowed the create mode
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Set permissions failed for {}", path.display()))?;

    fsync_dir(&dir)?;

    Ok(())
}

/// Atomic write of TOML-serializable data with 0600 permissions.
pub fn atomic_write_toml<T: serde::Serialize>(path: &Path, value: &T, force: bool) -> Result<()> {
    let s = toml::to_string_pretty(value).context("Serialize TOML failed")?;
    atomic_write_bytes(path, s.as_bytes(), 0o600, force)
}
