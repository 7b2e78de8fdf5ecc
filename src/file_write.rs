//! Single-file writes that preserve modification time and apply the item
//! class umask.

use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::config::WriteMode;
use crate::node::Role;
use crate::protocol_core::ensure_parent_exists;

/// Name prefix of in-flight atomic writes; never part of a snapshot
pub const TEMP_PREFIX: &str = ".fleetsync-tmp-";

/// Write `content` to `path`, set permissions to `0o666 & !umask` and the
/// modification time to `mtime` (Unix seconds).
pub fn write_file(
    path: &Path,
    content: &[u8],
    umask: u32,
    mtime: i64,
    mode: WriteMode,
    actor: Role,
) -> Result<()> {
    ensure_parent_exists(path)?;

    match mode {
        WriteMode::Atomic => {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let mut tmp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(parent)
                .with_context(|| format!("create temp file in {}", parent.display()))?;
            tmp.write_all(content)?;
            tmp.as_file().sync_all()?;
            apply_mode(tmp.path(), umask)?;
            tmp.persist(path)
                .with_context(|| format!("rename into {}", path.display()))?;
        }
        WriteMode::Direct => {
            let mut f =
                File::create(path).with_context(|| format!("create {}", path.display()))?;
            f.write_all(content)?;
            f.sync_all()?;
            apply_mode(path, umask)?;
        }
    }

    set_file_mtime(path, FileTime::from_unix_time(mtime, 0))
        .with_context(|| format!("set mtime on {}", path.display()))?;

    tracing::debug!(path = %path.display(), bytes = content.len(), actor = %actor, "file updated");
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, umask: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = 0o666 & !umask;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn apply_mode(path: &Path, umask: u32) -> Result<()> {
    // Only the owner-write bit maps onto Windows (read-only attribute)
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(umask & 0o200 != 0);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))
}
