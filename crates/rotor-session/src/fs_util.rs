use anyhow::{Context, Result};
use std::path::Path;
use tempfile::NamedTempFile;

fn staged(target: &Path, data: &[u8]) -> Result<NamedTempFile> {
    let parent = target.parent().context("Target path has no parent")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    std::io::Write::write_all(&mut tmp, data).context("Failed to write temp file")?;
    Ok(tmp)
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
pub(crate) fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    staged(target, data)?
        .persist(target)
        .with_context(|| format!("Failed to persist to {}", target.display()))?;
    Ok(())
}

/// Like [`atomic_write`], but never replaces an existing `target`. Returns
/// false when `target` already existed; the check and the write are one
/// filesystem operation.
pub(crate) fn atomic_create(target: &Path, data: &[u8]) -> Result<bool> {
    match staged(target, data)?.persist_noclobber(target) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => {
            Err(err.error).with_context(|| format!("Failed to persist to {}", target.display()))
        }
    }
}

/// Accept `[A-Za-z0-9._-]` segments only; rejects empty, `.` and `..`.
pub(crate) fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
