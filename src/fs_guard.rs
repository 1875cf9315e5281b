use anyhow::{anyhow, Context, Result};
use std::{fs, path::Path};

/// Reads a file after verifying it is not a symlink and is within `max_bytes`.
///
/// Everything DPW reads out of an artifact repository is attacker-influenced
/// (a build can drop arbitrary files into its own output tree), so marker
/// and metadata reads all come through here rather than `fs::read`.
///
/// NOTE: narrow TOCTOU window between `symlink_metadata()` and `fs::read()`.
/// The check still catches accidental symlinks and raises the bar for
/// exploitation.
pub fn read_validated(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.file_type().is_symlink() {
        return Err(anyhow!("Refusing to read symlink: {}", path.display()));
    }
    if meta.len() > max_bytes {
        return Err(anyhow!(
            "File too large: {} ({} bytes, max {max_bytes} bytes)",
            path.display(),
            meta.len(),
        ));
    }
    fs::read(path).with_context(|| format!("read {}", path.display()))
}
