use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::io(format!("failed to create dir {}: {e}", p.display())))
}

/// Write to a sibling temp file, then rename over `path`.
pub fn atomic_write(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = sibling_tmp_path(path)?;
    fs::write(&tmp, body)
        .map_err(|e| Error::io(format!("failed to write temp file {}: {e}", tmp.display())))?;
    rename_into_place(&tmp, path)
}

pub fn sibling_tmp_path(path: &Path) -> Result<std::path::PathBuf> {
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::io(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    Ok(path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )))
}

pub fn rename_into_place(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path).map_err(|e| {
        let _ = fs::remove_file(tmp);
        Error::io(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clear_dir_contents(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(it) => it,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::io(format!("failed to list {}: {e}", dir.display())));
        }
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("failed to list {}: {e}", dir.display())))?;
        let p = entry.path();
        let meta = fs::symlink_metadata(&p)
            .map_err(|e| Error::io(format!("failed to stat {}: {e}", p.display())))?;
        if meta.is_dir() {
            fs::remove_dir_all(&p)
                .map_err(|e| Error::io(format!("failed to remove directory {}: {e}", p.display())))?;
        } else {
            fs::remove_file(&p)
                .map_err(|e| Error::io(format!("failed to remove {}: {e}", p.display())))?;
        }
    }
    Ok(())
}
