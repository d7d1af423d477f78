use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::fsutil::{atomic_write, ensure_dir};

pub const ENTRY_MODE: u32 = 0o755;

const MAX_PREALLOC: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionRule {
    /// Skip a whole subtree whose directory name matches.
    DirName(&'static str),
    /// Skip files whose name ends with the suffix.
    FileSuffix(&'static str),
    /// Skip files with exactly this name.
    FileName(&'static str),
}

/// Paths that never belong in remote state: the provisioner's plugin cache,
/// its backup files and the admin kubeconfig.
pub const EXCLUSIONS: &[ExclusionRule] = &[
    ExclusionRule::DirName(".terraform"),
    ExclusionRule::FileSuffix(".backup"),
    ExclusionRule::FileName(".kubeconfig.admin.yaml"),
];

impl ExclusionRule {
    pub fn matches(&self, name: &str, is_dir: bool) -> bool {
        match self {
            ExclusionRule::DirName(d) => is_dir && name == *d,
            ExclusionRule::FileSuffix(s) => !is_dir && name.ends_with(s),
            ExclusionRule::FileName(f) => !is_dir && name == *f,
        }
    }
}

pub fn is_excluded(rules: &[ExclusionRule], name: &str, is_dir: bool) -> bool {
    rules.iter().any(|r| r.matches(name, is_dir))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative to the archive root, normal components only. Names are kept
    /// byte-for-byte, so they need not be UTF-8.
    pub path: PathBuf,
    pub body: Vec<u8>,
    pub size: u64,
    pub mod_time: Option<SystemTime>,
}

pub fn collect_entries(root: &Path) -> Result<Vec<ArchiveEntry>> {
    collect_entries_with(root, EXCLUSIONS)
}

pub fn collect_entries_with(root: &Path, rules: &[ExclusionRule]) -> Result<Vec<ArchiveEntry>> {
    let walker = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && is_excluded(rules, &e.file_name().to_string_lossy(), true))
        });

    let mut out = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| Error::io(format!("walkdir error: {e}")))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let p = entry.path();
        if entry.file_type().is_symlink() && !p.is_file() {
            tracing::debug!("skipping {} (not a regular file)", p.display());
            continue;
        }
        if is_excluded(rules, &entry.file_name().to_string_lossy(), false) {
            continue;
        }

        let rel = p
            .strip_prefix(root)
            .map_err(|e| Error::io(format!("strip_prefix failed: {e}")))?;
        let rel = normalize_rel_path(rel)?;
        let body =
            fs::read(p).map_err(|e| Error::io(format!("failed to read {}: {e}", p.display())))?;
        let mod_time = fs::metadata(p).and_then(|m| m.modified()).ok();

        tracing::debug!("adding \"{}\" to state archive", rel.display());
        out.push(ArchiveEntry {
            size: body.len() as u64,
            path: rel,
            body,
            mod_time,
        });
    }
    Ok(out)
}

fn normalize_rel_path(rel: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in rel.components() {
        match c {
            Component::Normal(s) => {
                // tar headers carry raw bytes on unix only.
                #[cfg(not(unix))]
                if s.to_str().is_none() {
                    return Err(Error::io(format!(
                        "file name {} is not valid unicode",
                        rel.display()
                    )));
                }
                out.push(s);
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::io(format!(
                    "path '{}' is not relative to the archive root",
                    rel.display()
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::io("archive entry path is empty"));
    }
    Ok(out)
}

pub fn encode(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for e in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(ENTRY_MODE);
        header.set_size(e.body.len() as u64);
        let mtime = e
            .mod_time
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, &e.path, e.body.as_slice())
            .map_err(|err| Error::io(format!("failed to append {} to archive: {err}", e.path.display())))?;
    }
    builder
        .into_inner()
        .map_err(|e| Error::io(format!("failed to finish archive: {e}")))
}

pub fn serialize(root: &Path) -> Result<Vec<u8>> {
    encode(&collect_entries(root)?)
}

/// Serialize `root` into `dest` without ever exposing a partial file.
pub fn serialize_to_file(root: &Path, dest: &Path) -> Result<usize> {
    let entries = collect_entries(root)?;
    let data = encode(&entries)?;
    atomic_write(dest, &data)?;
    Ok(entries.len())
}

/// Extract every file entry relative to `dest`. Returns the number of files written.
pub fn deserialize<R: Read>(reader: R, dest: &Path) -> Result<usize> {
    ensure_dir(dest)?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::archive(format!("failed to read archive: {e}")))?;

    let mut written = 0usize;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::archive(format!("malformed archive entry: {e}")))?;
        let raw = entry
            .path()
            .map_err(|e| Error::archive(format!("malformed archive entry path: {e}")))?
            .into_owned();
        let Some(rel) = sanitize_entry_path(&raw)? else {
            continue;
        };
        let out = dest.join(&rel);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            ensure_dir(&out)?;
            continue;
        }
        if !kind.is_file() {
            tracing::warn!(
                "skipping archive entry {} of type {:?}",
                raw.display(),
                kind
            );
            continue;
        }

        if let Some(parent) = out.parent() {
            ensure_dir(parent)?;
        }
        // The declared size is untrusted until the body has been read.
        let mut body = Vec::with_capacity(entry.size().min(MAX_PREALLOC) as usize);
        entry
            .read_to_end(&mut body)
            .map_err(|e| Error::archive(format!("truncated archive entry {}: {e}", raw.display())))?;
        if body.len() as u64 != entry.size() {
            return Err(Error::archive(format!(
                "truncated archive entry {}: expected {} bytes, got {}",
                raw.display(),
                entry.size(),
                body.len()
            )));
        }
        // Never write through a link left in the destination.
        if fs::symlink_metadata(&out).is_ok_and(|m| m.file_type().is_symlink()) {
            fs::remove_file(&out)
                .map_err(|e| Error::io(format!("failed to remove link {}: {e}", out.display())))?;
        }
        fs::write(&out, &body)
            .map_err(|e| Error::io(format!("failed to write {}: {e}", out.display())))?;

        let header = entry.header();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = header.mode().unwrap_or(ENTRY_MODE) & 0o777;
            fs::set_permissions(&out, fs::Permissions::from_mode(mode)).map_err(|e| {
                Error::io(format!("failed to set mode on {}: {e}", out.display()))
            })?;
        }
        if let Ok(mtime) = header.mtime() {
            let ft = filetime::FileTime::from_unix_time(mtime as i64, 0);
            filetime::set_file_mtime(&out, ft).map_err(|e| {
                Error::io(format!("failed to set mtime on {}: {e}", out.display()))
            })?;
        }
        written += 1;
    }
    Ok(written)
}

fn sanitize_entry_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut out = PathBuf::new();
    for c in raw.components() {
        match c {
            Component::Normal(s) => out.push(s),
            Component::CurDir => {}
            _ => {
                return Err(Error::archive(format!(
                    "archive entry '{}' escapes the destination",
                    raw.display()
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(out))
}
