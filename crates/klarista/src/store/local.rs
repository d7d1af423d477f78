use std::fs;
use std::path::{Path, PathBuf};

use super::{FetchOutcome, ObjectStore, StoreOutcome};
use crate::error::{Error, Result};
use crate::fsutil::{ensure_dir, rename_into_place, sibling_tmp_path};

/// Buckets are directories under `root`, objects are files inside them.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        ensure_dir(&self.bucket_dir(bucket))
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut p = self.bucket_dir(bucket);
        for part in key.split('/').filter(|s| !s.is_empty()) {
            p.push(part);
        }
        p
    }
}

fn copy_atomic(src: &Path, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    let tmp = sibling_tmp_path(dest)?;
    let bytes = fs::copy(src, &tmp).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::storage(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            tmp.display()
        ))
    })?;
    rename_into_place(&tmp, dest)?;
    Ok(bytes)
}

impl ObjectStore for LocalStore {
    fn describe(&self, bucket: &str, key: &str) -> String {
        format!("file://{}", self.object_path(bucket, key).display())
    }

    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<FetchOutcome> {
        if !self.bucket_dir(bucket).is_dir() {
            return Ok(FetchOutcome::NoSuchBucket);
        }
        let obj = self.object_path(bucket, key);
        if !obj.is_file() {
            return Ok(FetchOutcome::NoSuchKey);
        }
        let bytes = copy_atomic(&obj, dest)?;
        Ok(FetchOutcome::Found { bytes })
    }

    fn store(&self, bucket: &str, key: &str, src: &Path) -> Result<StoreOutcome> {
        if !self.bucket_dir(bucket).is_dir() {
            return Ok(StoreOutcome::BucketGone);
        }
        copy_atomic(src, &self.object_path(bucket, key))?;
        Ok(StoreOutcome::Stored {
            location: self.describe(bucket, key),
        })
    }
}
