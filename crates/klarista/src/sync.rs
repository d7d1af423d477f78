use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::archive;
use crate::cluster::ClusterPaths;
use crate::error::{Error, Result};
use crate::fsutil::ensure_dir;
use crate::store::{FetchOutcome, ObjectStore, StoreOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub read: bool,
    pub write: bool,
}

impl SyncOptions {
    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn fetch_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn push_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The session did not read.
    Skipped,
    Restored,
    /// Bucket present, no archive yet.
    NotFound,
    /// The bucket itself is missing.
    RemoteUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored { location: String },
    /// The bucket disappeared during the session; local state was not kept remotely.
    Dropped,
}

#[derive(Debug)]
pub struct SessionReport<T> {
    pub restore: RestoreOutcome,
    /// `None` when the session did not write.
    pub upload: Option<UploadOutcome>,
    pub value: T,
}

/// What the session callback works against.
#[derive(Debug)]
pub struct Session<'a> {
    paths: &'a ClusterPaths,
}

impl Session<'_> {
    pub fn root(&self) -> &Path {
        &self.paths.staging_dir
    }

    pub fn paths(&self) -> &ClusterPaths {
        self.paths
    }

    pub fn cluster(&self) -> &str {
        &self.paths.name
    }
}

/// Serializes sessions for a cluster. Held for the whole session.
pub trait SessionLock {
    type Guard;

    fn acquire(&self, paths: &ClusterPaths) -> Result<Self::Guard>;
}

/// No coordination between machines: the last upload wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

impl SessionLock for NoLock {
    type Guard = ();

    fn acquire(&self, _paths: &ClusterPaths) -> Result<()> {
        Ok(())
    }
}

pub struct StateSync<L = NoLock> {
    store: Box<dyn ObjectStore>,
    lock: L,
    scratch_parent: Option<PathBuf>,
}

impl StateSync<NoLock> {
    pub fn new(store: Box<dyn ObjectStore>) -> Self {
        Self {
            store,
            lock: NoLock,
            scratch_parent: None,
        }
    }
}

impl<L: SessionLock> StateSync<L> {
    pub fn with_lock<M: SessionLock>(self, lock: M) -> StateSync<M> {
        StateSync {
            store: self.store,
            lock,
            scratch_parent: self.scratch_parent,
        }
    }

    /// Where the per-session blob directory is created (system temp dir by default).
    pub fn with_scratch_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(dir.into());
        self
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Download strictly precedes `work`, which strictly precedes the upload.
    /// With `write` set the staging directory is uploaded even when `work`
    /// fails; the work error is then returned in preference to any upload error.
    pub fn session<T, F>(
        &self,
        paths: &ClusterPaths,
        opts: SyncOptions,
        work: F,
    ) -> Result<SessionReport<T>>
    where
        F: FnOnce(&Session<'_>) -> Result<T>,
    {
        let cluster = paths.name.as_str();
        let _guard = self
            .lock
            .acquire(paths)
            .map_err(|e| e.context(format!("lock state for {cluster}")))?;

        let scratch = self.scratch_dir(cluster)?;
        let blob = scratch.path().join(blob_name(&paths.key));
        ensure_dir(&paths.staging_dir)?;
        tracing::debug!("using local state directory {}", paths.staging_dir.display());

        let restore = if opts.read {
            self.restore(paths, &blob)
                .map_err(|e| e.context(format!("download state for {cluster}")))?
        } else {
            RestoreOutcome::Skipped
        };

        let result = work(&Session { paths })
            .map_err(|e| e.context(format!("local work for {cluster}")));

        let upload = if opts.write {
            match self.write_back(paths, &blob) {
                Ok(u) => Some(u),
                Err(e) => {
                    let e = e.context(format!("upload state for {cluster}"));
                    return match result {
                        Err(work_err) => {
                            tracing::error!("{e}");
                            Err(work_err)
                        }
                        Ok(_) => Err(e),
                    };
                }
            }
        } else {
            None
        };

        let value = result?;
        Ok(SessionReport {
            restore,
            upload,
            value,
        })
    }

    fn scratch_dir(&self, cluster: &str) -> Result<tempfile::TempDir> {
        let prefix = format!("klarista-{cluster}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.scratch_parent {
            Some(parent) => {
                ensure_dir(parent)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| Error::io(format!("failed to create scratch dir: {e}")))
    }

    fn restore(&self, paths: &ClusterPaths, blob: &Path) -> Result<RestoreOutcome> {
        let remote = self.store.describe(&paths.bucket, &paths.key);
        match self.store.fetch(&paths.bucket, &paths.key, blob)? {
            FetchOutcome::Found { bytes } => {
                tracing::info!("downloaded {remote} ({bytes} bytes)");
                let f = fs::File::open(blob)
                    .map_err(|e| Error::io(format!("failed to open {}: {e}", blob.display())))?;
                let n = archive::deserialize(BufReader::new(f), &paths.staging_dir)?;
                tracing::info!(
                    "restored {n} files into {}",
                    paths.staging_dir.display()
                );
                Ok(RestoreOutcome::Restored)
            }
            FetchOutcome::NoSuchKey => {
                tracing::warn!("no remote state at {remote}, starting from an empty state");
                Ok(RestoreOutcome::NotFound)
            }
            FetchOutcome::NoSuchBucket => {
                tracing::error!(
                    "state bucket {} does not exist, starting from an empty state",
                    paths.bucket
                );
                Ok(RestoreOutcome::RemoteUnavailable)
            }
        }
    }

    fn write_back(&self, paths: &ClusterPaths, blob: &Path) -> Result<UploadOutcome> {
        let n = archive::serialize_to_file(&paths.staging_dir, blob)?;
        tracing::debug!("archived {n} files from {}", paths.staging_dir.display());
        match self.store.store(&paths.bucket, &paths.key, blob)? {
            StoreOutcome::Stored { location } => {
                tracing::info!("uploaded state to {location}");
                Ok(UploadOutcome::Stored { location })
            }
            StoreOutcome::BucketGone => {
                tracing::warn!(
                    "state bucket {} no longer exists, local state was not uploaded",
                    paths.bucket
                );
                Ok(UploadOutcome::Dropped)
            }
        }
    }
}

fn blob_name(key: &str) -> &str {
    key.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("state.tar")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::LocalStore;
    use std::cell::Cell;
    use std::rc::Rc;

    fn paths(tmp: &Path, name: &str) -> ClusterPaths {
        ClusterPaths {
            name: name.to_string(),
            bucket: format!("{}-state", name.replace('.', "-")),
            key: "klarista.state.tar".into(),
            staging_dir: tmp.join("staging").join(name),
        }
    }

    fn sync(root: &Path) -> StateSync {
        StateSync::new(Box::new(LocalStore::new(root)))
            .with_scratch_parent(root.join("scratch"))
    }

    #[test]
    fn missing_bucket_runs_work_and_drops_upload() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = paths(tmp.path(), "a.example");
        let s = sync(&tmp.path().join("buckets"));

        let report = s
            .session(&p, SyncOptions::full(), |sess| {
                fs::write(sess.root().join("note.txt"), "hi")?;
                Ok(sess.cluster().to_string())
            })
            .expect("session");
        assert_eq!(report.restore, RestoreOutcome::RemoteUnavailable);
        assert_eq!(report.upload, Some(UploadOutcome::Dropped));
        assert_eq!(report.value, "a.example");
        assert!(p.staging_dir.join("note.txt").is_file());
    }

    #[test]
    fn bootstrap_then_restore_into_fresh_staging() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(tmp.path().join("buckets"));
        store.create_bucket("a-state").expect("bucket");
        let s = sync(&tmp.path().join("buckets"));
        let p = paths(tmp.path(), "a");

        let first = s
            .session(&p, SyncOptions::full(), |sess| {
                fs::create_dir_all(sess.root().join("tf/.terraform"))?;
                fs::write(sess.root().join("tf/.terraform/plugin"), "cache")?;
                fs::write(sess.root().join("tf/output.json"), "{}")?;
                Ok(())
            })
            .expect("first session");
        assert_eq!(first.restore, RestoreOutcome::NotFound);
        assert!(matches!(first.upload, Some(UploadOutcome::Stored { .. })));

        let p2 = p.clone().with_staging_dir(tmp.path().join("elsewhere"));
        let second = s
            .session(&p2, SyncOptions::fetch_only(), |sess| {
                Ok(fs::read_to_string(sess.root().join("tf/output.json"))?)
            })
            .expect("second session");
        assert_eq!(second.restore, RestoreOutcome::Restored);
        assert_eq!(second.upload, None);
        assert_eq!(second.value, "{}");
        assert!(!p2.staging_dir.join("tf/.terraform").exists());
    }

    fn listing(dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .map(|e| e.expect("walk").path().to_path_buf())
            .collect()
    }

    #[test]
    fn absent_state_starts_from_an_empty_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("buckets");
        let s = sync(&root);

        // No bucket at all.
        let gone = paths(tmp.path(), "gone");
        let report = s
            .session(&gone, SyncOptions::fetch_only(), |sess| Ok(listing(sess.root())))
            .expect("session");
        assert_eq!(report.restore, RestoreOutcome::RemoteUnavailable);
        assert!(report.value.is_empty());
        assert!(listing(&gone.staging_dir).is_empty());

        // Bucket without the key, twice in a row.
        LocalStore::new(&root).create_bucket("fresh-state").expect("bucket");
        let fresh = paths(tmp.path(), "fresh");
        for _ in 0..2 {
            let report = s
                .session(&fresh, SyncOptions::fetch_only(), |sess| Ok(listing(sess.root())))
                .expect("session");
            assert_eq!(report.restore, RestoreOutcome::NotFound);
            assert!(report.value.is_empty());
        }
        assert!(listing(&fresh.staging_dir).is_empty());
        assert!(listing(&root.join("fresh-state")).is_empty());
    }

    #[test]
    fn failed_work_is_still_uploaded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("buckets");
        LocalStore::new(&root).create_bucket("a-state").expect("bucket");
        let s = sync(&root);
        let p = paths(tmp.path(), "a");

        let err = s
            .session(&p, SyncOptions::full(), |sess| -> Result<()> {
                fs::write(sess.root().join("partial.txt"), "half done")?;
                Err(Error::subprocess("terraform apply failed"))
            })
            .expect_err("work fails");
        assert_eq!(err.kind(), ErrorKind::Subprocess);
        assert!(err.to_string().contains("local work for a"));

        let p2 = p.clone().with_staging_dir(tmp.path().join("check"));
        s.session(&p2, SyncOptions::fetch_only(), |_| Ok(()))
            .expect("read back");
        assert_eq!(
            fs::read_to_string(p2.staging_dir.join("partial.txt")).expect("read"),
            "half done"
        );
    }

    #[test]
    fn push_only_skips_restore() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("buckets");
        LocalStore::new(&root).create_bucket("a-state").expect("bucket");
        let s = sync(&root);
        let p = paths(tmp.path(), "a");

        let report = s
            .session(&p, SyncOptions::push_only(), |_| Ok(()))
            .expect("push");
        assert_eq!(report.restore, RestoreOutcome::Skipped);
        assert!(root.join("a-state/klarista.state.tar").is_file());
    }

    struct BrokenStore;

    impl ObjectStore for BrokenStore {
        fn describe(&self, bucket: &str, key: &str) -> String {
            format!("broken://{bucket}/{key}")
        }

        fn fetch(&self, _bucket: &str, _key: &str, _dest: &Path) -> Result<FetchOutcome> {
            Err(Error::storage("AccessDenied"))
        }

        fn store(&self, _bucket: &str, _key: &str, _src: &Path) -> Result<StoreOutcome> {
            Err(Error::storage("AccessDenied"))
        }
    }

    #[test]
    fn fetch_failure_aborts_before_work() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let s = StateSync::new(Box::new(BrokenStore));
        let p = paths(tmp.path(), "a");
        let ran = Cell::new(false);

        let err = s
            .session(&p, SyncOptions::full(), |_| {
                ran.set(true);
                Ok(())
            })
            .expect_err("fetch fails");
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert!(err.to_string().starts_with("download state for a"));
        assert!(!ran.get());
    }

    #[test]
    fn work_error_wins_over_upload_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let s = StateSync::new(Box::new(BrokenStore));
        let p = paths(tmp.path(), "a");

        let err = s
            .session(&p, SyncOptions::push_only(), |_| -> Result<()> {
                Err(Error::config("bad input"))
            })
            .expect_err("both fail");
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = s
            .session(&p, SyncOptions::push_only(), |_| Ok(()))
            .expect_err("upload fails");
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert!(err.to_string().starts_with("upload state for a"));
    }

    struct CountingLock(Rc<Cell<u32>>);

    impl SessionLock for CountingLock {
        type Guard = ();

        fn acquire(&self, _paths: &ClusterPaths) -> Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn lock_is_taken_once_per_session() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let count = Rc::new(Cell::new(0));
        let s = sync(&tmp.path().join("buckets")).with_lock(CountingLock(count.clone()));
        let p = paths(tmp.path(), "a");
        s.session(&p, SyncOptions::fetch_only(), |_| Ok(()))
            .expect("session");
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn blob_name_uses_last_key_segment() {
        assert_eq!(blob_name("klarista.state.tar"), "klarista.state.tar");
        assert_eq!(blob_name("prod/klarista.state.tar"), "klarista.state.tar");
        assert_eq!(blob_name("/"), "state.tar");
    }
}
