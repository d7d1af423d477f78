use std::path::Path;

use crate::cluster::ClusterEnv;
use crate::config::{KlaristaConfig, StateBackendKind};
use crate::error::Result;

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::{S3Store, aws_error_code};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found { bytes: u64 },
    /// The bucket exists but holds no object under the key.
    NoSuchKey,
    NoSuchBucket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { location: String },
    BucketGone,
}

/// Absence is reported through the outcome enums; every other provider
/// failure is an `ErrorKind::StorageFailure`.
pub trait ObjectStore {
    fn describe(&self, bucket: &str, key: &str) -> String;

    /// Download `bucket/key` into `dest`. On anything but `Found`, `dest` is
    /// left untouched.
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<FetchOutcome>;

    /// Upload `src` to `bucket/key`, replacing whatever is there.
    fn store(&self, bucket: &str, key: &str, src: &Path) -> Result<StoreOutcome>;
}

pub fn build_store(cfg: &KlaristaConfig, env: &ClusterEnv) -> Result<Box<dyn ObjectStore>> {
    match cfg.state.backend {
        StateBackendKind::S3 => Ok(Box::new(S3Store::from_config(&cfg.state.s3, env))),
        StateBackendKind::Local => Ok(Box::new(LocalStore::new(cfg.local_state_root()?))),
    }
}
