use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use regex::Regex;

use super::{FetchOutcome, ObjectStore, StoreOutcome};
use crate::cluster::ClusterEnv;
use crate::config::{S3StateConfig, resolve_string_field};
use crate::error::{Error, Result};
use crate::fsutil::{ensure_dir, rename_into_place, sibling_tmp_path};

/// Talks to S3 through the `aws` CLI.
#[derive(Debug, Clone)]
pub struct S3Store {
    aws_bin: String,
    profile: Option<String>,
    region: Option<String>,
    endpoint_url: Option<String>,
}

impl S3Store {
    pub fn new(aws_bin: impl Into<String>) -> Self {
        Self {
            aws_bin: aws_bin.into(),
            profile: None,
            region: None,
            endpoint_url: None,
        }
    }

    /// Configured values first; profile and region fall back to what the
    /// provisioner put into `env`.
    pub fn from_config(cfg: &S3StateConfig, env: &ClusterEnv) -> Self {
        let aws_bin = cfg
            .aws_bin
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("aws");
        Self::new(aws_bin)
            .with_profile(
                resolve_string_field(cfg.profile.as_deref(), cfg.profile_env.as_deref())
                    .or_else(|| env.aws_profile.clone()),
            )
            .with_region(
                resolve_string_field(cfg.region.as_deref(), cfg.region_env.as_deref())
                    .or_else(|| env.aws_region.clone()),
            )
            .with_endpoint_url(resolve_string_field(
                cfg.endpoint_url.as_deref(),
                cfg.endpoint_url_env.as_deref(),
            ))
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_endpoint_url(mut self, endpoint_url: Option<String>) -> Self {
        self.endpoint_url = endpoint_url;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.aws_bin);
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
        };
        if let Some(profile) = non_empty(&self.profile) {
            cmd.arg("--profile").arg(profile);
        }
        if let Some(region) = non_empty(&self.region) {
            cmd.arg("--region").arg(region);
        }
        if let Some(endpoint) = non_empty(&self.endpoint_url) {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        cmd
    }
}

impl ObjectStore for S3Store {
    fn describe(&self, bucket: &str, key: &str) -> String {
        format!("s3://{bucket}/{key}")
    }

    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<FetchOutcome> {
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        let tmp = sibling_tmp_path(dest)?;
        let mut cmd = self.command();
        cmd.arg("s3api")
            .arg("get-object")
            .arg("--bucket")
            .arg(bucket)
            .arg("--key")
            .arg(key)
            .arg(&tmp);
        tracing::debug!("fetching {}", self.describe(bucket, key));
        let out = run_command_output(&mut cmd)?;

        if !out.status.success() {
            let _ = fs::remove_file(&tmp);
            let msg = command_summary(&out);
            return match aws_error_code(&msg).as_deref() {
                Some("NoSuchKey") => Ok(FetchOutcome::NoSuchKey),
                Some("NoSuchBucket") => Ok(FetchOutcome::NoSuchBucket),
                _ => Err(Error::storage(format!(
                    "download {} failed: {msg}",
                    self.describe(bucket, key)
                ))),
            };
        }

        let bytes = fs::metadata(&tmp)
            .map_err(|e| {
                Error::storage(format!(
                    "aws reported success but {} is missing: {e}",
                    tmp.display()
                ))
            })?
            .len();
        rename_into_place(&tmp, dest)?;
        Ok(FetchOutcome::Found { bytes })
    }

    fn store(&self, bucket: &str, key: &str, src: &Path) -> Result<StoreOutcome> {
        let mut cmd = self.command();
        cmd.arg("s3api")
            .arg("put-object")
            .arg("--bucket")
            .arg(bucket)
            .arg("--key")
            .arg(key)
            .arg("--body")
            .arg(src);
        tracing::debug!("storing {} to {}", src.display(), self.describe(bucket, key));
        let out = run_command_output(&mut cmd)?;

        if !out.status.success() {
            let msg = command_summary(&out);
            return match aws_error_code(&msg).as_deref() {
                Some("NoSuchBucket") => Ok(StoreOutcome::BucketGone),
                _ => Err(Error::storage(format!(
                    "upload {} failed: {msg}",
                    self.describe(bucket, key)
                ))),
            };
        }
        Ok(StoreOutcome::Stored {
            location: self.describe(bucket, key),
        })
    }
}

/// Provider error code from aws CLI output, e.g. `NoSuchKey` out of
/// `An error occurred (NoSuchKey) when calling the GetObject operation: ...`.
pub fn aws_error_code(msg: &str) -> Option<String> {
    let re = Regex::new(r"\(([A-Za-z0-9]+)\) when calling the").ok()?;
    re.captures(msg).map(|c| c[1].to_string())
}

fn run_command_output(cmd: &mut Command) -> Result<Output> {
    cmd.output()
        .map_err(|e| Error::storage(format!("failed to run command {:?}: {e}", cmd)))
}

fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}
