use std::path::{Component, Path, PathBuf};
use std::process::Command;

use crate::config::KlaristaConfig;
use crate::error::{Error, Result};

pub const KOPS_FEATURE_FLAGS: &str = "+TerraformJSON,-Terraform-0.12";

// Sub-layout shared with the bundled terraform modules.
pub const TF_DIR: &str = "tf";
pub const TF_STATE_DIR: &str = "tf_state";
pub const TF_VARS_DIR: &str = "tf_vars";
pub const KUBECONFIG_FILE: &str = "kubeconfig.yaml";
pub const ENV_FILE: &str = ".env";

pub fn validate_cluster_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::config("cluster name is empty"));
    }
    let mut comps = Path::new(name).components();
    let single_normal = matches!(comps.next(), Some(Component::Normal(_))) && comps.next().is_none();
    if !single_normal || name.contains('/') || name.contains('\\') {
        return Err(Error::config(format!(
            "cluster name '{}' must be a single path segment",
            name
        )));
    }
    Ok(name.to_string())
}

/// `my.cluster` -> `my-cluster-state`
pub fn bucket_name(cluster: &str, suffix: &str) -> String {
    format!("{}{}", cluster.replace('.', "-"), suffix)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPaths {
    pub name: String,
    pub bucket: String,
    pub key: String,
    pub staging_dir: PathBuf,
}

impl ClusterPaths {
    pub fn new(name: &str, cfg: &KlaristaConfig) -> Result<Self> {
        let name = validate_cluster_name(name)?;
        Ok(Self {
            bucket: bucket_name(&name, &cfg.state.bucket_suffix),
            key: cfg.state.key.clone(),
            staging_dir: cfg.tmp_dir().join(&name),
            name,
        })
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn kops_state_store(&self) -> String {
        format!("s3://{}/kops", self.bucket)
    }

    pub fn tf_dir(&self) -> PathBuf {
        self.staging_dir.join(TF_DIR)
    }

    pub fn tf_state_dir(&self) -> PathBuf {
        self.staging_dir.join(TF_STATE_DIR)
    }

    pub fn tf_vars_dir(&self) -> PathBuf {
        self.staging_dir.join(TF_VARS_DIR)
    }

    pub fn kubeconfig(&self) -> PathBuf {
        self.staging_dir.join(KUBECONFIG_FILE)
    }

    pub fn env_file(&self) -> PathBuf {
        self.staging_dir.join(ENV_FILE)
    }
}

/// Values handed from one provisioning phase to the next and exported to
/// every subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterEnv {
    pub aws_profile: Option<String>,
    pub aws_region: Option<String>,
    pub cluster: Option<String>,
    pub kops_state_store: Option<String>,
    pub kops_feature_flags: Option<String>,
    pub kubeconfig: Option<PathBuf>,
}

impl ClusterEnv {
    /// Everything kops and kubectl need once the AWS profile is known.
    pub fn for_cluster(&mut self, paths: &ClusterPaths, kubeconfig: &Path) {
        self.cluster = Some(paths.name.clone());
        self.kops_state_store = Some(paths.kops_state_store());
        self.kops_feature_flags = Some(KOPS_FEATURE_FLAGS.to_string());
        self.kubeconfig = Some(kubeconfig.to_path_buf());
    }

    pub fn vars(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let mut push = |k: &'static str, v: Option<String>| {
            if let Some(v) = v {
                out.push((k, v));
            }
        };
        push("AWS_PROFILE", self.aws_profile.clone());
        push("AWS_REGION", self.aws_region.clone());
        push("CLUSTER", self.cluster.clone());
        push("KOPS_STATE_STORE", self.kops_state_store.clone());
        push("KOPS_FEATURE_FLAGS", self.kops_feature_flags.clone());
        push(
            "KUBECONFIG",
            self.kubeconfig
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        );
        out
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars()
            .into_iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn apply(&self, cmd: &mut Command) {
        for (k, v) in self.vars() {
            cmd.env(k, v);
        }
    }
}
