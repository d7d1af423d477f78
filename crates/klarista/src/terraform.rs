use std::path::Path;

use serde_json::{Map, Value};

use crate::cluster::{ClusterEnv, ClusterPaths, TF_STATE_DIR, TF_VARS_DIR};
use crate::error::{Error, Result};
use crate::shell::{RunOptions, Shell, sh_quote};

pub type Outputs = Map<String, Value>;

pub fn var_file_flags(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("-var-file \"inputs/{id}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `--yes`, or running under CI, skips terraform's confirmation prompt.
pub fn auto_flags(yes: bool, ci: bool) -> Option<&'static str> {
    (yes || ci).then_some("-auto-approve")
}

pub fn ci_env_set() -> bool {
    std::env::var("CI").map(|v| !v.is_empty()).unwrap_or(false)
}

#[derive(Debug, Clone, Default)]
pub struct ApplyArgs {
    pub vars: Vec<(String, String)>,
    pub var_files: Vec<String>,
    pub auto_approve: bool,
    pub no_refresh: bool,
}

impl ApplyArgs {
    pub fn new(var_files: &[String]) -> Self {
        Self {
            var_files: var_files.to_vec(),
            ..Default::default()
        }
    }

    /// Passes `cluster_name` and `state_bucket_name` to the modules.
    pub fn for_cluster(paths: &ClusterPaths, var_files: &[String]) -> Self {
        let mut args = Self::new(var_files);
        args.vars.push(("cluster_name".into(), paths.name.clone()));
        args.vars
            .push(("state_bucket_name".into(), paths.bucket.clone()));
        args
    }

    pub fn auto_approve(mut self, yes: bool) -> Self {
        self.auto_approve = yes;
        self
    }

    pub fn no_refresh(mut self) -> Self {
        self.no_refresh = true;
        self
    }

    pub fn script(&self, terraform: &str, verb: &str) -> String {
        let mut parts = vec![sh_quote(terraform), verb.to_string()];
        if self.no_refresh {
            parts.push("-refresh=false".into());
        }
        if self.auto_approve {
            parts.push("-auto-approve".into());
        }
        parts.push("-compact-warnings".into());
        for (k, v) in &self.vars {
            parts.push(format!("-var {}", sh_quote(&format!("{k}={v}"))));
        }
        let files = var_file_flags(&self.var_files);
        if !files.is_empty() {
            parts.push(files);
        }
        parts.join(" ")
    }
}

pub struct Terraform<'a> {
    shell: &'a Shell,
    bin: &'a str,
}

impl<'a> Terraform<'a> {
    pub fn new(shell: &'a Shell, bin: &'a str) -> Self {
        Self { shell, bin }
    }

    pub fn init(&self, dir: &Path) -> Result<()> {
        self.shell.run(self.bin, ["init"], &RunOptions::in_dir(dir))?;
        Ok(())
    }

    pub fn apply(&self, dir: &Path, args: &ApplyArgs) -> Result<()> {
        self.shell
            .script(&args.script(self.bin, "apply"), &RunOptions::in_dir(dir))?;
        Ok(())
    }

    pub fn destroy(&self, dir: &Path, args: &ApplyArgs) -> Result<()> {
        self.shell
            .script(&args.script(self.bin, "destroy"), &RunOptions::in_dir(dir))?;
        Ok(())
    }

    /// `terraform output -json`, flattened to `{name: value}`.
    pub fn output(&self, dir: &Path) -> Result<Outputs> {
        let raw = self
            .shell
            .run(self.bin, ["output", "-json"], &RunOptions::in_dir(dir).capture())?;
        flatten_outputs(&raw).map_err(|e| e.context(format!("terraform output in {}", dir.display())))
    }
}

pub fn flatten_outputs(raw: &str) -> Result<Outputs> {
    let v: Value = serde_json::from_str(raw)?;
    let Value::Object(map) = v else {
        return Err(Error::msg("terraform output is not a JSON object"));
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let inner = match v {
                Value::Object(mut o) => o.remove("value").unwrap_or(Value::Null),
                other => other,
            };
            (k, inner)
        })
        .collect())
}

pub fn outputs_json(outputs: &Outputs) -> Result<String> {
    Ok(serde_json::to_string_pretty(outputs)?)
}

pub fn output_str(outputs: &Outputs, key: &str) -> Result<String> {
    outputs
        .get(key)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::config(format!("terraform output '{key}' is missing or not a string")))
}

pub fn set_aws_env(env: &mut ClusterEnv, outputs: &Outputs) -> Result<()> {
    env.aws_profile = Some(output_str(outputs, "aws_profile")?);
    env.aws_region = Some(output_str(outputs, "aws_region")?);
    Ok(())
}

/// Apply the `tf_vars` module, which only evaluates the inputs, and take the
/// AWS profile and region from its outputs.
pub fn provision_aws_env(
    shell: &mut Shell,
    terraform: &str,
    staging: &Path,
    ids: &[String],
) -> Result<()> {
    let dir = staging.join(TF_VARS_DIR);
    let outputs = {
        let tf = Terraform::new(shell, terraform);
        tf.init(&dir)?;
        tf.apply(&dir, &ApplyArgs::new(ids).auto_approve(true).no_refresh())?;
        tf.output(&dir)?
    };
    set_aws_env(shell.env_mut(), &outputs)
}

/// Read the AWS profile and region from the already applied `tf_state` module.
pub fn aws_env_from_state(shell: &mut Shell, terraform: &str, staging: &Path) -> Result<()> {
    let dir = staging.join(TF_STATE_DIR);
    let outputs = Terraform::new(shell, terraform).output(&dir)?;
    set_aws_env(shell.env_mut(), &outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_files_render_in_order() {
        let ids = vec!["000.tfvars".to_string(), "001.tfvars".to_string()];
        assert_eq!(
            var_file_flags(&ids),
            "-var-file \"inputs/000.tfvars\" -var-file \"inputs/001.tfvars\""
        );
        assert_eq!(var_file_flags(&[]), "");
    }

    #[test]
    fn auto_approve_on_yes_or_ci() {
        assert_eq!(auto_flags(true, false), Some("-auto-approve"));
        assert_eq!(auto_flags(false, true), Some("-auto-approve"));
        assert_eq!(auto_flags(false, false), None);
    }

    #[test]
    fn apply_script_quotes_vars() {
        let paths = ClusterPaths {
            name: "a.example".into(),
            bucket: "a-example-state".into(),
            key: "klarista.state.tar".into(),
            staging_dir: "/tmp/a.example".into(),
        };
        let script = ApplyArgs::for_cluster(&paths, &["000.tfvars".to_string()])
            .no_refresh()
            .script("terraform", "apply");
        assert_eq!(
            script,
            "'terraform' apply -refresh=false -compact-warnings -var 'cluster_name=a.example' \
             -var 'state_bucket_name=a-example-state' -var-file \"inputs/000.tfvars\""
        );
    }

    #[test]
    fn outputs_are_flattened() {
        let raw = r#"{
            "aws_profile": {"sensitive": false, "type": "string", "value": "ops"},
            "subnets": {"type": ["list", "string"], "value": ["a", "b"]}
        }"#;
        let out = flatten_outputs(raw).expect("flatten");
        assert_eq!(output_str(&out, "aws_profile").expect("profile"), "ops");
        assert_eq!(out["subnets"], serde_json::json!(["a", "b"]));
        assert!(output_str(&out, "subnets").is_err());
        assert!(output_str(&out, "aws_region").is_err());
    }

    #[test]
    fn set_aws_env_needs_both_values() {
        let out = flatten_outputs(r#"{"aws_profile": {"value": "ops"}, "aws_region": {"value": "us-east-1"}}"#)
            .expect("flatten");
        let mut env = ClusterEnv::default();
        set_aws_env(&mut env, &out).expect("env");
        assert_eq!(env.aws_profile.as_deref(), Some("ops"));
        assert_eq!(env.aws_region.as_deref(), Some("us-east-1"));

        let partial = flatten_outputs(r#"{"aws_profile": {"value": "ops"}}"#).expect("flatten");
        assert!(set_aws_env(&mut ClusterEnv::default(), &partial).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn provision_reads_outputs_from_fake_terraform() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::AtomicBool;

        static NEVER: AtomicBool = AtomicBool::new(false);
        let tmp = tempfile::tempdir().expect("tempdir");
        let bin = tmp.path().join("terraform");
        std::fs::write(
            &bin,
            "#!/bin/sh\nif [ \"$1\" = output ]; then\n  printf '{\"aws_profile\":{\"value\":\"ops\"},\"aws_region\":{\"value\":\"eu-west-1\"}}'\nfi\n",
        )
        .expect("write");
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(staging.join("tf_vars")).expect("mkdir");

        let mut shell = Shell::new("sh", ClusterEnv::default()).with_cancel_flag(&NEVER);
        let bin = bin.to_string_lossy().to_string();
        provision_aws_env(&mut shell, &bin, &staging, &["000.tfvars".to_string()])
            .expect("provision");
        assert_eq!(shell.env().aws_profile.as_deref(), Some("ops"));
        assert_eq!(shell.env().aws_region.as_deref(), Some("eu-west-1"));
    }
}
