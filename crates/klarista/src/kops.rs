use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::fsutil::atomic_write;
use crate::shell::{Probe, RunOptions, Shell, sh_quote};

/// Generated by `kops update cluster --target terraform`.
pub const KOPS_TERRAFORM_FILE: &str = "kubernetes.tf.json";

/// Validation failures for this component are expected until kubectl is
/// switched over to exec credentials.
pub const IAM_AUTHENTICATOR_PREFIX: &str = "kube-system/aws-iam-authenticator";

/// Drop the provider block (the surrounding module configures providers) and
/// the duplicate `cluster_name` output from kops' terraform.
pub fn strip_kops_terraform(path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}: {e}", path.display())))?;
    let mut doc: Value = serde_json::from_str(&raw)
        .map_err(|e| Error::msg(format!("failed to parse {}: {e}", path.display())))?;
    let Some(obj) = doc.as_object_mut() else {
        return Err(Error::msg(format!("{} is not a JSON object", path.display())));
    };
    obj.remove("provider");
    if let Some(outputs) = obj.get_mut("output").and_then(Value::as_object_mut) {
        outputs.remove("cluster_name");
    }
    let body = serde_json::to_string_pretty(&doc)?;
    atomic_write(path, body.as_bytes())
}

/// Whether `kops validate cluster -o json` output means the cluster is usable.
pub fn validation_ready(raw: &str) -> bool {
    let Ok(doc) = serde_json::from_str::<Value>(raw) else {
        return false;
    };
    let Some(obj) = doc.as_object() else {
        return false;
    };
    match obj.get("failures") {
        None | Some(Value::Null) => true,
        Some(Value::Array(failures)) => failures.iter().all(|f| {
            f.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n.starts_with(IAM_AUTHENTICATOR_PREFIX))
        }),
        Some(_) => false,
    }
}

pub struct Kops<'a> {
    shell: &'a Shell,
    bin: &'a str,
}

impl<'a> Kops<'a> {
    pub fn new(shell: &'a Shell, bin: &'a str) -> Self {
        Self { shell, bin }
    }

    pub fn cluster_exists(&self, name: &str) -> Result<Probe> {
        self.shell.probe(
            self.bin,
            ["get", "cluster", name],
            &RunOptions::default().quiet(),
        )
    }

    /// Render the cluster spec from `../kops/*` with `output.json` values and
    /// hand it to `kops replace`. `force` is required when the cluster is new.
    pub fn replace_from_templates(&self, tf_dir: &Path, force: bool) -> Result<()> {
        let kops = sh_quote(self.bin);
        let script = format!(
            "{kops} replace {force} -f <({kops} toolbox template \
             --name \"$CLUSTER\" \
             --set-string \"cluster_name=$CLUSTER\" \
             --values output.json \
             --template <(cat ../kops/*) \
             --format-yaml)",
            force = if force { "--force" } else { "" },
        );
        self.shell.script(&script, &RunOptions::in_dir(tf_dir))?;
        Ok(())
    }

    pub fn update_terraform(&self, tf_dir: &Path, name: &str, is_new: bool) -> Result<()> {
        let mut args = vec!["update", "cluster", name];
        if !is_new {
            args.push("--create-kube-config=false");
        }
        args.extend(["--target", "terraform", "--out", ".", "--yes"]);
        self.shell.run(self.bin, args, &RunOptions::in_dir(tf_dir))?;
        Ok(())
    }

    pub fn rolling_update(&self, tf_dir: &Path, name: &str, fast: bool) -> Result<()> {
        let mut args = vec!["rolling-update", "cluster", name];
        if fast {
            args.push("--cloudonly");
        }
        args.push("--yes");
        self.shell.run(self.bin, args, &RunOptions::in_dir(tf_dir))?;
        Ok(())
    }

    /// One validation attempt. A failing exit is not an error; the JSON decides.
    pub fn validate(&self, name: &str) -> Result<bool> {
        let (_, out) = self.shell.run_status(
            self.bin,
            ["validate", "cluster", name, "-o", "json"],
            &RunOptions::default().capture(),
        )?;
        Ok(validation_ready(&out))
    }

    pub fn delete_cluster(&self, name: &str) -> Result<()> {
        self.shell
            .run(self.bin, ["delete", "cluster", name, "--yes"], &RunOptions::default())?;
        Ok(())
    }

    /// Render `../k8s/*.yaml` with `output.json` values and apply it.
    pub fn apply_manifests(&self, tf_dir: &Path, kubectl: &str) -> Result<()> {
        let script = format!(
            "{kops} toolbox template \
             --name \"$CLUSTER\" \
             --values output.json \
             --template <(cat ../k8s/*.yaml) \
             --format-yaml | {kubectl} apply -f -",
            kops = sh_quote(self.bin),
            kubectl = sh_quote(kubectl),
        );
        self.shell.script(&script, &RunOptions::in_dir(tf_dir))?;
        Ok(())
    }
}
