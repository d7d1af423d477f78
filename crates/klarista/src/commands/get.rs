use std::fs;
use std::path::{Component, Path, PathBuf};

use super::Context;
use crate::cluster::TF_STATE_DIR;
use crate::error::{Error, Result};
use crate::sync::SyncOptions;
use crate::terraform::aws_env_from_state;

/// Contents of `path` inside the cluster state, or its absolute location when
/// `path_only` is set.
pub fn run(ctx: &Context, name: &str, path: &str, path_only: bool) -> Result<String> {
    let paths = ctx.paths(name)?;
    let rel = state_relative(path)?;

    let mut shell = ctx.shell();
    if paths
        .staging_dir
        .join(TF_STATE_DIR)
        .join("terraform.tfstate")
        .is_file()
    {
        aws_env_from_state(&mut shell, &ctx.cfg.tools.terraform, &paths.staging_dir)?;
    }

    let sync = ctx.state_sync(shell.env())?;
    let report = sync.session(&paths, SyncOptions::fetch_only(), |sess| {
        let p = sess.root().join(&rel);
        if path_only {
            return std::path::absolute(&p)
                .map(|a| a.display().to_string())
                .map_err(|e| Error::io(format!("failed to resolve {}: {e}", p.display())));
        }
        fs::read_to_string(&p)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", p.display())))
    })?;
    Ok(report.value)
}

fn state_relative(path: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in Path::new(path).components() {
        match c {
            Component::Normal(s) => out.push(s),
            Component::CurDir => {}
            _ => {
                return Err(Error::config(format!(
                    "'{path}' must be a path inside the cluster state"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::config("path is empty"));
    }
    Ok(out)
}
