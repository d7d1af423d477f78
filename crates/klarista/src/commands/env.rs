use std::fs;
use std::path::Path;

use super::Context;
use crate::envfile::{default_environment_file, process_env};
use crate::error::{Error, Result};
use crate::sync::SyncOptions;
use crate::terraform::provision_aws_env;

/// The cluster's `.env`: cached locally, else from remote state, else a
/// default that points at the conventional staging location.
pub fn run(ctx: &Context, name: &str) -> Result<String> {
    let paths = ctx.paths(name)?;
    let env_file = paths.env_file();
    if let Some(cached) = read_non_empty(&env_file)? {
        return Ok(cached);
    }

    let mut shell = ctx.shell();
    let inputs = ctx.resolve_inputs(&paths.staging_dir)?;
    if inputs.is_empty() {
        tracing::warn!("no inputs found, skipping remote state for {}", paths.name);
    } else {
        let mut writer = ctx.asset_writer(&paths.staging_dir)?;
        writer.write(Some("{tf_vars,tf_state}/*"))?;
        let ids = writer.process_inputs(&inputs, &ctx.cwd)?;
        provision_aws_env(&mut shell, &ctx.cfg.tools.terraform, &paths.staging_dir, &ids)?;

        let sync = ctx.state_sync(shell.env())?;
        let report = sync.session(&paths, SyncOptions::fetch_only(), |sess| {
            read_non_empty(&sess.paths().env_file())
        })?;
        if let Some(remote) = report.value {
            return Ok(remote);
        }
    }

    default_environment_file(&paths.name, |n: &str| {
        shell.env().get(n).or_else(|| process_env(n))
    })
}

fn read_non_empty(p: &Path) -> Result<Option<String>> {
    if !p.is_file() {
        return Ok(None);
    }
    let body = fs::read_to_string(p)
        .map_err(|e| Error::io(format!("failed to read {}: {e}", p.display())))?;
    Ok((!body.is_empty()).then_some(body))
}
