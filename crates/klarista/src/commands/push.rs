use super::Context;
use crate::error::Result;
use crate::fsutil::ensure_dir;
use crate::sync::{SyncOptions, UploadOutcome};
use crate::terraform::provision_aws_env;

/// Upload the local staging directory without reading remote state first.
pub fn run(ctx: &Context, name: &str) -> Result<UploadOutcome> {
    let paths = ctx.paths(name)?;
    ensure_dir(&paths.staging_dir)?;
    let inputs = ctx.resolve_inputs(&paths.staging_dir)?;

    let mut writer = ctx.asset_writer(&paths.staging_dir)?;
    writer.write(Some("tf_vars/*"))?;
    let ids = writer.process_inputs(&inputs, &ctx.cwd)?;

    let mut shell = ctx.shell();
    provision_aws_env(&mut shell, &ctx.cfg.tools.terraform, &paths.staging_dir, &ids)?;
    let kubeconfig = paths.kubeconfig();
    shell.env_mut().for_cluster(&paths, &kubeconfig);

    let sync = ctx.state_sync(shell.env())?;
    let report = sync.session(&paths, SyncOptions::push_only(), |_| Ok(()))?;
    Ok(report.upload.unwrap_or(UploadOutcome::Dropped))
}
