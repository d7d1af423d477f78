use std::path::PathBuf;

use super::{Context, wait_until};
use crate::assets::{AssetWriter, DEFAULT_INPUT_FILE};
use crate::cluster::{ClusterPaths, ENV_FILE};
use crate::envfile::EnvResolver;
use crate::error::Result;
use crate::fsutil::{atomic_write, ensure_dir};
use crate::kops::{KOPS_TERRAFORM_FILE, Kops, strip_kops_terraform};
use crate::shell::{RunOptions, Shell, sh_quote};
use crate::sync::{Session, SyncOptions, UploadOutcome};
use crate::terraform::{
    ApplyArgs, Outputs, Terraform, auto_flags, ci_env_set, output_str, outputs_json,
    set_aws_env,
};

const OUTPUT_ASSET: &str = "tf/output.json";

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Roll instances cloud-only; not safe in production.
    pub fast: bool,
    pub yes: bool,
    /// Staging directory override.
    pub out: Option<PathBuf>,
}

pub fn run(ctx: &Context, name: &str, opts: &CreateOptions) -> Result<()> {
    let mut paths = ctx.paths(name)?;
    if let Some(out) = &opts.out {
        paths = paths.with_staging_dir(ctx.absolute(out));
    }
    ensure_dir(&paths.staging_dir)?;

    let inputs = if ctx.inputs.is_empty() {
        vec![ctx.cwd.join(DEFAULT_INPUT_FILE)]
    } else {
        ctx.resolve_inputs(&paths.staging_dir)?
    };
    tracing::info!("applying changes to cluster \"{}\"", paths.name);
    tracing::info!(
        "reading input from [\n\t{},\n]",
        inputs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",\n\t")
    );

    let mut writer = ctx.asset_writer(&paths.staging_dir)?;
    let ids = writer.process_inputs(&inputs, &ctx.cwd)?;
    writer.write(Some("tf_state/*"))?;

    // The state bucket itself comes out of tf_state, so it is applied before
    // any remote state exists.
    let mut shell = ctx.shell();
    let tf_state = paths.tf_state_dir();
    let outputs = {
        let tf = Terraform::new(&shell, &ctx.cfg.tools.terraform);
        tf.init(&tf_state)?;
        tf.apply(
            &tf_state,
            &ApplyArgs::for_cluster(&paths, &ids).auto_approve(true),
        )?;
        tf.output(&tf_state)?
    };
    set_aws_env(shell.env_mut(), &outputs)?;
    writer.write(None)?;

    let kubeconfig = paths.kubeconfig();
    shell.env_mut().for_cluster(&paths, &kubeconfig);

    let sync = ctx.state_sync(shell.env())?;
    tracing::info!(
        "writing output to {}",
        sync.store().describe(&paths.bucket, &paths.key)
    );
    let auto_approve = auto_flags(opts.yes, ci_env_set()).is_some();
    let report = sync.session(&paths, SyncOptions::full(), |sess| {
        provision(ctx, &shell, &mut writer, sess, &ids, opts, auto_approve)
    })?;
    if report.upload == Some(UploadOutcome::Dropped) {
        tracing::warn!("cluster state was not uploaded");
    }

    let kubectl = sh_quote(&ctx.cfg.tools.kubectl);
    wait_until(&shell, &ctx.cfg.wait, "cluster authentication failed", || {
        Ok(shell
            .probe_script(
                &format!("{kubectl} get pods -n kube-system -o name"),
                &RunOptions::default().quiet(),
            )?
            .found())
    })?;

    tracing::info!("your cluster is ready");
    tracing::info!("output written to \"{}\"", paths.staging_dir.display());
    Ok(())
}

fn record_output(writer: &mut AssetWriter, outputs: &Outputs) -> Result<()> {
    writer.add_bytes(OUTPUT_ASSET, outputs_json(outputs)?.into_bytes());
    writer.write(Some(OUTPUT_ASSET))?;
    Ok(())
}

fn provision(
    ctx: &Context,
    shell: &Shell,
    writer: &mut AssetWriter,
    sess: &Session<'_>,
    ids: &[String],
    opts: &CreateOptions,
    auto_approve: bool,
) -> Result<()> {
    let paths = sess.paths();
    let name = paths.name.as_str();
    let tools = &ctx.cfg.tools;
    let tf_dir = paths.tf_dir();

    // Restored state may be older than the bundled templates.
    writer.write(None)?;

    let tf = Terraform::new(shell, &tools.terraform);
    let args = ApplyArgs::for_cluster(paths, ids).auto_approve(auto_approve);
    tf.init(&tf_dir)?;
    tf.apply(&tf_dir, &args)?;
    let outputs = tf.output(&tf_dir)?;
    record_output(writer, &outputs)?;
    let admin_role = output_str(&outputs, "aws_iam_cluster_admin_role_arn")?;

    let kops = Kops::new(shell, &tools.kops);
    let is_new = !kops.cluster_exists(name)?.found();
    if is_new {
        tracing::info!("kops cluster {name} does not exist yet, creating it");
    }
    kops.replace_from_templates(&tf_dir, is_new)?;
    kops.update_terraform(&tf_dir, name, is_new)?;
    strip_kops_terraform(&tf_dir.join(KOPS_TERRAFORM_FILE))?;

    tf.apply(&tf_dir, &args.clone().no_refresh())?;
    record_output(writer, &tf.output(&tf_dir)?)?;

    if is_new {
        let grace = ctx.cfg.wait.new_cluster_grace();
        tracing::info!(
            "waiting {}s for the cluster to come online",
            grace.as_secs()
        );
        shell.sleep(grace)?;
    } else {
        kops.rolling_update(&tf_dir, name, opts.fast)?;
    }

    wait_until(shell, &ctx.cfg.wait, "cluster validation failed", || {
        kops.validate(name)
    })?;

    kops.apply_manifests(&tf_dir, &tools.kubectl)?;
    use_exec_credentials(shell, &tools.kubectl, paths, &admin_role)?;

    let env = EnvResolver::new(|n: &str| shell.env().get(n))
        .resolve(Vec::<(String, String)>::new())?;
    atomic_write(&sess.root().join(ENV_FILE), env.render().as_bytes())?;
    Ok(())
}

/// Point the cluster's kubectl context at an aws-iam-authenticator exec user.
fn use_exec_credentials(
    shell: &Shell,
    kubectl: &str,
    paths: &ClusterPaths,
    admin_role: &str,
) -> Result<()> {
    let name = paths.name.as_str();
    let user = format!("{name}.exec");
    shell.run(
        kubectl,
        [
            "config",
            "set-credentials",
            user.as_str(),
            "--exec-api-version",
            "client.authentication.k8s.io/v1alpha1",
            "--exec-command",
            "aws-iam-authenticator",
            "--exec-arg",
            "token",
            "--exec-arg",
            "-i",
            "--exec-arg",
            name,
            "--exec-arg",
            "-r",
            "--exec-arg",
            admin_role,
        ],
        &RunOptions::default(),
    )?;
    shell.run(
        kubectl,
        [
            "config",
            "set",
            format!("contexts.{name}.user").as_str(),
            user.as_str(),
        ],
        &RunOptions::default(),
    )?;
    Ok(())
}
