use super::Context;
use crate::assets::staged_inputs;
use crate::error::{Error, Result};
use crate::fsutil::clear_dir_contents;
use crate::kops::Kops;
use crate::sync::SyncOptions;
use crate::terraform::{ApplyArgs, Terraform, auto_flags, aws_env_from_state, ci_env_set};

pub fn run(ctx: &Context, name: &str, yes: bool) -> Result<()> {
    let paths = ctx.paths(name)?;
    tracing::info!("destroying cluster \"{}\"", paths.name);

    let mut shell = ctx.shell();
    aws_env_from_state(&mut shell, &ctx.cfg.tools.terraform, &paths.staging_dir)?;
    let kubeconfig = paths.kubeconfig();
    shell.env_mut().for_cluster(&paths, &kubeconfig);

    let auto_approve = auto_flags(yes, ci_env_set()).is_some();
    let sync = ctx.state_sync(shell.env())?;
    sync.session(&paths, SyncOptions::full(), |sess| {
        let paths = sess.paths();
        let ids: Vec<String> = staged_inputs(&paths.tf_dir())?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        if ids.is_empty() {
            return Err(Error::config(format!(
                "no inputs staged under {}",
                paths.tf_dir().join("inputs").display()
            )));
        }
        let args = ApplyArgs::for_cluster(paths, &ids).auto_approve(auto_approve);
        let tf = Terraform::new(&shell, &ctx.cfg.tools.terraform);

        let tf_dir = paths.tf_dir();
        tf.init(&tf_dir)?;
        tf.destroy(&tf_dir, &args)?;

        let kops = Kops::new(&shell, &ctx.cfg.tools.kops);
        if kops.cluster_exists(&paths.name)?.found() {
            kops.delete_cluster(&paths.name)?;
        }

        let tf_state = paths.tf_state_dir();
        tf.init(&tf_state)?;
        tf.destroy(&tf_state, &args)?;

        clear_dir_contents(sess.root())
    })?;

    tracing::info!("cluster \"{}\" destroyed", paths.name);
    Ok(())
}
