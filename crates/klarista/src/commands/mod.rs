use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assets::{AssetBox, AssetWriter, initial_inputs};
use crate::cluster::{ClusterEnv, ClusterPaths};
use crate::config::{KlaristaConfig, WaitConfig};
use crate::error::{Error, Result};
use crate::shell::Shell;
use crate::store::build_store;
use crate::sync::StateSync;

pub mod create;
pub mod destroy;
pub mod env;
pub mod get;
pub mod push;

pub struct Context {
    pub cfg: KlaristaConfig,
    /// `--input` values in the order given.
    pub inputs: Vec<PathBuf>,
    pub cwd: PathBuf,
}

impl Context {
    pub fn new(cfg: KlaristaConfig, inputs: Vec<PathBuf>, cwd: PathBuf) -> Self {
        Self { cfg, inputs, cwd }
    }

    pub fn paths(&self, name: &str) -> Result<ClusterPaths> {
        ClusterPaths::new(name, &self.cfg)
    }

    pub fn shell(&self) -> Shell {
        Shell::new(self.cfg.tools.bash.clone(), ClusterEnv::default())
    }

    pub fn state_sync(&self, env: &ClusterEnv) -> Result<StateSync> {
        Ok(StateSync::new(build_store(&self.cfg, env)?))
    }

    pub fn asset_writer(&self, staging: &Path) -> Result<AssetWriter> {
        let assets = AssetBox::load(&self.absolute(&self.cfg.assets_dir()))?;
        Ok(AssetWriter::new(assets, staging))
    }

    /// Explicit `--input` files, else the inputs found by [`initial_inputs`].
    pub fn resolve_inputs(&self, staging: &Path) -> Result<Vec<PathBuf>> {
        if !self.inputs.is_empty() {
            return Ok(self.inputs.iter().map(|p| self.absolute(p)).collect());
        }
        initial_inputs(staging, &self.cwd)
    }

    pub fn absolute(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }
}

/// Poll `check` every `wait.poll_interval()` until it reports ready.
pub fn wait_until<F>(shell: &Shell, wait: &WaitConfig, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let interval = wait.poll_interval();
    let mut attempts = 0u32;
    loop {
        if check()? {
            return Ok(());
        }
        attempts += 1;
        if wait.max_attempts > 0 && attempts >= wait.max_attempts {
            return Err(Error::subprocess(format!(
                "{what} after {attempts} attempts, giving up"
            )));
        }
        tracing::info!("{what}, trying again in {}", human_secs(interval));
        shell.sleep(interval)?;
    }
}

fn human_secs(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
