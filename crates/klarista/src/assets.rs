use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cluster::{TF_DIR, TF_STATE_DIR, TF_VARS_DIR};
use crate::error::{Error, Result};
use crate::fsutil::ensure_dir;

/// Only written when missing, so live state is never replaced by a template.
pub const POLITE_ASSETS: &[&str] = &[
    "kubeconfig.yaml",
    "tf/terraform.tfstate",
    "tf_state/terraform.tfstate",
    "tf_vars/terraform.tfstate",
];

pub const INPUT_ASSETS: &str = "*/inputs/*";
pub const DEFAULT_INPUT_FILE: &str = "input.tfvars";

#[derive(Debug, Clone, Default)]
pub struct AssetBox {
    files: BTreeMap<String, Vec<u8>>,
}

impl AssetBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "assets directory {} does not exist",
                dir.display()
            )));
        }
        let mut out = Self::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::io(format!("walkdir error: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| Error::io(format!("strip_prefix failed: {e}")))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            let body = fs::read(entry.path()).map_err(|e| {
                Error::io(format!("failed to read asset {}: {e}", entry.path().display()))
            })?;
            out.files.insert(key, body);
        }
        tracing::debug!("loaded {} assets from {}", out.files.len(), dir.display());
        Ok(out)
    }

    pub fn add_bytes(&mut self, path: impl Into<String>, body: Vec<u8>) {
        self.files.insert(path.into(), body);
    }

    pub fn list(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn find(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// `a/{b,c}/*` -> `a/b/*`, `a/c/*`. Groups do not nest.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    if let Some(open) = pattern.find('{') {
        if let Some(len) = pattern[open..].find('}') {
            let close = open + len;
            let (pre, body, post) = (
                &pattern[..open],
                &pattern[open + 1..close],
                &pattern[close + 1..],
            );
            return body
                .split(',')
                .flat_map(|alt| expand_braces(&format!("{pre}{alt}{post}")))
                .collect();
        }
    }
    vec![pattern.to_string()]
}

fn compile(pattern: &str) -> Result<Vec<glob::Pattern>> {
    expand_braces(pattern)
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| Error::config(format!("invalid asset pattern '{pattern}': {e}")))
        })
        .collect()
}

/// Writes assets into a staging directory.
#[derive(Debug)]
pub struct AssetWriter {
    assets: AssetBox,
    dest: PathBuf,
}

impl AssetWriter {
    pub fn new(assets: AssetBox, dest: impl Into<PathBuf>) -> Self {
        Self {
            assets,
            dest: dest.into(),
        }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn assets(&self) -> &AssetBox {
        &self.assets
    }

    pub fn add_bytes(&mut self, path: impl Into<String>, body: Vec<u8>) {
        self.assets.add_bytes(path, body);
    }

    /// Write every asset matching `pattern` (all of them for `None`). Returns
    /// how many files were written.
    pub fn write(&self, pattern: Option<&str>) -> Result<usize> {
        let matchers = pattern.map(compile).transpose()?;
        let mut written = 0usize;
        for (file, body) in &self.assets.files {
            if let Some(m) = &matchers {
                if !m.iter().any(|p| p.matches(file)) {
                    continue;
                }
            }
            let fp = self.dest.join(file);
            if POLITE_ASSETS.contains(&file.as_str()) && fp.exists() {
                continue;
            }
            if let Some(parent) = fp.parent() {
                ensure_dir(parent)?;
            }
            tracing::debug!("writing asset {file}");
            fs::write(&fp, body)
                .map_err(|e| Error::io(format!("failed to write {}: {e}", fp.display())))?;
            written += 1;
        }
        Ok(written)
    }

    /// Stage each existing input as `inputs/NNN.tfvars` in every terraform
    /// directory. Returns the ids in order; missing files are skipped.
    pub fn process_inputs(&mut self, inputs: &[PathBuf], base: &Path) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for input in inputs {
            let p = if input.is_absolute() {
                input.clone()
            } else {
                base.join(input)
            };
            if !p.is_file() {
                tracing::error!("input file {} does not exist", p.display());
                continue;
            }
            let body = fs::read(&p)
                .map_err(|e| Error::io(format!("failed to read input {}: {e}", p.display())))?;
            let id = format!("{:03}.tfvars", ids.len());
            for dir in [TF_VARS_DIR, TF_STATE_DIR, TF_DIR] {
                self.add_bytes(format!("{dir}/inputs/{id}"), body.clone());
            }
            ids.push(id);
        }
        if ids.is_empty() {
            return Err(Error::config(
                "no input files were found; pass \"--input <file>\"",
            ));
        }
        self.write(Some(INPUT_ASSETS))?;
        Ok(ids)
    }
}

/// `./input.tfvars` when present, otherwise whatever inputs a previous run
/// left in the staging directory.
pub fn initial_inputs(staging: &Path, cwd: &Path) -> Result<Vec<PathBuf>> {
    let local = cwd.join(DEFAULT_INPUT_FILE);
    let found = if local.is_file() {
        vec![local]
    } else {
        staged_inputs(&staging.join(TF_VARS_DIR))?
    };
    if !found.is_empty() {
        let listed = found
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(",\n\t");
        tracing::info!("reading input from [\n\t{listed},\n]");
    }
    Ok(found)
}

/// Input files already staged under `<dir>/inputs`, sorted by name.
pub fn staged_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let inputs = dir.join("inputs");
    if !inputs.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(&inputs)
        .map_err(|e| Error::io(format!("failed to list {}: {e}", inputs.display())))?
    {
        let entry =
            entry.map_err(|e| Error::io(format!("failed to list {}: {e}", inputs.display())))?;
        if entry.path().is_file() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_with(files: &[(&str, &str)]) -> AssetBox {
        let mut b = AssetBox::new();
        for (k, v) in files {
            b.add_bytes(*k, v.as_bytes().to_vec());
        }
        b
    }

    #[test]
    fn braces_expand_to_alternatives() {
        assert_eq!(
            expand_braces("{tf_vars,tf_state}/*"),
            vec!["tf_vars/*".to_string(), "tf_state/*".to_string()]
        );
        assert_eq!(expand_braces("tf/*"), vec!["tf/*".to_string()]);
        assert_eq!(expand_braces("a{b"), vec!["a{b".to_string()]);
    }

    #[test]
    fn pattern_filters_and_star_crosses_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = AssetWriter::new(
            box_with(&[
                ("tf/main.tf", "a"),
                ("tf_state/modules/bucket.tf", "b"),
                ("tf_vars/main.tf", "c"),
                ("k8s/rbac.yaml", "d"),
            ]),
            tmp.path(),
        );
        assert_eq!(w.write(Some("{tf_vars,tf_state}/*")).expect("write"), 2);
        assert!(tmp.path().join("tf_state/modules/bucket.tf").is_file());
        assert!(tmp.path().join("tf_vars/main.tf").is_file());
        assert!(!tmp.path().join("tf/main.tf").exists());

        assert_eq!(w.write(None).expect("write all"), 4);
    }

    #[test]
    fn polite_assets_do_not_replace_existing_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("tf_state")).expect("mkdir");
        fs::write(tmp.path().join("tf_state/terraform.tfstate"), "live").expect("write");

        let w = AssetWriter::new(
            box_with(&[
                ("tf_state/terraform.tfstate", "template"),
                ("kubeconfig.yaml", "template"),
                ("tf_state/main.tf", "template"),
            ]),
            tmp.path(),
        );
        w.write(None).expect("write");
        assert_eq!(
            fs::read_to_string(tmp.path().join("tf_state/terraform.tfstate")).expect("read"),
            "live"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("kubeconfig.yaml")).expect("read"),
            "template"
        );
    }

    #[test]
    fn inputs_are_numbered_among_accepted_files() {
        let cwd = tempfile::tempdir().expect("cwd");
        let staging = tempfile::tempdir().expect("staging");
        fs::write(cwd.path().join("a.tfvars"), "a = 1").expect("write");
        fs::write(cwd.path().join("b.tfvars"), "b = 2").expect("write");

        let mut w = AssetWriter::new(AssetBox::new(), staging.path());
        let ids = w
            .process_inputs(
                &[
                    PathBuf::from("missing.tfvars"),
                    PathBuf::from("a.tfvars"),
                    cwd.path().join("b.tfvars"),
                ],
                cwd.path(),
            )
            .expect("inputs");
        assert_eq!(ids, vec!["000.tfvars".to_string(), "001.tfvars".to_string()]);
        for dir in ["tf", "tf_state", "tf_vars"] {
            assert_eq!(
                fs::read_to_string(staging.path().join(dir).join("inputs/001.tfvars"))
                    .expect("read"),
                "b = 2"
            );
        }
    }

    #[test]
    fn zero_inputs_is_a_config_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut w = AssetWriter::new(AssetBox::new(), tmp.path());
        let err = w
            .process_inputs(&[PathBuf::from("nope.tfvars")], tmp.path())
            .expect_err("no inputs");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn initial_inputs_prefer_cwd_then_staged() {
        let cwd = tempfile::tempdir().expect("cwd");
        let staging = tempfile::tempdir().expect("staging");
        assert!(initial_inputs(staging.path(), cwd.path()).expect("none").is_empty());

        fs::create_dir_all(staging.path().join("tf_vars/inputs")).expect("mkdir");
        fs::write(staging.path().join("tf_vars/inputs/001.tfvars"), "y").expect("write");
        fs::write(staging.path().join("tf_vars/inputs/000.tfvars"), "x").expect("write");
        let staged = initial_inputs(staging.path(), cwd.path()).expect("staged");
        assert_eq!(
            staged,
            vec![
                staging.path().join("tf_vars/inputs/000.tfvars"),
                staging.path().join("tf_vars/inputs/001.tfvars"),
            ]
        );

        fs::write(cwd.path().join("input.tfvars"), "z").expect("write");
        assert_eq!(
            initial_inputs(staging.path(), cwd.path()).expect("cwd"),
            vec![cwd.path().join("input.tfvars")]
        );
    }

    #[test]
    fn load_reads_nested_templates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("kops")).expect("mkdir");
        fs::write(tmp.path().join("kops/cluster.yaml"), "kind: Cluster").expect("write");
        let b = AssetBox::load(tmp.path()).expect("load");
        assert_eq!(b.list().collect::<Vec<_>>(), vec!["kops/cluster.yaml"]);
        assert_eq!(b.find("kops/cluster.yaml"), Some(&b"kind: Cluster"[..]));

        assert!(AssetBox::load(&tmp.path().join("missing")).is_err());
    }
}
