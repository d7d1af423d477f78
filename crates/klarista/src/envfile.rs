use crate::error::{Error, Result};

pub const BASE_NAMES: &[&str] = &[
    "AWS_PROFILE",
    "AWS_REGION",
    "CLUSTER",
    "KOPS_STATE_STORE",
    "KUBECONFIG",
];

pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEnv {
    vars: Vec<(String, String)>,
}

impl ResolvedEnv {
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn names(&self) -> Vec<&str> {
        self.vars.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `export NAME="VALUE"` lines joined by `\n`. Values are written as-is so
    /// `${...}` references expand when the file is sourced.
    pub fn render(&self) -> String {
        self.vars
            .iter()
            .map(|(k, v)| format!("export {k}=\"{v}\""))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A variable depends on every other variable whose name appears in its
/// value. Assignments are emitted shallowest first, so a line only refers to
/// names assigned above it.
pub struct EnvResolver<F> {
    ambient: F,
}

impl<F> EnvResolver<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(ambient: F) -> Self {
        Self { ambient }
    }

    pub fn resolve<I, K, V>(&self, overrides: I) -> Result<ResolvedEnv>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut names: Vec<String> = BASE_NAMES.iter().map(|s| s.to_string()).collect();
        let mut given: Vec<(String, String)> = Vec::new();
        for (k, v) in overrides {
            let (k, v) = (k.into(), v.into());
            validate_name(&k)?;
            if !names.contains(&k) {
                names.push(k.clone());
            }
            match given.iter_mut().find(|(gk, _)| *gk == k) {
                Some(slot) => slot.1 = v,
                None => given.push((k, v)),
            }
        }

        let values: Vec<String> = names
            .iter()
            .map(|name| {
                given
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .or_else(|| (self.ambient)(name))
                    .unwrap_or_default()
            })
            .collect();

        let depths = dependency_depths(&names, &values)?;
        let mut order: Vec<usize> = (0..names.len()).collect();
        order.sort_by_key(|&i| depths[i]);

        let vars = order
            .into_iter()
            .map(|i| (names[i].clone(), values[i].clone()))
            .collect();
        Ok(ResolvedEnv { vars })
    }
}

/// Environment file for a cluster nobody has provisioned from this machine yet.
pub fn default_environment_file<F>(cluster: &str, ambient: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let resolved = EnvResolver::new(ambient).resolve([
        (
            "KLARISTA_LOCAL_STATE_DIR",
            format!("${{TMPDIR:-/tmp/}}{cluster}"),
        ),
        (
            "KUBECONFIG",
            "${KLARISTA_LOCAL_STATE_DIR}/kubeconfig.yaml".to_string(),
        ),
    ])?;
    Ok(resolved.render())
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ok {
        return Err(Error::config(format!(
            "'{name}' is not a valid environment variable name"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    Unvisited,
    InProgress,
    Done(usize),
}

// Longest reference chain ending at each name; a name with no references is 1.
fn dependency_depths(names: &[String], values: &[String]) -> Result<Vec<usize>> {
    let deps: Vec<Vec<usize>> = (0..names.len())
        .map(|i| {
            (0..names.len())
                .filter(|&j| j != i && values[i].contains(names[j].as_str()))
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; names.len()];
    let mut path = Vec::new();
    let mut out = Vec::with_capacity(names.len());
    for i in 0..names.len() {
        out.push(visit(i, names, &deps, &mut marks, &mut path)?);
    }
    Ok(out)
}

fn visit(
    i: usize,
    names: &[String],
    deps: &[Vec<usize>],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Result<usize> {
    match marks[i] {
        Mark::Done(d) => return Ok(d),
        Mark::InProgress => {
            let start = path.iter().position(|&p| p == i).unwrap_or(0);
            let mut cycle: Vec<&str> = path[start..].iter().map(|&p| names[p].as_str()).collect();
            cycle.push(names[i].as_str());
            return Err(Error::cycle(format!(
                "environment variable dependency cycle detected: {}",
                cycle.join(" -> ")
            )));
        }
        Mark::Unvisited => {}
    }

    marks[i] = Mark::InProgress;
    path.push(i);
    let mut depth = 1;
    for &j in &deps[i] {
        depth = depth.max(visit(j, names, deps, marks, path)? + 1);
    }
    path.pop();
    marks[i] = Mark::Done(depth);
    Ok(depth)
}
