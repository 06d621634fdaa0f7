//! Source reader over a git-sync style checkout.
//!
//! Two layouts are understood: `root` is a symlink whose target directory is
//! named after the commit (what git-sync publishes), or `root` is a plain
//! working tree with a `.git` directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use driftless_core::SourceState;
use tracing::debug;

use crate::SourceReader;

const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

pub struct DirReader {
    root: PathBuf,
    policy_dir: PathBuf,
}

impl DirReader {
    /// `policy_dir` is relative to the checkout root.
    pub fn new(root: impl Into<PathBuf>, policy_dir: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), policy_dir: policy_dir.into() }
    }

    /// Resolve the current commit and the directory it is checked out in.
    fn resolve(&self) -> Result<(String, PathBuf)> {
        let meta = fs::symlink_metadata(&self.root).with_context(|| format!("stat {}", self.root.display()))?;
        if meta.file_type().is_symlink() {
            let target = fs::canonicalize(&self.root).with_context(|| format!("resolving {}", self.root.display()))?;
            let commit = target
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.trim_start_matches("rev-").to_string())
                .ok_or_else(|| anyhow!("cannot derive commit from {}", target.display()))?;
            return Ok((commit, target));
        }
        let commit = head_commit(&self.root.join(".git"))?;
        Ok((commit, self.root.clone()))
    }
}

fn head_commit(git_dir: &Path) -> Result<String> {
    let head = fs::read_to_string(git_dir.join("HEAD")).with_context(|| format!("reading {}/HEAD", git_dir.display()))?;
    let head = head.trim();
    let commit = match head.strip_prefix("ref: ") {
        Some(r) => fs::read_to_string(git_dir.join(r))
            .or_else(|_| packed_ref(git_dir, r))
            .with_context(|| format!("resolving {}", r))?
            .trim()
            .to_string(),
        None => head.to_string(),
    };
    if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("HEAD does not name a commit: {:?}", commit);
    }
    Ok(commit)
}

fn packed_ref(git_dir: &Path, name: &str) -> std::io::Result<String> {
    let packed = fs::read_to_string(git_dir.join("packed-refs"))?;
    packed
        .lines()
        .filter(|l| !l.starts_with('#') && !l.starts_with('^'))
        .find_map(|l| l.split_once(' ').filter(|(_, r)| *r == name).map(|(sha, _)| sha.to_string()))
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name.to_string()))
}

fn collect_manifests(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_str().map(|n| n.starts_with('.')).unwrap_or(false);
        if hidden {
            continue;
        }
        if entry.file_type()?.is_dir() {
            collect_manifests(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()).map(|e| MANIFEST_EXTENSIONS.contains(&e)).unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}

impl SourceReader for DirReader {
    fn read(&self) -> Result<SourceState> {
        let (commit, checkout) = self.resolve()?;
        let policy_dir = checkout.join(&self.policy_dir);
        if !policy_dir.is_dir() {
            bail!("policy directory {} does not exist at commit {}", policy_dir.display(), commit);
        }
        let mut files = Vec::new();
        collect_manifests(&policy_dir, &mut files)?;
        files.sort();

        let (after, _) = self.resolve()?;
        if after != commit {
            bail!("source moved from {} to {} while reading; will retry", commit, after);
        }
        debug!(%commit, files = files.len(), "source read");
        Ok(SourceState { commit, policy_dir, files })
    }
}
