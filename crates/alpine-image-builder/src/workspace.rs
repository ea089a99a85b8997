//! Host-side scratch workspace.
//!
//! Downloads, generated manifests and error logs live here, never in the
//! target root. The scratch dir is created once and reused across runs.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_scratch_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
    /// Where the build artifact is written.
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    /// Wipe the scratch dir (cached bootstrap tool included) before the run.
    pub clean: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            scratch_dir: default_scratch_dir(),
            out_dir: default_out_dir(),
            clean: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub scratch_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    /// Absolute paths pass through, relative ones are rooted at the workspace root.
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }
        let p = PathBuf::from(raw);
        Ok(if p.is_absolute() { p } else { self.root.join(p) })
    }

    /// `<scratch>/apk-tools/<release>`
    pub fn bootstrap_dir(&self, release: &str) -> PathBuf {
        self.scratch_dir.join("apk-tools").join(release)
    }

    pub fn error_logs_dir(&self) -> PathBuf {
        self.scratch_dir.join("error-logs")
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = join_user_path(&cwd, &cfg.root_dir)?;
    Ok(WorkspacePaths {
        scratch_dir: join_user_path(&root, &cfg.scratch_dir)?,
        out_dir: join_user_path(&root, &cfg.out_dir)?,
        root,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;
    if cfg.clean {
        remove_inside_root(&paths.root, &paths.scratch_dir)?;
    }
    for dir in [&paths.scratch_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn join_user_path(base: &Path, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let p = Path::new(raw);
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::config(format!(
            "invalid workspace path '{raw}' (contains '..')"
        )));
    }
    Ok(if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    })
}

fn remove_inside_root(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if dir_can == root_can || !dir_can.starts_with(&root_can) {
        return Err(Error::config(format!(
            "refusing to clean '{}' (not below workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dir_can.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_dirs_hang_off_the_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            root_dir: tmp.path().display().to_string(),
            scratch_dir: "scratch".into(),
            ..WorkspaceConfig::default()
        };
        let paths = init_dirs(&cfg).expect("init");
        assert_eq!(paths.scratch_dir, tmp.path().join("scratch"));
        assert_eq!(paths.out_dir, tmp.path().join("."));
        assert!(paths.scratch_dir.is_dir());
        assert_eq!(
            paths.bootstrap_dir("3.2"),
            tmp.path().join("scratch/apk-tools/3.2")
        );
        assert_eq!(
            paths.resolve_config_path("exclude.txt").expect("path"),
            tmp.path().join("exclude.txt")
        );
    }

    #[test]
    fn clean_keeps_out_dir_and_refuses_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().display().to_string();
        fs::create_dir_all(tmp.path().join("build/apk-tools")).expect("mkdir");

        let cfg = WorkspaceConfig {
            root_dir: root.clone(),
            clean: true,
            ..WorkspaceConfig::default()
        };
        init_dirs(&cfg).expect("init");
        assert!(!tmp.path().join("build/apk-tools").exists());

        let cfg = WorkspaceConfig {
            root_dir: root,
            scratch_dir: ".".into(),
            clean: true,
            ..WorkspaceConfig::default()
        };
        assert!(init_dirs(&cfg).is_err());
    }

    #[test]
    fn parent_components_are_rejected() {
        let cfg = WorkspaceConfig {
            scratch_dir: "../elsewhere".into(),
            ..WorkspaceConfig::default()
        };
        assert!(load_paths(&cfg).is_err());
    }
}
