use std::fs;
use std::path::Path;

use alpine_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::{ModuleToggle, default_true, util};
use crate::mounts;

#[Task(
    id = "target.reset",
    module = "target",
    phase = "reset",
    provides = ["target:reset"],
    after = ["core.init"],
    default_label = "Reset target root",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResetTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ResetTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ResetTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let root = build.root();
        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: release mounts under {} and empty it",
                root.display()
            ));
            return Ok(());
        }
        ctx.release_mounts()?;
        reset_root(ctx, root)
    }
}

/// Unwind mounts below `root`, then leave it as an empty directory.
pub fn reset_root(ctx: &ExecCtx, root: &Path) -> Result<()> {
    for p in mounts::release(root)? {
        ctx.log(&format!("unmounted stale {}", p.display()));
    }
    // Deleting through a live bind mount would reach the host.
    let left = mounts::active_mounts(root)?;
    if !left.is_empty() {
        return Err(Error::precondition(format!(
            "refusing to clear {}: {} is still mounted",
            root.display(),
            left[0].display()
        )));
    }

    if !root.is_dir() {
        util::ensure_dir(root)?;
        ctx.log(&format!("created {}", root.display()));
        return Ok(());
    }

    // Clear entries rather than the directory, which may be a mount point itself.
    let entries = fs::read_dir(root)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", root.display())))?;
    let mut removed = 0usize;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::msg(format!("failed to read {}: {e}", root.display())))?;
        util::remove_path_if_exists(&entry.path())?;
        removed += 1;
    }
    if removed > 0 {
        ctx.log(&format!("cleared {removed} entries from {}", root.display()));
    }
    Ok(())
}

#[Module(id = "target", config = ModuleToggle, config_path = "target", tasks = [ResetTask])]
pub struct TargetModule;
