use alpine_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::{ModuleToggle, default_true};
use crate::mounts::MountSet;

#[Task(
    id = "mounts.acquire",
    module = "mounts",
    phase = "acquire",
    provides = ["mounts:acquired"],
    after = ["network:repositories"],
    requires = ["root:privileged"],
    default_label = "Mount proc and sys",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquireTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for AcquireTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl AcquireTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let set = MountSet::acquire(ctx, build.root())?;
        ctx.hold_mounts(set)?;
        ctx.log(&format!("mounted proc and sys under {}", build.root().display()));
        Ok(())
    }
}

// Packaging runs with the mounts attached (they are excluded from the
// archive); they come down once the artifact exists.
#[Task(
    id = "mounts.release",
    module = "mounts",
    phase = "release",
    provides = ["mounts:released"],
    after = ["package:archive"],
    default_label = "Unmount proc and sys",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleaseTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ReleaseTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ReleaseTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        ctx.release_mounts()?;
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: unmount everything below {}", build.root().display()));
            return Ok(());
        }
        // Catch anything mounted below the root by guest tooling.
        for p in crate::mounts::release(build.root())? {
            ctx.log(&format!("unmounted {}", p.display()));
        }
        ctx.log(&format!("no mounts left under {}", build.root().display()));
        Ok(())
    }
}

#[Module(
    id = "mounts",
    config = ModuleToggle,
    config_path = "mounts",
    tasks = [AcquireTask, ReleaseTask]
)]
pub struct MountsModule;
