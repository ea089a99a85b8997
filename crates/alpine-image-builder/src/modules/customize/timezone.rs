use std::fs;

use alpine_image_builder_macros::Task;
use serde::Deserialize;

use crate::chroot::run_in_root;
use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::{default_true, util};

fn default_zone() -> String {
    "UTC".into()
}

/// Install tzdata just long enough to copy one zone file into
/// `/etc/localtime`.
#[Task(
    id = "customize.timezone",
    module = "customize",
    phase = "customize",
    provides = ["customize:timezone"],
    after = ["mounts:acquired"],
    requires = ["mounts:active", "root:privileged"],
    default_label = "Set timezone",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimezoneTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_zone")]
    pub zone: String,
}

impl Default for TimezoneTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            zone: default_zone(),
        }
    }
}

impl TimezoneTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let root = build.root();
        let zone = cfg.zone.trim();
        let zone_path = format!("/usr/share/zoneinfo/{zone}");
        util::target_path(root, &zone_path)?;
        let dst = util::target_path(root, "/etc/localtime")?;

        run_in_root(ctx, root, "apk", ["add", "tzdata"])?;
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: copy {zone_path} -> {}", dst.display()));
        } else {
            let src = util::resolve_in_root(root, &zone_path)?;
            if !src.is_file() {
                return Err(Error::precondition(format!(
                    "zone file {} not found after installing tzdata",
                    src.display()
                )));
            }
            // A regular file, so the zone survives removing tzdata.
            util::remove_path_if_exists(&dst)?;
            fs::copy(&src, &dst).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} to {}: {e}",
                    src.display(),
                    dst.display()
                ))
            })?;
            ctx.log(&format!("timezone set to {zone}"));
        }
        run_in_root(ctx, root, "apk", ["del", "tzdata"])
    }
}
