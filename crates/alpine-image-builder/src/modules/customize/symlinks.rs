use std::collections::BTreeMap;

use alpine_image_builder_macros::Task;
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::{default_true, util};

fn default_links() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("/sbin/init".to_string(), "../bin/busybox".to_string()),
        ("/usr/bin/su".to_string(), "../../bin/bbsuid".to_string()),
    ])
}

#[Task(
    id = "customize.symlinks",
    module = "customize",
    phase = "customize",
    provides = ["customize:symlinks"],
    after = ["customize:services"],
    default_label = "Fix busybox links",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SymlinksTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Image path to relative link target.
    #[serde(default = "default_links")]
    pub links: BTreeMap<String, String>,
}

impl Default for SymlinksTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            links: default_links(),
        }
    }
}

impl SymlinksTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        for (link, target) in &cfg.links {
            let target = target.trim();
            // Absolute targets would resolve against the host when inspected.
            if target.is_empty() || target.starts_with('/') {
                return Err(Error::config(format!(
                    "link target for {link} must be relative, got '{target}'"
                )));
            }
            let path = util::target_path(build.root(), link)?;
            if ctx.dry_run {
                ctx.log(&format!("DRY-RUN: ln -sf {target} {}", path.display()));
                continue;
            }
            if util::ensure_symlink(target, &path)? {
                ctx.log(&format!("{link} -> {target}"));
            }
        }
        Ok(())
    }
}
