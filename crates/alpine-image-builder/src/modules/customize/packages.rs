use alpine_image_builder_macros::Task;
use serde::Deserialize;

use crate::chroot::run_in_root;
use crate::config::{BuildConfig, ConfigDoc};
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::default_true;

fn default_install() -> Vec<String> {
    [
        "bash",
        "curl",
        "gettext",
        "less",
        "ncurses-terminfo",
        "openssh",
        "nano",
        "vim",
        "wget",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_remove() -> Vec<String> {
    vec!["linux-grsec".into(), "linux-firmware".into()]
}

fn apk_args<'a>(verb: &'a str, packages: &'a [String]) -> Vec<&'a str> {
    std::iter::once(verb)
        .chain(packages.iter().map(|p| p.trim()).filter(|p| !p.is_empty()))
        .collect()
}

#[Task(
    id = "customize.packages",
    module = "customize",
    phase = "customize",
    provides = ["customize:packages"],
    after = ["customize:timezone"],
    requires = ["mounts:active", "root:privileged"],
    default_label = "Install baseline packages",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackagesTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_install")]
    pub install: Vec<String>,
}

impl Default for PackagesTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            install: default_install(),
        }
    }
}

impl PackagesTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        run_in_root(ctx, build.root(), "apk", ["update"])?;
        let args = apk_args("add", &cfg.install);
        if args.len() == 1 {
            ctx.log("no baseline packages configured");
            return Ok(());
        }
        run_in_root(ctx, build.root(), "apk", args)
    }
}

/// Drop kernel packages; the image boots on the host's kernel.
#[Task(
    id = "customize.prune",
    module = "customize",
    phase = "customize",
    provides = ["customize:prune"],
    after = ["customize:packages"],
    requires = ["mounts:active", "root:privileged"],
    default_label = "Remove kernel packages",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PruneTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_remove")]
    pub remove: Vec<String>,
}

impl Default for PruneTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            remove: default_remove(),
        }
    }
}

impl PruneTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let args = apk_args("del", &cfg.remove);
        if args.len() == 1 {
            return Ok(());
        }
        run_in_root(ctx, build.root(), "apk", args)
    }
}

#[Task(
    id = "customize.upgrade",
    module = "customize",
    phase = "customize",
    provides = ["customize:upgrade"],
    after = ["customize:prune"],
    requires = ["mounts:active", "root:privileged"],
    default_label = "Upgrade packages",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpgradeTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for UpgradeTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl UpgradeTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        run_in_root(ctx, build.root(), "apk", ["upgrade"])
    }
}
