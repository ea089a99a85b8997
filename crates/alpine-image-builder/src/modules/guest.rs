use std::process::Command;

use alpine_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::default_true;

/// External guest tooling installer, run once with the target root as its
/// last argument. Only planned when a `[guest]` table is present.
#[Task(
    id = "guest.install",
    module = "guest",
    phase = "install",
    config_path = "guest",
    provides = ["guest:installed"],
    after = ["customize:done"],
    requires = ["root:privileged"],
    default_label = "Install guest tooling"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuestTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub installer: Option<String>,
    pub args: Vec<String>,
}

impl Default for GuestTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            installer: None,
            args: Vec::new(),
        }
    }
}

impl GuestTask {
    fn installer(&self) -> Option<&str> {
        self.installer
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let Some(raw) = cfg.installer() else {
            return Err(Error::config("guest.installer is empty"));
        };
        let ws = ctx.workspace_paths_or_init(doc)?;
        let installer = ws.resolve_config_path(raw)?;
        if !ctx.dry_run && !installer.is_file() {
            return Err(Error::precondition(format!(
                "guest installer {} not found",
                installer.display()
            )));
        }

        let mut cmd = Command::new(&installer);
        cmd.args(&cfg.args).arg(build.root());
        ctx.run_cmd_as(ErrorKind::Privileged, cmd)
            .map_err(|e| e.context("guest tooling installer"))
    }
}

/// Reject a `[guest]` table that is enabled but names no installer.
pub fn check_config(doc: &ConfigDoc) -> Result<()> {
    if !doc.has_table_path(GuestTask::CONFIG_PATH) {
        return Ok(());
    }
    let cfg: GuestTask = doc
        .deserialize_path(GuestTask::CONFIG_PATH)?
        .unwrap_or_default();
    if cfg.enabled && cfg.installer().is_none() {
        return Err(Error::config(
            "[guest] is present but guest.installer is not set (flag --guest-tools)",
        ));
    }
    Ok(())
}

#[Module(
    id = "guest",
    config = GuestTask,
    config_path = "guest",
    tasks = [GuestTask],
    optional = true
)]
pub struct GuestModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(raw: &str) -> ConfigDoc {
        ConfigDoc::from_value("<mem>", toml::from_str(raw).expect("toml"))
    }

    #[test]
    fn absent_table_needs_nothing() {
        check_config(&doc("")).unwrap();
        check_config(&doc("[guest]\nenabled = false\n")).unwrap();
    }

    #[test]
    fn enabled_table_needs_an_installer() {
        let err = check_config(&doc("[guest]\nargs = [\"-q\"]\n")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        check_config(&doc("[guest]\ninstaller = \"tools/install.sh\"\n")).unwrap();
    }
}
