use alpine_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::{ModuleToggle, default_true, util};

fn default_nameservers() -> Vec<String> {
    vec!["8.8.8.8".into(), "8.8.4.4".into()]
}

fn default_channels() -> Vec<String> {
    vec!["main".into(), "community".into()]
}

#[Task(
    id = "network.resolv",
    module = "network",
    phase = "configure",
    provides = ["network:resolv"],
    after = ["bootstrap:base"],
    default_label = "Write resolv.conf",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolvTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,
}

impl Default for ResolvTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            nameservers: default_nameservers(),
        }
    }
}

impl ResolvTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let path = util::target_path(build.root(), "/etc/resolv.conf")?;
        util::write_target_file(ctx, &path, &render_resolv_conf(&cfg.nameservers)?)
    }
}

pub fn render_resolv_conf(nameservers: &[String]) -> Result<String> {
    let mut out = String::new();
    for ns in nameservers.iter().map(|s| s.trim()) {
        if ns.is_empty() || ns.contains(char::is_whitespace) {
            return Err(Error::config(format!("invalid nameserver '{ns}'")));
        }
        out.push_str(&format!("nameserver {ns}\n"));
    }
    if out.is_empty() {
        return Err(Error::config("network.steps.resolv.nameservers is empty"));
    }
    Ok(out)
}

#[Task(
    id = "network.repositories",
    module = "network",
    phase = "configure",
    provides = ["network:repositories"],
    after = ["network:resolv"],
    default_label = "Write apk repositories",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoriesTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

impl Default for RepositoriesTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            channels: default_channels(),
        }
    }
}

impl RepositoriesTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let path = util::target_path(build.root(), "/etc/apk/repositories")?;
        let body = render_repositories(&build, &cfg.channels)?;
        util::write_target_file(ctx, &path, &body)
    }
}

/// One `<mirror>/v<release>/<channel>` line per channel.
pub fn render_repositories(build: &BuildConfig, channels: &[String]) -> Result<String> {
    if channels.is_empty() {
        return Err(Error::config("network.steps.repositories.channels is empty"));
    }
    Ok(channels
        .iter()
        .map(|c| format!("{}\n", build.repository_url(c.trim())))
        .collect())
}

#[Module(
    id = "network",
    config = ModuleToggle,
    config_path = "network",
    tasks = [ResolvTask, RepositoriesTask]
)]
pub struct NetworkModule;

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::executor::StdoutSink;

    fn doc_for(root: &std::path::Path) -> ConfigDoc {
        let raw = format!(
            r#"
[build]
release = "3.2"
apk_tools = "2.6.5-r1"
install_dir = "{}"
mirror = "http://example/alpine"
image = "alpine-3"
name = "Alpine Linux"
"#,
            root.display()
        );
        ConfigDoc::from_value("<mem>", toml::from_str(&raw).expect("toml"))
    }

    #[test]
    fn resolv_conf_is_overwritten_exactly() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("etc/resolv.conf");
        util::write_text(&path, "nameserver 10.0.0.1\nsearch lan\n").unwrap();

        let doc = doc_for(tmp.path());
        let mut ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
        ResolvTask::exec(&doc, &mut ctx).unwrap();
        ResolvTask::exec(&doc, &mut ctx).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "nameserver 8.8.8.8\nnameserver 8.8.4.4\n"
        );
    }

    #[test]
    fn repositories_are_rewritten_exactly() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("etc/apk/repositories");
        util::write_text(&path, "http://old-mirror/alpine/v3.1/main\n#testing\n").unwrap();

        let doc = doc_for(tmp.path());
        let mut ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
        RepositoriesTask::exec(&doc, &mut ctx).unwrap();
        RepositoriesTask::exec(&doc, &mut ctx).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "http://example/alpine/v3.2/main\nhttp://example/alpine/v3.2/community\n"
        );
    }

    #[test]
    fn empty_nameserver_list_is_rejected() {
        assert!(render_resolv_conf(&[]).is_err());
        assert!(render_resolv_conf(&["8.8.8.8 1.1.1.1".into()]).is_err());
    }
}
