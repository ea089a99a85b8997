//! Base provisioning: fetch the static apk, trust the release keys, and
//! install the base package set into a fresh package database.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use alpine_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::{ModuleToggle, default_true, util};

pub const DEFAULT_KEY_HOST: &str = "https://alpinelinux.org/keys";

/// Path of the extracted tool inside the bootstrap dir.
pub const APK_STATIC_REL: &str = "sbin/apk.static";

fn default_timeout_secs() -> u64 {
    120
}

fn default_key_host() -> String {
    DEFAULT_KEY_HOST.into()
}

fn default_keys() -> Vec<String> {
    [
        "alpine-devel@lists.alpinelinux.org-4a6a0840.rsa.pub",
        "alpine-devel@lists.alpinelinux.org-5243ef4b.rsa.pub",
        "alpine-devel@lists.alpinelinux.org-524d27bb.rsa.pub",
        "alpine-devel@lists.alpinelinux.org-5261cecb.rsa.pub",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_base_packages() -> Vec<String> {
    vec!["alpine-base".into()]
}

#[Task(
    id = "bootstrap.fetch",
    module = "bootstrap",
    phase = "fetch",
    provides = ["bootstrap:tool"],
    after = ["target:reset"],
    default_label = "Fetch apk-tools-static",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FetchTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl FetchTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = ws.bootstrap_dir(&build.release);
        let tool = fetch_bootstrap_tool(
            ctx,
            &build,
            &dir,
            Duration::from_secs(cfg.timeout_secs),
        )?;
        ctx.log(&format!("bootstrap tool ready at {}", tool.display()));
        Ok(())
    }
}

/// Download `apk-tools-static-<ref>.apk` into `dir` and extract
/// `sbin/apk.static` next to it. Always re-fetched.
pub fn fetch_bootstrap_tool(
    ctx: &ExecCtx,
    build: &BuildConfig,
    dir: &Path,
    timeout: Duration,
) -> Result<PathBuf> {
    let url = build.bootstrap_url();
    let pkg = dir.join(build.bootstrap_file_name());
    let tool = dir.join(APK_STATIC_REL);
    if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: GET {url} -> {}", pkg.display()));
        ctx.log(&format!("DRY-RUN: extract {APK_STATIC_REL} into {}", dir.display()));
        return Ok(tool);
    }

    ctx.log(&format!("GET {url}"));
    util::download(&url, &pkg, timeout).map_err(|e| e.context("fetching bootstrap tool"))?;
    util::remove_path_if_exists(&tool)?;

    // An .apk is a run of concatenated gzip'd tar segments.
    let mut cmd = Command::new("tar");
    cmd.arg("-xzf")
        .arg(&pkg)
        .arg("-C")
        .arg(dir)
        .arg(APK_STATIC_REL);
    ctx.run_cmd_as(ErrorKind::Io, cmd)?;

    if !tool.is_file() {
        return Err(Error::transport(format!(
            "{} does not contain {APK_STATIC_REL}",
            pkg.display()
        )));
    }
    set_executable(&tool)?;
    Ok(tool)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::msg(format!("failed to set mode on {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[Task(
    id = "bootstrap.keys",
    module = "bootstrap",
    phase = "keys",
    provides = ["bootstrap:keys"],
    after = ["bootstrap:tool"],
    default_label = "Import signing keys",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeysTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_key_host")]
    pub key_host: String,
    #[serde(default = "default_keys")]
    pub keys: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KeysTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            key_host: default_key_host(),
            keys: default_keys(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl KeysTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let staging = ws.scratch_dir.join("keys");
        let installed = import_trust_keys(
            ctx,
            build.root(),
            &staging,
            cfg.key_host.trim_end_matches('/'),
            &cfg.keys,
            Duration::from_secs(cfg.timeout_secs),
        )?;
        ctx.log(&format!("installed {installed} signing keys"));
        Ok(())
    }
}

/// Fetch each key from `key_host` into `staging`, check it is a PEM public
/// key, and copy it to `<root>/etc/apk/keys/<id>`.
pub fn import_trust_keys(
    ctx: &ExecCtx,
    root: &Path,
    staging: &Path,
    key_host: &str,
    key_ids: &[String],
    timeout: Duration,
) -> Result<usize> {
    let keys_dir = root.join("etc/apk/keys");
    if key_ids.is_empty() {
        return Err(Error::config(
            "bootstrap.steps.keys.keys is empty; at least one signing key is required",
        ));
    }
    if ctx.dry_run {
        for id in key_ids {
            ctx.log(&format!("DRY-RUN: GET {key_host}/{id} -> {}", keys_dir.display()));
        }
        return Ok(key_ids.len());
    }

    util::ensure_dir(&keys_dir)?;
    for id in key_ids {
        let id = id.trim();
        if id.is_empty() || id.contains('/') {
            return Err(Error::config(format!("invalid key name '{id}'")));
        }
        let url = format!("{key_host}/{id}");
        let staged = staging.join(id);
        ctx.log(&format!("GET {url}"));
        util::download(&url, &staged, timeout)?;

        let pem = fs::read_to_string(&staged)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", staged.display())))?;
        if !is_pem_public_key(&pem) {
            return Err(Error::transport(format!(
                "{url} did not return a PEM public key"
            )));
        }
        util::replace_file_text(&keys_dir.join(id), &pem)?;
    }
    Ok(key_ids.len())
}

fn is_pem_public_key(content: &str) -> bool {
    content.contains("-----BEGIN PUBLIC KEY-----") && content.contains("-----END PUBLIC KEY-----")
}

#[Task(
    id = "bootstrap.base",
    module = "bootstrap",
    phase = "base",
    provides = ["bootstrap:base"],
    after = ["bootstrap:keys"],
    requires = ["root:privileged"],
    default_label = "Install base system",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BaseTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_base_packages")]
    pub packages: Vec<String>,
}

impl Default for BaseTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            packages: default_base_packages(),
        }
    }
}

impl BaseTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let tool = ws.bootstrap_dir(&build.release).join(APK_STATIC_REL);
        bootstrap_base(ctx, &tool, &build, &cfg.packages)
    }
}

/// `apk.static --initdb add` the base set into the target root.
pub fn bootstrap_base(
    ctx: &ExecCtx,
    tool: &Path,
    build: &BuildConfig,
    packages: &[String],
) -> Result<()> {
    if packages.is_empty() {
        return Err(Error::config("bootstrap.steps.base.packages is empty"));
    }
    if !ctx.dry_run && !tool.is_file() {
        return Err(Error::precondition(format!(
            "bootstrap tool {} is missing; bootstrap.fetch has not run",
            tool.display()
        )));
    }
    ctx.run_cmd(base_command(tool, build, packages))?;
    ctx.log(&format!(
        "initialized package database in {}",
        build.root().display()
    ));
    Ok(())
}

fn base_command(tool: &Path, build: &BuildConfig, packages: &[String]) -> Command {
    let mut cmd = Command::new(tool);
    cmd.arg("-X")
        .arg(build.repository_url("main"))
        .args(["-U", "--allow-untrusted", "--root"])
        .arg(build.root())
        .args(["--initdb", "add"])
        .args(packages);
    cmd
}

#[Module(
    id = "bootstrap",
    config = ModuleToggle,
    config_path = "bootstrap",
    tasks = [FetchTask, KeysTask, BaseTask]
)]
pub struct BootstrapModule;
