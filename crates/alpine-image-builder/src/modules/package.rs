//! Final archive of the target root, plus a checksum sidecar and a JSON
//! build report next to it.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use alpine_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::modules::{ModuleToggle, default_true, util};

/// Pseudo filesystems and caches never shipped in the image.
pub const BUILTIN_EXCLUDES: &[&str] = &[
    "./proc/*",
    "./sys/*",
    "./dev/*",
    "./tmp/*",
    "./var/cache/apk/*",
];

const INSTALLED_DB: &str = "lib/apk/db/installed";

#[Task(
    id = "package.archive",
    module = "package",
    phase = "archive",
    provides = ["package:archive"],
    after = ["customize:done", "guest:installed?"],
    requires = ["root:privileged"],
    default_label = "Package image",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Extra tar exclude patterns, one per line.
    pub exclude_file: Option<String>,
    #[serde(default = "default_true")]
    pub report: bool,
}

impl Default for ArchiveTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            exclude_file: None,
            report: true,
        }
    }
}

impl ArchiveTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let date = ctx.build_date();
        let artifact = ws.out_dir.join(build.artifact_name(&date));

        let user_excludes = match cfg.exclude_file.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => read_exclude_file(&ws.resolve_config_path(raw)?)?,
            _ => Vec::new(),
        };
        let manifest = ws.scratch_dir.join("exclude.lst");
        util::write_text(&manifest, &render_excludes(&user_excludes))?;

        if ctx.dry_run {
            return archive(ctx, build.root(), &artifact, &manifest);
        }
        // Everything below lands in out_dir only once the whole run succeeds.
        let staged = ctx.stage_output(&artifact)?;
        archive(ctx, build.root(), &staged, &manifest)?;

        let digest = sha256_file_hex(&staged)?;
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sidecar = PathBuf::from(format!("{}.sha256", artifact.display()));
        util::write_text(
            &ctx.stage_output(&sidecar)?,
            &format!("{digest}  {file_name}\n"),
        )?;
        ctx.log(&format!("sha256 {digest}"));

        if cfg.report {
            let report_path = ws.out_dir.join(format!("{}-{date}.json", build.image));
            let report = serde_json::json!({
                "image": build.image,
                "name": build.name,
                "release": build.release,
                "mirror": build.mirror,
                "arch": build.arch,
                "build_date": date,
                "artifact": file_name,
                "sha256": digest,
                "installed_packages": installed_package_count(build.root())?,
            });
            util::write_json_pretty(&ctx.stage_output(&report_path)?, &report)?;
        }
        Ok(())
    }
}

/// `tar -czf <output> --numeric-owner --exclude-from=<manifest> -C <root> .`
/// A partial archive is removed when tar fails.
pub fn archive(ctx: &ExecCtx, root: &Path, output: &Path, manifest: &Path) -> Result<()> {
    if output.starts_with(root) {
        return Err(Error::config(format!(
            "artifact {} would be written inside the target root",
            output.display()
        )));
    }
    if !ctx.dry_run {
        util::remove_path_if_exists(output)?;
        if let Some(parent) = output.parent() {
            util::ensure_dir(parent)?;
        }
    }

    let mut cmd = Command::new("tar");
    cmd.arg("-czf")
        .arg(output)
        .arg("--numeric-owner")
        .arg(format!("--exclude-from={}", manifest.display()))
        .arg("-C")
        .arg(root)
        .arg(".");
    if let Err(e) = ctx.run_cmd_as(ErrorKind::Packaging, cmd) {
        if let Err(cleanup) = util::remove_path_if_exists(output) {
            tracing::warn!(error = %cleanup, "failed to remove partial artifact");
        }
        return Err(e);
    }
    ctx.log(&format!("wrote {}", output.display()));
    Ok(())
}

/// Built-in patterns followed by the user's, one per line.
pub fn render_excludes(user: &[String]) -> String {
    BUILTIN_EXCLUDES
        .iter()
        .copied()
        .chain(user.iter().map(String::as_str))
        .map(|p| format!("{p}\n"))
        .collect()
}

/// Non-blank, non-comment lines of an exclusion file.
pub fn read_exclude_file(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "failed to read exclude file {}: {e}",
            path.display()
        ))
    })?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Number of packages recorded in the target's apk database.
pub fn installed_package_count(root: &Path) -> Result<usize> {
    let db = root.join(INSTALLED_DB);
    match fs::read_to_string(&db) {
        Ok(s) => Ok(s.lines().filter(|l| l.starts_with("P:")).count()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::msg(format!("failed to read {}: {e}", db.display()))),
    }
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[Module(id = "package", config = ModuleToggle, config_path = "package", tasks = [ArchiveTask])]
pub struct PackageModule;
