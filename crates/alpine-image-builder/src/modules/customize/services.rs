use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use alpine_image_builder_macros::Task;
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::{default_true, util};

fn default_runlevels() -> BTreeMap<String, Vec<String>> {
    let group = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        ("sysinit".to_string(), group(&["devfs", "dmesg", "mdev"])),
        (
            "boot".to_string(),
            group(&["bootmisc", "hostname", "networking", "syslog", "urandom"]),
        ),
        ("default".to_string(), group(&["sshd", "crond"])),
        (
            "shutdown".to_string(),
            group(&["killprocs", "mount-ro", "savecache"]),
        ),
    ])
}

/// OpenRC runlevel registration, written as the links `rc-update add` makes.
#[Task(
    id = "customize.services",
    module = "customize",
    phase = "customize",
    provides = ["customize:services"],
    after = ["customize:sshd"],
    default_label = "Register services",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_runlevels")]
    pub runlevels: BTreeMap<String, Vec<String>>,
}

impl Default for ServicesTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            runlevels: default_runlevels(),
        }
    }
}

impl ServicesTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let mut added = 0usize;
        for (level, services) in &cfg.runlevels {
            for svc in services {
                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: rc-update add {svc} {level}"));
                    continue;
                }
                if enable_service(build.root(), level, svc)? {
                    ctx.log(&format!("added {svc} to runlevel {level}"));
                    added += 1;
                }
            }
        }
        ctx.log(&format!("{added} service links added"));
        Ok(())
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::config(format!("invalid {kind} name '{name}'")));
    }
    Ok(())
}

/// Link `/etc/runlevels/<level>/<svc>` to `/etc/init.d/<svc>` unless an entry
/// is already there. Returns whether a link was created.
pub fn enable_service(root: &Path, level: &str, svc: &str) -> Result<bool> {
    check_name("runlevel", level)?;
    check_name("service", svc)?;
    let script = root.join("etc/init.d").join(svc);
    if fs::symlink_metadata(&script).is_err() {
        return Err(Error::precondition(format!(
            "service '{svc}' has no init script at {}",
            script.display()
        )));
    }

    let link = root.join("etc/runlevels").join(level).join(svc);
    if fs::symlink_metadata(&link).is_ok() {
        return Ok(false);
    }
    util::ensure_symlink(&format!("/etc/init.d/{svc}"), &link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_once_and_keeps_existing_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        util::write_text(&root.join("etc/init.d/sshd"), "#!/sbin/openrc-run\n").unwrap();

        assert!(enable_service(root, "default", "sshd").unwrap());
        assert!(!enable_service(root, "default", "sshd").unwrap());
        assert_eq!(
            fs::read_link(root.join("etc/runlevels/default/sshd")).unwrap(),
            Path::new("/etc/init.d/sshd")
        );
    }

    #[test]
    fn missing_init_script_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = enable_service(tmp.path(), "default", "crond").unwrap_err();
        assert!(err.to_string().contains("crond"), "{err}");
        assert!(enable_service(tmp.path(), "..", "crond").is_err());
    }

    #[test]
    fn default_groups_cover_all_runlevels() {
        let levels: Vec<_> = default_runlevels().into_keys().collect();
        assert_eq!(levels, ["boot", "default", "shutdown", "sysinit"]);
    }
}
