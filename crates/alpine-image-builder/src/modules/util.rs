use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// Map an absolute in-image path (`/etc/motd`) onto the target root.
pub fn target_path(root: &Path, image_abs_path: &str) -> Result<PathBuf> {
    let abs = image_abs_path.trim();
    let Some(rel) = abs.strip_prefix('/') else {
        return Err(Error::config(format!(
            "expected absolute image path, got '{image_abs_path}'"
        )));
    };
    let rel = Path::new(rel);
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::config(format!(
            "image path '{image_abs_path}' contains '..'"
        )));
    }
    Ok(root.join(rel))
}

const MAX_LINK_HOPS: usize = 40;

/// Like [`target_path`], but symlinks along the way are followed as the
/// image would see them: absolute targets restart at `root` and `..` never
/// climbs above it.
pub fn resolve_in_root(root: &Path, image_abs_path: &str) -> Result<PathBuf> {
    let start = target_path(root, image_abs_path)?;
    let mut pending: Vec<OsString> = start
        .strip_prefix(root)
        .unwrap_or(&start)
        .components()
        .rev()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;
    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        if part == "." {
            continue;
        }
        let candidate = resolved.join(&part);
        let Ok(link) = fs::read_link(root.join(&candidate)) else {
            resolved = candidate;
            continue;
        };
        hops += 1;
        if hops > MAX_LINK_HOPS {
            return Err(Error::precondition(format!(
                "too many symlinks resolving {image_abs_path} under {}",
                root.display()
            )));
        }
        if link.has_root() {
            resolved = PathBuf::new();
        }
        for c in link.components().rev() {
            match c {
                Component::Normal(s) => pending.push(s.to_os_string()),
                Component::ParentDir => pending.push("..".into()),
                _ => {}
            }
        }
    }
    Ok(root.join(resolved))
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

/// Write `s` to `p` as a regular file. A symlink at `p` is replaced rather
/// than followed, so an absolute link in the image never reaches the host.
pub fn replace_file_text(p: &Path, s: &str) -> Result<()> {
    if fs::symlink_metadata(p).is_ok_and(|m| m.file_type().is_symlink()) {
        remove_path_if_exists(p)?;
    }
    write_text(p, s)
}

/// Overwrite a file in the target unless this is a dry run.
pub fn write_target_file(ctx: &ExecCtx, p: &Path, s: &str) -> Result<()> {
    if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: write {} ({} bytes)", p.display(), s.len()));
        return Ok(());
    }
    replace_file_text(p, s)?;
    ctx.log(&format!("wrote {}", p.display()));
    Ok(())
}

pub fn remove_path_if_exists(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_dir() => fs::remove_dir_all(path).map_err(|e| {
            Error::msg(format!(
                "failed to remove directory {}: {e}",
                path.display()
            ))
        }),
        Ok(_) => fs::remove_file(path)
            .map_err(|e| Error::msg(format!("failed to remove file {}: {e}", path.display()))),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!(
            "failed to inspect {}: {e}",
            path.display()
        ))),
    }
}

/// Point `link_path` at `target`, replacing whatever is there. Returns false
/// when the link was already correct.
#[cfg(unix)]
pub fn ensure_symlink(target: &str, link_path: &Path) -> Result<bool> {
    use std::os::unix::fs as unix_fs;

    if let Some(parent) = link_path.parent() {
        ensure_dir(parent)?;
    }
    if let Ok(existing) = fs::read_link(link_path) {
        if existing == Path::new(target) {
            return Ok(false);
        }
        remove_path_if_exists(link_path)?;
    } else if fs::symlink_metadata(link_path).is_ok() {
        remove_path_if_exists(link_path)?;
    }

    unix_fs::symlink(target, link_path).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {target}: {e}",
            link_path.display()
        ))
    })?;
    Ok(true)
}

#[cfg(not(unix))]
pub fn ensure_symlink(_target: &str, _link_path: &Path) -> Result<bool> {
    Err(Error::msg("symlink creation is only supported on unix"))
}

/// GET `url` into `dest`. The body goes to a temp file next to `dest` and is
/// only renamed into place once complete.
pub fn download(url: &str, dest: &Path, timeout: Duration) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(url)
        .send()
        .map_err(|e| Error::transport(format!("GET {url} failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::transport(format!(
            "GET {url} failed with status {}",
            res.status()
        )));
    }

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::msg(format!("failed to create temp file in {}: {e}", parent.display())))?;
    res.copy_to(&mut tmp)
        .map_err(|e| Error::transport(format!("GET {url} failed while reading body: {e}")))?;
    tmp.persist(dest).map_err(|e| {
        Error::msg(format!("failed to move download to {}: {}", dest.display(), e.error))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_paths_stay_inside_root() {
        let root = Path::new("/data/alpine");
        assert_eq!(
            target_path(root, "/etc/resolv.conf").unwrap(),
            PathBuf::from("/data/alpine/etc/resolv.conf")
        );
        assert!(target_path(root, "etc/motd").is_err());
        assert!(target_path(root, "/etc/../../host").is_err());
    }

    #[test]
    fn symlink_replaces_files_and_stale_links() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let link = tmp.path().join("sbin/init");
        write_text(&link, "not a link").unwrap();

        assert!(ensure_symlink("../bin/busybox", &link).unwrap());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../bin/busybox"));
        assert!(!ensure_symlink("../bin/busybox", &link).unwrap());
        assert!(ensure_symlink("../bin/other", &link).unwrap());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../bin/other"));
    }

    #[test]
    fn remove_is_quiet_for_missing_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        remove_path_if_exists(&tmp.path().join("missing")).unwrap();
        let dir = tmp.path().join("d/e");
        ensure_dir(&dir).unwrap();
        remove_path_if_exists(&tmp.path().join("d")).unwrap();
        assert!(!tmp.path().join("d").exists());
    }

    #[cfg(unix)]
    #[test]
    fn target_writes_replace_links_instead_of_following_them() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let host = tmp.path().join("host-motd");
        write_text(&host, "host banner\n").unwrap();
        let root = tmp.path().join("root");
        let motd = root.join("etc/motd");
        ensure_dir(motd.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(&host, &motd).unwrap();

        let ctx = ExecCtx::new(false, std::sync::Arc::new(crate::executor::StdoutSink::default()));
        write_target_file(&ctx, &motd, "image banner\n").unwrap();

        assert_eq!(fs::read_to_string(&host).unwrap(), "host banner\n");
        assert!(!fs::symlink_metadata(&motd).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&motd).unwrap(), "image banner\n");
    }

    #[cfg(unix)]
    #[test]
    fn links_resolve_against_the_image_root() {
        use std::os::unix::fs::symlink;

        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write_text(&root.join("usr/share/zoneinfo/Etc/UTC"), "TZif").unwrap();
        symlink("/usr/share/zoneinfo/Etc/UTC", root.join("usr/share/zoneinfo/UTC")).unwrap();
        symlink("../../../../../../Etc/UTC", root.join("usr/share/zoneinfo/Zulu")).unwrap();
        symlink("Loop", root.join("usr/share/zoneinfo/Loop")).unwrap();

        assert_eq!(
            resolve_in_root(root, "/usr/share/zoneinfo/UTC").unwrap(),
            root.join("usr/share/zoneinfo/Etc/UTC")
        );
        assert_eq!(
            resolve_in_root(root, "/usr/share/zoneinfo/Zulu").unwrap(),
            root.join("Etc/UTC")
        );
        assert_eq!(
            resolve_in_root(root, "/etc/missing").unwrap(),
            root.join("etc/missing")
        );
        let err = resolve_in_root(root, "/usr/share/zoneinfo/Loop").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);
    }
}
