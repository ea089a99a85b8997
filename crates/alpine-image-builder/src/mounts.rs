//! proc/sys mounts under the target root.
//!
//! Teardown never trusts remembered state: it reads the live mount table and
//! unmounts whatever sits below the root, deepest first.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

const MOUNTINFO: &str = "/proc/self/mountinfo";

// Stacked mounts need one pass per layer.
const MAX_RELEASE_PASSES: usize = 8;

/// The proc and sys mounts of one target root. Dropping the set unmounts them.
#[derive(Debug)]
pub struct MountSet {
    root: PathBuf,
    dry_run: bool,
    released: bool,
}

impl MountSet {
    pub fn acquire(ctx: &ExecCtx, root: &Path) -> Result<Self> {
        let set = Self {
            root: root.to_path_buf(),
            dry_run: ctx.dry_run,
            released: false,
        };
        let proc_dir = root.join("proc");
        let sys_dir = root.join("sys");
        if !ctx.dry_run {
            for dir in [&proc_dir, &sys_dir] {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::msg(format!("failed to create {}: {e}", dir.display()))
                })?;
            }
        }
        let mounted = if ctx.dry_run {
            Vec::new()
        } else {
            active_mounts(root)?
        };

        let canon = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let is_mounted = |name: &str| mounted.contains(&canon.join(name));

        if !is_mounted("proc") {
            let mut cmd = Command::new("mount");
            cmd.args(["-t", "proc", "proc"]).arg(&proc_dir);
            ctx.run_cmd(cmd)?;
        }
        if !is_mounted("sys") {
            let mut cmd = Command::new("mount");
            cmd.args(["--bind", "/sys"]).arg(&sys_dir);
            // On failure `set` drops here and takes the proc mount with it.
            ctx.run_cmd(cmd)?;
        }
        Ok(set)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Forget the set without unmounting; another guard owns the mounts.
    pub(crate) fn disarm(mut self) {
        self.released = true;
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        if self.dry_run {
            return Ok(());
        }
        release(&self.root).map(|_| ())
    }
}

impl Drop for MountSet {
    fn drop(&mut self) {
        if self.released || self.dry_run {
            return;
        }
        self.released = true;
        if let Err(e) = release(&self.root) {
            tracing::warn!(root = %self.root.display(), error = %e, "failed to release mounts");
        }
    }
}

/// Unmount everything strictly below `root`. Returns the unmounted points in
/// order; an empty list when nothing was mounted.
pub fn release(root: &Path) -> Result<Vec<PathBuf>> {
    let mut done = Vec::new();
    for _ in 0..MAX_RELEASE_PASSES {
        let points = active_mounts(root)?;
        if points.is_empty() {
            return Ok(done);
        }
        for p in points {
            let status = Command::new("umount").arg(&p).status().map_err(|e| {
                Error::privileged(format!("failed to run umount {}: {e}", p.display()))
            })?;
            if !status.success() {
                return Err(Error::privileged(format!(
                    "umount {} failed: {status}",
                    p.display()
                )));
            }
            tracing::debug!(mount = %p.display(), "unmounted");
            done.push(p);
        }
    }
    let left = active_mounts(root)?;
    if left.is_empty() {
        return Ok(done);
    }
    Err(Error::privileged(format!(
        "mounts remain under {}: {}",
        root.display(),
        left.iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Live mount points strictly below `root`, deepest first.
pub fn active_mounts(root: &Path) -> Result<Vec<PathBuf>> {
    let table = fs::read_to_string(MOUNTINFO)
        .map_err(|e| Error::msg(format!("failed to read {MOUNTINFO}: {e}")))?;
    // The table lists resolved paths.
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    Ok(mounts_under(&table, &root))
}

/// Parse a mountinfo table and return the mount points strictly below `root`,
/// deepest first, without duplicates.
pub fn mounts_under(table: &str, root: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|raw| PathBuf::from(unescape_mount_path(raw)))
        .filter(|p| p != root && p.starts_with(root))
        .collect();
    out.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    out.dedup();
    out
}

// The kernel writes space, tab, newline and backslash as `\ooo`.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let v = bytes[i + 1..=i + 3]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(b) = u8::try_from(v) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
22 1 0:21 / / rw,relatime shared:1 - ext4 /dev/root rw
36 22 0:5 / /data/alpine/proc rw,relatime - proc proc rw
37 22 0:20 / /data/alpine/sys rw,relatime - sysfs sysfs rw
38 37 0:6 / /data/alpine/sys/kernel/security rw - securityfs securityfs rw
39 22 0:5 / /data/alpine-other/proc rw - proc proc rw
40 22 0:5 / /data/with\\040space/proc rw - proc proc rw
";

    #[test]
    fn lists_only_mounts_below_root_deepest_first() {
        let got = mounts_under(TABLE, Path::new("/data/alpine"));
        assert_eq!(
            got,
            [
                PathBuf::from("/data/alpine/sys/kernel/security"),
                PathBuf::from("/data/alpine/proc"),
                PathBuf::from("/data/alpine/sys"),
            ]
        );
    }

    #[test]
    fn root_itself_is_not_a_child_mount() {
        assert!(mounts_under(TABLE, Path::new("/")).len() >= 5);
        let t = "50 22 0:30 / /data/alpine rw - tmpfs tmpfs rw\n";
        assert!(mounts_under(t, Path::new("/data/alpine")).is_empty());
    }

    #[test]
    fn escaped_mount_points_are_decoded() {
        assert_eq!(
            mounts_under(TABLE, Path::new("/data/with space")),
            [PathBuf::from("/data/with space/proc")]
        );
        assert_eq!(unescape_mount_path("a\\134b"), "a\\b");
        assert_eq!(unescape_mount_path("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn release_without_mounts_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(release(tmp.path()).expect("release").is_empty());
        assert!(release(tmp.path()).expect("release twice").is_empty());
    }
}
