use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

// Host PATH may not exist inside the image.
const TARGET_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// `chroot <root> <program> <args..>` with a clean environment.
pub fn chroot_command<I, S>(root: &Path, program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("chroot");
    cmd.arg(root)
        .arg(program)
        .args(args)
        .env_clear()
        .env("PATH", TARGET_PATH)
        .env("HOME", "/root")
        .env("LANG", "C");
    cmd
}

/// Run `program` with `root` as its filesystem root. The context must hold
/// the mount set for `root`.
pub fn run_in_root<I, S>(ctx: &ExecCtx, root: &Path, program: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if !ctx.mounts_active(root) {
        return Err(Error::precondition(format!(
            "refusing to chroot into {} without proc/sys mounted",
            root.display()
        )));
    }
    ctx.run_cmd(chroot_command(root, program, args))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::StdoutSink;

    #[test]
    fn command_targets_the_root() {
        let cmd = chroot_command(Path::new("/data/alpine"), "apk", ["add", "bash"]);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "chroot");
        assert_eq!(args, ["/data/alpine", "apk", "add", "bash"]);
    }

    #[test]
    fn refuses_without_mounts() {
        let ctx = ExecCtx::new(true, Arc::new(StdoutSink::default()));
        let err = run_in_root(&ctx, Path::new("/data/alpine"), "apk", ["update"]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);
    }
}
