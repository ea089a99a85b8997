use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use alpine_image_builder::config::ConfigDoc;
use alpine_image_builder::executor::{ExecCtx, StdoutSink};
use alpine_image_builder::modules::customize::{IdentityTask, SshdTask, SymlinksTask};
use alpine_image_builder::modules::package::ArchiveTask;
use alpine_image_builder::modules::target::ResetTask;

fn doc_for(ws: &Path, root: &Path) -> ConfigDoc {
    let raw = format!(
        r#"
[workspace]
root_dir = "{ws}"
scratch_dir = "scratch"
out_dir = "out"

[build]
release = "3.2"
apk_tools = "2.6.5-r1"
install_dir = "{root}/"
mirror = "http://example/alpine"
image = "alpine-3"
name = "Alpine Linux"
description = "test image"

[package.steps.archive]
exclude_file = "exclude.txt"
"#,
        ws = ws.display(),
        root = root.display(),
    );
    ConfigDoc {
        path: PathBuf::from("<mem>"),
        value: toml::from_str(&raw).unwrap(),
    }
}

fn ctx() -> ExecCtx {
    let ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
    ctx.set_build_date("20240102");
    ctx
}

fn write(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

#[test]
fn reset_twice_leaves_an_empty_root() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    write(&root.join("etc/apk/world"), "alpine-base\n");
    let doc = doc_for(tmp.path(), &root);
    let mut ctx = ctx();

    ResetTask::exec(&doc, &mut ctx).unwrap();
    ResetTask::exec(&doc, &mut ctx).unwrap();
    assert!(root.is_dir());
    assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    assert!(alpine_image_builder::mounts::release(&root).unwrap().is_empty());
}

#[test]
fn file_edits_are_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    write(
        &root.join("etc/ssh/sshd_config"),
        "#PasswordAuthentication yes\nPasswordAuthentication yes\n#UsePrivilegeSeparation sandbox\n",
    );
    write(&root.join("sbin/init"), "stale copy");
    let doc = doc_for(tmp.path(), &root);
    let mut ctx = ctx();

    for _ in 0..2 {
        SshdTask::exec(&doc, &mut ctx).unwrap();
        SymlinksTask::exec(&doc, &mut ctx).unwrap();
        IdentityTask::exec(&doc, &mut ctx).unwrap();
    }

    assert_eq!(
        fs::read_to_string(root.join("etc/ssh/sshd_config")).unwrap(),
        "PasswordAuthentication no\nUsePrivilegeSeparation yes\n"
    );
    assert_eq!(
        fs::read_link(root.join("sbin/init")).unwrap(),
        PathBuf::from("../bin/busybox")
    );
    assert_eq!(
        fs::read_link(root.join("usr/bin/su")).unwrap(),
        PathBuf::from("../../bin/bbsuid")
    );
    let product = fs::read_to_string(root.join("etc/product")).unwrap();
    assert_eq!(product.matches("Image: ").count(), 1);
}

#[test]
fn packaged_image_carries_identity_and_skips_pseudo_filesystems() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    write(&root.join("bin/busybox"), "busybox");
    write(&root.join("proc/cpuinfo"), "host cpu");
    write(&root.join("var/cache/apk/APKINDEX.tar.gz"), "index");
    write(&root.join("root/.ash_history"), "secret");
    write(
        &root.join("lib/apk/db/installed"),
        "P:musl\nV:1.1.11-r2\n\nP:busybox\nV:1.23.2-r0\n",
    );
    write(&tmp.path().join("exclude.txt"), "# history\n./root/.ash_history\n");

    let doc = doc_for(tmp.path(), &root);
    let mut ctx = ctx();
    IdentityTask::exec(&doc, &mut ctx).unwrap();
    ArchiveTask::exec(&doc, &mut ctx).unwrap();
    ctx.publish_outputs().unwrap();

    let out = tmp.path().join("out");
    let artifact = out.join("alpine-3-20240102.tar.gz");
    assert!(artifact.is_file());
    let sidecar = fs::read_to_string(out.join("alpine-3-20240102.tar.gz.sha256")).unwrap();
    assert!(sidecar.ends_with("  alpine-3-20240102.tar.gz\n"));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("alpine-3-20240102.json")).unwrap())
            .unwrap();
    assert_eq!(report["installed_packages"], 2);
    assert_eq!(report["build_date"], "20240102");
    assert_eq!(report["sha256"].as_str().unwrap(), &sidecar[..64]);

    let extract = tmp.path().join("extract");
    fs::create_dir_all(&extract).unwrap();
    let status = Command::new("tar")
        .arg("-xzf")
        .arg(&artifact)
        .arg("-C")
        .arg(&extract)
        .status()
        .unwrap();
    assert!(status.success());

    let product = fs::read_to_string(extract.join("etc/product")).unwrap();
    assert!(product.contains("Image: Alpine Linux 20240102\n"), "{product}");
    assert!(product.contains("Description: test image\n"), "{product}");
    assert!(extract.join("bin/busybox").is_file());
    assert!(extract.join("proc").is_dir());
    assert!(!extract.join("proc/cpuinfo").exists());
    assert!(!extract.join("var/cache/apk/APKINDEX.tar.gz").exists());
    assert!(!extract.join("root/.ash_history").exists());
}

#[test]
fn packaging_replaces_an_existing_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    write(&root.join("etc/hostname"), "alpine\n");
    write(&tmp.path().join("exclude.txt"), "");
    write(&tmp.path().join("out/alpine-3-20240102.tar.gz"), "old bytes");

    let doc = doc_for(tmp.path(), &root);
    let mut ctx = ctx();
    ArchiveTask::exec(&doc, &mut ctx).unwrap();
    assert_eq!(
        fs::read(tmp.path().join("out/alpine-3-20240102.tar.gz")).unwrap(),
        b"old bytes"
    );
    ctx.publish_outputs().unwrap();

    let bytes = fs::read(tmp.path().join("out/alpine-3-20240102.tar.gz")).unwrap();
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
}

#[test]
fn failed_run_leaves_no_artifact_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    write(&root.join("etc/hostname"), "alpine\n");
    write(&tmp.path().join("exclude.txt"), "");

    let doc = doc_for(tmp.path(), &root);
    let mut ctx = ctx();
    ArchiveTask::exec(&doc, &mut ctx).unwrap();
    let out = tmp.path().join("out");
    assert!(!out.join("alpine-3-20240102.tar.gz").exists());
    assert!(!out.join("alpine-3-20240102.tar.gz.sha256").exists());

    // A later stage failed: the staged files are dropped.
    ctx.discard_outputs();
    assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
}
