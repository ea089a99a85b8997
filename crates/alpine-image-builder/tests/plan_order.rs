use std::path::PathBuf;

use alpine_image_builder::config::ConfigDoc;
use alpine_image_builder::error::ErrorKind;
use alpine_image_builder::modules::customize::PackagesTask;
use alpine_image_builder::modules::package::ArchiveTask;

fn doc(raw: &str) -> ConfigDoc {
    ConfigDoc {
        path: PathBuf::from("<mem>"),
        value: toml::from_str(raw).unwrap(),
    }
}

fn ordered_ids(raw: &str) -> Vec<String> {
    let plan = alpine_image_builder::modules::build_plan(&doc(raw)).unwrap();
    plan.ordered()
        .unwrap()
        .iter()
        .map(|t| t.id.clone())
        .collect()
}

#[test]
fn stages_run_in_pipeline_order() {
    assert_eq!(
        ordered_ids(""),
        [
            "core.init",
            "target.reset",
            "bootstrap.fetch",
            "bootstrap.keys",
            "bootstrap.base",
            "network.resolv",
            "network.repositories",
            "mounts.acquire",
            "customize.timezone",
            "customize.packages",
            "customize.prune",
            "customize.upgrade",
            "customize.sshd",
            "customize.services",
            "customize.symlinks",
            "customize.identity",
            "core.barrier.customize",
            "package.archive",
            "mounts.release",
        ]
    );
}

#[test]
fn guest_tooling_runs_between_customize_and_package() {
    let ids = ordered_ids("[guest]\ninstaller = \"/opt/guest/install.sh\"\n");
    let pos = |id: &str| ids.iter().position(|t| t == id).unwrap();
    assert!(pos("core.barrier.customize") < pos("guest.install"));
    assert!(pos("guest.install") < pos("package.archive"));
}

#[test]
fn chroot_stages_declare_their_preconditions() {
    let plan = alpine_image_builder::modules::build_plan(&doc("")).unwrap();
    for id in [
        "customize.timezone",
        "customize.packages",
        "customize.prune",
        "customize.upgrade",
    ] {
        let task = plan.get(id).unwrap();
        assert_eq!(task.requires, ["mounts:active", "root:privileged"], "{id}");
    }
    assert!(plan.get("customize.identity").unwrap().requires.is_empty());

    assert_eq!(
        plan.get(PackagesTask::ID).unwrap().requires,
        PackagesTask::REQUIRES
    );
    assert_eq!(
        plan.get(ArchiveTask::ID).unwrap().requires,
        ArchiveTask::REQUIRES
    );
}

#[test]
fn required_stages_cannot_be_disabled() {
    let err = alpine_image_builder::modules::build_plan(&doc(
        "[customize.steps.sshd]\nenabled = false\n",
    ))
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("customize.steps.sshd"), "{err}");

    let err = alpine_image_builder::modules::build_plan(&doc("[mounts]\nenabled = false\n"))
        .unwrap_err();
    assert!(err.to_string().contains("mounts"), "{err}");
}

#[test]
fn stage_labels_come_from_config() {
    let plan = alpine_image_builder::modules::build_plan(&doc(
        "[package.steps.archive]\nlabel = \"Roll tarball\"\n",
    ))
    .unwrap();
    assert_eq!(plan.get("package.archive").unwrap().label, "Roll tarball");
}

#[test]
fn dot_output_names_every_edge() {
    let plan = alpine_image_builder::modules::build_plan(&doc("")).unwrap();
    let dot = plan.to_dot().unwrap();
    assert!(dot.contains("\"mounts.acquire\" -> \"customize.timezone\""));
    assert!(dot.contains("\"package.archive\" -> \"mounts.release\""));
}
