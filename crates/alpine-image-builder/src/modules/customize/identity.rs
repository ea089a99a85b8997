use alpine_image_builder_macros::Task;
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::{default_true, util};

#[Task(
    id = "customize.identity",
    module = "customize",
    phase = "customize",
    provides = ["customize:identity"],
    after = ["customize:symlinks"],
    default_label = "Write motd and product",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for IdentityTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl IdentityTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let date = ctx.build_date();
        let root = build.root();
        util::write_target_file(
            ctx,
            &util::target_path(root, "/etc/motd")?,
            &render_motd(&build, &date),
        )?;
        util::write_target_file(
            ctx,
            &util::target_path(root, "/etc/product")?,
            &render_product(&build, &date),
        )
    }
}

pub fn render_motd(build: &BuildConfig, date: &str) -> String {
    let mut out = format!(
        "Welcome to {}!\n\nThis image was built on {date}.\nDocumentation: {}\n",
        build.name, build.docs
    );
    if !build.description.is_empty() {
        out.push('\n');
        out.push_str(&build.description);
        out.push('\n');
    }
    out.push('\n');
    out
}

pub fn render_product(build: &BuildConfig, date: &str) -> String {
    format!(
        "Name: {name}\nImage: {name} {date}\nDocumentation: {docs}\nDescription: {desc}\n",
        name = build.name,
        docs = build.docs,
        desc = build.description,
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn build() -> BuildConfig {
        BuildConfig {
            release: "3.2".into(),
            apk_tools: "2.6.5-r1".into(),
            install_dir: PathBuf::from("/data/alpine"),
            mirror: "http://example/alpine".into(),
            image: "alpine-3".into(),
            name: "Alpine Linux".into(),
            description: "test image".into(),
            docs: crate::config::DEFAULT_DOCS_URL.into(),
            arch: "x86_64".into(),
        }
    }

    #[test]
    fn product_lists_every_field() {
        assert_eq!(
            render_product(&build(), "20240102"),
            "Name: Alpine Linux\nImage: Alpine Linux 20240102\n\
             Documentation: https://wiki.alpinelinux.org\nDescription: test image\n"
        );
    }

    #[test]
    fn motd_mentions_name_date_and_description() {
        let motd = render_motd(&build(), "20240102");
        assert!(motd.starts_with("Welcome to Alpine Linux!"));
        assert!(motd.contains("20240102"));
        assert!(motd.contains("test image"));
    }
}
