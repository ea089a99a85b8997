use std::collections::BTreeMap;
use std::fs;

use alpine_image_builder_macros::Task;
use regex::Regex;
use serde::Deserialize;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::{default_true, util};

fn default_options() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PasswordAuthentication".to_string(), "no".to_string()),
        ("UsePrivilegeSeparation".to_string(), "yes".to_string()),
    ])
}

#[Task(
    id = "customize.sshd",
    module = "customize",
    phase = "customize",
    provides = ["customize:sshd"],
    after = ["customize:upgrade"],
    default_label = "Harden sshd_config",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshdTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    #[serde(default = "default_options")]
    pub options: BTreeMap<String, String>,
}

impl Default for SshdTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            options: default_options(),
        }
    }
}

impl SshdTask {
    pub fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = BuildConfig::load(doc)?;
        let path = util::target_path(build.root(), "/etc/ssh/sshd_config")?;
        let source = util::resolve_in_root(build.root(), "/etc/ssh/sshd_config")?;
        if ctx.dry_run {
            for (k, v) in &cfg.options {
                ctx.log(&format!("DRY-RUN: set {k} {v} in {}", path.display()));
            }
            return Ok(());
        }
        let current = fs::read_to_string(&source).map_err(|e| {
            Error::precondition(format!(
                "cannot read {} (is openssh installed?): {e}",
                source.display()
            ))
        })?;

        let mut updated = current.clone();
        for (key, value) in &cfg.options {
            updated = set_option(&updated, key, value)?;
        }
        if updated == current {
            ctx.log("sshd_config already up to date");
            return Ok(());
        }
        util::replace_file_text(&path, &updated)?;
        ctx.log(&format!("updated {}", path.display()));
        Ok(())
    }
}

/// Set `key value` in an sshd_config body. Every active or commented line for
/// `key` collapses into one active line in the global section: at the first
/// occurrence above the first `Match` block, otherwise just before that block
/// (or at the end when there is none). Lines for `key` inside `Match` blocks
/// are dropped so no block can override the global value.
pub fn set_option(content: &str, key: &str, value: &str) -> Result<String> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(Error::config(format!("invalid sshd option name '{key}'")));
    }
    let matcher = Regex::new(&format!(r"(?i)^\s*#?\s*{}(\s|$)", regex::escape(key)))
        .map_err(|e| Error::msg(format!("sshd option matcher for '{key}': {e}")))?;
    let match_block = Regex::new(r"(?i)^\s*Match(\s|$)")
        .map_err(|e| Error::msg(format!("sshd Match matcher: {e}")))?;
    let wanted = format!("{key} {}", value.trim());

    let mut out = String::with_capacity(content.len() + wanted.len() + 1);
    let mut placed = false;
    let mut in_match = false;
    for line in content.lines() {
        if !in_match && match_block.is_match(line) {
            in_match = true;
            if !placed {
                out.push_str(&wanted);
                out.push('\n');
                placed = true;
            }
        }
        if matcher.is_match(line) {
            if !placed {
                out.push_str(&wanted);
                out.push('\n');
                placed = true;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !placed {
        out.push_str(&wanted);
        out.push('\n');
    }
    Ok(out)
}
