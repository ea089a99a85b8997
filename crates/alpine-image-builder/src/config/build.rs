use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

/// Used when `[build].docs` is not given.
pub const DEFAULT_DOCS_URL: &str = "https://wiki.alpinelinux.org";

fn default_arch() -> String {
    "x86_64".into()
}

/// The `[build]` table as written by the user (or synthesized from flags).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBuildConfig {
    release: Option<String>,
    apk_tools: Option<String>,
    install_dir: Option<String>,
    mirror: Option<String>,
    image: Option<String>,
    name: Option<String>,
    description: Option<String>,
    docs: Option<String>,
    arch: Option<String>,
}

/// Validated build inputs. Construction fails before anything on disk is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub release: String,
    pub apk_tools: String,
    pub install_dir: PathBuf,
    pub mirror: String,
    pub image: String,
    pub name: String,
    pub description: String,
    pub docs: String,
    pub arch: String,
}

fn required(field: &str, flag: &str, v: Option<String>) -> Result<String> {
    match v.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(Error::config(format!(
            "missing required build setting '{field}' (flag {flag} or [build].{field})"
        ))),
    }
}

fn optional(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Strip trailing separators so `/data/alpine/` and `/data/alpine` name the
/// same target. `/` itself is kept as-is (and later rejected).
pub fn normalize_dir(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() && trimmed.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::from(stripped)
    }
}

impl BuildConfig {
    /// Read `[build]` and validate it. Only reads the filesystem to check
    /// that the install directory exists.
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        let raw: RawBuildConfig = doc.deserialize_path("build")?.unwrap_or_default();

        let release = required("release", "-r", raw.release)?;
        let apk_tools = required("apk_tools", "-a", raw.apk_tools)?;
        let install_dir = required("install_dir", "-d", raw.install_dir)?;
        let mirror = required("mirror", "-m", raw.mirror)?;
        let image = required("image", "-i", raw.image)?;
        let name = required("name", "-n", raw.name)?;

        let cfg = Self {
            release,
            apk_tools,
            install_dir: normalize_dir(&install_dir),
            mirror: mirror.trim_end_matches('/').to_string(),
            image,
            name,
            description: optional(raw.description).unwrap_or_default(),
            docs: optional(raw.docs).unwrap_or_else(|| DEFAULT_DOCS_URL.to_string()),
            arch: optional(raw.arch).unwrap_or_else(default_arch),
        };
        cfg.check_values()?;
        Ok(cfg)
    }

    fn check_values(&self) -> Result<()> {
        if self.install_dir == Path::new("/") {
            return Err(Error::config("install_dir must not be '/'"));
        }
        if !self.install_dir.is_absolute() {
            return Err(Error::config(format!(
                "install_dir must be an absolute path, got '{}'",
                self.install_dir.display()
            )));
        }
        if !self.mirror.contains("://") {
            return Err(Error::config(format!(
                "mirror '{}' is not a URL",
                self.mirror
            )));
        }
        if self.image.contains('/') {
            return Err(Error::config(format!(
                "image name '{}' must not contain '/'",
                self.image
            )));
        }
        if !self.install_dir.is_dir() {
            return Err(Error::precondition(format!(
                "install directory {} does not exist",
                self.install_dir.display()
            )));
        }
        Ok(())
    }

    /// Target root of the image being built.
    pub fn root(&self) -> &Path {
        &self.install_dir
    }

    /// `<mirror>/v<release>`
    pub fn release_url(&self) -> String {
        format!("{}/v{}", self.mirror, self.release)
    }

    pub fn repository_url(&self, channel: &str) -> String {
        format!("{}/{}", self.release_url(), channel)
    }

    pub fn bootstrap_file_name(&self) -> String {
        format!("apk-tools-static-{}.apk", self.apk_tools)
    }

    pub fn bootstrap_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.repository_url("main"),
            self.arch,
            self.bootstrap_file_name()
        )
    }

    /// `<image>-<date>.tar.gz`
    pub fn artifact_name(&self, build_date: &str) -> String {
        format!("{}-{}.tar.gz", self.image, build_date)
    }
}
