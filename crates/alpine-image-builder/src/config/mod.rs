//! Build definition loading.
//!
//! A build definition is a TOML document. A file may name a parent with
//! `extends = "base.toml"` and any table may pull in fragments with
//! `imports = ["a.toml", ...]`; everything is deep-merged, later values win.
//! Command line flags are merged last as an overlay.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;
use toml::value::Table;

use crate::error::{Error, Result};

pub mod build;

pub use build::{BuildConfig, DEFAULT_DOCS_URL};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn from_value(path: impl Into<PathBuf>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }

    /// An empty document, used when everything comes from flags.
    pub fn empty() -> Self {
        Self::from_value("<cli>", Value::Table(Table::new()))
    }

    /// Deep-merge `overlay` on top of this document.
    pub fn merge_overlay(&mut self, overlay: Value) {
        merge(&mut self.value, overlay);
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        v.clone()
            .try_into()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid config at '{path}': {e}")))
    }
}

/// Deep merge: tables merge key by key, any other value is replaced.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut seen = HashSet::<PathBuf>::new();
    let value = load_file(path, &mut seen)?;
    Ok(ConfigDoc::from_value(path, value))
}

fn relative_to(file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_file(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(key.clone()) {
        return Err(Error::config(format!(
            "config include cycle at {}",
            key.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&raw)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Table::new());
    if let Some(tbl) = value.as_table_mut()
        && let Some(parent) = tbl.remove("extends")
    {
        let Some(parent) = parent.as_str() else {
            return Err(Error::config(format!(
                "'extends' in {} must be a string",
                path.display()
            )));
        };
        out = load_file(&relative_to(path, parent), seen)?;
    }

    expand_imports(path, &mut value, seen)?;
    merge(&mut out, value);

    seen.remove(&key);
    Ok(out)
}

fn expand_imports(file: &Path, value: &mut Value, seen: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    if let Some(imports) = tbl.remove("imports") {
        let Some(list) = imports.as_array() else {
            return Err(Error::config(format!(
                "'imports' in {} must be an array of strings",
                file.display()
            )));
        };
        let mut acc = Value::Table(Table::new());
        for entry in list {
            let Some(rel) = entry.as_str().map(str::trim) else {
                return Err(Error::config(format!(
                    "invalid imports entry in {} (expected string)",
                    file.display()
                )));
            };
            if rel.is_empty() {
                continue;
            }
            merge(&mut acc, load_file(&relative_to(file, rel), seen)?);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        expand_imports(file, v, seen)?;
    }
    Ok(())
}
