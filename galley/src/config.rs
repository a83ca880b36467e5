// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The typed configuration tree consumed by the engine.
//!
//! Loading and layering of configuration documents is the config
//! provider's business; here we only define the tree, a plain YAML
//! loader and a `merge` for combining documents.

use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use subst::{Entry, Namespace};
use thiserror::Error;

use crate::cargo::Cab;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub opts: Opts,
    pub cabs: IndexMap<String, Cab>,
    /// Free sections, merged into the substitution namespace by name.
    #[serde(flatten)]
    pub vars: IndexMap<String, serde_yaml::Value>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let bytes = fs::read(path.as_ref())?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Combine two documents; `other` wins key by key.
    pub fn merge(self, other: Self) -> Self {
        let mut cabs = self.cabs;
        cabs.extend(other.cabs);

        let mut vars = self.vars;
        vars.extend(other.vars);

        let opts = if other.opts == Opts::default() {
            self.opts
        } else {
            other.opts
        };

        Self { opts, cabs, vars }
    }

    /// Namespace view over the whole tree, for `{config.…}` references.
    pub fn namespace(&self) -> Namespace {
        serde_yaml::to_value(self)
            .ok()
            .map(|value| match Entry::from_yaml(&value) {
                Entry::Ns { ns, .. } => ns,
                _ => Namespace::new(),
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Opts {
    /// Default cab execution backend, overridable per recipe and step.
    pub backend: String,
    pub log: LogOpts,
    pub dist: DistOpts,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogOpts {
    pub dir: PathBuf,
    /// File name template, `{…}`-substitutable. Unset disables file sinks.
    pub name: Option<String>,
}

impl Default for LogOpts {
    fn default() -> Self {
        Self {
            dir: ".".into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DistOpts {
    pub ncpu: Option<usize>,
}

impl DistOpts {
    /// Scatter pool bound: `ncpu` if set, else a quarter of the host
    /// cores, minimum one.
    pub fn worker_count(&self) -> usize {
        self.ncpu
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get() / 4)
                    .unwrap_or(1)
            })
            .max(1)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("read config")]
    Read(#[from] io::Error),
    #[error("decode config")]
    Decode(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode() {
        let config = Config::from_yaml(
            r#"
opts:
  backend: native
  dist: {ncpu: 2}
cabs:
  echo:
    command: echo
    inputs:
      msg: {dtype: str, required: true}
vars:
  telescope: meerkat
"#,
        )
        .unwrap();

        assert_eq!(config.opts.backend, "native");
        assert_eq!(config.opts.dist.worker_count(), 2);
        assert!(config.cabs.contains_key("echo"));
        assert!(config.vars.contains_key("vars"));
    }

    #[test]
    fn merge_overrides() {
        let base = Config::from_yaml("opts: {backend: native}\ncabs: {a: {command: a}}").unwrap();
        let extra = Config::from_yaml("cabs: {b: {command: b}}").unwrap();
        let merged = base.merge(extra);

        assert_eq!(merged.opts.backend, "native");
        assert!(merged.cabs.contains_key("a"));
        assert!(merged.cabs.contains_key("b"));
    }

    #[test]
    fn namespace_view() {
        let config = Config::from_yaml("opts: {backend: native}").unwrap();
        let ns = config.namespace();
        let (value, _) = ns.walk(&["opts", "backend"]).unwrap();
        assert_eq!(value.to_string(), "native");
    }
}
