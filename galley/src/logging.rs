// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Hierarchical logging handles.
//!
//! Every recipe, step and cab logs through a [`Logger`] whose target is
//! its fully-qualified name, so interleaved output from nested and
//! scattered execution stays attributable. Console handling belongs to
//! whatever `log` backend the host installs; the engine only adds an
//! optional append-only file sink whose location is resolved through the
//! substitution namespace.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use fs_err as fs;
use subst::{Namespace, Resolved};
use thiserror::Error;

use crate::config::LogOpts;

#[derive(Debug, Clone)]
pub struct Logger {
    target: String,
    nesting: usize,
    sink: Arc<Mutex<Option<fs::File>>>,
}

impl Logger {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            nesting: 0,
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Child logger named `{target}.{name}`. The file sink is shared
    /// until [`Logger::update_file_sink`] points the child elsewhere.
    pub fn child(&self, name: &str) -> Logger {
        Logger {
            target: format!("{}.{name}", self.target),
            nesting: self.nesting + 1,
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn nesting(&self) -> usize {
        self.nesting
    }

    pub fn enabled(&self, level: log::Level) -> bool {
        level <= log::max_level()
    }

    pub fn log(&self, level: log::Level, message: impl fmt::Display) {
        let message = message.to_string();
        log::log!(target: &self.target, level, "{message}");

        if let Ok(mut sink) = self.sink.lock() {
            if let Some(file) = sink.as_mut() {
                let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                let _ = writeln!(file, "{stamp} {level:<5} {}: {message}", self.target);
            }
        }
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(log::Level::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(log::Level::Info, message);
    }

    pub fn warning(&self, message: impl fmt::Display) {
        self.log(log::Level::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(log::Level::Error, message);
    }

    /// Point the file sink at the location named by `opts`, resolving the
    /// filename template through the namespace. An unresolved template
    /// leaves the sink unchanged; no template disables the sink.
    pub fn update_file_sink(&mut self, opts: &LogOpts, ns: &Namespace) -> Result<(), Error> {
        let Some(template) = &opts.name else {
            self.sink = Arc::new(Mutex::new(None));
            return Ok(());
        };

        let name = match subst::resolve(template, ns)? {
            Resolved::Value(value) => value.to_string(),
            Resolved::Unresolved(_) => return Ok(()),
        };

        fs::create_dir_all(&opts.dir)?;
        let path = opts.dir.join(name);
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;

        self.sink = Arc::new(Mutex::new(Some(file)));
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("log filename substitution")]
    Subst(#[from] subst::Error),
    #[error("open log file")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn child_targets_are_dotted() {
        let log = Logger::new("demo");
        let child = log.child("step1");
        assert_eq!(child.target(), "demo.step1");
        assert_eq!(child.nesting(), 1);
    }

    #[test]
    fn file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let opts = LogOpts {
            dir: dir.path().into(),
            name: Some("{info.fqname}.log".into()),
        };

        let mut info = Namespace::new();
        info.insert("fqname", "demo.step1");
        let mut ns = Namespace::new();
        ns.add_ns_nosubst("info", info);

        let mut log = Logger::new("demo.step1");
        log.update_file_sink(&opts, &ns).unwrap();
        log.info("hello there");

        let written = std::fs::read_to_string(dir.path().join("demo.step1.log")).unwrap();
        assert!(written.contains("hello there"));
        assert!(written.contains("demo.step1"));
    }

    #[test]
    fn unresolved_template_leaves_sink_alone() {
        let opts = LogOpts {
            dir: ".".into(),
            name: Some("{info.missing}.log".into()),
        };
        let mut log = Logger::new("demo");
        log.update_file_sink(&opts, &Namespace::new()).unwrap();
    }
}
