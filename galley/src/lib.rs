// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Declarative recipe execution.
//!
//! A [`Recipe`] is a named, typed computation graph of ordered [`Step`]s;
//! each step invokes an external [`Cab`] through a pluggable
//! [`CabRunner`] or a nested recipe. The engine validates and resolves
//! parameters (including recipe-to-step aliases), iterates for-loops
//! serially or in a scattered worker pool, and supervises external
//! processes through the `supervise` crate.

pub use self::cargo::{Cab, Cargo, Policies, Spec};
pub use self::config::Config;
pub use self::logging::Logger;
pub use self::recipe::Recipe;
pub use self::runner::{CabRunner, ProcessRunner};
pub use self::schema::{DType, FsTypes, Schema, TypeRegistry};
pub use self::step::Step;
pub use subst::{Namespace, Unresolved, Value};

pub mod cargo;
pub mod config;
pub mod logging;
pub mod recipe;
pub mod runner;
pub mod schema;
pub mod step;

use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;

/// Shared execution context: the config tree, the cab runner backend and
/// the parameter type registry. Cheap to clone; passed explicitly instead
/// of living in module state.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub runner: Arc<dyn CabRunner>,
    pub types: Arc<dyn TypeRegistry>,
    root_ns: Arc<OnceLock<Namespace>>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            runner: Arc::new(ProcessRunner::default()),
            types: Arc::new(FsTypes),
            root_ns: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CabRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_types(mut self, types: Arc<dyn TypeRegistry>) -> Self {
        self.types = types;
        self
    }

    /// The root recipe namespace binds exactly once per execution and is
    /// read-only afterwards.
    pub(crate) fn set_root_ns(&self, ns: Namespace) {
        let _ = self.root_ns.set(ns);
    }

    pub(crate) fn root_ns(&self) -> Option<&Namespace> {
        self.root_ns.get()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Run a recipe to completion: wrap it in a step, finalise, prevalidate,
/// execute, and return the output subset of the parameters.
pub fn run(
    recipe: Recipe,
    params: IndexMap<String, Value>,
    ctx: &Context,
) -> Result<IndexMap<String, Value>, step::Error> {
    let name = if recipe.spec.name.is_empty() {
        "recipe".to_owned()
    } else {
        recipe.spec.name.clone()
    };

    let mut step = Step::recipe(recipe).with_params(params);
    step.name = name.clone();
    step.finalize(ctx, Logger::new(&name), &name, 0)?;
    step.prevalidate(None)?;
    step.run(None, false)
}
