// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! One invocation of a cab or nested recipe inside a recipe.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Deserialize;
use subst::{Namespace, Value};
use thiserror::Error;

use crate::cargo::Cargo;
use crate::logging::Logger;
use crate::recipe::{self, AssignBasedOn, Recipe};
use crate::schema::join_quote;
use crate::Context;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Name of the cab this step invokes, exclusive with `recipe`.
    pub cab: Option<String>,
    /// Nested recipe this step runs, exclusive with `cab`.
    pub recipe: Option<Box<Recipe>>,
    pub params: IndexMap<String, Value>,
    pub info: Option<String>,
    /// Skip unless explicitly enabled.
    pub skip: bool,
    /// Conditional skip, evaluated against the substitution namespace.
    #[serde(rename = "_skip")]
    pub skip_if: Option<String>,
    /// Break out of the containing loop when truthy after the step.
    #[serde(rename = "_break_on")]
    pub break_if: Option<String>,
    pub tags: BTreeSet<String>,
    /// Backend override: step > recipe > global default.
    pub backend: Option<String>,
    pub assign: IndexMap<String, Value>,
    pub assign_based_on: AssignBasedOn,

    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub fqname: String,
    #[serde(skip)]
    pub previous_step: Option<String>,
    #[serde(skip)]
    pub next_step: Option<String>,
    /// Bound at finalise.
    #[serde(skip)]
    pub cargo: Option<Cargo>,
    /// Bound at prevalidation.
    #[serde(skip)]
    pub validated_params: Option<IndexMap<String, Value>>,
    #[serde(skip)]
    ctx: Option<Context>,
}

impl Step {
    pub fn cab(name: impl Into<String>) -> Self {
        Self {
            cab: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn recipe(recipe: Recipe) -> Self {
        Self {
            recipe: Some(Box::new(recipe)),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: IndexMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn finalized(&self) -> bool {
        self.cargo.is_some()
    }

    fn cargo(&self) -> &Cargo {
        self.cargo.as_ref().expect("step is finalized")
    }

    fn ctx(&self) -> &Context {
        self.ctx.as_ref().expect("step is finalized")
    }

    pub fn log(&self) -> &Logger {
        self.cargo().spec().log()
    }

    pub fn update_parameter(&mut self, name: impl Into<String>, value: Value) {
        self.params.insert(name.into(), value);
    }

    /// Required parameters without a validated value.
    pub fn missing_params(&self) -> Vec<String> {
        let Some(cargo) = &self.cargo else {
            return vec![];
        };
        cargo
            .spec()
            .inputs_outputs()
            .filter(|(name, schema)| {
                schema.required
                    && self
                        .validated_params
                        .as_ref()
                        .map_or(true, |params| !params.contains_key(*name))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn invalid_params(&self) -> Vec<String> {
        self.validated_params
            .iter()
            .flatten()
            .filter(|(_, value)| value.is_invalid())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn unresolved_params(&self) -> Vec<String> {
        self.validated_params
            .iter()
            .flatten()
            .filter(|(_, value)| value.is_unresolved())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Bind the cargo: a fresh cab clone from the config, or the nested
    /// recipe. Idempotent.
    pub fn finalize(
        &mut self,
        ctx: &Context,
        log: Logger,
        fqname: &str,
        nesting: usize,
    ) -> Result<(), Error> {
        if self.finalized() {
            return Ok(());
        }
        if self.cab.is_some() == self.recipe.is_some() {
            return Err(Error::Validation(
                "step must specify either a cab or a nested recipe, but not both".into(),
            ));
        }

        self.fqname = fqname.to_owned();
        self.ctx = Some(ctx.clone());

        let mut cargo = if let Some(recipe) = self.recipe.take() {
            Cargo::Recipe(recipe)
        } else {
            let name = self.cab.as_deref().unwrap_or_default();
            let cab = ctx
                .config
                .cabs
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Validation(format!("unknown cab {name}")))?;
            Cargo::Cab(cab)
        };

        match &mut cargo {
            Cargo::Cab(cab) => {
                cab.spec.name = self.name.clone();

                // a recipe refreshes its own file sink with its own
                // substitutions; a cab's is named after the step
                let mut log = log;
                let mut info = Namespace::new();
                info.insert("fqname", fqname);
                let mut ns = Namespace::new();
                ns.add_ns_nosubst("config", ctx.config.namespace());
                ns.add_ns_nosubst("info", info);
                if let Err(error) = log.update_file_sink(&ctx.config.opts.log, &ns) {
                    log.warning(format!("could not update file log: {error}"));
                }

                cab.spec.bind(log, fqname, nesting);
            }
            Cargo::Recipe(recipe) => {
                if recipe.spec.name.is_empty() {
                    recipe.spec.name = self.name.clone();
                }
                recipe
                    .finalize(ctx, Some(log), Some(fqname), nesting)
                    .map_err(|error| Error::Recipe(Box::new(error)))?;
            }
        }
        self.cargo = Some(cargo);

        if self.backend.is_none() && !ctx.config.opts.backend.is_empty() {
            self.backend = Some(ctx.config.opts.backend.clone());
        }

        Ok(())
    }

    /// Delegate prevalidation to the cargo and record the result. Fails
    /// on typed-invalid values even before substitutions resolve.
    pub fn prevalidate(
        &mut self,
        subst: Option<&Namespace>,
    ) -> Result<IndexMap<String, Value>, Error> {
        let ctx = self.ctx().clone();

        let params = match self.cargo.as_mut().expect("step is finalized") {
            Cargo::Cab(cab) => cab
                .spec
                .prevalidate(&self.params, subst, ctx.types.as_ref())
                .map_err(Error::Schema)?,
            Cargo::Recipe(recipe) => recipe
                .prevalidate(self.params.clone(), subst)
                .map_err(|error| Error::Recipe(Box::new(error)))?,
        };
        self.validated_params = Some(params.clone());

        self.log().debug(format!(
            "{}: {} missing, {} invalid and {} unresolved parameters",
            self.name,
            self.missing_params().len(),
            self.invalid_params().len(),
            self.unresolved_params().len()
        ));

        let invalid = self.invalid_params();
        if !invalid.is_empty() {
            return Err(Error::Validation(format!(
                "{} has the following invalid parameters: {}",
                self.name,
                join_quote(invalid)
            )));
        }

        Ok(params)
    }

    /// Parameter summary lines; unset parameters show as `???`.
    pub fn summary(&self, ignore_missing: bool) -> Vec<String> {
        let Some(cargo) = &self.cargo else {
            return vec![];
        };
        let params = self.validated_params.as_ref().unwrap_or(&self.params);

        let mut lines: Vec<String> = params
            .iter()
            .map(|(name, value)| format!("  {name} = {value}"))
            .collect();
        if !ignore_missing {
            for (name, _) in cargo.spec().inputs_outputs() {
                if !params.contains_key(name) {
                    lines.push(format!("  {name} = ???"));
                }
            }
        }
        lines
    }

    pub fn log_summary(&self, level: log::Level, title: &str, ignore_missing: bool) {
        let log = self.log();
        if !log.enabled(level) {
            return;
        }
        log.log(level, format!("### {title}"));
        for line in self.summary(ignore_missing) {
            log.log(level, line);
        }
    }

    /// Run the step: validate inputs (loosely when skipped), dispatch the
    /// cargo, validate outputs, and feed the results back into the
    /// enclosing namespace.
    pub fn run(
        &mut self,
        mut subst: Option<&mut Namespace>,
        skip_now: bool,
    ) -> Result<IndexMap<String, Value>, Error> {
        let ctx = self.ctx().clone();

        if self.validated_params.is_none() {
            self.prevalidate(subst.as_deref())?;
        }

        // prevalidation filled defaults; explicit step params win
        let mut params = self.validated_params.clone().expect("prevalidated");
        for (name, value) in &self.params {
            params.insert(name.clone(), value.clone());
        }

        let mut skip_warned = false;

        self.log().debug("validating inputs");
        let result = match self.cargo.as_mut().expect("step is finalized") {
            Cargo::Cab(cab) => cab
                .spec
                .validate_inputs(&params, subst.as_deref(), skip_now, ctx.types.as_ref())
                .map_err(Error::Schema),
            Cargo::Recipe(recipe) => recipe
                .validate_inputs(&params, subst.as_deref(), skip_now)
                .map_err(|error| Error::Recipe(Box::new(error))),
        };

        let mut inputs_valid = false;
        match result {
            Ok(validated) => {
                params = validated;
                inputs_valid = true;
            }
            Err(error) => {
                let level = if skip_now {
                    log::Level::Warn
                } else {
                    log::Level::Error
                };
                self.log().log(level, format!("error validating inputs: {error}"));
                self.log_summary(level, "summary of inputs follows", false);
                if skip_now {
                    self.log()
                        .warning("since the step is being skipped, this is not fatal");
                    skip_warned = true;
                } else {
                    return Err(error);
                }
            }
        }

        if let Some(validated) = self.validated_params.as_mut() {
            validated.extend(params.clone());
        }

        if inputs_valid && !skip_now {
            self.log_summary(log::Level::Info, "validated inputs", true);
            if let Some(ns) = subst.as_deref_mut() {
                ns.add_ns("current", Namespace::from_values(&params));
            }
        }

        // inputs that failed to validate or resolve are fatal unless skipped
        let mut problems = self.invalid_params();
        problems.extend(self.unresolved_params());
        if !problems.is_empty() {
            if skip_now {
                self.log()
                    .warning(format!("invalid inputs: {}", join_quote(&problems)));
                if !skip_warned {
                    self.log()
                        .warning("since the step was skipped, this is not fatal");
                }
            } else {
                return Err(Error::Validation(format!(
                    "invalid inputs: {}",
                    join_quote(problems)
                )));
            }
        }

        if !skip_now {
            let dispatched = match self.cargo.as_mut().expect("step is finalized") {
                Cargo::Recipe(recipe) => {
                    if recipe.spec.backend.is_none() {
                        recipe.spec.backend = self.backend.clone();
                    }
                    recipe
                        .run_internal(params.clone())
                        .map(Some)
                        .map_err(|error| Error::Recipe(Box::new(error)))
                }
                Cargo::Cab(cab) => {
                    if cab.spec.backend.is_none() {
                        cab.spec.backend = self.backend.clone();
                    }
                    ctx.runner
                        .run(cab, &params, cab.spec.log(), subst.as_deref())
                        .map(|_| None)
                        .map_err(Error::Runner)
                }
            };

            match dispatched {
                Ok(Some(outputs)) => {
                    for (name, value) in outputs {
                        params.insert(name, value);
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    self.log().error(format!("error running step: {error}"));
                    return Err(error);
                }
            }
        }

        self.log().debug("validating outputs");
        let result = {
            let spec = self.cargo().spec();
            spec.validate_outputs(&params, subst.as_deref(), skip_now, ctx.types.as_ref())
                .map_err(Error::Schema)
        };

        match result {
            Ok(validated) => {
                params = validated;
                if let Some(own) = self.validated_params.as_mut() {
                    own.extend(params.clone());
                }
                if let Some(ns) = subst.as_deref_mut() {
                    match ns.ns_mut("current") {
                        Some(current) => current.merge_values(&params),
                        None => ns.add_ns("current", Namespace::from_values(&params)),
                    }
                }
                self.log_summary(log::Level::Debug, "validated outputs", true);
            }
            Err(error) => {
                let level = if skip_now {
                    log::Level::Warn
                } else {
                    log::Level::Error
                };
                self.log().log(level, format!("error validating outputs: {error}"));
                if skip_now {
                    self.log()
                        .warning("since the step was skipped, this is not fatal");
                } else {
                    self.log_summary(level, "failed outputs", false);
                    return Err(error);
                }
            }
        }

        // re-check the output side only
        let invalid: Vec<String> = self
            .invalid_params()
            .into_iter()
            .chain(self.unresolved_params())
            .filter(|name| self.cargo().spec().outputs.contains_key(name))
            .collect();
        if !invalid.is_empty() {
            if skip_now {
                self.log()
                    .warning(format!("invalid outputs: {}", join_quote(&invalid)));
                self.log()
                    .warning("since the step was skipped, this is not fatal");
            } else {
                return Err(Error::Validation(format!(
                    "invalid outputs: {}",
                    join_quote(invalid)
                )));
            }
        }

        Ok(params)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Schema(#[from] crate::schema::Error),
    #[error("nested recipe failed")]
    Recipe(#[source] Box<recipe::Error>),
    #[error(transparent)]
    Runner(#[from] crate::runner::Error),
}
