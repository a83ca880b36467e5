// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipes: ordered steps with typed I/O, aliases and for-loop dispatch.
//!
//! A recipe binds its parameters to step endpoints through aliases.
//! Values flow down (recipe to step) and up (step to recipe) during a
//! bounded fixed-point pass at prevalidation; each alias slot transitions
//! unset → set at most once, so two passes suffice.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Deserialize;
use subst::{Entry, Namespace, Resolved, Unresolved, Value};
use thiserror::Error;

use crate::cargo::{Cargo, Spec};
use crate::logging::Logger;
use crate::schema::{join_quote, Schema};
use crate::step::{self, Step};
use crate::Context;

pub type Assignments = IndexMap<String, Value>;

/// `basevar -> lookup value -> assignments`, with a `DEFAULT` fallback row.
pub type AssignBasedOn = IndexMap<String, IndexMap<String, Assignments>>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForLoop {
    /// Iteration variable, assigned per iteration along with `var@index`.
    pub var: String,
    /// Name of an input carrying the iterable, or a literal value list.
    pub over: Option<ForLoopOver>,
    /// Run iterations in parallel, with no ordering guarantees.
    pub scatter: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ForLoopOver {
    Input(String),
    Values(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSide {
    Inputs,
    Outputs,
}

/// One endpoint of a recipe-level alias.
#[derive(Debug, Clone)]
pub struct AliasInfo {
    pub label: String,
    pub param: String,
    pub io: IoSide,
    /// The recipe-level value flows down into the step.
    pub from_recipe: bool,
    /// The step value flows up to the recipe.
    pub from_step: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Recipe {
    #[serde(flatten)]
    pub spec: Spec,
    pub steps: IndexMap<String, Step>,
    pub assign: Assignments,
    pub assign_based_on: AssignBasedOn,
    #[serde(deserialize_with = "aliases_map")]
    pub aliases: IndexMap<String, Vec<String>>,
    pub for_loop: Option<ForLoop>,

    #[serde(skip)]
    alias_map: IndexMap<(String, String), String>,
    #[serde(skip)]
    alias_list: IndexMap<String, Vec<AliasInfo>>,
    #[serde(skip)]
    implicit_params: BTreeSet<String>,
    #[serde(skip)]
    protected_from_assign: BTreeSet<String>,
    /// Dotted config paths written by `assign_based_on`; applied to every
    /// config namespace this recipe builds. Private per worker in scatter.
    #[serde(skip)]
    config_overrides: IndexMap<String, Value>,
    #[serde(skip)]
    for_loop_values: Option<Vec<Value>>,
    #[serde(skip)]
    ctx: Option<Context>,
    #[serde(skip)]
    finalized: bool,
}

/// Deserialize alias targets given as a single string or a list
fn aliases_map<'de, D>(deserializer: D) -> Result<IndexMap<String, Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Targets {
        Single(String),
        Sequence(Vec<String>),
    }

    let raw = IndexMap::<String, Targets>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, targets)| {
            let targets = match targets {
                Targets::Single(target) => vec![target],
                Targets::Sequence(targets) => targets,
            };
            (name, targets)
        })
        .collect())
}

impl Recipe {
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    fn ctx(&self) -> &Context {
        self.ctx.as_ref().expect("recipe is finalized")
    }

    pub fn aliases_for(&self, name: &str) -> Option<&[AliasInfo]> {
        self.alias_list.get(name).map(Vec::as_slice)
    }

    pub fn alias_for_endpoint(&self, label: &str, param: &str) -> Option<&str> {
        self.alias_map
            .get(&(label.to_owned(), param.to_owned()))
            .map(String::as_str)
    }

    pub fn protect_from_assignments(&mut self, keys: impl IntoIterator<Item = impl ToString>) {
        self.protected_from_assign
            .extend(keys.into_iter().map(|key| key.to_string()));
    }

    /// Add a step; the label is auto-generated as `{cab}_{n}` if not given.
    pub fn add_step(&mut self, mut step: Step, label: Option<String>) -> Result<String, Error> {
        if self.finalized {
            return Err(Error::Definition(
                "can't add a step to a recipe that's been finalized".into(),
            ));
        }

        let label = label.unwrap_or_else(|| {
            let cab = step.cab.clone().unwrap_or_else(|| "step".into());
            let count = self.steps.values().filter(|s| s.cab == step.cab).count();
            format!("{cab}_{}", count + 1)
        });

        step.name = label.clone();
        step.fqname = format!("{}.{label}", self.spec.name);
        self.steps.insert(label.clone(), step);

        Ok(label)
    }

    /// Convenience wrapper for [`Recipe::add_step`] with a cab invocation.
    pub fn add(
        &mut self,
        cab: impl Into<String>,
        label: Option<String>,
        params: IndexMap<String, Value>,
        info: Option<String>,
    ) -> Result<String, Error> {
        let mut step = Step::cab(cab).with_params(params);
        step.info = info;
        self.add_step(step, label)
    }

    pub fn enable_step(&mut self, label: &str, enable: bool) -> Result<(), Error> {
        let Some(step) = self.steps.get_mut(label) else {
            return Err(Error::Validation(format!("unknown step {label}")));
        };

        if let Some(log) = &self.spec.log {
            if step.skip && enable {
                log.warning(format!(
                    "enabling step '{label}' which was previously marked as skipped"
                ));
            } else if !step.skip && !enable {
                log.warning(format!("will skip step '{label}'"));
            }
        }
        step.skip = !enable;

        Ok(())
    }

    /// Skip everything except the named steps.
    pub fn restrict_steps(
        &mut self,
        restrict: impl IntoIterator<Item = impl ToString>,
        force_enable: bool,
    ) -> Result<(), Error> {
        let restrict: BTreeSet<String> = restrict.into_iter().map(|s| s.to_string()).collect();

        let unknown: Vec<&String> = restrict
            .iter()
            .filter(|label| !self.steps.contains_key(*label))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::Validation(format!(
                "unknown step(s) {}",
                join_quote(unknown)
            )));
        }

        for (label, step) in self.steps.iter_mut() {
            if !restrict.contains(label) {
                step.skip = true;
            } else if force_enable {
                step.skip = false;
            }
        }

        Ok(())
    }

    /// Freeze the topology: bind loggers, finalise steps, collect aliases
    /// and resolve the for-loop source. Idempotent.
    pub fn finalize(
        &mut self,
        ctx: &Context,
        log: Option<Logger>,
        fqname: Option<&str>,
        nesting: usize,
    ) -> Result<(), Error> {
        if self.finalized {
            return Ok(());
        }
        self.ctx = Some(ctx.clone());

        let fqname = fqname
            .map(str::to_owned)
            .or_else(|| (!self.spec.fqname.is_empty()).then(|| self.spec.fqname.clone()))
            .unwrap_or_else(|| self.spec.name.clone());
        let mut log = log.unwrap_or_else(|| Logger::new(&fqname));

        let overlapping = self.spec.overlapping();
        if !overlapping.is_empty() {
            return Err(Error::Definition(format!(
                "parameter(s) {} appear in both inputs and outputs",
                join_quote(overlapping)
            )));
        }

        for (name, targets) in &self.aliases {
            if self.spec.has_param(name) {
                return Err(Error::Validation(format!(
                    "alias '{name}' also appears under inputs or outputs"
                )));
            }
            if targets.is_empty() {
                return Err(Error::Validation(format!(
                    "alias '{name}': name or list of names expected"
                )));
            }
            for target in targets {
                if !target.contains('.') {
                    return Err(Error::Validation(format!(
                        "alias '{name}': invalid target '{target}' (missing dot)"
                    )));
                }
            }
        }

        if let Some(for_loop) = &self.for_loop {
            if self.spec.has_param(&for_loop.var) {
                return Err(Error::Validation(format!(
                    "'for_loop.var={}' clashes with recipe inputs or outputs",
                    for_loop.var
                )));
            }
        }

        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for label in &labels {
            let step = self.steps.get_mut(label).expect("step exists");
            step.name = label.clone();
        }

        // the file sink location may use config and our identity
        let mut info = Namespace::new();
        info.insert("fqname", fqname.clone());
        let mut ns = Namespace::new();
        ns.add_ns_nosubst("info", info);
        ns.add_ns_nosubst("config", ctx.config.namespace());
        if let Err(error) = log.update_file_sink(&ctx.config.opts.log, &ns) {
            log.warning(format!("could not update file log: {error}"));
        }

        self.spec.bind(log.clone(), &fqname, nesting);

        for label in &labels {
            let step_log = log.child(label);
            let step_fqname = format!("{fqname}.{label}");
            let step = self.steps.get_mut(label).expect("step exists");
            step.finalize(ctx, step_log, &step_fqname, nesting + 1)
                .map_err(|error| Error::Step {
                    label: label.clone(),
                    source: Box::new(error),
                })?;
        }

        self.collect_aliases()?;

        if let Some(for_loop) = &mut self.for_loop {
            match for_loop.over.take() {
                Some(ForLoopOver::Input(name)) => {
                    let Some(schema) = self.spec.inputs.get_mut(&name) else {
                        return Err(Error::Validation(format!(
                            "for_loop: over: '{name}' is not a defined input"
                        )));
                    };
                    schema.required = true;
                    for_loop.over = Some(ForLoopOver::Input(name));
                }
                Some(ForLoopOver::Values(values)) => {
                    self.for_loop_values = Some(values);
                    for_loop.over = None;
                }
                None => {
                    return Err(Error::Validation(
                        "for_loop: over must name an input or list the iteration values".into(),
                    ));
                }
            }
        }

        self.finalized = true;
        Ok(())
    }

    /// Collect aliases in three phases: schema `aliases` fields, the
    /// recipe `aliases` map, then auto-aliases `{label}_{param}` for step
    /// parameters with no value from any source.
    fn collect_aliases(&mut self) -> Result<(), Error> {
        self.alias_map.clear();
        self.alias_list.clear();
        self.implicit_params.clear();

        let mut declared: Vec<(String, String)> = vec![];
        for (name, schema) in self.spec.inputs_outputs() {
            if schema.aliases.is_empty() {
                continue;
            }
            if !schema.is_alias_handle() {
                return Err(Error::Validation(format!(
                    "alias '{name}' should not specify type, choices or writability"
                )));
            }
            for target in &schema.aliases {
                declared.push((name.clone(), target.clone()));
            }
        }
        for (name, target) in declared {
            self.add_alias(&name, &target)?;
        }

        let mapped: Vec<(String, String)> = self
            .aliases
            .iter()
            .flat_map(|(name, targets)| {
                targets.iter().map(move |target| (name.clone(), target.clone()))
            })
            .collect();
        for (name, target) in mapped {
            self.add_alias(&name, &target)?;
        }

        let mut auto: Vec<(String, String)> = vec![];
        for (label, step) in &self.steps {
            let Some(cargo) = &step.cargo else { continue };
            for (param, schema) in cargo.spec().inputs_outputs() {
                if self
                    .alias_map
                    .contains_key(&(label.clone(), param.clone()))
                {
                    continue;
                }
                if step.params.contains_key(param)
                    || cargo.spec().defaults.contains_key(param)
                    || schema.default.is_some()
                    || schema.implicit.is_some()
                {
                    continue;
                }
                let auto_name = format!("{label}_{param}");
                if self.spec.has_param(&auto_name) {
                    return Err(Error::Validation(format!(
                        "auto-generated parameter name '{auto_name}' conflicts with another name. \
                         Please define an explicit alias for this."
                    )));
                }
                auto.push((auto_name, format!("{label}.{param}")));
            }
        }
        for (name, target) in auto {
            self.add_alias(&name, &target)?;
        }

        Ok(())
    }

    fn add_alias(&mut self, name: &str, target: &str) -> Result<(), Error> {
        let (step_spec, param) = target.split_once('.').ok_or_else(|| {
            Error::Validation(format!(
                "alias '{name}': invalid target '{target}' (missing dot)"
            ))
        })?;

        // "(cabtype)" selects every step bound to that cab, a glob selects
        // matching labels, anything else is a literal label
        let labels: Vec<String> = if let Some(cabtype) = step_spec
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
        {
            self.steps
                .iter()
                .filter(|(_, step)| {
                    step.cab.as_deref() == Some(cabtype)
                        && matches!(step.cargo, Some(Cargo::Cab(_)))
                })
                .map(|(label, _)| label.clone())
                .collect()
        } else if step_spec.contains(['*', '?', '[']) {
            let pattern = glob::Pattern::new(step_spec).map_err(|error| {
                Error::Validation(format!(
                    "alias '{name}': invalid target pattern '{step_spec}': {error}"
                ))
            })?;
            self.steps
                .keys()
                .filter(|label| pattern.matches(label))
                .cloned()
                .collect()
        } else {
            vec![step_spec.to_owned()]
        };

        for label in labels {
            let step = self.steps.get(&label).ok_or_else(|| {
                Error::Validation(format!("alias '{name}' refers to unknown step '{label}'"))
            })?;
            let cargo = step.cargo.as_ref().ok_or_else(|| {
                Error::Definition(format!("alias '{name}': step '{label}' is not finalized"))
            })?;

            let (schema, side) = if let Some(schema) = cargo.spec().inputs.get(param) {
                (schema.clone(), IoSide::Inputs)
            } else if let Some(schema) = cargo.spec().outputs.get(param) {
                (schema.clone(), IoSide::Outputs)
            } else {
                return Err(Error::Validation(format!(
                    "alias '{name}' refers to unknown step parameter '{label}.{param}'"
                )));
            };

            if side == IoSide::Inputs && schema.implicit.is_some() {
                return Err(Error::Validation(format!(
                    "alias '{name}' refers to implicit input '{label}.{param}'"
                )));
            }

            let have_step_param = step.params.contains_key(param)
                || cargo.spec().defaults.contains_key(param)
                || schema.default.is_some()
                || schema.implicit.is_some();

            let existing = self
                .alias_list
                .get(name)
                .and_then(|infos| infos.first())
                .cloned();

            let io_side = match &existing {
                Some(existing) => {
                    if existing.io == IoSide::Outputs {
                        return Err(Error::Validation(format!(
                            "output alias '{name}' is defined more than once"
                        )));
                    }
                    if side == IoSide::Outputs {
                        return Err(Error::Validation(format!(
                            "alias '{name}' refers to both an input and an output"
                        )));
                    }
                    let previous = &self.spec.inputs[name].dtype;
                    if previous != &schema.dtype {
                        return Err(Error::Validation(format!(
                            "alias '{name}': dtype {} of '{label}.{param}' doesn't match previous dtype {previous}",
                            schema.dtype
                        )));
                    }
                    existing.io
                }
                None => {
                    // the alias handle inherits the endpoint schema; a
                    // default declared on the handle itself survives
                    let io = match side {
                        IoSide::Inputs => &mut self.spec.inputs,
                        IoSide::Outputs => &mut self.spec.outputs,
                    };
                    let declared_default = io.get(name).and_then(|handle| handle.default.clone());
                    let mut inherited = Schema {
                        aliases: vec![],
                        // required only when an endpoint is required and unset
                        required: false,
                        ..schema.clone()
                    };
                    if declared_default.is_some() {
                        inherited.default = declared_default;
                    }
                    io.insert(name.to_owned(), inherited);
                    side
                }
            };

            let io = match io_side {
                IoSide::Inputs => &mut self.spec.inputs,
                IoSide::Outputs => &mut self.spec.outputs,
            };
            let alias_schema = io.get_mut(name).expect("alias schema present");

            // implicit endpoints only occur on outputs; the marker resolves
            // when the step has run
            if schema.implicit.is_some() {
                alias_schema.implicit = Some(Value::Unresolved(Unresolved::Marker(format!(
                    "{label}.{param}"
                ))));
                self.implicit_params.insert(name.to_owned());
            }
            if have_step_param && alias_schema.default.is_none() {
                alias_schema.default = Some(Value::Unresolved(Unresolved::DeferredAlias(
                    format!("{label}.{param}"),
                )));
            }
            if schema.required && !have_step_param {
                alias_schema.required = true;
            }

            self.alias_map
                .insert((label.clone(), param.to_owned()), name.to_owned());
            self.alias_list
                .entry(name.to_owned())
                .or_default()
                .push(AliasInfo {
                    label,
                    param: param.to_owned(),
                    io: io_side,
                    from_recipe: false,
                    from_step: false,
                });
        }

        Ok(())
    }

    /// The config tree with this recipe's `assign_based_on` overrides
    /// applied.
    fn config_namespace(&self) -> Namespace {
        let mut ns = self.ctx().config.namespace();
        for (path, value) in &self.config_overrides {
            let segments: Vec<&str> = path.split('.').collect();
            let _ = ns.set_path(&segments, value.clone());
        }
        ns
    }

    /// Apply an `assign`/`assign_based_on` pair: dotted keys write config
    /// settings, I/O names write params, everything else becomes a
    /// recipe variable.
    fn update_assignments(
        &mut self,
        assign: &Assignments,
        assign_based_on: &AssignBasedOn,
        params: &mut IndexMap<String, Value>,
        location: &str,
    ) -> Result<(), Error> {
        for (basevar, lookup) in assign_based_on {
            let value = assign
                .get(basevar)
                .or_else(|| self.assign.get(basevar))
                .or_else(|| params.get(basevar))
                .cloned()
                .or_else(|| {
                    self.spec
                        .schema(basevar)
                        .and_then(|schema| schema.default.clone())
                });
            let Some(value) = value else {
                return Err(Error::Assignment {
                    location: location.to_owned(),
                    message: format!("assign_based_on.{basevar} is an unset variable or parameter"),
                });
            };

            let key = value.to_string();
            let assignments = lookup
                .get(&key)
                .or_else(|| lookup.get("DEFAULT"))
                .ok_or_else(|| Error::Assignment {
                    location: location.to_owned(),
                    message: format!(
                        "assign_based_on.{basevar}: unknown value '{key}', and no default defined"
                    ),
                })?;

            for (name, value) in assignments.clone() {
                if self.protected_from_assign.contains(&name) {
                    self.spec.log().debug(format!("skipping protected assignment {name}"));
                    continue;
                }
                if name.contains('.') {
                    let segments: Vec<&str> = name.split('.').collect();
                    let mut config_ns = self.config_namespace();
                    config_ns
                        .set_path(&segments, value.clone())
                        .map_err(|reason| Error::Assignment {
                            location: location.to_owned(),
                            message: format!("assign_based_on.{basevar}: {reason} in '{name}'"),
                        })?;
                    self.config_overrides.insert(name, value);
                } else if self.spec.has_param(&name) {
                    params.insert(name, value);
                } else {
                    self.assign.insert(name, value);
                }
            }
        }

        Ok(())
    }

    /// Resolve the for-loop iteration values. Non-strict calls tolerate an
    /// unresolved source and seed the first value so prevalidation sees a
    /// representative; strict calls demand a fully-resolved list.
    pub fn validate_for_loop(
        &mut self,
        params: &mut IndexMap<String, Value>,
        strict: bool,
    ) -> Result<(), Error> {
        let Some(for_loop) = &self.for_loop else {
            return Ok(());
        };
        let var = for_loop.var.clone();

        if let Some(ForLoopOver::Input(over)) = &for_loop.over {
            let values = if let Some(value) = self.assign.get(over) {
                value.clone()
            } else if let Some(value) = params.get(over) {
                value.clone()
            } else if !self.spec.inputs.contains_key(over) {
                return Err(Error::Validation(format!(
                    "for_loop.over={over} does not refer to a known parameter"
                )));
            } else {
                return Err(Error::Validation(format!("for_loop.over={over} is unset")));
            };

            if values.is_unresolved() {
                if strict {
                    return Err(Error::Validation(format!(
                        "for_loop.over={over} is unresolved"
                    )));
                }
                return Ok(());
            }

            let values = match values {
                Value::List(items) => items,
                other => vec![other],
            };
            if self.for_loop_values.is_none() {
                self.spec.log().info(format!(
                    "recipe is a for-loop with '{var}' iterating over {} values",
                    values.len()
                ));
            }
            self.for_loop_values = Some(values);
        }

        // seed the first value so dependent substitutions resolve
        if let Some(first) = self
            .for_loop_values
            .as_ref()
            .and_then(|values| values.first())
            .cloned()
        {
            self.assign.insert(var, first);
        }

        Ok(())
    }

    fn prep_step(&self, label: &str, subst: &mut Namespace) {
        let parts: Vec<&str> = label.split('-').collect();
        if let Some(info) = subst.ns_mut("info") {
            info.insert("fqname", format!("{}.{label}", self.spec.fqname));
            info.insert("label", label);
            info.insert(
                "label_parts",
                Value::List(parts.iter().map(|part| Value::Str((*part).to_owned())).collect()),
            );
            info.insert(
                "suffix",
                if parts.len() > 1 {
                    (*parts.last().expect("non-empty")).to_owned()
                } else {
                    String::new()
                },
            );
        }

        let params_ns = Namespace::from_values(&self.steps[label].params);
        subst.add_ns("current", params_ns.clone());
        if let Some(steps_ns) = subst.ns_mut("steps") {
            steps_ns.add_ns(label, params_ns);
        }
    }

    fn prevalidate_self(
        &mut self,
        params: IndexMap<String, Value>,
        subst_outer: Option<&Namespace>,
        subst: &mut Namespace,
        errors: &mut Vec<String>,
    ) -> IndexMap<String, Value> {
        let types = self.ctx().types.clone();

        let mut params = match self.spec.prevalidate(&params, subst_outer, types.as_ref()) {
            Ok(validated) => validated,
            Err(error) => {
                errors.push(format!("recipe pre-validation failed: {error}"));
                params
            }
        };
        if let Err(error) = self.validate_for_loop(&mut params, false) {
            errors.push(format!("recipe pre-validation failed: {error}"));
        }

        // values may have changed
        if let Some(recipe_ns) = subst.ns_mut("recipe") {
            recipe_ns.merge_values(&params);
            recipe_ns.merge_values(&self.assign);
        }

        params
    }

    fn prevalidate_steps(&mut self, subst: &mut Namespace, errors: &mut Vec<String>) {
        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for label in labels {
            self.prep_step(&label, subst);

            let step = self.steps.get_mut(&label).expect("step exists");
            match step.prevalidate(Some(subst)) {
                Ok(step_params) => {
                    // prevalidation may have changed the parameters
                    subst.add_ns("current", Namespace::from_values(&step_params));
                }
                Err(error) => {
                    errors.push(format!("step '{label}' failed pre-validation: {error}"));
                }
            }

            let current = subst.ns("current").cloned().unwrap_or_default();
            subst.add_ns_nosubst("previous", current.clone());
            if let Some(steps_ns) = subst.ns_mut("steps") {
                steps_ns.add_ns(label.clone(), current);
            }
        }
    }

    /// Prevalidate the recipe and its steps, propagating alias values to a
    /// fixed point: push down, validate, pull up, re-broadcast.
    pub fn prevalidate(
        &mut self,
        mut params: IndexMap<String, Value>,
        subst_outer: Option<&Namespace>,
    ) -> Result<IndexMap<String, Value>, Error> {
        if !self.finalized {
            return Err(Error::Definition(format!(
                "recipe '{}' used before finalization",
                self.spec.name
            )));
        }
        self.spec.log().debug("prevalidating recipe");

        let mut errors: Vec<String> = vec![];

        let assign = self.assign.clone();
        let assign_based_on = self.assign_based_on.clone();
        let location = self.spec.fqname.clone();
        if let Err(error) = self.update_assignments(&assign, &assign_based_on, &mut params, &location)
        {
            errors.push(error.to_string());
        }

        let mut subst = Namespace::new();
        let mut info = Namespace::new();
        info.insert("fqname", self.spec.fqname.clone());
        subst.add_ns_nosubst("info", info);
        subst.add_ns_nosubst("config", self.config_namespace());
        subst.add_ns_nosubst("steps", Namespace::new());
        subst.add_ns_nosubst("previous", Namespace::new());
        subst.add_ns(
            "recipe",
            self.spec.make_subst_namespace(&params, &self.assign),
        );

        params = self.prevalidate_self(params, subst_outer, &mut subst, &mut errors);

        // push recipe-supplied values down into the step endpoints
        {
            let mut pushes: Vec<(String, String, Value)> = vec![];
            for (name, infos) in self.alias_list.iter_mut() {
                let Some(value) = params.get(name) else { continue };
                if matches!(value, Value::Unresolved(Unresolved::DeferredAlias(_)))
                    || self.implicit_params.contains(name)
                {
                    continue;
                }
                for info in infos.iter_mut() {
                    info.from_recipe = true;
                    pushes.push((info.label.clone(), info.param.clone(), value.clone()));
                }
            }
            for (label, param, value) in pushes {
                if let Some(step) = self.steps.get_mut(&label) {
                    step.update_parameter(param, value);
                }
            }
        }

        self.prevalidate_steps(&mut subst, &mut errors);

        // pull the first available step value up, then re-broadcast it
        if errors.is_empty() {
            let mut revalidate_self = false;
            let mut revalidate_steps = false;
            let mut pushes: Vec<(String, String, Value)> = vec![];

            let alias_names: Vec<String> = self.alias_list.keys().cloned().collect();
            for name in alias_names {
                let needs_pull = match params.get(&name) {
                    None => true,
                    Some(Value::Unresolved(Unresolved::DeferredAlias(_))) => true,
                    Some(_) => matches!(
                        self.spec
                            .schema(&name)
                            .and_then(|schema| schema.implicit.as_ref()),
                        Some(Value::Unresolved(_))
                    ),
                };
                if !needs_pull {
                    continue;
                }

                let infos = self.alias_list.get_mut(&name).expect("alias exists");
                let mut pulled: Option<Value> = None;
                for info in infos.iter_mut() {
                    let value = self
                        .steps
                        .get(&info.label)
                        .and_then(|step| step.validated_params.as_ref())
                        .and_then(|validated| validated.get(&info.param));
                    if let Some(value) = value {
                        info.from_step = true;
                        pulled = Some(value.clone());
                        break;
                    }
                }
                let Some(value) = pulled else { continue };
                revalidate_self = true;

                // first endpoint in declaration order wins; disagreeing
                // concrete values elsewhere are an error
                for info in infos.iter() {
                    if info.from_step {
                        continue;
                    }
                    let other = self
                        .steps
                        .get(&info.label)
                        .and_then(|step| step.validated_params.as_ref())
                        .and_then(|validated| validated.get(&info.param));
                    if let Some(other) = other {
                        if other.is_concrete() && value.is_concrete() && *other != value {
                            errors.push(format!(
                                "alias '{name}': '{}.{}' disagrees with the first endpoint value",
                                info.label, info.param
                            ));
                        }
                    }
                }

                for info in infos.iter_mut() {
                    if !info.from_step {
                        info.from_recipe = true;
                        revalidate_steps = true;
                        pushes.push((info.label.clone(), info.param.clone(), value.clone()));
                    }
                }
                params.insert(name, value);
            }

            for (label, param, value) in pushes {
                if let Some(step) = self.steps.get_mut(&label) {
                    step.update_parameter(param, value);
                }
            }

            if revalidate_self && errors.is_empty() {
                params = self.prevalidate_self(params, subst_outer, &mut subst, &mut errors);
            }
            if revalidate_steps && errors.is_empty() {
                self.prevalidate_steps(&mut subst, &mut errors);
            }
        }

        let missing: Vec<String> = self
            .spec
            .inputs_outputs()
            .filter(|(name, schema)| schema.required && !params.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            errors.push(format!(
                "recipe '{}' is missing the following required parameters: {}",
                self.spec.name,
                join_quote(missing)
            ));
        }

        if !errors.is_empty() {
            for error in &errors {
                self.spec.log().error(error);
            }
            return Err(Error::Validation(format!(
                "{} error(s) validating the recipe '{}'",
                errors.len(),
                self.spec.name
            )));
        }

        self.spec.log().debug("recipe pre-validated");
        Ok(params)
    }

    /// Strict input validation for the run phase; builds a default
    /// namespace when the caller has none.
    pub fn validate_inputs(
        &mut self,
        params: &IndexMap<String, Value>,
        subst: Option<&Namespace>,
        loose: bool,
    ) -> Result<IndexMap<String, Value>, Error> {
        let mut params = params.clone();
        self.validate_for_loop(&mut params, true)?;

        let types = self.ctx().types.clone();

        let owned;
        let ns = match subst {
            Some(ns) => Some(ns),
            None => {
                let mut built = Namespace::new();
                let mut info = Namespace::new();
                info.insert("fqname", self.spec.fqname.clone());
                built.add_ns_nosubst("info", info);
                built.add_ns_nosubst("config", self.config_namespace());
                built.add_ns(
                    "recipe",
                    self.spec.make_subst_namespace(&params, &self.assign),
                );
                owned = built;
                Some(&owned)
            }
        };

        Ok(self
            .spec
            .validate_inputs(&params, ns, loose, types.as_ref())?)
    }

    fn link_steps(&mut self) {
        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for (i, label) in labels.iter().enumerate() {
            let previous = (i > 0).then(|| labels[i - 1].clone());
            let next = labels.get(i + 1).cloned();
            if let Some(step) = self.steps.get_mut(label) {
                step.previous_step = previous;
                step.next_step = next;
            }
        }
    }

    /// Internal run, called from the wrapping step once inputs are
    /// validated. Executes the for-loop (serially or scattered) and
    /// returns the output subset of the parameters.
    pub(crate) fn run_internal(
        &mut self,
        mut params: IndexMap<String, Value>,
    ) -> Result<IndexMap<String, Value>, Error> {
        let ctx = self.ctx().clone();

        let mut subst = Namespace::new();
        let mut info = Namespace::new();
        info.insert("fqname", self.spec.fqname.clone());
        subst.add_ns_nosubst("info", info);
        subst.add_ns_nosubst("steps", Namespace::new());
        subst.add_ns_nosubst("previous", Namespace::new());
        let recipe_ns = self.spec.make_subst_namespace(&params, &self.assign);
        subst.add_ns("recipe", recipe_ns.clone());

        // top-level config sections are visible by name; "recipe" would
        // clash with our own namespace
        let config_ns = self.config_namespace();
        for (key, entry) in config_ns.iter() {
            if key == "recipe" {
                continue;
            }
            match entry {
                Entry::Ns { ns, .. } => subst.add_ns_nosubst(key.clone(), ns.clone()),
                Entry::Value(value) => subst.insert(key.clone(), value.clone()),
            }
        }
        subst.add_ns_nosubst("config", config_ns);

        // the root namespace binds exactly once and stays read-only
        if self.spec.nesting <= 1 {
            ctx.set_root_ns(recipe_ns);
        }
        if let Some(root) = ctx.root_ns() {
            subst.add_ns("root", root.clone());
        }

        // the logfile name may depend on substitutions
        {
            let mut log = self.spec.log().clone();
            if log.update_file_sink(&ctx.config.opts.log, &subst).is_ok() {
                self.spec.log = Some(log);
            }
        }

        self.link_steps();
        self.spec.log().info(format!("running recipe '{}'", self.spec.name));

        // inputs are validated; push alias values down one more time
        {
            let mut pushes: Vec<(String, String, Value)> = vec![];
            for (name, schema) in self.spec.inputs.iter() {
                match params.get(name) {
                    Some(Value::Unresolved(Unresolved::DeferredAlias(_))) => {}
                    Some(Value::Unresolved(_)) => {
                        return Err(Error::Validation(format!(
                            "recipe '{}' has unresolved input '{name}'",
                            self.spec.name
                        )));
                    }
                    Some(value) => {
                        for info in self.alias_list.get(name).map(Vec::as_slice).unwrap_or(&[]) {
                            if info.from_recipe {
                                pushes.push((info.label.clone(), info.param.clone(), value.clone()));
                            }
                        }
                    }
                    None => {
                        if schema.required {
                            return Err(Error::Validation(format!(
                                "recipe '{}' is missing required input '{name}'",
                                self.spec.name
                            )));
                        }
                    }
                }
            }
            for (label, param, value) in pushes {
                if let Some(step) = self.steps.get_mut(&label) {
                    step.update_parameter(param, value);
                }
            }
        }

        self.validate_for_loop(&mut params, true)?;

        let values: Vec<Option<Value>> = match &self.for_loop_values {
            Some(values) => values.iter().cloned().map(Some).collect(),
            None => vec![None],
        };
        let scatter = self.for_loop.as_ref().map(|f| f.scatter).unwrap_or(false);

        if scatter && values.len() > 1 {
            let workers = ctx.config.opts.dist.worker_count();
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|error| Error::Scatter(error.to_string()))?;

            self.spec.log().info(format!(
                "scattering {} iterations over {workers} workers",
                values.len()
            ));

            // each worker gets a deep copy; errors are collected and the
            // first is raised once the batch is done. Scattered outputs do
            // not propagate back into the recipe.
            let recipe = &*self;
            let worker_subst = &subst;
            let results: Vec<Result<(), Error>> = pool.install(|| {
                values
                    .par_iter()
                    .enumerate()
                    .map(|(count, value)| {
                        let mut worker = recipe.clone();
                        let mut subst = worker_subst.clone();
                        worker.run_iteration(count, value.clone(), &mut subst)
                    })
                    .collect()
            });
            if let Some(error) = results.into_iter().find_map(Result::err) {
                return Err(error);
            }
        } else {
            for (count, value) in values.into_iter().enumerate() {
                self.run_iteration(count, value, &mut subst)?;
            }
        }

        // pull step outputs up through their aliases
        {
            let mut pulls: Vec<(String, Value)> = vec![];
            for (name, infos) in &self.alias_list {
                for info in infos {
                    if !info.from_step {
                        continue;
                    }
                    let value = self
                        .steps
                        .get(&info.label)
                        .and_then(|step| step.validated_params.as_ref())
                        .and_then(|validated| validated.get(&info.param));
                    if let Some(value) = value {
                        pulls.push((name.clone(), value.clone()));
                    }
                }
            }
            for (name, value) in pulls {
                params.insert(name, value);
            }
        }

        self.spec.log().info(format!(
            "recipe '{}' executed successfully",
            self.spec.name
        ));

        Ok(params
            .into_iter()
            .filter(|(name, _)| self.spec.outputs.contains_key(name))
            .collect())
    }

    fn run_iteration(
        &mut self,
        count: usize,
        iter_value: Option<Value>,
        subst: &mut Namespace,
    ) -> Result<(), Error> {
        let ctx = self.ctx().clone();

        let loop_var = self.for_loop.as_ref().map(|f| f.var.clone());
        if let (Some(var), Some(value)) = (loop_var, iter_value) {
            self.spec
                .log()
                .info(format!("for loop iteration {count}: {var} = {value}"));
            self.assign.insert(var.clone(), value);
            self.assign
                .insert(format!("{var}@index"), Value::Int(count as i64));

            let assign = self.assign.clone();
            let assign_based_on = self.assign_based_on.clone();
            let location = self.spec.fqname.clone();
            let mut scratch = IndexMap::new();
            self.update_assignments(&assign, &assign_based_on, &mut scratch, &location)?;

            if let Some(recipe_ns) = subst.ns_mut("recipe") {
                recipe_ns.merge_values(&self.assign);
            }

            let mut log = self.spec.log().clone();
            if log.update_file_sink(&ctx.config.opts.log, subst).is_ok() {
                self.spec.log = Some(log);
            }
        }

        let labels: Vec<String> = self.steps.keys().cloned().collect();
        for label in labels {
            let (step_assign, step_abo) = {
                let step = &self.steps[&label];
                (step.assign.clone(), step.assign_based_on.clone())
            };
            let location = format!("{}.{label}", self.spec.name);
            let mut scratch = IndexMap::new();
            self.update_assignments(&step_assign, &step_abo, &mut scratch, &location)?;
            if let Some(recipe_ns) = subst.ns_mut("recipe") {
                recipe_ns.merge_values(&step_assign);
            }

            self.prep_step(&label, subst);

            let (skip, skip_if, break_if) = {
                let step = &self.steps[&label];
                (step.skip, step.skip_if.clone(), step.break_if.clone())
            };
            let skip_now = skip
                || match &skip_if {
                    Some(condition) => eval_condition(condition, subst)?,
                    None => false,
                };

            self.spec.log().info(format!(
                "{} step '{label}'",
                if skip_now { "skipping" } else { "running" }
            ));

            // steps get a copy; recipes may modify the namespace
            let mut step_subst = subst.clone();
            let step = self.steps.get_mut(&label).expect("step exists");
            let step_params = match step.run(Some(&mut step_subst), skip_now) {
                Ok(step_params) => step_params,
                Err(error) => {
                    self.spec
                        .log()
                        .error(format!("error running step '{label}': {error}"));
                    return Err(Error::Step {
                        label: label.clone(),
                        source: Box::new(error),
                    });
                }
            };

            // outputs feed the namespaces observed by subsequent steps
            let outputs_ns = Namespace::from_values(&step_params);
            subst.add_ns_nosubst("previous", outputs_ns.clone());
            if let Some(steps_ns) = subst.ns_mut("steps") {
                steps_ns.add_ns(label.clone(), outputs_ns);
            }

            if let Some(condition) = &break_if {
                if eval_condition(condition, subst)? {
                    self.spec
                        .log()
                        .info(format!("step '{label}' requested a break"));
                    break;
                }
            }
        }

        Ok(())
    }

    /// Recipe state summary lines; unset parameters show as `???`.
    pub fn summary(
        &self,
        params: &IndexMap<String, Value>,
        recursive: bool,
        ignore_missing: bool,
    ) -> Vec<String> {
        let mut lines = vec![format!("recipe '{}':", self.spec.name)];
        lines.extend(
            params
                .iter()
                .map(|(name, value)| format!("  {name} = {value}")),
        );
        if !ignore_missing {
            lines.extend(
                self.spec
                    .inputs_outputs()
                    .filter(|(name, _)| !params.contains_key(*name))
                    .map(|(name, _)| format!("  {name} = ???")),
            );
        }
        if recursive && !self.steps.is_empty() {
            lines.push("  steps:".into());
            for (label, step) in &self.steps {
                lines.push(format!("    {label}:"));
                lines.extend(
                    step.summary(ignore_missing)
                        .into_iter()
                        .map(|line| format!("    {line}")),
                );
            }
        }
        lines
    }
}

/// Truthiness of a conditional: a template resolves through the
/// namespace, a bare name is treated as a dotted reference. Unresolved
/// conditions are false.
fn eval_condition(expression: &str, ns: &Namespace) -> Result<bool, Error> {
    let template = if subst::has_references(expression) {
        expression.to_owned()
    } else {
        format!("{{{expression}}}")
    };
    match subst::resolve(&template, ns)? {
        Resolved::Value(value) => Ok(value.is_true()),
        Resolved::Unresolved(_) => Ok(false),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Definition(String),
    #[error("{0}")]
    Validation(String),
    #[error("{location}: {message}")]
    Assignment { location: String, message: String },
    #[error("step '{label}' failed")]
    Step {
        label: String,
        #[source]
        source: Box<step::Error>,
    },
    #[error(transparent)]
    Subst(#[from] subst::Error),
    #[error(transparent)]
    Schema(#[from] crate::schema::Error),
    #[error("decode recipe")]
    Decode(#[from] serde_yaml::Error),
    #[error("scatter pool: {0}")]
    Scatter(String),
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cargo::Cab;
    use crate::config::Config;
    use crate::runner::{CabRunner, Error as RunnerError};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, IndexMap<String, Value>)>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(String, IndexMap<String, Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CabRunner for Recorder {
        fn run(
            &self,
            cab: &Cab,
            params: &IndexMap<String, Value>,
            _log: &Logger,
            _subst: Option<&Namespace>,
        ) -> Result<i32, RunnerError> {
            self.calls
                .lock()
                .unwrap()
                .push((cab.spec.name.clone(), params.clone()));
            Ok(0)
        }
    }

    fn config() -> Config {
        Config::from_yaml(
            r#"
cabs:
  echo:
    command: echo
    policies: {positional: true}
    inputs:
      msg: {dtype: str, required: true}
  copy:
    command: copy
    inputs:
      src: {dtype: str, required: true}
    outputs:
      dest: {dtype: str, implicit: "{current.src}.out"}
"#,
        )
        .unwrap()
    }

    fn context() -> (Context, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let ctx = Context::new(config()).with_runner(recorder.clone());
        (ctx, recorder)
    }

    fn finalized(yaml: &str) -> Recipe {
        let (ctx, _) = context();
        let mut recipe = Recipe::from_yaml(yaml).unwrap();
        recipe.finalize(&ctx, None, None, 0).unwrap();
        recipe
    }

    #[test]
    fn aliases_from_schema_propagate_down() {
        let mut recipe = finalized(
            r#"
name: demo
inputs:
  greeting: {dtype: str, default: hello, aliases: [step1.msg]}
steps:
  step1: {cab: echo}
"#,
        );

        let params = recipe.prevalidate(IndexMap::new(), None).unwrap();
        assert_eq!(params["greeting"], Value::Str("hello".into()));
        assert_eq!(
            recipe.steps["step1"].params["msg"],
            Value::Str("hello".into())
        );
        let infos = recipe.aliases_for("greeting").unwrap();
        assert!(infos[0].from_recipe);
    }

    #[test]
    fn step_values_propagate_up() {
        let mut recipe = finalized(
            r#"
name: demo
inputs:
  greeting: {dtype: str, aliases: [step1.msg]}
steps:
  step1: {cab: echo, params: {msg: present}}
"#,
        );

        let params = recipe.prevalidate(IndexMap::new(), None).unwrap();
        assert_eq!(params["greeting"], Value::Str("present".into()));
        let infos = recipe.aliases_for("greeting").unwrap();
        assert!(infos[0].from_step);
    }

    #[test]
    fn broadcast_after_pull_up() {
        let mut recipe = finalized(
            r#"
name: demo
aliases:
  msg: ["(echo).msg"]
steps:
  one: {cab: echo, params: {msg: shared}}
  two: {cab: echo}
"#,
        );

        let params = recipe.prevalidate(IndexMap::new(), None).unwrap();
        assert_eq!(params["msg"], Value::Str("shared".into()));
        assert_eq!(recipe.steps["two"].params["msg"], Value::Str("shared".into()));

        let infos = recipe.aliases_for("msg").unwrap();
        assert!(infos.iter().any(|info| info.from_step));
        assert!(infos.iter().any(|info| info.from_recipe));
    }

    #[test]
    fn auto_aliases_are_created_for_unset_params() {
        let recipe = finalized(
            r#"
name: demo
steps:
  step1: {cab: echo}
"#,
        );

        assert!(recipe.spec.inputs.contains_key("step1_msg"));
        assert_eq!(recipe.alias_for_endpoint("step1", "msg"), Some("step1_msg"));
        // the endpoint is required and unset, so the alias is required
        assert!(recipe.spec.inputs["step1_msg"].required);
    }

    #[test]
    fn auto_alias_collision_is_fatal() {
        let (ctx, _) = context();
        let mut recipe = Recipe::from_yaml(
            r#"
name: demo
inputs:
  step1_msg: {dtype: int}
steps:
  step1: {cab: echo}
"#,
        )
        .unwrap();
        assert!(matches!(
            recipe.finalize(&ctx, None, None, 0),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn glob_targets_select_matching_steps() {
        let recipe = finalized(
            r#"
name: demo
aliases:
  all_messages: ["step-*.msg"]
steps:
  step-a: {cab: echo, params: {msg: x}}
  step-b: {cab: echo, params: {msg: x}}
  other: {cab: echo, params: {msg: y}}
"#,
        );

        let infos = recipe.aliases_for("all_messages").unwrap();
        let labels: Vec<&str> = infos.iter().map(|info| info.label.as_str()).collect();
        assert_eq!(labels, vec!["step-a", "step-b"]);
    }

    #[test]
    fn output_alias_can_only_bind_once() {
        let (ctx, _) = context();
        let mut recipe = Recipe::from_yaml(
            r#"
name: demo
aliases:
  result: [one.dest, two.dest]
steps:
  one: {cab: copy, params: {src: a}}
  two: {cab: copy, params: {src: b}}
"#,
        )
        .unwrap();
        let error = recipe.finalize(&ctx, None, None, 0).unwrap_err();
        assert!(error.to_string().contains("defined more than once"));
    }

    #[test]
    fn implicit_outputs_mark_the_alias() {
        let recipe = finalized(
            r#"
name: demo
aliases:
  result: [one.dest]
steps:
  one: {cab: copy, params: {src: a}}
"#,
        );

        let schema = &recipe.spec.outputs["result"];
        assert!(matches!(
            schema.implicit,
            Some(Value::Unresolved(Unresolved::Marker(_)))
        ));
    }

    #[test]
    fn prevalidation_is_idempotent() {
        let mut recipe = finalized(
            r#"
name: demo
inputs:
  greeting: {dtype: str, default: hello, aliases: [step1.msg]}
steps:
  step1: {cab: echo}
"#,
        );

        let once = recipe.prevalidate(IndexMap::new(), None).unwrap();
        let twice = recipe.prevalidate(once.clone(), None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn for_loop_literal_values_freeze_at_finalize() {
        let mut recipe = finalized(
            r#"
name: demo
for_loop: {var: i, over: [1, 2, 3]}
steps:
  step1: {cab: echo, params: {msg: "value {recipe.i}"}}
"#,
        );

        assert!(recipe.for_loop.as_ref().unwrap().over.is_none());
        let mut params = IndexMap::new();
        recipe.validate_for_loop(&mut params, true).unwrap();
        assert_eq!(recipe.assign["i"], Value::Int(1));
    }

    #[test]
    fn for_loop_over_input_becomes_required() {
        let recipe = finalized(
            r#"
name: demo
inputs:
  items: {dtype: "List[int]"}
for_loop: {var: i, over: items}
steps:
  step1: {cab: echo, params: {msg: "value {recipe.i}"}}
"#,
        );
        assert!(recipe.spec.inputs["items"].required);
    }

    #[test]
    fn for_loop_var_must_not_clash() {
        let (ctx, _) = context();
        let mut recipe = Recipe::from_yaml(
            r#"
name: demo
inputs:
  i: {dtype: int}
for_loop: {var: i, over: [1]}
steps:
  step1: {cab: echo, params: {msg: hi}}
"#,
        )
        .unwrap();
        assert!(recipe.finalize(&ctx, None, None, 0).is_err());
    }

    #[test]
    fn assignments_route_to_config_params_and_vars() {
        let mut recipe = finalized(
            r#"
name: demo
inputs:
  mode: {dtype: str, default: fast}
assign:
  band: L
assign_based_on:
  band:
    L:
      mode: thorough
      opts.dist.ncpu: 4
      scratch: extra
    DEFAULT: {}
steps:
  step1: {cab: echo, params: {msg: hi}}
"#,
        );

        let params = recipe.prevalidate(IndexMap::new(), None).unwrap();
        assert_eq!(params["mode"], Value::Str("thorough".into()));
        assert_eq!(recipe.assign["scratch"], Value::Str("extra".into()));
        let config_ns = recipe.config_namespace();
        assert_eq!(
            config_ns.walk(&["opts", "dist", "ncpu"]).unwrap().0,
            &Value::Int(4)
        );
    }

    #[test]
    fn unknown_assignment_base_is_fatal() {
        let mut recipe = finalized(
            r#"
name: demo
assign_based_on:
  nope:
    x: {a: 1}
steps:
  step1: {cab: echo, params: {msg: hi}}
"#,
        );
        assert!(recipe.prevalidate(IndexMap::new(), None).is_err());
    }

    #[test]
    fn run_executes_steps_in_order() {
        let (ctx, recorder) = context();
        let mut recipe = Recipe::from_yaml(
            r#"
name: demo
steps:
  one: {cab: echo, params: {msg: first}}
  two: {cab: echo, params: {msg: second}}
"#,
        )
        .unwrap();
        recipe.finalize(&ctx, None, None, 1).unwrap();
        recipe.prevalidate(IndexMap::new(), None).unwrap();
        recipe.run_internal(IndexMap::new()).unwrap();

        let calls = recorder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1["msg"], Value::Str("first".into()));
        assert_eq!(calls[1].1["msg"], Value::Str("second".into()));
    }

    #[test]
    fn skipped_steps_do_not_run() {
        let (ctx, recorder) = context();
        let mut recipe = Recipe::from_yaml(
            r#"
name: demo
steps:
  one: {cab: echo, params: {msg: first}, skip: true}
  two: {cab: echo, params: {msg: second}}
"#,
        )
        .unwrap();
        recipe.finalize(&ctx, None, None, 1).unwrap();
        recipe.prevalidate(IndexMap::new(), None).unwrap();
        recipe.run_internal(IndexMap::new()).unwrap();

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["msg"], Value::Str("second".into()));
    }

    #[test]
    fn restrict_steps_skips_the_rest() {
        let (ctx, _) = context();
        let mut recipe = Recipe::from_yaml(
            r#"
name: demo
steps:
  one: {cab: echo, params: {msg: a}}
  two: {cab: echo, params: {msg: b}}
"#,
        )
        .unwrap();
        recipe.finalize(&ctx, None, None, 0).unwrap();
        recipe.restrict_steps(["two"], true).unwrap();
        assert!(recipe.steps["one"].skip);
        assert!(!recipe.steps["two"].skip);
        assert!(recipe.restrict_steps(["missing"], false).is_err());
    }

    #[test]
    fn add_step_autogenerates_labels() {
        let mut recipe = Recipe::from_yaml("name: demo").unwrap();
        let label = recipe
            .add("echo", None, IndexMap::new(), None)
            .unwrap();
        assert_eq!(label, "echo_1");
        let label = recipe.add("echo", None, IndexMap::new(), None).unwrap();
        assert_eq!(label, "echo_2");

        let (ctx, _) = context();
        recipe.finalize(&ctx, None, None, 0).unwrap();
        assert!(matches!(
            recipe.add_step(Step::cab("echo"), None),
            Err(Error::Definition(_))
        ));
    }
}
