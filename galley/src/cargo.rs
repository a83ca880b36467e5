// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The common addressable unit wrapped by a step: an external [`Cab`] or
//! a nested [`crate::Recipe`], behind the tagged [`Cargo`] variant.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use subst::{Namespace, Value};

use crate::logging::Logger;
use crate::recipe::Recipe;
use crate::schema::{self, Options, Schema, TypeRegistry};

/// Fields and capabilities shared by cabs and recipes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Spec {
    pub name: String,
    #[serde(skip)]
    pub fqname: String,
    pub info: Option<String>,
    pub inputs: IndexMap<String, Schema>,
    pub outputs: IndexMap<String, Schema>,
    pub defaults: IndexMap<String, Value>,
    pub backend: Option<String>,
    #[serde(skip)]
    pub nesting: usize,
    #[serde(skip)]
    pub log: Option<Logger>,
}

impl Spec {
    /// Inputs and outputs chained in declaration order.
    pub fn inputs_outputs(&self) -> impl Iterator<Item = (&String, &Schema)> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.inputs.get(name).or_else(|| self.outputs.get(name))
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.inputs.contains_key(name) || self.outputs.contains_key(name)
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    /// Names appearing on both sides; must be empty.
    pub fn overlapping(&self) -> Vec<String> {
        self.inputs
            .keys()
            .filter(|name| self.outputs.contains_key(*name))
            .cloned()
            .collect()
    }

    pub fn bind(&mut self, log: Logger, fqname: &str, nesting: usize) {
        self.fqname = fqname.to_owned();
        self.nesting = nesting;
        self.log = Some(log);
    }

    pub fn log(&self) -> &Logger {
        self.log.as_ref().expect("cargo is finalized")
    }

    /// Fill defaults, expand substitutions and loosely validate the whole
    /// parameter set; sentinels are recorded in place.
    pub fn prevalidate(
        &self,
        params: &IndexMap<String, Value>,
        subst: Option<&Namespace>,
        types: &dyn TypeRegistry,
    ) -> Result<IndexMap<String, Value>, schema::Error> {
        let mut params = params.clone();
        for (name, value) in &self.defaults {
            params.entry(name.clone()).or_insert_with(|| value.clone());
        }

        let unknown: Vec<_> = params
            .keys()
            .filter(|name| self.schema(name).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(schema::Error::Unknown(schema::join_quote(unknown)));
        }

        schema::validate(
            self.inputs_outputs(),
            &params,
            &Options {
                loose: true,
                artifacts: false,
                subst,
                types,
            },
        )
    }

    /// Validate the input subset; everything else passes through untouched.
    pub fn validate_inputs(
        &self,
        params: &IndexMap<String, Value>,
        subst: Option<&Namespace>,
        loose: bool,
        types: &dyn TypeRegistry,
    ) -> Result<IndexMap<String, Value>, schema::Error> {
        let mut validated = schema::validate(
            self.inputs.iter(),
            params,
            &Options {
                loose,
                artifacts: false,
                subst,
                types,
            },
        )?;

        for (name, value) in params {
            if !self.inputs.contains_key(name) {
                validated.insert(name.clone(), value.clone());
            }
        }

        Ok(validated)
    }

    /// Validate the output subset, enforcing artifact existence unless
    /// loose; everything else passes through untouched.
    pub fn validate_outputs(
        &self,
        params: &IndexMap<String, Value>,
        subst: Option<&Namespace>,
        loose: bool,
        types: &dyn TypeRegistry,
    ) -> Result<IndexMap<String, Value>, schema::Error> {
        let mut validated = schema::validate(
            self.outputs.iter(),
            params,
            &Options {
                loose,
                artifacts: true,
                subst,
                types,
            },
        )?;

        for (name, value) in params {
            if !self.outputs.contains_key(name) {
                validated.insert(name.clone(), value.clone());
            }
        }

        Ok(validated)
    }

    /// Flat namespace over assigned variables and parameters; parameters
    /// win on collision.
    pub fn make_subst_namespace(
        &self,
        params: &IndexMap<String, Value>,
        extra: &IndexMap<String, Value>,
    ) -> Namespace {
        let mut ns = Namespace::from_values(extra);
        ns.merge_values(params);
        ns
    }
}

/// An external command-line tool described by a schema.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Cab {
    #[serde(flatten)]
    pub spec: Spec,
    /// Command template, `{…}`-substitutable.
    pub command: String,
    pub policies: Policies,
    /// Run through `/bin/sh -c` instead of direct exec.
    pub shell: bool,
}

/// How validated parameters are turned into command-line arguments.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Policies {
    /// Pass values bare, in declaration order, instead of `--name value`.
    pub positional: bool,
    pub prefix: String,
    /// Rewrite `_` to `-` in option names.
    pub replace_underscores: bool,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            positional: false,
            prefix: "--".into(),
            replace_underscores: false,
        }
    }
}

/// The concrete unit a step executes.
#[derive(Debug, Clone)]
pub enum Cargo {
    Cab(Cab),
    Recipe(Box<Recipe>),
}

impl Cargo {
    pub fn spec(&self) -> &Spec {
        match self {
            Cargo::Cab(cab) => &cab.spec,
            Cargo::Recipe(recipe) => &recipe.spec,
        }
    }

    pub fn spec_mut(&mut self) -> &mut Spec {
        match self {
            Cargo::Cab(cab) => &mut cab.spec,
            Cargo::Recipe(recipe) => &mut recipe.spec,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::FsTypes;

    fn cab() -> Cab {
        serde_yaml::from_str(
            r#"
command: echo
inputs:
  msg: {dtype: str, required: true}
  level: {dtype: int, default: 1}
outputs:
  out: {dtype: str}
"#,
        )
        .unwrap()
    }

    #[test]
    fn prevalidate_is_loose_and_seeds_defaults() {
        let cab = cab();
        let validated = cab
            .spec
            .prevalidate(&IndexMap::new(), None, &FsTypes)
            .unwrap();
        assert_eq!(validated["level"], Value::Int(1));
        assert!(!validated.contains_key("msg"));
    }

    #[test]
    fn prevalidate_rejects_unknown_parameters() {
        let cab = cab();
        let params = IndexMap::from([("typo".to_owned(), Value::Int(1))]);
        assert!(matches!(
            cab.spec.prevalidate(&params, None, &FsTypes),
            Err(schema::Error::Unknown(_))
        ));
    }

    #[test]
    fn validate_inputs_passes_outputs_through() {
        let cab = cab();
        let params = IndexMap::from([
            ("msg".to_owned(), Value::Str("hi".into())),
            ("out".to_owned(), Value::Str("artifact".into())),
        ]);
        let validated = cab
            .spec
            .validate_inputs(&params, None, false, &FsTypes)
            .unwrap();
        assert_eq!(validated["msg"], Value::Str("hi".into()));
        assert_eq!(validated["out"], Value::Str("artifact".into()));
    }

    #[test]
    fn strict_inputs_require_msg() {
        let cab = cab();
        assert!(cab
            .spec
            .validate_inputs(&IndexMap::new(), None, false, &FsTypes)
            .is_err());
        assert!(cab
            .spec
            .validate_inputs(&IndexMap::new(), None, true, &FsTypes)
            .is_ok());
    }
}
