// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parameter schemas and the batch validator.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use subst::{Namespace, Unresolved, Value};
use thiserror::Error;

/// Parameter type. Written in config as `str`, `int`, `float`, `bool`,
/// `File`, `Directory`, `MS` or `List[…]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum DType {
    Str,
    Int,
    Float,
    Bool,
    File,
    Directory,
    MS,
    List(Box<DType>),
}

impl DType {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, DType::List(_))
    }

    pub fn is_artifact(&self) -> bool {
        match self {
            DType::File | DType::Directory | DType::MS => true,
            DType::List(inner) => inner.is_artifact(),
            _ => false,
        }
    }

    /// Structural check of an already-coerced value. Sentinels always
    /// pass; they are accounted for separately.
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Unresolved(_) | Value::Invalid(_)) => true,
            (DType::Str | DType::File | DType::Directory | DType::MS, Value::Str(_)) => true,
            (DType::Int, Value::Int(_)) => true,
            (DType::Float, Value::Int(_) | Value::Float(_)) => true,
            (DType::Bool, Value::Bool(_)) => true,
            (DType::List(inner), Value::List(items)) => items.iter().all(|item| inner.check(item)),
            _ => false,
        }
    }

    /// Light coercion applied before checking: numeric and boolean
    /// strings parse, single values wrap into lists.
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (DType::Int, Value::Str(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Str(s),
            },
            (DType::Float, Value::Str(s)) => match s.trim().parse::<f64>() {
                Ok(x) => Value::Float(x),
                Err(_) => Value::Str(s),
            },
            (DType::Bool, Value::Str(s)) => match s.as_str() {
                "true" | "True" | "1" => Value::Bool(true),
                "false" | "False" | "0" => Value::Bool(false),
                _ => Value::Str(s),
            },
            (DType::List(inner), Value::List(items)) => {
                Value::List(items.into_iter().map(|item| inner.coerce(item)).collect())
            }
            (DType::List(inner), value) if value.is_concrete() => {
                Value::List(vec![inner.coerce(value)])
            }
            (_, value) => value,
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(inner) = s.strip_prefix("List[").and_then(|rest| rest.strip_suffix(']')) {
            return Ok(DType::List(Box::new(inner.parse()?)));
        }

        match s {
            "str" => Ok(DType::Str),
            "int" => Ok(DType::Int),
            "float" => Ok(DType::Float),
            "bool" => Ok(DType::Bool),
            "File" => Ok(DType::File),
            "Directory" => Ok(DType::Directory),
            "MS" => Ok(DType::MS),
            _ => Err(Error::UnknownDType(s.to_owned())),
        }
    }
}

impl TryFrom<String> for DType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DType> for String {
    fn from(dtype: DType) -> String {
        dtype.to_string()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Str => f.write_str("str"),
            DType::Int => f.write_str("int"),
            DType::Float => f.write_str("float"),
            DType::Bool => f.write_str("bool"),
            DType::File => f.write_str("File"),
            DType::Directory => f.write_str("Directory"),
            DType::MS => f.write_str("MS"),
            DType::List(inner) => write!(f, "List[{inner}]"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Schema {
    pub dtype: DType,
    pub info: Option<String>,
    pub required: bool,
    pub default: Option<Value>,
    pub choices: Option<Vec<Value>>,
    /// A value derived by the cargo itself; the caller must not supply one.
    pub implicit: Option<Value>,
    pub writable: bool,
    /// Step endpoints this recipe-level parameter aliases.
    #[serde(deserialize_with = "string_or_list")]
    pub aliases: Vec<String>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            dtype: DType::Str,
            info: None,
            required: false,
            default: None,
            choices: None,
            implicit: None,
            writable: false,
            aliases: vec![],
        }
    }
}

impl Schema {
    /// A pure alias handle inherits its effective type from the aliased
    /// endpoint: plain `str`, no choices, not writable.
    pub fn is_alias_handle(&self) -> bool {
        self.dtype == DType::Str && self.choices.is_none() && !self.writable
    }
}

/// Deserialize a single string or a sequence of strings as a vec
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Targets {
        Single(String),
        Sequence(Vec<String>),
    }

    match Targets::deserialize(deserializer)? {
        Targets::Single(target) => Ok(vec![target]),
        Targets::Sequence(targets) => Ok(targets),
    }
}

/// Concrete checkers for file-like parameter types.
pub trait TypeRegistry: Send + Sync {
    /// Does a validated value satisfy the dtype?
    fn check(&self, dtype: &DType, value: &Value) -> bool {
        dtype.check(value)
    }

    /// Does the artifact named by an output value exist?
    fn exists(&self, dtype: &DType, value: &Value) -> bool;
}

/// Filesystem-backed registry: files must be files, directories and
/// measurement sets must be directories.
#[derive(Debug, Default)]
pub struct FsTypes;

impl TypeRegistry for FsTypes {
    fn exists(&self, dtype: &DType, value: &Value) -> bool {
        match (dtype, value) {
            (DType::File, Value::Str(path)) => Path::new(path).is_file(),
            (DType::Directory | DType::MS, Value::Str(path)) => Path::new(path).is_dir(),
            (DType::List(inner), Value::List(items)) => {
                items.iter().all(|item| self.exists(inner, item))
            }
            _ => true,
        }
    }
}

pub fn join_quote<I>(names: I) -> String
where
    I: IntoIterator,
    I::Item: fmt::Display,
{
    names.into_iter().map(|name| format!("'{name}'")).join(", ")
}

pub struct Options<'a> {
    /// Missing-required and invalid-required parameters do not raise.
    pub loose: bool,
    /// Enforce artifact existence (output-side validation).
    pub artifacts: bool,
    pub subst: Option<&'a Namespace>,
    pub types: &'a dyn TypeRegistry,
}

/// Validate a parameter batch against its schemas.
///
/// Returns a map parallel to the schemas. Three kinds of entries may
/// appear: concrete typed values, `Value::Unresolved` where substitution
/// did not resolve, and `Value::Invalid` where a check failed. Only
/// missing or invalid *required* parameters raise, and only when
/// `loose` is off.
pub fn validate<'s>(
    schemas: impl IntoIterator<Item = (&'s String, &'s Schema)>,
    params: &IndexMap<String, Value>,
    opts: &Options<'_>,
) -> Result<IndexMap<String, Value>, Error> {
    let mut validated = IndexMap::new();
    let mut missing = vec![];
    let mut unresolved = vec![];
    let mut fatal = vec![];

    for (name, schema) in schemas {
        // implicit parameters may not be supplied from outside; a pending
        // implicit (unresolved marker) materialises from the step side,
        // and a re-validated implicit value is accepted unchanged
        if let Some(implicit) = &schema.implicit {
            let value = match params.get(name) {
                None => expand(implicit.clone(), opts.subst),
                Some(supplied) if implicit.is_unresolved() => supplied.clone(),
                Some(supplied) if supplied.is_unresolved() => {
                    expand(implicit.clone(), opts.subst)
                }
                Some(supplied) => {
                    let expanded = expand(implicit.clone(), opts.subst);
                    if *supplied == expanded {
                        expanded
                    } else {
                        if !opts.loose {
                            fatal.push(name.clone());
                        }
                        validated.insert(
                            name.clone(),
                            Value::Invalid(format!(
                                "implicit parameter '{name}' cannot be assigned"
                            )),
                        );
                        continue;
                    }
                }
            };
            validated.insert(name.clone(), value);
            continue;
        }

        let value = params
            .get(name)
            .cloned()
            .or_else(|| schema.default.clone());

        let Some(value) = value else {
            if schema.required && !opts.loose {
                missing.push(name.clone());
            }
            continue;
        };

        let value = expand(value, opts.subst);
        match &value {
            Value::Unresolved(marker) => {
                // a deferred alias is not an error: the step side holds
                // the value
                if !opts.loose
                    && schema.required
                    && !matches!(marker, Unresolved::DeferredAlias(_))
                {
                    unresolved.push(name.clone());
                }
                validated.insert(name.clone(), value);
                continue;
            }
            Value::Invalid(_) => {
                validated.insert(name.clone(), value);
                if !opts.loose && schema.required {
                    fatal.push(name.clone());
                }
                continue;
            }
            _ => {}
        }

        let value = schema.dtype.coerce(value);
        if !opts.types.check(&schema.dtype, &value) {
            validated.insert(
                name.clone(),
                Value::Invalid(format!("'{value}' is not of type {}", schema.dtype)),
            );
            if !opts.loose && schema.required {
                fatal.push(name.clone());
            }
            continue;
        }

        if schema.writable && !schema.dtype.is_artifact() {
            validated.insert(
                name.clone(),
                Value::Invalid(format!("writable parameter '{name}' must be file-like")),
            );
            if !opts.loose && schema.required {
                fatal.push(name.clone());
            }
            continue;
        }

        if let Some(choices) = &schema.choices {
            if schema.dtype.is_scalar() && !choices.contains(&value) {
                validated.insert(
                    name.clone(),
                    Value::Invalid(format!("'{value}' is not one of {}", join_quote(choices))),
                );
                if !opts.loose && schema.required {
                    fatal.push(name.clone());
                }
                continue;
            }
        }

        if opts.artifacts
            && !opts.loose
            && schema.required
            && schema.dtype.is_artifact()
            && !opts.types.exists(&schema.dtype, &value)
        {
            validated.insert(
                name.clone(),
                Value::Invalid(format!("output '{name}' does not exist")),
            );
            fatal.push(name.clone());
            continue;
        }

        validated.insert(name.clone(), value);
    }

    if !missing.is_empty() {
        return Err(Error::MissingRequired(join_quote(missing)));
    }
    if !unresolved.is_empty() {
        return Err(Error::Unresolved(join_quote(unresolved)));
    }
    if !fatal.is_empty() {
        return Err(Error::Invalid(join_quote(fatal)));
    }

    Ok(validated)
}

/// Expand `{…}`-references in a string value; unresolved references and
/// template errors come back as in-place sentinels.
fn expand(value: Value, ns: Option<&Namespace>) -> Value {
    match (&value, ns) {
        (Value::Str(s), Some(ns)) if subst::has_references(s) => match subst::resolve(s, ns) {
            Ok(resolved) => resolved.into_value(),
            Err(error) => Value::Invalid(error.to_string()),
        },
        _ => value,
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown dtype '{0}'")]
    UnknownDType(String),
    #[error("missing required parameter(s) {0}")]
    MissingRequired(String),
    #[error("unresolved parameter(s) {0}")]
    Unresolved(String),
    #[error("invalid parameter(s) {0}")]
    Invalid(String),
    #[error("unknown parameter(s) {0}")]
    Unknown(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn schemas(yaml: &str) -> IndexMap<String, Schema> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn run(
        schemas: &IndexMap<String, Schema>,
        params: &IndexMap<String, Value>,
        loose: bool,
    ) -> Result<IndexMap<String, Value>, Error> {
        validate(
            schemas.iter(),
            params,
            &Options {
                loose,
                artifacts: false,
                subst: None,
                types: &FsTypes,
            },
        )
    }

    #[test]
    fn dtype_parsing() {
        assert_eq!("str".parse::<DType>().unwrap(), DType::Str);
        assert_eq!(
            "List[File]".parse::<DType>().unwrap(),
            DType::List(Box::new(DType::File))
        );
        assert!("Frob".parse::<DType>().is_err());
        assert_eq!(DType::List(Box::new(DType::Int)).to_string(), "List[int]");
    }

    #[test]
    fn defaults_are_seeded() {
        let schemas = schemas("x: {dtype: int, default: 7}");
        let validated = run(&schemas, &IndexMap::new(), false).unwrap();
        assert_eq!(validated["x"], Value::Int(7));
    }

    #[test]
    fn missing_required_raises_only_when_strict() {
        let schemas = schemas("x: {dtype: str, required: true}");
        assert!(run(&schemas, &IndexMap::new(), true).is_ok());
        assert!(matches!(
            run(&schemas, &IndexMap::new(), false),
            Err(Error::MissingRequired(names)) if names == "'x'"
        ));
    }

    #[test]
    fn invalid_values_are_recorded_in_place() {
        let schemas = schemas("x: {dtype: int}");
        let params = IndexMap::from([("x".to_owned(), Value::Str("nope".into()))]);
        let validated = run(&schemas, &params, true).unwrap();
        assert!(validated["x"].is_invalid());
    }

    #[test]
    fn numeric_strings_coerce() {
        let schemas = schemas("x: {dtype: int}");
        let params = IndexMap::from([("x".to_owned(), Value::Str("42".into()))]);
        let validated = run(&schemas, &params, false).unwrap();
        assert_eq!(validated["x"], Value::Int(42));
    }

    #[test]
    fn single_value_wraps_into_list() {
        let schemas = schemas("x: {dtype: 'List[int]'}");
        let params = IndexMap::from([("x".to_owned(), Value::Int(1))]);
        let validated = run(&schemas, &params, false).unwrap();
        assert_eq!(validated["x"], Value::List(vec![Value::Int(1)]));
    }

    #[test]
    fn choices_are_enforced() {
        let schemas = schemas("x: {dtype: str, choices: [a, b]}");
        let params = IndexMap::from([("x".to_owned(), Value::Str("c".into()))]);
        let validated = run(&schemas, &params, true).unwrap();
        assert!(validated["x"].is_invalid());
    }

    #[test]
    fn implicit_rejects_user_values() {
        let schemas = schemas("x: {dtype: str, implicit: fixed}");
        let params = IndexMap::from([("x".to_owned(), Value::Str("mine".into()))]);
        let validated = run(&schemas, &params, true).unwrap();
        assert!(validated["x"].is_invalid());

        let validated = run(&schemas, &IndexMap::new(), true).unwrap();
        assert_eq!(validated["x"], Value::Str("fixed".into()));
    }

    #[test]
    fn substitutions_expand_and_poison() {
        let mut recipe = Namespace::new();
        recipe.insert("x", "Y");
        let mut ns = Namespace::new();
        ns.add_ns("recipe", recipe);

        let schemas = schemas("a: {dtype: str}\nb: {dtype: str}");
        let params = IndexMap::from([
            ("a".to_owned(), Value::Str("pre-{recipe.x}".into())),
            ("b".to_owned(), Value::Str("{recipe.gone}".into())),
        ]);
        let validated = validate(
            schemas.iter(),
            &params,
            &Options {
                loose: true,
                artifacts: false,
                subst: Some(&ns),
                types: &FsTypes,
            },
        )
        .unwrap();

        assert_eq!(validated["a"], Value::Str("pre-Y".into()));
        assert!(validated["b"].is_unresolved());
    }

    #[test]
    fn required_unresolved_raises_only_when_strict() {
        let mut ns = Namespace::new();
        ns.add_ns("recipe", Namespace::new());

        let schemas = schemas("x: {dtype: str, required: true}");
        let params = IndexMap::from([("x".to_owned(), Value::Str("{recipe.gone}".into()))]);

        let loose = validate(
            schemas.iter(),
            &params,
            &Options {
                loose: true,
                artifacts: false,
                subst: Some(&ns),
                types: &FsTypes,
            },
        )
        .unwrap();
        assert!(loose["x"].is_unresolved());

        assert!(matches!(
            validate(
                schemas.iter(),
                &params,
                &Options {
                    loose: false,
                    artifacts: false,
                    subst: Some(&ns),
                    types: &FsTypes,
                },
            ),
            Err(Error::Unresolved(_))
        ));
    }

    #[test]
    fn output_artifacts_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present");
        std::fs::write(&present, "x").unwrap();

        let schemas = schemas("out: {dtype: File, required: true}");
        let mut params = IndexMap::from([(
            "out".to_owned(),
            Value::Str(present.display().to_string()),
        )]);
        let opts = Options {
            loose: false,
            artifacts: true,
            subst: None,
            types: &FsTypes,
        };
        assert!(validate(schemas.iter(), &params, &opts).is_ok());

        params["out"] = Value::Str(dir.path().join("absent").display().to_string());
        assert!(matches!(
            validate(schemas.iter(), &params, &opts),
            Err(Error::Invalid(_))
        ));
    }
}
