// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cab execution backends.
//!
//! The engine treats cab execution as pluggable: anything implementing
//! [`CabRunner`] can be installed on the [`crate::Context`]. The default
//! [`ProcessRunner`] renders the cab command through the substitution
//! namespace, turns validated parameters into arguments per the cab's
//! policies, and drives the process supervisor, streaming child output
//! into the step's log.

use indexmap::IndexMap;
use subst::{Namespace, Resolved, Value};
use supervise::{Line, LineSink, Supervisor};
use thiserror::Error;

use crate::cargo::Cab;
use crate::logging::Logger;

pub trait CabRunner: Send + Sync {
    /// Execute the cab with validated parameters; returns the exit code.
    /// A non-zero exit is reported as an error unless the backend says
    /// otherwise.
    fn run(
        &self,
        cab: &Cab,
        params: &IndexMap<String, Value>,
        log: &Logger,
        subst: Option<&Namespace>,
    ) -> Result<i32, Error>;
}

/// Default backend: supervised subprocess execution.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Emit periodic CPU/memory samples while the child runs.
    pub report_resources: bool,
}

impl CabRunner for ProcessRunner {
    fn run(
        &self,
        cab: &Cab,
        params: &IndexMap<String, Value>,
        log: &Logger,
        subst: Option<&Namespace>,
    ) -> Result<i32, Error> {
        let (command, options) = build_command(cab, params, subst)?;

        let mut sink = LoggerSink { log: log.clone() };
        let status = Supervisor::new(command)
            .options(options)
            .shell(cab.shell)
            .command_name(log.target())
            .report_resources(self.report_resources)
            .run(&mut sink)?;

        Ok(status)
    }
}

/// Render the command template and append parameter arguments per the
/// cab's policies. Only concrete, non-implicit values are passed.
pub fn build_command(
    cab: &Cab,
    params: &IndexMap<String, Value>,
    subst: Option<&Namespace>,
) -> Result<(String, Vec<String>), Error> {
    if cab.command.is_empty() {
        return Err(Error::EmptyCommand {
            cab: cab.spec.name.clone(),
        });
    }

    let command = match subst {
        Some(ns) if subst::has_references(&cab.command) => {
            match subst::resolve(&cab.command, ns)? {
                Resolved::Value(value) => value.to_string(),
                Resolved::Unresolved(unresolved) => {
                    return Err(Error::UnresolvedCommand {
                        cab: cab.spec.name.clone(),
                        reference: unresolved.to_string(),
                    });
                }
            }
        }
        _ => cab.command.clone(),
    };

    let mut parts = command.split_whitespace().map(str::to_owned);
    let program = parts.next().ok_or_else(|| Error::EmptyCommand {
        cab: cab.spec.name.clone(),
    })?;
    let mut options: Vec<String> = parts.collect();

    let policies = &cab.policies;
    for (name, schema) in cab.spec.inputs_outputs() {
        if schema.implicit.is_some() {
            continue;
        }
        let Some(value) = params.get(name) else {
            continue;
        };
        if !value.is_concrete() {
            continue;
        }

        if policies.positional {
            push_value(&mut options, value);
        } else {
            let option = if policies.replace_underscores {
                name.replace('_', "-")
            } else {
                name.clone()
            };
            match value {
                Value::Bool(true) => options.push(format!("{}{option}", policies.prefix)),
                Value::Bool(false) => {}
                other => {
                    options.push(format!("{}{option}", policies.prefix));
                    push_value(&mut options, other);
                }
            }
        }
    }

    Ok((program, options))
}

fn push_value(options: &mut Vec<String>, value: &Value) {
    match value {
        Value::List(items) => {
            for item in items {
                push_value(options, item);
            }
        }
        other => options.push(other.to_string()),
    }
}

struct LoggerSink {
    log: Logger,
}

impl LineSink for LoggerSink {
    fn dispatch(&mut self, line: Line<'_>, level: log::Level) {
        if line.continuation {
            self.log.log(level, format!("[cont] {}", line.text));
        } else {
            self.log.log(level, line.text);
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cab '{cab}' has no command")]
    EmptyCommand { cab: String },
    #[error("cab '{cab}' command is unresolved: {reference}")]
    UnresolvedCommand { cab: String, reference: String },
    #[error(transparent)]
    Subst(#[from] subst::Error),
    #[error(transparent)]
    Process(#[from] supervise::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cargo::Cab;

    fn cab(yaml: &str) -> Cab {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn params(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn positional_arguments() {
        let cab = cab(
            r#"
command: echo
policies: {positional: true}
inputs:
  msg: {dtype: str, required: true}
"#,
        );
        let (program, options) =
            build_command(&cab, &params(&[("msg", Value::Str("hi".into()))]), None).unwrap();
        assert_eq!(program, "echo");
        assert_eq!(options, vec!["hi"]);
    }

    #[test]
    fn keyword_arguments_and_flags() {
        let cab = cab(
            r#"
command: tool --fixed
inputs:
  count: {dtype: int}
  verbose: {dtype: bool}
  quiet: {dtype: bool}
  items: {dtype: "List[str]"}
"#,
        );
        let (program, options) = build_command(
            &cab,
            &params(&[
                ("count", Value::Int(3)),
                ("verbose", Value::Bool(true)),
                ("quiet", Value::Bool(false)),
                (
                    "items",
                    Value::List(vec![Value::Str("a".into()), Value::Str("b".into())]),
                ),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(program, "tool");
        assert_eq!(
            options,
            vec!["--fixed", "--count", "3", "--verbose", "--items", "a", "b"]
        );
    }

    #[test]
    fn command_templates_resolve() {
        let cab = cab(
            r#"
command: "{config.bindir}/tool"
"#,
        );

        let mut config = Namespace::new();
        config.insert("bindir", "/opt/bin");
        let mut ns = Namespace::new();
        ns.add_ns_nosubst("config", config);

        let (program, _) = build_command(&cab, &IndexMap::new(), Some(&ns)).unwrap();
        assert_eq!(program, "/opt/bin/tool");
    }

    #[test]
    fn unresolved_command_is_fatal() {
        let cab = cab("command: \"{config.missing}/tool\"");
        let result = build_command(&cab, &IndexMap::new(), Some(&Namespace::new()));
        assert!(matches!(result, Err(Error::UnresolvedCommand { .. })));
    }

    #[test]
    fn sentinel_values_are_not_passed() {
        let cab = cab(
            r#"
command: tool
inputs:
  a: {dtype: str}
"#,
        );
        let (_, options) = build_command(
            &cab,
            &params(&[(
                "a",
                Value::Unresolved(subst::Unresolved::Marker("pending".into())),
            )]),
            None,
        )
        .unwrap();
        assert!(options.is_empty());
    }
}
