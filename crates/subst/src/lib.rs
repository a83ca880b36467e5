// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `{a.b.c}`-style template substitution over hierarchical namespaces.
//!
//! A template that consists of a single reference resolves to the
//! referenced value with its native type preserved; any other template
//! splices the display form of each reference into the surrounding text.
//! A reference that cannot be resolved does not fail the call: it yields
//! [`Resolved::Unresolved`] carrying the failing reference, and one such
//! reference anywhere in a template poisons the entire result. Only
//! syntactic errors in the template itself are hard errors.

use nom::{
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::char,
    multi::separated_list1,
    sequence::delimited,
    IResult,
};
use thiserror::Error;

pub use self::ns::{Entry, Namespace};
pub use self::value::{Unresolved, Value};

mod ns;
mod value;

/// Maximum depth of re-expansion through string values that themselves
/// contain references.
pub const MAX_DEPTH: usize = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed {{}}-reference near '{0}'")]
    Syntax(String),
    #[error("substitution recursion exceeded 10 levels resolving '{0}'")]
    Recursion(String),
}

/// Outcome of resolving a template against a namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    Unresolved(Unresolved),
}

impl Resolved {
    pub fn into_value(self) -> Value {
        match self {
            Resolved::Value(value) => value,
            Resolved::Unresolved(unresolved) => Value::Unresolved(unresolved),
        }
    }

    pub fn concrete(self) -> Option<Value> {
        match self {
            Resolved::Value(value) => Some(value),
            Resolved::Unresolved(_) => None,
        }
    }
}

/// Does the text contain anything the resolver would act on?
pub fn has_references(text: &str) -> bool {
    text.contains(['{', '}'])
}

/// Resolve a template against a namespace.
pub fn resolve(text: &str, ns: &Namespace) -> Result<Resolved, Error> {
    resolve_depth(text, ns, 0)
}

fn resolve_depth(text: &str, ns: &Namespace, depth: usize) -> Result<Resolved, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::Recursion(text.to_owned()));
    }

    let tokens = tokenize(text)?;

    // A lone reference keeps the native type of the referenced value
    if let [Token::Reference(path)] = tokens.as_slice() {
        return lookup(path, ns, depth);
    }

    let mut out = String::new();
    for token in &tokens {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Open => out.push('{'),
            Token::Close => out.push('}'),
            Token::Reference(path) => match lookup(path, ns, depth)? {
                Resolved::Value(value) => out.push_str(&value.to_string()),
                unresolved => return Ok(unresolved),
            },
        }
    }

    Ok(Resolved::Value(Value::Str(out)))
}

fn lookup(path: &[&str], ns: &Namespace, depth: usize) -> Result<Resolved, Error> {
    match ns.walk(path) {
        Err(reason) => Ok(Resolved::Unresolved(Unresolved::Reference {
            reference: path.join("."),
            reason,
        })),
        Ok((value, nosubst)) => match value {
            Value::Unresolved(unresolved) => Ok(Resolved::Unresolved(unresolved.clone())),
            Value::Str(s) if !nosubst && has_references(s) => resolve_depth(s, ns, depth + 1),
            other => Ok(Resolved::Value(other.clone())),
        },
    }
}

#[derive(Debug)]
enum Token<'a> {
    Text(&'a str),
    /// `{{`
    Open,
    /// `}}`
    Close,
    Reference(Vec<&'a str>),
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '@'))(input)
}

fn reference(input: &str) -> IResult<&str, Vec<&str>> {
    delimited(char('{'), separated_list1(char('.'), identifier), char('}'))(input)
}

fn plain(input: &str) -> IResult<&str, &str> {
    take_till1(|c| c == '{' || c == '}')(input)
}

fn snippet(input: &str) -> String {
    input.chars().take(24).collect()
}

fn tokenize(input: &str) -> Result<Vec<Token<'_>>, Error> {
    let mut rest = input;
    let mut tokens = vec![];

    while !rest.is_empty() {
        if let Ok((remaining, _)) = tag::<_, _, nom::error::Error<&str>>("{{")(rest) {
            tokens.push(Token::Open);
            rest = remaining;
        } else if let Ok((remaining, _)) = tag::<_, _, nom::error::Error<&str>>("}}")(rest) {
            tokens.push(Token::Close);
            rest = remaining;
        } else if rest.starts_with('{') {
            let (remaining, path) =
                reference(rest).map_err(|_| Error::Syntax(snippet(rest)))?;
            tokens.push(Token::Reference(path));
            rest = remaining;
        } else if rest.starts_with('}') {
            return Err(Error::Syntax(snippet(rest)));
        } else {
            let (remaining, text) = plain(rest).map_err(|_| Error::Syntax(snippet(rest)))?;
            tokens.push(Token::Text(text));
            rest = remaining;
        }
    }

    Ok(tokens)
}
