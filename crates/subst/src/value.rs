// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use itertools::Itertools;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sentinel for a value whose resolution has not (yet) succeeded.
///
/// `Reference` records a failed `{…}`-substitution. `Marker` is a plain
/// placeholder (e.g. a for-loop input before iteration values are known, or
/// an implicit output pending a step run). `DeferredAlias` marks an alias
/// whose value will be pulled from a step endpoint during the fixed point;
/// the resolver treats it as absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Unresolved {
    Reference { reference: String, reason: String },
    Marker(String),
    DeferredAlias(String),
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unresolved::Reference { reference, reason } => {
                write!(f, "{{{reference}}}: {reason}")
            }
            Unresolved::Marker(marker) => write!(f, "({marker})"),
            Unresolved::DeferredAlias(target) => write!(f, "(deferred alias {target})"),
        }
    }
}

/// A dynamically typed parameter value.
///
/// Besides the concrete scalar and list forms, two sentinel variants flow
/// through parameter maps in place of values: [`Value::Unresolved`] for
/// failed or pending substitutions and [`Value::Invalid`] for values that
/// failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Unresolved(Unresolved),
    Invalid(String),
}

impl Value {
    pub fn is_concrete(&self) -> bool {
        !matches!(self, Value::Unresolved(_) | Value::Invalid(_))
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Value::Unresolved(_))
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Value::Invalid(_))
    }

    /// Truthiness as used by conditionals: false, zero, the empty string
    /// and the empty list are false; sentinels are never true.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty() && s != "false" && s != "False" && s != "0",
            Value::List(items) => !items.is_empty(),
            Value::Unresolved(_) | Value::Invalid(_) => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Unresolved(_) => "unresolved",
            Value::Invalid(_) => "invalid",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "{}", items.iter().map(ToString::to_string).join(","))
            }
            Value::Unresolved(u) => write!(f, "{u}"),
            Value::Invalid(message) => write!(f, "<invalid: {message}>"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Unresolved> for Value {
    fn from(value: Unresolved) -> Self {
        Value::Unresolved(value)
    }
}

impl Value {
    /// Lossy conversion from an arbitrary YAML node. Mappings cannot be
    /// expressed as leaf values and come back as [`Value::Invalid`].
    pub fn from_yaml(value: &serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Value::Str(String::new()),
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_yaml::Value::String(s) => Value::Str(s.clone()),
            serde_yaml::Value::Sequence(items) => {
                Value::List(items.iter().map(Value::from_yaml).collect())
            }
            _ => Value::Invalid("mapping is not a leaf value".into()),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar or a sequence of scalars")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
                Ok(Value::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
                Ok(Value::Int(v as i64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
                Ok(Value::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
                Ok(Value::Str(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
                Ok(Value::Str(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Str(String::new()))
            }

            fn visit_none<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Str(String::new()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = vec![];
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::List(items))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => items.serialize(serializer),
            Value::Unresolved(u) => serializer.serialize_str(&u.to_string()),
            Value::Invalid(message) => serializer.serialize_str(&format!("<invalid: {message}>")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserialize_scalars() {
        let v: Value = serde_yaml::from_str("3").unwrap();
        assert_eq!(v, Value::Int(3));
        let v: Value = serde_yaml::from_str("hello").unwrap();
        assert_eq!(v, Value::Str("hello".into()));
        let v: Value = serde_yaml::from_str("[1, 2, 3]").unwrap();
        assert_eq!(
            v,
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn truthiness() {
        assert!(Value::Int(1).is_true());
        assert!(!Value::Str(String::new()).is_true());
        assert!(!Value::Unresolved(Unresolved::Marker("x".into())).is_true());
    }
}
