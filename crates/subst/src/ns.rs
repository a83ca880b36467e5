// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use indexmap::IndexMap;

use crate::Value;

/// A hierarchical namespace evaluated by `{…}`-references.
///
/// Interior nodes are labelled maps, leaves are [`Value`]s. A sub-namespace
/// may be marked `nosubst`: string values fetched from inside it are not
/// themselves re-expanded, which keeps references into raw config from
/// recursing forever.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    entries: IndexMap<String, Entry>,
}

#[derive(Debug, Clone)]
pub enum Entry {
    Value(Value),
    Ns { ns: Namespace, nosubst: bool },
}

impl Entry {
    /// Build an entry from an arbitrary YAML node: mappings become
    /// sub-namespaces, everything else a leaf value.
    pub fn from_yaml(value: &serde_yaml::Value) -> Entry {
        match value {
            serde_yaml::Value::Mapping(map) => {
                let mut ns = Namespace::new();
                for (key, value) in map {
                    if let Some(key) = key.as_str() {
                        ns.entries.insert(key.to_owned(), Entry::from_yaml(value));
                    }
                }
                Entry::Ns { ns, nosubst: false }
            }
            other => Entry::Value(Value::from_yaml(other)),
        }
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), Entry::Value(value.into()));
    }

    pub fn add_ns(&mut self, key: impl Into<String>, ns: Namespace) {
        self.entries.insert(key.into(), Entry::Ns { ns, nosubst: false });
    }

    pub fn add_ns_nosubst(&mut self, key: impl Into<String>, ns: Namespace) {
        self.entries.insert(key.into(), Entry::Ns { ns, nosubst: true });
    }

    pub fn add_entry(&mut self, key: impl Into<String>, entry: Entry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        match self.entries.get(key) {
            Some(Entry::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub fn ns(&self, key: &str) -> Option<&Namespace> {
        match self.entries.get(key) {
            Some(Entry::Ns { ns, .. }) => Some(ns),
            _ => None,
        }
    }

    pub fn ns_mut(&mut self, key: &str) -> Option<&mut Namespace> {
        match self.entries.get_mut(key) {
            Some(Entry::Ns { ns, .. }) => Some(ns),
            _ => None,
        }
    }

    /// Build a flat namespace from a parameter map.
    pub fn from_values(values: &IndexMap<String, Value>) -> Namespace {
        let mut ns = Namespace::new();
        ns.merge_values(values);
        ns
    }

    /// Overwrite leaves from a parameter map.
    pub fn merge_values(&mut self, values: &IndexMap<String, Value>) {
        for (key, value) in values {
            self.insert(key.clone(), value.clone());
        }
    }

    /// Walk a dotted path down to a leaf. Returns the leaf and whether any
    /// namespace on the way was marked `nosubst`; errors carry a reason
    /// usable in an unresolved marker.
    pub fn walk(&self, path: &[&str]) -> Result<(&Value, bool), String> {
        let mut current = self;
        let mut nosubst = false;

        for (i, segment) in path.iter().enumerate() {
            let last = i + 1 == path.len();
            match current.entries.get(*segment) {
                None => return Err(format!("'{segment}' is not defined")),
                Some(Entry::Value(value)) => {
                    if last {
                        return Ok((value, nosubst));
                    }
                    return Err(format!("'{segment}' is not a namespace"));
                }
                Some(Entry::Ns { ns, nosubst: flag }) => {
                    if last {
                        return Err(format!("'{segment}' is not a value"));
                    }
                    nosubst |= flag;
                    current = ns;
                }
            }
        }

        Err("empty reference".into())
    }

    /// Set a leaf at a dotted path. Intermediate namespaces must already
    /// exist; the final key may be new.
    pub fn set_path(&mut self, path: &[&str], value: Value) -> Result<(), String> {
        let Some((last, dirs)) = path.split_last() else {
            return Err("empty path".into());
        };

        let mut current = self;
        for segment in dirs {
            current = current
                .ns_mut(segment)
                .ok_or_else(|| format!("'{segment}' is not a valid section"))?;
        }
        current.insert(*last, value);

        Ok(())
    }
}
