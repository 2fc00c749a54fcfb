//! Attribute-typed entity model.
//!
//! Everything the orchestrator persists lives in the entity store as a flat
//! list of typed attributes under a stable id and a monotonic revision. The
//! store is type-loose: attributes may repeat (sets are repeated attributes),
//! extra attributes are ignored, and decoders skip entities whose attributes
//! carry an unexpected kind.

use chrono::{DateTime, Utc};
use std::fmt;

/// Entity identifier of the form `kind/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    /// Build an id from a kind and a name.
    pub fn new(kind: &str, name: &str) -> Self {
        Self(format!("{}/{}", kind, name))
    }

    /// Build an id with a random (UUID v4) name.
    pub fn random(kind: &str) -> Self {
        Self::new(kind, &uuid::Uuid::new_v4().to_string())
    }

    /// The kind segment (everything before the first `/`).
    pub fn kind(&self) -> &str {
        self.0.split_once('/').map(|(k, _)| k).unwrap_or(&self.0)
    }

    /// The name segment (everything after the first `/`).
    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Time(DateTime<Utc>),
    Ref(EntityId),
    /// Protocol label, compared as a string.
    Label(String),
    /// Nested component: an attribute list of its own.
    Component(Vec<Attr>),
}

/// A named attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub name: String,
    pub value: Value,
}

impl Attr {
    pub fn str(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Str(value.into()),
        }
    }

    pub fn int(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Int(value),
        }
    }

    pub fn flag(name: &str, value: bool) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Bool(value),
        }
    }

    pub fn time(name: &str, value: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Time(value),
        }
    }

    pub fn reference(name: &str, value: EntityId) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Ref(value),
        }
    }

    pub fn label(key: &str, value: impl Into<String>) -> Self {
        Self {
            name: key.to_string(),
            value: Value::Label(value.into()),
        }
    }

    pub fn component(name: &str, attrs: Vec<Attr>) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Component(attrs),
        }
    }
}

/// Typed lookups over an attribute list.
///
/// Kind mismatches yield `None`; decoders treat that the same as an absent
/// attribute and skip or default per their own contract.
pub trait AttrView {
    fn attrs(&self) -> &[Attr];

    fn get(&self, name: &str) -> Option<&Value> {
        self.attrs().iter().find(|a| a.name == name).map(|a| &a.value)
    }

    fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> {
        self.attrs()
            .iter()
            .filter(move |a| a.name == name)
            .map(|a| &a.value)
    }

    fn str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    fn flag(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(Value::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    fn time(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name) {
            Some(Value::Time(t)) => Some(*t),
            _ => None,
        }
    }

    fn reference(&self, name: &str) -> Option<&EntityId> {
        match self.get(name) {
            Some(Value::Ref(id)) => Some(id),
            _ => None,
        }
    }

    /// All refs stored under `name`, in attribute order.
    fn references(&self, name: &str) -> Vec<EntityId> {
        self.get_all(name)
            .filter_map(|v| match v {
                Value::Ref(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn label(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Label(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// All nested components stored under `name`, in attribute order.
    fn components<'a>(&'a self, name: &'a str) -> Vec<&'a [Attr]> {
        self.get_all(name)
            .filter_map(|v| match v {
                Value::Component(attrs) => Some(attrs.as_slice()),
                _ => None,
            })
            .collect()
    }
}

impl AttrView for [Attr] {
    fn attrs(&self) -> &[Attr] {
        self
    }
}

impl AttrView for Vec<Attr> {
    fn attrs(&self) -> &[Attr] {
        self
    }
}

/// A stored entity: id, write revision, attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub revision: u64,
    pub attrs: Vec<Attr>,
}

impl Entity {
    pub fn kind(&self) -> &str {
        self.id.kind()
    }
}

impl AttrView for Entity {
    fn attrs(&self) -> &[Attr] {
        &self.attrs
    }
}

/// Merge a patch into an attribute list.
///
/// Every attribute name present in the patch replaces all attributes of that
/// name in the base list; names absent from the patch are untouched. This is
/// the `Patch` write semantics, as opposed to `Replace` which swaps the whole
/// list.
pub fn merge_attrs(base: &[Attr], patch: &[Attr]) -> Vec<Attr> {
    let mut merged: Vec<Attr> = base
        .iter()
        .filter(|a| !patch.iter().any(|p| p.name == a.name))
        .cloned()
        .collect();
    merged.extend(patch.iter().cloned());
    merged
}
