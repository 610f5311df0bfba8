//! Property maps attached to services, listeners and capabilities.

use std::collections::{btree_map, BTreeMap};
use std::fmt;

use crate::version::Version;

/// Interface names a service is registered under.
pub const OBJECT_CLASS: &str = "objectClass";
/// Registry-assigned, strictly increasing service id.
pub const SERVICE_ID: &str = "service.id";
/// `singleton`, `module` or `prototype`.
pub const SERVICE_SCOPE: &str = "service.scope";
/// Id of the module that registered the service.
pub const SERVICE_MODULE_ID: &str = "service.module.id";
/// Ranking used to order lookups; higher first, defaults to 0.
pub const SERVICE_RANKING: &str = "service.ranking";
/// Persistent identity used to pull configuration for the service.
pub const SERVICE_PID: &str = "service.pid";
pub const SERVICE_FACTORY_PID: &str = "service.factoryPid";

/// A single property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Version(Version),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            PropertyValue::Long(v) => Some(*v),
            PropertyValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Scalar values as a one-element slice, lists as their elements.
    pub fn values(&self) -> &[PropertyValue] {
        match self {
            PropertyValue::List(items) => items,
            scalar => std::slice::from_ref(scalar),
        }
    }

    /// All scalar values rendered as strings.
    pub fn to_strings(&self) -> Vec<String> {
        self.values().iter().map(|v| v.to_string()).collect()
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => f.write_str(s),
            PropertyValue::Long(v) => write!(f, "{v}"),
            PropertyValue::Double(v) => write!(f, "{v}"),
            PropertyValue::Boolean(v) => write!(f, "{v}"),
            PropertyValue::Version(v) => write!(f, "{v}"),
            PropertyValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Long(i64::from(v))
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        i64::try_from(v)
            .map(PropertyValue::Long)
            .unwrap_or_else(|_| PropertyValue::String(v.to_string()))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

impl From<Version> for PropertyValue {
    fn from(v: Version) -> Self {
        PropertyValue::Version(v)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(v: Vec<T>) -> Self {
        PropertyValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Ordered, case-sensitive property map.
///
/// Registrations hold their map behind an `Arc` and never mutate it in place;
/// a change produces a new map (a new generation).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PropertyValue::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, PropertyValue> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry of `other` over this map.
    pub fn merge(&mut self, other: &Properties) {
        for (k, v) in other.iter() {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// The interface names from `objectClass`.
    pub fn object_class(&self) -> Vec<String> {
        self.get(OBJECT_CLASS)
            .map(PropertyValue::to_strings)
            .unwrap_or_default()
    }

    pub fn service_id(&self) -> Option<u64> {
        self.get(SERVICE_ID)
            .and_then(PropertyValue::as_long)
            .and_then(|v| u64::try_from(v).ok())
    }

    pub fn ranking(&self) -> i64 {
        self.get(SERVICE_RANKING)
            .and_then(PropertyValue::as_long)
            .unwrap_or(0)
    }

    /// Configuration pids this map asks to be merged, `service.pid` first.
    pub fn config_pids(&self) -> Vec<String> {
        [SERVICE_PID, SERVICE_FACTORY_PID]
            .iter()
            .filter_map(|k| self.get(k))
            .flat_map(PropertyValue::to_strings)
            .collect()
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut p = Properties::new();
        for (k, v) in iter {
            p.insert(k, v);
        }
        p
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = (&'a String, &'a PropertyValue);
    type IntoIter = btree_map::Iter<'a, String, PropertyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_sensitive() {
        let p = Properties::new().with("Lang", "en").with("lang", "fr");
        assert_eq!(p.get_str("Lang"), Some("en"));
        assert_eq!(p.get_str("lang"), Some("fr"));
        assert_eq!(p.get_str("LANG"), None);
    }

    #[test]
    fn reserved_accessors() {
        let p = Properties::new()
            .with(OBJECT_CLASS, vec!["a.A", "b.B"])
            .with(SERVICE_ID, 7i64)
            .with(SERVICE_RANKING, "5")
            .with(SERVICE_PID, "cfg.one");
        assert_eq!(p.object_class(), vec!["a.A".to_string(), "b.B".to_string()]);
        assert_eq!(p.service_id(), Some(7));
        assert_eq!(p.ranking(), 5);
        assert_eq!(p.config_pids(), vec!["cfg.one".to_string()]);
    }

    #[test]
    fn ranking_defaults_to_zero() {
        assert_eq!(Properties::new().ranking(), 0);
    }
}
