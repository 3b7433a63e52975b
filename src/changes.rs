//! The set of changes carried by a single write request.

use std::collections::btree_map::{self, BTreeMap};
use std::iter::FromIterator;
use std::mem;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A set of key/value changes waiting to be sent to the server together. A
/// `null` value asks the server to remove the user's value for that key.
///
/// Each key appears at most once; queueing a key that is already present
/// replaces its value, so the last write before the batch is sent wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    values: BTreeMap<String, Value>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a change to this set, replacing any earlier change to the same
    /// key. Returns the replaced value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    /// Check if there are any changes in this set
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get the number of distinct keys in this set
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterate over the changes in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.values.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + Clone {
        self.values.keys().map(String::as_str)
    }

    /// Take the changes out of this set, leaving it empty. Used when a
    /// pending batch is captured for sending.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            values: mem::take(&mut self.values),
        }
    }
}

impl IntoIterator for ChangeSet {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut changes = Self::new();
        iter.into_iter()
            .for_each(|(key, value)| drop(changes.insert(key, value)));
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_write_wins() {
        let mut changes = ChangeSet::new();
        assert_eq!(changes.insert("a", json!(1)), None);
        changes.insert("b", json!(2));
        assert_eq!(changes.insert("a", json!(3)), Some(json!(1)));

        assert_eq!(changes.len(), 2);
        assert_eq!(changes.get("a"), Some(&json!(3)));
        assert_eq!(changes.keys().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn take_leaves_an_empty_set() {
        let mut changes: ChangeSet = vec![("a", json!(1))].into_iter().collect();
        let taken = changes.take();

        assert!(changes.is_empty());
        assert_eq!(taken.len(), 1);
    }

    #[test]
    fn serializes_as_a_plain_object() {
        let changes: ChangeSet = vec![("a", json!(1)), ("b", Value::Null)]
            .into_iter()
            .collect();

        assert_eq!(
            serde_json::to_value(&changes).unwrap(),
            json!({"a": 1, "b": null})
        );
    }
}
