use std::{
    collections::{btree_map, BTreeMap, HashSet},
    fmt,
};

use serde::{Deserialize, Serialize};

/// Reserved label carrying the tenant an entry should be pushed under.
///
/// Never forwarded to the destination as a label: the batching client strips it and sends it as the tenant header.
pub const TENANT_LABEL: &str = "__tenant_id__";

/// A set of labels attached to a log entry.
///
/// Keys are unique. Iteration order is the lexicographical order of the keys, which gives label sets a stable identity
/// when they are used to group entries into batches.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Creates an empty `LabelSet`.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Returns the value of the given label, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns `true` if the given label is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Inserts a label, returning the previous value if the key was already present.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(key.into(), value.into())
    }

    /// Removes a label, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Returns the number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds every label from `other` whose key is not already present.
    pub fn merge_missing(&mut self, other: &LabelSet) {
        for (key, value) in &other.0 {
            if !self.0.contains_key(key) {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }

    /// Splits this set into the labels whose keys are in `keys` and the remaining ones.
    pub fn partition(self, keys: &HashSet<String>) -> (LabelSet, LabelSet) {
        let (selected, rest) = self.0.into_iter().partition(|(key, _)| keys.contains(key));
        (Self(selected), Self(rest))
    }

    /// Returns the approximate size of the label keys and values, in bytes.
    pub fn size_bytes(&self) -> usize {
        self.0.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for LabelSet {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", key, value)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn display_is_prometheus_like() {
        let set = labels(&[("origin", "seed"), ("namespace", "foo")]);
        assert_eq!(set.to_string(), r#"{namespace="foo", origin="seed"}"#);
        assert_eq!(LabelSet::new().to_string(), "{}");
    }

    #[test]
    fn partition_splits_on_key_membership() {
        let keys = ["namespace", "origin"].iter().map(|s| s.to_string()).collect();
        let set = labels(&[("namespace", "foo"), ("pod_name", "foo"), ("container_name", "bar")]);

        let (selected, rest) = set.partition(&keys);
        assert_eq!(selected, labels(&[("namespace", "foo")]));
        assert_eq!(rest, labels(&[("pod_name", "foo"), ("container_name", "bar")]));
    }

    #[test]
    fn merge_missing_keeps_existing_values() {
        let mut set = labels(&[("job", "custom")]);
        set.merge_missing(&labels(&[("job", "fluent-bit"), ("app", "foo")]));

        assert_eq!(set, labels(&[("job", "custom"), ("app", "foo")]));
    }

    #[test]
    fn serializes_as_a_plain_map() {
        let set = labels(&[("b", "2"), ("a", "1")]);
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"{"a":"1","b":"2"}"#);
    }
}
