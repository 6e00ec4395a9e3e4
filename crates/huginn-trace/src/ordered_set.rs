//! Insertion-ordered, key-deduplicated sets.

use std::collections::HashMap;
use std::hash::Hash;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::ids::SpanId;

/// Values stored in an [`OrderedSet`] expose their deduplication key.
pub trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

impl Keyed for SpanId {
    type Key = SpanId;

    fn key(&self) -> SpanId {
        *self
    }
}

impl Keyed for String {
    type Key = String;

    fn key(&self) -> String {
        self.clone()
    }
}

/// A set that iterates in insertion order with O(1) membership tests.
///
/// Removal splices the order vector and is O(n).
#[derive(Debug, Clone)]
pub struct OrderedSet<V: Keyed> {
    order: Vec<V>,
    map: HashMap<V::Key, usize>,
}

/// The set type used for span relationships.
pub type SpanSet = OrderedSet<SpanId>;

impl<V: Keyed> Default for OrderedSet<V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            map: HashMap::new(),
        }
    }
}

impl<V: Keyed + Clone> OrderedSet<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` unless its key is already present. Returns whether the
    /// set changed.
    pub fn add(&mut self, value: V) -> bool {
        let key = value.key();
        if self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(key, self.order.len());
        self.order.push(value);
        true
    }

    /// Remove the value with the same key. Returns whether the set changed.
    pub fn remove(&mut self, value: &V) -> bool {
        let Some(idx) = self.map.remove(&value.key()) else {
            return false;
        };
        self.order.remove(idx);
        for pos in self.map.values_mut() {
            if *pos > idx {
                *pos -= 1;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.map.clear();
    }

    pub fn contains(&self, value: &V) -> bool {
        self.map.contains_key(&value.key())
    }

    pub fn contains_key(&self, key: &V::Key) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Values in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, V> {
        self.order.iter()
    }

    pub fn as_slice(&self) -> &[V] {
        &self.order
    }
}

impl<'a, V: Keyed> IntoIterator for &'a OrderedSet<V> {
    type Item = &'a V;
    type IntoIter = std::slice::Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}

impl<V: Keyed + Clone> FromIterator<V> for OrderedSet<V> {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        let mut set = Self::new();
        for value in iter {
            set.add(value);
        }
        set
    }
}

impl<V: Keyed + Serialize> Serialize for OrderedSet<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.order.len()))?;
        for value in &self.order {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de, V: Keyed + Clone + Deserialize<'de>> Deserialize<'de> for OrderedSet<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<V>::deserialize(deserializer)?;
        Ok(values.into_iter().collect())
    }
}
