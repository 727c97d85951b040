/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Open-ended scalar key/value storage for truly free-form device attributes.
//!
//! Everything that has a known shape lives as a typed field on `Device` or
//! `DeviceGroup` directly (see the `gateway` crate); this bag only backs the
//! open-ended `properties` map a device can carry beyond those fixed fields.

use std::collections::BTreeMap;

/// A scalar value that can be attached to a device as a free-form property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

/// An ordered bag of scalar properties, keyed by name.
///
/// `BTreeMap` rather than `HashMap` so that a snapshot's `iter()` order is
/// stable, which keeps `Device` snapshots deterministic for tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag(BTreeMap<String, PropertyValue>);

impl PropertyBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_roundtrip() {
        let mut bag = PropertyBag::new();
        bag.set("firmware", "1.2.3");
        bag.set("rssi", -72i64);
        bag.set("charging", true);

        assert_eq!(bag.get("firmware"), Some(&PropertyValue::Text("1.2.3".into())));
        assert_eq!(bag.get("rssi"), Some(&PropertyValue::Int(-72)));
        assert_eq!(bag.len(), 3);

        assert_eq!(bag.remove("rssi"), Some(PropertyValue::Int(-72)));
        assert_eq!(bag.get("rssi"), None);
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn iteration_order_is_stable() {
        let mut bag = PropertyBag::new();
        bag.set("b", 1i64);
        bag.set("a", 2i64);
        let keys: Vec<_> = bag.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
