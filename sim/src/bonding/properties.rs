//! Typed property bag for domain-specific entity and site data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    Text(String),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

/// Types that can be read back out of a [`PropertyValue`].
///
/// Lookups are exact: an `Int` is not readable as `f32`.
pub trait PropertyType: Sized {
    fn from_property(value: &PropertyValue) -> Option<Self>;
}

macro_rules! property_type {
    ($ty:ty, $variant:ident) => {
        impl PropertyType for $ty {
            fn from_property(value: &PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

property_type!(bool, Bool);
property_type!(i32, Int);
property_type!(f32, Float);
property_type!(f64, Double);
property_type!(String, Text);

/// String-keyed property container. Iteration is in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap {
    values: BTreeMap<String, PropertyValue>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Typed lookup; `None` if missing or stored with another type.
    pub fn get<T: PropertyType>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(T::from_property)
    }

    pub fn get_or<T: PropertyType>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn raw(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
