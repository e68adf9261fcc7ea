//! Typed operator attributes.
//!
//! Attribute values are a closed set of kinds. A value is decoded into
//! [`AttrValue`] once, when the configuration is deserialized or built, and
//! typed reads borrow straight out of the [`AttrStore`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::OpError;
use crate::tensor::{DataType, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrKind {
    Int32,
    Int64,
    Bool,
    Float,
    Double,
    String,
    Shape,
    DataType,
    ListInt32,
    ListInt64,
    ListFloat,
    ListString,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Float(f32),
    Double(f64),
    String(String),
    Shape(Shape),
    DataType(DataType),
    ListInt32(Vec<i32>),
    ListInt64(Vec<i64>),
    ListFloat(Vec<f32>),
    ListString(Vec<String>),
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Int32(_) => AttrKind::Int32,
            AttrValue::Int64(_) => AttrKind::Int64,
            AttrValue::Bool(_) => AttrKind::Bool,
            AttrValue::Float(_) => AttrKind::Float,
            AttrValue::Double(_) => AttrKind::Double,
            AttrValue::String(_) => AttrKind::String,
            AttrValue::Shape(_) => AttrKind::Shape,
            AttrValue::DataType(_) => AttrKind::DataType,
            AttrValue::ListInt32(_) => AttrKind::ListInt32,
            AttrValue::ListInt64(_) => AttrKind::ListInt64,
            AttrValue::ListFloat(_) => AttrKind::ListFloat,
            AttrValue::ListString(_) => AttrKind::ListString,
        }
    }
}

/// Rust types that can be stored in and read back from an [`AttrValue`].
pub trait AttrType: Sized {
    const KIND: AttrKind;

    fn from_value(value: &AttrValue) -> Option<&Self>;

    fn into_value(self) -> AttrValue;
}

macro_rules! impl_attr_type {
    ($ty:ty, $variant:ident) => {
        impl AttrType for $ty {
            const KIND: AttrKind = AttrKind::$variant;

            fn from_value(value: &AttrValue) -> Option<&Self> {
                match value {
                    AttrValue::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_value(self) -> AttrValue {
                AttrValue::$variant(self)
            }
        }

        impl From<$ty> for AttrValue {
            fn from(value: $ty) -> Self {
                AttrValue::$variant(value)
            }
        }
    };
}

impl_attr_type!(i32, Int32);
impl_attr_type!(i64, Int64);
impl_attr_type!(bool, Bool);
impl_attr_type!(f32, Float);
impl_attr_type!(f64, Double);
impl_attr_type!(String, String);
impl_attr_type!(Shape, Shape);
impl_attr_type!(DataType, DataType);
impl_attr_type!(Vec<i32>, ListInt32);
impl_attr_type!(Vec<i64>, ListInt64);
impl_attr_type!(Vec<f32>, ListFloat);
impl_attr_type!(Vec<String>, ListString);

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

/// Named attribute values of one operator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrStore {
    values: BTreeMap<String, AttrValue>,
}

impl AttrStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous value regardless
    /// of its kind.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get<T: AttrType>(&self, name: &str) -> Result<&T, OpError> {
        let value = self.get_value(name)?;
        T::from_value(value).ok_or_else(|| OpError::AttrTypeMismatch {
            attr: name.to_string(),
            expected: T::KIND,
            actual: value.kind(),
        })
    }

    pub fn get_value(&self, name: &str) -> Result<&AttrValue, OpError> {
        self.values.get(name).ok_or_else(|| OpError::AttrNotFound {
            attr: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn set_then_get_returns_value() {
        let mut store = AttrStore::new();
        store.set("axis", vec![0i32, 2]);
        store.set("keepdims", true);
        store.set("scale", 0.5f32);
        store.set("shape", Shape::from([2, 3]));
        store.set("name", "sum");
        store.set("depth", 3i32);
        store.set("count", 1i64 << 40);
        store.set("eps", 1e-12f64);
        store.set("dtype", DataType::Int64);
        store.set("dims", vec![4i64, -1]);
        store.set("weights", vec![0.25f32, 1.5]);
        store.set("tags", vec!["a".to_string(), "b".to_string()]);

        assert_eq!(store.len(), 12);
        assert_eq!(store.get::<Vec<i32>>("axis").unwrap(), &vec![0, 2]);
        assert!(*store.get::<bool>("keepdims").unwrap());
        assert_eq!(*store.get::<f32>("scale").unwrap(), 0.5);
        assert_eq!(store.get::<Shape>("shape").unwrap(), &Shape::from([2, 3]));
        assert_eq!(store.get::<String>("name").unwrap(), "sum");
        assert_eq!(*store.get::<i32>("depth").unwrap(), 3);
        assert_eq!(*store.get::<i64>("count").unwrap(), 1i64 << 40);
        assert_eq!(*store.get::<f64>("eps").unwrap(), 1e-12);
        assert_eq!(*store.get::<DataType>("dtype").unwrap(), DataType::Int64);
        assert_eq!(store.get::<Vec<i64>>("dims").unwrap(), &vec![4, -1]);
        assert_eq!(store.get::<Vec<f32>>("weights").unwrap(), &vec![0.25, 1.5]);
        assert_eq!(
            store.get::<Vec<String>>("tags").unwrap(),
            &vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn mismatched_type_is_not_coerced() {
        let mut store = AttrStore::new();
        store.set("n", 3i32);

        let err = store.get::<i64>("n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        match err {
            OpError::AttrTypeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, AttrKind::Int64);
                assert_eq!(actual, AttrKind::Int32);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_attr_is_not_found() {
        let store = AttrStore::new();
        assert_eq!(
            store.get::<i32>("missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn set_overwrites_with_different_kind() {
        let mut store = AttrStore::new();
        store.set("v", 1i32);
        store.set("v", "one");
        assert_eq!(store.len(), 1);
        assert!(store.get::<i32>("v").is_err());
        assert_eq!(store.get::<String>("v").unwrap(), "one");
    }

    #[test]
    fn serializes_with_kind_tags() {
        let mut store = AttrStore::new();
        store.set("axis", vec![0i32]);
        let json = serde_json::to_string(&store).unwrap();
        assert_eq!(json, r#"{"axis":{"list_int32":[0]}}"#);
        let back: AttrStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
