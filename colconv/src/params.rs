//! Named, typed parameter store used to configure layers.
//!
//! A [`Dict`] maps names to [`DictValue`]s. Values are read back through
//! [`FromDictValue`], which only accepts the stored tag or an entry of the
//! explicit compatibility table:
//!
//! | requested            | accepted tags                              |
//! |----------------------|--------------------------------------------|
//! | `i64`, `i32`         | `Int`, `UInt` (if it fits), `Bool` (0 / 1) |
//! | `u64`, `u32`, `usize`| `UInt`, `Int` (if >= 0 and fits), `Bool`   |
//! | `f64`, `f32`         | `Real`                                     |
//! | `bool`               | `Bool`, `Int` / `UInt` (nonzero is true)   |
//! | `String`             | `Text`                                     |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blob::AnyBlob;
use crate::error::{ParamError, ValueError};

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DictValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Real(f64),
    Text(String),
}

impl DictValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "unsigned int",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn get<T: FromDictValue>(&self) -> Result<T, ValueError> {
        T::from_value(self)
    }
}

impl fmt::Display for DictValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

macro_rules! dict_value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for DictValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v as $conv)
                }
            }
        )*
    };
}

dict_value_from! {
    i64 => Int as i64,
    i32 => Int as i64,
    u64 => UInt as u64,
    u32 => UInt as u64,
    f64 => Real as f64,
    f32 => Real as f64,
}

impl From<bool> for DictValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for DictValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for DictValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Type-checked conversion out of a [`DictValue`].
pub trait FromDictValue: Sized {
    const TYPE_NAME: &'static str;

    fn from_value(value: &DictValue) -> Result<Self, ValueError>;
}

fn mismatch<T: FromDictValue>(value: &DictValue) -> ValueError {
    ValueError::TypeMismatch {
        found: value.type_name(),
        requested: T::TYPE_NAME,
    }
}

fn out_of_range<T: FromDictValue>(value: impl fmt::Display) -> ValueError {
    ValueError::OutOfRange {
        value: value.to_string(),
        requested: T::TYPE_NAME,
    }
}

macro_rules! from_dict_integer {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl FromDictValue for $ty {
                const TYPE_NAME: &'static str = $name;

                fn from_value(value: &DictValue) -> Result<Self, ValueError> {
                    match *value {
                        DictValue::Int(v) => <$ty>::try_from(v).map_err(|_| out_of_range::<Self>(v)),
                        DictValue::UInt(v) => <$ty>::try_from(v).map_err(|_| out_of_range::<Self>(v)),
                        DictValue::Bool(v) => Ok(v as $ty),
                        _ => Err(mismatch::<Self>(value)),
                    }
                }
            }
        )*
    };
}

from_dict_integer! {
    i64 => "int",
    i32 => "int",
    u64 => "unsigned int",
    u32 => "unsigned int",
    usize => "unsigned int",
}

impl FromDictValue for f64 {
    const TYPE_NAME: &'static str = "real";

    fn from_value(value: &DictValue) -> Result<Self, ValueError> {
        match *value {
            DictValue::Real(v) => Ok(v),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromDictValue for f32 {
    const TYPE_NAME: &'static str = "real";

    fn from_value(value: &DictValue) -> Result<Self, ValueError> {
        match *value {
            DictValue::Real(v) => Ok(v as f32),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromDictValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_value(value: &DictValue) -> Result<Self, ValueError> {
        match *value {
            DictValue::Bool(v) => Ok(v),
            DictValue::Int(v) => Ok(v != 0),
            DictValue::UInt(v) => Ok(v != 0),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

impl FromDictValue for String {
    const TYPE_NAME: &'static str = "text";

    fn from_value(value: &DictValue) -> Result<Self, ValueError> {
        match value {
            DictValue::Text(v) => Ok(v.clone()),
            _ => Err(mismatch::<Self>(value)),
        }
    }
}

/// Ordered map from parameter names to values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dict {
    entries: BTreeMap<String, DictValue>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&DictValue> {
        self.entries.get(name)
    }

    /// Read a required parameter.
    pub fn get<T: FromDictValue>(&self, name: &str) -> Result<T, ParamError> {
        let value = self
            .entries
            .get(name)
            .ok_or_else(|| ParamError::Missing(name.to_string()))?;
        value.get().map_err(|source| ParamError::Value {
            name: name.to_string(),
            source,
        })
    }

    /// Read an optional parameter, falling back to `default` when absent.
    ///
    /// A present value of an incompatible type is still an error.
    pub fn get_or<T: FromDictValue>(&self, name: &str, default: T) -> Result<T, ParamError> {
        match self.entries.get(name) {
            Some(value) => value.get().map_err(|source| ParamError::Value {
                name: name.to_string(),
                source,
            }),
            None => Ok(default),
        }
    }

    /// Insert or replace a value, returning the previous one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<DictValue>) -> Option<DictValue> {
        self.entries.insert(name.into(), value.into())
    }

    /// Builder-style [`Dict::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<DictValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parameters of a single layer: named values plus its learned blobs.
#[derive(Debug, Clone, Default)]
pub struct LayerParams {
    pub name: String,
    pub dict: Dict,
    /// Weight blob first, optional bias blob second.
    pub learned_blobs: Vec<AnyBlob>,
}

impl LayerParams {
    pub fn new(dict: Dict, learned_blobs: Vec<AnyBlob>) -> Self {
        Self {
            dict,
            learned_blobs,
            ..Default::default()
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.dict.has(name)
    }

    pub fn get<T: FromDictValue>(&self, name: &str) -> Result<T, ParamError> {
        self.dict.get(name)
    }

    pub fn get_or<T: FromDictValue>(&self, name: &str, default: T) -> Result<T, ParamError> {
        self.dict.get_or(name, default)
    }
}
