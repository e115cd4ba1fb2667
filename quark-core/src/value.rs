//! Cell values and the structural equality oracle.
//!
//! Every cell in a registry holds a [`Value`]. Structured data lives in
//! [`Value::Data`] as a `serde_json::Value`, which gives deep structural
//! comparison and deep copies for free. Anything else can be stored behind an
//! `Arc` in [`Value::Shared`]; such payloads are immutable, passed around by
//! reference, and compared with `PartialEq` when the constructor captured one
//! or by pointer identity otherwise.
//!
//! [`deep_equal`] is the single oracle used both to suppress no-op writes and
//! to decide whether a selector's dependencies moved since its last run.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StateError};

/// The value held by an atom or selector.
#[derive(Clone, Default)]
pub enum Value {
    /// An async selector that has not resolved yet.
    #[default]
    Unresolved,
    /// Structured data.
    Data(serde_json::Value),
    /// An arbitrary immutable payload.
    Shared(SharedValue),
}

/// Comparison hook captured at construction time for `PartialEq` payloads.
type EqFn = fn(&dyn Any, &dyn Any) -> bool;

fn eq_by_downcast<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// A reference-counted payload stored in [`Value::Shared`].
#[derive(Clone)]
pub struct SharedValue {
    inner: Arc<dyn Any + Send + Sync>,
    eq: Option<EqFn>,
    type_name: &'static str,
}

impl SharedValue {
    /// Payload compared structurally through its `PartialEq` impl.
    pub fn comparable<T>(value: T) -> Self
    where
        T: PartialEq + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(value),
            eq: Some(eq_by_downcast::<T>),
            type_name: type_name::<T>(),
        }
    }

    /// Payload compared by identity only.
    pub fn opaque<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an existing `Arc`, keeping its identity.
    pub fn from_arc<T>(value: Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            inner: value,
            eq: None,
            type_name: type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn ptr_eq(&self, other: &SharedValue) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }

    fn same_as(&self, other: &SharedValue) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match self.eq {
            Some(eq) => eq(&*self.inner, &*other.inner),
            None => false,
        }
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedValue")
            .field("type", &self.type_name)
            .field("comparable", &self.eq.is_some())
            .finish()
    }
}

/// Structural deep equality with an identity fallback.
///
/// Structured data is compared recursively. Shared payloads are equal when
/// they are the same allocation, or when they were built with
/// [`Value::shared`] and their `PartialEq` says so. Values of different
/// variants are never equal.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Unresolved, Value::Unresolved) => true,
        (Value::Data(a), Value::Data(b)) => a == b,
        (Value::Shared(a), Value::Shared(b)) => a.same_as(b),
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        deep_equal(self, other)
    }
}

impl Value {
    pub const NULL: Value = Value::Data(serde_json::Value::Null);

    /// Store a payload compared through `PartialEq`.
    pub fn shared<T>(value: T) -> Self
    where
        T: PartialEq + Send + Sync + 'static,
    {
        Value::Shared(SharedValue::comparable(value))
    }

    /// Store a payload compared by identity.
    pub fn opaque<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Value::Shared(SharedValue::opaque(value))
    }

    /// Convert any serializable type into structured data.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Value::Data(serde_json::to_value(value)?))
    }

    /// Read structured data back into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Value::Data(json) => Ok(serde_json::from_value(json.clone())?),
            other => Err(StateError::Serialization(serde::de::Error::custom(
                format!("{other:?} does not hold structured data"),
            ))),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Value::Unresolved)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Data(serde_json::Value::Null))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(serde_json::Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(serde_json::Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(serde_json::Value::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(serde_json::Value::as_bool)
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Shared(shared) => shared.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unresolved => f.write_str("Unresolved"),
            Value::Data(json) => write!(f, "Data({json})"),
            Value::Shared(shared) => write!(f, "Shared({})", shared.type_name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unresolved => f.write_str("<unresolved>"),
            Value::Data(serde_json::Value::String(s)) => f.write_str(s),
            Value::Data(json) => write!(f, "{json}"),
            Value::Shared(shared) => write!(f, "<{}>", shared.type_name),
        }
    }
}

macro_rules! impl_from_data {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Data(serde_json::Value::from(value))
                }
            }
        )*
    };
}

impl_from_data!(bool, i32, i64, u32, u64, usize, f64, String, &str);

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Data(value)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::NULL
    }
}

impl<T: Into<serde_json::Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Data(serde_json::Value::from(values))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::NULL)
    }
}
