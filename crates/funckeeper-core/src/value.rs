//! Storage-safe capture of call arguments and return values.
//!
//! Every captured value is first lowered into a [`CallValue`] and then
//! rendered by [`serialize`] into a JSON tree that can always be written as
//! text. Values without a structured form keep only their string rendering.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display};
use std::hash::BuildHasher;

use serde::Serialize;
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum CallValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Seq(Vec<CallValue>),
    Map(Vec<(CallValue, CallValue)>),
    /// String rendering of a value that has no structured form.
    Opaque(String),
}

impl CallValue {
    #[must_use]
    pub fn opaque(value: &impl Display) -> Self {
        Self::Opaque(value.to_string())
    }

    #[must_use]
    pub fn debugged(value: &impl Debug) -> Self {
        Self::Opaque(format!("{value:?}"))
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        serialize(self)
    }
}

/// Renders a captured value as a JSON tree.
///
/// Primitives pass through, sequences map element-wise, mapping keys are
/// coerced to strings, and everything else keeps its string form.
#[must_use]
pub fn serialize(value: &CallValue) -> Value {
    match value {
        CallValue::Null => Value::Null,
        CallValue::Bool(flag) => Value::Bool(*flag),
        CallValue::Int(number) => Value::from(*number),
        CallValue::UInt(number) => Value::from(*number),
        CallValue::Float(number) => match Number::from_f64(*number) {
            Some(finite) => Value::Number(finite),
            None => {
                tracing::debug!(value = %number, "non-finite float stored as text");
                Value::String(number.to_string())
            }
        },
        CallValue::Str(text) | CallValue::Opaque(text) => Value::String(text.clone()),
        CallValue::Seq(items) => Value::Array(items.iter().map(serialize).collect()),
        CallValue::Map(entries) => {
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(coerce_key(key), serialize(item));
            }
            Value::Object(map)
        }
    }
}

fn coerce_key(key: &CallValue) -> String {
    match key {
        CallValue::Null => "null".to_string(),
        CallValue::Bool(flag) => flag.to_string(),
        CallValue::Int(number) => number.to_string(),
        CallValue::UInt(number) => number.to_string(),
        CallValue::Float(number) => number.to_string(),
        CallValue::Str(text) | CallValue::Opaque(text) => text.clone(),
        CallValue::Seq(_) | CallValue::Map(_) => serialize(key).to_string(),
    }
}

impl From<Value> for CallValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => {
                if let Some(signed) = number.as_i64() {
                    Self::Int(signed)
                } else if let Some(unsigned) = number.as_u64() {
                    Self::UInt(unsigned)
                } else {
                    number
                        .as_f64()
                        .map_or_else(|| Self::Str(number.to_string()), Self::Float)
                }
            }
            Value::String(text) => Self::Str(text),
            Value::Array(items) => Self::Seq(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(key, item)| (Self::Str(key), Self::from(item)))
                    .collect(),
            ),
        }
    }
}

pub trait ToCallValue {
    fn to_call_value(&self) -> CallValue;
}

macro_rules! integer_values {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToCallValue for $ty {
                #[allow(irrefutable_let_patterns)]
                fn to_call_value(&self) -> CallValue {
                    if let Ok(signed) = i64::try_from(*self) {
                        CallValue::Int(signed)
                    } else if let Ok(unsigned) = u64::try_from(*self) {
                        CallValue::UInt(unsigned)
                    } else {
                        CallValue::Opaque(self.to_string())
                    }
                }
            }
        )*
    };
}

integer_values!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl ToCallValue for f32 {
    fn to_call_value(&self) -> CallValue {
        CallValue::Float(f64::from(*self))
    }
}

impl ToCallValue for f64 {
    fn to_call_value(&self) -> CallValue {
        CallValue::Float(*self)
    }
}

impl ToCallValue for bool {
    fn to_call_value(&self) -> CallValue {
        CallValue::Bool(*self)
    }
}

impl ToCallValue for char {
    fn to_call_value(&self) -> CallValue {
        CallValue::Str(self.to_string())
    }
}

impl ToCallValue for str {
    fn to_call_value(&self) -> CallValue {
        CallValue::Str(self.to_string())
    }
}

impl ToCallValue for String {
    fn to_call_value(&self) -> CallValue {
        CallValue::Str(self.clone())
    }
}

impl ToCallValue for () {
    fn to_call_value(&self) -> CallValue {
        CallValue::Null
    }
}

impl ToCallValue for CallValue {
    fn to_call_value(&self) -> CallValue {
        self.clone()
    }
}

impl ToCallValue for Value {
    fn to_call_value(&self) -> CallValue {
        CallValue::from(self.clone())
    }
}

impl<T: ToCallValue + ?Sized> ToCallValue for &T {
    fn to_call_value(&self) -> CallValue {
        (**self).to_call_value()
    }
}

impl<T: ToCallValue + ?Sized> ToCallValue for Box<T> {
    fn to_call_value(&self) -> CallValue {
        (**self).to_call_value()
    }
}

impl<T: ToCallValue> ToCallValue for Option<T> {
    fn to_call_value(&self) -> CallValue {
        match self {
            Some(inner) => inner.to_call_value(),
            None => CallValue::Null,
        }
    }
}

impl<T: ToCallValue> ToCallValue for [T] {
    fn to_call_value(&self) -> CallValue {
        CallValue::Seq(self.iter().map(ToCallValue::to_call_value).collect())
    }
}

impl<T: ToCallValue, const N: usize> ToCallValue for [T; N] {
    fn to_call_value(&self) -> CallValue {
        self.as_slice().to_call_value()
    }
}

impl<T: ToCallValue> ToCallValue for Vec<T> {
    fn to_call_value(&self) -> CallValue {
        self.as_slice().to_call_value()
    }
}

impl<K: ToCallValue, V: ToCallValue, S: BuildHasher> ToCallValue for HashMap<K, V, S> {
    fn to_call_value(&self) -> CallValue {
        CallValue::Map(
            self.iter()
                .map(|(key, item)| (key.to_call_value(), item.to_call_value()))
                .collect(),
        )
    }
}

impl<K: ToCallValue, V: ToCallValue> ToCallValue for BTreeMap<K, V> {
    fn to_call_value(&self) -> CallValue {
        CallValue::Map(
            self.iter()
                .map(|(key, item)| (key.to_call_value(), item.to_call_value()))
                .collect(),
        )
    }
}

macro_rules! tuple_values {
    ($(($($name:ident),+)),+ $(,)?) => {
        $(
            impl<$($name: ToCallValue),+> ToCallValue for ($($name,)+) {
                #[allow(non_snake_case)]
                fn to_call_value(&self) -> CallValue {
                    let ($($name,)+) = self;
                    CallValue::Seq(vec![$($name.to_call_value()),+])
                }
            }
        )+
    };
}

tuple_values!(
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
    (A, B, C, D, E),
    (A, B, C, D, E, F),
    (A, B, C, D, E, F, G),
    (A, B, C, D, E, F, G, H),
);

/// Captures a value through its `Display` form.
#[derive(Debug, Clone, Copy)]
pub struct Opaque<T>(pub T);

impl<T: Display> ToCallValue for Opaque<T> {
    fn to_call_value(&self) -> CallValue {
        CallValue::opaque(&self.0)
    }
}

/// Captures a value through its `Debug` form.
#[derive(Debug, Clone, Copy)]
pub struct Debugged<T>(pub T);

impl<T: Debug> ToCallValue for Debugged<T> {
    fn to_call_value(&self) -> CallValue {
        CallValue::debugged(&self.0)
    }
}

/// Captures a value through its `serde` representation, falling back to its
/// `Debug` form when serialization fails.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(pub T);

impl<T: Serialize + Debug> ToCallValue for Json<T> {
    fn to_call_value(&self) -> CallValue {
        match serde_json::to_value(&self.0) {
            Ok(value) => CallValue::from(value),
            Err(err) => {
                tracing::debug!(error = %err, "serde capture failed; storing debug form");
                CallValue::debugged(&self.0)
            }
        }
    }
}

/// Positional and keyword arguments of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<CallValue>,
    pub keyword: Vec<(String, CallValue)>,
}

impl CallArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, value: impl ToCallValue) -> Self {
        self.positional.push(value.to_call_value());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl ToCallValue) -> Self {
        self.keyword.push((name.into(), value.to_call_value()));
        self
    }

    #[must_use]
    pub fn args_json(&self) -> Value {
        Value::Array(self.positional.iter().map(serialize).collect())
    }

    #[must_use]
    pub fn kwargs_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.keyword {
            map.insert(name.clone(), serialize(value));
        }
        Value::Object(map)
    }

    /// The `{"args": [...], "kwargs": {...}}` snapshot kept on failed calls.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let mut map = Map::new();
        map.insert("args".to_string(), self.args_json());
        map.insert("kwargs".to_string(), self.kwargs_json());
        Value::Object(map)
    }
}

pub trait ToCallArgs {
    fn to_call_args(&self) -> CallArgs;
}

impl ToCallArgs for CallArgs {
    fn to_call_args(&self) -> CallArgs {
        self.clone()
    }
}

impl ToCallArgs for () {
    fn to_call_args(&self) -> CallArgs {
        CallArgs::default()
    }
}

/// A bare value is a single positional argument.
impl<T: ToCallValue + ?Sized> ToCallArgs for &T {
    fn to_call_args(&self) -> CallArgs {
        CallArgs::new().arg(*self)
    }
}

macro_rules! single_args {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToCallArgs for $ty {
                fn to_call_args(&self) -> CallArgs {
                    CallArgs::new().arg(self)
                }
            }
        )*
    };
}

single_args!(
    bool, char, f32, f64, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, String,
);

impl<T: ToCallValue> ToCallArgs for Vec<T> {
    fn to_call_args(&self) -> CallArgs {
        CallArgs::new().arg(self)
    }
}

impl<T: ToCallValue> ToCallArgs for Option<T> {
    fn to_call_args(&self) -> CallArgs {
        CallArgs::new().arg(self)
    }
}

macro_rules! tuple_args {
    ($(($($name:ident),+)),+ $(,)?) => {
        $(
            impl<$($name: ToCallValue),+> ToCallArgs for ($($name,)+) {
                #[allow(non_snake_case)]
                fn to_call_args(&self) -> CallArgs {
                    let ($($name,)+) = self;
                    CallArgs {
                        positional: vec![$($name.to_call_value()),+],
                        keyword: Vec::new(),
                    }
                }
            }
        )+
    };
}

tuple_args!(
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
    (A, B, C, D, E),
    (A, B, C, D, E, F),
    (A, B, C, D, E, F, G),
    (A, B, C, D, E, F, G, H),
);
