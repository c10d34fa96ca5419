//! Owned statement parameters.

use sqlx::any::AnyArguments;
use sqlx::Arguments;

/// One positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL of unknown type. Bound positionally it is sent as a BIGINT NULL, which
    /// PostgreSQL rejects for non-integer columns; [`NamedArgs`](crate::NamedArgs)
    /// writes it into the statement as a literal `NULL` instead.
    Null,
    /// NULL carrying its parameter type; what `None::<T>` converts to.
    TypedNull(ValueType),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Parameter type of a [`Value::TypedNull`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

/// Rust types with a fixed parameter type, so that `None` of them binds as a NULL
/// of that type.
pub trait Param: Into<Value> {
    const TYPE: ValueType;
}

impl Value {
    pub(crate) fn add_to(&self, args: &mut AnyArguments<'_>) -> Result<(), sqlx::error::BoxDynError> {
        match self {
            Value::Null | Value::TypedNull(ValueType::Int) => args.add(Option::<i64>::None),
            Value::TypedNull(ValueType::Bool) => args.add(Option::<bool>::None),
            Value::TypedNull(ValueType::Float) => args.add(Option::<f64>::None),
            Value::TypedNull(ValueType::Text) => args.add(Option::<String>::None),
            Value::TypedNull(ValueType::Bytes) => args.add(Option::<Vec<u8>>::None),
            Value::Bool(v) => args.add(*v),
            Value::Int(v) => args.add(*v),
            Value::Float(v) => args.add(*v),
            Value::Text(v) => args.add(v.clone()),
            Value::Bytes(v) => args.add(v.clone()),
        }
    }

    /// Converts a JSON value; arrays and objects are bound as their JSON text.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        }
    }
}

/// Builds the driver argument buffer for `values`.
pub(crate) fn to_arguments<'q>(values: &[Value]) -> Result<AnyArguments<'q>, sqlx::Error> {
    let mut args = AnyArguments::default();
    for value in values {
        value.add_to(&mut args).map_err(sqlx::Error::Encode)?;
    }
    Ok(args)
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    Vec<u8> => Bytes,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

macro_rules! impl_param {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Param for $ty {
                const TYPE: ValueType = ValueType::$kind;
            }
        )*
    };
}

impl_param! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    &String => Text,
    Vec<u8> => Bytes,
    &[u8] => Bytes,
}

impl<T: Param> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::TypedNull(T::TYPE), Into::into)
    }
}

/// Builds a `Vec<Value>` of positional parameters.
///
/// ```
/// use sqlx_scoped_tx::{args, Value, ValueType};
///
/// let params = args![1, "alice", None::<&str>];
/// assert_eq!(
///     params,
///     vec![Value::Int(1), Value::Text("alice".into()), Value::TypedNull(ValueType::Text)]
/// );
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($value)),+]
    };
}
