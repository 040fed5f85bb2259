//! The two value models
//!
//! [`WireValue`] is the positional marshal form handed to a byte codec;
//! [`Value`] is the high-level form handlers and proxies work with. See the
//! crate docs for the shape conventions and [`crate::bridge`] for the
//! conversion functions.

use crate::error::{ProtoError, Result};
use crate::signature::TypeNode;
use std::fmt;

/// Marshal-form value: scalars plus one positional container.
///
/// Containers of every kind (arrays, dict entry lists, structs, variants)
/// flatten to [`WireValue::Seq`]; the signature tree alone decides how a
/// sequence is to be read.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    Path(String),
    Sig(String),
    Seq(Vec<WireValue>),
}

impl WireValue {
    pub fn kind(&self) -> &'static str {
        match self {
            WireValue::Byte(_) => "byte",
            WireValue::Bool(_) => "boolean",
            WireValue::Int16(_) => "int16",
            WireValue::UInt16(_) => "uint16",
            WireValue::Int32(_) => "int32",
            WireValue::UInt32(_) => "uint32",
            WireValue::Int64(_) => "int64",
            WireValue::UInt64(_) => "uint64",
            WireValue::Double(_) => "double",
            WireValue::Str(_) => "string",
            WireValue::Path(_) => "object path",
            WireValue::Sig(_) => "signature",
            WireValue::Seq(_) => "sequence",
        }
    }
}

/// An insertion-ordered mapping with basic-typed keys.
///
/// D-Bus dicts have no inherent order on the wire, but callers observe the
/// order entries were inserted in, so the entries are kept as pairs rather
/// than hashed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Dict::default()
    }

    /// Insert or replace the entry for `key`, keeping first-insertion order.
    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<(Value, Value)> {
        self.entries
    }
}

impl FromIterator<(Value, Value)> for Dict {
    fn from_iter<T: IntoIterator<Item = (Value, Value)>>(iter: T) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// A value together with the type node it travels as.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub node: TypeNode,
    pub value: Value,
}

impl Variant {
    pub fn new(node: TypeNode, value: Value) -> Self {
        Variant { node, value }
    }

    /// Build a variant by inferring the type node from the value.
    ///
    /// Empty arrays and dicts carry no element type and cannot be inferred;
    /// pass an explicit node for those.
    pub fn infer(value: Value) -> Result<Self> {
        let node = value.infer_node()?;
        Ok(Variant { node, value })
    }
}

/// High-level value: native containers with tagged variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Array(Vec<Value>),
    Dict(Dict),
    Struct(Vec<Value>),
    Variant(Box<Variant>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
            Value::Variant(_) => "variant",
        }
    }

    /// Infer the type node this value would travel as.
    ///
    /// Fails for empty arrays and dicts, whose element types are
    /// unknowable, and for heterogeneous arrays.
    pub fn infer_node(&self) -> Result<TypeNode> {
        Ok(match self {
            Value::Byte(_) => TypeNode::Byte,
            Value::Bool(_) => TypeNode::Boolean,
            Value::Int16(_) => TypeNode::Int16,
            Value::UInt16(_) => TypeNode::UInt16,
            Value::Int32(_) => TypeNode::Int32,
            Value::UInt32(_) => TypeNode::UInt32,
            Value::Int64(_) => TypeNode::Int64,
            Value::UInt64(_) => TypeNode::UInt64,
            Value::Double(_) => TypeNode::Double,
            Value::Str(_) => TypeNode::String,
            Value::ObjectPath(_) => TypeNode::ObjectPath,
            Value::Signature(_) => TypeNode::Signature,
            Value::Variant(_) => TypeNode::Variant,
            Value::Struct(fields) => {
                let mut nodes = Vec::with_capacity(fields.len());
                for f in fields {
                    nodes.push(f.infer_node()?);
                }
                TypeNode::Struct(nodes)
            }
            Value::Array(items) => {
                let first = items.first().ok_or_else(|| {
                    ProtoError::MalformedMessage("cannot infer element type of empty array".into())
                })?;
                let node = first.infer_node()?;
                for item in &items[1..] {
                    if item.infer_node()? != node {
                        return Err(ProtoError::MalformedMessage(
                            "heterogeneous array has no single element type".into(),
                        ));
                    }
                }
                TypeNode::Array(Box::new(node))
            }
            Value::Dict(dict) => {
                let (k, v) = dict.iter().next().ok_or_else(|| {
                    ProtoError::MalformedMessage("cannot infer entry type of empty dict".into())
                })?;
                TypeNode::Dict(Box::new(k.infer_node()?), Box::new(v.infer_node()?))
            }
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::UInt16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }

    /// Unwrap one level of variant, if present.
    pub fn into_inner(self) -> Value {
        match self {
            Value::Variant(v) => v.value,
            other => other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::ObjectPath(p) => write!(f, "{p}"),
            Value::Signature(s) => write!(f, "{s}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (k, v)) in dict.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Struct(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ")")
            }
            Value::Variant(v) => write!(f, "<{} {}>", v.node, v.value),
        }
    }
}

macro_rules! value_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for Value {
            fn from(v: $type) -> Value {
                Value::$variant(v)
            }
        }
    };
}

value_from!(u8, Byte);
value_from!(bool, Bool);
value_from!(i16, Int16);
value_from!(u16, UInt16);
value_from!(i32, Int32);
value_from!(u32, UInt32);
value_from!(i64, Int64);
value_from!(u64, UInt64);
value_from!(f64, Double);
value_from!(String, Str);
value_from!(Dict, Dict);

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_owned())
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Value {
        Value::Variant(Box::new(v))
    }
}
