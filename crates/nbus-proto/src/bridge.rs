//! The value bridge
//!
//! Two total functions convert between the marshal form and the high-level
//! form, each driven by a type node. Both directions fail with
//! [`ProtoError::SignatureMismatch`] when the value does not fit the node;
//! neither ever panics.
//!
//! Wire conventions (see crate docs): arrays and structs are positional
//! sequences, dicts are sequences of `[key, value]` entry sequences, and a
//! variant is a `[signature, value]` sequence.

use crate::error::{ProtoError, Result};
use crate::signature::{SignatureTree, TypeNode};
use crate::value::{Dict, Value, Variant, WireValue};

/// Translate one marshal-form value into the high-level form.
pub fn wire_to_value(wire: &WireValue, node: &TypeNode) -> Result<Value> {
    match (node, wire) {
        (TypeNode::Byte, WireValue::Byte(v)) => Ok(Value::Byte(*v)),
        (TypeNode::Boolean, WireValue::Bool(v)) => Ok(Value::Bool(*v)),
        (TypeNode::Int16, WireValue::Int16(v)) => Ok(Value::Int16(*v)),
        (TypeNode::UInt16, WireValue::UInt16(v)) => Ok(Value::UInt16(*v)),
        (TypeNode::Int32, WireValue::Int32(v)) => Ok(Value::Int32(*v)),
        (TypeNode::UInt32, WireValue::UInt32(v)) => Ok(Value::UInt32(*v)),
        (TypeNode::Int64, WireValue::Int64(v)) => Ok(Value::Int64(*v)),
        (TypeNode::UInt64, WireValue::UInt64(v)) => Ok(Value::UInt64(*v)),
        (TypeNode::Double, WireValue::Double(v)) => Ok(Value::Double(*v)),
        (TypeNode::String, WireValue::Str(s)) => Ok(Value::Str(s.clone())),
        (TypeNode::ObjectPath, WireValue::Path(s)) => Ok(Value::ObjectPath(s.clone())),
        (TypeNode::Signature, WireValue::Sig(s)) => Ok(Value::Signature(s.clone())),
        (TypeNode::Array(inner), WireValue::Seq(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(wire_to_value(item, inner)?);
            }
            Ok(Value::Array(out))
        }
        (TypeNode::Dict(key, value), WireValue::Seq(entries)) => {
            let mut dict = Dict::new();
            for entry in entries {
                let WireValue::Seq(pair) = entry else {
                    return Err(ProtoError::mismatch("dict entry", entry.kind()));
                };
                let [k, v] = pair.as_slice() else {
                    return Err(ProtoError::mismatch(
                        "two-element dict entry",
                        format!("{}-element sequence", pair.len()),
                    ));
                };
                dict.insert(wire_to_value(k, key)?, wire_to_value(v, value)?);
            }
            Ok(Value::Dict(dict))
        }
        (TypeNode::Struct(fields), WireValue::Seq(items)) => {
            if items.len() != fields.len() {
                return Err(ProtoError::mismatch(
                    format!("{}-field struct", fields.len()),
                    format!("{}-element sequence", items.len()),
                ));
            }
            let mut out = Vec::with_capacity(fields.len());
            for (item, field) in items.iter().zip(fields) {
                out.push(wire_to_value(item, field)?);
            }
            Ok(Value::Struct(out))
        }
        (TypeNode::Variant, WireValue::Seq(pair)) => {
            let [WireValue::Sig(sig), inner] = pair.as_slice() else {
                return Err(ProtoError::mismatch("variant [signature, value]", wire.kind()));
            };
            let node = TypeNode::parse(sig)?;
            let value = wire_to_value(inner, &node)?;
            Ok(Value::Variant(Box::new(Variant::new(node, value))))
        }
        (expected, found) => Err(ProtoError::mismatch(expected.to_string(), found.kind())),
    }
}

/// Translate one high-level value into the marshal form.
///
/// A container already shaped for the node is consumed as-is and never
/// re-wrapped; a bare value supplied where a variant is expected is wrapped
/// by inference.
pub fn value_to_wire(value: &Value, node: &TypeNode) -> Result<WireValue> {
    match (node, value) {
        (TypeNode::Byte, Value::Byte(v)) => Ok(WireValue::Byte(*v)),
        (TypeNode::Boolean, Value::Bool(v)) => Ok(WireValue::Bool(*v)),
        (TypeNode::Int16, Value::Int16(v)) => Ok(WireValue::Int16(*v)),
        (TypeNode::UInt16, Value::UInt16(v)) => Ok(WireValue::UInt16(*v)),
        (TypeNode::Int32, Value::Int32(v)) => Ok(WireValue::Int32(*v)),
        (TypeNode::UInt32, Value::UInt32(v)) => Ok(WireValue::UInt32(*v)),
        (TypeNode::Int64, Value::Int64(v)) => Ok(WireValue::Int64(*v)),
        (TypeNode::UInt64, Value::UInt64(v)) => Ok(WireValue::UInt64(*v)),
        (TypeNode::Double, Value::Double(v)) => Ok(WireValue::Double(*v)),
        (TypeNode::String, Value::Str(s)) => Ok(WireValue::Str(s.clone())),
        (TypeNode::ObjectPath, Value::ObjectPath(s)) => Ok(WireValue::Path(s.clone())),
        (TypeNode::Signature, Value::Signature(s)) => Ok(WireValue::Sig(s.clone())),
        (TypeNode::Array(inner), Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(value_to_wire(item, inner)?);
            }
            Ok(WireValue::Seq(out))
        }
        (TypeNode::Dict(key, value_node), Value::Dict(dict)) => {
            let mut out = Vec::with_capacity(dict.len());
            for (k, v) in dict.iter() {
                out.push(WireValue::Seq(vec![
                    value_to_wire(k, key)?,
                    value_to_wire(v, value_node)?,
                ]));
            }
            Ok(WireValue::Seq(out))
        }
        (TypeNode::Struct(fields), Value::Struct(items)) => {
            if items.len() != fields.len() {
                return Err(ProtoError::mismatch(
                    format!("{}-field struct", fields.len()),
                    format!("{}-field struct", items.len()),
                ));
            }
            let mut out = Vec::with_capacity(fields.len());
            for (item, field) in items.iter().zip(fields) {
                out.push(value_to_wire(item, field)?);
            }
            Ok(WireValue::Seq(out))
        }
        (TypeNode::Variant, Value::Variant(variant)) => {
            let inner = value_to_wire(&variant.value, &variant.node)?;
            Ok(WireValue::Seq(vec![
                WireValue::Sig(variant.node.to_string()),
                inner,
            ]))
        }
        (TypeNode::Variant, bare) => {
            // A bare value where a variant is expected travels under its
            // inferred type.
            let variant = Variant::infer(bare.clone())?;
            value_to_wire(&Value::Variant(Box::new(variant)), node)
        }
        (expected, found) => Err(ProtoError::mismatch(expected.to_string(), found.kind())),
    }
}

/// Translate a whole message body against its signature, marshal → high.
pub fn body_to_values(body: &[WireValue], tree: &SignatureTree) -> Result<Vec<Value>> {
    if body.len() != tree.len() {
        return Err(ProtoError::mismatch(
            format!("{} body elements ({})", tree.len(), tree.text()),
            format!("{} body elements", body.len()),
        ));
    }
    body.iter()
        .zip(&tree.types)
        .map(|(wire, node)| wire_to_value(wire, node))
        .collect()
}

/// Translate a whole message body against its signature, high → marshal.
pub fn values_to_body(values: &[Value], tree: &SignatureTree) -> Result<Vec<WireValue>> {
    if values.len() != tree.len() {
        return Err(ProtoError::mismatch(
            format!("{} body elements ({})", tree.len(), tree.text()),
            format!("{} body elements", values.len()),
        ));
    }
    values
        .iter()
        .zip(&tree.types)
        .map(|(value, node)| value_to_wire(value, node))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value, sig: &str) {
        let node = TypeNode::parse(sig).unwrap();
        let wire = value_to_wire(&value, &node).unwrap();
        let back = wire_to_value(&wire, &node).unwrap();
        assert_eq!(back, value, "round trip through {sig}");
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::UInt16(54827), "q");
        round_trip(Value::Int16(-29786), "n");
        round_trip(Value::UInt32(3_728_666_323), "u");
        round_trip(Value::Int32(-1_829_732_118), "i");
        round_trip(Value::Double(129_387.978_674_2), "d");
        round_trip(Value::Bool(false), "b");
        round_trip(Value::ObjectPath("/path/to/some/dbus/object".into()), "o");
    }

    #[test]
    fn containers_round_trip() {
        round_trip(
            Value::Array(vec![
                "foo".into(),
                "bar".into(),
                "quux".into(),
                "hello, world!".into(),
            ]),
            "as",
        );
        round_trip(
            Value::Struct(vec![true.into(), 42.1089f64.into(), "Just a string...".into()]),
            "(bds)",
        );
        let mut dict = Dict::new();
        dict.insert("a".into(), Value::from(Variant::infer(1u32.into()).unwrap()));
        dict.insert("b".into(), Value::from(Variant::infer("x".into()).unwrap()));
        round_trip(Value::Dict(dict), "a{sv}");
    }

    #[test]
    fn variant_wire_shape() {
        let variant = Value::from(Variant::infer(Value::UInt16(42)).unwrap());
        let wire = value_to_wire(&variant, &TypeNode::Variant).unwrap();
        assert_eq!(
            wire,
            WireValue::Seq(vec![WireValue::Sig("q".into()), WireValue::UInt16(42)])
        );
    }

    #[test]
    fn bare_value_wraps_into_variant() {
        let wire = value_to_wire(&Value::UInt16(7), &TypeNode::Variant).unwrap();
        assert_eq!(
            wire,
            WireValue::Seq(vec![WireValue::Sig("q".into()), WireValue::UInt16(7)])
        );
    }

    #[test]
    fn dict_wire_shape_is_entry_sequences() {
        let mut dict = Dict::new();
        dict.insert("k".into(), Value::UInt32(9));
        let node = TypeNode::parse("a{su}").unwrap();
        let wire = value_to_wire(&Value::Dict(dict), &node).unwrap();
        assert_eq!(
            wire,
            WireValue::Seq(vec![WireValue::Seq(vec![
                WireValue::Str("k".into()),
                WireValue::UInt32(9)
            ])])
        );
    }

    #[test]
    fn mismatch_is_typed() {
        let err = value_to_wire(&Value::Str("x".into()), &TypeNode::UInt32).unwrap_err();
        assert!(matches!(err, ProtoError::SignatureMismatch { .. }));
        let err = wire_to_value(&WireValue::Str("x".into()), &TypeNode::Boolean).unwrap_err();
        assert!(matches!(err, ProtoError::SignatureMismatch { .. }));
    }

    #[test]
    fn body_translation_checks_arity() {
        let tree = SignatureTree::parse("si").unwrap();
        let err = values_to_body(&["only".into()], &tree).unwrap_err();
        assert!(matches!(err, ProtoError::SignatureMismatch { .. }));
        let body =
            values_to_body(&["both".into(), Value::Int32(-1)], &tree).unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(body_to_values(&body, &tree).unwrap()[1], Value::Int32(-1));
    }
}
