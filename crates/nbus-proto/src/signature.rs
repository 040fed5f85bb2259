//! D-Bus signature language
//!
//! A signature string is a sequence of complete type codes. The parser
//! turns it into a tree of [`TypeNode`]s; every other subsystem in the
//! stack is parameterized by these trees rather than by the raw string.
//!
//! Type codes:
//! ```text
//! y b n q i u x t d s o g v    basic + variant
//! aT                           array of T
//! a{KV}                        dict with basic key K and value V
//! (T1..Tn)                     struct
//! ```

use crate::error::{ProtoError, Result};
use std::fmt;

/// Maximum nesting depth accepted by the parser. Matches the D-Bus limit
/// of 32 levels for arrays and 32 for structs combined.
const MAX_DEPTH: usize = 64;

/// A single complete D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeNode {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<TypeNode>),
    Dict(Box<TypeNode>, Box<TypeNode>),
    Struct(Vec<TypeNode>),
}

impl TypeNode {
    /// Parse exactly one complete type from `s`.
    pub fn parse(s: &str) -> Result<Self> {
        let tree = SignatureTree::parse(s)?;
        if tree.types.len() != 1 {
            return Err(ProtoError::signature(s, "expected exactly one complete type"));
        }
        Ok(tree.types.into_iter().next().expect("length checked"))
    }

    /// True for types without children.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            TypeNode::Array(_) | TypeNode::Dict(..) | TypeNode::Struct(_) | TypeNode::Variant
        )
    }

    /// True for arrays, dicts, structs and variants.
    pub fn is_container(&self) -> bool {
        !self.is_basic()
    }

    fn write(&self, out: &mut String) {
        match self {
            TypeNode::Byte => out.push('y'),
            TypeNode::Boolean => out.push('b'),
            TypeNode::Int16 => out.push('n'),
            TypeNode::UInt16 => out.push('q'),
            TypeNode::Int32 => out.push('i'),
            TypeNode::UInt32 => out.push('u'),
            TypeNode::Int64 => out.push('x'),
            TypeNode::UInt64 => out.push('t'),
            TypeNode::Double => out.push('d'),
            TypeNode::String => out.push('s'),
            TypeNode::ObjectPath => out.push('o'),
            TypeNode::Signature => out.push('g'),
            TypeNode::Variant => out.push('v'),
            TypeNode::Array(inner) => {
                out.push('a');
                inner.write(out);
            }
            TypeNode::Dict(key, value) => {
                out.push_str("a{");
                key.write(out);
                value.write(out);
                out.push('}');
            }
            TypeNode::Struct(fields) => {
                out.push('(');
                for f in fields {
                    f.write(out);
                }
                out.push(')');
            }
        }
    }
}

impl fmt::Display for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.write(&mut s);
        f.write_str(&s)
    }
}

/// A validated signature string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Signature(String::new())
    }

    /// Validate and wrap a signature string.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        SignatureTree::parse(&s)?;
        Ok(Signature(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse into a tree.
    pub fn tree(&self) -> SignatureTree {
        SignatureTree::parse(&self.0).expect("signature was validated on construction")
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed signature: an ordered list of complete types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureTree {
    pub types: Vec<TypeNode>,
}

impl SignatureTree {
    /// Parse a signature string into its complete types.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() > 255 {
            return Err(ProtoError::signature(s, "longer than 255 bytes"));
        }
        let chars: Vec<char> = s.chars().collect();
        let mut pos = 0;
        let mut types = Vec::new();
        while pos < chars.len() {
            types.push(parse_one(s, &chars, &mut pos, 0)?);
        }
        Ok(SignatureTree { types })
    }

    /// An empty tree (the empty signature).
    pub fn empty() -> Self {
        SignatureTree { types: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Render back to the signature string.
    pub fn text(&self) -> String {
        let mut s = String::new();
        for t in &self.types {
            t.write(&mut s);
        }
        s
    }

    /// The validated [`Signature`] for this tree.
    pub fn signature(&self) -> Signature {
        Signature(self.text())
    }

    /// Concatenate the complete types of `self` and `other`.
    pub fn concat(mut self, other: SignatureTree) -> SignatureTree {
        self.types.extend(other.types);
        self
    }
}

impl fmt::Display for SignatureTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

fn parse_one(src: &str, chars: &[char], pos: &mut usize, depth: usize) -> Result<TypeNode> {
    if depth > MAX_DEPTH {
        return Err(ProtoError::signature(src, "nesting too deep"));
    }
    let c = *chars
        .get(*pos)
        .ok_or_else(|| ProtoError::signature(src, "truncated type"))?;
    *pos += 1;
    let node = match c {
        'y' => TypeNode::Byte,
        'b' => TypeNode::Boolean,
        'n' => TypeNode::Int16,
        'q' => TypeNode::UInt16,
        'i' => TypeNode::Int32,
        'u' => TypeNode::UInt32,
        'x' => TypeNode::Int64,
        't' => TypeNode::UInt64,
        'd' => TypeNode::Double,
        's' => TypeNode::String,
        'o' => TypeNode::ObjectPath,
        'g' => TypeNode::Signature,
        'v' => TypeNode::Variant,
        'a' => {
            if chars.get(*pos) == Some(&'{') {
                *pos += 1;
                let key = parse_one(src, chars, pos, depth + 1)?;
                if !key.is_basic() {
                    return Err(ProtoError::signature(src, "dict key must be a basic type"));
                }
                let value = parse_one(src, chars, pos, depth + 1)?;
                if chars.get(*pos) != Some(&'}') {
                    return Err(ProtoError::signature(src, "unterminated dict entry"));
                }
                *pos += 1;
                TypeNode::Dict(Box::new(key), Box::new(value))
            } else {
                TypeNode::Array(Box::new(parse_one(src, chars, pos, depth + 1)?))
            }
        }
        '(' => {
            let mut fields = Vec::new();
            loop {
                match chars.get(*pos) {
                    Some(')') => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => fields.push(parse_one(src, chars, pos, depth + 1)?),
                    None => return Err(ProtoError::signature(src, "unterminated struct")),
                }
            }
            if fields.is_empty() {
                return Err(ProtoError::signature(src, "empty struct"));
            }
            TypeNode::Struct(fields)
        }
        other => {
            return Err(ProtoError::signature(
                src,
                format!("unknown type code {other:?}"),
            ))
        }
    };
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_types() {
        let tree = SignatureTree::parse("ybnqiuxtdsogv").unwrap();
        assert_eq!(tree.len(), 13);
        assert!(tree.types.iter().take(12).all(|t| t.is_basic()));
        assert_eq!(tree.types[12], TypeNode::Variant);
    }

    #[test]
    fn parses_containers() {
        let tree = SignatureTree::parse("a{sv}a(ii)aas").unwrap();
        assert_eq!(
            tree.types[0],
            TypeNode::Dict(Box::new(TypeNode::String), Box::new(TypeNode::Variant))
        );
        assert_eq!(
            tree.types[1],
            TypeNode::Array(Box::new(TypeNode::Struct(vec![
                TypeNode::Int32,
                TypeNode::Int32
            ])))
        );
        assert_eq!(
            tree.types[2],
            TypeNode::Array(Box::new(TypeNode::Array(Box::new(TypeNode::String))))
        );
        assert_eq!(tree.types[3], TypeNode::String);
    }

    #[test]
    fn round_trips_text() {
        for sig in ["", "s", "a{oa{sa{sv}}}", "(bds)", "sa{sv}as", "aav"] {
            let tree = SignatureTree::parse(sig).unwrap();
            assert_eq!(tree.text(), sig);
        }
    }

    #[test]
    fn rejects_malformed() {
        for sig in ["z", "a", "a{vs}", "(", "()", "a{s", "a{}"] {
            assert!(SignatureTree::parse(sig).is_err(), "accepted {sig:?}");
        }
    }

    #[test]
    fn single_type_parse() {
        assert!(TypeNode::parse("ss").is_err());
        assert_eq!(
            TypeNode::parse("ao").unwrap(),
            TypeNode::Array(Box::new(TypeNode::ObjectPath))
        );
    }
}
