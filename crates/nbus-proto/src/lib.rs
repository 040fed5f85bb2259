//! Protocol model for the nbus D-Bus stack.
//!
//! This crate carries everything the runtime crate (`nbus`) needs that is
//! independent of any transport or bus: the message header model, the
//! signature language, the two value models, and the bridge between them.
//!
//! # Value models
//!
//! D-Bus bodies exist in two shapes in this stack:
//!
//! - the **marshal form** ([`WireValue`]): scalars plus one positional
//!   container. Dicts are sequences of two-element entry sequences, structs
//!   are positional sequences, variants carry their signature string as the
//!   first element. This is the shape a byte codec consumes and produces.
//! - the **high-level form** ([`Value`]): native containers with an
//!   insertion-ordered dict and a tagged variant carrying its own type node.
//!   This is the shape handlers and proxy callers see.
//!
//! [`bridge`] converts between the two, driven by a parsed [`TypeNode`]
//! tree. Both directions are total over compatible pairs and fail with a
//! typed error on any mismatch.

pub mod bridge;
pub mod error;
pub mod message;
pub mod names;
pub mod signature;
pub mod value;

pub use error::{ProtoError, Result};
pub use message::{Message, MessageKind};
pub use names::MatchRule;
pub use signature::{Signature, SignatureTree, TypeNode};
pub use value::{Dict, Value, Variant, WireValue};
