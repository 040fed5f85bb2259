//! nbus — a native D-Bus stack
//!
//! A process uses this crate to both expose services on a bus and consume
//! remote services through introspected proxies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Runtime (this crate)                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Server side           │  Client side        │  Embedded     │
//! │  - Service / ObjectNode│  - Proxy tree       │  - Broker     │
//! │  - Interface instances │  - Method stubs     │  - name table │
//! │  - Peer/Introspectable │  - Property cells   │  - activation │
//! │    Properties/ObjMgr   │  - Signal streams   │               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Router: serials, pending replies, matches, dispatch         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Transport seam (authenticated framed message exchange)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │         Protocol model (nbus-proto crate)                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key concepts
//!
//! - **Bus**: one authenticated connection; performs `Hello`, wraps the
//!   daemon method surface, exposes services and builds proxies.
//! - **Router**: the single multiplexing point — serial assignment,
//!   request/reply correlation, signal fan-out, method dispatch.
//! - **Service / ObjectNode / Interface**: the server-side object tree
//!   with the standard interfaces answered by the runtime.
//! - **Proxy / ProxyObject / ProxyInterface**: the introspected mirror of
//!   a remote service, kept live across disconnection and activation.
//! - **Broker**: an in-process bus for embedding and tests.
//!
//! # Modules
//!
//! - [`bus`]: connection, handshake, daemon calls
//! - [`router`]: message multiplexing
//! - [`service`], [`object`], [`interface`], [`descriptor`]: server side
//! - [`standard`]: the `org.freedesktop.DBus.*` standard interfaces
//! - [`proxy`]: client side
//! - [`broker`]: embedded bus
//! - [`transport`]: the transport seam and the in-memory implementation

pub mod broker;
pub mod bus;
pub mod descriptor;
pub mod error;
pub mod interface;
mod introspect;
pub mod object;
pub mod proxy;
pub mod router;
pub mod service;
pub mod standard;
pub mod transport;

pub use broker::Broker;
pub use bus::{Bus, BusConfig, BusEvent};
pub use descriptor::{InterfaceDescriptor, PropertyAccess};
pub use error::{BusError, RequestNameReply, Result};
pub use interface::{Interface, InterfaceBuilder, InvocationContext, PropertyCell};
pub use object::ObjectNode;
pub use proxy::{Proxy, ProxyBuilder, ProxyEvent, ProxyInterface, ProxyObject};
pub use router::{PendingReply, ReplyBody, Router, SubscriptionId};
pub use service::{Service, SubtreeRemovalNotice};
pub use transport::{memory_pair, MemoryTransport, Transport};

// The protocol model is part of the public surface.
pub use nbus_proto as proto;
pub use nbus_proto::{
    Dict, MatchRule, Message, MessageKind, Signature, SignatureTree, TypeNode, Value, Variant,
    WireValue,
};
