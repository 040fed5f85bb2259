//! D-Bus message model
//!
//! A [`Message`] is the unit the transport seam exchanges: the header
//! fields of the four message kinds plus a marshal-form body. Serials are
//! assigned by the router at send time; a message is immutable once it has
//! been handed to the transport.

use crate::signature::Signature;
use crate::value::WireValue;

/// The four D-Bus message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// Standard error names the stack emits and recognizes.
pub mod error_name {
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_SERVICE: &str = "org.freedesktop.DBus.Error.UnknownService";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const PROPERTY_WRITE_ONLY: &str = "org.freedesktop.DBus.Error.PropertyWriteOnly";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";

    /// Prefix under which user handler error kinds are published.
    pub const USER_PREFIX: &str = "org.freedesktop.DBus.";
}

/// A bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub reply_serial: Option<u32>,
    pub error_name: Option<String>,
    pub signature: Option<Signature>,
    pub body: Vec<WireValue>,
}

impl Message {
    fn blank(kind: MessageKind) -> Self {
        Message {
            kind,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            destination: None,
            sender: None,
            reply_serial: None,
            error_name: None,
            signature: None,
            body: Vec::new(),
        }
    }

    /// A method call addressed to `destination`.
    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        let mut msg = Message::blank(MessageKind::MethodCall);
        msg.destination = Some(destination.to_owned());
        msg.path = Some(path.to_owned());
        msg.interface = Some(interface.to_owned());
        msg.member = Some(member.to_owned());
        msg
    }

    /// A method return answering `origin`.
    pub fn method_return(origin: &Message) -> Self {
        let mut msg = Message::blank(MessageKind::MethodReturn);
        msg.reply_serial = Some(origin.serial);
        msg.destination = origin.sender.clone();
        msg
    }

    /// An error reply answering `origin`. The error text travels as the
    /// single string body element, as the reference daemon does it.
    pub fn error(origin: &Message, name: &str, text: &str) -> Self {
        let mut msg = Message::blank(MessageKind::Error);
        msg.reply_serial = Some(origin.serial);
        msg.destination = origin.sender.clone();
        msg.error_name = Some(name.to_owned());
        msg.signature = Some(Signature::new("s").expect("constant signature"));
        msg.body = vec![WireValue::Str(text.to_owned())];
        msg
    }

    /// A signal originating at `path`.
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut msg = Message::blank(MessageKind::Signal);
        msg.path = Some(path.to_owned());
        msg.interface = Some(interface.to_owned());
        msg.member = Some(member.to_owned());
        msg
    }

    pub fn with_body(mut self, signature: Signature, body: Vec<WireValue>) -> Self {
        self.signature = Some(signature);
        self.body = body;
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_owned());
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    /// The error text of an error message, when its body leads with one.
    pub fn error_text(&self) -> Option<&str> {
        match self.body.first() {
            Some(WireValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Signature text, empty when absent.
    pub fn signature_text(&self) -> &str {
        self.signature.as_ref().map(|s| s.as_str()).unwrap_or("")
    }
}
