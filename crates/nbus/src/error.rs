//! Error types for the bus runtime

use nbus_proto::message::error_name;
use nbus_proto::ProtoError;
use thiserror::Error;

/// Outcome codes of the daemon's `RequestName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

/// Bus runtime error types
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("connection closed")]
    Disconnected,

    #[error("bus not ready: handshake did not complete in time")]
    NotReady,

    #[error("call cancelled")]
    Cancelled,

    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("property {interface}.{name} is read-only")]
    PropertyReadOnly { interface: String, name: String },

    #[error("property {interface}.{name} is write-only")]
    PropertyWriteOnly { interface: String, name: String },

    #[error("no such property: {interface}.{name}")]
    NoSuchProperty { interface: String, name: String },

    #[error("could not acquire name {name}: {reply:?}")]
    RequestName {
        name: String,
        reply: RequestNameReply,
    },

    #[error("interface {0} already present on object")]
    DuplicateInterface(String),

    #[error("object already exists at {0}")]
    DuplicateObject(String),

    #[error("expected a relative path, got {0}")]
    AbsolutePath(String),

    #[error("interface is not exposed on a bus")]
    NotExposed,

    #[error("malformed reply: {0}")]
    InvalidReply(String),

    #[error("{name}: {message}")]
    Call { name: String, message: String },
}

impl BusError {
    /// An error originating in user handler code. `kind` becomes the wire
    /// error name under the `org.freedesktop.DBus.` prefix.
    pub fn user(kind: &str, message: impl Into<String>) -> Self {
        BusError::Call {
            name: format!("{}{kind}", error_name::USER_PREFIX),
            message: message.into(),
        }
    }

    /// The wire error name and text this error is sent as.
    pub fn to_wire(&self) -> (String, String) {
        let (name, text) = match self {
            BusError::UnknownObject(p) => (error_name::UNKNOWN_OBJECT, format!("no object at {p}")),
            BusError::UnknownInterface(i) => {
                (error_name::UNKNOWN_INTERFACE, format!("no interface {i}"))
            }
            BusError::UnknownMethod(m) => (error_name::UNKNOWN_METHOD, format!("no method {m}")),
            BusError::UnknownService(s) => (error_name::UNKNOWN_SERVICE, format!("no service {s}")),
            BusError::PropertyReadOnly { interface, name } => (
                error_name::PROPERTY_READ_ONLY,
                format!("{interface}.{name} is read-only"),
            ),
            BusError::PropertyWriteOnly { interface, name } => (
                error_name::PROPERTY_WRITE_ONLY,
                format!("{interface}.{name} is write-only"),
            ),
            BusError::NoSuchProperty { interface, name } => (
                error_name::UNKNOWN_METHOD,
                format!("no property {interface}.{name}"),
            ),
            BusError::Call { name, message } => return (name.clone(), message.clone()),
            other => (error_name::FAILED, other.to_string()),
        };
        (name.to_owned(), text)
    }

    /// Map an incoming error reply back into the taxonomy.
    pub fn from_wire(name: &str, text: &str) -> Self {
        match name {
            error_name::UNKNOWN_OBJECT => BusError::UnknownObject(text.to_owned()),
            error_name::UNKNOWN_INTERFACE => BusError::UnknownInterface(text.to_owned()),
            error_name::UNKNOWN_METHOD => BusError::UnknownMethod(text.to_owned()),
            error_name::UNKNOWN_SERVICE => BusError::UnknownService(text.to_owned()),
            error_name::PROPERTY_READ_ONLY => BusError::PropertyReadOnly {
                interface: String::new(),
                name: text.to_owned(),
            },
            error_name::PROPERTY_WRITE_ONLY => BusError::PropertyWriteOnly {
                interface: String::new(),
                name: text.to_owned(),
            },
            _ => BusError::Call {
                name: name.to_owned(),
                message: text.to_owned(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mapping_round_trips_standard_names() {
        let err = BusError::UnknownObject("/missing".into());
        let (name, text) = err.to_wire();
        assert_eq!(name, error_name::UNKNOWN_OBJECT);
        assert!(matches!(
            BusError::from_wire(&name, &text),
            BusError::UnknownObject(_)
        ));
    }

    #[test]
    fn user_errors_get_the_dotted_prefix() {
        let err = BusError::user("OutOfCheese", "redo from start");
        let (name, text) = err.to_wire();
        assert_eq!(name, "org.freedesktop.DBus.OutOfCheese");
        assert_eq!(text, "redo from start");
    }
}
