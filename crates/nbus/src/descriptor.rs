//! Static interface descriptions
//!
//! An [`InterfaceDescriptor`] is the shape of an interface independent of
//! any live instance: member names mapped to their signatures. The server
//! side derives one from the builder; the proxy side derives one from
//! introspection XML.

use crate::error::{BusError, Result};
use nbus_proto::names::{validate_interface_name, validate_member_name};
use nbus_proto::{SignatureTree, TypeNode};
use std::collections::BTreeMap;

/// Property access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn is_readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(PropertyAccess::Read),
            "write" => Some(PropertyAccess::Write),
            "readwrite" => Some(PropertyAccess::ReadWrite),
            _ => None,
        }
    }
}

/// A method: input and output signatures, one complete type per argument.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub inputs: SignatureTree,
    pub outputs: SignatureTree,
}

/// A property: one complete type plus its access mode.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub node: TypeNode,
    pub access: PropertyAccess,
}

/// A signal: argument signature.
#[derive(Debug, Clone)]
pub struct SignalDescriptor {
    pub name: String,
    pub args: SignatureTree,
}

/// Static description of one interface.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDescriptor {
    name: String,
    methods: BTreeMap<String, MethodDescriptor>,
    properties: BTreeMap<String, PropertyDescriptor>,
    signals: BTreeMap<String, SignalDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(name: &str) -> Result<Self> {
        validate_interface_name(name)?;
        Ok(InterfaceDescriptor {
            name: name.to_owned(),
            ..Default::default()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a method. Member names are unique across all member kinds
    /// of the interface.
    pub fn add_method(&mut self, name: &str, inputs: &str, outputs: &str) -> Result<()> {
        validate_member_name(name)?;
        self.check_free(name)?;
        self.methods.insert(
            name.to_owned(),
            MethodDescriptor {
                name: name.to_owned(),
                inputs: SignatureTree::parse(inputs).map_err(BusError::from)?,
                outputs: SignatureTree::parse(outputs).map_err(BusError::from)?,
            },
        );
        Ok(())
    }

    pub fn add_property(&mut self, name: &str, signature: &str, access: PropertyAccess) -> Result<()> {
        validate_member_name(name)?;
        self.check_free(name)?;
        self.properties.insert(
            name.to_owned(),
            PropertyDescriptor {
                name: name.to_owned(),
                node: TypeNode::parse(signature).map_err(BusError::from)?,
                access,
            },
        );
        Ok(())
    }

    pub fn add_signal(&mut self, name: &str, args: &str) -> Result<()> {
        validate_member_name(name)?;
        self.check_free(name)?;
        self.signals.insert(
            name.to_owned(),
            SignalDescriptor {
                name: name.to_owned(),
                args: SignatureTree::parse(args).map_err(BusError::from)?,
            },
        );
        Ok(())
    }

    fn check_free(&self, name: &str) -> Result<()> {
        if self.methods.contains_key(name)
            || self.properties.contains_key(name)
            || self.signals.contains_key(name)
        {
            return Err(BusError::user(
                "Failed",
                format!("member {name} already declared on {}", self.name),
            ));
        }
        Ok(())
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalDescriptor> {
        self.signals.values()
    }
}
