//! Live interface instances
//!
//! An [`Interface`] couples a static descriptor with the running parts: the
//! method dispatch table, the property slots, the optional user setters and
//! the bus link that is armed when the owning service is exposed. Container
//! properties are mutated through the [`PropertyCell`] capability, which is
//! the only path that can change them in place; every mutation emits one
//! `PropertiesChanged`.

use crate::descriptor::{InterfaceDescriptor, PropertyAccess};
use crate::error::{BusError, Result};
use crate::object::ObjectNode;
use crate::router::Router;
use crate::standard;
use nbus_proto::bridge::{value_to_wire, values_to_body};
use nbus_proto::{Dict, TypeNode, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

/// Method implementation type.
pub type MethodFn = Arc<
    dyn Fn(InvocationContext) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send>>
        + Send
        + Sync,
>;

/// Property setter: receives the incoming value, returns the value to
/// store. The default setter is the identity.
pub type PropertySetter = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// What a method implementation receives per call.
pub struct InvocationContext {
    pub args: Vec<Value>,
    pub interface: Arc<Interface>,
    pub sender: Option<String>,
}

/// Where an exposed interface emits to.
#[derive(Clone)]
pub(crate) struct BusLink {
    pub router: Weak<Router>,
    pub path: String,
    pub service_name: String,
}

/// A live interface attached (or attachable) to an object node.
pub struct Interface {
    descriptor: InterfaceDescriptor,
    handlers: BTreeMap<String, MethodFn>,
    setters: BTreeMap<String, PropertySetter>,
    slots: Mutex<BTreeMap<String, Value>>,
    link: Mutex<Option<BusLink>>,
    node: Mutex<Weak<ObjectNode>>,
    exposed_tx: broadcast::Sender<String>,
}

impl Interface {
    /// Start building an interface with the given name.
    pub fn builder(name: &str) -> Result<InterfaceBuilder> {
        Ok(InterfaceBuilder {
            descriptor: InterfaceDescriptor::new(name)?,
            handlers: BTreeMap::new(),
            setters: BTreeMap::new(),
            initial: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    /// The node this interface is attached to, while attached.
    pub fn node(&self) -> Option<Arc<ObjectNode>> {
        self.node.lock().upgrade()
    }

    /// Observe `ExposedOnBus`: fires with the owning service name once the
    /// post-expose traversal reaches this interface. From then on the
    /// interface may originate signals.
    pub fn exposed_events(&self) -> broadcast::Receiver<String> {
        self.exposed_tx.subscribe()
    }

    /// Current value of a property. This is the owner-side accessor; bus
    /// access rules are enforced by the `Properties` shim, not here.
    pub fn property(&self, name: &str) -> Result<Value> {
        self.descriptor
            .property(name)
            .ok_or_else(|| self.no_such_property(name))?;
        Ok(self
            .slots
            .lock()
            .get(name)
            .cloned()
            .expect("every declared property has a slot"))
    }

    /// Write a property: run the user setter, store, then emit one
    /// `PropertiesChanged` carrying the stored (post-setter) value if the
    /// property is readable.
    pub fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let desc = self
            .descriptor
            .property(name)
            .ok_or_else(|| self.no_such_property(name))?;
        let stored = match self.setters.get(name) {
            Some(setter) => setter(value)?,
            None => value,
        };
        // The stored value must fit the declared type, wherever it came from.
        value_to_wire(&stored, &desc.node).map_err(BusError::from)?;
        self.slots.lock().insert(name.to_owned(), stored.clone());
        if desc.access.is_readable() {
            self.notify_changed(name, &desc.node, stored);
        }
        Ok(())
    }

    /// Capability handle for in-place mutation of a container property.
    pub fn container_cell(self: &Arc<Self>, name: &str) -> Result<PropertyCell> {
        let desc = self
            .descriptor
            .property(name)
            .ok_or_else(|| self.no_such_property(name))?;
        if !matches!(desc.node, TypeNode::Array(_) | TypeNode::Dict(..)) {
            return Err(BusError::user(
                "Failed",
                format!("{}.{name} is not a container property", self.name()),
            ));
        }
        Ok(PropertyCell {
            iface: self.clone(),
            name: name.to_owned(),
        })
    }

    /// Emit a declared signal with high-level arguments.
    pub fn emit_signal(&self, name: &str, args: Vec<Value>) -> Result<()> {
        let desc = self
            .descriptor
            .signal(name)
            .ok_or_else(|| BusError::UnknownMethod(format!("{}.{name}", self.name())))?
            .clone();
        let body = values_to_body(&args, &desc.args).map_err(BusError::from)?;
        let link = self.link.lock().clone().ok_or(BusError::NotExposed)?;
        let router = link.router.upgrade().ok_or(BusError::Disconnected)?;
        router.send_signal(
            &link.path,
            self.name(),
            name,
            desc.args.signature(),
            body,
        )
    }

    /// All non-write-only properties with their current values, for
    /// `GetAll` and `ObjectManager` enumeration.
    pub fn readable_properties(&self) -> Vec<(String, TypeNode, Value)> {
        let slots = self.slots.lock();
        self.descriptor
            .properties()
            .filter(|p| p.access.is_readable())
            .map(|p| {
                let value = slots
                    .get(&p.name)
                    .cloned()
                    .expect("every declared property has a slot");
                (p.name.clone(), p.node.clone(), value)
            })
            .collect()
    }

    /// Bus-side read, enforcing access.
    pub(crate) fn get_for_bus(&self, name: &str) -> Result<(TypeNode, Value)> {
        let desc = self
            .descriptor
            .property(name)
            .ok_or_else(|| self.no_such_property(name))?;
        if !desc.access.is_readable() {
            return Err(BusError::PropertyWriteOnly {
                interface: self.name().to_owned(),
                name: name.to_owned(),
            });
        }
        Ok((desc.node.clone(), self.property(name)?))
    }

    /// Bus-side write, enforcing access.
    pub(crate) fn set_from_bus(&self, name: &str, value: Value) -> Result<()> {
        let desc = self
            .descriptor
            .property(name)
            .ok_or_else(|| self.no_such_property(name))?;
        if !desc.access.is_writable() {
            return Err(BusError::PropertyReadOnly {
                interface: self.name().to_owned(),
                name: name.to_owned(),
            });
        }
        self.set_property(name, value.into_inner())
    }

    pub(crate) async fn invoke(
        self: &Arc<Self>,
        member: &str,
        args: Vec<Value>,
        sender: Option<String>,
    ) -> Result<Vec<Value>> {
        let handler = self
            .handlers
            .get(member)
            .ok_or_else(|| BusError::UnknownMethod(member.to_owned()))?
            .clone();
        handler(InvocationContext {
            args,
            interface: self.clone(),
            sender,
        })
        .await
    }

    pub(crate) fn arm(&self, link: BusLink) {
        let service = link.service_name.clone();
        *self.link.lock() = Some(link);
        let _ = self.exposed_tx.send(service);
    }

    pub(crate) fn disarm(&self) {
        *self.link.lock() = None;
    }

    pub(crate) fn set_node(&self, node: Weak<ObjectNode>) {
        *self.node.lock() = node;
    }

    fn no_such_property(&self, name: &str) -> BusError {
        BusError::NoSuchProperty {
            interface: self.name().to_owned(),
            name: name.to_owned(),
        }
    }

    fn notify_changed(&self, name: &str, node: &TypeNode, value: Value) {
        let link = match self.link.lock().clone() {
            Some(link) => link,
            None => return,
        };
        let Some(router) = link.router.upgrade() else {
            return;
        };
        let (signature, body) = standard::properties_changed_body(
            self.name(),
            &[(name.to_owned(), node.clone(), value)],
            &[],
        );
        if let Err(e) = router.send_signal(
            &link.path,
            standard::PROPERTIES_IFACE,
            "PropertiesChanged",
            signature,
            body,
        ) {
            debug!(property = name, error = %e, "PropertiesChanged not sent");
        }
    }
}

/// Builder for [`Interface`].
pub struct InterfaceBuilder {
    descriptor: InterfaceDescriptor,
    handlers: BTreeMap<String, MethodFn>,
    setters: BTreeMap<String, PropertySetter>,
    initial: BTreeMap<String, Value>,
}

impl InterfaceBuilder {
    /// Register a method with its implementation.
    pub fn method<F, Fut>(mut self, name: &str, inputs: &str, outputs: &str, f: F) -> Result<Self>
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
    {
        self.descriptor.add_method(name, inputs, outputs)?;
        self.handlers
            .insert(name.to_owned(), Arc::new(move |cx| Box::pin(f(cx))));
        Ok(self)
    }

    /// Register a property with its initial value and the default setter.
    pub fn property(
        mut self,
        name: &str,
        signature: &str,
        access: PropertyAccess,
        initial: Value,
    ) -> Result<Self> {
        self.descriptor.add_property(name, signature, access)?;
        self.initial.insert(name.to_owned(), initial);
        Ok(self)
    }

    /// Register a property with a user setter run on every write.
    pub fn property_with_setter<F>(
        mut self,
        name: &str,
        signature: &str,
        access: PropertyAccess,
        initial: Value,
        setter: F,
    ) -> Result<Self>
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.descriptor.add_property(name, signature, access)?;
        self.initial.insert(name.to_owned(), initial);
        self.setters.insert(name.to_owned(), Arc::new(setter));
        Ok(self)
    }

    /// Declare a signal.
    pub fn signal(mut self, name: &str, args: &str) -> Result<Self> {
        self.descriptor.add_signal(name, args)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Arc<Interface>> {
        // Initial values must fit their declared types.
        for prop in self.descriptor.properties() {
            let value = self
                .initial
                .get(&prop.name)
                .expect("builder stores an initial value per property");
            value_to_wire(value, &prop.node).map_err(BusError::from)?;
        }
        let (exposed_tx, _) = broadcast::channel(16);
        Ok(Arc::new(Interface {
            descriptor: self.descriptor,
            handlers: self.handlers,
            setters: self.setters,
            slots: Mutex::new(self.initial),
            link: Mutex::new(None),
            node: Mutex::new(Weak::new()),
            exposed_tx,
        }))
    }
}

/// Capability handle for in-place mutation of one container property.
///
/// Obtained through [`Interface::container_cell`]; every mutating call
/// emits exactly one `PropertiesChanged` carrying the full current
/// contents. Calls that change nothing emit nothing.
pub struct PropertyCell {
    iface: Arc<Interface>,
    name: String,
}

impl PropertyCell {
    pub fn get(&self) -> Value {
        self.iface
            .property(&self.name)
            .expect("cell was validated against the descriptor")
    }

    pub fn len(&self) -> usize {
        match self.get() {
            Value::Array(items) => items.len(),
            Value::Dict(dict) => dict.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole container, running the property's setter path.
    pub fn replace(&self, value: Value) -> Result<()> {
        self.iface.set_property(&self.name, value)
    }

    /// Append to an array property.
    pub fn push(&self, value: Value) -> Result<()> {
        self.mutate(|current| match current {
            Value::Array(items) => {
                items.push(value);
                Ok(true)
            }
            _ => Err(BusError::user("Failed", "push requires an array property")),
        })
    }

    /// Remove and return the last element of an array property.
    pub fn pop(&self) -> Result<Option<Value>> {
        let mut popped = None;
        self.mutate(|current| match current {
            Value::Array(items) => {
                popped = items.pop();
                Ok(popped.is_some())
            }
            _ => Err(BusError::user("Failed", "pop requires an array property")),
        })?;
        Ok(popped)
    }

    /// Remove every array element the predicate selects; returns the count.
    pub fn remove_where<F>(&self, pred: F) -> Result<usize>
    where
        F: Fn(&Value) -> bool,
    {
        let mut removed = 0;
        self.mutate(|current| match current {
            Value::Array(items) => {
                let before = items.len();
                items.retain(|item| !pred(item));
                removed = before - items.len();
                Ok(removed > 0)
            }
            _ => Err(BusError::user(
                "Failed",
                "remove_where requires an array property",
            )),
        })?;
        Ok(removed)
    }

    /// Insert or replace an entry of a dict property.
    pub fn insert(&self, key: Value, value: Value) -> Result<()> {
        self.mutate(|current| match current {
            Value::Dict(dict) => {
                dict.insert(key, value);
                Ok(true)
            }
            _ => Err(BusError::user("Failed", "insert requires a dict property")),
        })
    }

    /// Remove an entry of a dict property; true when it was present.
    pub fn remove_key(&self, key: &Value) -> Result<bool> {
        let mut removed = false;
        self.mutate(|current| match current {
            Value::Dict(dict) => {
                removed = dict.remove(key).is_some();
                Ok(removed)
            }
            _ => Err(BusError::user(
                "Failed",
                "remove_key requires a dict property",
            )),
        })?;
        Ok(removed)
    }

    /// Empty the container.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|current| match current {
            Value::Array(items) => {
                let changed = !items.is_empty();
                items.clear();
                Ok(changed)
            }
            Value::Dict(dict) => {
                let changed = !dict.is_empty();
                *dict = Dict::new();
                Ok(changed)
            }
            _ => Ok(false),
        })
    }

    /// Run one mutation against a candidate under the slot lock, commit it
    /// only if it still fits the declared type, then emit a single
    /// `PropertiesChanged` if anything changed.
    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Value) -> Result<bool>,
    {
        let desc = self
            .iface
            .descriptor()
            .property(&self.name)
            .expect("cell was validated against the descriptor")
            .clone();
        let (changed, current) = {
            let mut slots = self.iface.slots.lock();
            let slot = slots
                .get_mut(&self.name)
                .expect("every declared property has a slot");
            let mut candidate = slot.clone();
            let changed = f(&mut candidate)?;
            if changed {
                value_to_wire(&candidate, &desc.node).map_err(BusError::from)?;
                *slot = candidate.clone();
            }
            (changed, candidate)
        };
        if changed && desc.access.is_readable() {
            self.iface.notify_changed(&self.name, &desc.node, current);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_interface() -> Arc<Interface> {
        Interface::builder("com.example.Sample")
            .unwrap()
            .method("Echo", "s", "s", |cx| async move {
                Ok(vec![cx.args.into_iter().next().expect("one argument")])
            })
            .unwrap()
            .property("Count", "q", PropertyAccess::ReadWrite, Value::UInt16(0))
            .unwrap()
            .property(
                "Names",
                "as",
                PropertyAccess::Read,
                Value::Array(Vec::new()),
            )
            .unwrap()
            .signal("Changed", "q")
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn invoke_runs_the_handler() {
        let iface = sample_interface();
        let out = iface
            .invoke("Echo", vec!["hi".into()], None)
            .await
            .unwrap();
        assert_eq!(out, vec![Value::from("hi")]);
        let err = iface.invoke("Missing", vec![], None).await.unwrap_err();
        assert!(matches!(err, BusError::UnknownMethod(_)));
    }

    #[test]
    fn set_property_rejects_wrong_type() {
        let iface = sample_interface();
        assert!(iface.set_property("Count", Value::Str("no".into())).is_err());
        iface.set_property("Count", Value::UInt16(3)).unwrap();
        assert_eq!(iface.property("Count").unwrap(), Value::UInt16(3));
    }

    #[test]
    fn setter_output_is_stored() {
        let iface = Interface::builder("com.example.Clamped")
            .unwrap()
            .property_with_setter(
                "Level",
                "q",
                PropertyAccess::ReadWrite,
                Value::UInt16(0),
                |value| match value {
                    Value::UInt16(v) => Ok(Value::UInt16(v.min(100))),
                    other => Ok(other),
                },
            )
            .unwrap()
            .build()
            .unwrap();
        iface.set_property("Level", Value::UInt16(3000)).unwrap();
        assert_eq!(iface.property("Level").unwrap(), Value::UInt16(100));
    }

    #[test]
    fn cell_mutations_and_type_checks() {
        let iface = sample_interface();
        let cell = iface.container_cell("Names").unwrap();
        // A push of the wrong element type is rejected without committing.
        assert!(cell.push(Value::UInt32(1)).is_err());
        assert!(cell.is_empty());
        cell.push("alice".into()).unwrap();
        cell.push("bob".into()).unwrap();
        assert_eq!(cell.len(), 2);
        let removed = cell
            .remove_where(|v| v.as_str() == Some("alice"))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cell.pop().unwrap(), Some("bob".into()));
        assert_eq!(cell.pop().unwrap(), None);
        assert!(iface.container_cell("Count").is_err());
    }

    #[test]
    fn signal_emission_requires_exposure() {
        let iface = sample_interface();
        let err = iface
            .emit_signal("Changed", vec![Value::UInt16(1)])
            .unwrap_err();
        assert!(matches!(err, BusError::NotExposed));
    }
}
