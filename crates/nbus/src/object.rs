//! The server-side object tree
//!
//! An [`ObjectNode`] owns its interfaces and its children; parent, and
//! owning-service links are weak back-references. Nodes are created
//! detached, wired into a tree with [`ObjectNode::add_object`], and torn
//! down with [`ObjectNode::remove_object`]. A node that opts into the
//! `ObjectManager` role announces composition changes of its subtree.

use crate::error::{BusError, Result};
use crate::interface::Interface;
use crate::service::Service;
use crate::standard;
use nbus_proto::names::join_paths;
use nbus_proto::{Dict, Value, Variant};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// A node in the server-side path tree.
pub struct ObjectNode {
    component: RwLock<String>,
    parent: RwLock<Weak<ObjectNode>>,
    service: RwLock<Weak<Service>>,
    children: RwLock<BTreeMap<String, Arc<ObjectNode>>>,
    interfaces: RwLock<BTreeMap<String, Arc<Interface>>>,
    object_manager: AtomicBool,
}

impl ObjectNode {
    /// A detached node.
    pub fn new() -> Arc<Self> {
        Arc::new(ObjectNode {
            component: RwLock::new(String::new()),
            parent: RwLock::new(Weak::new()),
            service: RwLock::new(Weak::new()),
            children: RwLock::new(BTreeMap::new()),
            interfaces: RwLock::new(BTreeMap::new()),
            object_manager: AtomicBool::new(false),
        })
    }

    /// Opt this node into the `ObjectManager` role.
    pub fn enable_object_manager(&self) {
        self.object_manager.store(true, Ordering::SeqCst);
    }

    pub fn is_object_manager(&self) -> bool {
        self.object_manager.load(Ordering::SeqCst)
    }

    /// Absolute path of this node within its tree.
    pub fn path(&self) -> String {
        let mut components = Vec::new();
        let mut current = self.parent.read().upgrade();
        components.push(self.component.read().clone());
        while let Some(node) = current {
            components.push(node.component.read().clone());
            current = node.parent.read().upgrade();
        }
        components.retain(|c| !c.is_empty());
        components.reverse();
        if components.is_empty() {
            "/".to_owned()
        } else {
            format!("/{}", components.join("/"))
        }
    }

    pub fn parent(&self) -> Option<Arc<ObjectNode>> {
        self.parent.read().upgrade()
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.read().upgrade()
    }

    pub fn interface(&self, name: &str) -> Option<Arc<Interface>> {
        self.interfaces.read().get(name).cloned()
    }

    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.interfaces.read().values().cloned().collect()
    }

    pub fn child(&self, component: &str) -> Option<Arc<ObjectNode>> {
        self.children.read().get(component).cloned()
    }

    pub fn children(&self) -> Vec<Arc<ObjectNode>> {
        self.children.read().values().cloned().collect()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    /// Walk a relative path (no leading `/`) from this node.
    pub fn walk(self: &Arc<Self>, relative: &str) -> Option<Arc<ObjectNode>> {
        let mut node = self.clone();
        for component in relative.split('/').filter(|c| !c.is_empty()) {
            let next = node.child(component)?;
            node = next;
        }
        Some(node)
    }

    /// Attach an interface. Interface names are unique per node; attaching
    /// a second interface under the same name is an error.
    pub fn add_interface(self: &Arc<Self>, iface: Arc<Interface>) -> Result<()> {
        let name = iface.name().to_owned();
        {
            let mut interfaces = self.interfaces.write();
            if interfaces.contains_key(&name) {
                return Err(BusError::DuplicateInterface(name));
            }
            iface.set_node(Arc::downgrade(self));
            interfaces.insert(name.clone(), iface.clone());
        }
        // A node already live on a bus arms the interface immediately; the
        // post-expose traversal handles the rest at expose time.
        if let Some(service) = self.service() {
            if let Some((router, service_name)) = service.link() {
                service.arm_interface(&router, &service_name, &self.path(), &iface);
            }
        }
        Ok(())
    }

    /// Detach an interface, optionally announcing it through the nearest
    /// `ObjectManager` ancestor. Without such an ancestor the announcement
    /// silently no-ops.
    pub fn remove_interface(self: &Arc<Self>, name: &str, should_emit: bool) -> Result<()> {
        let iface = self
            .interfaces
            .write()
            .remove(name)
            .ok_or_else(|| BusError::UnknownInterface(name.to_owned()))?;
        iface.disarm();
        iface.set_node(Weak::new());
        if should_emit {
            self.emit_interfaces_removed(&self.path(), vec![name.to_owned()]);
        }
        Ok(())
    }

    /// Wire `child` in at `relative` (no leading `/`), creating anonymous
    /// intermediate nodes as needed.
    pub fn add_object(self: &Arc<Self>, relative: &str, child: Arc<ObjectNode>) -> Result<()> {
        if relative.starts_with('/') {
            return Err(BusError::AbsolutePath(relative.to_owned()));
        }
        let components: Vec<&str> = relative.split('/').filter(|c| !c.is_empty()).collect();
        let Some((leaf, intermediate)) = components.split_last() else {
            return Err(BusError::Proto(nbus_proto::ProtoError::InvalidPath(
                relative.to_owned(),
            )));
        };
        validate_components(&components)?;

        let service = self.service.read().clone();
        let mut node = self.clone();
        for component in intermediate {
            let next = {
                let mut children = node.children.write();
                match children.get(*component) {
                    Some(existing) => existing.clone(),
                    None => {
                        let fresh = ObjectNode::new();
                        *fresh.component.write() = (*component).to_owned();
                        *fresh.parent.write() = Arc::downgrade(&node);
                        *fresh.service.write() = service.clone();
                        children.insert((*component).to_owned(), fresh.clone());
                        fresh
                    }
                }
            };
            node = next;
        }
        {
            let mut children = node.children.write();
            if children.contains_key(*leaf) {
                return Err(BusError::DuplicateObject(join_paths(&node.path(), leaf)));
            }
            *child.component.write() = (*leaf).to_owned();
            *child.parent.write() = Arc::downgrade(&node);
            children.insert((*leaf).to_owned(), child.clone());
        }
        propagate_service(&child, &service);

        if let Some(service) = self.service() {
            if let Some((router, service_name)) = service.link() {
                service.arm_subtree(&router, &service_name, &child);
            }
        }

        let full_path = child.path();
        debug!(path = %full_path, "object added");
        if let Some(manager) = child.nearest_object_manager() {
            let payload = child.interfaces_payload();
            self.emit_from_manager_added(&manager, &full_path, payload);
        }
        Ok(())
    }

    /// Remove the subtree at `relative` (relative only; an absolute path is
    /// a typed error). Interfaces of every descendant are torn down
    /// depth-first before the subtree is unlinked.
    pub fn remove_object(self: &Arc<Self>, relative: &str) -> Result<()> {
        if relative.starts_with('/') {
            return Err(BusError::AbsolutePath(relative.to_owned()));
        }
        let target = self
            .walk(relative)
            .ok_or_else(|| BusError::UnknownObject(join_paths(&self.path(), relative)))?;
        if Arc::ptr_eq(&target, self) {
            return Err(BusError::UnknownObject(self.path()));
        }
        let full_path = target.path();
        let manager = target.nearest_object_manager();
        let notice = self
            .service()
            .map(|s| s.removal_notice())
            .unwrap_or_default();

        // Record what is being torn down before the back-references go.
        let mut removed: Vec<(String, Vec<String>)> = Vec::new();
        collect_subtree(&target, &mut removed);

        teardown_subtree(&target);

        let parent = target
            .parent
            .read()
            .upgrade()
            .expect("non-root node has a parent");
        let component = target.component.read().clone();
        parent.children.write().remove(&component);
        *target.parent.write() = Weak::new();
        *target.service.write() = Weak::new();
        debug!(path = %full_path, "object removed");

        if let Some(manager) = manager {
            match notice {
                crate::service::SubtreeRemovalNotice::EmptyList => {
                    // One signal with an empty interface list stands for
                    // "the whole subtree is gone".
                    self.emit_from_manager_removed(&manager, &full_path, Vec::new());
                }
                crate::service::SubtreeRemovalNotice::PerObject => {
                    for (path, interfaces) in removed.into_iter().rev() {
                        self.emit_from_manager_removed(&manager, &path, interfaces);
                    }
                }
            }
        }
        Ok(())
    }

    /// Introspection XML for this node.
    pub fn introspect(&self) -> String {
        crate::introspect::node_xml(self)
    }

    /// `{interface -> {property -> variant(value)}}` for every interface of
    /// this node, non-write-only properties only.
    pub(crate) fn interfaces_payload(&self) -> Value {
        let mut by_interface = Dict::new();
        for iface in self.interfaces() {
            let mut props = Dict::new();
            for (name, node, value) in iface.readable_properties() {
                props.insert(
                    Value::Str(name),
                    Value::Variant(Box::new(Variant::new(node, value))),
                );
            }
            by_interface.insert(Value::Str(iface.name().to_owned()), Value::Dict(props));
        }
        Value::Dict(by_interface)
    }

    /// `GetManagedObjects` payload: every descendant of this node.
    pub(crate) fn managed_objects(self: &Arc<Self>) -> Value {
        let mut by_path = Dict::new();
        let mut stack: Vec<Arc<ObjectNode>> = self.children();
        while let Some(node) = stack.pop() {
            by_path.insert(
                Value::ObjectPath(node.path()),
                node.interfaces_payload(),
            );
            stack.extend(node.children());
        }
        Value::Dict(by_path)
    }

    pub(crate) fn set_service(&self, service: Weak<Service>) {
        *self.service.write() = service;
    }

    pub(crate) fn nearest_object_manager(self: &Arc<Self>) -> Option<Arc<ObjectNode>> {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node.is_object_manager() {
                return Some(node);
            }
            current = node.parent();
        }
        None
    }

    fn emit_interfaces_removed(self: &Arc<Self>, path: &str, interfaces: Vec<String>) {
        if let Some(manager) = self.nearest_object_manager() {
            self.emit_from_manager_removed(&manager, path, interfaces);
        }
    }

    fn emit_from_manager_added(
        &self,
        manager: &Arc<ObjectNode>,
        object_path: &str,
        payload: Value,
    ) {
        let Some(service) = manager.service() else { return };
        let Some((router, _)) = service.link() else { return };
        standard::emit_interfaces_added(&router, &manager.path(), object_path, payload);
    }

    fn emit_from_manager_removed(
        &self,
        manager: &Arc<ObjectNode>,
        object_path: &str,
        interfaces: Vec<String>,
    ) {
        let Some(service) = manager.service() else { return };
        let Some((router, _)) = service.link() else { return };
        standard::emit_interfaces_removed(&router, &manager.path(), object_path, interfaces);
    }
}

fn validate_components(components: &[&str]) -> Result<()> {
    for component in components {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(BusError::Proto(nbus_proto::ProtoError::InvalidPath(
                (*component).to_owned(),
            )));
        }
    }
    Ok(())
}

fn propagate_service(node: &Arc<ObjectNode>, service: &Weak<Service>) {
    *node.service.write() = service.clone();
    for child in node.children() {
        propagate_service(&child, service);
    }
}

fn collect_subtree(node: &Arc<ObjectNode>, out: &mut Vec<(String, Vec<String>)>) {
    out.push((
        node.path(),
        node.interfaces.read().keys().cloned().collect(),
    ));
    for child in node.children() {
        collect_subtree(&child, out);
    }
}

fn teardown_subtree(node: &Arc<ObjectNode>) {
    for child in node.children() {
        teardown_subtree(&child);
        *child.parent.write() = Weak::new();
        *child.service.write() = Weak::new();
    }
    node.children.write().clear();
    let interfaces: Vec<Arc<Interface>> = node.interfaces.read().values().cloned().collect();
    for iface in interfaces {
        iface.disarm();
        iface.set_node(Weak::new());
    }
    node.interfaces.write().clear();
}
