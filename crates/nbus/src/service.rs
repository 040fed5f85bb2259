//! Exposed services
//!
//! A [`Service`] is the root of an object tree plus the well-known name it
//! is published under. Exposure happens through [`crate::bus::Bus::expose`],
//! which requests the name and then runs the post-expose traversal: each
//! node's interfaces receive their bus link (standard interfaces are armed
//! by the runtime before any user interface on the node), then the
//! traversal descends into the children.

use crate::interface::{BusLink, Interface};
use crate::object::ObjectNode;
use crate::router::Router;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::debug;

/// How a whole-subtree removal is announced through `ObjectManager`.
///
/// The wire convention for removing a subtree is ambiguous; both policies
/// are supported, with the single empty-list signal as the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubtreeRemovalNotice {
    /// One `InterfacesRemoved(path, [])` for the subtree root; the empty
    /// list stands for "everything below this path is gone".
    #[default]
    EmptyList,
    /// One `InterfacesRemoved` per removed object, deepest first, naming
    /// that object's interfaces.
    PerObject,
}

/// The root of an object tree published under a well-known name.
pub struct Service {
    root: Arc<ObjectNode>,
    name: RwLock<Option<String>>,
    router: RwLock<Weak<Router>>,
    removal_notice: RwLock<SubtreeRemovalNotice>,
}

impl Service {
    /// A fresh service whose tree holds only the root node `/`.
    pub fn new() -> Arc<Self> {
        let service = Arc::new(Service {
            root: ObjectNode::new(),
            name: RwLock::new(None),
            router: RwLock::new(Weak::new()),
            removal_notice: RwLock::new(SubtreeRemovalNotice::default()),
        });
        service.root.adopt(&service);
        service
    }

    pub fn root(&self) -> &Arc<ObjectNode> {
        &self.root
    }

    /// The published well-known name, while exposed.
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn removal_notice(&self) -> SubtreeRemovalNotice {
        *self.removal_notice.read()
    }

    pub fn set_removal_notice(&self, notice: SubtreeRemovalNotice) {
        *self.removal_notice.write() = notice;
    }

    /// The object at an absolute path within this service.
    pub fn object_at(&self, path: &str) -> Option<Arc<ObjectNode>> {
        if !path.starts_with('/') {
            return None;
        }
        self.root.walk(path.trim_start_matches('/'))
    }

    /// The router and published name, while exposed.
    pub(crate) fn link(&self) -> Option<(Arc<Router>, String)> {
        let router = self.router.read().upgrade()?;
        let name = self.name.read().clone()?;
        Some((router, name))
    }

    /// Publish: record the name and router, then run the post-expose
    /// traversal over the whole tree.
    pub(crate) fn attach(self: &Arc<Self>, name: &str, router: &Arc<Router>) {
        *self.name.write() = Some(name.to_owned());
        *self.router.write() = Arc::downgrade(router);
        debug!(name, "service exposed, arming tree");
        self.arm_subtree(router, name, &self.root);
    }

    /// Withdraw: disarm every interface and drop the links.
    pub(crate) fn detach(&self) {
        fn disarm(node: &Arc<ObjectNode>) {
            for iface in node.interfaces() {
                iface.disarm();
            }
            for child in node.children() {
                disarm(&child);
            }
        }
        disarm(&self.root);
        *self.name.write() = None;
        *self.router.write() = Weak::new();
    }

    /// Post-expose traversal: depth-first, this node's interfaces before
    /// its children. The runtime's standard interfaces (`Peer`,
    /// `Introspectable`, `Properties`, and opted-in `ObjectManager`) are
    /// served by the dispatch shim and are live from the moment the links
    /// exist, so `Properties` is armed before any user interface emits.
    pub(crate) fn arm_subtree(
        self: &Arc<Self>,
        router: &Arc<Router>,
        service_name: &str,
        node: &Arc<ObjectNode>,
    ) {
        for iface in node.interfaces() {
            self.arm_interface(router, service_name, &node.path(), &iface);
        }
        for child in node.children() {
            self.arm_subtree(router, service_name, &child);
        }
    }

    pub(crate) fn arm_interface(
        self: &Arc<Self>,
        router: &Arc<Router>,
        service_name: &str,
        path: &str,
        iface: &Arc<Interface>,
    ) {
        iface.arm(BusLink {
            router: Arc::downgrade(router),
            path: path.to_owned(),
            service_name: service_name.to_owned(),
        });
    }
}

impl ObjectNode {
    /// Bind a freshly created root to its service.
    pub(crate) fn adopt(self: &Arc<Self>, service: &Arc<Service>) {
        self.set_service(Arc::downgrade(service));
    }
}
