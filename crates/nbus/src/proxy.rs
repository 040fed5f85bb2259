//! Client-side proxies
//!
//! A [`Proxy`] mirrors a remote service: the connect routine finds (or
//! activates) the name's owner, an introspection pass materializes the
//! remote object tree as [`ProxyObject`]s and [`ProxyInterface`]s, and
//! live `PropertiesChanged` / `InterfacesAdded` / `InterfacesRemoved`
//! signals keep the mirror consistent. A long-lived `NameOwnerChanged`
//! subscription drives the disconnect/reconnect cycle.

use crate::bus::{Bus, DAEMON_IFACE, DAEMON_PATH};
use crate::descriptor::InterfaceDescriptor;
use crate::error::{BusError, Result};
use crate::router::{SignalHandler, SubscriptionId};
use crate::standard::{INTROSPECTABLE_IFACE, OBJECT_MANAGER_IFACE, PROPERTIES_IFACE};
use crate::{introspect, standard};
use nbus_proto::bridge::{body_to_values, values_to_body};
use nbus_proto::names::{join_paths, path_components, path_depth, paths_belong};
use nbus_proto::{MatchRule, Message, SignatureTree, Value, Variant};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

/// Lifecycle events of a proxy.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// The target is owned and its tree has been mirrored.
    Connected,
    /// The target released its name (or its owner died).
    Disconnected,
    /// The connect routine failed.
    Error { message: String },
}

/// Builder returned by [`Bus::proxy`].
pub struct ProxyBuilder {
    bus: Arc<Bus>,
    name: String,
    max_depth: Option<u32>,
    target_path: Option<String>,
    target_interface: Option<String>,
}

impl ProxyBuilder {
    pub(crate) fn new(bus: Arc<Bus>, name: &str) -> Self {
        ProxyBuilder {
            bus,
            name: name.to_owned(),
            max_depth: None,
            target_path: None,
            target_interface: None,
        }
    }

    /// Bound the introspection pass to `depth` path components, counting
    /// the root as 1. Unset means unbounded.
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Restrict the mirror to the subtree at `path`.
    pub fn target_path(mut self, path: &str) -> Result<Self> {
        nbus_proto::names::validate_object_path(path)?;
        self.target_path = Some(path.to_owned());
        Ok(self)
    }

    /// Restrict the mirror to one interface.
    pub fn target_interface(mut self, interface: &str) -> Result<Self> {
        nbus_proto::names::validate_interface_name(interface)?;
        self.target_interface = Some(interface.to_owned());
        Ok(self)
    }

    /// Create the proxy and start its connect routine in the background.
    /// Track progress through [`Proxy::events`] or
    /// [`Proxy::wait_connected`].
    pub fn build(self) -> Arc<Proxy> {
        let (events, _) = broadcast::channel(32);
        let (connected_tx, _) = watch::channel(false);
        let proxy = Arc::new(Proxy {
            bus: self.bus,
            name: self.name,
            max_depth: self.max_depth,
            target_path: self.target_path,
            target_interface: self.target_interface,
            root: RwLock::new(None),
            owner: RwLock::new(None),
            connected: connected_tx,
            events,
        });
        let task = proxy.clone();
        tokio::spawn(async move {
            if let Err(e) = connect_routine(&task).await {
                warn!(name = %task.name, error = %e, "proxy connect failed");
                let _ = task.events.send(ProxyEvent::Error {
                    message: e.to_string(),
                });
            }
        });
        proxy
    }
}

/// Client-side mirror of a remote service.
pub struct Proxy {
    bus: Arc<Bus>,
    name: String,
    max_depth: Option<u32>,
    target_path: Option<String>,
    target_interface: Option<String>,
    root: RwLock<Option<Arc<ProxyObject>>>,
    owner: RwLock<Option<String>>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ProxyEvent>,
}

impl Proxy {
    /// The well-known name this proxy mirrors.
    pub fn destination(&self) -> &str {
        &self.name
    }

    /// The current owner's unique name, while connected.
    pub fn owner(&self) -> Option<String> {
        self.owner.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Subscribe to connect/disconnect/error events.
    pub fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Wait until the mirror is live.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.connected.subscribe();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            rx.changed().await.map_err(|_| BusError::Disconnected)?;
        }
    }

    /// The mirrored object at `path`, if the pass has reached it.
    pub fn object(&self, path: &str) -> Option<Arc<ProxyObject>> {
        let root = self.root.read().clone()?;
        if path == "/" {
            return Some(root);
        }
        let mut node = root;
        for component in path_components(path) {
            let next = node.children.read().get(component).cloned()?;
            node = next;
        }
        Some(node)
    }

    /// The mirrored interface at `path`, if present.
    pub fn interface(&self, path: &str, interface: &str) -> Option<Arc<ProxyInterface>> {
        self.object(path)?.interface(interface)
    }

    fn within_bounds(&self, path: &str) -> bool {
        if !paths_belong(self.target_path.as_deref(), path) {
            return false;
        }
        match self.max_depth {
            Some(max) => path_depth(path) <= max,
            None => true,
        }
    }

    fn sender_matches(&self, msg: &Message) -> bool {
        match (self.owner.read().as_deref(), msg.sender.as_deref()) {
            (Some(owner), Some(sender)) => owner == sender,
            _ => true,
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    fn intercept_properties_changed(&self, path: &str, msg: &Message) {
        let tree = SignatureTree::parse("sa{sv}as").expect("constant signature");
        let values = match body_to_values(&msg.body, &tree) {
            Ok(values) => values,
            Err(e) => {
                debug!(path, error = %e, "malformed PropertiesChanged dropped");
                return;
            }
        };
        let [Value::Str(iface_name), Value::Dict(changed), Value::Array(invalidated)] =
            values.as_slice()
        else {
            return;
        };
        let Some(iface) = self.interface(path, iface_name) else {
            trace!(path, iface_name, "PropertiesChanged for unmirrored interface");
            return;
        };
        let mut cache = iface.cache.lock();
        for (key, value) in changed.iter() {
            let Some(prop) = key.as_str() else { continue };
            match iface.descriptor.property(prop) {
                Some(desc) if desc.access.is_readable() => {
                    cache.insert(prop.to_owned(), value.clone().into_inner());
                }
                _ => debug!(path, prop, "unknown property in PropertiesChanged dropped"),
            }
        }
        for name in invalidated {
            if let Some(prop) = name.as_str() {
                cache.remove(prop);
            }
        }
        drop(cache);
        // Re-emit on the mirrored Properties interface, after the caches.
        if let Some(props) = self.interface(path, PROPERTIES_IFACE) {
            props.emit_local("PropertiesChanged", values.to_vec());
        }
    }
}

/// A node of the mirrored object tree.
pub struct ProxyObject {
    path: String,
    parent: RwLock<Weak<ProxyObject>>,
    children: RwLock<BTreeMap<String, Arc<ProxyObject>>>,
    interfaces: RwLock<BTreeMap<String, Arc<ProxyInterface>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    manager_watched: AtomicBool,
}

impl ProxyObject {
    fn new(path: &str) -> Arc<Self> {
        Arc::new(ProxyObject {
            path: path.to_owned(),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(BTreeMap::new()),
            interfaces: RwLock::new(BTreeMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            manager_watched: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<Arc<ProxyObject>> {
        self.parent.read().upgrade()
    }

    pub fn interface(&self, name: &str) -> Option<Arc<ProxyInterface>> {
        self.interfaces.read().get(name).cloned()
    }

    pub fn interfaces(&self) -> Vec<Arc<ProxyInterface>> {
        self.interfaces.read().values().cloned().collect()
    }

    pub fn children(&self) -> Vec<Arc<ProxyObject>> {
        self.children.read().values().cloned().collect()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }
}

/// One mirrored interface: dynamic method stubs, cached property cells and
/// signal streams.
pub struct ProxyInterface {
    bus: Arc<Bus>,
    destination: String,
    path: String,
    descriptor: InterfaceDescriptor,
    cache: Mutex<BTreeMap<String, Value>>,
    streams: Mutex<BTreeMap<String, broadcast::Sender<Vec<Value>>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl ProxyInterface {
    fn new(bus: Arc<Bus>, destination: &str, path: &str, descriptor: InterfaceDescriptor) -> Arc<Self> {
        let mut streams = BTreeMap::new();
        for signal in descriptor.signals() {
            let (tx, _) = broadcast::channel(64);
            streams.insert(signal.name.clone(), tx);
        }
        Arc::new(ProxyInterface {
            bus,
            destination: destination.to_owned(),
            path: path.to_owned(),
            descriptor,
            cache: Mutex::new(BTreeMap::new()),
            streams: Mutex::new(streams),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    /// Invoke a remote method. Arity is checked against introspection; the
    /// reply arrives in high-level form, one value per declared output.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let method = self
            .descriptor
            .method(member)
            .ok_or_else(|| BusError::UnknownMethod(format!("{}.{member}", self.name())))?;
        if args.len() != method.inputs.len() {
            return Err(BusError::user(
                "InvalidArgs",
                format!(
                    "{member} takes {} arguments, got {}",
                    method.inputs.len(),
                    args.len()
                ),
            ));
        }
        let body = values_to_body(&args, &method.inputs).map_err(BusError::from)?;
        let msg = Message::method_call(&self.destination, &self.path, self.name(), member)
            .with_body(method.inputs.signature(), body);
        self.bus.router().call(msg, true).await?.into_values()
    }

    /// The cached value of a readable property, as delivered by the
    /// priming `GetAll` or the latest `PropertiesChanged`.
    pub fn cached(&self, property: &str) -> Result<Value> {
        let desc = self
            .descriptor
            .property(property)
            .ok_or_else(|| BusError::NoSuchProperty {
                interface: self.name().to_owned(),
                name: property.to_owned(),
            })?;
        if !desc.access.is_readable() {
            return Err(BusError::PropertyWriteOnly {
                interface: self.name().to_owned(),
                name: property.to_owned(),
            });
        }
        self.cache
            .lock()
            .get(property)
            .cloned()
            .ok_or_else(|| BusError::InvalidReply(format!("{property} not primed yet")))
    }

    /// Write a remote property through `Properties.Set`.
    pub async fn set(&self, property: &str, value: Value) -> Result<()> {
        let desc = self
            .descriptor
            .property(property)
            .ok_or_else(|| BusError::NoSuchProperty {
                interface: self.name().to_owned(),
                name: property.to_owned(),
            })?;
        if !desc.access.is_writable() {
            return Err(BusError::PropertyReadOnly {
                interface: self.name().to_owned(),
                name: property.to_owned(),
            });
        }
        let variant = Value::Variant(Box::new(Variant::new(desc.node.clone(), value)));
        let tree = SignatureTree::parse("ssv").expect("constant signature");
        let body = values_to_body(
            &[
                Value::Str(self.name().to_owned()),
                Value::Str(property.to_owned()),
                variant,
            ],
            &tree,
        )
        .map_err(BusError::from)?;
        let msg = Message::method_call(&self.destination, &self.path, PROPERTIES_IFACE, "Set")
            .with_body(tree.signature(), body);
        self.bus.router().call(msg, false).await?;
        Ok(())
    }

    /// Stream of a declared signal's argument lists.
    pub fn subscribe(&self, signal: &str) -> Result<broadcast::Receiver<Vec<Value>>> {
        self.streams
            .lock()
            .get(signal)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| BusError::UnknownMethod(format!("{}.{signal}", self.name())))
    }

    fn emit_local(&self, signal: &str, values: Vec<Value>) {
        if let Some(tx) = self.streams.lock().get(signal) {
            let _ = tx.send(values);
        }
    }

    fn prime_cache(&self, all: &nbus_proto::Dict) {
        let mut cache = self.cache.lock();
        for (key, value) in all.iter() {
            let Some(prop) = key.as_str() else { continue };
            if self
                .descriptor
                .property(prop)
                .map(|d| d.access.is_readable())
                .unwrap_or(false)
            {
                cache.insert(prop.to_owned(), value.clone().into_inner());
            } else {
                debug!(prop, "GetAll returned an undeclared property, dropped");
            }
        }
    }
}

type BoxedTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

async fn connect_routine(proxy: &Arc<Proxy>) -> Result<()> {
    ensure_owner(proxy).await?;
    let owner = proxy.bus.get_name_owner(&proxy.name).await?;
    *proxy.owner.write() = Some(owner);

    build_tree(proxy.clone()).await?;
    install_owner_watch(proxy).await?;

    proxy.set_connected(true);
    let _ = proxy.events.send(ProxyEvent::Connected);
    debug!(name = %proxy.name, "proxy connected");
    Ok(())
}

/// Make sure the target name is owned: try activation if the daemon lists
/// it as activatable, then wait for a `NameOwnerChanged` announcing an
/// owner.
async fn ensure_owner(proxy: &Arc<Proxy>) -> Result<()> {
    if proxy.bus.name_has_owner(&proxy.name).await? {
        return Ok(());
    }
    let activatable = proxy.bus.list_activatable_names().await?;
    if activatable.iter().any(|n| *n == proxy.name) {
        debug!(name = %proxy.name, "starting activatable service");
        proxy.bus.start_service_by_name(&proxy.name, 0).await?;
    }
    wait_for_owner(proxy).await
}

async fn wait_for_owner(proxy: &Arc<Proxy>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<()>(4);
    let name = proxy.name.clone();
    let handler: SignalHandler = Arc::new(move |msg| {
        let tx = tx.clone();
        let name = name.clone();
        Box::pin(async move {
            if let Some((changed, new_owner)) = parse_name_owner_changed(&msg) {
                if changed == name && !new_owner.is_empty() {
                    let _ = tx.try_send(());
                }
            }
        })
    });
    let rule = MatchRule::signal(DAEMON_PATH, DAEMON_IFACE, "NameOwnerChanged");
    let key = (
        DAEMON_PATH.to_owned(),
        DAEMON_IFACE.to_owned(),
        "NameOwnerChanged".to_owned(),
    );
    let sub = proxy.bus.router().add_match(&rule, key, handler).await?;
    // Close the race between the owner check and the subscription.
    if !proxy.bus.name_has_owner(&proxy.name).await? {
        rx.recv().await;
    }
    proxy.bus.router().remove_match(sub).await?;
    Ok(())
}

fn parse_name_owner_changed(msg: &Message) -> Option<(String, String)> {
    let tree = SignatureTree::parse("sss").expect("constant signature");
    let values = body_to_values(&msg.body, &tree).ok()?;
    let [Value::Str(name), Value::Str(_old), Value::Str(new)] = values.as_slice() else {
        return None;
    };
    Some((name.clone(), new.clone()))
}

async fn build_tree(proxy: Arc<Proxy>) -> Result<()> {
    let root = ProxyObject::new("/");
    *proxy.root.write() = Some(root);
    watch_properties(&proxy, "/").await?;
    // The pass always starts at the root; a target path below it prunes
    // sibling branches through the belonging test.
    introspect_path(proxy.clone(), "/".to_owned()).await
}

fn introspect_path(proxy: Arc<Proxy>, path: String) -> BoxedTask {
    Box::pin(async move {
        if !proxy.within_bounds(&path) {
            return Ok(());
        }
        trace!(name = %proxy.name, path, "introspecting");
        let xml = introspect_remote(&proxy, &path).await?;
        let parsed = introspect::parse(&xml)?;

        let object = ensure_object(&proxy, &path).await?;
        let has_manager = parsed
            .interfaces
            .iter()
            .any(|d| d.name() == OBJECT_MANAGER_IFACE);

        for desc in parsed.interfaces {
            let name = desc.name().to_owned();
            let is_standard = standard::is_standard_interface(&name);
            if !is_standard {
                if let Some(target) = &proxy.target_interface {
                    if name != *target {
                        continue;
                    }
                }
            }
            // Replace a previously mirrored interface wholesale.
            if let Some(old) = object.interface(&name) {
                teardown_interface(&proxy, &old).await;
            }
            let iface = ProxyInterface::new(
                proxy.bus.clone(),
                &proxy.name,
                &path,
                desc,
            );
            if !is_standard {
                prime_interface(&proxy, &iface).await;
                subscribe_signals(&proxy, &iface).await?;
            }
            object
                .interfaces
                .write()
                .insert(name, iface);
        }

        if has_manager {
            watch_manager(&proxy, &object).await?;
        }

        let descents: Vec<BoxedTask> = parsed
            .children
            .iter()
            .map(|child| join_paths(&path, child))
            .filter(|child_path| proxy.within_bounds(child_path))
            .map(|child_path| introspect_path(proxy.clone(), child_path))
            .collect();
        futures::future::try_join_all(descents).await?;
        Ok(())
    })
}

async fn introspect_remote(proxy: &Arc<Proxy>, path: &str) -> Result<String> {
    let msg = Message::method_call(&proxy.name, path, INTROSPECTABLE_IFACE, "Introspect");
    let values = proxy.bus.router().call(msg, true).await?.into_values()?;
    match values.into_iter().next() {
        Some(Value::Str(xml)) => Ok(xml),
        _ => Err(BusError::InvalidReply("Introspect".into())),
    }
}

/// Walk/create mirror objects down to `path`, installing the
/// `PropertiesChanged` interception at every fresh node.
async fn ensure_object(proxy: &Arc<Proxy>, path: &str) -> Result<Arc<ProxyObject>> {
    let root = proxy
        .root
        .read()
        .clone()
        .ok_or(BusError::Disconnected)?;
    if path == "/" {
        return Ok(root);
    }
    let mut node = root;
    let mut walked = String::new();
    for component in path_components(path) {
        walked.push('/');
        walked.push_str(component);
        let mut created = false;
        let child = {
            let mut children = node.children.write();
            children
                .entry(component.to_owned())
                .or_insert_with(|| {
                    created = true;
                    let child = ProxyObject::new(&walked);
                    *child.parent.write() = Arc::downgrade(&node);
                    child
                })
                .clone()
        };
        if created {
            watch_properties(proxy, &walked).await?;
        }
        node = child;
    }
    Ok(node)
}

/// Install the object-level `PropertiesChanged` interception for `path`.
async fn watch_properties(proxy: &Arc<Proxy>, path: &str) -> Result<()> {
    let weak = Arc::downgrade(proxy);
    let handler_path = path.to_owned();
    let handler: SignalHandler = Arc::new(move |msg| {
        let proxy = weak.clone();
        let path = handler_path.clone();
        Box::pin(async move {
            let Some(proxy) = proxy.upgrade() else { return };
            if !proxy.sender_matches(&msg) {
                return;
            }
            proxy.intercept_properties_changed(&path, &msg);
        })
    });
    let rule = MatchRule::signal(path, PROPERTIES_IFACE, "PropertiesChanged");
    let key = (
        path.to_owned(),
        PROPERTIES_IFACE.to_owned(),
        "PropertiesChanged".to_owned(),
    );
    let sub = proxy.bus.router().add_match(&rule, key, handler).await?;
    if let Some(object) = proxy.object(path) {
        object.subscriptions.lock().push(sub);
    }
    Ok(())
}

/// Install `InterfacesAdded`/`InterfacesRemoved` maintenance for a node
/// that exposes `ObjectManager`.
async fn watch_manager(proxy: &Arc<Proxy>, object: &Arc<ProxyObject>) -> Result<()> {
    if object.manager_watched.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let path = object.path.clone();

    let weak = Arc::downgrade(proxy);
    let manager_path = object.path.clone();
    let added: SignalHandler = Arc::new(move |msg| {
        let proxy = weak.clone();
        let manager_path = manager_path.clone();
        Box::pin(async move {
            let Some(proxy) = proxy.upgrade() else { return };
            if !proxy.sender_matches(&msg) {
                return;
            }
            let tree = SignatureTree::parse("oa{sa{sv}}").expect("constant signature");
            let Ok(values) = body_to_values(&msg.body, &tree) else { return };
            let Some(Value::ObjectPath(added_path)) = values.first().cloned() else {
                return;
            };
            if proxy.within_bounds(&added_path) {
                if let Err(e) = introspect_path(proxy.clone(), added_path.clone()).await {
                    debug!(path = added_path, error = %e, "re-introspection failed");
                }
            }
            if let Some(om) = proxy.interface(&manager_path, OBJECT_MANAGER_IFACE) {
                om.emit_local("InterfacesAdded", values);
            }
        })
    });
    let rule = MatchRule::signal(&path, OBJECT_MANAGER_IFACE, "InterfacesAdded");
    let key = (
        path.clone(),
        OBJECT_MANAGER_IFACE.to_owned(),
        "InterfacesAdded".to_owned(),
    );
    let sub = proxy.bus.router().add_match(&rule, key, added).await?;
    object.subscriptions.lock().push(sub);

    let weak = Arc::downgrade(proxy);
    let manager_path = object.path.clone();
    let removed: SignalHandler = Arc::new(move |msg| {
        let proxy = weak.clone();
        let manager_path = manager_path.clone();
        Box::pin(async move {
            let Some(proxy) = proxy.upgrade() else { return };
            if !proxy.sender_matches(&msg) {
                return;
            }
            let tree = SignatureTree::parse("oas").expect("constant signature");
            let Ok(values) = body_to_values(&msg.body, &tree) else { return };
            let [Value::ObjectPath(removed_path), Value::Array(names)] = values.as_slice()
            else {
                return;
            };
            let interfaces: Vec<String> = names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_owned))
                .collect();
            handle_interfaces_removed(&proxy, removed_path, &interfaces).await;
            if let Some(om) = proxy.interface(&manager_path, OBJECT_MANAGER_IFACE) {
                om.emit_local("InterfacesRemoved", values.to_vec());
            }
        })
    });
    let rule = MatchRule::signal(&path, OBJECT_MANAGER_IFACE, "InterfacesRemoved");
    let key = (
        path,
        OBJECT_MANAGER_IFACE.to_owned(),
        "InterfacesRemoved".to_owned(),
    );
    let sub = proxy.bus.router().add_match(&rule, key, removed).await?;
    object.subscriptions.lock().push(sub);
    Ok(())
}

/// Apply one `InterfacesRemoved` to the mirror. An empty interface list is
/// the whole-subtree convention: the object and everything below it go.
async fn handle_interfaces_removed(proxy: &Arc<Proxy>, path: &str, interfaces: &[String]) {
    let Some(object) = proxy.object(path) else {
        trace!(path, "InterfacesRemoved for unmirrored object");
        return;
    };
    if interfaces.is_empty() {
        remove_object(proxy, &object).await;
        return;
    }
    for name in interfaces {
        let removed = object.interfaces.write().remove(name);
        if let Some(iface) = removed {
            teardown_interface(proxy, &iface).await;
        }
    }
    if object.interfaces.read().is_empty() && object.path != "/" {
        remove_object(proxy, &object).await;
    }
}

async fn remove_object(proxy: &Arc<Proxy>, object: &Arc<ProxyObject>) {
    teardown_object(proxy, object).await;
    if let Some(parent) = object.parent() {
        let component = path_components(&object.path)
            .last()
            .map(|c| (*c).to_owned())
            .unwrap_or_default();
        parent.children.write().remove(&component);
    }
    *object.parent.write() = Weak::new();
}

fn teardown_object<'a>(
    proxy: &'a Arc<Proxy>,
    object: &'a Arc<ProxyObject>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        for child in object.children() {
            teardown_object(proxy, &child).await;
        }
        object.children.write().clear();
        let interfaces: Vec<Arc<ProxyInterface>> = object.interfaces.read().values().cloned().collect();
        for iface in interfaces {
            teardown_interface(proxy, &iface).await;
        }
        object.interfaces.write().clear();
        let subs: Vec<SubscriptionId> = object.subscriptions.lock().drain(..).collect();
        for sub in subs {
            let _ = proxy.bus.router().remove_match(sub).await;
        }
        object.manager_watched.store(false, Ordering::SeqCst);
    })
}

async fn teardown_interface(proxy: &Arc<Proxy>, iface: &Arc<ProxyInterface>) {
    let subs: Vec<SubscriptionId> = iface.subscriptions.lock().drain(..).collect();
    for sub in subs {
        let _ = proxy.bus.router().remove_match(sub).await;
    }
}

/// Prime the readable property cache with one `GetAll`.
async fn prime_interface(proxy: &Arc<Proxy>, iface: &Arc<ProxyInterface>) {
    let tree = SignatureTree::parse("s").expect("constant signature");
    let body = match values_to_body(&[Value::Str(iface.name().to_owned())], &tree) {
        Ok(body) => body,
        Err(_) => return,
    };
    let msg = Message::method_call(&proxy.name, &iface.path, PROPERTIES_IFACE, "GetAll")
        .with_body(tree.signature(), body);
    match proxy.bus.router().call(msg, true).await {
        Ok(reply) => match reply.into_values() {
            Ok(values) => {
                if let Some(Value::Dict(all)) = values.into_iter().next() {
                    iface.prime_cache(&all);
                }
            }
            Err(e) => debug!(interface = iface.name(), error = %e, "GetAll reply rejected"),
        },
        Err(e) => debug!(interface = iface.name(), error = %e, "GetAll failed"),
    }
}

/// Subscribe the router to each declared signal of a mirrored interface.
async fn subscribe_signals(proxy: &Arc<Proxy>, iface: &Arc<ProxyInterface>) -> Result<()> {
    let signals: Vec<(String, SignatureTree)> = iface
        .descriptor
        .signals()
        .map(|s| (s.name.clone(), s.args.clone()))
        .collect();
    for (signal, args) in signals {
        let weak_iface = Arc::downgrade(iface);
        let weak_proxy = Arc::downgrade(proxy);
        let signal_name = signal.clone();
        let handler: SignalHandler = Arc::new(move |msg| {
            let iface = weak_iface.clone();
            let proxy = weak_proxy.clone();
            let args = args.clone();
            let signal_name = signal_name.clone();
            Box::pin(async move {
                let Some(iface) = iface.upgrade() else { return };
                if let Some(proxy) = proxy.upgrade() {
                    if !proxy.sender_matches(&msg) {
                        return;
                    }
                }
                match body_to_values(&msg.body, &args) {
                    Ok(values) => iface.emit_local(&signal_name, values),
                    Err(e) => {
                        debug!(signal = signal_name, error = %e, "signal body rejected")
                    }
                }
            })
        });
        let rule = MatchRule::signal(&iface.path, iface.name(), &signal);
        let key = (iface.path.clone(), iface.name().to_owned(), signal);
        let sub = proxy.bus.router().add_match(&rule, key, handler).await?;
        iface.subscriptions.lock().push(sub);
    }
    Ok(())
}

/// Long-lived owner watch: drives the disconnect/reconnect cycle.
async fn install_owner_watch(proxy: &Arc<Proxy>) -> Result<()> {
    let weak = Arc::downgrade(proxy);
    let handler: SignalHandler = Arc::new(move |msg| {
        let proxy = weak.clone();
        Box::pin(async move {
            let Some(proxy) = proxy.upgrade() else { return };
            let Some((name, new_owner)) = parse_name_owner_changed(&msg) else {
                return;
            };
            if name != proxy.name {
                return;
            }
            if new_owner.is_empty() {
                debug!(name = %proxy.name, "owner gone");
                *proxy.owner.write() = None;
                proxy.set_connected(false);
                let _ = proxy.events.send(ProxyEvent::Disconnected);
            } else {
                debug!(name = %proxy.name, owner = %new_owner, "owner back, rebuilding");
                *proxy.owner.write() = Some(new_owner);
                let stale_root = proxy.root.write().take();
                if let Some(root) = stale_root {
                    teardown_object(&proxy, &root).await;
                }
                match build_tree(proxy.clone()).await {
                    Ok(()) => {
                        proxy.set_connected(true);
                        let _ = proxy.events.send(ProxyEvent::Connected);
                    }
                    Err(e) => {
                        let _ = proxy.events.send(ProxyEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
        })
    });
    let rule = MatchRule::signal(DAEMON_PATH, DAEMON_IFACE, "NameOwnerChanged");
    let key = (
        DAEMON_PATH.to_owned(),
        DAEMON_IFACE.to_owned(),
        "NameOwnerChanged".to_owned(),
    );
    proxy.bus.router().add_match(&rule, key, handler).await?;
    Ok(())
}
