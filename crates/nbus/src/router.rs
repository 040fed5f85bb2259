//! The message router
//!
//! Single multiplexing point over the bus transport. The router owns the
//! serial counter, the pending-reply table, the match subscriptions, the
//! raw method handlers and the exposed-service registry; everything the
//! process sends or receives passes through here.
//!
//! Outgoing traffic is funnelled through one writer task so that replies
//! and signals leave in the order they were produced, and so that signal
//! emission never has to await the transport. Incoming traffic is read by
//! one dispatch task; method calls are served on their own tasks, signal
//! subscribers each drain a private ordered queue.

use crate::bus::BusEvent;
use crate::error::{BusError, Result};
use crate::service::Service;
use crate::standard;
use crate::transport::Transport;
use nbus_proto::bridge::{body_to_values, values_to_body};
use nbus_proto::message::error_name;
use nbus_proto::{MatchRule, Message, MessageKind, Signature, SignatureTree, Value, WireValue};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Signal subscription key: the (path, interface, member) triple a signal
/// is delivered under.
pub type MatchKey = (String, String, String);

/// Handler invoked for every signal delivered to a subscription.
pub type SignalHandler =
    Arc<dyn Fn(Arc<Message>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Raw method handler, registered against a (path, interface, member)
/// triple for calls that no exposed service tree resolves.
pub type RawMethodHandler = Arc<
    dyn Fn(Message) -> Pin<Box<dyn Future<Output = Result<(Signature, Vec<WireValue>)>> + Send>>
        + Send
        + Sync,
>;

/// Identifies one signal subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Body of a resolved reply.
#[derive(Debug, Clone)]
pub enum ReplyBody {
    /// Marshal form together with the reply signature.
    Wire {
        signature: Signature,
        body: Vec<WireValue>,
    },
    /// High-level form, already bridged against the reply signature.
    Values(Vec<Value>),
}

impl ReplyBody {
    /// The high-level form, bridging on demand if needed.
    pub fn into_values(self) -> Result<Vec<Value>> {
        match self {
            ReplyBody::Values(values) => Ok(values),
            ReplyBody::Wire { signature, body } => {
                let tree = signature.tree();
                Ok(body_to_values(&body, &tree)?)
            }
        }
    }
}

struct PendingEntry {
    tx: oneshot::Sender<Result<ReplyBody>>,
    translate: bool,
}

/// An in-flight method call: awaitable reply plus a cancel handle.
pub struct PendingReply {
    serial: u32,
    rx: oneshot::Receiver<Result<ReplyBody>>,
    router: Weak<Router>,
}

impl PendingReply {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Wait for the reply or error.
    pub async fn wait(self) -> Result<ReplyBody> {
        self.rx.await.map_err(|_| BusError::Cancelled)?
    }

    /// Abandon the call. The pending entry is removed; a late reply is
    /// dropped silently by the dispatch loop.
    pub fn cancel(self) {
        if let Some(router) = self.router.upgrade() {
            if router.pending.lock().remove(&self.serial).is_some() {
                debug!(serial = self.serial, "pending call cancelled");
            }
        }
    }
}

type MatchSlot = (String, MatchKey);

struct MatchEntry {
    handlers: Vec<(u64, mpsc::UnboundedSender<Arc<Message>>)>,
}

#[derive(Default)]
struct MatchTable {
    entries: HashMap<MatchSlot, MatchEntry>,
    by_id: HashMap<u64, MatchSlot>,
    next_id: u64,
}

/// The multiplexing point over one bus connection.
pub struct Router {
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    next_serial: AtomicU32,
    pending: Mutex<HashMap<u32, PendingEntry>>,
    matches: Mutex<MatchTable>,
    services: RwLock<Vec<(String, Arc<Service>)>>,
    handlers: RwLock<HashMap<MatchKey, RawMethodHandler>>,
    unique_name: RwLock<Option<String>>,
    events: broadcast::Sender<BusEvent>,
}

impl Router {
    pub fn new(transport: Arc<dyn Transport>, events: broadcast::Sender<BusEvent>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Router {
            transport,
            outbound: tx,
            outbound_rx: Mutex::new(Some(rx)),
            next_serial: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            matches: Mutex::new(MatchTable::default()),
            services: RwLock::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            unique_name: RwLock::new(None),
            events,
        })
    }

    /// The machine identifier of the underlying transport.
    pub fn machine_id(&self) -> String {
        self.transport.machine_id()
    }

    pub fn unique_name(&self) -> Option<String> {
        self.unique_name.read().clone()
    }

    pub(crate) fn set_unique_name(&self, name: String) {
        *self.unique_name.write() = Some(name);
    }

    fn enqueue(&self, mut msg: Message) -> Result<u32> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        msg.serial = serial;
        trace!(kind = ?msg.kind, serial, member = ?msg.member, "enqueue");
        self.outbound
            .send(msg)
            .map_err(|_| BusError::Disconnected)?;
        Ok(serial)
    }

    /// Send a method call and record the pending reply.
    ///
    /// With `translate` set, the reply body is bridged into high-level
    /// values against the reply's own signature before the caller sees it.
    pub fn invoke(self: &Arc<Self>, mut msg: Message, translate: bool) -> Result<PendingReply> {
        msg.kind = MessageKind::MethodCall;
        let (tx, rx) = oneshot::channel();
        // Reserve the serial before sending so a fast reply always finds
        // its entry.
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        msg.serial = serial;
        self.pending
            .lock()
            .insert(serial, PendingEntry { tx, translate });
        trace!(serial, member = ?msg.member, destination = ?msg.destination, "invoke");
        if self.outbound.send(msg).is_err() {
            self.pending.lock().remove(&serial);
            return Err(BusError::Disconnected);
        }
        Ok(PendingReply {
            serial,
            rx,
            router: Arc::downgrade(self),
        })
    }

    /// Invoke and wait in one step.
    pub async fn call(self: &Arc<Self>, msg: Message, translate: bool) -> Result<ReplyBody> {
        self.invoke(msg, translate)?.wait().await
    }

    /// Serial-only send of a signal; no pending correlation.
    pub fn send_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        signature: Signature,
        body: Vec<WireValue>,
    ) -> Result<()> {
        let msg = Message::signal(path, interface, member).with_body(signature, body);
        self.enqueue(msg)?;
        Ok(())
    }

    /// Reply to `original` with a method return.
    pub fn send_reply(
        &self,
        original: &Message,
        signature: Signature,
        body: Vec<WireValue>,
    ) -> Result<()> {
        let msg = Message::method_return(original).with_body(signature, body);
        self.enqueue(msg)?;
        Ok(())
    }

    /// Reply to `original` with an error.
    pub fn send_error(&self, original: &Message, name: &str, text: &str) -> Result<()> {
        self.enqueue(Message::error(original, name, text))?;
        Ok(())
    }

    /// Reply to `original` with the wire form of `err`.
    pub fn send_error_of(&self, original: &Message, err: &BusError) -> Result<()> {
        let (name, text) = err.to_wire();
        self.send_error(original, &name, &text)
    }

    /// Register a raw method handler for calls no service tree resolves.
    pub fn register_method_handler(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        handler: RawMethodHandler,
    ) {
        self.handlers.write().insert(
            (path.to_owned(), interface.to_owned(), member.to_owned()),
            handler,
        );
    }

    pub fn unregister_method_handler(&self, path: &str, interface: &str, member: &str) {
        self.handlers
            .write()
            .remove(&(path.to_owned(), interface.to_owned(), member.to_owned()));
    }

    /// Register an exposed service under its well-known name.
    pub fn register_service(&self, name: &str, service: Arc<Service>) {
        let mut services = self.services.write();
        services.retain(|(n, _)| n != name);
        services.push((name.to_owned(), service));
    }

    pub fn unregister_service(&self, name: &str) -> Option<Arc<Service>> {
        let mut services = self.services.write();
        let idx = services.iter().position(|(n, _)| n == name)?;
        Some(services.remove(idx).1)
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
    }

    /// Subscribe to signals under `key`, installing the daemon-side match
    /// on first use of the `(rule, key)` slot.
    ///
    /// Every subscription drains its own ordered queue, so one slow
    /// handler never reorders or blocks the others.
    pub async fn add_match(
        self: &Arc<Self>,
        rule: &MatchRule,
        key: MatchKey,
        handler: SignalHandler,
    ) -> Result<SubscriptionId> {
        let rule_text = rule.render();
        let slot: MatchSlot = (rule_text.clone(), key);
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Message>>();
        let (id, new_slot) = {
            let mut table = self.matches.lock();
            table.next_id += 1;
            let id = table.next_id;
            let new_slot = !table.entries.contains_key(&slot);
            table
                .entries
                .entry(slot.clone())
                .or_insert_with(|| MatchEntry {
                    handlers: Vec::new(),
                })
                .handlers
                .push((id, tx));
            table.by_id.insert(id, slot.clone());
            (id, new_slot)
        };
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg).await;
            }
        });
        if new_slot {
            if let Err(e) = self.daemon_add_match(&rule_text).await {
                let mut table = self.matches.lock();
                if let Some(entry) = table.entries.get_mut(&slot) {
                    entry.handlers.retain(|(i, _)| *i != id);
                    if entry.handlers.is_empty() {
                        table.entries.remove(&slot);
                    }
                }
                table.by_id.remove(&id);
                return Err(e);
            }
        }
        Ok(SubscriptionId(id))
    }

    /// Drop one subscription; the last removal for a `(rule, key)` slot
    /// removes the daemon-side match.
    pub async fn remove_match(self: &Arc<Self>, id: SubscriptionId) -> Result<()> {
        let removed_slot = {
            let mut table = self.matches.lock();
            let Some(slot) = table.by_id.remove(&id.0) else {
                return Ok(());
            };
            let mut emptied = false;
            if let Some(entry) = table.entries.get_mut(&slot) {
                entry.handlers.retain(|(i, _)| *i != id.0);
                emptied = entry.handlers.is_empty();
            }
            if emptied {
                table.entries.remove(&slot);
                Some(slot.0)
            } else {
                None
            }
        };
        if let Some(rule_text) = removed_slot {
            self.daemon_remove_match(&rule_text).await?;
        }
        Ok(())
    }

    async fn daemon_add_match(self: &Arc<Self>, rule: &str) -> Result<()> {
        let msg = Message::method_call(
            crate::bus::DAEMON_NAME,
            crate::bus::DAEMON_PATH,
            crate::bus::DAEMON_IFACE,
            "AddMatch",
        )
        .with_body(
            Signature::new("s").expect("constant signature"),
            vec![WireValue::Str(rule.to_owned())],
        );
        self.call(msg, false).await?;
        Ok(())
    }

    async fn daemon_remove_match(self: &Arc<Self>, rule: &str) -> Result<()> {
        let msg = Message::method_call(
            crate::bus::DAEMON_NAME,
            crate::bus::DAEMON_PATH,
            crate::bus::DAEMON_IFACE,
            "RemoveMatch",
        )
        .with_body(
            Signature::new("s").expect("constant signature"),
            vec![WireValue::Str(rule.to_owned())],
        );
        self.call(msg, false).await?;
        Ok(())
    }

    /// Run the writer half: drain the outbound queue into the transport.
    pub(crate) async fn run_writer(self: Arc<Self>) {
        let mut rx = match self.outbound_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.transport.send(msg).await {
                warn!(error = %e, "transport write failed");
                self.fail_pending(&e);
                let _ = self.events.send(BusEvent::Error {
                    message: e.to_string(),
                });
                return;
            }
        }
    }

    /// Run the reader half: dispatch inbound messages until the transport
    /// fails or closes.
    pub(crate) async fn run_dispatch(self: Arc<Self>) {
        loop {
            match self.transport.recv().await {
                Ok(msg) => self.dispatch(msg),
                Err(e) => {
                    debug!(error = %e, "transport closed");
                    self.fail_pending(&e);
                    let _ = self.events.send(BusEvent::Error {
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    fn fail_pending(&self, err: &BusError) {
        let entries: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            let _ = entry.tx.send(Err(err.clone()));
        }
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg.kind {
            MessageKind::MethodReturn | MessageKind::Error => self.resolve_reply(msg),
            MessageKind::Signal => self.deliver_signal(msg),
            MessageKind::MethodCall => self.dispatch_call(msg),
        }
    }

    fn resolve_reply(&self, msg: Message) {
        let Some(reply_serial) = msg.reply_serial else {
            debug!("reply without reply-serial dropped");
            return;
        };
        let Some(entry) = self.pending.lock().remove(&reply_serial) else {
            // Stale acknowledgement, e.g. a reply to a cancelled call.
            debug!(reply_serial, "unmatched reply dropped");
            return;
        };
        let result = if msg.kind == MessageKind::Error {
            let name = msg
                .error_name
                .clone()
                .unwrap_or_else(|| error_name::FAILED.to_owned());
            let text = msg.error_text().unwrap_or("").to_owned();
            Err(BusError::from_wire(&name, &text))
        } else if entry.translate {
            let tree = match &msg.signature {
                Some(sig) => sig.tree(),
                None => SignatureTree::empty(),
            };
            body_to_values(&msg.body, &tree)
                .map(ReplyBody::Values)
                .map_err(BusError::from)
        } else {
            Ok(ReplyBody::Wire {
                signature: msg.signature.clone().unwrap_or_else(Signature::empty),
                body: msg.body,
            })
        };
        let _ = entry.tx.send(result);
    }

    fn deliver_signal(self: &Arc<Self>, msg: Message) {
        let (Some(path), Some(interface), Some(member)) =
            (msg.path.clone(), msg.interface.clone(), msg.member.clone())
        else {
            debug!("signal without full key dropped");
            return;
        };
        let key: MatchKey = (path, interface, member);
        let msg = Arc::new(msg);
        let table = self.matches.lock();
        for ((_, entry_key), entry) in table.entries.iter() {
            if *entry_key == key {
                for (_, tx) in &entry.handlers {
                    let _ = tx.send(msg.clone());
                }
            }
        }
    }

    fn dispatch_call(self: &Arc<Self>, msg: Message) {
        // Calls addressed to an exposed well-known name go straight to
        // that service.
        if let Some(dest) = &msg.destination {
            if let Some(service) = self.service(dest) {
                let router = self.clone();
                tokio::spawn(async move {
                    dispatch_to_service(router, service, msg).await;
                });
                return;
            }
        }
        // Calls addressed to the unique name: resolve the path against
        // every exposed tree, then fall back to raw handlers.
        if let Some(path) = &msg.path {
            let service = self
                .services
                .read()
                .iter()
                .find(|(_, s)| s.object_at(path).is_some())
                .map(|(_, s)| s.clone());
            if let Some(service) = service {
                let router = self.clone();
                tokio::spawn(async move {
                    dispatch_to_service(router, service, msg).await;
                });
                return;
            }
        }
        let handler = match (&msg.path, &msg.interface, &msg.member) {
            (Some(p), Some(i), Some(m)) => self
                .handlers
                .read()
                .get(&(p.clone(), i.clone(), m.clone()))
                .cloned(),
            _ => None,
        };
        if let Some(handler) = handler {
            let router = self.clone();
            tokio::spawn(async move {
                match handler(msg.clone()).await {
                    Ok((signature, body)) => {
                        let _ = router.send_reply(&msg, signature, body);
                    }
                    Err(e) => {
                        let _ = router.send_error_of(&msg, &e);
                    }
                }
            });
            return;
        }
        let dest = msg.destination.clone().unwrap_or_default();
        let _ = self.send_error_of(&msg, &BusError::UnknownService(dest));
    }
}

/// Serve one method call against an exposed service tree.
async fn dispatch_to_service(router: Arc<Router>, service: Arc<Service>, msg: Message) {
    let path = msg.path.clone().unwrap_or_default();
    let Some(node) = service.object_at(&path) else {
        let _ = router.send_error_of(&msg, &BusError::UnknownObject(path));
        return;
    };
    let interface = msg.interface.clone().unwrap_or_default();
    if standard::is_standard_interface(&interface) {
        standard::dispatch(&router, &service, &node, &msg).await;
        return;
    }
    let Some(iface) = node.interface(&interface) else {
        let _ = router.send_error_of(&msg, &BusError::UnknownInterface(interface));
        return;
    };
    let member = msg.member.clone().unwrap_or_default();
    let Some(method) = iface.descriptor().method(&member).cloned() else {
        let _ = router.send_error_of(&msg, &BusError::UnknownMethod(member));
        return;
    };
    let args = match body_to_values(&msg.body, &method.inputs) {
        Ok(args) => args,
        Err(e) => {
            let _ = router.send_error_of(&msg, &e.into());
            return;
        }
    };
    match iface.invoke(&member, args, msg.sender.clone()).await {
        Ok(outputs) => match values_to_body(&outputs, &method.outputs) {
            Ok(body) => {
                let _ = router.send_reply(&msg, method.outputs.signature(), body);
            }
            Err(e) => {
                warn!(member, error = %e, "method output did not match its signature");
                let _ = router.send_error_of(&msg, &e.into());
            }
        },
        Err(e) => {
            let _ = router.send_error_of(&msg, &e);
        }
    }
}
