//! Embedded message-bus broker
//!
//! An in-process bus: connections are in-memory transport pairs, each
//! serviced by its own task. The broker implements the daemon surface the
//! stack consumes — unique-name assignment, name ownership, match-keyed
//! signal broadcast, activation — and routes everything else by
//! destination. Hosts embed it to run several [`crate::bus::Bus`]
//! connections inside one process; the integration tests run entirely on
//! top of it.

use crate::bus::{DAEMON_IFACE, DAEMON_NAME, DAEMON_PATH, REQUEST_NAME_REPLACE_EXISTING};
use crate::error::Result;
use crate::transport::{memory_pair, MemoryTransport, Transport};
use nbus_proto::bridge::{body_to_values, values_to_body};
use nbus_proto::message::error_name;
use nbus_proto::names::validate_bus_name;
use nbus_proto::{MatchRule, Message, MessageKind, SignatureTree, Value, WireValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Hook run when an activatable name is started.
pub type ActivationHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

static BROKER_SEQ: AtomicU64 = AtomicU64::new(0);

struct Conn {
    unique: String,
    transport: Arc<MemoryTransport>,
    matches: RwLock<Vec<MatchRule>>,
}

struct BrokerInner {
    machine_id: String,
    unix_user: u32,
    next_unique: AtomicU32,
    next_serial: AtomicU32,
    conns: RwLock<HashMap<String, Arc<Conn>>>,
    names: RwLock<HashMap<String, String>>,
    activatable: RwLock<HashMap<String, ActivationHook>>,
    activation_env: RwLock<HashMap<String, String>>,
}

/// An in-process message bus.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let seq = BROKER_SEQ.fetch_add(1, Ordering::SeqCst);
        Broker {
            inner: Arc::new(BrokerInner {
                machine_id: format!("nbus-{}-{seq}", std::process::id()),
                unix_user: 1000,
                next_unique: AtomicU32::new(1),
                next_serial: AtomicU32::new(1),
                conns: RwLock::new(HashMap::new()),
                names: RwLock::new(HashMap::new()),
                activatable: RwLock::new(HashMap::new()),
                activation_env: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The broker's stable identifier, also used as the machine id of
    /// every connection it hands out.
    pub fn machine_id(&self) -> String {
        self.inner.machine_id.clone()
    }

    /// Open a new connection; the returned transport is ready for
    /// [`crate::bus::Bus::connect`].
    pub fn connect(&self) -> Arc<dyn Transport> {
        let (client, server) = memory_pair(&self.inner.machine_id);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            connection_loop(inner, server).await;
        });
        client
    }

    /// Register a name the broker can activate on demand. The hook runs at
    /// most once per `StartServiceByName` while the name is unowned; it is
    /// expected to connect a bus and expose the service.
    pub fn register_activatable(&self, name: &str, hook: ActivationHook) {
        self.inner
            .activatable
            .write()
            .insert(name.to_owned(), hook);
    }

    /// Current owner of a name, if any.
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.inner.names.read().get(name).cloned()
    }
}

async fn connection_loop(inner: Arc<BrokerInner>, transport: Arc<MemoryTransport>) {
    // The first message must be Hello; everything before that has no
    // sender identity to route under.
    let hello = match transport.recv().await {
        Ok(msg) => msg,
        Err(_) => return,
    };
    if hello.member.as_deref() != Some("Hello") || hello.destination.as_deref() != Some(DAEMON_NAME)
    {
        warn!("connection spoke before Hello, dropping");
        return;
    }
    let unique = format!(":1.{}", inner.next_unique.fetch_add(1, Ordering::SeqCst));
    let conn = Arc::new(Conn {
        unique: unique.clone(),
        transport: transport.clone(),
        matches: RwLock::new(Vec::new()),
    });
    inner.conns.write().insert(unique.clone(), conn.clone());
    debug!(unique, "connection registered");

    send_reply(&inner, &conn, &hello, "s", &[Value::Str(unique.clone())]).await;
    emit_name_owner_changed(&inner, &unique, "", &unique).await;
    emit_directed(&inner, &unique, "NameAcquired", &unique).await;

    loop {
        let mut msg = match transport.recv().await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        msg.sender = Some(unique.clone());
        if msg.kind == MessageKind::MethodCall && msg.destination.as_deref() == Some(DAEMON_NAME) {
            handle_daemon_call(&inner, &conn, msg).await;
        } else if msg.kind == MessageKind::Signal && msg.destination.is_none() {
            broadcast(&inner, msg).await;
        } else {
            unicast(&inner, &conn, msg).await;
        }
    }

    // Connection closed: drop its names and subscriptions.
    inner.conns.write().remove(&unique);
    let released: Vec<String> = {
        let mut names = inner.names.write();
        let released = names
            .iter()
            .filter(|(_, owner)| **owner == unique)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        names.retain(|_, owner| *owner != unique);
        released
    };
    for name in released {
        emit_name_owner_changed(&inner, &name, &unique, "").await;
    }
    emit_name_owner_changed(&inner, &unique, &unique, "").await;
    debug!(unique, "connection closed");
}

async fn unicast(inner: &Arc<BrokerInner>, from: &Arc<Conn>, msg: Message) {
    let Some(dest) = msg.destination.clone() else {
        trace!("message without destination dropped");
        return;
    };
    let target = {
        let conns = inner.conns.read();
        let unique = if dest.starts_with(':') {
            Some(dest.clone())
        } else {
            inner.names.read().get(&dest).cloned()
        };
        unique.and_then(|u| conns.get(&u).cloned())
    };
    match target {
        Some(conn) => {
            let _ = conn.transport.send(msg).await;
        }
        None => {
            trace!(dest, "no such destination");
            if msg.kind == MessageKind::MethodCall {
                let err = daemon_message(
                    inner,
                    Message::error(&msg, error_name::UNKNOWN_SERVICE, &dest),
                );
                let _ = from.transport.send(err).await;
            }
        }
    }
}

async fn broadcast(inner: &Arc<BrokerInner>, msg: Message) {
    let conns: Vec<Arc<Conn>> = inner.conns.read().values().cloned().collect();
    for conn in conns {
        let wanted = conn.matches.read().iter().any(|rule| rule.matches(&msg));
        if wanted {
            let _ = conn.transport.send(msg.clone()).await;
        }
    }
}

fn daemon_message(inner: &Arc<BrokerInner>, mut msg: Message) -> Message {
    msg.serial = inner.next_serial.fetch_add(1, Ordering::SeqCst);
    msg.sender = Some(DAEMON_NAME.to_owned());
    msg
}

async fn send_reply(
    inner: &Arc<BrokerInner>,
    conn: &Arc<Conn>,
    origin: &Message,
    signature: &str,
    values: &[Value],
) {
    let tree = SignatureTree::parse(signature).expect("constant signature");
    let reply = match values_to_body(values, &tree) {
        Ok(body) => {
            daemon_message(inner, Message::method_return(origin).with_body(tree.signature(), body))
        }
        Err(e) => daemon_message(
            inner,
            Message::error(origin, error_name::FAILED, &e.to_string()),
        ),
    };
    let _ = conn.transport.send(reply).await;
}

async fn send_error(inner: &Arc<BrokerInner>, conn: &Arc<Conn>, origin: &Message, name: &str, text: &str) {
    let err = daemon_message(inner, Message::error(origin, name, text));
    let _ = conn.transport.send(err).await;
}

/// `NameAcquired`/`NameLost` are directed at one connection and bypass
/// match rules.
async fn emit_directed(inner: &Arc<BrokerInner>, unique: &str, member: &str, name: &str) {
    let conn = inner.conns.read().get(unique).cloned();
    let Some(conn) = conn else { return };
    let tree = SignatureTree::parse("s").expect("constant signature");
    let msg = daemon_message(
        inner,
        Message::signal(DAEMON_PATH, DAEMON_IFACE, member)
            .with_body(tree.signature(), vec![WireValue::Str(name.to_owned())])
            .with_destination(unique),
    );
    let _ = conn.transport.send(msg).await;
}

async fn emit_name_owner_changed(inner: &Arc<BrokerInner>, name: &str, old: &str, new: &str) {
    let tree = SignatureTree::parse("sss").expect("constant signature");
    let body = vec![
        WireValue::Str(name.to_owned()),
        WireValue::Str(old.to_owned()),
        WireValue::Str(new.to_owned()),
    ];
    let msg = daemon_message(
        inner,
        Message::signal(DAEMON_PATH, DAEMON_IFACE, "NameOwnerChanged")
            .with_body(tree.signature(), body),
    );
    broadcast(inner, msg).await;
}

fn args_of(msg: &Message, signature: &str) -> Result<Vec<Value>> {
    let tree = SignatureTree::parse(signature).expect("constant signature");
    Ok(body_to_values(&msg.body, &tree)?)
}

async fn handle_daemon_call(inner: &Arc<BrokerInner>, conn: &Arc<Conn>, msg: Message) {
    let member = msg.member.clone().unwrap_or_default();
    trace!(member, from = %conn.unique, "daemon call");
    match member.as_str() {
        "Hello" => {
            // Hello is only valid once; the daemon answers the same unique
            // name again rather than erroring.
            send_reply(inner, conn, &msg, "s", &[Value::Str(conn.unique.clone())]).await;
        }
        "RequestName" => match args_of(&msg, "su") {
            Ok(args) => {
                let (Some(name), Some(flags)) =
                    (args[0].as_str().map(str::to_owned), args[1].as_u32())
                else {
                    send_error(inner, conn, &msg, error_name::FAILED, "bad arguments").await;
                    return;
                };
                if validate_bus_name(&name).is_err() || name.starts_with(':') {
                    send_error(inner, conn, &msg, error_name::FAILED, "invalid name").await;
                    return;
                }
                let (code, change) = {
                    let mut names = inner.names.write();
                    match names.get(&name).cloned() {
                        Some(owner) if owner == conn.unique => (4u32, None),
                        Some(owner) => {
                            if flags & REQUEST_NAME_REPLACE_EXISTING != 0 {
                                names.insert(name.clone(), conn.unique.clone());
                                (1, Some((owner, conn.unique.clone())))
                            } else if flags & crate::bus::REQUEST_NAME_DO_NOT_QUEUE != 0 {
                                (3, None)
                            } else {
                                // Real queueing is not implemented; the
                                // caller sees the in-queue outcome.
                                (2, None)
                            }
                        }
                        None => {
                            names.insert(name.clone(), conn.unique.clone());
                            (1, Some((String::new(), conn.unique.clone())))
                        }
                    }
                };
                send_reply(inner, conn, &msg, "u", &[Value::UInt32(code)]).await;
                if let Some((old, new)) = change {
                    emit_name_owner_changed(inner, &name, &old, &new).await;
                    if !old.is_empty() {
                        emit_directed(inner, &old, "NameLost", &name).await;
                    }
                    emit_directed(inner, &new, "NameAcquired", &name).await;
                }
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        "ReleaseName" => match args_of(&msg, "s") {
            Ok(args) => {
                let name = args[0].as_str().unwrap_or_default().to_owned();
                let (code, released) = {
                    let mut names = inner.names.write();
                    match names.get(&name).cloned() {
                        Some(owner) if owner == conn.unique => {
                            names.remove(&name);
                            (1u32, true)
                        }
                        Some(_) => (3, false),
                        None => (2, false),
                    }
                };
                send_reply(inner, conn, &msg, "u", &[Value::UInt32(code)]).await;
                if released {
                    emit_name_owner_changed(inner, &name, &conn.unique, "").await;
                    emit_directed(inner, &conn.unique, "NameLost", &name).await;
                }
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        "ListNames" => {
            let mut names: Vec<Value> = vec![Value::Str(DAEMON_NAME.to_owned())];
            names.extend(
                inner
                    .conns
                    .read()
                    .keys()
                    .map(|u| Value::Str(u.clone())),
            );
            names.extend(inner.names.read().keys().map(|n| Value::Str(n.clone())));
            send_reply(inner, conn, &msg, "as", &[Value::Array(names)]).await;
        }
        "ListActivatableNames" => {
            let names: Vec<Value> = inner
                .activatable
                .read()
                .keys()
                .map(|n| Value::Str(n.clone()))
                .collect();
            send_reply(inner, conn, &msg, "as", &[Value::Array(names)]).await;
        }
        "NameHasOwner" => match args_of(&msg, "s") {
            Ok(args) => {
                let name = args[0].as_str().unwrap_or_default();
                let owned = name == DAEMON_NAME
                    || inner.names.read().contains_key(name)
                    || inner.conns.read().contains_key(name);
                send_reply(inner, conn, &msg, "b", &[Value::Bool(owned)]).await;
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        "GetNameOwner" => match args_of(&msg, "s") {
            Ok(args) => {
                let name = args[0].as_str().unwrap_or_default();
                let owner = if name.starts_with(':') {
                    inner.conns.read().contains_key(name).then(|| name.to_owned())
                } else {
                    inner.names.read().get(name).cloned()
                };
                match owner {
                    Some(owner) => {
                        send_reply(inner, conn, &msg, "s", &[Value::Str(owner)]).await
                    }
                    None => {
                        send_error(inner, conn, &msg, error_name::NAME_HAS_NO_OWNER, name).await
                    }
                }
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        "AddMatch" => match args_of(&msg, "s") {
            Ok(args) => {
                let rule_text = args[0].as_str().unwrap_or_default();
                match MatchRule::parse(rule_text) {
                    Ok(rule) => {
                        conn.matches.write().push(rule);
                        send_reply(inner, conn, &msg, "", &[]).await;
                    }
                    Err(e) => {
                        send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await
                    }
                }
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        "RemoveMatch" => match args_of(&msg, "s") {
            Ok(args) => {
                let rule_text = args[0].as_str().unwrap_or_default();
                match MatchRule::parse(rule_text) {
                    Ok(rule) => {
                        {
                            let mut matches = conn.matches.write();
                            if let Some(idx) = matches.iter().position(|r| *r == rule) {
                                matches.remove(idx);
                            }
                        }
                        send_reply(inner, conn, &msg, "", &[]).await;
                    }
                    Err(e) => {
                        send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await
                    }
                }
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        "GetId" => {
            send_reply(inner, conn, &msg, "s", &[Value::Str(inner.machine_id.clone())]).await;
        }
        "StartServiceByName" => match args_of(&msg, "su") {
            Ok(args) => {
                let name = args[0].as_str().unwrap_or_default().to_owned();
                if inner.names.read().contains_key(&name) {
                    send_reply(inner, conn, &msg, "u", &[Value::UInt32(2)]).await;
                    return;
                }
                let hook = inner.activatable.read().get(&name).cloned();
                match hook {
                    Some(hook) => {
                        debug!(name, "activating service");
                        tokio::spawn(hook());
                        send_reply(inner, conn, &msg, "u", &[Value::UInt32(1)]).await;
                    }
                    None => {
                        send_error(inner, conn, &msg, error_name::UNKNOWN_SERVICE, &name).await
                    }
                }
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        "GetConnectionUnixUser" => match resolve_connection(inner, &msg) {
            Ok(_) => send_reply(inner, conn, &msg, "u", &[Value::UInt32(inner.unix_user)]).await,
            Err((name, text)) => send_error(inner, conn, &msg, name, &text).await,
        },
        "GetConnectionUnixProcessID" => match resolve_connection(inner, &msg) {
            Ok(_) => {
                send_reply(inner, conn, &msg, "u", &[Value::UInt32(std::process::id())]).await
            }
            Err((name, text)) => send_error(inner, conn, &msg, name, &text).await,
        },
        "UpdateActivationEnvironment" => match args_of(&msg, "a{ss}") {
            Ok(args) => {
                if let Some(dict) = args[0].as_dict() {
                    let mut env = inner.activation_env.write();
                    for (k, v) in dict.iter() {
                        if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                            env.insert(k.to_owned(), v.to_owned());
                        }
                    }
                }
                send_reply(inner, conn, &msg, "", &[]).await;
            }
            Err(e) => send_error(inner, conn, &msg, error_name::FAILED, &e.to_string()).await,
        },
        other => {
            send_error(
                inner,
                conn,
                &msg,
                error_name::UNKNOWN_METHOD,
                &format!("no daemon method {other}"),
            )
            .await;
        }
    }
}

type DaemonError = (&'static str, String);

fn resolve_connection(
    inner: &Arc<BrokerInner>,
    msg: &Message,
) -> std::result::Result<String, DaemonError> {
    let name = match msg.body.first() {
        Some(WireValue::Str(s)) => s.clone(),
        _ => return Err((error_name::FAILED, "bad arguments".to_owned())),
    };
    let owner = if name.starts_with(':') {
        inner.conns.read().contains_key(&name).then(|| name.clone())
    } else {
        inner.names.read().get(&name).cloned()
    };
    owner.ok_or((error_name::NAME_HAS_NO_OWNER, name))
}
