//! The bus connection
//!
//! A [`Bus`] owns one router over one transport, performs the `Hello`
//! handshake within the configured ready timeout, and wraps the message
//!-bus daemon's method surface in typed calls. Services are published
//! through [`Bus::expose`]; remote services are consumed through
//! [`Bus::proxy`].

use crate::error::{BusError, RequestNameReply, Result};
use crate::proxy::ProxyBuilder;
use crate::router::Router;
use crate::service::Service;
use crate::transport::Transport;
use nbus_proto::bridge::values_to_body;
use nbus_proto::names::validate_bus_name;
use nbus_proto::{Dict, Message, SignatureTree, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// The message-bus daemon's own address.
pub const DAEMON_NAME: &str = "org.freedesktop.DBus";
pub const DAEMON_PATH: &str = "/org/freedesktop/DBus";
pub const DAEMON_IFACE: &str = "org.freedesktop.DBus";

/// `RequestName` flag: take the name over from its current owner.
pub const REQUEST_NAME_REPLACE_EXISTING: u32 = 0x2;
/// `RequestName` flag: fail instead of queueing behind the owner.
pub const REQUEST_NAME_DO_NOT_QUEUE: u32 = 0x4;
/// The flags [`Bus::expose`] requests names with.
pub const REQUEST_NAME_DEFAULT_FLAGS: u32 =
    REQUEST_NAME_REPLACE_EXISTING | REQUEST_NAME_DO_NOT_QUEUE;

/// Lifecycle events of a bus connection.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The `Hello` handshake completed; the connection may be used.
    Ready { unique_name: String },
    /// The connection failed fatally.
    Error { message: String },
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How long the `Hello` handshake may take before the connection is
    /// failed with [`BusError::NotReady`].
    pub ready_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            ready_timeout: Duration::from_secs(5),
        }
    }
}

/// One authenticated connection to a message bus.
pub struct Bus {
    router: Arc<Router>,
    events: broadcast::Sender<BusEvent>,
}

impl Bus {
    /// Connect over `transport` with default configuration.
    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        Self::connect_with(transport, BusConfig::default()).await
    }

    /// Connect over `transport`, performing the `Hello` handshake within
    /// the configured ready timeout.
    pub async fn connect_with(
        transport: Arc<dyn Transport>,
        config: BusConfig,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(32);
        let router = Router::new(transport, events.clone());
        tokio::spawn(router.clone().run_writer());
        tokio::spawn(router.clone().run_dispatch());
        let bus = Arc::new(Bus { router, events });

        let unique_name = tokio::time::timeout(config.ready_timeout, async {
            let reply = bus.daemon_call("Hello", "", &[]).await?;
            one_string(reply)
        })
        .await
        .map_err(|_| BusError::NotReady)??;

        bus.router.set_unique_name(unique_name.clone());
        info!(unique_name, "bus ready");
        let _ = bus.events.send(BusEvent::Ready {
            unique_name: unique_name.clone(),
        });
        Ok(bus)
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// The router owning this connection's transport.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Unique name assigned by the daemon at `Hello`.
    pub fn unique_name(&self) -> Option<String> {
        self.router.unique_name()
    }

    /// Publish a service under `name` and arm its object tree.
    pub async fn expose(&self, name: &str, service: &Arc<Service>) -> Result<()> {
        validate_bus_name(name)?;
        let reply = self.request_name(name, REQUEST_NAME_DEFAULT_FLAGS).await?;
        if reply != RequestNameReply::PrimaryOwner {
            return Err(BusError::RequestName {
                name: name.to_owned(),
                reply,
            });
        }
        self.router.register_service(name, service.clone());
        service.attach(name, &self.router);
        Ok(())
    }

    /// Withdraw a published service and release its name.
    pub async fn withdraw(&self, name: &str) -> Result<()> {
        if let Some(service) = self.router.unregister_service(name) {
            service.detach();
        }
        self.release_name(name).await?;
        debug!(name, "service withdrawn");
        Ok(())
    }

    /// Start building a proxy for the well-known name `name`.
    pub fn proxy(self: &Arc<Self>, name: &str) -> Result<ProxyBuilder> {
        validate_bus_name(name)?;
        Ok(ProxyBuilder::new(self.clone(), name))
    }

    pub async fn request_name(&self, name: &str, flags: u32) -> Result<RequestNameReply> {
        let reply = self
            .daemon_call("RequestName", "su", &[name.into(), flags.into()])
            .await?;
        let code = one_u32(reply)?;
        RequestNameReply::from_code(code)
            .ok_or_else(|| BusError::InvalidReply(format!("RequestName returned {code}")))
    }

    pub async fn release_name(&self, name: &str) -> Result<u32> {
        one_u32(self.daemon_call("ReleaseName", "s", &[name.into()]).await?)
    }

    pub async fn list_names(&self) -> Result<Vec<String>> {
        string_array(self.daemon_call("ListNames", "", &[]).await?)
    }

    pub async fn list_activatable_names(&self) -> Result<Vec<String>> {
        string_array(self.daemon_call("ListActivatableNames", "", &[]).await?)
    }

    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        let reply = self.daemon_call("NameHasOwner", "s", &[name.into()]).await?;
        match reply.into_iter().next() {
            Some(Value::Bool(b)) => Ok(b),
            _ => Err(BusError::InvalidReply("NameHasOwner".into())),
        }
    }

    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        one_string(self.daemon_call("GetNameOwner", "s", &[name.into()]).await?)
    }

    pub async fn start_service_by_name(&self, name: &str, flags: u32) -> Result<u32> {
        one_u32(
            self.daemon_call("StartServiceByName", "su", &[name.into(), flags.into()])
                .await?,
        )
    }

    pub async fn get_id(&self) -> Result<String> {
        one_string(self.daemon_call("GetId", "", &[]).await?)
    }

    pub async fn get_connection_unix_user(&self, name: &str) -> Result<u32> {
        one_u32(
            self.daemon_call("GetConnectionUnixUser", "s", &[name.into()])
                .await?,
        )
    }

    pub async fn get_connection_unix_process_id(&self, name: &str) -> Result<u32> {
        one_u32(
            self.daemon_call("GetConnectionUnixProcessID", "s", &[name.into()])
                .await?,
        )
    }

    pub async fn update_activation_environment(&self, env: &[(String, String)]) -> Result<()> {
        let dict: Dict = env
            .iter()
            .map(|(k, v)| (Value::Str(k.clone()), Value::Str(v.clone())))
            .collect();
        self.daemon_call("UpdateActivationEnvironment", "a{ss}", &[Value::Dict(dict)])
            .await?;
        Ok(())
    }

    async fn daemon_call(&self, member: &str, signature: &str, args: &[Value]) -> Result<Vec<Value>> {
        let tree = SignatureTree::parse(signature).expect("constant signature");
        let body = values_to_body(args, &tree).map_err(BusError::from)?;
        let msg = Message::method_call(DAEMON_NAME, DAEMON_PATH, DAEMON_IFACE, member)
            .with_body(tree.signature(), body);
        self.router.call(msg, true).await?.into_values()
    }
}

fn one_string(values: Vec<Value>) -> Result<String> {
    match values.into_iter().next() {
        Some(Value::Str(s)) => Ok(s),
        _ => Err(BusError::InvalidReply("expected one string".into())),
    }
}

fn one_u32(values: Vec<Value>) -> Result<u32> {
    match values.into_iter().next() {
        Some(Value::UInt32(v)) => Ok(v),
        _ => Err(BusError::InvalidReply("expected one uint32".into())),
    }
}

fn string_array(values: Vec<Value>) -> Result<Vec<String>> {
    match values.into_iter().next() {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Str(s) => Ok(s),
                _ => Err(BusError::InvalidReply("expected a string array".into())),
            })
            .collect(),
        _ => Err(BusError::InvalidReply("expected a string array".into())),
    }
}
