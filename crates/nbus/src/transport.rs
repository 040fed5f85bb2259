//! The transport seam
//!
//! The router owns exactly one [`Transport`]: an authenticated, framed,
//! bidirectional message exchange. Address discovery, authentication and
//! the byte layout live behind this trait; messages cross it already
//! parsed.
//!
//! The in-memory implementation pairs two endpoints over channels. It
//! backs the embedded broker and every test in the workspace.

use crate::error::{BusError, Result};
use async_trait::async_trait;
use nbus_proto::Message;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Authenticated, framed, bidirectional message exchange.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue one message for the peer.
    async fn send(&self, msg: Message) -> Result<()>;

    /// Receive the next message from the peer.
    async fn recv(&self) -> Result<Message>;

    /// Stable per-machine identifier, surfaced by `Peer.GetMachineId`.
    fn machine_id(&self) -> String;
}

/// One endpoint of an in-memory transport pair.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    machine_id: String,
}

/// Create a connected pair of in-memory endpoints sharing a machine id.
pub fn memory_pair(machine_id: &str) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a = Arc::new(MemoryTransport {
        tx: a_tx,
        rx: Mutex::new(a_rx),
        machine_id: machine_id.to_owned(),
    });
    let b = Arc::new(MemoryTransport {
        tx: b_tx,
        rx: Mutex::new(b_rx),
        machine_id: machine_id.to_owned(),
    });
    (a, b)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).map_err(|_| BusError::Disconnected)
    }

    async fn recv(&self) -> Result<Message> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(BusError::Disconnected)
    }

    fn machine_id(&self) -> String {
        self.machine_id.clone()
    }
}
