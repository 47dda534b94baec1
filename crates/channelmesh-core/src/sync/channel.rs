//! Per-protocol channel lifecycle shared by the managers
//!
//! Each manager owns a [`ChannelTable`] and implements [`ChannelHandler`].
//! [`attach_all`] hooks the handler onto every current and future connection
//! of a [`Connectivity`]; from then on a channel moves through
//! `negotiating -> open -> closed` driven by its [`ChannelEvent`] stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sync::connectivity::Connectivity;
use crate::sync::mux::{ChannelEvent, ConnectionId, PeerConnection, ProtocolChannel};

/// Negotiation state of one channel slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Local half opened, waiting for the remote half
    Negotiating,
    /// Both halves open
    Open,
}

struct ChannelSlot {
    channel: ProtocolChannel,
    state: ChannelState,
}

/// Live channels of one protocol, keyed by connection
#[derive(Default)]
pub struct ChannelTable {
    slots: Mutex<HashMap<ConnectionId, ChannelSlot>>,
    send_failures: AtomicU64,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the channels that are fully open
    pub fn open_channels(&self) -> Vec<ProtocolChannel> {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.state == ChannelState::Open)
            .map(|slot| slot.channel.clone())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.state == ChannelState::Open)
            .count()
    }

    pub fn state(&self, connection_id: ConnectionId) -> Option<ChannelState> {
        self.slots.lock().get(&connection_id).map(|slot| slot.state)
    }

    /// Sends that failed since creation
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Send on one channel. Failures are logged and counted, never raised.
    pub fn send<T: Serialize>(&self, channel: &ProtocolChannel, message: &T) -> bool {
        match channel.send(message) {
            Ok(()) => true,
            Err(e) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    connection_id = channel.connection_id(),
                    remote = %channel.remote_id(),
                    protocol = channel.protocol(),
                    error = %e,
                    "Send failed"
                );
                false
            }
        }
    }

    /// Send to every open channel except `except`. Returns the number of
    /// channels the message was queued on.
    pub fn broadcast<T: Serialize>(&self, message: &T, except: Option<ConnectionId>) -> usize {
        self.open_channels()
            .iter()
            .filter(|channel| Some(channel.connection_id()) != except)
            .filter(|channel| self.send(channel, message))
            .count()
    }

    fn mark_open(&self, connection_id: ConnectionId) -> bool {
        match self.slots.lock().get_mut(&connection_id) {
            Some(slot) if slot.state == ChannelState::Negotiating => {
                slot.state = ChannelState::Open;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, connection_id: ConnectionId) -> bool {
        self.slots.lock().remove(&connection_id).is_some()
    }
}

/// A manager that speaks one protocol over every connection
pub trait ChannelHandler: Send + Sync + 'static {
    /// Protocol name negotiated on the mux
    fn protocol(&self) -> &'static str;

    fn channels(&self) -> &ChannelTable;

    /// Both halves of the channel exist
    fn on_open(&self, channel: &ProtocolChannel);

    /// A decoded-to-JSON message arrived on an open channel
    fn on_message(&self, channel: &ProtocolChannel, message: serde_json::Value);

    /// The channel's connection closed; its slot is already gone
    fn on_closed(&self, channel: &ProtocolChannel);
}

/// Attach `handler` to every existing connection and keep attaching new
/// ones until the handler is dropped or the provider goes away.
pub fn attach_all<H: ChannelHandler>(
    handler: &Arc<H>,
    connectivity: Arc<dyn Connectivity>,
) -> JoinHandle<()> {
    // Subscribe first so nothing slips between enumeration and subscription.
    let mut added = connectivity.subscribe_connections();
    for conn in connectivity.connections() {
        attach(handler, &conn);
    }

    let weak = Arc::downgrade(handler);
    tokio::spawn(async move {
        loop {
            let next = added.recv().await;
            let Some(handler) = weak.upgrade() else { break };
            match next {
                Ok(conn) => attach(&handler, &conn),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(protocol = handler.protocol(), missed, "Connection feed lagged, re-enumerating");
                    for conn in connectivity.connections() {
                        attach(&handler, &conn);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Register the passive-side pairing and try to open the local half now
pub fn attach<H: ChannelHandler>(handler: &Arc<H>, conn: &PeerConnection) {
    let weak = Arc::downgrade(handler);
    conn.pair(handler.protocol(), move |conn| {
        if let Some(handler) = weak.upgrade() {
            ensure_channel(&handler, conn);
        }
    });
    ensure_channel(handler, conn);
}

/// Open the handler's channel on `conn` unless one already exists.
///
/// Returns `true` if this call created the channel.
pub fn ensure_channel<H: ChannelHandler>(handler: &Arc<H>, conn: &PeerConnection) -> bool {
    let table = handler.channels();
    let (channel, events) = {
        let mut slots = table.slots.lock();
        if slots.contains_key(&conn.id()) {
            return false;
        }
        match conn.open_channel(handler.protocol()) {
            Ok((channel, events)) => {
                slots.insert(
                    conn.id(),
                    ChannelSlot {
                        channel: channel.clone(),
                        state: ChannelState::Negotiating,
                    },
                );
                (channel, events)
            }
            Err(e) => {
                debug!(
                    connection_id = conn.id(),
                    protocol = handler.protocol(),
                    error = %e,
                    "Could not open channel"
                );
                return false;
            }
        }
    };

    debug!(
        connection_id = conn.id(),
        remote = %conn.remote_id(),
        protocol = handler.protocol(),
        "Channel negotiating"
    );
    tokio::spawn(run_channel(Arc::downgrade(handler), channel, events));
    true
}

async fn run_channel<H: ChannelHandler>(
    handler: Weak<H>,
    channel: ProtocolChannel,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(strong) = handler.upgrade() else { return };
        match event {
            ChannelEvent::Opened => {
                if strong.channels().mark_open(channel.connection_id()) {
                    debug!(
                        connection_id = channel.connection_id(),
                        remote = %channel.remote_id(),
                        protocol = channel.protocol(),
                        "Channel open"
                    );
                    strong.on_open(&channel);
                }
            }
            ChannelEvent::Message(message) => strong.on_message(&channel, message),
            ChannelEvent::Closed => break,
        }
    }

    if let Some(strong) = handler.upgrade() {
        if strong.channels().remove(channel.connection_id()) {
            debug!(
                connection_id = channel.connection_id(),
                protocol = channel.protocol(),
                "Channel closed"
            );
            strong.on_closed(&channel);
        }
    }
}
