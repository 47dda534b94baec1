//! Named protocol channels over one peer connection
//!
//! A [`PeerConnection`] multiplexes any number of application protocols over
//! a single byte stream. Frames are length-delimited JSON objects:
//!
//! ```text
//! {"frame":"hello","node":"<id>"}
//! {"frame":"open","protocol":"channelmesh/feeds/1"}
//! {"frame":"message","protocol":"channelmesh/feeds/1","payload":{...}}
//! ```
//!
//! A protocol channel is open once both sides have sent `open` for the same
//! name. Either side may go first; a handler registered with
//! [`PeerConnection::pair`] is invoked when the remote opens a protocol the
//! local side has not opened yet, so the passive side can create its half
//! lazily.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{MeshError, MeshResult};

/// Process-unique identifier of one connection
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One frame on the mux stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub(crate) enum Frame {
    Hello {
        node: String,
    },
    Open {
        protocol: String,
    },
    Message {
        protocol: String,
        payload: serde_json::Value,
    },
}

/// Event delivered to the local half of a protocol channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Both sides have opened the protocol
    Opened,
    /// A message from the remote half
    Message(serde_json::Value),
    /// The underlying connection is gone
    Closed,
}

type PairHandler = Arc<dyn Fn(&PeerConnection) + Send + Sync>;

#[derive(Default)]
struct MuxState {
    local_open: HashSet<String>,
    remote_open: HashSet<String>,
    pairings: HashMap<String, PairHandler>,
    channels: HashMap<String, mpsc::UnboundedSender<ChannelEvent>>,
    closed: bool,
}

struct ConnInner {
    id: ConnectionId,
    remote: String,
    max_frame_size: usize,
    outbound: mpsc::UnboundedSender<Bytes>,
    state: Mutex<MuxState>,
    cancel: CancellationToken,
}

/// Handle to an established, multiplexed peer connection.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerConnection {
    /// Run the mux over a reader/writer pair.
    ///
    /// Spawns a reader and a writer task; must be called inside a tokio
    /// runtime. A `hello` frame is queued first so the remote side sees
    /// traffic immediately.
    pub fn new<R, W>(
        local: &str,
        remote: impl Into<String>,
        reader: R,
        writer: W,
        max_frame_size: usize,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let conn = Self {
            inner: Arc::new(ConnInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                remote: remote.into(),
                max_frame_size,
                outbound,
                state: Mutex::new(MuxState::default()),
                cancel: CancellationToken::new(),
            }),
        };

        let _ = conn.send_frame(&Frame::Hello {
            node: local.to_string(),
        });

        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec()
        };
        tokio::spawn(conn.clone().write_loop(FramedWrite::new(writer, codec()), outbound_rx));
        tokio::spawn(conn.clone().read_loop(FramedRead::new(reader, codec())));

        debug!(connection_id = conn.id(), remote = %conn.remote_id(), "Connection established");
        conn
    }

    /// Two connected ends over an in-process duplex pipe
    pub fn pipe(a: &str, b: &str, max_frame_size: usize) -> (Self, Self) {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a_io);
        let (b_read, b_write) = tokio::io::split(b_io);
        (
            Self::new(a, b, a_read, a_write, max_frame_size),
            Self::new(b, a, b_read, b_write, max_frame_size),
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Identifier of the node on the other end
    pub fn remote_id(&self) -> &str {
        &self.inner.remote
    }

    /// Largest encoded frame this connection will queue
    pub fn max_frame_size(&self) -> usize {
        self.inner.max_frame_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the connection has closed
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Close the connection; every open channel receives `Closed`
    pub fn close(&self) {
        let channels = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pairings.clear();
            std::mem::take(&mut state.channels)
        };
        for tx in channels.into_values() {
            let _ = tx.send(ChannelEvent::Closed);
        }
        self.inner.cancel.cancel();
        debug!(connection_id = self.id(), remote = %self.remote_id(), "Connection closed");
    }

    /// Register the handler invoked when the remote opens `protocol` before
    /// the local side has. If that already happened, the handler runs now.
    pub fn pair<F>(&self, protocol: &str, handler: F)
    where
        F: Fn(&PeerConnection) + Send + Sync + 'static,
    {
        let handler: PairHandler = Arc::new(handler);
        let run_now = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.pairings.insert(protocol.to_string(), handler.clone());
            state.remote_open.contains(protocol) && !state.local_open.contains(protocol)
        };
        if run_now {
            handler(self);
        }
    }

    /// Open the local half of `protocol`.
    ///
    /// Fails if the connection is closed or the protocol is already open
    /// locally. The receiver yields `Opened` once the remote half exists.
    pub fn open_channel(
        &self,
        protocol: &str,
    ) -> MeshResult<(ProtocolChannel, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(MeshError::ChannelClosed(format!(
                    "connection {} to {}",
                    self.id(),
                    self.remote_id()
                )));
            }
            if !state.local_open.insert(protocol.to_string()) {
                return Err(MeshError::InvalidOperation(format!(
                    "{} already open on connection {}",
                    protocol,
                    self.id()
                )));
            }
            if state.remote_open.contains(protocol) {
                let _ = tx.send(ChannelEvent::Opened);
            }
            state.channels.insert(protocol.to_string(), tx);
            self.send_frame(&Frame::Open {
                protocol: protocol.to_string(),
            })?;
        }

        trace!(connection_id = self.id(), protocol, "Opened local channel half");
        Ok((
            ProtocolChannel {
                conn: self.clone(),
                protocol: Arc::from(protocol),
            },
            rx,
        ))
    }

    /// Encode and queue one frame. An oversized frame is rejected here so
    /// the codec never sees it and the connection stays up.
    fn send_frame(&self, frame: &Frame) -> MeshResult<()> {
        if self.is_closed() {
            return Err(MeshError::ChannelClosed(format!(
                "connection {} to {}",
                self.id(),
                self.remote_id()
            )));
        }
        let bytes = serde_json::to_vec(frame)?;
        if bytes.len() > self.inner.max_frame_size {
            return Err(MeshError::FrameTooLarge {
                size: bytes.len(),
                max: self.inner.max_frame_size,
            });
        }
        self.inner.outbound.send(Bytes::from(bytes)).map_err(|_| {
            MeshError::ChannelClosed(format!("connection {} writer gone", self.id()))
        })
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Hello { node } => {
                debug!(connection_id = self.id(), %node, "Peer hello");
            }
            Frame::Open { protocol } => {
                let handler = {
                    let mut state = self.inner.state.lock();
                    if !state.remote_open.insert(protocol.clone()) {
                        return;
                    }
                    if state.local_open.contains(&protocol) {
                        if let Some(tx) = state.channels.get(&protocol) {
                            let _ = tx.send(ChannelEvent::Opened);
                        }
                        None
                    } else {
                        state.pairings.get(&protocol).cloned()
                    }
                };
                match handler {
                    Some(handler) => handler(self),
                    None => trace!(connection_id = self.id(), %protocol, "Remote opened protocol"),
                }
            }
            Frame::Message { protocol, payload } => {
                let state = self.inner.state.lock();
                match state.channels.get(&protocol) {
                    Some(tx) if state.remote_open.contains(&protocol) => {
                        let _ = tx.send(ChannelEvent::Message(payload));
                    }
                    _ => {
                        debug!(connection_id = self.id(), %protocol, "Dropping message for unopened protocol");
                    }
                }
            }
        }
    }

    async fn read_loop<R>(self, mut frames: FramedRead<R, LengthDelimitedCodec>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                next = frames.next() => match next {
                    Some(Ok(bytes)) => match serde_json::from_slice::<Frame>(&bytes) {
                        Ok(frame) => self.dispatch(frame),
                        Err(e) => {
                            warn!(connection_id = self.id(), error = %e, "Ignoring undecodable frame");
                        }
                    },
                    Some(Err(e)) => {
                        debug!(connection_id = self.id(), error = %e, "Read failed");
                        break;
                    }
                    None => {
                        debug!(connection_id = self.id(), "Remote closed stream");
                        break;
                    }
                }
            }
        }
        self.close();
    }

    async fn write_loop<W>(
        self,
        mut sink: FramedWrite<W, LengthDelimitedCodec>,
        mut outbound: mpsc::UnboundedReceiver<Bytes>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                bytes = outbound.recv() => {
                    let Some(bytes) = bytes else { break };
                    if let Err(e) = sink.send(bytes).await {
                        debug!(connection_id = self.id(), error = %e, "Write failed");
                        break;
                    }
                }
            }
        }
        let _ = SinkExt::<Bytes>::close(&mut sink).await;
        self.close();
    }
}

/// The local half of one named protocol on one connection
#[derive(Clone)]
pub struct ProtocolChannel {
    conn: PeerConnection,
    protocol: Arc<str>,
}

impl fmt::Debug for ProtocolChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolChannel")
            .field("connection_id", &self.conn.id())
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl ProtocolChannel {
    /// Serialize `message` and queue it for the remote half
    pub fn send<T: Serialize>(&self, message: &T) -> MeshResult<()> {
        let payload = serde_json::to_value(message)?;
        self.conn.send_frame(&Frame::Message {
            protocol: self.protocol.to_string(),
            payload,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn remote_id(&self) -> &str {
        self.conn.remote_id()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn connection(&self) -> &PeerConnection {
        &self.conn
    }

    pub fn max_frame_size(&self) -> usize {
        self.conn.max_frame_size()
    }
}
