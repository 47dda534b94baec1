//! Peer-to-peer control plane
//!
//! Two protocols ride on every peer connection, each as its own named
//! channel over a small framed multiplexer:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Connectivity (iroh endpoint + gossip rendezvous, or memory) │
//! │  └── ConnectionRegistry ── PeerConnection (mux)              │
//! │        ├── channelmesh/feeds/1   → GossipFeedManager         │
//! │        └── channelmesh/search/1  → FederatedQueryCoordinator │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Feed protocol
//!
//! - **HAVE_FEED**: full feed listing, sent when a channel opens
//! - **SUBMIT_CHANNEL**: one newly published key, forwarded to everyone
//!   except the sender when it was new
//! - **NEED_FEED** / **FEED_RESPONSE**: explicit feed request
//!
//! ## Search protocol
//!
//! - **SEARCH_QUERY**: answered with the local top-k
//! - **SEARCH_RESPONSE**: collected until the query deadline, then merged
//!   with the local results by mean score

pub mod channel;
pub mod connectivity;
pub mod endpoint;
pub mod feed_manager;
pub mod feed_protocol;
pub mod memory;
pub mod mux;
pub mod query;
pub mod query_protocol;
pub mod registry;

pub use channel::{ChannelHandler, ChannelState, ChannelTable};
pub use connectivity::{feed_topic, search_topic, Connectivity, JoinOptions, TopicJoin};
pub use endpoint::{parse_endpoint_id, IrohConnectivity, MESH_ALPN};
pub use feed_manager::{FeedEvent, GossipFeedManager, MergeOutcome};
pub use feed_protocol::{FeedListing, FeedMessage, FEED_PROTOCOL};
pub use memory::{MemoryNetwork, MemoryNode};
pub use mux::{ChannelEvent, ConnectionId, PeerConnection, ProtocolChannel};
pub use query::{merge_results, FederatedQueryCoordinator, SearchOptions};
pub use query_protocol::{QueryMessage, QUERY_PROTOCOL};
pub use registry::ConnectionRegistry;
