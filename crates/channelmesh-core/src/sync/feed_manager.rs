//! Gossip-based channel discovery
//!
//! Every participant keeps a small set of known publisher channels and
//! exchanges it with each peer it is connected to:
//!
//! - on channel open, each side sends its full list (`HAVE_FEED`);
//! - a locally published channel is pushed to every peer (`SUBMIT_CHANNEL`),
//!   and a peer that learns something new from a submission forwards it to
//!   all its other peers, never back to the sender;
//! - the merge ([`GossipFeedManager::add_entry`]) is idempotent and
//!   commutative, so duplicated or reordered gossip converges.
//!
//! Locally hidden keys are a one-way veto: they are removed from the feed
//! and never re-admitted. Mutations triggered by gossip are persisted after a
//! debounce; user actions persist immediately.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::MeshResult;
use crate::scheduler::Debouncer;
use crate::storage::KvStore;
use crate::sync::channel::{attach_all, ChannelHandler, ChannelTable};
use crate::sync::connectivity::{feed_topic, Connectivity, JoinOptions};
use crate::sync::feed_protocol::{
    split_entries, ChannelSubmission, FeedListing, FeedMessage, WireEntry, FEED_PROTOCOL,
};
use crate::sync::mux::{ConnectionId, ProtocolChannel};
use crate::types::{DriveKey, EntrySource, FeedEntry, FeedStats, PublishedChannel};

/// Store key of the locally published channels
pub const PUBLISHED_KEY: &str = "published-channels-v2";
/// Store key of the discovered entry cache
pub const DISCOVERED_KEY: &str = "discovered-channels-v2";
/// Store key of the hidden-key veto list
pub const HIDDEN_KEY: &str = "hidden-channels-v2";
/// Flat key list read by older builds
pub const LEGACY_PUBLISHED_KEY: &str = "published-channels";
/// Flat key list read by older builds
pub const LEGACY_DISCOVERED_KEY: &str = "discovered-channels";

/// Frame bytes reserved for the mux envelope around a listing
const LISTING_ENVELOPE: usize = 256;

/// Notification about feed changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The visible feed changed
    Updated,
    /// A feed channel to a peer finished negotiating
    ChannelOpened {
        connection_id: ConnectionId,
        remote_id: String,
    },
    /// A feed channel went away with its connection
    ChannelClosed {
        connection_id: ConnectionId,
        remote_id: String,
    },
}

/// Result of merging one key into the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New entry created
    Inserted,
    /// Existing entry gained its missing bee key
    Backfilled,
    /// Already known, nothing to add
    Unchanged,
    /// Vetoed by the hidden set
    Hidden,
    /// Malformed drive key
    Invalid,
}

#[derive(Default)]
struct FeedState {
    entries: HashMap<DriveKey, FeedEntry>,
    hidden: HashSet<DriveKey>,
    /// Drive key -> public bee key
    published: BTreeMap<DriveKey, Option<DriveKey>>,
}

struct FeedInner {
    self_ref: Weak<FeedInner>,
    connectivity: Option<Arc<dyn Connectivity>>,
    store: Arc<dyn KvStore>,
    config: FeedConfig,
    state: Mutex<FeedState>,
    channels: ChannelTable,
    events: broadcast::Sender<FeedEvent>,
    persist: Debouncer,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Discovers publisher channels over the gossip feed protocol.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct GossipFeedManager {
    inner: Arc<FeedInner>,
}

impl GossipFeedManager {
    /// Create a manager. Without connectivity it runs local-only.
    pub fn new(
        connectivity: Option<Arc<dyn Connectivity>>,
        store: Arc<dyn KvStore>,
        config: FeedConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let persist = Debouncer::new(config.persist_debounce());
        let inner = Arc::new_cyclic(|self_ref| FeedInner {
            self_ref: self_ref.clone(),
            connectivity,
            store,
            config,
            state: Mutex::new(FeedState::default()),
            channels: ChannelTable::new(),
            events,
            persist,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    /// Restore persisted state, join the discovery topic and start speaking
    /// the feed protocol on every current and future connection.
    ///
    /// Calling it again is a no-op.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.inner.restore() {
            self.inner.notify(FeedEvent::Updated);
        }

        let Some(connectivity) = self.inner.connectivity.clone() else {
            info!("Feed manager running without connectivity");
            return;
        };

        let join = connectivity.join(feed_topic(), JoinOptions::BOTH);
        let attach_task = attach_all(&self.inner, connectivity);
        self.inner.tasks.lock().push(attach_task);

        match join {
            Ok(mut join) => {
                join.flushed_within(self.inner.config.flush_timeout()).await;
            }
            Err(e) => warn!(error = %e, "Failed to join discovery topic"),
        }
        info!(entries = self.inner.state.lock().entries.len(), "Feed manager started");
    }

    /// Merge one key into the feed.
    ///
    /// Returns `true` only when a new entry was created. Malformed keys are
    /// logged and ignored; hidden keys are never re-admitted; a known entry
    /// may gain a missing bee key.
    pub fn add_entry(
        &self,
        drive_key: &str,
        source: EntrySource,
        public_bee_key: Option<&str>,
    ) -> bool {
        let outcome = self.inner.merge_entry(drive_key, source, public_bee_key);
        match outcome {
            MergeOutcome::Inserted | MergeOutcome::Backfilled => {
                self.inner.notify(FeedEvent::Updated);
                self.inner.schedule_persist();
            }
            _ => {}
        }
        outcome == MergeOutcome::Inserted
    }

    /// Publish a locally authored channel.
    ///
    /// Persists immediately and pushes `SUBMIT_CHANNEL` to every open feed
    /// channel. Returns how many channels it was sent to.
    pub fn submit_channel(&self, drive_key: &str, public_bee_key: Option<&str>) -> MeshResult<usize> {
        let key = DriveKey::parse(drive_key)?;
        let bee = public_bee_key.map(DriveKey::parse).transpose()?;

        let outcome = self.inner.merge_parsed(key, EntrySource::Local, bee);
        let bee = {
            let mut state = self.inner.state.lock();
            let slot = state.published.entry(key).or_insert(None);
            if bee.is_some() {
                *slot = bee;
            }
            *slot
        };
        if outcome == MergeOutcome::Hidden {
            debug!(drive_key = %key.short(), "Submitted channel is hidden locally");
        }

        self.inner.persist_immediately();
        self.inner.notify(FeedEvent::Updated);

        let submission = FeedMessage::SubmitChannel(ChannelSubmission {
            key: key.to_hex(),
            public_bee_key: bee.map(|k| k.to_hex()),
        });
        let sent = self.inner.channels.broadcast(&submission, None);
        info!(drive_key = %key.short(), peers = sent, "Channel submitted");
        Ok(sent)
    }

    /// Suppress a channel locally, now and for any later gossip.
    ///
    /// Returns `false` if the key was already hidden.
    pub fn hide_channel(&self, drive_key: &str) -> MeshResult<bool> {
        let key = DriveKey::parse(drive_key)?;
        let changed = {
            let mut state = self.inner.state.lock();
            let removed = state.entries.remove(&key).is_some();
            state.hidden.insert(key) || removed
        };
        if changed {
            self.inner.persist_immediately();
            self.inner.notify(FeedEvent::Updated);
            info!(drive_key = %key.short(), "Channel hidden");
        }
        Ok(changed)
    }

    /// Withdraw a locally published channel from the local feed.
    ///
    /// Peers that already know it keep it. Returns `false` if nothing changed.
    pub fn unpublish_channel(&self, drive_key: &str) -> MeshResult<bool> {
        let key = DriveKey::parse(drive_key)?;
        let changed = {
            let mut state = self.inner.state.lock();
            let unpublished = state.published.remove(&key).is_some();
            state.entries.remove(&key).is_some() || unpublished
        };
        if changed {
            self.inner.persist_immediately();
            self.inner.notify(FeedEvent::Updated);
            info!(drive_key = %key.short(), "Channel unpublished");
        }
        Ok(changed)
    }

    /// Ask every connected peer to resend its feed. Returns the number of
    /// channels asked.
    pub fn request_feeds_from_peers(&self) -> usize {
        let asked = self.inner.channels.broadcast(&FeedMessage::NeedFeed, None);
        debug!(peers = asked, "Requested feeds from peers");
        asked
    }

    /// Visible entries, newest first
    pub fn get_feed(&self) -> Vec<FeedEntry> {
        self.inner.sorted_entries()
    }

    pub fn get_stats(&self) -> FeedStats {
        let state = self.inner.state.lock();
        FeedStats {
            total_entries: state.entries.len(),
            hidden_count: state.hidden.len(),
            open_channels: self.inner.channels.open_count(),
            published_count: state.published.len(),
            send_failures: self.inner.channels.send_failures(),
        }
    }

    pub fn is_channel_published(&self, drive_key: &str) -> bool {
        DriveKey::parse(drive_key)
            .map(|key| self.inner.state.lock().published.contains_key(&key))
            .unwrap_or(false)
    }

    pub fn is_channel_hidden(&self, drive_key: &str) -> bool {
        DriveKey::parse(drive_key)
            .map(|key| self.inner.state.lock().hidden.contains(&key))
            .unwrap_or(false)
    }

    pub fn published_channels(&self) -> Vec<PublishedChannel> {
        self.inner
            .state
            .lock()
            .published
            .iter()
            .map(|(drive_key, public_bee_key)| PublishedChannel {
                drive_key: *drive_key,
                public_bee_key: *public_bee_key,
            })
            .collect()
    }

    /// Subscribe to feed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.inner.events.subscribe()
    }

    /// Stop background work and write out any pending debounced changes
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if self.inner.persist.cancel() {
            self.inner.persist_now();
        }
        debug!("Feed manager shut down");
    }
}

impl FeedInner {
    fn merge_entry(
        &self,
        drive_key: &str,
        source: EntrySource,
        public_bee_key: Option<&str>,
    ) -> MergeOutcome {
        let key = match DriveKey::parse(drive_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(%source, error = %e, "Ignoring malformed drive key");
                return MergeOutcome::Invalid;
            }
        };
        let bee = public_bee_key.and_then(|bee| match DriveKey::parse(bee) {
            Ok(bee) => Some(bee),
            Err(e) => {
                warn!(drive_key = %key.short(), error = %e, "Dropping malformed bee key");
                None
            }
        });
        self.merge_parsed(key, source, bee)
    }

    fn merge_parsed(
        &self,
        key: DriveKey,
        source: EntrySource,
        public_bee_key: Option<DriveKey>,
    ) -> MergeOutcome {
        let mut state = self.state.lock();
        if state.hidden.contains(&key) {
            return MergeOutcome::Hidden;
        }
        match state.entries.get_mut(&key) {
            Some(existing) => {
                if existing.public_bee_key.is_none() && public_bee_key.is_some() {
                    existing.public_bee_key = public_bee_key;
                    MergeOutcome::Backfilled
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => {
                state
                    .entries
                    .insert(key, FeedEntry::new(key, source, public_bee_key));
                debug!(drive_key = %key.short(), %source, "Feed entry added");
                MergeOutcome::Inserted
            }
        }
    }

    fn sorted_entries(&self) -> Vec<FeedEntry> {
        let mut entries: Vec<FeedEntry> = self.state.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.added_at
                .cmp(&a.added_at)
                .then_with(|| a.drive_key.cmp(&b.drive_key))
        });
        entries
    }

    /// The current feed as listings that each fit one frame of `channel`
    fn listings(&self, channel: &ProtocolChannel) -> Vec<FeedListing> {
        let entries = self.sorted_entries().iter().map(WireEntry::from).collect();
        split_entries(
            entries,
            channel.max_frame_size().saturating_sub(LISTING_ENVELOPE),
        )
    }

    /// Send the whole feed, one message per listing. Returns how many
    /// messages were queued.
    fn send_feed(&self, channel: &ProtocolChannel, wrap: fn(FeedListing) -> FeedMessage) -> usize {
        let listings = self.listings(channel);
        let frames = listings.len();
        let sent = listings
            .into_iter()
            .filter(|listing| self.channels.send(channel, &wrap(listing.clone())))
            .count();
        debug!(remote = %channel.remote_id(), frames, sent, "Sent feed listing");
        sent
    }

    fn notify(&self, event: FeedEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Merge a full listing from a peer; one notification per listing
    fn ingest_listing(&self, listing: FeedListing) {
        let mut inserted = 0usize;
        let mut backfilled = 0usize;
        for entry in listing.into_entries() {
            match self.merge_entry(
                &entry.drive_key,
                EntrySource::Peer,
                entry.public_bee_key.as_deref(),
            ) {
                MergeOutcome::Inserted => inserted += 1,
                MergeOutcome::Backfilled => backfilled += 1,
                _ => {}
            }
        }
        if inserted + backfilled > 0 {
            debug!(inserted, backfilled, "Merged peer feed");
            self.notify(FeedEvent::Updated);
            self.schedule_persist();
        }
    }

    fn ingest_submission(&self, from: &ProtocolChannel, submission: ChannelSubmission) {
        match self.merge_entry(
            &submission.key,
            EntrySource::Peer,
            submission.public_bee_key.as_deref(),
        ) {
            MergeOutcome::Inserted => {
                self.notify(FeedEvent::Updated);
                self.schedule_persist();
                let forwarded = self.channels.broadcast(
                    &FeedMessage::SubmitChannel(submission),
                    Some(from.connection_id()),
                );
                debug!(from = %from.remote_id(), forwarded, "Forwarded channel submission");
            }
            MergeOutcome::Backfilled => {
                self.notify(FeedEvent::Updated);
                self.schedule_persist();
            }
            MergeOutcome::Unchanged | MergeOutcome::Hidden | MergeOutcome::Invalid => {}
        }
    }

    fn schedule_persist(&self) {
        let weak = self.self_ref.clone();
        self.persist.schedule(async move {
            if let Some(inner) = weak.upgrade() {
                inner.persist_now();
            }
        });
    }

    fn persist_immediately(&self) -> bool {
        self.persist.cancel();
        self.persist_now()
    }

    /// Write the full feed state. Failures are logged; in-memory state stays
    /// authoritative.
    fn persist_now(&self) -> bool {
        let (published, hidden) = {
            let state = self.state.lock();
            let published: Vec<PublishedChannel> = state
                .published
                .iter()
                .map(|(drive_key, public_bee_key)| PublishedChannel {
                    drive_key: *drive_key,
                    public_bee_key: *public_bee_key,
                })
                .collect();
            let mut hidden: Vec<String> = state.hidden.iter().map(DriveKey::to_hex).collect();
            hidden.sort();
            (published, hidden)
        };
        let mut discovered = self.sorted_entries();
        if discovered.len() > self.config.max_persisted_entries {
            debug!(
                dropped = discovered.len() - self.config.max_persisted_entries,
                "Capping persisted feed entries"
            );
            discovered.truncate(self.config.max_persisted_entries);
        }

        let legacy_published: Vec<String> = published.iter().map(|p| p.drive_key.to_hex()).collect();
        let legacy_discovered: Vec<String> = discovered.iter().map(|e| e.drive_key.to_hex()).collect();

        let writes = [
            (PUBLISHED_KEY, encode(&published)),
            (LEGACY_PUBLISHED_KEY, encode(&legacy_published)),
            (DISCOVERED_KEY, encode(&discovered)),
            (LEGACY_DISCOVERED_KEY, encode(&legacy_discovered)),
            (HIDDEN_KEY, encode(&hidden)),
        ];

        let mut ok = true;
        for (key, value) in writes {
            let Some(value) = value else {
                ok = false;
                continue;
            };
            if let Err(e) = self.store.put(key, &value) {
                warn!(key, error = %e, "Failed to persist feed state");
                ok = false;
            }
        }
        if ok {
            debug!(entries = discovered.len(), published = published.len(), "Feed state persisted");
        }
        ok
    }

    /// Load persisted state. Returns whether anything visible was restored.
    fn restore(&self) -> bool {
        let hidden: Vec<String> = self.read_list(HIDDEN_KEY).unwrap_or_default();
        let published: Vec<PublishedChannel> = match self.read_list(PUBLISHED_KEY) {
            Some(published) => published,
            None => self
                .read_list::<String>(LEGACY_PUBLISHED_KEY)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|key| parse_logged(&key))
                .map(|drive_key| PublishedChannel {
                    drive_key,
                    public_bee_key: None,
                })
                .collect(),
        };
        let discovered: Vec<FeedEntry> = match self.read_list(DISCOVERED_KEY) {
            Some(entries) => entries,
            None => self
                .read_list::<String>(LEGACY_DISCOVERED_KEY)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|key| parse_logged(&key))
                .map(|key| FeedEntry::new(key, EntrySource::Peer, None))
                .collect(),
        };

        let mut state = self.state.lock();
        state.hidden.extend(hidden.iter().filter_map(|key| parse_logged(key)));

        for entry in discovered {
            if state.hidden.contains(&entry.drive_key) {
                continue;
            }
            state.entries.entry(entry.drive_key).or_insert(entry);
        }
        for channel in &published {
            state
                .published
                .insert(channel.drive_key, channel.public_bee_key);
            if state.hidden.contains(&channel.drive_key) {
                continue;
            }
            match state.entries.get_mut(&channel.drive_key) {
                Some(existing) => {
                    if existing.public_bee_key.is_none() {
                        existing.public_bee_key = channel.public_bee_key;
                    }
                }
                None => {
                    state.entries.insert(
                        channel.drive_key,
                        FeedEntry::new(channel.drive_key, EntrySource::Local, channel.public_bee_key),
                    );
                }
            }
        }

        info!(
            entries = state.entries.len(),
            published = state.published.len(),
            hidden = state.hidden.len(),
            "Feed state restored"
        );
        !state.entries.is_empty() || !state.published.is_empty()
    }

    /// Read a JSON array, decoding items one by one so a single bad item
    /// does not discard the rest. `None` if the key is absent or unreadable.
    fn read_list<T: DeserializeOwned>(&self, key: &str) -> Option<Vec<T>> {
        let value = match self.store.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read feed state, starting empty");
                return None;
            }
        };
        let serde_json::Value::Array(items) = value else {
            warn!(key, "Persisted feed state is not a list, ignoring");
            return None;
        };
        let total = items.len();
        let decoded: Vec<T> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();
        if decoded.len() < total {
            warn!(key, skipped = total - decoded.len(), "Skipped corrupt persisted items");
        }
        Some(decoded)
    }
}

fn encode<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "Failed to encode feed state");
            None
        }
    }
}

fn parse_logged(key: &str) -> Option<DriveKey> {
    match DriveKey::parse(key) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, "Skipping malformed persisted key");
            None
        }
    }
}

impl ChannelHandler for FeedInner {
    fn protocol(&self) -> &'static str {
        FEED_PROTOCOL
    }

    fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    fn on_open(&self, channel: &ProtocolChannel) {
        self.send_feed(channel, FeedMessage::HaveFeed);
        self.notify(FeedEvent::ChannelOpened {
            connection_id: channel.connection_id(),
            remote_id: channel.remote_id().to_string(),
        });
    }

    fn on_message(&self, channel: &ProtocolChannel, message: serde_json::Value) {
        let message = match FeedMessage::decode(message) {
            Ok(message) => message,
            Err(e) => {
                debug!(remote = %channel.remote_id(), error = %e, "Ignoring undecodable feed message");
                return;
            }
        };
        debug!(remote = %channel.remote_id(), kind = message.kind(), "Feed message");

        match message {
            FeedMessage::HaveFeed(listing) | FeedMessage::FeedResponse(listing) => {
                self.ingest_listing(listing)
            }
            FeedMessage::SubmitChannel(submission) => self.ingest_submission(channel, submission),
            FeedMessage::NeedFeed => {
                self.send_feed(channel, FeedMessage::FeedResponse);
            }
        }
    }

    fn on_closed(&self, channel: &ProtocolChannel) {
        self.notify(FeedEvent::ChannelClosed {
            connection_id: channel.connection_id(),
            remote_id: channel.remote_id().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn key(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn manager_with(store: Arc<MemoryStore>) -> GossipFeedManager {
        GossipFeedManager::new(None, store, FeedConfig::default())
    }

    fn manager() -> (GossipFeedManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (manager_with(store.clone()), store)
    }

    fn drain(rx: &mut broadcast::Receiver<FeedEvent>) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_add_entry_is_idempotent() {
        let (feed, _store) = manager();
        assert!(feed.add_entry(&key('a'), EntrySource::Peer, None));
        assert!(!feed.add_entry(&key('a'), EntrySource::Peer, None));
        assert_eq!(feed.get_feed().len(), 1);
    }

    #[tokio::test]
    async fn test_add_entry_rejects_malformed_keys() {
        let (feed, _store) = manager();
        assert!(!feed.add_entry("short", EntrySource::Peer, None));
        assert!(!feed.add_entry(&"z".repeat(64), EntrySource::Peer, None));
        assert!(feed.get_feed().is_empty());
    }

    #[tokio::test]
    async fn test_uppercase_key_merges_with_lowercase() {
        let (feed, _store) = manager();
        assert!(feed.add_entry(&"AB".repeat(32), EntrySource::Peer, None));
        assert!(!feed.add_entry(&"ab".repeat(32), EntrySource::Peer, None));
        assert_eq!(feed.get_feed()[0].drive_key.to_hex(), "ab".repeat(32));
    }

    #[tokio::test]
    async fn test_bee_key_is_backfilled_once() {
        let (feed, _store) = manager();
        feed.add_entry(&key('a'), EntrySource::Peer, None);
        let mut events = feed.subscribe();
        assert!(!feed.add_entry(&key('a'), EntrySource::Peer, Some(&key('b'))));
        assert_eq!(drain(&mut events), vec![FeedEvent::Updated]);

        assert!(!feed.add_entry(&key('a'), EntrySource::Peer, Some(&key('c'))));
        assert!(drain(&mut events).is_empty());

        let entry = &feed.get_feed()[0];
        assert_eq!(entry.public_bee_key.map(|k| k.to_hex()), Some(key('b')));
    }

    #[tokio::test]
    async fn test_malformed_bee_key_still_merges_drive_key() {
        let (feed, _store) = manager();
        assert!(feed.add_entry(&key('a'), EntrySource::Peer, Some("nope")));
        assert_eq!(feed.get_feed()[0].public_bee_key, None);
    }

    #[tokio::test]
    async fn test_hidden_key_is_never_readmitted() {
        let (feed, _store) = manager();
        feed.add_entry(&key('a'), EntrySource::Peer, None);
        assert!(feed.hide_channel(&key('a')).unwrap());
        assert!(feed.get_feed().is_empty());

        assert!(!feed.add_entry(&key('a'), EntrySource::Peer, None));
        feed.inner
            .ingest_listing(FeedListing::Keys(vec![key('a'), key('b')]));
        let keys: Vec<String> = feed.get_feed().iter().map(|e| e.drive_key.to_hex()).collect();
        assert_eq!(keys, vec![key('b')]);
        assert_eq!(feed.get_stats().hidden_count, 1);
        assert!(feed.is_channel_hidden(&key('a')));
    }

    #[tokio::test]
    async fn test_have_feed_with_five_keys_notifies_once() {
        let (feed, _store) = manager();
        let mut events = feed.subscribe();

        let keys: Vec<String> = ['1', '2', '3', '4', '5'].into_iter().map(key).collect();
        feed.inner.on_message_json(json!({"type": "HAVE_FEED", "keys": keys}));

        assert_eq!(feed.get_feed().len(), 5);
        assert_eq!(drain(&mut events), vec![FeedEvent::Updated]);

        // Same listing again: nothing new, no event
        feed.inner.on_message_json(json!({"type": "HAVE_FEED", "keys": keys}));
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_submit_then_unpublish() {
        let (feed, store) = manager();
        let sent = feed.submit_channel(&key('a'), None).unwrap();
        assert_eq!(sent, 0);
        assert!(feed.is_channel_published(&key('a')));
        assert_eq!(feed.get_feed()[0].source, EntrySource::Local);
        assert_eq!(store.write_count(PUBLISHED_KEY), 1);

        assert!(feed.unpublish_channel(&key('a')).unwrap());
        assert!(!feed.is_channel_published(&key('a')));
        assert!(feed.get_feed().is_empty());
        assert_eq!(store.write_count(PUBLISHED_KEY), 2);
        assert!(!feed.unpublish_channel(&key('a')).unwrap());
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_keys() {
        let (feed, _store) = manager();
        assert!(matches!(
            feed.submit_channel("bad", None),
            Err(MeshError::InvalidKey(_))
        ));
        assert!(matches!(
            feed.submit_channel(&key('a'), Some("bad")),
            Err(MeshError::InvalidKey(_))
        ));
        assert!(!feed.is_channel_published(&key('a')));
    }

    #[tokio::test]
    async fn test_submit_keeps_known_bee_key() {
        let (feed, _store) = manager();
        feed.submit_channel(&key('a'), Some(&key('b'))).unwrap();
        feed.submit_channel(&key('a'), None).unwrap();
        let published = feed.published_channels();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].public_bee_key.map(|k| k.to_hex()), Some(key('b')));
    }

    #[tokio::test]
    async fn test_submit_of_hidden_key_stays_out_of_feed() {
        let (feed, _store) = manager();
        feed.hide_channel(&key('a')).unwrap();
        feed.submit_channel(&key('a'), None).unwrap();
        assert!(feed.is_channel_published(&key('a')));
        assert!(feed.get_feed().is_empty());
    }

    #[tokio::test]
    async fn test_feed_is_newest_first() {
        let (feed, _store) = manager();
        feed.add_entry(&key('a'), EntrySource::Peer, None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        feed.add_entry(&key('b'), EntrySource::Peer, None);

        let order: Vec<String> = feed.get_feed().iter().map(|e| e.drive_key.to_hex()).collect();
        assert_eq!(order, vec![key('b'), key('a')]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gossip_mutations_persist_once_after_debounce() {
        let (feed, store) = manager();
        feed.inner
            .ingest_listing(FeedListing::Keys(vec![key('a'), key('b')]));
        feed.inner.ingest_listing(FeedListing::Keys(vec![key('c')]));
        assert_eq!(store.write_count(DISCOVERED_KEY), 0);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(store.write_count(DISCOVERED_KEY), 1);

        let persisted = store.get(DISCOVERED_KEY).unwrap().unwrap();
        assert_eq!(persisted.as_array().unwrap().len(), 3);
        let legacy = store.get(LEGACY_DISCOVERED_KEY).unwrap().unwrap();
        assert_eq!(legacy.as_array().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_action_cancels_pending_debounce() {
        let (feed, store) = manager();
        feed.inner.ingest_listing(FeedListing::Keys(vec![key('a')]));
        feed.submit_channel(&key('b'), None).unwrap();
        assert_eq!(store.write_count(DISCOVERED_KEY), 1);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(store.write_count(DISCOVERED_KEY), 1);
    }

    #[tokio::test]
    async fn test_persisted_entries_are_capped_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let config = FeedConfig {
            max_persisted_entries: 2,
            ..FeedConfig::default()
        };
        let feed = GossipFeedManager::new(None, store.clone(), config);
        for (i, c) in ['a', 'b', 'c'].into_iter().enumerate() {
            feed.add_entry(&key(c), EntrySource::Peer, None);
            feed.inner
                .state
                .lock()
                .entries
                .values_mut()
                .for_each(|e| {
                    if e.drive_key.to_hex() == key(c) {
                        e.added_at = i as i64;
                    }
                });
        }
        assert!(feed.inner.persist_now());

        let persisted = store.get(DISCOVERED_KEY).unwrap().unwrap();
        let keys: Vec<&str> = persisted
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["driveKey"].as_str().unwrap())
            .collect();
        assert_eq!(keys, vec![key('c').as_str(), key('b').as_str()]);
    }

    #[tokio::test]
    async fn test_restore_round_trip_emits_update() {
        let store = Arc::new(MemoryStore::new());
        {
            let feed = manager_with(store.clone());
            feed.submit_channel(&key('a'), Some(&key('b'))).unwrap();
            feed.add_entry(&key('c'), EntrySource::Peer, None);
            feed.hide_channel(&key('d')).unwrap();
        }

        let feed = manager_with(store.clone());
        let mut events = feed.subscribe();
        feed.start().await;

        assert_eq!(drain(&mut events), vec![FeedEvent::Updated]);
        assert!(feed.is_channel_published(&key('a')));
        assert!(feed.is_channel_hidden(&key('d')));
        let keys: HashSet<String> = feed.get_feed().iter().map(|e| e.drive_key.to_hex()).collect();
        assert_eq!(keys, HashSet::from([key('a'), key('c')]));
        let own = feed
            .get_feed()
            .into_iter()
            .find(|e| e.drive_key.to_hex() == key('a'))
            .unwrap();
        assert_eq!(own.public_bee_key.map(|k| k.to_hex()), Some(key('b')));
    }

    #[tokio::test]
    async fn test_restore_from_legacy_keys() {
        let store = Arc::new(MemoryStore::new());
        store.put(LEGACY_PUBLISHED_KEY, &json!([key('a')])).unwrap();
        store
            .put(LEGACY_DISCOVERED_KEY, &json!([key('b'), "garbage"]))
            .unwrap();

        let feed = manager_with(store);
        feed.start().await;

        assert!(feed.is_channel_published(&key('a')));
        assert_eq!(feed.get_feed().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_or_unreadable_store_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.put(PUBLISHED_KEY, &json!({"not": "a list"})).unwrap();
        store
            .put(DISCOVERED_KEY, &json!([{"driveKey": "bad"}, 7]))
            .unwrap();
        let feed = manager_with(store.clone());
        let mut events = feed.subscribe();
        feed.start().await;
        assert!(feed.get_feed().is_empty());
        assert!(drain(&mut events).is_empty());

        let failing = Arc::new(MemoryStore::new());
        failing.set_fail_reads(true);
        let feed = manager_with(failing);
        feed.start().await;
        assert!(feed.get_feed().is_empty());
    }

    #[tokio::test]
    async fn test_write_failures_do_not_lose_memory_state() {
        let (feed, store) = manager();
        store.set_fail_writes(true);
        feed.submit_channel(&key('a'), None).unwrap();
        assert!(feed.is_channel_published(&key('a')));
        assert_eq!(feed.get_feed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_write() {
        let (feed, store) = manager();
        feed.inner.ingest_listing(FeedListing::Keys(vec![key('a')]));
        assert_eq!(store.write_count(DISCOVERED_KEY), 0);
        feed.shutdown();
        assert_eq!(store.write_count(DISCOVERED_KEY), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (feed, store) = manager();
        store.put(LEGACY_PUBLISHED_KEY, &json!([key('a')])).unwrap();
        let mut events = feed.subscribe();
        feed.start().await;
        feed.start().await;
        assert_eq!(drain(&mut events), vec![FeedEvent::Updated]);
    }

    impl FeedInner {
        fn on_message_json(&self, value: serde_json::Value) {
            match FeedMessage::decode(value).unwrap() {
                FeedMessage::HaveFeed(listing) | FeedMessage::FeedResponse(listing) => {
                    self.ingest_listing(listing)
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
    }
}
