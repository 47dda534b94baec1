//! Channel discovery protocol messages
//!
//! JSON objects discriminated by `type`, carried on the
//! `channelmesh/feeds/1` mux channel.
//!
//! ```text
//! Peer A                                   Peer B
//!   |--- HAVE_FEED {keys, entries} -------->|   (on channel open)
//!   |<-- HAVE_FEED {keys, entries} ---------|
//!   |                                       |
//!   |--- SUBMIT_CHANNEL {key, ...} -------->|   (user published)
//!   |                                       |--- SUBMIT_CHANNEL --> others
//!   |                                       |
//!   |--- NEED_FEED ------------------------>|   (explicit refresh)
//!   |<-- FEED_RESPONSE {keys, entries} -----|
//! ```
//!
//! Keys stay strings on the wire; validation happens in the merge so one bad
//! key never discards the rest of a message.

use serde::{Deserialize, Serialize};

use crate::types::FeedEntry;

/// Protocol name negotiated on the mux
pub const FEED_PROTOCOL: &str = "channelmesh/feeds/1";

/// One feed entry as gossiped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    #[serde(rename = "driveKey")]
    pub drive_key: String,
    #[serde(rename = "publicBeeKey", default, skip_serializing_if = "Option::is_none")]
    pub public_bee_key: Option<String>,
}

impl From<&FeedEntry> for WireEntry {
    fn from(entry: &FeedEntry) -> Self {
        Self {
            drive_key: entry.drive_key.to_hex(),
            public_bee_key: entry.public_bee_key.map(|k| k.to_hex()),
        }
    }
}

/// Payload of `HAVE_FEED` / `FEED_RESPONSE`.
///
/// Older senders list bare keys; newer ones list entries (and still fill
/// `keys` for the older receivers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FeedListingWire", into = "FeedListingWire")]
pub enum FeedListing {
    Keys(Vec<String>),
    Entries(Vec<WireEntry>),
}

impl FeedListing {
    /// Listing of the given entries in the current shape
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a FeedEntry>) -> Self {
        FeedListing::Entries(entries.into_iter().map(WireEntry::from).collect())
    }

    /// Normalise to (drive key, bee key) pairs
    pub fn into_entries(self) -> Vec<WireEntry> {
        match self {
            FeedListing::Keys(keys) => keys
                .into_iter()
                .map(|drive_key| WireEntry {
                    drive_key,
                    public_bee_key: None,
                })
                .collect(),
            FeedListing::Entries(entries) => entries,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FeedListing::Keys(keys) => keys.len(),
            FeedListing::Entries(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encoded bytes one entry adds to a listing: its object in `entries`, its
/// drive key in `keys`, and a separator in each array
fn entry_wire_size(entry: &WireEntry) -> usize {
    let object = serde_json::to_vec(entry).map(|v| v.len()).unwrap_or(0);
    let key = serde_json::to_vec(&entry.drive_key).map(|v| v.len()).unwrap_or(0);
    object + key + 2
}

/// Split entries into listings whose encoded size stays within `budget`.
///
/// Order is preserved and at least one listing is returned, so an empty feed
/// still produces one (empty) message. An entry larger than the budget on
/// its own goes out alone and is left for the send path to reject.
pub fn split_entries(entries: Vec<WireEntry>, budget: usize) -> Vec<FeedListing> {
    let mut listings = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;
    for entry in entries {
        let size = entry_wire_size(&entry);
        if !current.is_empty() && used + size > budget {
            listings.push(FeedListing::Entries(std::mem::take(&mut current)));
            used = 0;
        }
        used += size;
        current.push(entry);
    }
    if !current.is_empty() || listings.is_empty() {
        listings.push(FeedListing::Entries(current));
    }
    listings
}

#[derive(Serialize, Deserialize)]
struct FeedListingWire {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entries: Option<Vec<WireEntry>>,
}

impl From<FeedListingWire> for FeedListing {
    fn from(wire: FeedListingWire) -> Self {
        match wire.entries {
            Some(entries) => FeedListing::Entries(entries),
            None => FeedListing::Keys(wire.keys),
        }
    }
}

impl From<FeedListing> for FeedListingWire {
    fn from(listing: FeedListing) -> Self {
        match listing {
            FeedListing::Keys(keys) => FeedListingWire {
                keys,
                entries: None,
            },
            FeedListing::Entries(entries) => FeedListingWire {
                keys: entries.iter().map(|e| e.drive_key.clone()).collect(),
                entries: Some(entries),
            },
        }
    }
}

/// Payload of `SUBMIT_CHANNEL`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSubmission {
    pub key: String,
    #[serde(rename = "publicBeeKey", default, skip_serializing_if = "Option::is_none")]
    pub public_bee_key: Option<String>,
}

/// Messages on the feed protocol channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    /// Full list of known channels, sent once at channel open
    #[serde(rename = "HAVE_FEED")]
    HaveFeed(FeedListing),

    /// A channel the sender (or someone upstream) just published
    #[serde(rename = "SUBMIT_CHANNEL")]
    SubmitChannel(ChannelSubmission),

    /// Legacy pull request; answered with `FEED_RESPONSE`
    #[serde(rename = "NEED_FEED")]
    NeedFeed,

    /// Legacy answer to `NEED_FEED`
    #[serde(rename = "FEED_RESPONSE")]
    FeedResponse(FeedListing),
}

impl FeedMessage {
    pub fn decode(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Wire discriminator, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            FeedMessage::HaveFeed(_) => "HAVE_FEED",
            FeedMessage::SubmitChannel(_) => "SUBMIT_CHANNEL",
            FeedMessage::NeedFeed => "NEED_FEED",
            FeedMessage::FeedResponse(_) => "FEED_RESPONSE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_have_feed_with_entries_also_lists_keys() {
        let msg = FeedMessage::HaveFeed(FeedListing::Entries(vec![WireEntry {
            drive_key: "aa".to_string(),
            public_bee_key: Some("bb".to_string()),
        }]));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "HAVE_FEED",
                "keys": ["aa"],
                "entries": [{"driveKey": "aa", "publicBeeKey": "bb"}],
            })
        );
    }

    #[test]
    fn test_legacy_keys_only_listing() {
        let msg = FeedMessage::decode(json!({"type": "HAVE_FEED", "keys": ["k1", "k2"]})).unwrap();
        let FeedMessage::HaveFeed(listing) = msg else {
            panic!("expected HAVE_FEED");
        };
        assert_eq!(listing, FeedListing::Keys(vec!["k1".into(), "k2".into()]));
        let entries = listing.into_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.public_bee_key.is_none()));
    }

    #[test]
    fn test_entries_preferred_over_keys() {
        let msg = FeedMessage::decode(json!({
            "type": "FEED_RESPONSE",
            "keys": ["ignored"],
            "entries": [{"driveKey": "x"}],
        }))
        .unwrap();
        assert_eq!(
            msg,
            FeedMessage::FeedResponse(FeedListing::Entries(vec![WireEntry {
                drive_key: "x".into(),
                public_bee_key: None,
            }]))
        );
    }

    #[test]
    fn test_submit_and_need_feed_shapes() {
        let submit = FeedMessage::decode(json!({"type": "SUBMIT_CHANNEL", "key": "k"})).unwrap();
        assert_eq!(
            submit,
            FeedMessage::SubmitChannel(ChannelSubmission {
                key: "k".into(),
                public_bee_key: None,
            })
        );

        let need = FeedMessage::decode(json!({"type": "NEED_FEED"})).unwrap();
        assert_eq!(need, FeedMessage::NeedFeed);
        assert_eq!(serde_json::to_value(&need).unwrap(), json!({"type": "NEED_FEED"}));
    }

    #[test]
    fn test_split_entries_fits_budget_and_keeps_order() {
        let entries: Vec<WireEntry> = (0..300)
            .map(|i| WireEntry {
                drive_key: format!("{:064x}", i),
                public_bee_key: (i % 2 == 0).then(|| format!("{:064x}", i + 1000)),
            })
            .collect();
        let budget = 4096;
        let listings = split_entries(entries.clone(), budget);
        assert!(listings.len() > 1);

        let overhead = serde_json::to_vec(&FeedMessage::HaveFeed(FeedListing::Entries(vec![])))
            .unwrap()
            .len();
        for listing in &listings {
            let encoded = serde_json::to_vec(&FeedMessage::HaveFeed(listing.clone())).unwrap();
            assert!(encoded.len() <= budget + overhead, "{} bytes", encoded.len());
        }

        let rejoined: Vec<WireEntry> = listings
            .into_iter()
            .flat_map(FeedListing::into_entries)
            .collect();
        assert_eq!(rejoined, entries);
    }

    #[test]
    fn test_split_empty_feed_yields_one_listing() {
        let listings = split_entries(Vec::new(), 1024);
        assert_eq!(listings, vec![FeedListing::Entries(vec![])]);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(FeedMessage::decode(json!({"type": "SEARCH_QUERY"})).is_err());
        assert!(FeedMessage::decode(json!({"keys": []})).is_err());
    }
}
