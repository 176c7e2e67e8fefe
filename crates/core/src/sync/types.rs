//! Wire types of the replication protocol.

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::normalize::BucketKey;
use crate::record::{null_as_default, TorrentRecord};
use crate::store::Bucket;

/// `GET /sync/conf`: what a node publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConf {
    /// Bucket feed (v2) available.
    #[serde(default)]
    pub fbd: bool,
    /// Secondary spidr feed available.
    #[serde(default)]
    pub spidr: bool,
}

/// One entry of a v1 page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V1Item {
    pub value: TorrentRecord,
}

/// `GET /sync/torrents?time=`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V1Page {
    /// Page size the server used; a full page means more may follow.
    #[serde(default)]
    pub take: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub torrents: Vec<V1Item>,
}

/// One bucket's delta in a v2 page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCollection {
    #[serde(rename = "fileTime")]
    pub file_time: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub torrents: Bucket,
}

/// `GET /sync/fdb/torrents?time=&start=[&spidr=true]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V2Page {
    /// Records in this page.
    #[serde(default)]
    pub countread: usize,
    /// More pages follow.
    #[serde(default)]
    pub nextread: bool,
    /// `None` (missing or null) marks a broken response; an empty map means
    /// the peer has nothing newer.
    #[serde(default)]
    pub collections: Option<Collections>,
}

/// Bucket key → collection, in the order the peer sent them.
///
/// Serialized as a JSON object; insertion order is kept both ways so pages
/// stay in ascending cursor order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collections(Vec<(BucketKey, WireCollection)>);

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: BucketKey, collection: WireCollection) {
        self.0.push((key, collection));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(BucketKey, WireCollection)> {
        self.0.iter()
    }

    /// Highest bucket cursor in the page.
    pub fn max_file_time(&self) -> Option<i64> {
        self.0.iter().map(|(_, c)| c.file_time).max()
    }

    pub fn record_count(&self) -> usize {
        self.0.iter().map(|(_, c)| c.torrents.len()).sum()
    }

    /// Flatten into records, bucket by bucket.
    pub fn into_records(self) -> Vec<TorrentRecord> {
        self.0
            .into_iter()
            .flat_map(|(_, c)| c.torrents.into_values())
            .collect()
    }
}

impl FromIterator<(BucketKey, WireCollection)> for Collections {
    fn from_iter<I: IntoIterator<Item = (BucketKey, WireCollection)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for Collections {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

impl<'de> Deserialize<'de> for Collections {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CollectionsVisitor;

        impl<'de> Visitor<'de> for CollectionsVisitor {
            type Value = Collections;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of bucket key to collection")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry()? {
                    entries.push((key, value));
                }
                Ok(Collections(entries))
            }
        }

        deserializer.deserialize_map(CollectionsVisitor)
    }
}
