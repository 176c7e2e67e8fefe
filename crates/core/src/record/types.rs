use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::size::parse_size_name;
use super::time::{wire_time, UNSET_TIME};
use crate::normalize::{bucket_key, search_name, BucketKey};

/// One discovered release.
///
/// `url` identifies the record inside its bucket; everything else may be
/// refreshed by later observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentRecord {
    #[serde(rename = "trackerName", default, deserialize_with = "null_as_default")]
    pub tracker_name: String,
    /// Content category tags ("movie", "serial", "sport", ...).
    #[serde(default, deserialize_with = "null_as_default")]
    pub types: BTreeSet<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    /// Seeders.
    #[serde(default, deserialize_with = "null_as_default")]
    pub sid: i64,
    /// Leechers.
    #[serde(default, deserialize_with = "null_as_default")]
    pub pir: i64,
    #[serde(rename = "sizeName", default, deserialize_with = "null_as_default")]
    pub size_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub size: u64,
    #[serde(rename = "createTime", default = "unset_time", with = "wire_time")]
    pub create_time: DateTime<Utc>,
    #[serde(rename = "updateTime", default = "unset_time", with = "wire_time")]
    pub update_time: DateTime<Utc>,
    #[serde(rename = "checkTime", default = "unset_time", with = "wire_time")]
    pub check_time: DateTime<Utc>,
    /// Localized title.
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Original title.
    #[serde(default, deserialize_with = "null_as_default")]
    pub originalname: String,
    /// Release year.
    #[serde(default, deserialize_with = "null_as_default")]
    pub relased: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet: Option<String>,
    #[serde(rename = "_sn", default, deserialize_with = "null_as_default")]
    pub search_name: String,
    #[serde(rename = "_so", default, deserialize_with = "null_as_default")]
    pub search_originalname: String,
    /// Audio languages found by media probing. Written out of band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<BTreeSet<String>>,
}

fn unset_time() -> DateTime<Utc> {
    UNSET_TIME
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl TorrentRecord {
    /// Minimal record; callers fill in the rest.
    pub fn new(
        tracker_name: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        name: impl Into<String>,
        originalname: impl Into<String>,
    ) -> Self {
        let mut record = Self {
            tracker_name: tracker_name.into(),
            types: BTreeSet::new(),
            url: url.into(),
            title: title.into(),
            sid: 0,
            pir: 0,
            size_name: String::new(),
            size: 0,
            create_time: UNSET_TIME,
            update_time: UNSET_TIME,
            check_time: UNSET_TIME,
            name: name.into(),
            originalname: originalname.into(),
            relased: 0,
            magnet: None,
            search_name: String::new(),
            search_originalname: String::new(),
            languages: None,
        };
        record.refresh_search_names();
        record
    }

    /// Key of the bucket this record belongs in.
    pub fn bucket_key(&self) -> BucketKey {
        bucket_key(&self.name, &self.originalname)
    }

    pub fn has_magnet(&self) -> bool {
        self.magnet.as_deref().is_some_and(|m| !m.trim().is_empty())
    }

    /// Recompute `_sn`/`_so` from the title fields.
    pub fn refresh_search_names(&mut self) {
        self.search_name = search_name(&self.name);
        self.search_originalname = search_name(&self.originalname);
    }

    /// Default blank titles and recompute search names. Returns whether
    /// anything changed.
    pub fn fill_names(&mut self) -> bool {
        let mut changed = false;
        if self.name.trim().is_empty() && self.name != self.title {
            self.name = self.title.clone();
            changed = true;
        }
        if self.originalname.trim().is_empty() && self.originalname != self.name {
            self.originalname = self.name.clone();
            changed = true;
        }

        let sn = search_name(&self.name);
        let so = search_name(&self.originalname);
        if sn != self.search_name || so != self.search_originalname {
            self.search_name = sn;
            self.search_originalname = so;
            changed = true;
        }
        changed
    }

    /// Fill derivable fields before the record is stored.
    ///
    /// Blank `name` falls back to `title`, blank `originalname` to
    /// `name`; search names are recomputed; a missing byte size is parsed
    /// from `sizeName`; unset timestamps become `now`.
    pub fn prepare(&mut self, now: DateTime<Utc>) {
        self.fill_names();

        if self.size == 0 && !self.size_name.is_empty() {
            self.size = parse_size_name(&self.size_name);
        }
        if self.create_time == UNSET_TIME {
            self.create_time = now;
        }
        if self.update_time == UNSET_TIME {
            self.update_time = now;
        }
    }

    /// Overwrite this stored record with an accepted incoming one.
    ///
    /// The incoming record wins field by field, except that an empty incoming
    /// magnet keeps the stored one, probe results (`languages`) and the
    /// earliest known `createTime` survive, and `checkTime` never moves
    /// backwards. Returns `false` when nothing but `updateTime` would change;
    /// the stored record is then left untouched.
    pub fn absorb(&mut self, incoming: TorrentRecord) -> bool {
        let mut merged = incoming;

        if !merged.has_magnet() {
            merged.magnet = self.magnet.clone();
        }
        if merged.languages.is_none() {
            merged.languages = self.languages.clone();
        }
        if self.create_time != UNSET_TIME
            && (merged.create_time == UNSET_TIME || self.create_time < merged.create_time)
        {
            merged.create_time = self.create_time;
        }
        merged.check_time = merged.check_time.max(self.check_time);

        let incoming_update = merged.update_time;
        merged.update_time = self.update_time;
        if merged == *self {
            return false;
        }

        merged.update_time = incoming_update.max(self.update_time);
        *self = merged;
        true
    }
}
