use std::collections::HashSet;

use crate::config::SyncConfig;
use crate::record::TorrentRecord;

/// Which replicated records are kept before merging.
#[derive(Debug, Clone, Default)]
pub struct SyncFilter {
    /// Allowed trackers; `None` allows all. Records without a tracker name always pass.
    trackers: Option<HashSet<String>>,
    /// Records carrying any of these type tags are dropped.
    excluded_types: HashSet<String>,
}

impl SyncFilter {
    pub fn from_config(config: &SyncConfig) -> Self {
        let mut filter = Self {
            trackers: config
                .trackers
                .as_ref()
                .map(|t| t.iter().cloned().collect()),
            excluded_types: HashSet::new(),
        };
        if !config.include_sport {
            filter.excluded_types.insert("sport".to_string());
        }
        filter
    }

    pub fn with_trackers<I, S>(mut self, trackers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trackers = Some(trackers.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_type(mut self, tag: impl Into<String>) -> Self {
        self.excluded_types.insert(tag.into());
        self
    }

    pub fn accepts(&self, record: &TorrentRecord) -> bool {
        if let Some(trackers) = &self.trackers {
            if !record.tracker_name.is_empty() && !trackers.contains(&record.tracker_name) {
                return false;
            }
        }
        !record.types.iter().any(|t| self.excluded_types.contains(t))
    }

    pub fn apply(&self, records: Vec<TorrentRecord>) -> Vec<TorrentRecord> {
        records.into_iter().filter(|r| self.accepts(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tracker: &str, types: &[&str]) -> TorrentRecord {
        let mut r = TorrentRecord::new(tracker, "u", "x", "x", "x");
        r.types = types.iter().map(|t| t.to_string()).collect();
        r
    }

    #[test]
    fn test_default_accepts_everything() {
        let filter = SyncFilter::default();
        assert!(filter.accepts(&record("rutor", &["sport"])));
        assert!(filter.accepts(&record("", &[])));
    }

    #[test]
    fn test_tracker_allow_list() {
        let filter = SyncFilter::default().with_trackers(["rutor", "kinozal"]);
        assert!(filter.accepts(&record("rutor", &["movie"])));
        assert!(!filter.accepts(&record("nnmclub", &["movie"])));
        assert!(filter.accepts(&record("", &["movie"])));
    }

    #[test]
    fn test_from_config_excludes_sport() {
        let config = SyncConfig {
            include_sport: false,
            trackers: Some(vec!["rutor".to_string()]),
            ..Default::default()
        };
        let filter = SyncFilter::from_config(&config);
        assert!(!filter.accepts(&record("rutor", &["sport", "serial"])));
        assert!(filter.accepts(&record("rutor", &["serial"])));

        let kept = filter.apply(vec![
            record("rutor", &["movie"]),
            record("other", &["movie"]),
            record("rutor", &["sport"]),
        ]);
        assert_eq!(kept.len(), 1);
    }
}
