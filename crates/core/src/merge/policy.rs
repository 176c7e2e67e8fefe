use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::record::TorrentRecord;
use crate::store::Bucket;

/// Caller-defined acceptance check for overwriting a stored record.
///
/// Implementations may do async work (resolving a magnet from a torrent
/// file, for example) and may rewrite `incoming` before it is stored.
#[async_trait]
pub trait AcceptPolicy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether `incoming` should replace `stored`. `bucket` is the writer's
    /// view of the whole bucket.
    async fn accept(
        &self,
        incoming: &mut TorrentRecord,
        stored: &TorrentRecord,
        bucket: &Bucket,
    ) -> bool;
}

/// How `AddOrUpdate` treats a record whose `url` is already stored.
///
/// New URLs are always inserted; the rule only decides overwrites.
#[derive(Clone, Default)]
pub enum AcceptRule {
    /// Blind upsert. Used by replication.
    #[default]
    Always,
    /// Only when the incoming record brings a magnet the stored one lacks.
    IfMagnetMissing,
    /// Only when the release title differs from the stored one.
    IfTitleChanged,
    /// Only when the incoming `updateTime` is strictly later.
    IfNewer,
    Custom(Arc<dyn AcceptPolicy>),
}

impl AcceptRule {
    pub fn custom(policy: impl AcceptPolicy + 'static) -> Self {
        Self::Custom(Arc::new(policy))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Always => "always",
            Self::IfMagnetMissing => "if_magnet_missing",
            Self::IfTitleChanged => "if_title_changed",
            Self::IfNewer => "if_newer",
            Self::Custom(policy) => policy.name(),
        }
    }

    pub async fn evaluate(
        &self,
        incoming: &mut TorrentRecord,
        stored: &TorrentRecord,
        bucket: &Bucket,
    ) -> bool {
        match self {
            Self::Always => true,
            Self::IfMagnetMissing => incoming.has_magnet() && !stored.has_magnet(),
            Self::IfTitleChanged => incoming.title != stored.title,
            Self::IfNewer => incoming.update_time > stored.update_time,
            Self::Custom(policy) => policy.accept(incoming, stored, bucket).await,
        }
    }
}

impl fmt::Debug for AcceptRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AcceptRule({})", self.name())
    }
}
