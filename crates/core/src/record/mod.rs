//! The torrent record and its wire representation.
//!
//! Field names on the wire follow the existing sync protocol (`trackerName`,
//! `sizeName`, `createTime`, `_sn`, ...), so records round-trip unchanged
//! between nodes.

mod size;
mod time;
mod types;

pub use size::parse_size_name;
pub use time::{file_time, from_file_time, UNSET_TIME};
pub(crate) use time::{format_file_time, wire_time};
pub(crate) use types::null_as_default;
pub use types::TorrentRecord;
