//! `AddOrUpdate`: conditional upsert of record batches.
//!
//! Local scrapers and replication share this path, so every write goes
//! through the same bucket-exclusive handle and the same acceptance rules.

mod engine;
mod policy;

pub use engine::{BucketFailure, MergeEngine, MergeReport};
pub use policy::{AcceptPolicy, AcceptRule};
