//! # Buckindex
//!
//! An ordered in-memory key-value index whose inner nodes are driven by
//! learned piecewise-linear models instead of a fixed fanout. Point
//! lookups, range scans and inserts descend a two-layer structure: segment
//! nodes predict the covering child with a linear model, and leaf data
//! buckets resolve the key with a short hinted probe.

// Internally exposed modules.
pub(crate) mod arena;
pub(crate) mod bucket;
pub(crate) mod config;
pub(crate) mod corridor;
pub(crate) mod cursor;
pub(crate) mod index;
pub(crate) mod kv;
pub(crate) mod model;
pub(crate) mod segment;
pub(crate) mod segmentation;

// Externally exposed types.
pub use config::{ConfigError, HintKind, IndexOptions, ModelKind, WorkloadConfig};
pub use index::{BuckIndex, Stats};
pub use kv::{KEY_MAX, KEY_MIN, Key, KeyValue, Value};
