//! # Timebatch - Tiered Time-Series Storage Engine
//!
//! A multi-tenant storage engine for sensor-style datapoint streams.
//! Producers append to per-stream logs; consumers read ranges by index or
//! time, subscribe to live inserts, and run transform pipelines over the
//! results. Storage is split between a Redis hot cache for recent writes
//! and a chunked SQL cold store for history, behind one logical append log.
//!
//! ## Architecture
//!
//! - `core`: datapoints, stream paths, the wire codec, error taxonomy
//! - `range`: lazy composable datapoint iterators
//! - `cache`: Redis hot cache with atomic insert/batch-cut scripts
//! - `store`: chunked SQL cold store
//! - `engine`: the unified log, range composition and the migrator
//! - `transform`: the per-datapoint filter/projection language
//! - `notify`: best-effort pub/sub for live consumers
//! - `config`: engine configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core types - datapoints, paths, codec, errors
pub mod core;

// Lazy range iterators
pub mod range;

// Redis hot cache
pub mod cache;

// SQL cold store
pub mod store;

// Unified engine and migrator
pub mod engine;

// Transform DSL
pub mod transform;

// Pub/sub notifier
pub mod notify;

// Configuration
pub mod config;

// Re-export commonly used types
pub use crate::core::{
    BatchDescriptor, Datapoint, DatapointArray, Error, Result, StreamPath,
};
pub use cache::HotCache;
pub use config::EngineConfig;
pub use engine::{Engine, Migrator};
pub use notify::{Notifier, StreamEvent, Subscription};
pub use range::{DataRange, RangeList};
pub use store::{ColdStore, ColdStoreConfig};
pub use transform::TransformRange;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
