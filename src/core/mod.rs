//! # Core types for the timebatch engine
//!
//! This module provides the foundation shared by every component:
//! - The crate-wide error taxonomy and `Result` alias
//! - `Datapoint` and `DatapointArray`, the immutable units of storage
//! - `StreamPath`, the (hash, stream, substream) identity of a logical log
//! - The binary wire codec used by both the hot cache and the cold store

use thiserror::Error;

/// Engine error types
#[derive(Error, Debug)]
pub enum Error {
    /// Incoming timestamp precedes the stream's last timestamp and restamping
    /// was not requested
    #[error("timestamp precedes the stream's last timestamp")]
    Ordering,

    /// The datapoint array passed to insert is not ordered by timestamp
    #[error("datapoint array is not ordered by timestamp")]
    UnorderedBatch,

    /// Bad range arguments (e.g. start index past end index)
    #[error("invalid range arguments: {0}")]
    User(String),

    /// The stream key has no data where data was required
    #[error("stream not found: {0}")]
    NotFound(String),

    /// Payload failed collaborator validation; propagated unchanged
    #[error("datapoints did not match the stream schema: {0}")]
    Schema(String),

    /// The transform parser rejected the source
    #[error("transform parse error at '{token}': {message}")]
    TransformParse {
        /// The offending token
        token: String,
        /// What the parser expected
        message: String,
    },

    /// A transform failed while evaluating one datapoint; non-fatal for
    /// iteration
    #[error("transform evaluation error: {0}")]
    TransformEval(String),

    /// A length prefix overran the buffer while decoding packed datapoints
    #[error("corrupt datapoint encoding: {0}")]
    Corrupt(String),

    /// Redis error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// SQL error
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    /// A cold-store append whose start index does not line up with the
    /// stored length
    #[error("append at index {got} does not match stored length {expected}")]
    AppendMismatch {
        /// Current stored length of the stream
        expected: i64,
        /// Start index the caller tried to append at
        got: i64,
    },

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),

    /// The operation deadline expired or the caller cancelled
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

pub mod codec;
pub mod datapoint;
pub mod path;

pub use codec::{decode, DatapointReader};
pub use datapoint::{Datapoint, DatapointArray};
pub use path::{BatchDescriptor, StreamPath};
