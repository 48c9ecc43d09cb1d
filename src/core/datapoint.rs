//! Datapoint and datapoint array types
//!
//! A datapoint is an immutable (timestamp, payload, sender) triple. The
//! payload is an opaque byte sequence; schema interpretation is the
//! collaborator's concern. Timestamps are microseconds as a signed 64-bit
//! integer and must be non-decreasing within a stream.

use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// A single timestamped value in a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Timestamp in microseconds
    pub timestamp: i64,

    /// Opaque payload bytes
    pub data: Vec<u8>,

    /// Short sender tag, possibly empty
    pub sender: String,
}

impl Datapoint {
    /// Create a datapoint with an empty sender tag
    pub fn new(timestamp: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            data: data.into(),
            sender: String::new(),
        }
    }

    /// Set the sender tag
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }
}

/// An ordered sequence of datapoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapointArray(pub Vec<Datapoint>);

impl DatapointArray {
    /// Create an empty array
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build an array from parallel timestamp and payload slices, all with
    /// the same sender tag
    pub fn from_parts(timestamps: &[i64], payloads: &[&[u8]], sender: &str) -> Self {
        debug_assert_eq!(timestamps.len(), payloads.len());
        Self(
            timestamps
                .iter()
                .zip(payloads.iter())
                .map(|(&t, &d)| Datapoint::new(t, d).with_sender(sender))
                .collect(),
        )
    }

    /// Whether the timestamps are non-decreasing
    pub fn is_ordered(&self) -> bool {
        self.0.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
    }

    /// Timestamp of the first datapoint, if any
    pub fn start_timestamp(&self) -> Option<i64> {
        self.0.first().map(|d| d.timestamp)
    }

    /// Timestamp of the last datapoint, if any
    pub fn end_timestamp(&self) -> Option<i64> {
        self.0.last().map(|d| d.timestamp)
    }
}

impl Deref for DatapointArray {
    type Target = Vec<Datapoint>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DatapointArray {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Datapoint>> for DatapointArray {
    fn from(v: Vec<Datapoint>) -> Self {
        Self(v)
    }
}

impl IntoIterator for DatapointArray {
    type Item = Datapoint;
    type IntoIter = std::vec::IntoIter<Datapoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Datapoint> for DatapointArray {
    fn from_iter<T: IntoIterator<Item = Datapoint>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
