//! Stream identity and batch descriptors
//!
//! A stream is addressed by a `StreamPath`: a locality hash tag (used for
//! Redis cluster slotting, often empty), a stream name, and an optional
//! substream. The canonical text form `{hash}stream:substream` is part of
//! the external contract, as is the batch descriptor syntax
//! `{hash}stream:substream:startIndex:endIndex`.
//!
//! Stream names may contain `/` (used by pub/sub routing) but not `:`,
//! which delimits the substream and descriptor fields.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one logical append log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPath {
    /// Redis cluster locality tag, possibly empty
    pub hash: String,

    /// Stream name; independent namespace per name
    pub stream: String,

    /// Substream suffix, possibly empty
    pub substream: String,
}

impl StreamPath {
    /// Create a path with empty hash and substream
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            hash: String::new(),
            stream: stream.into(),
            substream: String::new(),
        }
    }

    /// Set the locality hash tag
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    /// Set the substream suffix
    pub fn with_substream(mut self, substream: impl Into<String>) -> Self {
        self.substream = substream.into();
        self
    }

    /// Redis key of the hot list: `{hash}stream:substream`
    pub fn list_key(&self) -> String {
        format!("{{{}}}{}:{}", self.hash, self.stream, self.substream)
    }

    /// Redis key of the metadata hash
    pub fn meta_key(&self) -> String {
        format!("meta:{}", self.list_key())
    }

    /// Key of the cold-store rows: `stream` or `stream:substream`. The hash
    /// tag is Redis routing only and does not reach SQL.
    pub fn store_key(&self) -> String {
        if self.substream.is_empty() {
            self.stream.clone()
        } else {
            format!("{}:{}", self.stream, self.substream)
        }
    }

    /// Key used for pub/sub routing: `stream` or `stream/substream`
    pub fn routing_key(&self) -> String {
        if self.substream.is_empty() {
            self.stream.clone()
        } else {
            format!("{}/{}", self.stream, self.substream)
        }
    }

    /// Descriptor for the batch covering `[start, end)`
    pub fn descriptor(&self, start: i64, end: i64) -> BatchDescriptor {
        BatchDescriptor {
            path: self.clone(),
            start,
            end,
        }
    }
}

impl fmt::Display for StreamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.list_key())
    }
}

/// A batch of datapoints staged for migration, identified by its stream
/// path and absolute index window `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    /// Stream the batch belongs to
    pub path: StreamPath,

    /// Absolute index of the first datapoint
    pub start: i64,

    /// Absolute index one past the last datapoint
    pub end: i64,
}

impl BatchDescriptor {
    /// Parse the external descriptor syntax
    /// `{hash}stream:substream:startIndex:endIndex`
    pub fn parse(s: &str) -> Result<Self> {
        let corrupt = || Error::Backend(format!("malformed batch descriptor: {s}"));

        let rest = s.strip_prefix('{').ok_or_else(corrupt)?;
        let (hash, rest) = rest.split_once('}').ok_or_else(corrupt)?;

        // The two numeric fields come off the right; the substream is the
        // last ':' field before them. Stream names never contain ':'.
        let (rest, end) = rest.rsplit_once(':').ok_or_else(corrupt)?;
        let (rest, start) = rest.rsplit_once(':').ok_or_else(corrupt)?;
        let (stream, substream) = rest.rsplit_once(':').ok_or_else(corrupt)?;

        let start: i64 = start.parse().map_err(|_| corrupt())?;
        let end: i64 = end.parse().map_err(|_| corrupt())?;
        if start < 0 || end < start {
            return Err(corrupt());
        }

        Ok(Self {
            path: StreamPath {
                hash: hash.to_string(),
                stream: stream.to_string(),
                substream: substream.to_string(),
            },
            start,
            end,
        })
    }

    /// Number of datapoints in the batch
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

impl fmt::Display for BatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path.list_key(), self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_key_forms() {
        let p = StreamPath::new("mystream");
        assert_eq!(p.list_key(), "{}mystream:");
        assert_eq!(p.meta_key(), "meta:{}mystream:");
        assert_eq!(p.store_key(), "mystream");

        let p = StreamPath::new("mystream").with_hash("h1").with_substream("s1");
        assert_eq!(p.list_key(), "{h1}mystream:s1");
        assert_eq!(p.store_key(), "mystream:s1");
    }

    #[test]
    fn test_descriptor_round_trip() {
        let p = StreamPath::new("mystream");
        let d = p.descriptor(0, 2);
        assert_eq!(d.to_string(), "{}mystream::0:2");

        let parsed = BatchDescriptor::parse("{}mystream::0:2").unwrap();
        assert_eq!(parsed, d);
        assert_eq!(parsed.len(), 2);

        let parsed = BatchDescriptor::parse("{h1}a/b:s1:10:14").unwrap();
        assert_eq!(parsed.path.hash, "h1");
        assert_eq!(parsed.path.stream, "a/b");
        assert_eq!(parsed.path.substream, "s1");
        assert_eq!(parsed.start, 10);
        assert_eq!(parsed.end, 14);
    }

    #[test]
    fn test_descriptor_rejects_garbage() {
        assert!(BatchDescriptor::parse("mystream:0:2").is_err());
        assert!(BatchDescriptor::parse("{}mystream:").is_err());
        assert!(BatchDescriptor::parse("{}mystream::2:x").is_err());
        assert!(BatchDescriptor::parse("{}mystream::4:2").is_err());
    }
}
