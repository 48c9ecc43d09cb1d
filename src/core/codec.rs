//! Binary wire codec for packed datapoints
//!
//! Each record is: fixed 8-byte little-endian timestamp, varint payload
//! length, payload bytes, varint sender length, sender bytes. Records are
//! self-delimiting, so a chunk is the plain concatenation of records and
//! chunks concatenate without an external index. Decoding is strictly
//! sequential within a chunk and restartable at any chunk boundary.
//!
//! Varints are unsigned LEB128. The fixed timestamp width is load-bearing:
//! the hot cache rewrites timestamps in place during restamped inserts.

use crate::core::{Datapoint, DatapointArray, Error, Result};

/// Byte offset of the payload-length varint within a record
pub const TIMESTAMP_WIDTH: usize = 8;

/// Append an unsigned LEB128 varint
pub fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint, advancing `pos`
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| Error::Corrupt("varint overruns buffer".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(Error::Corrupt("varint exceeds 64 bits".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Encode one datapoint as a self-delimiting record
pub fn encode_one(dp: &Datapoint) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TIMESTAMP_WIDTH + 2 + dp.data.len() + dp.sender.len());
    buf.extend_from_slice(&dp.timestamp.to_le_bytes());
    write_varint(&mut buf, dp.data.len() as u64);
    buf.extend_from_slice(&dp.data);
    write_varint(&mut buf, dp.sender.len() as u64);
    buf.extend_from_slice(dp.sender.as_bytes());
    buf
}

impl DatapointArray {
    /// Pack the array into its wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for dp in self.iter() {
            buf.extend_from_slice(&encode_one(dp));
        }
        buf
    }
}

/// Lazy sequential reader over a packed chunk
#[derive(Debug)]
pub struct DatapointReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DatapointReader<'a> {
    /// Start reading at a chunk boundary
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_one(&mut self) -> Result<Datapoint> {
        let ts_end = self.pos + TIMESTAMP_WIDTH;
        let ts_bytes = self
            .data
            .get(self.pos..ts_end)
            .ok_or_else(|| Error::Corrupt("timestamp overruns buffer".into()))?;
        let mut ts_fixed = [0u8; TIMESTAMP_WIDTH];
        ts_fixed.copy_from_slice(ts_bytes);
        let timestamp = i64::from_le_bytes(ts_fixed);
        self.pos = ts_end;

        let dlen = read_varint(self.data, &mut self.pos)? as usize;
        let data = self
            .data
            .get(self.pos..self.pos + dlen)
            .ok_or_else(|| Error::Corrupt("payload length overruns buffer".into()))?
            .to_vec();
        self.pos += dlen;

        let slen = read_varint(self.data, &mut self.pos)? as usize;
        let sender = self
            .data
            .get(self.pos..self.pos + slen)
            .ok_or_else(|| Error::Corrupt("sender length overruns buffer".into()))?;
        let sender = std::str::from_utf8(sender)
            .map_err(|_| Error::Corrupt("sender is not valid UTF-8".into()))?
            .to_string();
        self.pos += slen;

        Ok(Datapoint {
            timestamp,
            data,
            sender,
        })
    }
}

impl Iterator for DatapointReader<'_> {
    type Item = Result<Datapoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        // A decode error poisons the rest of the chunk
        match self.read_one() {
            Ok(dp) => Some(Ok(dp)),
            Err(e) => {
                self.pos = self.data.len();
                Some(Err(e))
            }
        }
    }
}

/// Decode a whole packed chunk
pub fn decode(data: &[u8]) -> Result<DatapointArray> {
    DatapointReader::new(data).collect()
}
