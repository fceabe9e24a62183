//! The append-only record log produced while recording.

use std::io::Write;

use bytes::{Bytes, BytesMut};

use crate::{codec, Error, Record, ReplayQueue};

/// An ordered sequence of [`Record`]s.
///
/// Append order is the authoritative order of the log; nothing here reorders or removes
/// records. Replay consumes a [`ReplayQueue`] built from it instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordLog {
    records: Vec<Record>,
}

impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, copying `payload`.
    pub fn append(&mut self, tag: impl Into<String>, payload: &[u8]) -> &Record {
        let record = Record::new(tag, payload);
        tracing::trace!(tag = %record.tag, len = record.payload.len(), "append");
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    /// Parse a complete log in the wire format.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, Error> {
        codec::decode_all(bytes).map(|records| Self { records })
    }

    /// Read and parse a complete log from `reader`.
    pub fn read_from<R: std::io::Read>(mut reader: R) -> Result<Self, Error> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Self::from_bytes(buf)
    }

    /// Serialize the whole log in the wire format.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for record in &self.records {
            codec::encode_record(record, &mut buf);
        }
        buf.freeze()
    }

    /// Write the log in the wire format, returning the number of bytes written.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<u64> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Render the log as a pretty-printed JSON array of `[tag, base64(payload)]` pairs.
    ///
    /// This form is meant for reading; there is no parser for it.
    #[cfg(feature = "json")]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.records)
    }

    /// Build the consuming view used to replay this log.
    pub fn into_queue(self) -> ReplayQueue {
        ReplayQueue::new(self.records)
    }
}

impl FromIterator<Record> for RecordLog {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl Extend<Record> for RecordLog {
    fn extend<T: IntoIterator<Item = Record>>(&mut self, iter: T) {
        self.records.extend(iter);
    }
}

impl IntoIterator for RecordLog {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordLog {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection_tag, Role, HTTP_BODY, KEYLOG, RANDOM, TIME};

    fn sample() -> RecordLog {
        let mut log = RecordLog::new();
        log.append(TIME, &[1; 15]);
        log.append(connection_tag("example.com:443", Role::Conn), b"");
        log.append(RANDOM, &[0x00, 0xff, 0x00]);
        log.append(KEYLOG, b"CLIENT_RANDOM 00 11\n");
        log.append(HTTP_BODY, b"{}");
        log
    }

    #[test]
    fn wire_round_trip() {
        let log = sample();
        let bytes = log.to_bytes();

        let mut written = Vec::new();
        assert_eq!(log.write_to(&mut written).unwrap(), bytes.len() as u64);
        assert_eq!(&written[..], &bytes[..]);

        assert_eq!(RecordLog::from_bytes(bytes.clone()).unwrap(), log);
        assert_eq!(RecordLog::read_from(&bytes[..]).unwrap(), log);
    }

    #[test]
    fn empty_log() {
        let log = RecordLog::new();
        assert!(log.to_bytes().is_empty());
        assert_eq!(RecordLog::from_bytes(Bytes::new()).unwrap(), log);
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_debug_form() {
        let mut log = RecordLog::new();
        log.append(RANDOM, &[0x00, 0xff, 0x00]);
        log.append(HTTP_BODY, b"");

        let json: serde_json::Value = serde_json::from_str(&log.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([["rnd:read", "AP8A"], ["http:body", ""]])
        );
    }
}
