//! `tokio-util` codec for the record wire format.
//!
//! Each record is framed as `uvarint(tag.len()) tag uvarint(payload.len()) payload`. The
//! stream has no header, trailer or checksum; end of input ends the log.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Record};

/// Longest encoding of a `u64` as a uvarint.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` as an unsigned LEB128 varint.
pub fn put_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8(value as u8 | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read an unsigned varint from the start of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` if `buf` ends inside
/// the varint.
pub fn get_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>, Error> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(Error::MalformedLog("varint overflows a u64".into()));
        }
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(Error::MalformedLog("varint overflows a u64".into()));
            }
            return Ok(Some((value | (u64::from(byte) << (7 * i)), i + 1)));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
    }
    Ok(None)
}

/// Encode one record into `buf`.
pub fn encode_record(record: &Record, buf: &mut BytesMut) {
    buf.reserve(2 * MAX_VARINT_LEN + record.tag.len() + record.payload.len());
    put_uvarint(buf, record.tag.len() as u64);
    buf.put_slice(record.tag.as_bytes());
    put_uvarint(buf, record.payload.len() as u64);
    buf.put_slice(&record.payload);
}

/// Codec for use with `FramedRead`/`FramedWrite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut reader = Reader::new(&buf[..]);
        let Some(tag) = reader.field()? else {
            return Ok(None);
        };
        let Some(payload) = reader.field()? else {
            return Ok(None);
        };
        let amount = reader.amount();

        let frame = buf.split_to(amount).freeze();
        let tag = std::str::from_utf8(&frame[tag])
            .map_err(|err| Error::MalformedLog(format!("tag is not UTF-8: {err}")))?
            .to_owned();
        Ok(Some(Record {
            tag,
            payload: frame.slice(payload),
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::MalformedLog(format!(
                "truncated record: {} trailing bytes",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, item: Record, buf: &mut BytesMut) -> Result<(), Self::Error> {
        encode_record(&item, buf);
        Ok(())
    }
}

impl Encoder<&Record> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, item: &Record, buf: &mut BytesMut) -> Result<(), Self::Error> {
        encode_record(item, buf);
        Ok(())
    }
}

/// Decode every record of a complete in-memory log.
pub fn decode_all(bytes: impl Into<Bytes>) -> Result<Vec<Record>, Error> {
    let mut buf = BytesMut::from(&bytes.into()[..]);
    let mut codec = RecordCodec;
    let mut records = Vec::new();
    while let Some(record) = codec.decode_eof(&mut buf)? {
        records.push(record);
    }
    Ok(records)
}

/// Cursor over a partially received frame.
#[derive(Debug)]
struct Reader<'buf> {
    buf: &'buf [u8],
    amount: usize,
}

impl<'buf> Reader<'buf> {
    fn new(buf: &'buf [u8]) -> Self {
        Reader { buf, amount: 0 }
    }

    fn amount(&self) -> usize {
        self.amount
    }

    /// Read one length-prefixed field, returning its range within the frame.
    fn field(&mut self) -> Result<Option<Range<usize>>, Error> {
        let Some((len, varint_len)) = get_uvarint(&self.buf[self.amount..])? else {
            return Ok(None);
        };
        let start = self.amount + varint_len;
        let len = usize::try_from(len)
            .map_err(|_| Error::MalformedLog(format!("field length {len} too large")))?;
        let end = match start.checked_add(len) {
            Some(end) if end <= self.buf.len() => end,
            Some(_) => return Ok(None),
            None => return Err(Error::MalformedLog(format!("field length {len} too large"))),
        };
        self.amount = end;
        Ok(Some(start..end))
    }
}
