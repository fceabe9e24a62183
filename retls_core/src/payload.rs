//! Encodings of the structured payloads: `time` records and the socket addresses of
//! `<addr>:local` / `<addr>:remote` records.
//!
//! Both layouts are fixed-width binary forms so logs stay readable by other tooling that
//! speaks the same format.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Timestamp, TIME};

/// Seconds between 0001-01-01T00:00:00Z and the UNIX epoch.
const UNIX_TO_INTERNAL: i64 = 62_135_596_800;

const TIME_V1: u8 = 1;
const TIME_V2: u8 = 2;
const TIME_V1_LEN: usize = 15;
const TIME_V2_LEN: usize = 16;
/// Zone offset marking a UTC time.
const OFFSET_UTC: i16 = -1;

fn malformed(tag: &str, reason: impl Into<String>) -> Error {
    Error::MalformedPayload {
        tag: tag.to_owned(),
        reason: reason.into(),
    }
}

/// Encode a UTC timestamp.
///
/// Layout: version byte `1`, seconds since year 1 (i64 BE), nanoseconds (i32 BE), zone
/// offset in minutes (i16 BE, `-1` for UTC).
pub fn encode_time(ts: Timestamp) -> Bytes {
    let since_epoch = ts.since_epoch();
    let mut buf = BytesMut::with_capacity(TIME_V1_LEN);
    buf.put_u8(TIME_V1);
    buf.put_i64(since_epoch.as_secs() as i64 + UNIX_TO_INTERNAL);
    buf.put_i32(since_epoch.subsec_nanos() as i32);
    buf.put_i16(OFFSET_UTC);
    buf.freeze()
}

/// Decode a `time` payload. The zone offset only affects presentation and is ignored.
pub fn decode_time(payload: &[u8]) -> Result<Timestamp, Error> {
    let mut buf = payload;
    let expected = match buf.first() {
        None => return Err(malformed(TIME, "empty payload")),
        Some(&TIME_V1) => TIME_V1_LEN,
        Some(&TIME_V2) => TIME_V2_LEN,
        Some(version) => return Err(malformed(TIME, format!("unknown version {version}"))),
    };
    if buf.len() != expected {
        return Err(malformed(
            TIME,
            format!("expected {expected} bytes, found {}", buf.len()),
        ));
    }
    buf.advance(1);
    let secs = buf.get_i64() - UNIX_TO_INTERNAL;
    let nanos = buf.get_i32();
    if secs < 0 {
        return Err(malformed(TIME, "time before the UNIX epoch"));
    }
    if !(0..1_000_000_000).contains(&nanos) {
        return Err(malformed(TIME, format!("nanoseconds out of range: {nanos}")));
    }
    Ok(Timestamp::from(std::time::Duration::new(
        secs as u64,
        nanos as u32,
    )))
}

/// Encode a socket address as its IP octets followed by the port (u16 LE). `None` encodes
/// as a bare zero port.
pub fn encode_addr(addr: Option<SocketAddr>) -> Bytes {
    let mut buf = BytesMut::with_capacity(18);
    match addr {
        Some(SocketAddr::V4(v4)) => buf.put_slice(&v4.ip().octets()),
        Some(SocketAddr::V6(v6)) => buf.put_slice(&v6.ip().octets()),
        None => {}
    }
    buf.put_u16_le(addr.map(|a| a.port()).unwrap_or(0));
    buf.freeze()
}

/// Decode a socket address payload. An address with no IP decodes as `None`; a trailing
/// IPv6 zone name is dropped.
pub fn decode_addr(tag: &str, payload: &[u8]) -> Result<Option<SocketAddr>, Error> {
    if payload.len() < 2 {
        return Err(malformed(tag, "missing port"));
    }
    let (ip, mut port) = payload.split_at(payload.len() - 2);
    let port = port.get_u16_le();
    let ip = match ip.len() {
        0 => return Ok(None),
        4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
        n if n >= 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&ip[..16]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        n => return Err(malformed(tag, format!("{n} byte address"))),
    };
    Ok(Some(SocketAddr::new(ip, port)))
}
