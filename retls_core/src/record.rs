use std::fmt::Display;

use bytes::Bytes;

/// Wall-clock reads. The payload is an encoded [`crate::Timestamp`].
pub const TIME: &str = "time";
/// Random draws made by the TLS library.
pub const RANDOM: &str = "rnd:read";
/// NSS key-log lines. Kept for external decryption tools, never needed to replay.
pub const KEYLOG: &str = "tls:keylog";
/// Chunks of the decoded HTTP response body.
pub const HTTP_BODY: &str = "http:body";

/// The role of a connection-scoped record, the suffix of `<addr>:<role>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dial outcome: empty on success, the error text on failure.
    Conn,
    /// Local socket address.
    Local,
    /// Remote socket address.
    Remote,
    /// Bytes returned by one read of the raw transport.
    Read,
    /// Bytes accepted by one write to the raw transport.
    Write,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Conn => "conn",
            Role::Local => "local",
            Role::Remote => "remote",
            Role::Read => "read",
            Role::Write => "write",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the tag of a connection-scoped record, e.g. `example.com:443:read`.
pub fn connection_tag(addr: &str, role: Role) -> String {
    format!("{addr}:{role}")
}

/// One `(tag, payload)` entry of a [`crate::RecordLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub tag: String,
    pub payload: Bytes,
}

impl Record {
    /// Create a record, copying `payload` so the caller may reuse its buffer.
    pub fn new(tag: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            tag: tag.into(),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Returns `true` for the records the replay queue drains from its head unconditionally.
    pub fn is_side_channel(&self) -> bool {
        self.tag == TIME || self.tag == KEYLOG
    }
}

#[cfg(feature = "json")]
impl serde::Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        use serde::ser::SerializeTuple;

        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.tag)?;
        tuple.serialize_element(&base64::engine::general_purpose::STANDARD.encode(&self.payload))?;
        tuple.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags() {
        assert_eq!(
            connection_tag("example.com:443", Role::Read),
            "example.com:443:read"
        );
        assert_eq!(
            connection_tag("[::1]:8443", Role::Remote),
            "[::1]:8443:remote"
        );
        assert!(Record::new(TIME, b"").is_side_channel());
        assert!(Record::new(KEYLOG, b"").is_side_channel());
        assert!(!Record::new(RANDOM, b"").is_side_channel());
    }

    #[test]
    fn payload_is_copied() {
        let mut buf = vec![1u8, 2, 3];
        let record = Record::new(RANDOM, &buf);
        buf[0] = 9;
        assert_eq!(&record.payload[..], &[1, 2, 3]);
    }
}
