//! Transports handed to the TLS client: a tap over a real socket while recording and a
//! connection fabricated from the log while replaying.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll, Waker},
};

use bytes::Bytes;
use retls_core::{connection_tag, Role};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{recorder::Journal, replayer::Tape, Error, WriteCheck};

/// Mirrors every byte crossing `inner` into the journal, unchanged.
#[derive(Debug)]
pub(crate) struct LogConn<S> {
    inner: S,
    journal: Arc<Journal>,
    read_tag: String,
    write_tag: String,
}

impl<S> LogConn<S> {
    pub fn new(inner: S, journal: Arc<Journal>, addr: &str) -> Self {
        Self {
            inner,
            journal,
            read_tag: connection_tag(addr, Role::Read),
            write_tag: connection_tag(addr, Role::Write),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LogConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        // An empty read into a non-empty buffer is end of stream and is logged as such.
        if wanted {
            this.journal.append(&this.read_tag, &buf.filled()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LogConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.journal.append(&this.write_tag, &buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A connection whose reads and writes are answered from the replay tape.
///
/// Writes and shutdown complete immediately. A read waits while a write recorded before it on
/// this connection has not been replayed yet, the way the peer waited for the request before
/// answering.
#[derive(Debug)]
pub(crate) struct ReplayConn {
    tape: Arc<Tape>,
    addr: String,
    read_tag: String,
    write_tag: String,
    write_check: WriteCheck,
    /// Unread tail of the last `read` record
    pending: Bytes,
    /// Reader waiting for an earlier write
    read_waker: Option<Waker>,
}

impl ReplayConn {
    pub fn new(tape: Arc<Tape>, addr: &str, write_check: WriteCheck) -> Self {
        Self {
            tape,
            addr: addr.to_owned(),
            read_tag: connection_tag(addr, Role::Read),
            write_tag: connection_tag(addr, Role::Write),
            write_check,
            pending: Bytes::new(),
            read_waker: None,
        }
    }

    /// Returns `true` if the next read must wait for a write recorded before it.
    fn read_blocked(&self, buf: &ReadBuf<'_>) -> bool {
        buf.remaining() > 0
            && self.pending.is_empty()
            && self.tape.is_behind(&self.read_tag, &self.write_tag)
    }

    fn read_into(&mut self, buf: &mut ReadBuf<'_>) -> Result<(), Error> {
        if buf.remaining() == 0 {
            return Ok(());
        }
        if self.pending.is_empty() {
            // An empty record replays end of stream.
            self.pending = self.tape.fetch(&self.read_tag)?;
        }
        let n = buf.remaining().min(self.pending.len());
        buf.put_slice(&self.pending.split_to(n));
        Ok(())
    }

    fn write_from(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let recorded = self.tape.fetch(&self.write_tag)?;
        if self.write_check == WriteCheck::Strict
            && (recorded.is_empty() || !buf.starts_with(&recorded))
        {
            return Err(Error::WriteMismatch {
                addr: self.addr.clone(),
            });
        }
        if recorded.is_empty() || recorded.len() > buf.len() {
            Ok(buf.len())
        } else {
            Ok(recorded.len())
        }
    }
}

impl AsyncRead for ReplayConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_blocked(buf) {
            tracing::trace!(addr = %this.addr, "read waits for an earlier write");
            this.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(this.read_into(buf).map_err(|err| this.tape.fail(err)))
    }
}

impl AsyncWrite for ReplayConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = this.write_from(buf).map_err(|err| this.tape.fail(err));
        if let Some(waker) = this.read_waker.take() {
            waker.wake();
        }
        Poll::Ready(written)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use retls_core::{Record, RecordLog};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const ADDR: &str = "example.com:443";

    fn tape(records: &[(Role, &[u8])]) -> Arc<Tape> {
        let log: RecordLog = records
            .iter()
            .map(|(role, payload)| Record::new(connection_tag(ADDR, *role), payload))
            .collect();
        Arc::new(Tape::new(log))
    }

    #[tokio::test]
    async fn log_conn_mirrors_traffic() {
        let journal = Arc::new(Journal::default());
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = LogConn::new(client, journal.clone(), ADDR);

        conn.write_all(b"hello").await.unwrap();
        server.write_all(b"world").await.unwrap();
        drop(server);

        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"world");

        let log = journal.snapshot();
        let records: Vec<_> = log
            .iter()
            .map(|r| (r.tag.as_str(), r.payload.clone()))
            .collect();
        assert_eq!(
            records,
            [
                ("example.com:443:write", Bytes::from_static(b"hello")),
                ("example.com:443:read", Bytes::from_static(b"world")),
                ("example.com:443:read", Bytes::new()),
            ]
        );
    }

    #[tokio::test]
    async fn replay_conn_serves_reads_across_small_buffers() {
        let tape = tape(&[(Role::Read, b"abcdef"), (Role::Read, b"gh"), (Role::Read, b"")]);
        let mut conn = ReplayConn::new(tape.clone(), ADDR, WriteCheck::Permissive);

        let mut small = [0u8; 4];
        assert_eq!(conn.read(&mut small).await.unwrap(), 4);
        assert_eq!(&small, b"abcd");
        assert_eq!(conn.read(&mut small).await.unwrap(), 2);
        assert_eq!(&small[..2], b"ef");

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"gh");
        assert!(tape.remaining().is_empty());
    }

    #[tokio::test]
    async fn replay_conn_exhaustion_is_noted() {
        let tape = tape(&[]);
        let mut conn = ReplayConn::new(tape.clone(), ADDR, WriteCheck::Permissive);

        assert!(conn.read(&mut [0u8; 8]).await.is_err());
        let err = tape.take_failure().unwrap();
        assert!(err.is_data_exhausted(), "{err}");
    }

    #[tokio::test]
    async fn reads_wait_for_earlier_writes() {
        let tape = tape(&[(Role::Write, b"request"), (Role::Read, b"response")]);
        let mut conn = ReplayConn::new(tape.clone(), ADDR, WriteCheck::Permissive);
        let mut buf = [0u8; 16];

        let mut task = tokio_test::task::spawn(());
        task.enter(|cx, _| {
            let mut read_buf = ReadBuf::new(&mut buf);
            assert!(Pin::new(&mut conn).poll_read(cx, &mut read_buf).is_pending());
        });
        assert!(!task.is_woken());
        assert_eq!(tape.remaining().len(), 2);

        assert_eq!(conn.write(b"request").await.unwrap(), 7);
        assert!(task.is_woken());
        assert_eq!(conn.read(&mut buf).await.unwrap(), 8);
        assert_eq!(&buf[..8], b"response");
    }

    #[tokio::test]
    async fn trailing_writes_do_not_hold_back_exhaustion() {
        let tape = tape(&[(Role::Write, b"close_notify")]);
        let mut conn = ReplayConn::new(tape.clone(), ADDR, WriteCheck::Permissive);

        assert!(conn.read(&mut [0u8; 8]).await.is_err());
        assert!(tape.take_failure().unwrap().is_data_exhausted());
    }

    #[tokio::test]
    async fn replay_conn_writes() {
        let tape = tape(&[(Role::Write, b"abc"), (Role::Write, b"zzz")]);
        let mut conn = ReplayConn::new(tape, ADDR, WriteCheck::Permissive);

        // Accepts what the socket accepted during recording.
        assert_eq!(conn.write(b"abcdef").await.unwrap(), 3);
        // Permissive writes are not compared.
        assert_eq!(conn.write(b"def").await.unwrap(), 3);
        assert!(conn.write(b"more").await.is_err());
    }

    #[tokio::test]
    async fn strict_writes_are_compared() {
        let tape = tape(&[(Role::Write, b"abc"), (Role::Write, b"xyz")]);
        let mut conn = ReplayConn::new(tape.clone(), ADDR, WriteCheck::Strict);

        assert_eq!(conn.write(b"abc").await.unwrap(), 3);
        assert!(conn.write(b"def").await.is_err());
        assert!(matches!(
            tape.take_failure(),
            Some(Error::WriteMismatch { addr }) if addr == ADDR
        ));
    }
}
