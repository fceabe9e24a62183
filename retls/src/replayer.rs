use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use futures::{stream, Stream, TryStreamExt};
use http::{Request, Response};
use retls_core::{
    codec::RecordCodec, connection_tag, payload, RecordLog, ReplayQueue, Role, Timestamp,
    HTTP_BODY, RANDOM, TIME,
};
use tokio::io::AsyncRead;
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedRead;

use crate::{
    client,
    hooks::{self, Dialed, FailureSlot},
    shim::ReplayConn,
    Config, Error, Hooks, WriteCheck,
};

/// The replay side of the log: the unconsumed records behind one lock.
#[derive(Debug)]
pub(crate) struct Tape {
    queue: Mutex<ReplayQueue>,
    failure: FailureSlot,
}

impl Tape {
    pub fn new(log: RecordLog) -> Self {
        Self {
            queue: Mutex::new(log.into_queue()),
            failure: FailureSlot::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplayQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fetch(&self, tag: &str) -> Result<Bytes, retls_core::Error> {
        self.lock().fetch(tag)
    }

    /// Returns `true` while a `blocker` record is still queued ahead of the next `tag` record.
    pub fn is_behind(&self, tag: &str, blocker: &str) -> bool {
        self.lock().is_behind(tag, blocker)
    }

    /// Note `err` and turn it into the opaque error handed back to the TLS stack.
    pub fn fail(&self, err: Error) -> io::Error {
        let opaque = io::Error::other(err.to_string());
        self.failure.set(err);
        opaque
    }

    pub fn take_failure(&self) -> Option<Error> {
        self.failure.take()
    }

    pub fn session_time(&self) -> Timestamp {
        self.lock().session_time()
    }

    pub fn remaining(&self) -> RecordLog {
        self.lock().remaining().cloned().collect()
    }
}

#[derive(Debug)]
pub(crate) struct ReplayHooks {
    tape: Arc<Tape>,
    write_check: WriteCheck,
    /// Every time handed to the TLS stack, in order
    clock_reads: Mutex<Vec<Timestamp>>,
}

impl ReplayHooks {
    /// A recorded socket address, or `None` when it is missing or unreadable.
    fn recorded_addr(&self, addr: &str, role: Role) -> Option<SocketAddr> {
        let tag = connection_tag(addr, role);
        let decoded = self
            .tape
            .fetch(&tag)
            .and_then(|raw| payload::decode_addr(&tag, &raw));
        match decoded {
            Ok(addr) => addr,
            Err(err) => {
                tracing::debug!(%err, "no usable {role} address");
                None
            }
        }
    }
}

impl Hooks for ReplayHooks {
    type Conn = ReplayConn;

    async fn dial_tls(&self, addr: &str) -> Result<Dialed<Self::Conn>, Error> {
        tracing::info!(addr, "replaying dial");
        let outcome = self.tape.fetch(&connection_tag(addr, Role::Conn))?;
        if !outcome.is_empty() {
            return Err(Error::RecordedDialFailure {
                addr: addr.to_owned(),
                reason: String::from_utf8_lossy(&outcome).into_owned(),
            });
        }
        let local = self.recorded_addr(addr, Role::Local);
        let remote = self.recorded_addr(addr, Role::Remote);

        Ok(Dialed {
            conn: ReplayConn::new(self.tape.clone(), addr, self.write_check),
            local,
            remote,
        })
    }

    fn current_time(&self) -> Result<Timestamp, Error> {
        match self.tape.fetch(TIME) {
            Ok(_) => {}
            // Keep answering with the last recorded time.
            Err(err) if err.is_data_exhausted() => {
                tracing::debug!("no time records left");
            }
            Err(err) => return Err(err.into()),
        }
        let now = self.tape.session_time();
        self.clock_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(now);
        Ok(now)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), Error> {
        let recorded = self.tape.fetch(RANDOM)?;
        if recorded.len() != buf.len() {
            return Err(Error::RandomLength {
                recorded: recorded.len(),
                requested: buf.len(),
            });
        }
        buf.copy_from_slice(&recorded);
        Ok(())
    }

    fn key_log(&self, _line: &str) {}

    fn body_chunk(&self, _chunk: &Bytes) {}

    fn note_failure(&self, err: Error) {
        self.tape.failure.set(err);
    }

    fn take_failure(&self) -> Option<Error> {
        self.tape.take_failure()
    }
}

/// Replays a recorded exchange without touching the network.
///
/// Requests must be issued in the order they were recorded. The same [`Config`] the recording
/// was made with should be used, since certificate checks run again against the recorded time.
///
/// Like a [`crate::Recorder`], each replayer leaks two small rustls adapters.
pub struct Replayer {
    hooks: Arc<ReplayHooks>,
    connector: TlsConnector,
    config: Config,
}

impl fmt::Debug for Replayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replayer")
            .field("remaining", &self.hooks.tape.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Replayer {
    pub fn new(config: Config, log: RecordLog) -> Result<Self, Error> {
        tracing::debug!(records = log.len(), "loading replay");
        let hooks = Arc::new(ReplayHooks {
            tape: Arc::new(Tape::new(log)),
            write_check: config.write_check,
            clock_reads: Mutex::default(),
        });
        let connector = hooks::tls_connector(&hooks, &config)?;
        Ok(Self {
            hooks,
            connector,
            config,
        })
    }

    /// Parse a log in its wire format.
    pub fn from_bytes(config: Config, bytes: impl Into<Bytes>) -> Result<Self, Error> {
        Self::new(config, RecordLog::from_bytes(bytes)?)
    }

    /// Read a log in its wire format to the end of `reader`.
    pub fn from_reader<R: io::Read>(config: Config, reader: R) -> Result<Self, Error> {
        Self::new(config, RecordLog::read_from(reader)?)
    }

    /// Read a log in its wire format to the end of an async `reader`.
    pub async fn load<R>(config: Config, reader: R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let log: RecordLog = FramedRead::new(reader, RecordCodec::new())
            .try_collect()
            .await?;
        Self::new(config, log)
    }

    /// Replay a `GET` request for `url`.
    pub async fn get(&self, url: &str) -> Result<Response<Bytes>, Error> {
        self.request(client::get_request(url)?).await
    }

    /// Replay `request` from the log.
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn request(&self, request: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        tracing::info!("replaying request");
        client::execute(self.hooks.as_ref(), &self.connector, &self.config, request).await
    }

    /// The recorded body chunks, consumed from the log in order.
    ///
    /// The stream ends when no body record remains.
    pub fn recorded_body(&self) -> impl Stream<Item = Result<Bytes, Error>> + Send + 'static {
        stream::unfold(Some(self.hooks.tape.clone()), |tape| async move {
            let tape = tape?;
            match tape.fetch(HTTP_BODY) {
                Ok(chunk) => Some((Ok(chunk), Some(tape))),
                Err(err) if err.is_data_exhausted() => None,
                Err(err) => Some((Err(err.into()), None)),
            }
        })
    }

    /// The time of the most recently replayed clock read.
    pub fn session_time(&self) -> Timestamp {
        self.hooks.tape.session_time()
    }

    /// The answers given to every clock read so far, in order.
    pub fn clock_reads(&self) -> Vec<Timestamp> {
        self.hooks
            .clock_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The records not consumed so far.
    pub fn remaining(&self) -> RecordLog {
        self.hooks.tape.remaining()
    }
}
