use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use futures::StreamExt;
use http::{Request, Response};
use retls_core::{
    codec::RecordCodec, connection_tag, payload, Record, RecordLog, Role, Timestamp, HTTP_BODY,
    KEYLOG, RANDOM, TIME,
};
use rustls::crypto::SecureRandom;
use tokio::{io::AsyncWrite, net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::FramedWrite;

use crate::{
    client,
    hooks::{self, Dialed, FailureSlot},
    shim::LogConn,
    Config, Error, Hooks, Replayer,
};

#[derive(Debug, Default)]
struct JournalState {
    log: RecordLog,
    now: Timestamp,
    /// Forwards every appended record to the streaming writer, when there is one.
    sink: Option<mpsc::UnboundedSender<Record>>,
}

/// The recording side of the log. All appends go through one lock; the order in which they
/// take it is the order of the log.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    state: Mutex<JournalState>,
    failure: FailureSlot,
}

impl Journal {
    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, tag: &str, payload: &[u8]) {
        Self::append_locked(&mut self.lock(), tag, payload);
    }

    fn append_locked(state: &mut JournalState, tag: &str, payload: &[u8]) {
        let record = state.log.append(tag, payload).clone();
        let closed = state
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(record).is_err());
        if closed {
            tracing::warn!("record sink closed, continuing in memory only");
            state.sink = None;
        }
    }

    /// Record a clock read.
    fn stamp(&self, now: Timestamp) {
        let mut state = self.lock();
        state.now = now;
        Self::append_locked(&mut state, TIME, &payload::encode_time(now));
    }

    pub fn snapshot(&self) -> RecordLog {
        self.lock().log.clone()
    }

    fn session_time(&self) -> Timestamp {
        self.lock().now
    }

    fn detach_sink(&self) -> Option<mpsc::UnboundedSender<Record>> {
        self.lock().sink.take()
    }
}

#[derive(Debug)]
pub(crate) struct RecorderHooks {
    journal: Arc<Journal>,
    /// The real entropy source
    entropy: &'static dyn SecureRandom,
}

impl Hooks for RecorderHooks {
    type Conn = LogConn<TcpStream>;

    async fn dial_tls(&self, addr: &str) -> Result<Dialed<Self::Conn>, Error> {
        tracing::info!(addr, "dialing");
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(err) => {
                self.journal
                    .append(&connection_tag(addr, Role::Conn), err.to_string().as_bytes());
                return Err(Error::DialFailed {
                    addr: addr.to_owned(),
                    source: err,
                });
            }
        };
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        tracing::debug!(?local, ?remote, "connected");

        self.journal.append(&connection_tag(addr, Role::Conn), &[]);
        self.journal
            .append(&connection_tag(addr, Role::Local), &payload::encode_addr(local));
        self.journal
            .append(&connection_tag(addr, Role::Remote), &payload::encode_addr(remote));

        Ok(Dialed {
            conn: LogConn::new(stream, self.journal.clone(), addr),
            local,
            remote,
        })
    }

    fn current_time(&self) -> Result<Timestamp, Error> {
        let now = Timestamp::now();
        self.journal.stamp(now);
        Ok(now)
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<(), Error> {
        self.entropy
            .fill(buf)
            .map_err(|_| rustls::Error::FailedToGetRandomBytes)?;
        self.journal.append(RANDOM, buf);
        Ok(())
    }

    fn key_log(&self, line: &str) {
        self.journal.append(KEYLOG, line.as_bytes());
    }

    fn body_chunk(&self, chunk: &Bytes) {
        self.journal.append(HTTP_BODY, chunk);
    }

    fn note_failure(&self, err: Error) {
        self.journal.failure.set(err);
    }

    fn take_failure(&self) -> Option<Error> {
        self.journal.failure.take()
    }
}

/// Performs real HTTPS requests and records everything non-deterministic about them.
///
/// Each recorder leaks two small rustls adapters, since rustls only accepts `'static` entropy
/// and key-exchange providers. Create one per recording, not one per request.
///
/// ```no_run
/// # async fn run() -> Result<(), retls::Error> {
/// let recorder = retls::Recorder::new(retls::Config::default())?;
/// let response = recorder.get("https://example.com/").await?;
/// std::fs::write("example.retls", recorder.save())?;
///
/// let replayer = retls::Replayer::from_bytes(
///     retls::Config::default(),
///     std::fs::read("example.retls")?,
/// )?;
/// let replayed = replayer.get("https://example.com/").await?;
/// assert_eq!(replayed.body(), response.body());
/// # Ok(())
/// # }
/// ```
pub struct Recorder {
    hooks: Arc<RecorderHooks>,
    connector: TlsConnector,
    config: Config,
    sink_task: Mutex<Option<JoinHandle<Result<(), retls_core::Error>>>>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("records", &self.hooks.journal.lock().log.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Create a recorder that keeps its log in memory.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::build(config, None)
    }

    /// Create a recorder that also streams every record to `writer` as it is appended.
    ///
    /// Must be called from within a tokio runtime. Use [`Recorder::close_sink`] to flush the
    /// writer and observe write errors.
    pub fn with_sink<W>(config: Config, writer: W) -> Result<Self, Error>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(
            UnboundedReceiverStream::new(receiver)
                .map(Ok)
                .forward(FramedWrite::new(writer, RecordCodec::new())),
        );
        Self::build(config, Some((sender, task)))
    }

    fn build(
        config: Config,
        sink: Option<(
            mpsc::UnboundedSender<Record>,
            JoinHandle<Result<(), retls_core::Error>>,
        )>,
    ) -> Result<Self, Error> {
        let (sender, task) = sink.unzip();
        let journal = Arc::new(Journal {
            state: Mutex::new(JournalState {
                sink: sender,
                ..Default::default()
            }),
            failure: FailureSlot::default(),
        });
        journal.stamp(Timestamp::now());

        let hooks = Arc::new(RecorderHooks {
            journal,
            entropy: rustls::crypto::ring::default_provider().secure_random,
        });
        let connector = hooks::tls_connector(&hooks, &config)?;

        Ok(Self {
            hooks,
            connector,
            config,
            sink_task: Mutex::new(task),
        })
    }

    /// Fetch `url` with a `GET` request.
    pub async fn get(&self, url: &str) -> Result<Response<Bytes>, Error> {
        self.request(client::get_request(url)?).await
    }

    /// Send `request` over a real connection, recording the exchange.
    #[tracing::instrument(skip_all, fields(uri = %request.uri()))]
    pub async fn request(&self, request: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        tracing::info!("recording request");
        client::execute(self.hooks.as_ref(), &self.connector, &self.config, request).await
    }

    /// The log in its wire format.
    pub fn save(&self) -> Bytes {
        self.log().to_bytes()
    }

    /// Write the log in its wire format to `writer`.
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<u64> {
        self.log().write_to(writer)
    }

    #[cfg(feature = "json")]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        self.log().to_json()
    }

    /// A copy of the records appended so far.
    pub fn log(&self) -> RecordLog {
        self.hooks.journal.snapshot()
    }

    /// The time of the most recent clock read.
    pub fn session_time(&self) -> Timestamp {
        self.hooks.journal.session_time()
    }

    /// A replayer over a copy of the records appended so far, using the same configuration.
    pub fn replayer(&self) -> Result<Replayer, Error> {
        Replayer::new(self.config.clone(), self.log())
    }

    /// Stop streaming records and wait for the sink writer to flush.
    ///
    /// Records appended afterwards stay in memory only. Calling this without a sink, or a
    /// second time, does nothing.
    pub async fn close_sink(&self) -> Result<(), Error> {
        drop(self.hooks.journal.detach_sink());
        let task = self
            .sink_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.await.map_err(std::io::Error::from)??;
        }
        Ok(())
    }
}
