//! The capability interface between the TLS stack and a recording or a replay, and the
//! rustls adapters that route the stack's clock, entropy and key-log through it.

use std::{
    fmt::Debug,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use bytes::Bytes;
use rustls::{
    client::Resumption,
    crypto::{
        ActiveKeyExchange, CryptoProvider, GetRandomFailed, SecureRandom, SharedSecret,
        SupportedKxGroup,
    },
    pki_types::UnixTime,
    time_provider::TimeProvider,
    ClientConfig, KeyLog, NamedGroup, PeerMisbehaved,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use x25519_dalek::X25519_BASEPOINT_BYTES;

use crate::{Config, Error, Timestamp};

/// A freshly dialed transport and the socket addresses it reports.
#[derive(Debug)]
pub struct Dialed<C> {
    pub conn: C,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

/// Everything non-deterministic the TLS session consumes.
///
/// Each method is one hook called by the network stack. The recording side performs the real
/// operation and logs it, the replay side answers from the log.
pub trait Hooks: Debug + Send + Sync + 'static {
    /// The raw transport handed to the TLS client.
    type Conn: AsyncRead + AsyncWrite + Debug + Send + Unpin + 'static;

    /// Open a transport to `addr` (`host:port`).
    fn dial_tls(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<Dialed<Self::Conn>, Error>> + Send;

    fn current_time(&self) -> Result<Timestamp, Error>;

    /// Fill `buf` with random bytes.
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), Error>;

    /// One NSS key-log line, newline included.
    fn key_log(&self, line: &str);

    /// One chunk of the decoded response body.
    fn body_chunk(&self, chunk: &Bytes);

    /// Remember a failure raised inside the TLS stack, where only an opaque error survives.
    fn note_failure(&self, err: Error);

    /// The first failure noted since the last call.
    fn take_failure(&self) -> Option<Error>;
}

/// Holds the first failure noted by a hook.
#[derive(Debug, Default)]
pub(crate) struct FailureSlot(Mutex<Option<Error>>);

impl FailureSlot {
    pub fn set(&self, err: Error) {
        tracing::debug!(%err, "hook failed");
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take(&self) -> Option<Error> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Entropy source drawing from [`Hooks::fill_random`].
#[derive(Debug)]
pub(crate) struct HookedRandom<H> {
    hooks: Weak<H>,
}

impl<H: Hooks> SecureRandom for HookedRandom<H> {
    fn fill(&self, buf: &mut [u8]) -> Result<(), GetRandomFailed> {
        // Single-byte draws are left alone and never logged.
        if buf.len() == 1 {
            return Ok(());
        }
        let hooks = self.hooks.upgrade().ok_or(GetRandomFailed)?;
        hooks.fill_random(buf).map_err(|err| {
            hooks.note_failure(err);
            GetRandomFailed
        })
    }
}

/// X25519 key exchange whose private key comes from [`HookedRandom`].
///
/// The stock groups draw their ephemeral keys from the platform RNG directly, which would
/// make the key share impossible to reproduce.
#[derive(Debug)]
pub(crate) struct HookedX25519<H: 'static> {
    random: &'static HookedRandom<H>,
}

impl<H: Hooks> SupportedKxGroup for HookedX25519<H> {
    fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, rustls::Error> {
        let mut secret = [0u8; 32];
        self.random.fill(&mut secret)?;
        let public = x25519_dalek::x25519(secret, X25519_BASEPOINT_BYTES);
        Ok(Box::new(X25519Exchange { secret, public }))
    }

    fn name(&self) -> NamedGroup {
        NamedGroup::X25519
    }
}

struct X25519Exchange {
    secret: [u8; 32],
    public: [u8; 32],
}

impl ActiveKeyExchange for X25519Exchange {
    fn complete(self: Box<Self>, peer_pub_key: &[u8]) -> Result<SharedSecret, rustls::Error> {
        let peer: [u8; 32] = peer_pub_key
            .try_into()
            .map_err(|_| rustls::Error::from(PeerMisbehaved::InvalidKeyShare))?;
        let shared = x25519_dalek::x25519(self.secret, peer);
        if shared == [0u8; 32] {
            return Err(PeerMisbehaved::InvalidKeyShare.into());
        }
        Ok(SharedSecret::from(&shared[..]))
    }

    fn pub_key(&self) -> &[u8] {
        &self.public
    }

    fn group(&self) -> NamedGroup {
        NamedGroup::X25519
    }
}

#[derive(Debug)]
pub(crate) struct HookedClock<H> {
    hooks: Weak<H>,
}

impl<H: Hooks> TimeProvider for HookedClock<H> {
    fn current_time(&self) -> Option<UnixTime> {
        let hooks = self.hooks.upgrade()?;
        match hooks.current_time() {
            Ok(now) => Some(UnixTime::since_unix_epoch(now.since_epoch())),
            Err(err) => {
                hooks.note_failure(err);
                None
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct HookedKeyLog<H> {
    hooks: Weak<H>,
}

impl<H: Hooks> KeyLog for HookedKeyLog<H> {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.key_log(&format!(
                "{label} {} {}\n",
                hex::encode(client_random),
                hex::encode(secret)
            ));
        }
    }
}

/// Build the TLS connector whose clock, entropy and key-log are routed through `hooks`.
///
/// rustls holds entropy and key-exchange providers by `'static` reference, so the two adapters
/// are leaked once per call. They hold `hooks` weakly: the leak is two small structs per
/// connector and never keeps a log alive. Callers build one connector per recorder or replayer.
pub(crate) fn tls_connector<H: Hooks>(
    hooks: &Arc<H>,
    config: &Config,
) -> Result<TlsConnector, Error> {
    let random: &'static HookedRandom<H> = Box::leak(Box::new(HookedRandom {
        hooks: Arc::downgrade(hooks),
    }));
    let x25519: &'static HookedX25519<H> = Box::leak(Box::new(HookedX25519 { random }));

    let provider = CryptoProvider {
        kx_groups: vec![x25519 as &'static dyn SupportedKxGroup],
        secure_random: random,
        ..rustls::crypto::ring::default_provider()
    };
    let clock = HookedClock {
        hooks: Arc::downgrade(hooks),
    };

    let mut tls = ClientConfig::builder_with_details(Arc::new(provider), Arc::new(clock))
        .with_protocol_versions(&config.protocol_versions)?
        .with_root_certificates(config.root_store.clone())
        .with_no_client_auth();
    tls.key_log = Arc::new(HookedKeyLog {
        hooks: Arc::downgrade(hooks),
    });
    tls.resumption = Resumption::disabled();

    Ok(TlsConnector::from(Arc::new(tls)))
}
