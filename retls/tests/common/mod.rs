//! A local HTTPS server with a throwaway certificate authority.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use retls::Config;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    RootCertStore, ServerConfig, SupportedProtocolVersion,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

pub const BODY: &str = r#"{"unixtime":1718000000,"message":"hello from the test server"}"#;

pub struct TestServer {
    pub addr: SocketAddr,
    roots: Arc<RootCertStore>,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::serving(BODY.as_bytes().to_vec(), rustls::ALL_VERSIONS).await
    }

    /// Serve `body` to every request, negotiating only `versions`.
    pub async fn serving(
        body: Vec<u8>,
        versions: &[&'static SupportedProtocolVersion],
    ) -> anyhow::Result<Self> {
        let (roots, chain, key) = certificates()?;
        let tls = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(versions)?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body);

        let task = tokio::spawn({
            let requests = requests.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let acceptor = acceptor.clone();
                    let requests = requests.clone();
                    let body = body.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve(stream, acceptor, requests, body).await {
                            tracing::warn!(%err, "test server connection failed");
                        }
                    });
                }
            }
        });

        Ok(Self {
            addr,
            roots: Arc::new(roots),
            requests,
            task,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{path}", self.addr.port())
    }

    /// Tag prefix of connections to this server.
    pub fn tag_prefix(&self) -> String {
        format!("localhost:{}", self.addr.port())
    }

    /// A configuration trusting only this server's authority.
    pub fn config(&self) -> Config {
        Config::builder().root_store(self.roots.clone()).build()
    }

    /// Request heads received so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    requests: Arc<Mutex<Vec<String>>>,
    body: Arc<Vec<u8>>,
) -> anyhow::Result<()> {
    let mut tls = acceptor.accept(stream).await?;

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tls.read(&mut buf).await?;
        anyhow::ensure!(n > 0, "client closed before sending a request");
        head.extend_from_slice(&buf[..n]);
    }
    requests
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&head).into_owned());

    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    tls.write_all(response.as_bytes()).await?;
    tls.write_all(&body).await?;
    tls.shutdown().await?;
    Ok(())
}

fn certificates() -> anyhow::Result<(
    RootCertStore,
    Vec<CertificateDer<'static>>,
    PrivateKeyDer<'static>,
)> {
    let ca_key = KeyPair::generate()?;
    let mut ca = CertificateParams::new(Vec::<String>::new())?;
    ca.distinguished_name
        .push(DnType::CommonName, "retls test authority");
    ca.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca_cert = ca.self_signed(&ca_key)?;

    let leaf_key = KeyPair::generate()?;
    let mut leaf = CertificateParams::new(vec!["localhost".to_owned()])?;
    leaf.distinguished_name.push(DnType::CommonName, "localhost");
    leaf.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let leaf_cert = leaf.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    let mut roots = RootCertStore::empty();
    roots.add(ca_cert.der().clone())?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    Ok((roots, vec![leaf_cert.der().clone()], key))
}
