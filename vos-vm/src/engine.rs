//! Minimal client for the guest's container-engine API.
//!
//! The engine listens on TCP behind mutual TLS: the guest-generated CA is the
//! only trust anchor, and the client presents the guest-generated client
//! certificate. One HTTP/1.1 connection is held per handle, built from
//! hyper's low-level connection API on top of a tokio-rustls stream.

use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1::SendRequest;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use vos_core::CertificateBundle;

use crate::VmError;

/// Upper bound on a single API request once connected.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// An open, authenticated connection to the engine.
///
/// Clones share the connection. Once [`EngineHandle::close`] has been called
/// every clone fails with [`VmError::EngineClosed`].
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    endpoint: String,
    sender: Mutex<Option<SendRequest<Empty<Bytes>>>>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Connect and complete the TLS and HTTP handshakes.
    ///
    /// `host` doubles as the TLS server name and may be an IP literal.
    ///
    /// # Errors
    /// Returns [`VmError::Tls`] if the bundle cannot be loaded or the TLS
    /// handshake fails, and [`VmError::Engine`] on TCP or HTTP errors.
    pub async fn connect(
        host: &str,
        port: u16,
        bundle: &CertificateBundle,
    ) -> Result<Self, VmError> {
        let config = client_config(bundle)?;
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| VmError::Tls(format!("invalid server name {host}: {e}")))?;

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| VmError::Engine(format!("connect {host}:{port}: {e}")))?;

        let tls = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| VmError::Tls(format!("handshake with {host}:{port}: {e}")))?;

        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| VmError::Engine(format!("HTTP handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("engine connection closed: {e}");
            }
        });

        Ok(Self {
            inner: Arc::new(EngineInner {
                endpoint: format!("{host}:{port}"),
                sender: Mutex::new(Some(sender)),
            }),
        })
    }

    /// `host:port` this handle is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// `GET /_ping`; succeeds when the engine answers `200 OK` with body `OK`.
    ///
    /// # Errors
    /// Returns [`VmError::EngineClosed`] after [`EngineHandle::close`], and
    /// [`VmError::Engine`] on transport errors or an unexpected reply.
    pub async fn ping(&self) -> Result<(), VmError> {
        let (status, body) = self.get("/_ping").await?;
        if status == StatusCode::OK && body.trim() == "OK" {
            Ok(())
        } else {
            Err(VmError::Engine(format!("unexpected ping reply: HTTP {status}: {body}")))
        }
    }

    /// Drop the connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.sender.lock().await.take().is_some() {
            tracing::debug!(endpoint = %self.inner.endpoint, "engine handle closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.sender.lock().await.is_none()
    }

    async fn get(&self, uri_path: &str) -> Result<(StatusCode, String), VmError> {
        let mut guard = self.inner.sender.lock().await;
        let sender = guard.as_mut().ok_or(VmError::EngineClosed)?;

        let request = async {
            sender
                .ready()
                .await
                .map_err(|e| VmError::Engine(format!("connection not ready: {e}")))?;

            let req = Request::builder()
                .method(Method::GET)
                .uri(uri_path)
                .header("Host", self.inner.endpoint.as_str())
                .body(Empty::<Bytes>::new())
                .map_err(|e| VmError::Engine(format!("build request: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| VmError::Engine(format!("send request: {e}")))?;

            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| VmError::Engine(format!("read response body: {e}")))?
                .to_bytes();

            Ok((status, String::from_utf8_lossy(&body).into_owned()))
        };

        tokio::time::timeout(REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| VmError::Engine(format!("GET {uri_path} timed out")))?
    }
}

/// Build a client config trusting only the bundle's CA and presenting the
/// bundle's client certificate.
///
/// # Errors
/// Returns [`VmError::Tls`] if any file is unreadable or holds no usable PEM.
pub fn client_config(bundle: &CertificateBundle) -> Result<Arc<ClientConfig>, VmError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&bundle.ca)? {
        roots
            .add(cert)
            .map_err(|e| VmError::Tls(format!("CA {}: {e}", bundle.ca.display())))?;
    }

    let chain = read_certs(&bundle.cert)?;
    let key = read_key(&bundle.key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| VmError::Tls(format!("protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| VmError::Tls(format!("client identity: {e}")))?;

    Ok(Arc::new(config))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, VmError> {
    let file = std::fs::File::open(path)
        .map_err(|e| VmError::Tls(format!("open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| VmError::Tls(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(VmError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, VmError> {
    let file = std::fs::File::open(path)
        .map_err(|e| VmError::Tls(format!("open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| VmError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| VmError::Tls(format!("no private key in {}", path.display())))
}
