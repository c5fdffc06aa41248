//! Out-of-band checks run when the engine handshake keeps failing.
//!
//! Results are published as log lines only and never influence readiness.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use vos_core::certs::is_non_empty_file;
use vos_core::CertificateBundle;

use crate::LogSink;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Marker the Go TLS stack returns when spoken to in plaintext.
const HTTPS_MARKER: &str = "Client sent an HTTP request to an HTTPS server";

const PREFIX_LEN: usize = 60;

/// What a plaintext request to the engine port revealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    /// A TLS server is listening, which is what the engine should look like.
    HttpsListener,
    /// Something else answered; carries the start of the reply.
    UnexpectedResponse(String),
    /// The port accepted the connection but sent nothing.
    NoResponse,
    /// The connection itself failed.
    Refused(String),
}

/// Classify the reply to a plaintext `GET /`.
#[must_use]
pub fn classify_reply(reply: &[u8]) -> Diagnosis {
    if reply.is_empty() {
        return Diagnosis::NoResponse;
    }
    let text = String::from_utf8_lossy(reply);
    if text.contains(HTTPS_MARKER) {
        return Diagnosis::HttpsListener;
    }
    let prefix: String = text.chars().take(PREFIX_LEN).collect();
    Diagnosis::UnexpectedResponse(prefix.escape_debug().to_string())
}

/// Send a plaintext request to `host:port` and classify whatever comes back.
pub async fn probe(host: &str, port: u16) -> Diagnosis {
    let mut stream =
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Diagnosis::Refused(e.to_string()),
            Err(_) => return Diagnosis::Refused("connect timed out".to_owned()),
        };

    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\n\r\n");
    if let Err(e) = stream.write_all(request.as_bytes()).await {
        return Diagnosis::Refused(e.to_string());
    }

    let mut buf = vec![0u8; 1024];
    match tokio::time::timeout(PROBE_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => classify_reply(&buf[..n]),
        Ok(Err(_)) | Err(_) => Diagnosis::NoResponse,
    }
}

/// Run the probe and the certificate check, then publish the findings.
pub async fn run(host: String, port: u16, bundle: CertificateBundle, log: LogSink) {
    match probe(&host, port).await {
        Diagnosis::HttpsListener => {
            log.debug(format!("diagnostics: port {port} is serving HTTPS"));
        }
        Diagnosis::UnexpectedResponse(prefix) => {
            log.warn(format!("diagnostics: port {port} answered unexpectedly: {prefix}"));
        }
        Diagnosis::NoResponse => {
            log.warn(format!("diagnostics: port {port} is open but sent no response"));
        }
        Diagnosis::Refused(e) => {
            log.warn(format!("diagnostics: cannot reach port {port}: {e}"));
        }
    }

    for (name, path) in [("client certificate", &bundle.cert), ("client key", &bundle.key)] {
        if !is_non_empty_file(path) {
            log.warn(format!("diagnostics: {name} {} is missing or empty", path.display()));
        }
    }
}

/// Run [`run`] detached from the caller.
pub fn spawn(host: String, port: u16, bundle: CertificateBundle, log: LogSink) -> JoinHandle<()> {
    tokio::spawn(run(host, port, bundle, log))
}
