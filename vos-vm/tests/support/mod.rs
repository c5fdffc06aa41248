//! Shared fixtures: a throwaway PKI, a mutual-TLS fake engine and a
//! launcher that runs ordinary processes instead of a hypervisor.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use vos_core::{CertificateBundle, HostCapacity, Ports, StateChange, VmState, VosConfig};
use vos_vm::launcher::{classify_spawn_error, prepare};
use vos_vm::{ControllerConfig, LaunchRequest, ProcessHandle, VmError, VmLauncher};

/// CA, engine server identity and client identity, all PEM.
pub struct TestPki {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().expect("CA key");
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "vos test CA");
        let ca = ca_params.self_signed(&ca_key).expect("CA cert");

        let server_key = KeyPair::generate().expect("server key");
        let mut server_params = CertificateParams::new(Vec::<String>::new()).expect("server params");
        server_params.distinguished_name.push(DnType::CommonName, "engine");
        server_params.subject_alt_names = vec![
            SanType::DnsName("localhost".try_into().expect("dns name")),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).expect("server cert");

        let client_key = KeyPair::generate().expect("client key");
        let mut client_params = CertificateParams::new(Vec::<String>::new()).expect("client params");
        client_params.distinguished_name.push(DnType::CommonName, "client");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params.signed_by(&client_key, &ca, &ca_key).expect("client cert");

        Self {
            ca_pem: ca.pem(),
            server_cert_pem: server.pem(),
            server_key_pem: server_key.serialize_pem(),
            client_cert_pem: client.pem(),
            client_key_pem: client_key.serialize_pem(),
        }
    }

    /// Write the files the guest would drop into the shared directory.
    pub fn write_client_bundle(&self, dir: &Path) -> CertificateBundle {
        std::fs::create_dir_all(dir).expect("create shared dir");
        let bundle = CertificateBundle::in_dir(dir);
        std::fs::write(&bundle.ca, &self.ca_pem).expect("write ca");
        std::fs::write(&bundle.cert, &self.client_cert_pem).expect("write cert");
        std::fs::write(&bundle.key, &self.client_key_pem).expect("write key");
        bundle
    }
}

const PING_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";

/// A TLS server that requires a client certificate and answers every
/// request with `200 OK`.
pub struct FakeEngine {
    pub port: u16,
    task: JoinHandle<()>,
}

impl FakeEngine {
    pub async fn spawn(pki: &TestPki) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pki.ca_pem.as_bytes()) {
            roots.add(cert.expect("parse CA")).expect("add CA");
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .expect("client verifier");

        let chain = rustls_pemfile::certs(&mut pki.server_cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .expect("server chain");
        let key = rustls_pemfile::private_key(&mut pki.server_key_pem.as_bytes())
            .expect("server key")
            .expect("server key present");

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .expect("server config");
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(tcp).await {
                        answer_requests(tls).await;
                    }
                });
            }
        });

        Self { port, task }
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer_requests<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            pending.drain(..end + 4);
            if stream.write_all(PING_REPLY).await.is_err() {
                return;
            }
        }
    }
}

/// A TCP port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").port()
}

type LaunchHook = Box<dyn Fn(&LaunchRequest) + Send + Sync>;

/// Runs `program args...` in place of the hypervisor.
pub struct ScriptLauncher {
    program: PathBuf,
    args: Vec<String>,
    on_launch: Option<LaunchHook>,
}

impl ScriptLauncher {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: PathBuf::from(program),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            on_launch: None,
        }
    }

    /// Run `hook` after the preconditions pass and before spawning, the way
    /// a guest would eventually populate the shared directory.
    pub fn on_launch(mut self, hook: impl Fn(&LaunchRequest) + Send + Sync + 'static) -> Self {
        self.on_launch = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl VmLauncher for ScriptLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, VmError> {
        prepare(&self.program, request).await?;
        if let Some(hook) = &self.on_launch {
            hook(request);
        }
        let child = Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(|e| classify_spawn_error(&self.program, &e))?;
        Ok(ProcessHandle::new(child))
    }
}

/// Per-test directory layout plus a controller config pointing into it.
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub image: PathBuf,
    pub shared: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("boot.iso");
        std::fs::write(&image, b"not really an iso").expect("write image");
        let shared = dir.path().join("shared");
        Self { dir, image, shared }
    }

    /// Fast timings, a fixed host and ports chosen by the caller.
    pub fn config(&self, api_port: u16, console_port: u16) -> ControllerConfig {
        let mut vos = VosConfig::default();
        vos.base_dir = self.dir.path().to_owned();
        let mut config = ControllerConfig::from(&vos);
        config.shared_dir = self.shared.clone();
        config.image_path = Some(self.image.clone());
        config.ports = Ports::new(api_port, 2376, console_port);
        config.host = Some(HostCapacity::new(4, 8192));
        config.stop_grace = Duration::from_secs(2);

        config.readiness.timeout = Duration::from_secs(10);
        config.readiness.initial_interval = Duration::from_millis(50);
        config.readiness.max_interval = Duration::from_millis(100);
        config.readiness.imminent_interval = Duration::from_millis(50);

        config.console.max_attempts = 2;
        config.console.initial_delay = Duration::from_millis(20);
        config.console.max_delay = Duration::from_millis(20);
        config
    }
}

/// Receive state changes until `want` is entered.
pub async fn wait_for_state(rx: &mut broadcast::Receiver<StateChange>, want: VmState) -> StateChange {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(change) if change.state == want => return change,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("state channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(15), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}"))
}

/// Drain whatever state changes are already buffered.
pub fn drain_states(rx: &mut broadcast::Receiver<StateChange>) -> Vec<VmState> {
    let mut states = Vec::new();
    while let Ok(change) = rx.try_recv() {
        states.push(change.state);
    }
    states
}
