//! Readiness monitor.
//!
//! Polls until the guest's container engine answers an authenticated ping.
//! The guest signals progress by writing its certificate bundle into the
//! shared directory; once that bundle exists the engine is moments away and
//! polling switches to a short fixed interval.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use vos_core::CertificateBundle;

use crate::{diagnostics, Backoff, EngineHandle, Liveness, LogSink, ReadinessSettings, VmError};

/// How a readiness wait ended without error.
#[derive(Debug)]
pub enum ReadinessOutcome {
    /// The engine answered; the handle is open and owned by the caller.
    Ready(EngineHandle),
    /// Liveness was revoked before the engine answered.
    Cancelled,
}

/// Delay policy: geometric while the guest is still booting, fixed once
/// the certificates show up.
#[derive(Debug, Clone)]
struct PollInterval {
    booting: Backoff,
    imminent: Duration,
}

impl PollInterval {
    fn new(settings: &ReadinessSettings) -> Self {
        Self {
            booting: Backoff::new(
                settings.initial_interval,
                settings.interval_factor,
                settings.max_interval,
            ),
            imminent: settings.imminent_interval,
        }
    }

    fn next(&mut self, certificates_seen: bool) -> Duration {
        if certificates_seen {
            self.imminent
        } else {
            self.booting.next_delay()
        }
    }
}

/// Waits for the engine of one run.
#[derive(Debug, Clone)]
pub struct ReadinessMonitor {
    bundle: CertificateBundle,
    host: String,
    port: u16,
    settings: ReadinessSettings,
    log: LogSink,
}

impl ReadinessMonitor {
    #[must_use]
    pub fn new(
        bundle: CertificateBundle,
        host: String,
        port: u16,
        settings: ReadinessSettings,
        log: LogSink,
    ) -> Self {
        Self { bundle, host, port, settings, log }
    }

    /// Poll until the engine is reachable, the timeout elapses or liveness
    /// is revoked.
    ///
    /// Handshake failures are retried silently (debug log only); the
    /// timeout is checked on every iteration so a failing handshake can
    /// never end the wait early.
    ///
    /// # Errors
    /// Returns [`VmError::ReadinessTimeout`] once the configured budget is spent.
    pub async fn wait_ready(&self, liveness: &Liveness) -> Result<ReadinessOutcome, VmError> {
        let started = Instant::now();
        let mut interval = PollInterval::new(&self.settings);
        let mut certificates_seen = false;
        let mut handshake_failures: u32 = 0;

        loop {
            if !liveness.is_alive() {
                return Ok(ReadinessOutcome::Cancelled);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.timeout {
                return Err(VmError::ReadinessTimeout { elapsed });
            }

            if !certificates_seen && self.bundle.is_complete() {
                certificates_seen = true;
                self.log.info(format!(
                    "engine certificates found after {:.1}s",
                    elapsed.as_secs_f64()
                ));
            }

            if certificates_seen && self.port_open().await {
                match self.handshake().await {
                    Ok(engine) => {
                        self.log.debug(format!(
                            "engine handshake succeeded after {:.1}s",
                            started.elapsed().as_secs_f64()
                        ));
                        if liveness.is_alive() {
                            return Ok(ReadinessOutcome::Ready(engine));
                        }
                        engine.close().await;
                        return Ok(ReadinessOutcome::Cancelled);
                    }
                    Err(e) => {
                        handshake_failures += 1;
                        self.log.debug(format!(
                            "engine handshake attempt {handshake_failures} failed: {e}"
                        ));
                        if handshake_failures == 1
                            || handshake_failures % self.settings.diagnostics_every.max(1) == 0
                        {
                            diagnostics::spawn(
                                self.host.clone(),
                                self.port,
                                self.bundle.clone(),
                                self.log.clone(),
                            );
                        }
                    }
                }
            }

            let remaining = self.settings.timeout.saturating_sub(started.elapsed());
            let delay = interval.next(certificates_seen).min(remaining);
            if !liveness.sleep(delay).await {
                return Ok(ReadinessOutcome::Cancelled);
            }
        }
    }

    async fn port_open(&self) -> bool {
        matches!(
            tokio::time::timeout(
                self.settings.connect_timeout,
                TcpStream::connect((self.host.as_str(), self.port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn handshake(&self) -> Result<EngineHandle, VmError> {
        let attempt = async {
            let engine = EngineHandle::connect(&self.host, self.port, &self.bundle).await?;
            if let Err(e) = engine.ping().await {
                engine.close().await;
                return Err(e);
            }
            Ok(engine)
        };
        tokio::time::timeout(self.settings.handshake_timeout, attempt)
            .await
            .map_err(|_| VmError::Engine("handshake timed out".to_owned()))?
    }
}
