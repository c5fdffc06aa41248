//! The VM lifecycle controller.
//!
//! Owns the single VM: its state machine, the hypervisor process (through
//! the watchdog), the console and readiness monitors and the engine handle.
//! Monitors never mutate state themselves; they report outcomes and the
//! controller applies the matching transition, guarded by the run id so a
//! late report from an earlier run is ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use vos_core::{plan, LogLine, RunId, StateChange, TransitionReason, VmState};

use crate::console::{console_stream, ConsoleEvent};
use crate::launcher::{LaunchRequest, VmLauncher};
use crate::readiness::{ReadinessMonitor, ReadinessOutcome};
use crate::watchdog::{ExitReport, Watchdog};
use crate::{host, ControllerConfig, EngineHandle, EventBus, Liveness, LogSink, VmError, VmInstance};

/// Time monitors get to notice revocation before they are aborted.
const MONITOR_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Controls the lifecycle of the single VM.
///
/// `start` and `stop` are serialised: a `start` issued during a teardown
/// waits for it, and a second `stop` waits for the first and then finds
/// nothing to do.
pub struct VmController<L: VmLauncher> {
    launcher: L,
    shared: Arc<Shared>,
    ops: Mutex<()>,
}

struct Shared {
    config: ControllerConfig,
    events: EventBus,
    inner: Mutex<Inner>,
}

struct Inner {
    state: VmState,
    last_change: Option<StateChange>,
    run: Option<ActiveRun>,
    engine: Option<EngineHandle>,
    shut_down: bool,
}

struct ActiveRun {
    instance: VmInstance,
    liveness: Liveness,
    watchdog: Watchdog,
    monitors: Vec<JoinHandle<()>>,
}

impl<L: VmLauncher> VmController<L> {
    #[must_use]
    pub fn new(launcher: L, config: ControllerConfig) -> Self {
        Self {
            launcher,
            shared: Arc::new(Shared {
                config,
                events: EventBus::default(),
                inner: Mutex::new(Inner {
                    state: VmState::Stopped,
                    last_change: None,
                    run: None,
                    engine: None,
                    shut_down: false,
                }),
            }),
            ops: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    pub async fn state(&self) -> VmState {
        self.shared.inner.lock().await.state
    }

    /// The most recent transition, if any happened yet.
    pub async fn last_change(&self) -> Option<StateChange> {
        self.shared.inner.lock().await.last_change.clone()
    }

    /// The live engine connection; `Some` only while `Ready`.
    pub async fn engine(&self) -> Option<EngineHandle> {
        self.shared.inner.lock().await.engine.clone()
    }

    /// The VM this controller currently owns, including one left running
    /// after a readiness timeout.
    pub async fn instance(&self) -> Option<VmInstance> {
        self.shared.inner.lock().await.run.as_ref().map(|run| run.instance.clone())
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.shared.events.subscribe_logs()
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.shared.events.subscribe_states()
    }

    /// Fires once per run with the engine handle when the VM becomes ready.
    pub fn subscribe_ready(&self) -> broadcast::Receiver<EngineHandle> {
        self.shared.events.subscribe_ready()
    }

    /// Boot the VM.
    ///
    /// A no-op while `Starting` or `Ready`. Without `image` the configured
    /// image is used, then the first `*.iso` in the hypervisor directory.
    /// Without `shared_dir` the configured shared directory is used.
    ///
    /// On success the state is `Starting` and monitors are running; readiness
    /// is reported later through the state and ready channels.
    ///
    /// # Errors
    /// Returns [`VmError::ShuttingDown`] after [`VmController::shutdown`] and
    /// any launch error; on error the state stays `Stopped`.
    pub async fn start(
        &self,
        image: Option<PathBuf>,
        shared_dir: Option<PathBuf>,
    ) -> Result<(), VmError> {
        let _op = self.ops.lock().await;
        let log = self.shared.events.logs();

        let lingering = {
            let mut inner = self.shared.inner.lock().await;
            if inner.shut_down {
                return Err(VmError::ShuttingDown);
            }
            if inner.state.is_active() {
                tracing::debug!(state = %inner.state, "start ignored; VM already active");
                return Ok(());
            }
            inner.run.take()
        };
        if let Some(run) = lingering {
            log.info("stopping the VM left running by the previous attempt");
            self.shared.teardown(run).await;
        }

        let result = self.launch(image, shared_dir).await;
        if let Err(e) = &result {
            log.error(format!("failed to start VM: {e}"));
        }
        result
    }

    async fn launch(&self, image: Option<PathBuf>, shared_dir: Option<PathBuf>) -> Result<(), VmError> {
        let config = &self.shared.config;
        let log = self.shared.events.logs();

        let image = match image.or_else(|| config.image_path.clone()) {
            Some(image) => image,
            None => discover_image(&config.hypervisor_dir).await.ok_or_else(|| {
                VmError::PreconditionMissing {
                    what: "boot image",
                    path: config.hypervisor_dir.clone(),
                }
            })?,
        };
        let shared_dir = shared_dir.unwrap_or_else(|| config.shared_dir.clone());

        let resources = plan(config.host.unwrap_or_else(host::detect));
        log.debug(format!("resource allocation: {resources}"));

        let request = LaunchRequest::new(resources, image, shared_dir, config.ports);
        log.info(format!("starting VM from {}", request.image.display()));
        let process = self.launcher.launch(&request).await?;
        let instance = VmInstance::new(&request, &process);
        let run_id = request.run_id;

        // Monitors report through `shared`; holding the lock until the run is
        // registered means none of them can observe the previous state.
        let mut inner = self.shared.inner.lock().await;
        let liveness = Liveness::new();

        let watchdog = {
            let shared = Arc::clone(&self.shared);
            Watchdog::spawn(process, move |report| async move {
                shared.on_process_exit(run_id, report).await;
            })
        };
        let console = tokio::spawn(pump_console(
            console_stream(
                config.api_host.clone(),
                config.ports.console,
                liveness.clone(),
                config.console.clone(),
            ),
            log.clone(),
        ));
        let readiness = {
            let shared = Arc::clone(&self.shared);
            let monitor = ReadinessMonitor::new(
                request.certificates(),
                config.api_host.clone(),
                config.ports.api,
                config.readiness.clone(),
                log.clone(),
            );
            let liveness = liveness.clone();
            tokio::spawn(async move {
                let outcome = monitor.wait_ready(&liveness).await;
                shared.on_readiness(run_id, outcome).await;
            })
        };

        inner.run = Some(ActiveRun {
            instance,
            liveness,
            watchdog,
            monitors: vec![console, readiness],
        });
        self.shared.transition(&mut inner, run_id, VmState::Starting, TransitionReason::StartRequested);
        log.info(format!(
            "VM booting; waiting up to {}s for the engine",
            config.readiness.timeout.as_secs()
        ));
        Ok(())
    }

    /// Tear the VM down. Idempotent.
    ///
    /// Closes the engine handle, revokes liveness so the monitors exit,
    /// terminates the process (forced kill after the grace period) and only
    /// then reports `Stopped`.
    pub async fn stop(&self) {
        let _op = self.ops.lock().await;
        self.stop_locked().await;
    }

    /// Stop the VM and refuse every later `start`.
    pub async fn shutdown(&self) {
        let _op = self.ops.lock().await;
        self.shared.inner.lock().await.shut_down = true;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let log = self.shared.events.logs();
        let (run, engine, announced) = {
            let mut inner = self.shared.inner.lock().await;
            let Some(run) = inner.run.take() else {
                return;
            };
            let announced = inner.state.is_active();
            if announced {
                self.shared.transition(
                    &mut inner,
                    run.instance.run_id,
                    VmState::Stopping,
                    TransitionReason::StopRequested,
                );
            }
            (run, inner.engine.take(), announced)
        };

        log.info("stopping VM");
        if let Some(engine) = engine {
            engine.close().await;
        }
        let run_id = run.instance.run_id;
        let report = self.shared.teardown(run).await;
        log.info(format!("VM stopped: hypervisor {}", report.cause));

        if announced {
            let mut inner = self.shared.inner.lock().await;
            self.shared.transition(&mut inner, run_id, VmState::Stopped, TransitionReason::StopRequested);
        }
    }
}

impl Shared {
    fn transition(&self, inner: &mut Inner, run_id: RunId, state: VmState, reason: TransitionReason) {
        inner.state = state;
        let change = StateChange::now(run_id, state, reason);
        inner.last_change = Some(change.clone());
        self.events.publish_state(change);
    }

    /// Revoke liveness, stop the process and wait for the monitors.
    async fn teardown(&self, run: ActiveRun) -> ExitReport {
        run.liveness.revoke();
        let report = run.watchdog.shutdown(self.config.stop_grace).await;
        for mut monitor in run.monitors {
            if tokio::time::timeout(MONITOR_EXIT_GRACE, &mut monitor).await.is_err() {
                tracing::debug!("monitor did not exit in time; aborting");
                monitor.abort();
            }
        }
        report
    }

    async fn on_process_exit(&self, run_id: RunId, report: ExitReport) {
        let log = self.events.logs();
        let (run, engine) = {
            let mut inner = self.inner.lock().await;
            if !inner.run.as_ref().is_some_and(|r| r.instance.run_id == run_id) {
                return;
            }
            match inner.state {
                VmState::Starting | VmState::Ready => {
                    let run = inner.run.take();
                    let engine = inner.engine.take();
                    let code = report.code();
                    self.transition(
                        &mut inner,
                        run_id,
                        VmState::Stopped,
                        TransitionReason::UnexpectedExit { code },
                    );
                    log.error(VmError::UnexpectedExit { code }.to_string());
                    (run, engine)
                }
                VmState::Stopped => {
                    log.info("VM left running after the readiness timeout has exited");
                    (inner.run.take(), None)
                }
                VmState::Stopping => return,
            }
        };

        if let Some(engine) = engine {
            engine.close().await;
        }
        if let Some(run) = run {
            // The watchdog task is the caller; the monitors see revocation.
            run.liveness.revoke();
        }
    }

    async fn on_readiness(&self, run_id: RunId, outcome: Result<ReadinessOutcome, VmError>) {
        let log = self.events.logs();
        let mut inner = self.inner.lock().await;
        let current = inner.run.as_ref().is_some_and(|r| r.instance.run_id == run_id)
            && inner.state == VmState::Starting;

        match outcome {
            Ok(ReadinessOutcome::Ready(engine)) if current => {
                inner.engine = Some(engine.clone());
                self.transition(&mut inner, run_id, VmState::Ready, TransitionReason::BootFinished);
                drop(inner);
                log.success("VM is ready");
                self.events.publish_ready(engine);
            }
            Ok(ReadinessOutcome::Ready(engine)) => {
                drop(inner);
                engine.close().await;
            }
            Ok(ReadinessOutcome::Cancelled) => {}
            Err(err) if current => {
                let elapsed = match &err {
                    VmError::ReadinessTimeout { elapsed } => *elapsed,
                    _ => self.config.readiness.timeout,
                };
                self.transition(
                    &mut inner,
                    run_id,
                    VmState::Stopped,
                    TransitionReason::ReadinessTimeout { elapsed_secs: elapsed.as_secs() },
                );
                drop(inner);
                log.error(format!(
                    "engine not ready after {}s; the VM is left running, check the console log",
                    elapsed.as_secs()
                ));
            }
            Err(err) => tracing::debug!(run_id = %run_id, "stale readiness result ignored: {err}"),
        }
    }
}

async fn pump_console<S>(stream: S, log: LogSink)
where
    S: futures::Stream<Item = ConsoleEvent>,
{
    tokio::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            ConsoleEvent::Line(line) => log.console(&line),
            ConsoleEvent::Connected { attempts } => {
                log.debug(format!("serial console connected after {attempts} attempt(s)"));
            }
            ConsoleEvent::Unavailable { attempts } => log.warn(format!(
                "serial console unavailable after {attempts} attempts; VM output will not be shown"
            )),
            ConsoleEvent::Closed { reason } => log.debug(format!("serial console closed: {reason}")),
        }
    }
}

/// First `*.iso` in `dir`, by file name.
pub async fn discover_image(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut images = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_iso = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"));
        if is_iso && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    images.into_iter().next()
}
