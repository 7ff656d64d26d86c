//! The build state machine.
//!
//! [`BuildCoordinator::run`] drives one [`BuildJob`] from `Init` to `Done`
//! or `Failed`:
//!
//! - `Init` validates the configuration and checks the artifact inventory;
//!   nothing is created before it passes
//! - `Provisioning` starts the artifact server, then creates the guest
//! - `BootInjecting` waits out `boot_wait` and types the boot command
//! - `Installing` and `AwaitingChannel` poll the command channel
//! - `RemoteProvisioning` runs the external provisioner
//! - `ShuttingDown` halts the guest, gracefully if it can
//! - `Finalizing` converts the guest and appends the manifest
//!
//! Every resource is owned by a [`ResourceScope`] which is released exactly
//! once before the terminal state is entered, whatever happened before.

mod scope;
mod shutdown;


pub use scope::{ResourceScope, GUEST_RESOURCE, SERVER_RESOURCE};
pub use shutdown::{ShutdownKind, FORCED_OFF_CONFIRM};

use crate::boot::{BootInjector, InjectError};
use crate::cancellation::CancellationToken;
use crate::config::{validate, BuildConfig, Redactor};
use crate::core::{Artifact, BuildEvent, BuildJob, BuildState, EventKind, StateRecord};
use crate::driver::{DriverError, GuestDriver, GuestInstance, GuestSpec};
use crate::errors::{BuildError, BuildFailure, ConfigurationError, TeardownReport};
use crate::events::{EventSink, LoggingEventSink};
use crate::finalize::{FinalizeError, Finalizer, ManifestEntry, RunSummary};
use crate::observability::build_span;
use crate::remote::{RemoteExecutor, RemoteShell, SshShell};
use crate::server::{ArtifactServer, ServerConfig};
use crate::watcher::{ChannelProbe, InstallWatcher, SshProbe, WatchConfig, WatchOutcome};
use futures::FutureExt;
use shutdown::Shutdown;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Default time each resource gets to release during teardown.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// The build.
    pub build_id: Uuid,
    /// Guest name.
    pub guest_name: String,
    /// The artifact.
    pub artifact: Artifact,
    /// The manifest entry, if a manifest is configured.
    pub manifest_entry: Option<ManifestEntry>,
    /// Whether the guest had to be forced off.
    pub forced_shutdown: bool,
    /// States visited, with timings.
    pub history: Vec<StateRecord>,
    /// What teardown released.
    pub teardown: TeardownReport,
    /// Wall time of the build.
    pub duration_ms: f64,
}

struct Finalized {
    artifact: Artifact,
    manifest_entry: Option<ManifestEntry>,
    forced_shutdown: bool,
}

/// Runs builds.
///
/// Collaborators default to the ones the configuration names; tests and
/// embedders can replace any of them.
pub struct BuildCoordinator {
    sink: Arc<dyn EventSink>,
    driver: Option<Arc<dyn GuestDriver>>,
    probe: Option<Arc<dyn ChannelProbe>>,
    shell: Option<Arc<dyn RemoteShell>>,
    teardown_timeout: Duration,
}

impl std::fmt::Debug for BuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCoordinator")
            .field("driver", &self.driver.as_ref().map(|d| d.name().to_string()))
            .field("probe_override", &self.probe.is_some())
            .field("shell_override", &self.shell.is_some())
            .field("teardown_timeout", &self.teardown_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for BuildCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildCoordinator {
    /// A coordinator that logs events through `tracing`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sink: Arc::new(LoggingEventSink::default()),
            driver: None,
            probe: None,
            shell: None,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    /// Sends progress events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Uses `driver` instead of the configured back-end.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn GuestDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Probes the command channel with `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ChannelProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Runs the shutdown command through `shell`.
    #[must_use]
    pub fn with_shell(mut self, shell: Arc<dyn RemoteShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Bounds each teardown step.
    #[must_use]
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Runs independent builds concurrently. Results are in input order.
    pub async fn run_many(
        &self,
        jobs: Vec<BuildJob>,
        cancel: Arc<CancellationToken>,
    ) -> Vec<Result<BuildReport, BuildFailure>> {
        futures::future::join_all(
            jobs.into_iter()
                .map(|job| self.run(job, Arc::clone(&cancel))),
        )
        .await
    }

    /// Runs one build to a terminal state.
    ///
    /// Teardown has finished when this returns. The error of a failed build
    /// is the one that ended it; teardown problems are only reported next
    /// to it.
    pub async fn run(
        &self,
        job: BuildJob,
        cancel: Arc<CancellationToken>,
    ) -> Result<BuildReport, BuildFailure> {
        let span = build_span(job.id(), job.guest_name());
        self.run_in_span(job, cancel).instrument(span).await
    }

    async fn run_in_span(
        &self,
        mut job: BuildJob,
        cancel: Arc<CancellationToken>,
    ) -> Result<BuildReport, BuildFailure> {
        let started = Instant::now();
        let config = Arc::clone(job.config());
        let progress = Progress {
            sink: Arc::clone(&self.sink),
            build_id: job.id(),
            guest: job.guest_name().to_string(),
            redactor: config.redactor.clone(),
        };
        let mut scope = ResourceScope::new(self.teardown_timeout);

        info!("Build started");
        progress.entered(BuildState::Init).await;
        let outcome = AssertUnwindSafe(self.drive(&mut job, &config, &scope, &progress, &cancel))
            .catch_unwind()
            .await;
        let result = outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Build panicked");
            Err(BuildError::Internal(format!("build panicked: {message}")))
        });

        let state = job.state();
        let teardown = scope.release().await;
        progress.teardown(state, &teardown).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(done) => {
                if let Err(error) = progress.advance(&mut job, BuildState::Done).await {
                    return Err(fail(job, state, error, teardown, &progress).await);
                }
                info!(
                    artifact_id = %done.artifact.id,
                    duration_ms,
                    "Build finished"
                );
                progress
                    .message(BuildState::Done, format!("artifact {} created", done.artifact.id))
                    .await;
                Ok(BuildReport {
                    build_id: job.id(),
                    guest_name: job.guest_name().to_string(),
                    artifact: done.artifact,
                    manifest_entry: done.manifest_entry,
                    forced_shutdown: done.forced_shutdown,
                    history: job.history().to_vec(),
                    teardown,
                    duration_ms,
                })
            }
            Err(error) => Err(fail(job, state, error, teardown, &progress).await),
        }
    }

    async fn drive(
        &self,
        job: &mut BuildJob,
        config: &BuildConfig,
        scope: &ResourceScope,
        progress: &Progress,
        cancel: &Arc<CancellationToken>,
    ) -> Result<Finalized, BuildError> {
        let template = &config.template;
        let source = &template.source;
        let credentials = config.credentials();

        // Init
        ensure_active(cancel)?;
        let preflight = validate(config)?;
        let driver = self.driver_for(config, cancel);
        let exists = driver
            .artifact_exists(&source.artifact.name)
            .await
            .map_err(|e| driver_failure("checking artifact inventory", e, cancel))?;
        if exists && !source.artifact.replace_existing {
            return Err(BuildError::Configuration(
                ConfigurationError::new(format!(
                    "artifact {} already exists and replace_existing is false",
                    source.artifact.name
                ))
                .with_field("source.artifact.name"),
            ));
        }

        // Provisioning
        progress.advance(job, BuildState::Provisioning).await?;
        ensure_active(cancel)?;
        let server = ArtifactServer::start(&ServerConfig::from(&source.http), Arc::clone(cancel))
            .await
            .map_err(|e| BuildError::Provisioning(format!("artifact server: {e}")))?;
        let (http_host, http_port) = (server.host().to_string(), server.port());
        scope.hold_server(server);
        progress
            .message(
                BuildState::Provisioning,
                format!("serving {} on http://{http_host}:{http_port}", source.http.directory.display()),
            )
            .await;

        ensure_active(cancel)?;
        let spec = GuestSpec {
            build_id: config.build_id,
            name: source.guest_name.clone(),
            hardware: source.hardware.clone(),
            media: source.media.clone(),
        };
        let guest = driver
            .create(&spec)
            .await
            .map_err(|e| driver_failure("creating guest", e, cancel))?;
        scope.hold_guest(Arc::clone(&driver), guest.clone());
        progress
            .message(BuildState::Provisioning, format!("guest {} created", guest.id))
            .await;

        // BootInjecting
        progress.advance(job, BuildState::BootInjecting).await?;
        progress
            .message(
                BuildState::BootInjecting,
                format!("waiting {}s for boot", source.boot.wait.as_secs()),
            )
            .await;
        if !cancel.sleep(source.boot.wait).await {
            return Err(cancelled(cancel));
        }
        let sequence = preflight.boot_sequence.resolve(&http_host, http_port);
        let injector = BootInjector::new(Arc::clone(&driver), source.boot.injection);
        progress
            .message(BuildState::BootInjecting, "typing boot command".to_string())
            .await;
        injector
            .inject(&guest, &sequence, cancel)
            .await
            .map_err(|e| inject_failure(e, cancel))?;

        // Installing
        progress.advance(job, BuildState::Installing).await?;
        let probe = self.probe_for(config);
        let mut watcher = InstallWatcher::new(
            Arc::clone(&probe),
            Arc::clone(&driver),
            WatchConfig::from(&source.communicator),
        );
        progress
            .message(
                BuildState::Installing,
                format!(
                    "waiting up to {}s for the command channel",
                    source.communicator.timeout.as_secs()
                ),
            )
            .await;
        let opened = loop {
            let stall_at = injector
                .policy()
                .stall_after()
                .filter(|_| injector.can_reinject())
                .map(|after| Instant::now() + after);
            match watcher.wait_for_port(&guest, &credentials, stall_at, cancel).await? {
                WatchOutcome::Stalled => {
                    progress
                        .warning(
                            BuildState::Installing,
                            "command channel port still closed; re-typing boot command".to_string(),
                        )
                        .await;
                    injector
                        .reinject(&guest, &sequence, cancel)
                        .await
                        .map_err(|e| inject_failure(e, cancel))?;
                }
                outcome => break outcome,
            }
        };

        // AwaitingChannel
        progress.advance(job, BuildState::AwaitingChannel).await?;
        let target = match opened {
            WatchOutcome::PortOpen {
                target,
                reachable: true,
            }
            | WatchOutcome::Reachable(target) => target,
            WatchOutcome::PortOpen { .. } | WatchOutcome::Stalled => {
                match watcher.wait_for_session(&guest, &credentials, cancel).await? {
                    WatchOutcome::Reachable(target) | WatchOutcome::PortOpen { target, .. } => target,
                    WatchOutcome::Stalled => {
                        return Err(BuildError::Internal("session wait reported a stall".into()))
                    }
                }
            }
        };
        progress
            .message(
                BuildState::AwaitingChannel,
                format!("command channel up at {target} after {}s", watcher.elapsed().as_secs()),
            )
            .await;

        // RemoteProvisioning
        progress.advance(job, BuildState::RemoteProvisioning).await?;
        ensure_active(cancel)?;
        let executor = RemoteExecutor::new(
            Arc::clone(&probe),
            source.communicator.retry.clone(),
            config.redactor.clone(),
        )
        .with_events(Arc::clone(&self.sink), config.build_id, &source.guest_name);
        let run = executor
            .run(&target, &credentials, &template.provisioner, cancel)
            .await?;
        if !run.success() {
            return Err(BuildError::RemoteExecution {
                program: template.provisioner.command.clone(),
                exit_code: run.exit_code,
                output: run.output,
            });
        }
        progress
            .message(
                BuildState::RemoteProvisioning,
                format!("provisioner finished in {:.1}s", run.duration.as_secs_f64()),
            )
            .await;

        // ShuttingDown
        progress.advance(job, BuildState::ShuttingDown).await?;
        let shell = self.shell_for(config);
        let kind = Shutdown {
            driver: driver.as_ref(),
            shell: shell.as_ref(),
            config: &source.shutdown,
            cancel,
        }
        .run(&guest, &target, &credentials)
        .await?;
        let forced_shutdown = kind == ShutdownKind::Forced;
        if forced_shutdown {
            progress
                .warning(BuildState::ShuttingDown, "guest was forced off".to_string())
                .await;
        }

        // Finalizing
        progress.advance(job, BuildState::Finalizing).await?;
        ensure_active(cancel)?;
        let finalizer = Finalizer::new(Arc::clone(&driver), config.redactor.clone());
        let artifact = convert(&finalizer, config, &guest, scope).await?;
        progress
            .message(
                BuildState::Finalizing,
                format!("artifact {} ({} files)", artifact.id, artifact.files.len()),
            )
            .await;

        let manifest_entry = match template.manifest {
            Some(ref manifest) => {
                let summary = RunSummary {
                    guest_name: source.guest_name.clone(),
                    forced_shutdown,
                    duration_ms: job.history().iter().filter_map(|r| r.duration_ms).sum(),
                };
                let entry = finalizer
                    .append_manifest(
                        &artifact,
                        manifest,
                        source.artifact.output_directory.as_deref(),
                        &summary,
                    )
                    .await?;
                progress
                    .message(
                        BuildState::Finalizing,
                        format!("recorded in {}", manifest.path.display()),
                    )
                    .await;
                Some(entry)
            }
            None => None,
        };

        job.set_result(Ok(artifact.clone()));
        Ok(Finalized {
            artifact,
            manifest_entry,
            forced_shutdown,
        })
    }

    fn driver_for(&self, config: &BuildConfig, cancel: &Arc<CancellationToken>) -> Arc<dyn GuestDriver> {
        match self.driver {
            Some(ref driver) => Arc::clone(driver),
            None => config.template.driver.connect(
                config.build_id,
                config.redactor.clone(),
                Arc::clone(cancel),
            ),
        }
    }

    fn probe_for(&self, config: &BuildConfig) -> Arc<dyn ChannelProbe> {
        match self.probe {
            Some(ref probe) => Arc::clone(probe),
            None => Arc::new(SshProbe::new(config.template.source.communicator.connect_timeout)),
        }
    }

    fn shell_for(&self, config: &BuildConfig) -> Arc<dyn RemoteShell> {
        match self.shell {
            Some(ref shell) => Arc::clone(shell),
            None => Arc::new(SshShell::new(config.template.source.communicator.connect_timeout)),
        }
    }
}

/// Reports a failed build and moves it to `Failed`.
async fn fail(
    mut job: BuildJob,
    state: BuildState,
    error: BuildError,
    teardown: TeardownReport,
    progress: &Progress,
) -> BuildFailure {
    let message = progress.redactor.redact(&error.to_string());
    if error.is_cancelled() {
        warn!(state = %state, error = %message, "Build cancelled");
    } else {
        error!(state = %state, kind = error.kind(), error = %message, "Build failed");
    }
    if let Err(e) = job.transition(BuildState::Failed) {
        error!(error = %e, "Could not record failure state");
    }
    progress
        .emit(
            BuildState::Failed,
            EventKind::Failed {
                error_kind: error.kind().to_string(),
                message,
            },
        )
        .await;
    job.set_result(Err(error.clone()));
    BuildFailure {
        build_id: job.id(),
        state,
        error,
        history: job.history().to_vec(),
        teardown,
    }
}

/// Converts the guest. Once conversion succeeded the guest is no longer
/// the scope's to destroy.
async fn convert(
    finalizer: &Finalizer,
    config: &BuildConfig,
    guest: &GuestInstance,
    scope: &ResourceScope,
) -> Result<Artifact, BuildError> {
    match finalizer
        .finalize(config.build_id, guest, &config.template.source.artifact)
        .await
    {
        Ok(artifact) => {
            scope.forget_guest();
            Ok(artifact)
        }
        Err(e @ FinalizeError::Convert(_)) => Err(e.into()),
        Err(e) => {
            // The conversion itself succeeded; the guest is gone.
            scope.forget_guest();
            Err(e.into())
        }
    }
}

/// Emits the redacted progress events of one build.
struct Progress {
    sink: Arc<dyn EventSink>,
    build_id: Uuid,
    guest: String,
    redactor: Redactor,
}

impl Progress {
    async fn emit(&self, state: BuildState, kind: EventKind) {
        let event = BuildEvent::new(self.build_id, self.guest.clone(), state, kind);
        self.sink.emit(&event).await;
    }

    async fn entered(&self, state: BuildState) {
        self.emit(state, EventKind::StateEntered).await;
    }

    async fn message(&self, state: BuildState, text: String) {
        let text = self.redactor.redact(&text);
        self.emit(state, EventKind::Message { text }).await;
    }

    async fn warning(&self, state: BuildState, text: String) {
        let text = self.redactor.redact(&text);
        warn!(state = %state, "{text}");
        self.emit(state, EventKind::Warning { text }).await;
    }

    /// Moves the job on and reports both ends of the transition.
    async fn advance(&self, job: &mut BuildJob, next: BuildState) -> Result<(), BuildError> {
        let left = job.state();
        let duration_ms = job.transition(next)?;
        info!(from = %left, to = %next, duration_ms, "State transition");
        self.emit(left, EventKind::StateCompleted { duration_ms }).await;
        self.entered(next).await;
        Ok(())
    }

    async fn teardown(&self, state: BuildState, report: &TeardownReport) {
        if report.is_noop() {
            return;
        }
        self.message(state, format!("teardown released {}", report.released.join(", ")))
            .await;
        for failure in &report.failures {
            self.warning(state, format!("teardown: {failure}")).await;
        }
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), BuildError> {
    if cancel.is_cancelled() {
        Err(cancelled(cancel))
    } else {
        Ok(())
    }
}

fn cancelled(cancel: &CancellationToken) -> BuildError {
    BuildError::Cancelled(cancel.reason().unwrap_or_else(|| "cancelled".to_string()))
}

fn driver_failure(what: &str, e: DriverError, cancel: &CancellationToken) -> BuildError {
    match e {
        DriverError::Cancelled => cancelled(cancel),
        other => BuildError::Provisioning(format!("{what}: {other}")),
    }
}

fn inject_failure(e: InjectError, cancel: &CancellationToken) -> BuildError {
    match e {
        InjectError::Cancelled | InjectError::Driver(DriverError::Cancelled) => cancelled(cancel),
        InjectError::Driver(d) => BuildError::Provisioning(format!("boot injection: {d}")),
        InjectError::Exhausted(_) => BuildError::Internal(e.to_string()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
