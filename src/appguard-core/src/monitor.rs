//! Periodic tamper monitor.
//!
//! One dedicated worker thread per process runs a current-thread Tokio
//! runtime. Each tick re-checks the installed bundle, the native module
//! checksum and the signing certificate (HARD), then looks for hooks and
//! debuggers (FLEXIBLE). The first HARD finding is handed to the
//! orchestrator and the loop ends; there are no further ticks in this
//! process. Cancellation is observed between ticks and while a tick runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checksum::{BundleChecksum, ChecksumEngine};
use crate::error::GuardError;
use crate::host::HostPlatform;
use crate::identity::IdentityVerifier;
use crate::native::NativeAttestationBridge;
use crate::security::EnvironmentScanner;
use crate::types::{ViolationKind, ViolationRecord};

/// Name of the worker thread.
pub const MONITOR_THREAD_NAME: &str = "appguard-tamper-monitor";

/// Callback for the first HARD finding.
pub type HardViolationHandler = Box<dyn FnOnce(ViolationRecord) + Send + 'static>;

/// Per-process monitoring state.
#[derive(Debug, Clone)]
pub struct MonitoringSession {
    /// Bundle checksum at startup. `None` disables the bundle check.
    pub baseline_bundle: Option<BundleChecksum>,
    /// Native checksum at startup. `None` when the module is absent.
    pub baseline_native: Option<u64>,
    /// Tick interval.
    pub interval: Duration,
    /// When the last tick completed.
    pub last_check: Option<Instant>,
    /// Bundle checks in a row that did not complete.
    pub consecutive_timeouts: u32,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing found.
    Clean,
    /// Environment anomalies only.
    Flexible(Vec<ViolationRecord>),
    /// A HARD violation. The loop stops.
    Hard(ViolationRecord),
    /// The bundle check did not complete; the tick was skipped.
    Indeterminate,
}

/// The monitor's checks, runnable tick by tick.
pub struct TamperMonitor {
    host: Arc<dyn HostPlatform>,
    native: Arc<NativeAttestationBridge>,
    identity: IdentityVerifier,
    scanner: EnvironmentScanner,
    engine: ChecksumEngine,
    interval: Duration,
    max_checksum_timeouts: u32,
}

impl TamperMonitor {
    /// Create a monitor.
    pub fn new(
        host: Arc<dyn HostPlatform>,
        native: Arc<NativeAttestationBridge>,
        identity: IdentityVerifier,
        scanner: EnvironmentScanner,
    ) -> Self {
        Self {
            host,
            native,
            identity,
            scanner,
            engine: ChecksumEngine::default(),
            interval: Duration::from_secs(10),
            max_checksum_timeouts: 3,
        }
    }

    /// Tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Bundle hashing budget and escalation threshold.
    pub fn with_checksum_budget(mut self, timeout: Duration, max_timeouts: u32) -> Self {
        self.engine = ChecksumEngine::new(timeout);
        self.max_checksum_timeouts = max_timeouts.max(1);
        self
    }

    /// Compute the baselines for this session.
    pub async fn initialize(&self) -> MonitoringSession {
        let baseline_bundle = match self.host.bundle_path() {
            Ok(path) => match self.engine.digest_file_bounded(path).await {
                Ok(checksum) => {
                    debug!(checksum = ?checksum, "Monitor: bundle baseline computed");
                    Some(checksum)
                },
                Err(e) => {
                    error!("Monitor: bundle baseline unavailable, bundle check disabled: {}", e);
                    None
                },
            },
            Err(e) => {
                error!("Monitor: bundle path unavailable, bundle check disabled: {}", e);
                None
            },
        };

        let baseline_native = if self.native.is_present() {
            self.native.pin_checksum()
        } else {
            None
        };

        MonitoringSession {
            baseline_bundle,
            baseline_native,
            interval: self.interval,
            last_check: None,
            consecutive_timeouts: 0,
        }
    }

    /// Run one round of checks.
    pub async fn tick(&self, session: &mut MonitoringSession) -> TickOutcome {
        if let Some(expected) = session.baseline_bundle {
            match self.bundle_checksum().await {
                Ok(current) => {
                    session.consecutive_timeouts = 0;
                    if !current.matches(&expected) {
                        error!(
                            expected = ?expected,
                            actual = ?current,
                            "Monitor: bundle checksum changed"
                        );
                        return TickOutcome::Hard(ViolationRecord::now(
                            ViolationKind::BundleTampered,
                        ));
                    }
                },
                Err(e) => {
                    session.consecutive_timeouts += 1;
                    warn!(
                        consecutive = session.consecutive_timeouts,
                        limit = self.max_checksum_timeouts,
                        "Monitor: bundle check incomplete: {}",
                        e
                    );
                    if session.consecutive_timeouts >= self.max_checksum_timeouts {
                        error!("Monitor: bundle check repeatedly incomplete, escalating");
                        return TickOutcome::Hard(ViolationRecord::now(
                            ViolationKind::BundleTampered,
                        ));
                    }
                    return TickOutcome::Indeterminate;
                },
            }
        }

        if let Some(expected) = session.baseline_native {
            match self.native.compute_checksum() {
                Some(current) if current == expected => {},
                other => {
                    error!(expected, actual = ?other, "Monitor: native checksum changed");
                    return TickOutcome::Hard(ViolationRecord::now(
                        ViolationKind::NativeChecksumMismatch,
                    ));
                },
            }
        }

        match self.host.signing_certificate() {
            Ok(certificate) => {
                if self.identity.verify_signing_certificate(&certificate).is_err() {
                    return TickOutcome::Hard(ViolationRecord::now(
                        ViolationKind::SignatureMismatch,
                    ));
                }
            },
            Err(e) => warn!("Monitor: certificate unavailable this tick: {}", e),
        }

        let mut flexible = Vec::new();
        if let Some(indicator) = self.scanner.hook_indicator(self.host.as_ref()) {
            warn!(indicator = %indicator, "Monitor: hooking framework indicator");
            flexible.push(ViolationRecord::now(ViolationKind::HookingFramework));
        }
        if self.scanner.debugger_attached(self.host.as_ref()) {
            warn!("Monitor: debugger attached");
            flexible.push(ViolationRecord::now(ViolationKind::DebuggerDetected));
        }

        session.last_check = Some(Instant::now());
        if flexible.is_empty() {
            TickOutcome::Clean
        } else {
            TickOutcome::Flexible(flexible)
        }
    }

    async fn bundle_checksum(&self) -> Result<BundleChecksum, GuardError> {
        let path = self.host.bundle_path()?;
        self.engine.digest_file_bounded(path).await
    }

    /// Start the worker thread.
    pub fn spawn(self, on_hard: HardViolationHandler) -> Result<MonitorHandle, GuardError> {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let interval = self.interval;

        let worker_cancel = cancel.clone();
        let worker_ticks = ticks.clone();
        let thread = std::thread::Builder::new()
            .name(MONITOR_THREAD_NAME.into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Monitor: failed to build runtime: {}", e);
                        return;
                    },
                };
                runtime.block_on(self.run(worker_cancel, worker_ticks, on_hard));
                // A bundle read stuck in the kernel (slow storage, a FIFO)
                // must not hold up teardown; leave it to finish on its own.
                runtime.shutdown_background();
            })?;

        info!(?interval, "Tamper monitor started");
        Ok(MonitorHandle {
            cancel,
            ticks,
            thread: Some(thread),
        })
    }

    async fn run(
        self,
        cancel: CancellationToken,
        ticks: Arc<AtomicU64>,
        on_hard: HardViolationHandler,
    ) {
        let mut session = tokio::select! {
            _ = cancel.cancelled() => return,
            session = self.initialize() => session,
        };

        let mut ticker = tokio::time::interval(session.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Monitor: shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Monitor: shutdown requested during tick");
                    break;
                }
                outcome = self.tick(&mut session) => outcome,
            };
            ticks.fetch_add(1, Ordering::SeqCst);

            match outcome {
                TickOutcome::Hard(record) => {
                    error!(kind = ?record.kind, "Monitor: HARD violation, stopping");
                    cancel.cancel();
                    on_hard(record);
                    break;
                },
                TickOutcome::Flexible(records) => {
                    debug!(count = records.len(), "Monitor: flexible findings logged");
                },
                TickOutcome::Clean | TickOutcome::Indeterminate => {},
            }
        }
        debug!("Monitor: loop exited");
    }
}

/// Handle to the running monitor.
pub struct MonitorHandle {
    cancel: CancellationToken,
    ticks: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Ask the loop to stop. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Cancel and wait for the worker to exit.
    ///
    /// Does not wait for a checksum still blocked in the kernel. Called
    /// from the worker itself, this only cancels.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Monitor: worker panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
