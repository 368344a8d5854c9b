//! Startup sequence, secret gating and the lock transition.
//!
//! [`SecurityContext`] is built once at process start and owns every
//! collaborator. [`SecurityOrchestrator`] runs the ordered startup
//! sequence over it, starts the tamper monitor, and re-validates before
//! releasing the protected secret.
//!
//! Startup order, each HARD failure short-circuiting the rest:
//!
//! 1. load the persisted lock state (locked: stop here)
//! 2. package identity
//! 3. signing certificate
//! 4. native identity, integrity and checksum (when the module is present)
//! 5. start the tamper monitor
//! 6. backend origin (fail open on connectivity errors)
//! 7. environment anomalies, logged only

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::backend::{BackendBindingVerifier, OriginResolver};
use crate::baseline::IdentityBaseline;
use crate::config::{GuardConfig, ResponseStrategy};
use crate::error::GuardError;
use crate::host::{HostPlatform, RuntimeSnapshot};
use crate::identity::IdentityVerifier;
use crate::lock_state::{
    lock_message, FileLockStore, LockController, LockReason, LockState, LockStateStore,
    UnlockGrant,
};
use crate::monitor::{MonitorHandle, TamperMonitor};
use crate::native::NativeAttestationBridge;
use crate::secret::ProtectedSecret;
use crate::security::{EnvironmentReport, EnvironmentScanner};

/// Called after the lock is persisted when the strategy is `Terminate`.
pub type Terminator = Arc<dyn Fn(LockReason) + Send + Sync>;

/// Every collaborator of the enforcement layer, built once.
pub struct SecurityContext {
    config: GuardConfig,
    baseline: IdentityBaseline,
    identity: IdentityVerifier,
    backend: BackendBindingVerifier,
    host: Arc<dyn HostPlatform>,
    native: Arc<NativeAttestationBridge>,
    resolver: Arc<dyn OriginResolver>,
    lock: LockController,
    scanner: EnvironmentScanner,
    terminator: Terminator,
}

impl SecurityContext {
    /// Start building a context.
    pub fn builder(
        config: GuardConfig,
        baseline: IdentityBaseline,
        host: Arc<dyn HostPlatform>,
        resolver: Arc<dyn OriginResolver>,
    ) -> SecurityContextBuilder {
        SecurityContextBuilder {
            config,
            baseline,
            host,
            resolver,
            native: None,
            store: None,
            scanner: None,
            terminator: None,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Baseline in use.
    pub fn baseline(&self) -> &IdentityBaseline {
        &self.baseline
    }

    /// Native bridge.
    pub fn native(&self) -> &NativeAttestationBridge {
        &self.native
    }

    /// Lock controller.
    pub fn lock(&self) -> &LockController {
        &self.lock
    }

    /// Apply the response strategy for a HARD violation.
    ///
    /// The lock is persisted first, so it survives a terminated process.
    pub fn enforce(&self, reason: LockReason) -> LockState {
        let state = self.lock.lock(reason);
        if self.config.response == ResponseStrategy::Terminate {
            error!(reason = ?state.reason, "Terminating after HARD violation");
            (self.terminator)(state.reason);
        }
        state
    }

    /// Steps 2 through 4, and 6 when `with_backend` is set.
    fn run_hard_checks(&self, with_backend: bool) -> Result<RuntimeSnapshot, GuardError> {
        let snapshot = self.identity.verify_host(self.host.as_ref())?;
        self.run_native_checks(&snapshot)?;
        if with_backend {
            self.backend.verify(self.resolver.as_ref())?;
        }
        Ok(snapshot)
    }

    fn run_native_checks(&self, snapshot: &RuntimeSnapshot) -> Result<(), GuardError> {
        if !self.native.is_present() {
            debug!("Native module absent, native checks skipped");
            return Ok(());
        }

        let package = snapshot.package_name.as_deref().unwrap_or_default();
        if !self.native.verify_identity(package) {
            error!("Native identity check failed");
            return Err(GuardError::PackageMismatch);
        }
        if !self.native.verify_integrity() {
            error!("Native integrity check failed");
            return Err(GuardError::CodeTampering {
                detail: "native integrity".into(),
            });
        }
        if self.native.pin_checksum().is_none() || !self.native.checksum_matches() {
            return Err(GuardError::CodeTampering {
                detail: "native checksum".into(),
            });
        }
        Ok(())
    }

    fn release_secret(&self, snapshot: &RuntimeSnapshot) -> Result<ProtectedSecret, GuardError> {
        let (Some(package), Some(digest)) =
            (snapshot.package_name.as_deref(), snapshot.certificate_digest.as_ref())
        else {
            return Err(GuardError::SecretUnavailable {
                reason: "runtime identity incomplete".into(),
            });
        };

        if self.native.is_present() {
            return self.native.fetch_secret(package, digest);
        }

        match self.baseline.sealed_secret() {
            Some(sealed) => sealed.unseal(digest),
            None => Err(GuardError::SecretUnavailable {
                reason: "no sealed secret in baseline".into(),
            }),
        }
    }
}

/// Builder for [`SecurityContext`].
pub struct SecurityContextBuilder {
    config: GuardConfig,
    baseline: IdentityBaseline,
    host: Arc<dyn HostPlatform>,
    resolver: Arc<dyn OriginResolver>,
    native: Option<NativeAttestationBridge>,
    store: Option<Box<dyn LockStateStore>>,
    scanner: Option<EnvironmentScanner>,
    terminator: Option<Terminator>,
}

impl SecurityContextBuilder {
    /// Use this bridge instead of loading `config.native_module_path`.
    pub fn native(mut self, bridge: NativeAttestationBridge) -> Self {
        self.native = Some(bridge);
        self
    }

    /// Use this store instead of the one implied by `config.state_dir`.
    pub fn lock_store(mut self, store: Box<dyn LockStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this environment scanner.
    pub fn scanner(mut self, scanner: EnvironmentScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Use this terminator for `ResponseStrategy::Terminate`.
    pub fn terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Validate configuration and assemble the context.
    ///
    /// The lock record must be durable: without an explicit store,
    /// `config.state_dir` is required.
    pub fn build(self) -> Result<SecurityContext, GuardError> {
        self.config.validate()?;

        let native = self.native.unwrap_or_else(|| {
            NativeAttestationBridge::load(
                self.config.native_module_path.as_deref(),
                self.baseline.native_checksum(),
            )
        });

        let store: Box<dyn LockStateStore> = match (self.store, &self.config.state_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Box::new(FileLockStore::new(dir, &self.config.installation_id)),
            (None, None) => {
                return Err(GuardError::Config {
                    message: "state_dir is required unless a lock store is supplied".into(),
                });
            },
        };
        let lock = LockController::new(
            store,
            self.config.installation_id.clone(),
            self.baseline.unlock_key().copied(),
        );

        Ok(SecurityContext {
            identity: IdentityVerifier::new(self.baseline.clone()),
            backend: BackendBindingVerifier::new(self.baseline.backend_origin().clone()),
            host: self.host,
            native: Arc::new(native),
            resolver: self.resolver,
            lock,
            scanner: self.scanner.unwrap_or_default(),
            terminator: self.terminator.unwrap_or_else(|| Arc::new(exit_process)),
            config: self.config,
            baseline: self.baseline,
        })
    }
}

fn exit_process(_reason: LockReason) {
    std::process::exit(1)
}

/// Drives the startup sequence and gates the protected secret.
pub struct SecurityOrchestrator {
    context: Arc<SecurityContext>,
    monitor: Mutex<Option<MonitorHandle>>,
    last_verified: Mutex<Option<Instant>>,
}

impl SecurityOrchestrator {
    /// Wrap a context.
    pub fn new(context: SecurityContext) -> Self {
        Self {
            context: Arc::new(context),
            monitor: Mutex::new(None),
            last_verified: Mutex::new(None),
        }
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<SecurityContext> {
        &self.context
    }

    /// Run the startup sequence. Returns the resulting lock state.
    pub fn start(&self) -> LockState {
        let state = self.context.lock.load();
        if state.locked {
            info!(
                reason = ?state.reason,
                "Installation locked; verification skipped"
            );
            return state;
        }

        if let Err(e) = self.context.run_hard_checks(false) {
            return self.handle_failure(&e).unwrap_or_else(|| self.context.lock.current());
        }

        self.start_monitor();

        if let Err(e) = self.context.backend.verify(self.context.resolver.as_ref()) {
            return self.handle_failure(&e).unwrap_or_else(|| self.context.lock.current());
        }

        let report = self.scan_environment();
        if !report.is_clean() {
            info!(
                anomalies = report.anomalies().len(),
                "Environment anomalies logged; access unaffected"
            );
        }

        self.mark_verified();
        info!("Startup verification passed");
        self.context.lock.current()
    }

    /// Re-run steps 2 through 4 and 6 now.
    pub fn verify_now(&self) -> Result<(), GuardError> {
        let state = self.context.lock.current();
        if state.locked {
            return Err(GuardError::Locked {
                reason: state.reason,
            });
        }
        match self.context.run_hard_checks(true) {
            Ok(_) => {
                self.mark_verified();
                Ok(())
            },
            Err(e) => {
                self.handle_failure(&e);
                Err(e)
            },
        }
    }

    /// Release the protected secret.
    ///
    /// Locked: errors at once, without running any check. Otherwise the
    /// identity checks are re-run when the last verification is older
    /// than `revalidation_ttl`.
    pub fn fetch_secret(&self) -> Result<ProtectedSecret, GuardError> {
        self.ensure_unlocked()?;

        let snapshot = if self.needs_revalidation() {
            debug!("Revalidating before secret release");
            match self.context.run_hard_checks(true) {
                Ok(snapshot) => {
                    self.mark_verified();
                    snapshot
                },
                Err(e) => {
                    self.handle_failure(&e);
                    self.ensure_unlocked()?;
                    return Err(e);
                },
            }
        } else {
            RuntimeSnapshot::capture_identity(self.context.host.as_ref())
        };

        // The monitor may have locked in the meantime.
        self.ensure_unlocked()?;
        self.context.release_secret(&snapshot)
    }

    /// Backend certificate pins, only while unlocked.
    pub fn certificate_pins(&self) -> Result<Vec<String>, GuardError> {
        self.ensure_unlocked()?;
        Ok(self.context.baseline.certificate_pins().to_vec())
    }

    /// Whether the installation is locked.
    pub fn is_locked(&self) -> bool {
        self.context.lock.is_locked()
    }

    /// Current lock reason (`None` while unlocked).
    pub fn lock_reason(&self) -> LockReason {
        self.context.lock.current().reason
    }

    /// Current lock record.
    pub fn lock_state(&self) -> LockState {
        self.context.lock.current()
    }

    /// User-facing message for the current lock reason.
    pub fn lock_message(&self) -> &'static str {
        lock_message(self.lock_reason())
    }

    /// Support string describing the lock.
    pub fn technical_details(&self) -> String {
        self.context.lock.technical_details()
    }

    /// Clear the lock with a backend-signed grant.
    pub fn reset(&self, grant: &UnlockGrant) -> Result<(), GuardError> {
        self.context.lock.reset(grant)?;
        if let Ok(mut last) = self.last_verified.lock() {
            *last = None;
        }
        Ok(())
    }

    /// Run the FLEXIBLE probes and log them.
    pub fn scan_environment(&self) -> EnvironmentReport {
        let report = self.context.scanner.scan(self.context.host.as_ref());
        report.log();
        report
    }

    /// Whether the tamper monitor is running.
    pub fn monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .map(|m| m.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the tamper monitor and wait for it.
    pub fn shutdown(&self) {
        let handle = self.monitor.lock().ok().and_then(|mut m| m.take());
        if let Some(mut handle) = handle {
            handle.shutdown();
            debug!("Tamper monitor stopped");
        }
    }

    fn ensure_unlocked(&self) -> Result<(), GuardError> {
        let state = self.context.lock.current();
        if state.locked {
            return Err(GuardError::Locked {
                reason: state.reason,
            });
        }
        Ok(())
    }

    fn needs_revalidation(&self) -> bool {
        match self.last_verified.lock() {
            Ok(last) => last.map_or(true, |at| at.elapsed() > self.context.config.revalidation_ttl),
            Err(_) => true,
        }
    }

    fn mark_verified(&self) {
        if let Ok(mut last) = self.last_verified.lock() {
            *last = Some(Instant::now());
        }
    }

    /// Lock for a HARD error and stop the monitor. `None` for other errors.
    fn handle_failure(&self, e: &GuardError) -> Option<LockState> {
        let Some(reason) = e.lock_reason() else {
            error!("Verification error without lock mapping: {}", e);
            return None;
        };
        let state = self.context.enforce(reason);
        let stopped = self.monitor.lock().ok().and_then(|mut m| m.take());
        if let Some(handle) = stopped {
            handle.cancel();
        }
        if let Ok(mut last) = self.last_verified.lock() {
            *last = None;
        }
        Some(state)
    }

    fn start_monitor(&self) {
        let mut slot = match self.monitor.lock() {
            Ok(slot) => slot,
            Err(_) => {
                error!("Monitor slot poisoned; tamper monitor not started");
                return;
            },
        };
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() && !handle.is_cancelled() {
                debug!("Tamper monitor already running");
                return;
            }
            debug!("Replacing stopped tamper monitor");
            *slot = None;
        }

        let config = &self.context.config;
        let monitor = TamperMonitor::new(
            self.context.host.clone(),
            self.context.native.clone(),
            self.context.identity.clone(),
            self.context.scanner.clone(),
        )
        .with_interval(config.monitor_interval)
        .with_checksum_budget(config.checksum_timeout, config.max_checksum_timeouts);

        let context = Arc::clone(&self.context);
        let on_hard = Box::new(move |record: crate::types::ViolationRecord| {
            let reason = record.kind.lock_reason().unwrap_or(LockReason::Unknown);
            context.enforce(reason);
        });

        match monitor.spawn(on_hard) {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!("Failed to start tamper monitor: {}", e),
        }
    }
}

impl Drop for SecurityOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.monitor.lock() {
            if let Some(handle) = slot.as_mut() {
                handle.cancel();
            }
        }
    }
}
