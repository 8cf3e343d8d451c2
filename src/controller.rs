//! Service lifecycle state machine.
//!
//! The controller owns the registry and drives every transition through the
//! platform backend. Mutating operations serialize per service name and run
//! each blocking OS call on a worker thread bounded by a deadline, so a hung
//! service manager surfaces as a timeout instead of a stuck caller. Status
//! reads only ever touch snapshots and never wait on an in-flight transition.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use log::{debug, info, warn};

use crate::backend::{BackendError, BackendResult, BackendState, ServiceBackend};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::{ServiceDescriptor, ServiceEntry, ServiceRegistry};
use crate::status::ServiceStatus;

/// Deadlines applied around OS service-manager calls.
#[derive(Debug, Clone, Copy)]
pub struct ControllerTimeouts {
    /// Budget for one blocking backend call.
    pub op: Duration,
    /// Budget for confirming that a start or stop took effect.
    pub confirm: Duration,
    /// Delay between confirmation polls.
    pub poll: Duration,
    /// Budget for the opportunistic refresh inside status reads.
    pub query: Duration,
}

impl Default for ControllerTimeouts {
    fn default() -> Self {
        ControllerTimeouts {
            op: Duration::from_secs(30),
            confirm: Duration::from_secs(20),
            poll: Duration::from_millis(250),
            query: Duration::from_secs(5),
        }
    }
}

pub struct ServiceController {
    registry: ServiceRegistry,
    backend: Arc<dyn ServiceBackend>,
    timeouts: ControllerTimeouts,
}

impl ServiceController {
    pub fn new(backend: Arc<dyn ServiceBackend>) -> Self {
        Self::with_timeouts(backend, ControllerTimeouts::default())
    }

    pub fn with_timeouts(backend: Arc<dyn ServiceBackend>, timeouts: ControllerTimeouts) -> Self {
        ServiceController {
            registry: ServiceRegistry::new(),
            backend,
            timeouts,
        }
    }

    /// Register `name` with the OS without starting it.
    ///
    /// Idempotent for an existing registration under the same paths; a
    /// registration the OS kept across a host restart adopts the caller's
    /// paths.
    pub fn create(&self, name: &str, exec: &Path, config: &Path) -> BridgeResult<()> {
        if name.trim().is_empty() {
            return Err(BridgeError::internal("service name must not be empty"));
        }
        if !exec.is_file() {
            return Err(BridgeError::internal(format!(
                "executable does not exist: {}",
                exec.display()
            )));
        }
        if !config.is_file() {
            return Err(BridgeError::internal(format!(
                "config does not exist: {}",
                config.display()
            )));
        }

        let pre_existing = self.registry.contains(name);
        let entry = self.registry.get_or_insert(name);
        let _op = entry.lock_for_op();
        // A concurrent failed create may have pruned the slot while we waited.
        self.registry.attach(name, &entry);

        let snapshot = entry.snapshot();
        match snapshot.status {
            ServiceStatus::Installed
            | ServiceStatus::Running
            | ServiceStatus::Starting
            | ServiceStatus::Stopping
            | ServiceStatus::Stopped => {
                return match (&snapshot.exec_path, &snapshot.config_path) {
                    (Some(e), Some(c)) if e == exec && c == config => Ok(()),
                    (None, _) | (_, None) => {
                        // Entry adopted from the OS; the caller supplies the paths.
                        entry.update(|d| {
                            d.exec_path = Some(exec.to_path_buf());
                            d.config_path = Some(config.to_path_buf());
                        });
                        Ok(())
                    }
                    _ => Err(BridgeError::AlreadyExists {
                        name: name.to_string(),
                    }),
                };
            }
            ServiceStatus::Unknown | ServiceStatus::NotInstalled | ServiceStatus::Failed(_) => {}
        }

        info!("registering service '{name}'");
        let backend = Arc::clone(&self.backend);
        let (n, e, c) = (name.to_string(), exec.to_path_buf(), config.to_path_buf());
        let outcome = self.call_backend(&format!("register {name}"), self.timeouts.op, move || {
            backend.register(&n, &e, &c)
        });

        match outcome {
            Ok(Ok(())) | Ok(Err(BackendError::AlreadyRegistered)) => {
                entry.update(|d| {
                    d.exec_path = Some(exec.to_path_buf());
                    d.config_path = Some(config.to_path_buf());
                    d.status = ServiceStatus::Installed;
                    d.last_error = None;
                });
                info!("service '{name}' installed");
                Ok(())
            }
            Ok(Err(err)) => {
                if pre_existing {
                    entry.record_failure(&err.to_string());
                } else {
                    self.registry.remove(name);
                }
                Err(BridgeError::internal(format!(
                    "failed to register service '{name}': {err}"
                )))
            }
            Err(err) => {
                if pre_existing {
                    entry.record_failure(&err.to_string());
                } else {
                    self.registry.remove(name);
                }
                Err(err)
            }
        }
    }

    /// Same contract as [`create`](Self::create), explicitly targeting the
    /// Windows Service Control Manager.
    pub fn create_windows_service(
        &self,
        name: &str,
        exec: &Path,
        config: &Path,
    ) -> BridgeResult<()> {
        #[cfg(target_os = "windows")]
        {
            // The platform backend on Windows is the native SCM.
            self.create(name, exec, config)
        }
        #[cfg(not(target_os = "windows"))]
        {
            let _ = (exec, config);
            Err(BridgeError::internal(format!(
                "cannot create Windows service '{name}' on this platform"
            )))
        }
    }

    /// Take `name` to Running, confirming against the OS.
    ///
    /// Starting an already running service succeeds without touching the OS.
    pub fn start(&self, name: &str) -> BridgeResult<()> {
        let entry = self.lookup_or_adopt(name)?;
        let _op = entry.lock_for_op();

        match entry.snapshot().status {
            ServiceStatus::Running => {
                debug!("service '{name}' already running");
                return Ok(());
            }
            ServiceStatus::Failed(reason) => {
                return Err(BridgeError::start_failed(
                    name,
                    format!("service previously failed ({reason}); recreate it before starting"),
                ));
            }
            ServiceStatus::NotInstalled => {
                return Err(BridgeError::start_failed(name, "service is not installed"));
            }
            _ => {}
        }

        entry.set_status(ServiceStatus::Starting);
        info!("starting service '{name}'");

        let backend = Arc::clone(&self.backend);
        let owned = name.to_string();
        let outcome = self.call_backend(&format!("start {name}"), self.timeouts.op, move || {
            backend.start(&owned)
        });

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let reason = err.to_string();
                entry.record_failure(&reason);
                return Err(BridgeError::start_failed(name, reason));
            }
            Err(err) => {
                entry.record_failure(&err.to_string());
                return Err(err);
            }
        }

        self.confirm_started(&entry, name)?;

        entry.update(|d| {
            d.status = ServiceStatus::Running;
            d.last_error = None;
        });
        info!("service '{name}' running");
        Ok(())
    }

    /// Take `name` to Stopped, confirming against the OS.
    ///
    /// Stopping an already stopped (or never started) service succeeds
    /// without touching the OS. Stopping a Failed service is the explicit
    /// recovery path back to Stopped.
    pub fn stop(&self, name: &str) -> BridgeResult<()> {
        let entry = self.lookup_or_adopt(name)?;
        let _op = entry.lock_for_op();

        match entry.snapshot().status {
            ServiceStatus::Stopped | ServiceStatus::Installed | ServiceStatus::NotInstalled => {
                debug!("service '{name}' already stopped");
                return Ok(());
            }
            ServiceStatus::Failed(_) => return self.settle_failed_service(&entry, name),
            _ => {}
        }

        entry.set_status(ServiceStatus::Stopping);
        info!("stopping service '{name}'");

        let backend = Arc::clone(&self.backend);
        let owned = name.to_string();
        let outcome = self.call_backend(&format!("stop {name}"), self.timeouts.op, move || {
            backend.stop(&owned)
        });

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(BackendError::NotRegistered)) => {
                entry.update(|d| {
                    d.status = ServiceStatus::NotInstalled;
                    d.last_error = None;
                });
                return Ok(());
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                entry.record_failure(&reason);
                return Err(BridgeError::stop_failed(name, reason));
            }
            Err(err) => {
                entry.record_failure(&err.to_string());
                return Err(err);
            }
        }

        let note = self.confirm_stopped(&entry, name)?;

        entry.update(|d| {
            d.status = ServiceStatus::Stopped;
            d.last_error = note;
        });
        info!("service '{name}' stopped");
        Ok(())
    }

    /// Current status. Never blocks on a held per-name lock: with a
    /// transition in flight the latest snapshot is returned as-is, otherwise
    /// a short best-effort OS query refreshes it first. Names this process
    /// has never seen are adopted from the OS when it knows them.
    pub fn status(&self, name: &str) -> BridgeResult<ServiceStatus> {
        if let Some(entry) = self.registry.get(name) {
            if let Some(_op) = entry.try_lock_for_op() {
                match self.query_backend(name, self.timeouts.query) {
                    Ok(Ok(state)) => apply_observed_state(&entry, &state),
                    Ok(Err(err)) => debug!("status refresh for '{name}' failed: {err}"),
                    Err(err) => debug!("status refresh for '{name}' timed out: {err}"),
                }
            }
            return Ok(entry.snapshot().status);
        }

        match self.query_backend(name, self.timeouts.query)? {
            Ok(BackendState::NotRegistered) | Err(BackendError::NotRegistered) => {
                Err(BridgeError::not_found(name))
            }
            Ok(state) => {
                let entry = self.registry.get_or_insert(name);
                apply_observed_state(&entry, &state);
                let status = entry.snapshot().status;
                debug!("adopted service '{name}' from the OS ({status})");
                Ok(status)
            }
            Err(err) => Err(BridgeError::internal(format!(
                "failed to query service '{name}': {err}"
            ))),
        }
    }

    /// Stop (best effort), unregister, and forget `name`.
    pub fn uninstall(&self, name: &str) -> BridgeResult<()> {
        let Some(entry) = self.registry.get(name) else {
            return self.uninstall_unknown(name);
        };
        let _op = entry.lock_for_op();

        if matches!(
            entry.snapshot().status,
            ServiceStatus::Running | ServiceStatus::Starting | ServiceStatus::Stopping
        ) {
            let backend = Arc::clone(&self.backend);
            let owned = name.to_string();
            let stopped = self.call_backend(&format!("stop {name}"), self.timeouts.op, move || {
                backend.stop(&owned)
            });
            match stopped {
                Ok(Ok(())) | Ok(Err(BackendError::NotRegistered)) => {}
                Ok(Err(err)) => warn!("stopping '{name}' during uninstall failed: {err}"),
                Err(err) => warn!("stopping '{name}' during uninstall failed: {err}"),
            }
        }

        let backend = Arc::clone(&self.backend);
        let owned = name.to_string();
        let outcome = self.call_backend(
            &format!("unregister {name}"),
            self.timeouts.op,
            move || backend.unregister(&owned),
        );

        match outcome {
            Ok(Ok(())) | Ok(Err(BackendError::NotRegistered)) => {
                self.registry.remove(name);
                info!("service '{name}' uninstalled");
                Ok(())
            }
            Ok(Err(err)) => {
                entry.record_failure(&err.to_string());
                Err(BridgeError::internal(format!(
                    "failed to unregister service '{name}': {err}"
                )))
            }
            Err(err) => {
                entry.record_failure(&err.to_string());
                Err(err)
            }
        }
    }

    /// Snapshot of one descriptor, if this process knows the name.
    pub fn describe(&self, name: &str) -> Option<ServiceDescriptor> {
        self.registry.get(name).map(|entry| entry.snapshot())
    }

    /// Snapshot of every known descriptor.
    pub fn known_services(&self) -> Vec<ServiceDescriptor> {
        self.registry.snapshot_all()
    }

    fn uninstall_unknown(&self, name: &str) -> BridgeResult<()> {
        // Never seen here, but the OS may still hold a registration.
        let backend = Arc::clone(&self.backend);
        let owned = name.to_string();
        let _ = self.call_backend(&format!("stop {name}"), self.timeouts.op, move || {
            backend.stop(&owned)
        });

        let backend = Arc::clone(&self.backend);
        let owned = name.to_string();
        let outcome = self.call_backend(
            &format!("unregister {name}"),
            self.timeouts.op,
            move || backend.unregister(&owned),
        );

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(BackendError::NotRegistered)) => Err(BridgeError::not_found(name)),
            Ok(Err(err)) => Err(BridgeError::internal(format!(
                "failed to unregister service '{name}': {err}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Entry for `name`, adopting it from the OS when this process has never
    /// seen it. A name unknown to both sides is NotFound and leaves no entry.
    fn lookup_or_adopt(&self, name: &str) -> BridgeResult<Arc<ServiceEntry>> {
        if let Some(entry) = self.registry.get(name) {
            return Ok(entry);
        }

        match self.query_backend(name, self.timeouts.query)? {
            Ok(BackendState::NotRegistered) | Err(BackendError::NotRegistered) => {
                Err(BridgeError::not_found(name))
            }
            Ok(state) => {
                let entry = self.registry.get_or_insert(name);
                apply_observed_state(&entry, &state);
                debug!("adopted service '{name}' from the OS");
                Ok(entry)
            }
            Err(err) => Err(BridgeError::internal(format!(
                "failed to query service '{name}': {err}"
            ))),
        }
    }

    fn confirm_started(&self, entry: &Arc<ServiceEntry>, name: &str) -> BridgeResult<()> {
        let deadline = Instant::now() + self.timeouts.confirm;
        loop {
            match self.query_backend(name, self.timeouts.query) {
                Ok(Ok(BackendState::Running)) => return Ok(()),
                Ok(Ok(BackendState::StartPending)) => {}
                Ok(Ok(BackendState::Stopped)) => {
                    let reason = "service exited immediately after start".to_string();
                    entry.record_failure(&reason);
                    return Err(BridgeError::start_failed(name, reason));
                }
                Ok(Ok(BackendState::StopPending)) => {
                    let reason = "service began stopping right after start".to_string();
                    entry.record_failure(&reason);
                    return Err(BridgeError::start_failed(name, reason));
                }
                Ok(Ok(BackendState::Failed(reason))) => {
                    entry.record_failure(&reason);
                    return Err(BridgeError::start_failed(name, reason));
                }
                Ok(Ok(BackendState::NotRegistered)) => {
                    let reason = "service registration disappeared during start".to_string();
                    entry.record_failure(&reason);
                    return Err(BridgeError::start_failed(name, reason));
                }
                Ok(Err(err)) => {
                    let reason = format!("status check failed: {err}");
                    entry.record_failure(&reason);
                    return Err(BridgeError::start_failed(name, reason));
                }
                Err(err) => {
                    entry.record_failure(&err.to_string());
                    return Err(err);
                }
            }

            if Instant::now() >= deadline {
                entry.record_failure("timed out waiting for the service to report running");
                return Err(BridgeError::Timeout {
                    operation: format!("start {name}"),
                });
            }
            std::thread::sleep(self.timeouts.poll);
        }
    }

    /// Wait until the OS agrees the service is down. Returns a note when it
    /// went down less than cleanly.
    fn confirm_stopped(
        &self,
        entry: &Arc<ServiceEntry>,
        name: &str,
    ) -> BridgeResult<Option<String>> {
        let deadline = Instant::now() + self.timeouts.confirm;
        loop {
            match self.query_backend(name, self.timeouts.query) {
                Ok(Ok(BackendState::Stopped)) | Ok(Ok(BackendState::NotRegistered)) => {
                    return Ok(None);
                }
                Ok(Ok(BackendState::Failed(reason))) => return Ok(Some(reason)),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    let reason = format!("status check failed: {err}");
                    entry.record_failure(&reason);
                    return Err(BridgeError::stop_failed(name, reason));
                }
                Err(err) => {
                    entry.record_failure(&err.to_string());
                    return Err(err);
                }
            }

            if Instant::now() >= deadline {
                entry.record_failure("timed out waiting for the service to report stopped");
                return Err(BridgeError::Timeout {
                    operation: format!("stop {name}"),
                });
            }
            std::thread::sleep(self.timeouts.poll);
        }
    }

    fn settle_failed_service(&self, entry: &Arc<ServiceEntry>, name: &str) -> BridgeResult<()> {
        debug!("service '{name}' is failed; stopping whatever is left");

        let backend = Arc::clone(&self.backend);
        let owned = name.to_string();
        let outcome = self.call_backend(&format!("stop {name}"), self.timeouts.op, move || {
            backend.stop(&owned)
        });
        match outcome {
            Ok(Ok(())) | Ok(Err(BackendError::NotRegistered)) => {}
            Ok(Err(err)) => return Err(BridgeError::stop_failed(name, err.to_string())),
            Err(err) => return Err(err),
        }

        // Leave the failed state only once the OS confirms nothing is running.
        match self.query_backend(name, self.timeouts.query) {
            Ok(Ok(BackendState::Stopped))
            | Ok(Ok(BackendState::NotRegistered))
            | Ok(Ok(BackendState::Failed(_))) => {
                entry.update(|d| {
                    d.status = ServiceStatus::Stopped;
                    d.last_error = None;
                });
                info!("service '{name}' recovered to stopped");
                Ok(())
            }
            Ok(Ok(state)) => Err(BridgeError::stop_failed(
                name,
                format!("service still reports {state:?} after stop"),
            )),
            Ok(Err(err)) => Err(BridgeError::stop_failed(name, err.to_string())),
            Err(err) => Err(err),
        }
    }

    fn query_backend(
        &self,
        name: &str,
        budget: Duration,
    ) -> BridgeResult<BackendResult<BackendState>> {
        let backend = Arc::clone(&self.backend);
        let owned = name.to_string();
        self.call_backend(&format!("query {name}"), budget, move || {
            backend.query(&owned)
        })
    }

    /// Run one blocking backend call on a worker thread, bounded by `budget`.
    /// The outer error is Timeout (or a worker failure); the inner result is
    /// the backend's own answer.
    fn call_backend<T, F>(
        &self,
        operation: &str,
        budget: Duration,
        call: F,
    ) -> BridgeResult<BackendResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> BackendResult<T> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name("svc-backend".to_string())
            .spawn(move || {
                let _ = tx.send(call());
            })
            .map_err(|e| {
                BridgeError::internal(format!("failed to spawn worker for {operation}: {e}"))
            })?;

        match rx.recv_timeout(budget) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                warn!("backend call '{operation}' exceeded {budget:?}");
                Err(BridgeError::Timeout {
                    operation: operation.to_string(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::internal(format!(
                "worker for {operation} terminated unexpectedly"
            ))),
        }
    }
}

/// Fold a state observed from the OS into the descriptor. Local knowledge
/// wins where the OS is coarser (an Installed service also reads as plain
/// stopped there); a Failed descriptor stays failed until an operation of
/// record clears it.
fn apply_observed_state(entry: &ServiceEntry, state: &BackendState) {
    entry.update(|d| match state {
        BackendState::Running => d.status = ServiceStatus::Running,
        BackendState::StartPending => d.status = ServiceStatus::Starting,
        BackendState::StopPending => d.status = ServiceStatus::Stopping,
        BackendState::NotRegistered => d.status = ServiceStatus::NotInstalled,
        BackendState::Failed(reason) => {
            d.status = ServiceStatus::Failed(reason.clone());
            d.last_error = Some(reason.clone());
        }
        BackendState::Stopped => match d.status.clone() {
            ServiceStatus::Installed | ServiceStatus::Stopped | ServiceStatus::Failed(_) => {}
            ServiceStatus::Running | ServiceStatus::Starting | ServiceStatus::Stopping => {
                d.status = ServiceStatus::Stopped;
                d.last_error = Some("service exited unexpectedly".to_string());
            }
            ServiceStatus::Unknown | ServiceStatus::NotInstalled => {
                d.status = ServiceStatus::Stopped;
            }
        },
    });
}
