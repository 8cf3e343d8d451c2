//! End-to-end lifecycle tests against an in-memory service manager.
//!
//! These drive the public `Bridge` API the way a host app would, with the
//! OS service manager replaced by an in-memory fake so install, start,
//! stop, status, and the privileged actions can be exercised on any machine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use xstream_bridge::{
    BackendError, BackendResult, BackendState, Bridge, BridgeConfig, BridgeError, ConfigBundle,
    ConfigFile, ControllerTimeouts, ServiceBackend, ServiceStatus,
};

const NODE: &str = "xstream-node";
const CREDENTIAL: &str = "integration-credential";

/// In-memory stand-in for systemd, launchd, or the SCM.
#[derive(Default)]
struct MemoryServiceManager {
    services: Mutex<HashMap<String, BackendState>>,
    start_delay_ms: AtomicU64,
}

impl MemoryServiceManager {
    fn seed(&self, name: &str, state: BackendState) {
        self.services
            .lock()
            .unwrap()
            .insert(name.to_string(), state);
    }

    fn forget(&self, name: &str) {
        self.services.lock().unwrap().remove(name);
    }
}

impl ServiceBackend for MemoryServiceManager {
    fn register(&self, name: &str, _exec: &Path, _config: &Path) -> BackendResult<()> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(name) {
            return Err(BackendError::AlreadyRegistered);
        }
        services.insert(name.to_string(), BackendState::Stopped);
        Ok(())
    }

    fn unregister(&self, name: &str) -> BackendResult<()> {
        self.services
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or(BackendError::NotRegistered)
    }

    fn start(&self, name: &str) -> BackendResult<()> {
        let delay = self.start_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        let mut services = self.services.lock().unwrap();
        let state = services.get_mut(name).ok_or(BackendError::NotRegistered)?;
        *state = BackendState::Running;
        Ok(())
    }

    fn stop(&self, name: &str) -> BackendResult<()> {
        let mut services = self.services.lock().unwrap();
        let state = services.get_mut(name).ok_or(BackendError::NotRegistered)?;
        *state = BackendState::Stopped;
        Ok(())
    }

    fn query(&self, name: &str) -> BackendResult<BackendState> {
        let services = self.services.lock().unwrap();
        Ok(services
            .get(name)
            .cloned()
            .unwrap_or(BackendState::NotRegistered))
    }
}

/// A bridge wired to the in-memory manager plus the scratch files the
/// service points at.
struct TestHost {
    bridge: Bridge,
    manager: Arc<MemoryServiceManager>,
    exec: tempfile::NamedTempFile,
    config: tempfile::NamedTempFile,
    dir: TempDir,
}

impl TestHost {
    fn start() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let manager = Arc::new(MemoryServiceManager::default());
        let bridge = Bridge::with_backend(
            Arc::clone(&manager) as Arc<dyn ServiceBackend>,
            BridgeConfig {
                service_name: NODE.to_string(),
                seal_path: dir.path().join("credential.seal"),
                timeouts: ControllerTimeouts {
                    op: Duration::from_millis(500),
                    confirm: Duration::from_secs(2),
                    poll: Duration::from_millis(10),
                    query: Duration::from_millis(200),
                },
            },
        );
        TestHost {
            bridge,
            manager,
            exec: tempfile::NamedTempFile::new().expect("exec file"),
            config: tempfile::NamedTempFile::new().expect("config file"),
            dir,
        }
    }

    /// Write a config bundle, which also seals `CREDENTIAL` for actions.
    fn seal_credential(&self) {
        let bundle = ConfigBundle {
            xray: ConfigFile::new(self.dir.path().join("config.json"), "{}"),
            service: ConfigFile::new(self.dir.path().join("service.json"), "{}"),
            vpn: ConfigFile::new(self.dir.path().join("nodes.json"), "{}"),
            credential: CREDENTIAL.to_string(),
        };
        self.bridge.write_config_files(&bundle).expect("write bundle");
    }

    fn install(&self) {
        self.bridge
            .create_service(NODE, self.exec.path(), self.config.path())
            .expect("create service");
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn host_walks_the_whole_lifecycle() {
    let host = TestHost::start();
    host.seal_credential();
    host.install();
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Installed
    );

    host.bridge.perform_action("start", CREDENTIAL).expect("start");
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Running
    );

    host.bridge
        .perform_action("restart", CREDENTIAL)
        .expect("restart");
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Running
    );

    host.bridge.stop_service(NODE).expect("stop");
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Stopped
    );

    host.bridge
        .perform_action("uninstall", CREDENTIAL)
        .expect("uninstall");
    assert_eq!(host.bridge.status_code(NODE), -1);
    assert!(host.manager.services.lock().unwrap().is_empty());
}

#[test]
fn start_and_stop_are_idempotent() {
    let host = TestHost::start();
    host.install();

    host.bridge.stop_service(NODE).expect("stop before start");
    host.bridge.start_service(NODE).expect("start");
    host.bridge.start_service(NODE).expect("start again");
    host.bridge.stop_service(NODE).expect("stop");
    host.bridge.stop_service(NODE).expect("stop again");
}

#[test]
fn status_codes_match_the_documented_table() {
    let host = TestHost::start();
    assert_eq!(host.bridge.status_code(NODE), -1);

    host.install();
    assert_eq!(host.bridge.status_code(NODE), 2);

    host.bridge.start_service(NODE).expect("start");
    assert_eq!(host.bridge.status_code(NODE), 4);

    host.bridge.stop_service(NODE).expect("stop");
    assert_eq!(host.bridge.status_code(NODE), 6);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn status_never_blocks_on_a_start_in_flight() {
    let host = TestHost::start();
    host.install();
    host.manager.start_delay_ms.store(300, Ordering::Relaxed);

    thread::scope(|scope| {
        let bridge = &host.bridge;
        let starter = scope.spawn(move || bridge.start_service(NODE));

        // Give the start a moment to take the per-name lock.
        thread::sleep(Duration::from_millis(80));
        let asked = Instant::now();
        let status = host.bridge.service_status(NODE).expect("status");
        let elapsed = asked.elapsed();

        assert_eq!(status, ServiceStatus::Starting);
        assert!(
            elapsed < Duration::from_millis(150),
            "status blocked for {elapsed:?}"
        );

        starter.join().expect("join").expect("start");
    });

    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Running
    );
}

#[test]
fn concurrent_starts_serialize_and_both_succeed() {
    let host = TestHost::start();
    host.install();
    host.manager.start_delay_ms.store(100, Ordering::Relaxed);

    thread::scope(|scope| {
        let bridge = &host.bridge;
        let first = scope.spawn(move || bridge.start_service(NODE));
        let second = scope.spawn(move || bridge.start_service(NODE));
        first.join().expect("join").expect("first start");
        second.join().expect("join").expect("second start");
    });

    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Running
    );
}

#[test]
fn start_racing_stop_settles_in_a_steady_state() {
    let host = TestHost::start();
    host.install();
    host.manager.start_delay_ms.store(30, Ordering::Relaxed);

    // Whichever order the lock hands out, both calls succeed: the loser of
    // the race sees the winner's settled state, never a half-transition.
    thread::scope(|scope| {
        let bridge = &host.bridge;
        let starter = scope.spawn(move || bridge.start_service(NODE));
        let stopper = scope.spawn(move || bridge.stop_service(NODE));
        starter.join().expect("join").expect("start");
        stopper.join().expect("join").expect("stop");
    });

    let settled = host.bridge.service_status(NODE).expect("status");
    assert!(
        matches!(settled, ServiceStatus::Running | ServiceStatus::Stopped),
        "start racing stop left {settled:?}"
    );
}

#[test]
fn hung_manager_calls_time_out_instead_of_wedging_the_name() {
    let host = TestHost::start();
    host.install();
    host.manager.start_delay_ms.store(2_000, Ordering::Relaxed);

    let err = host.bridge.start_service(NODE).unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));
    // Queried before the stuck worker finishes: the failure is visible.
    assert_eq!(host.bridge.status_code(NODE), 7);

    // The name is not wedged: the next operation gets the lock.
    host.manager.start_delay_ms.store(0, Ordering::Relaxed);
    host.bridge.stop_service(NODE).expect("recover to stopped");
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Stopped
    );
}

// ============================================================================
// Restart durability and repair
// ============================================================================

#[test]
fn services_survive_a_host_restart_via_the_os() {
    let host = TestHost::start();
    host.manager.seed("survivor", BackendState::Running);

    // This bridge never created the service, yet it can see and stop it.
    assert_eq!(host.bridge.status_code("survivor"), 4);
    host.bridge.stop_service("survivor").expect("stop survivor");
    assert_eq!(
        host.bridge.service_status("survivor").unwrap(),
        ServiceStatus::Stopped
    );
}

#[test]
fn repair_rebuilds_a_registration_the_os_lost() {
    let host = TestHost::start();
    host.seal_credential();
    host.install();
    host.bridge.start_service(NODE).expect("start");

    // The OS loses the registration behind the bridge's back.
    host.manager.forget(NODE);

    host.bridge
        .perform_action("repair", CREDENTIAL)
        .expect("repair");
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Running
    );
}

// ============================================================================
// Credential gating
// ============================================================================

#[test]
fn actions_require_the_sealed_credential() {
    let host = TestHost::start();
    host.install();

    // Nothing sealed yet: every action is refused and nothing happens.
    let err = host.bridge.perform_action("start", CREDENTIAL).unwrap_err();
    assert!(matches!(err, BridgeError::Unauthorized));
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Installed
    );

    host.seal_credential();
    host.bridge.perform_action("start", CREDENTIAL).expect("start");

    let err = host.bridge.perform_action("stop", "wrong").unwrap_err();
    assert!(matches!(err, BridgeError::Unauthorized));
    assert_eq!(
        host.bridge.service_status(NODE).unwrap(),
        ServiceStatus::Running
    );
}

#[test]
fn unknown_actions_are_rejected_after_the_credential_check() {
    let host = TestHost::start();
    host.seal_credential();

    let err = host.bridge.perform_action("defrag", CREDENTIAL).unwrap_err();
    assert!(matches!(err, BridgeError::UnknownAction { .. }));

    let err = host.bridge.perform_action("defrag", "wrong").unwrap_err();
    assert!(matches!(err, BridgeError::Unauthorized));
}
