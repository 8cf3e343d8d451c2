//! Config bundle persistence through the public API.
//!
//! Verifies the all-or-none write behavior a host relies on: either every
//! file of a bundle lands, or the previous contents come back, and the
//! credential seal only starts gating actions once the whole bundle is in
//! place.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use xstream_bridge::{
    BackendError, BackendResult, BackendState, Bridge, BridgeConfig, BridgeError, ConfigBundle,
    ConfigFile, ServiceBackend,
};

/// Manager that knows no services; these tests only exercise writes and
/// the credential gate.
struct NoServices;

impl ServiceBackend for NoServices {
    fn register(&self, _: &str, _: &Path, _: &Path) -> BackendResult<()> {
        Ok(())
    }
    fn unregister(&self, _: &str) -> BackendResult<()> {
        Err(BackendError::NotRegistered)
    }
    fn start(&self, _: &str) -> BackendResult<()> {
        Err(BackendError::NotRegistered)
    }
    fn stop(&self, _: &str) -> BackendResult<()> {
        Err(BackendError::NotRegistered)
    }
    fn query(&self, _: &str) -> BackendResult<BackendState> {
        Ok(BackendState::NotRegistered)
    }
}

struct Setup {
    bridge: Bridge,
    dir: TempDir,
}

impl Setup {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let bridge = Bridge::with_backend(
            std::sync::Arc::new(NoServices),
            BridgeConfig {
                seal_path: dir.path().join("credential.seal"),
                ..BridgeConfig::default()
            },
        );
        Setup { bridge, dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn bundle(&self, credential: &str) -> ConfigBundle {
        ConfigBundle {
            xray: ConfigFile::new(self.path("config.json"), r#"{"log":{"loglevel":"warning"}}"#),
            service: ConfigFile::new(self.path("service.json"), r#"{"api_key":"k-123"}"#),
            vpn: ConfigFile::new(self.path("nodes.json"), r#"{"nodes":["a","b"]}"#),
            credential: credential.to_string(),
        }
    }
}

#[test]
fn a_bundle_lands_completely() {
    let setup = Setup::new();
    setup
        .bridge
        .write_config_files(&setup.bundle("pw"))
        .expect("write");

    assert_eq!(
        fs::read_to_string(setup.path("config.json")).unwrap(),
        r#"{"log":{"loglevel":"warning"}}"#
    );
    assert_eq!(
        fs::read_to_string(setup.path("service.json")).unwrap(),
        r#"{"api_key":"k-123"}"#
    );
    assert_eq!(
        fs::read_to_string(setup.path("nodes.json")).unwrap(),
        r#"{"nodes":["a","b"]}"#
    );
    assert!(setup.path("credential.seal").is_file());
}

#[test]
fn a_failed_bundle_leaves_the_previous_contents() {
    let setup = Setup::new();
    fs::write(setup.path("config.json"), "previous xray").unwrap();
    fs::write(setup.path("service.json"), "previous service").unwrap();
    // A directory at the third target sinks the write after the first two
    // files were already replaced.
    fs::create_dir(setup.path("nodes.json")).unwrap();

    let err = setup
        .bridge
        .write_config_files(&setup.bundle("pw"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::WriteError { .. }));

    assert_eq!(
        fs::read_to_string(setup.path("config.json")).unwrap(),
        "previous xray"
    );
    assert_eq!(
        fs::read_to_string(setup.path("service.json")).unwrap(),
        "previous service"
    );
    // The seal is written last, so the failed bundle gates nothing.
    assert!(!setup.path("credential.seal").exists());
    assert!(matches!(
        setup.bridge.perform_action("stop", "pw"),
        Err(BridgeError::Unauthorized)
    ));
}

#[test]
fn rewriting_a_bundle_rotates_the_credential() {
    let setup = Setup::new();
    setup
        .bridge
        .write_config_files(&setup.bundle("old-credential"))
        .expect("first write");
    // Past the gate: the action fails on the missing service, not on auth.
    assert!(matches!(
        setup.bridge.perform_action("stop", "old-credential"),
        Err(BridgeError::NotFound { .. })
    ));

    setup
        .bridge
        .write_config_files(&setup.bundle("new-credential"))
        .expect("second write");
    assert!(matches!(
        setup.bridge.perform_action("stop", "old-credential"),
        Err(BridgeError::Unauthorized)
    ));
    assert!(matches!(
        setup.bridge.perform_action("stop", "new-credential"),
        Err(BridgeError::NotFound { .. })
    ));
}

#[test]
fn the_credential_never_appears_on_disk() {
    let setup = Setup::new();
    let credential = "never-on-disk-credential";
    setup
        .bridge
        .write_config_files(&setup.bundle(credential))
        .expect("write");

    for entry in fs::read_dir(setup.dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.is_file() {
            let content = fs::read_to_string(&path).unwrap();
            assert!(
                !content.contains(credential),
                "{} leaked the credential",
                path.display()
            );
        }
    }
}

#[cfg(unix)]
#[test]
fn secret_bearing_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let setup = Setup::new();
    setup
        .bridge
        .write_config_files(&setup.bundle("pw"))
        .expect("write");

    let mode = |p: PathBuf| fs::metadata(p).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode(setup.path("service.json")), 0o600);
    assert_eq!(mode(setup.path("credential.seal")), 0o600);
    assert_eq!(mode(setup.path("config.json")), 0o644);
}

#[test]
fn an_empty_credential_writes_nothing() {
    let setup = Setup::new();
    let err = setup
        .bridge
        .write_config_files(&setup.bundle(""))
        .unwrap_err();
    assert!(matches!(err, BridgeError::Internal { .. }));
    assert!(!setup.path("config.json").exists());
    assert!(!setup.path("credential.seal").exists());
}
