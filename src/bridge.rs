//! Facade over the service controller, config writer, action dispatcher,
//! and download tracker. The C boundary in [`crate::ffi`] calls this; Rust
//! hosts can embed it directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::actions::ActionDispatcher;
use crate::backend::{self, ServiceBackend};
use crate::config_writer::{ConfigBundle, ConfigWriter};
use crate::controller::{ControllerTimeouts, ServiceController};
use crate::credential::SealedDigestPolicy;
use crate::download::{self, DownloadTracker};
use crate::error::{BridgeError, BridgeResult};
use crate::platform;
use crate::registry::ServiceDescriptor;
use crate::status::{self, ServiceStatus};

/// Knobs for embedding; the defaults match the shipped host app.
pub struct BridgeConfig {
    /// Service the named actions operate on.
    pub service_name: String,
    /// Where the credential seal lives.
    pub seal_path: PathBuf,
    pub timeouts: ControllerTimeouts,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            service_name: platform::DEFAULT_SERVICE_NAME.to_string(),
            seal_path: platform::credential_seal_path(),
            timeouts: ControllerTimeouts::default(),
        }
    }
}

pub struct Bridge {
    controller: Arc<ServiceController>,
    writer: ConfigWriter,
    dispatcher: ActionDispatcher,
    downloads: DownloadTracker,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Bridge over the native service manager of the current OS.
    pub fn new() -> Self {
        Self::with_backend(backend::platform_backend(), BridgeConfig::default())
    }

    pub fn with_backend(backend: Arc<dyn ServiceBackend>, config: BridgeConfig) -> Self {
        let controller = Arc::new(ServiceController::with_timeouts(backend, config.timeouts));
        let policy = Arc::new(SealedDigestPolicy::with_seal_path(&config.seal_path));
        let dispatcher = ActionDispatcher::for_service(
            Arc::clone(&controller),
            policy,
            config.service_name,
        );
        Bridge {
            controller,
            writer: ConfigWriter::with_seal_path(config.seal_path),
            dispatcher,
            downloads: DownloadTracker::new(),
        }
    }

    /// Persist a config bundle all-or-none and seal its credential, which
    /// from then on gates [`perform_action`](Self::perform_action).
    pub fn write_config_files(&self, bundle: &ConfigBundle) -> BridgeResult<()> {
        self.writer.write_bundle(bundle)
    }

    pub fn create_service(&self, name: &str, exec: &Path, config: &Path) -> BridgeResult<()> {
        self.controller.create(name, exec, config)
    }

    pub fn create_windows_service(
        &self,
        name: &str,
        exec: &Path,
        config: &Path,
    ) -> BridgeResult<()> {
        self.controller.create_windows_service(name, exec, config)
    }

    pub fn start_service(&self, name: &str) -> BridgeResult<()> {
        self.controller.start(name)
    }

    pub fn stop_service(&self, name: &str) -> BridgeResult<()> {
        self.controller.stop(name)
    }

    pub fn uninstall_service(&self, name: &str) -> BridgeResult<()> {
        self.controller.uninstall(name)
    }

    pub fn service_status(&self, name: &str) -> BridgeResult<ServiceStatus> {
        self.controller.status(name)
    }

    /// Status collapsed to the boundary's integer form: one code per state,
    /// `-1` for an unknown name, `-2` for any other failure.
    pub fn status_code(&self, name: &str) -> i32 {
        match self.controller.status(name) {
            Ok(current) => current.code(),
            Err(BridgeError::NotFound { .. }) => status::STATUS_NOT_FOUND,
            Err(_) => status::STATUS_ERROR,
        }
    }

    pub fn describe_service(&self, name: &str) -> Option<ServiceDescriptor> {
        self.controller.describe(name)
    }

    /// Run a named privileged action, gated by the sealed credential.
    pub fn perform_action(&self, action: &str, credential: &str) -> BridgeResult<()> {
        self.dispatcher.perform(action, credential)
    }

    /// Install the xray binary out of a downloaded release archive.
    pub fn install_xray_archive(&self, archive: &Path) -> BridgeResult<PathBuf> {
        download::install_archive(&self.downloads, archive)
    }

    /// Handle to the shared download flag, e.g. for a download task.
    pub fn download_tracker(&self) -> DownloadTracker {
        self.downloads.clone()
    }

    pub fn is_downloading(&self) -> bool {
        self.downloads.is_downloading()
    }
}
