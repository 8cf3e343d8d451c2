//! Seam between the lifecycle controller and the OS service manager.
//!
//! One implementation per platform:
//! - Windows: Service Control Manager (Windows API)
//! - macOS: launchd (launchctl)
//! - elsewhere: systemd (systemctl)

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

/// Coarse state an OS service manager reports for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    /// The OS has no service under this name.
    NotRegistered,
    Stopped,
    StartPending,
    Running,
    StopPending,
    /// The service manager itself flags the unit as failed.
    Failed(String),
}

/// Backend failures, classified just enough for the controller to map them
/// onto the public taxonomy. `Os` carries stderr or API error text verbatim.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("service is already registered")]
    AlreadyRegistered,
    #[error("service is not registered")]
    NotRegistered,
    #[error("{0}")]
    Os(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Operations every OS service manager must provide.
///
/// Implementations block until the OS call returns; the controller wraps each
/// call in its own deadline.
pub trait ServiceBackend: Send + Sync {
    /// Register `name` to run `exec` against `config`, without starting it.
    fn register(&self, name: &str, exec: &Path, config: &Path) -> BackendResult<()>;

    /// Remove the registration. Callers stop the service first.
    fn unregister(&self, name: &str) -> BackendResult<()>;

    fn start(&self, name: &str) -> BackendResult<()>;

    fn stop(&self, name: &str) -> BackendResult<()>;

    /// Current state as the OS reports it.
    fn query(&self, name: &str) -> BackendResult<BackendState>;
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        mod windows_backend;
        pub use windows_backend::ScmBackend;
        use windows_backend::ScmBackend as PlatformBackend;
    } else if #[cfg(target_os = "macos")] {
        mod macos_backend;
        pub use macos_backend::LaunchdBackend;
        use macos_backend::LaunchdBackend as PlatformBackend;
    } else {
        mod linux_backend;
        pub use linux_backend::SystemdBackend;
        use linux_backend::SystemdBackend as PlatformBackend;
    }
}

/// Backend speaking to this build target's native service manager.
pub fn platform_backend() -> Arc<dyn ServiceBackend> {
    Arc::new(PlatformBackend::new())
}
