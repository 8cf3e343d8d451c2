//! Bridge between a host application and a managed xray node service.
//!
//! The host talks to one [`Bridge`]: it writes config bundles atomically,
//! drives the service through install, start, stop, and uninstall on the
//! native service manager (systemd, launchd, or the Windows SCM), answers
//! status probes without blocking on in-flight transitions, runs
//! credential-gated composite actions, and reports whether an xray download
//! is in flight. The [`ffi`] module exposes the same operations over a C ABI
//! for non-Rust hosts.

pub mod actions;
pub mod backend;
pub mod bridge;
pub mod config_writer;
pub mod controller;
pub mod credential;
pub mod download;
pub mod error;
pub mod ffi;
pub mod platform;
pub mod registry;
pub mod status;

pub use actions::{Action, ActionDispatcher};
pub use backend::{BackendError, BackendResult, BackendState, ServiceBackend};
pub use bridge::{Bridge, BridgeConfig};
pub use config_writer::{ConfigBundle, ConfigFile, ConfigWriter};
pub use controller::{ControllerTimeouts, ServiceController};
pub use credential::{CredentialPolicy, CredentialSeal, SealedDigestPolicy};
pub use download::{DownloadGuard, DownloadState, DownloadTracker};
pub use error::{BridgeError, BridgeResult};
pub use registry::{ServiceDescriptor, ServiceRegistry};
pub use status::ServiceStatus;
