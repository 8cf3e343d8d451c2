//! Credential-gated composite actions.
//!
//! The host app drives the managed node service through a small closed set of
//! named actions. Every request is authorized first; a rejected credential
//! leaves no trace. Composites build on the controller and surface the
//! failing step's error verbatim, leaving state where that step left it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use log::{info, warn};

use crate::controller::ServiceController;
use crate::credential::CredentialPolicy;
use crate::error::{BridgeError, BridgeResult};
use crate::platform;

/// The closed set of privileged actions a host can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Start,
    Stop,
    Restart,
    Uninstall,
    Repair,
}

impl FromStr for Action {
    type Err = BridgeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "install" => Ok(Action::Install),
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "restart" => Ok(Action::Restart),
            "uninstall" => Ok(Action::Uninstall),
            // Older hosts say "reinstall".
            "repair" | "reinstall" => Ok(Action::Repair),
            _ => Err(BridgeError::UnknownAction {
                action: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Install => "install",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Uninstall => "uninstall",
            Action::Repair => "repair",
        };
        f.write_str(name)
    }
}

pub struct ActionDispatcher {
    controller: Arc<ServiceController>,
    policy: Arc<dyn CredentialPolicy>,
    service_name: String,
}

impl ActionDispatcher {
    pub fn new(controller: Arc<ServiceController>, policy: Arc<dyn CredentialPolicy>) -> Self {
        Self::for_service(controller, policy, platform::DEFAULT_SERVICE_NAME)
    }

    pub fn for_service(
        controller: Arc<ServiceController>,
        policy: Arc<dyn CredentialPolicy>,
        service_name: impl Into<String>,
    ) -> Self {
        ActionDispatcher {
            controller,
            policy,
            service_name: service_name.into(),
        }
    }

    /// Authorize `credential`, parse `action`, run it.
    ///
    /// The credential check comes first: an unauthorized caller learns
    /// nothing, not even whether the action name exists.
    pub fn perform(&self, action: &str, credential: &str) -> BridgeResult<()> {
        self.policy.authorize(credential)?;
        let action: Action = action.parse()?;
        info!("performing '{action}' on '{}'", self.service_name);

        match action {
            Action::Install => self.install(),
            Action::Start => self.controller.start(&self.service_name),
            Action::Stop => self.controller.stop(&self.service_name),
            Action::Restart => self.restart(),
            Action::Uninstall => self.controller.uninstall(&self.service_name),
            Action::Repair => self.repair(),
        }
    }

    /// Paths for a fresh registration: whatever the registry remembers,
    /// falling back to the per-OS defaults.
    fn resolved_paths(&self) -> (PathBuf, PathBuf) {
        match self.controller.describe(&self.service_name) {
            Some(descriptor) => (
                descriptor
                    .exec_path
                    .unwrap_or_else(platform::xray_executable_path),
                descriptor
                    .config_path
                    .unwrap_or_else(platform::default_config_path),
            ),
            None => (
                platform::xray_executable_path(),
                platform::default_config_path(),
            ),
        }
    }

    fn install(&self) -> BridgeResult<()> {
        let (exec, config) = self.resolved_paths();
        self.controller.create(&self.service_name, &exec, &config)
    }

    fn restart(&self) -> BridgeResult<()> {
        self.controller.stop(&self.service_name)?;
        self.controller.start(&self.service_name)
    }

    /// Tear down whatever half-state exists, then rebuild and start.
    /// Teardown problems are tolerated; the rebuild is not.
    fn repair(&self) -> BridgeResult<()> {
        // Capture paths before the teardown forgets them.
        let (exec, config) = self.resolved_paths();

        match self.controller.uninstall(&self.service_name) {
            Ok(()) | Err(BridgeError::NotFound { .. }) => {}
            Err(err) => warn!(
                "repair teardown of '{}' tolerated a failure: {err}",
                self.service_name
            ),
        }

        self.controller
            .create(&self.service_name, &exec, &config)?;
        self.controller.start(&self.service_name)
    }
}
