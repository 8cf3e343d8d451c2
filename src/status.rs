//! Service lifecycle states and the integer codes reported at the C boundary.

use std::fmt;

/// Code returned when the queried name is known to neither the registry nor
/// the OS.
pub const STATUS_NOT_FOUND: i32 = -1;

/// Code returned when the status query itself failed.
pub const STATUS_ERROR: i32 = -2;

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Nothing observed yet.
    Unknown,
    /// The OS has no registration under this name.
    NotInstalled,
    /// Registered with the OS, never started by this process.
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// A transition failed; the reason is kept verbatim.
    Failed(String),
}

impl ServiceStatus {
    /// Stable integer code for the C boundary. Exactly one code per state.
    pub fn code(&self) -> i32 {
        match self {
            ServiceStatus::Unknown => 0,
            ServiceStatus::NotInstalled => 1,
            ServiceStatus::Installed => 2,
            ServiceStatus::Starting => 3,
            ServiceStatus::Running => 4,
            ServiceStatus::Stopping => 5,
            ServiceStatus::Stopped => 6,
            ServiceStatus::Failed(_) => 7,
        }
    }

    /// True while a mutating operation is mid-flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Stopping)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Unknown => write!(f, "unknown"),
            ServiceStatus::NotInstalled => write!(f, "not installed"),
            ServiceStatus::Installed => write!(f, "installed"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopping => write!(f, "stopping"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}
