//! Per-OS policy: where the xray binary and Xstream state live, and what the
//! node service is called.
//!
//! These locations match what the desktop app has always shipped with, so a
//! bridge built from this crate finds binaries installed by older releases.

use std::path::PathBuf;

/// Name the node service registers under when the host does not pick one.
pub const DEFAULT_SERVICE_NAME: &str = "xstream-node";

/// File name of the proxy binary on this platform.
pub fn xray_binary_name() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "xray.exe"
    }
    #[cfg(not(target_os = "windows"))]
    {
        "xray"
    }
}

/// Absolute path the xray binary is installed to.
pub fn xray_executable_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let program_files =
            std::env::var("ProgramFiles").unwrap_or_else(|_| r"C:\Program Files".to_string());
        PathBuf::from(program_files).join("Xstream").join("xray.exe")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/usr/local/bin/xray")
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        PathBuf::from("/opt/bin/xray")
    }
}

/// Directory holding node configs and the credential seal.
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let program_data =
            std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        PathBuf::from(program_data).join("Xstream")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/usr/local/var/xstream")
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        PathBuf::from("/var/lib/xstream")
    }
}

/// Config file the node service is launched against by default.
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Location of the sealed credential digest.
pub fn credential_seal_path() -> PathBuf {
    data_dir().join("credential.seal")
}
