//! Process-wide download state and binary installation.
//!
//! The host asks one question here, cheaply and without locks: is an xray
//! download in flight right now. The tracker is a shared atomic flag; the
//! guard ties the Downloading window to a scope so no code path can forget
//! to clear it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::error::{BridgeError, BridgeResult};
use crate::platform;

const IDLE: u8 = 0;
const DOWNLOADING: u8 = 1;
const FAILED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Downloading,
    Failed,
}

/// Shared flag describing the xray download. Clones observe the same state.
#[derive(Clone, Default)]
pub struct DownloadTracker {
    state: Arc<AtomicU8>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DownloadState {
        match self.state.load(Ordering::SeqCst) {
            DOWNLOADING => DownloadState::Downloading,
            FAILED => DownloadState::Failed,
            _ => DownloadState::Idle,
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.state.load(Ordering::SeqCst) == DOWNLOADING
    }

    /// Record that the in-flight download failed. Readers keep seeing Failed
    /// until the next download begins.
    pub fn mark_failed(&self) {
        self.state.store(FAILED, Ordering::SeqCst);
    }
}

/// Scope marker for one download. Readers see Downloading while it lives.
pub struct DownloadGuard {
    tracker: DownloadTracker,
}

impl DownloadGuard {
    pub fn begin(tracker: &DownloadTracker) -> DownloadGuard {
        tracker.state.store(DOWNLOADING, Ordering::SeqCst);
        DownloadGuard {
            tracker: tracker.clone(),
        }
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        // A failure recorded during the download sticks; otherwise back to idle.
        let _ = self.tracker.state.compare_exchange(
            DOWNLOADING,
            IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Unpack the platform's xray binary from a release archive into its per-OS
/// install location. The tracker reads Downloading for the duration.
pub fn install_archive(tracker: &DownloadTracker, archive: &Path) -> BridgeResult<PathBuf> {
    install_archive_to(tracker, archive, &platform::xray_executable_path())
}

/// Same as [`install_archive`] with an explicit destination.
pub fn install_archive_to(
    tracker: &DownloadTracker,
    archive: &Path,
    destination: &Path,
) -> BridgeResult<PathBuf> {
    let _guard = DownloadGuard::begin(tracker);
    match extract_binary(archive, destination) {
        Ok(bytes) => {
            info!(
                "installed {} ({bytes} bytes) from {}",
                destination.display(),
                archive.display()
            );
            Ok(destination.to_path_buf())
        }
        Err(err) => {
            tracker.mark_failed();
            Err(err)
        }
    }
}

fn extract_binary(archive: &Path, destination: &Path) -> BridgeResult<u64> {
    let wanted = platform::xray_binary_name();

    let file = fs::File::open(archive)
        .map_err(|e| BridgeError::internal(format!("open {}: {e}", archive.display())))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| BridgeError::internal(format!("read {}: {e}", archive.display())))?;

    // Release archives sometimes nest the binary under a versioned directory.
    let mut index = None;
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| BridgeError::internal(format!("read {}: {e}", archive.display())))?;
        let name = entry.name().to_string();
        drop(entry);
        if name == wanted || name.ends_with(&format!("/{wanted}")) {
            debug!("found {wanted} in archive as {name}");
            index = Some(i);
            break;
        }
    }
    let Some(index) = index else {
        return Err(BridgeError::internal(format!(
            "archive {} does not contain {wanted}",
            archive.display()
        )));
    };

    let mut entry = zip
        .by_index(index)
        .map_err(|e| BridgeError::internal(format!("read {}: {e}", archive.display())))?;

    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| {
        BridgeError::write_error(destination, format!("create install directory: {e}"))
    })?;

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| BridgeError::write_error(destination, format!("stage binary: {e}")))?;
    let bytes = io::copy(&mut entry, &mut temp)
        .map_err(|e| BridgeError::write_error(destination, format!("extract binary: {e}")))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| BridgeError::write_error(destination, format!("sync binary: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o755))
            .map_err(|e| {
                BridgeError::write_error(destination, format!("set permissions: {e}"))
            })?;
    }

    temp.persist(destination)
        .map_err(|e| BridgeError::write_error(destination, format!("persist: {}", e.error)))?;
    Ok(bytes)
}
