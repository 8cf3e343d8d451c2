//! Atomic multi-file configuration writes.
//!
//! A node rollout lands three text files plus the credential seal together.
//! Either every target ends up with its new content or none does: all
//! artifacts are staged as temp files in their target directories first,
//! existing targets are snapshotted, and a failure during the rename phase
//! restores whatever had already been replaced.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use tempfile::NamedTempFile;

use crate::credential::CredentialSeal;
use crate::error::{BridgeError, BridgeResult};
use crate::platform;

/// One target file and the content that should land there.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub content: String,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        ConfigFile {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// The three files one rollout writes together, plus the credential that
/// gates later privileged actions.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    /// Core proxy configuration.
    pub xray: ConfigFile,
    /// Service wrapper configuration; carries secrets, kept owner-only.
    pub service: ConfigFile,
    /// Node endpoint configuration.
    pub vpn: ConfigFile,
    pub credential: String,
}

pub struct ConfigWriter {
    seal_path: PathBuf,
}

impl Default for ConfigWriter {
    fn default() -> Self {
        ConfigWriter {
            seal_path: platform::credential_seal_path(),
        }
    }
}

struct Target<'a> {
    path: &'a Path,
    content: &'a str,
    sensitive: bool,
}

/// What stood at a target path before it was replaced.
struct Snapshot {
    path: PathBuf,
    prior: Option<(Vec<u8>, fs::Permissions)>,
}

impl ConfigWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal location override, mainly for tests.
    pub fn with_seal_path(seal_path: impl Into<PathBuf>) -> Self {
        ConfigWriter {
            seal_path: seal_path.into(),
        }
    }

    /// Write all bundle files and the credential seal, all-or-none.
    ///
    /// The rename order puts the seal last, so a bundle only starts gating
    /// actions once all of its files are in place. On failure the error names
    /// the exact path that could not be written.
    pub fn write_bundle(&self, bundle: &ConfigBundle) -> BridgeResult<()> {
        if bundle.credential.trim().is_empty() {
            return Err(BridgeError::internal("credential must not be empty"));
        }
        for file in [&bundle.xray, &bundle.service, &bundle.vpn] {
            if file.path.as_os_str().is_empty() {
                return Err(BridgeError::internal("config file path must not be empty"));
            }
        }

        let seal = CredentialSeal::for_credential(&bundle.credential);
        let seal_json = serde_json::to_string_pretty(&seal)
            .map_err(|e| BridgeError::internal(format!("failed to encode credential seal: {e}")))?;

        let targets = [
            Target {
                path: &bundle.xray.path,
                content: &bundle.xray.content,
                sensitive: false,
            },
            Target {
                path: &bundle.service.path,
                content: &bundle.service.content,
                sensitive: true,
            },
            Target {
                path: &bundle.vpn.path,
                content: &bundle.vpn.content,
                sensitive: false,
            },
            Target {
                path: &self.seal_path,
                content: &seal_json,
                sensitive: true,
            },
        ];

        // Stage everything before touching any target.
        let mut staged = Vec::with_capacity(targets.len());
        for target in &targets {
            staged.push(stage(target)?);
        }

        // Remember current contents so a late failure can restore them.
        let mut snapshots = Vec::with_capacity(targets.len());
        for target in &targets {
            snapshots.push(snapshot_existing(target.path)?);
        }

        // Rename into place. Unpersisted temps clean themselves up on drop.
        for (index, temp) in staged.into_iter().enumerate() {
            let target = &targets[index];
            if let Err(e) = temp.persist(target.path) {
                warn!(
                    "persisting {} failed, restoring {} already replaced file(s)",
                    target.path.display(),
                    index
                );
                roll_back(&snapshots[..index]);
                return Err(BridgeError::write_error(
                    target.path,
                    format!("persist: {}", e.error),
                ));
            }
        }

        info!(
            "wrote {} config files and sealed the credential",
            targets.len() - 1
        );
        Ok(())
    }
}

/// Write `target`'s content to a temp file in its final directory.
fn stage(target: &Target<'_>) -> BridgeResult<NamedTempFile> {
    let parent = match target.path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| {
        BridgeError::write_error(target.path, format!("create parent directory: {e}"))
    })?;

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| BridgeError::write_error(target.path, format!("stage temp file: {e}")))?;
    temp.write_all(target.content.as_bytes())
        .map_err(|e| BridgeError::write_error(target.path, format!("write temp file: {e}")))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| BridgeError::write_error(target.path, format!("sync temp file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if target.sensitive { 0o600 } else { 0o644 };
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| {
                BridgeError::write_error(target.path, format!("set permissions: {e}"))
            })?;
    }

    Ok(temp)
}

fn snapshot_existing(path: &Path) -> BridgeResult<Snapshot> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            let bytes = fs::read(path).map_err(|e| {
                BridgeError::write_error(path, format!("snapshot existing file: {e}"))
            })?;
            Ok(Snapshot {
                path: path.to_path_buf(),
                prior: Some((bytes, meta.permissions())),
            })
        }
        _ => Ok(Snapshot {
            path: path.to_path_buf(),
            prior: None,
        }),
    }
}

/// Best-effort restoration of already replaced targets, newest first.
fn roll_back(replaced: &[Snapshot]) {
    for snapshot in replaced.iter().rev() {
        let outcome = match &snapshot.prior {
            Some((bytes, permissions)) => fs::write(&snapshot.path, bytes)
                .and_then(|_| fs::set_permissions(&snapshot.path, permissions.clone())),
            None => match fs::remove_file(&snapshot.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };
        if let Err(e) = outcome {
            warn!("rollback of {} failed: {e}", snapshot.path.display());
        }
    }
}
