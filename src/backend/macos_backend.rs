//! launchd backend driven through launchctl.
//!
//! Jobs are written to `/Library/LaunchDaemons` with `RunAtLoad` off; the
//! controller decides when the proxy runs. Modern bootstrap/bootout calls are
//! used first, with legacy load/unload fallbacks for older macOS releases.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use log::debug;
use plist::Value;

use super::{BackendError, BackendResult, BackendState, ServiceBackend};

const DAEMONS_DIR: &str = "/Library/LaunchDaemons";

pub struct LaunchdBackend {
    daemons_dir: PathBuf,
    launchctl: Option<PathBuf>,
}

impl LaunchdBackend {
    pub fn new() -> Self {
        Self::with_daemons_dir(DAEMONS_DIR)
    }

    /// Backend writing job plists under `daemons_dir` instead of the system
    /// location.
    pub fn with_daemons_dir(daemons_dir: impl Into<PathBuf>) -> Self {
        LaunchdBackend {
            daemons_dir: daemons_dir.into(),
            launchctl: which::which("launchctl").ok(),
        }
    }

    fn launchctl_path(&self) -> BackendResult<&Path> {
        self.launchctl
            .as_deref()
            .ok_or_else(|| BackendError::Os("launchctl not found in PATH".to_string()))
    }

    fn run_launchctl(&self, args: &[&str]) -> BackendResult<Output> {
        let launchctl = self.launchctl_path()?;
        Command::new(launchctl).args(args).output().map_err(|e| {
            BackendError::Os(format!(
                "failed to execute launchctl {}: {e}",
                args.join(" ")
            ))
        })
    }

    fn plist_path(&self, name: &str) -> PathBuf {
        self.daemons_dir.join(format!("{name}.plist"))
    }

    fn service_target(name: &str) -> String {
        format!("system/{name}")
    }

    fn write_plist(&self, path: &Path, content: &str) -> BackendResult<()> {
        fs::create_dir_all(&self.daemons_dir)
            .map_err(|e| BackendError::Os(format!("failed to create daemons directory: {e}")))?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.daemons_dir)
            .map_err(|e| BackendError::Os(format!("failed to create temp plist: {e}")))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| BackendError::Os(format!("failed to write temp plist: {e}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| BackendError::Os(format!("failed to sync temp plist: {e}")))?;
        temp.persist(path)
            .map_err(|e| BackendError::Os(format!("failed to persist plist: {e}")))?;

        // launchd refuses jobs that are not 0644.
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .map_err(|e| BackendError::Os(format!("failed to set plist permissions: {e}")))?;

        Ok(())
    }
}

impl Default for LaunchdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBackend for LaunchdBackend {
    fn register(&self, name: &str, exec: &Path, config: &Path) -> BackendResult<()> {
        let plist_path = self.plist_path(name);
        if plist_path.exists() {
            return Err(BackendError::AlreadyRegistered);
        }

        let rendered = render_plist(name, exec, config)?;
        self.write_plist(&plist_path, &rendered)?;

        debug!("registered launchd job {}", plist_path.display());
        Ok(())
    }

    fn unregister(&self, name: &str) -> BackendResult<()> {
        let plist_path = self.plist_path(name);
        if !plist_path.exists() {
            return Err(BackendError::NotRegistered);
        }

        // Best effort: the job may not be loaded at all.
        let target = Self::service_target(name);
        let _ = self.run_launchctl(&["bootout", &target]);

        fs::remove_file(&plist_path)
            .map_err(|e| BackendError::Os(format!("failed to remove plist: {e}")))?;

        debug!("removed launchd job {}", plist_path.display());
        Ok(())
    }

    fn start(&self, name: &str) -> BackendResult<()> {
        let plist_path = self.plist_path(name);
        if !plist_path.exists() {
            return Err(BackendError::NotRegistered);
        }
        let plist = plist_path.display().to_string();
        let target = Self::service_target(name);

        // Bootstrap may fail if the job is already loaded.
        let _ = self.run_launchctl(&["bootstrap", "system", &plist]);

        let output = self.run_launchctl(&["kickstart", &target])?;
        if !output.status.success() {
            // Legacy fallback for releases without kickstart.
            let load = self.run_launchctl(&["load", "-w", &plist])?;
            if !load.status.success() {
                return Err(BackendError::Os(format!(
                    "failed to start job '{name}': {}",
                    String::from_utf8_lossy(&load.stderr)
                )));
            }
        }

        Ok(())
    }

    fn stop(&self, name: &str) -> BackendResult<()> {
        let plist_path = self.plist_path(name);
        if !plist_path.exists() {
            return Err(BackendError::NotRegistered);
        }
        let plist = plist_path.display().to_string();
        let target = Self::service_target(name);

        let _ = self.run_launchctl(&["kill", "SIGTERM", &target]);
        std::thread::sleep(Duration::from_millis(500));

        let output = self.run_launchctl(&["bootout", &target])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if not_loaded(&stderr) {
                return Ok(());
            }
            // Legacy fallback for releases without bootout.
            let unload = self.run_launchctl(&["unload", "-w", &plist])?;
            if !unload.status.success() {
                let unload_stderr = String::from_utf8_lossy(&unload.stderr);
                if !not_loaded(&unload_stderr) {
                    return Err(BackendError::Os(format!(
                        "failed to stop job '{name}': {unload_stderr}"
                    )));
                }
            }
        }

        Ok(())
    }

    fn query(&self, name: &str) -> BackendResult<BackendState> {
        if !self.plist_path(name).exists() {
            return Ok(BackendState::NotRegistered);
        }

        let output = self.run_launchctl(&["list", name])?;
        if !output.status.success() {
            // Registered on disk but not loaded into launchd.
            return Ok(BackendState::Stopped);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(if has_assigned_pid(&stdout) {
            BackendState::Running
        } else {
            BackendState::Stopped
        })
    }
}

/// Generate the launchd job plist for one node service.
fn render_plist(name: &str, exec: &Path, config: &Path) -> BackendResult<String> {
    let mut job = HashMap::new();

    job.insert("Label".to_string(), Value::String(name.to_string()));
    job.insert("Disabled".to_string(), Value::Boolean(false));

    let program_args = vec![
        Value::String(exec.display().to_string()),
        Value::String("run".to_string()),
        Value::String("-c".to_string()),
        Value::String(config.display().to_string()),
    ];
    job.insert("ProgramArguments".to_string(), Value::Array(program_args));

    job.insert("RunAtLoad".to_string(), Value::Boolean(false));
    job.insert("KeepAlive".to_string(), Value::Boolean(false));

    job.insert(
        "StandardOutPath".to_string(),
        Value::String(format!("/var/log/{name}.out.log")),
    );
    job.insert(
        "StandardErrorPath".to_string(),
        Value::String(format!("/var/log/{name}.err.log")),
    );

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(job.into_iter().collect()))
        .map_err(|e| BackendError::Os(format!("failed to generate plist: {e}")))?;

    String::from_utf8(buf)
        .map_err(|e| BackendError::Os(format!("plist contains invalid UTF-8: {e}")))
}

/// `launchctl list <label>` prints a `"PID" = <n>;` line only while the job
/// has a live process.
fn has_assigned_pid(stdout: &str) -> bool {
    stdout
        .lines()
        .any(|line| line.trim_start().starts_with("\"PID\"") && line.contains('='))
}

fn not_loaded(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such process")
        || lower.contains("not currently loaded")
        || lower.contains("could not find")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plist_lists_the_run_arguments_in_order() {
        let rendered = render_plist(
            "xstream-node",
            Path::new("/usr/local/bin/xray"),
            Path::new("/usr/local/var/xstream/config.json"),
        )
        .expect("render");

        assert!(rendered.contains("<key>Label</key>"));
        assert!(rendered.contains("<string>xstream-node</string>"));
        let xray = rendered.find("<string>/usr/local/bin/xray</string>").expect("exec");
        let run = rendered.find("<string>run</string>").expect("run");
        let config = rendered
            .find("<string>/usr/local/var/xstream/config.json</string>")
            .expect("config");
        assert!(xray < run && run < config);
    }

    #[test]
    fn plist_does_not_run_at_load() {
        let rendered = render_plist("n", Path::new("/x"), Path::new("/c")).expect("render");
        let idx = rendered.find("<key>RunAtLoad</key>").expect("key");
        assert!(rendered[idx..].trim_start_matches("<key>RunAtLoad</key>")
            .trim_start()
            .starts_with("<false/>"));
    }

    #[test]
    fn pid_lines_mean_running() {
        let loaded = "{\n\t\"PID\" = 4711;\n\t\"Label\" = \"xstream-node\";\n};\n";
        assert!(has_assigned_pid(loaded));
        let idle = "{\n\t\"Label\" = \"xstream-node\";\n\t\"LastExitStatus\" = 0;\n};\n";
        assert!(!has_assigned_pid(idle));
    }

    #[test]
    fn bootout_noise_for_unloaded_jobs_is_tolerated() {
        assert!(not_loaded("Boot-out failed: 3: No such process"));
        assert!(!not_loaded("Boot-out failed: 150: Operation not permitted"));
    }
}
