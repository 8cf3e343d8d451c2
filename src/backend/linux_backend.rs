//! systemd backend driven through systemctl.
//!
//! Units are written to `/etc/systemd/system` and left demand-started; the
//! controller owns when the proxy runs, so nothing is enabled at boot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use log::debug;

use super::{BackendError, BackendResult, BackendState, ServiceBackend};

const UNIT_DIR: &str = "/etc/systemd/system";

pub struct SystemdBackend {
    unit_dir: PathBuf,
    systemctl: Option<PathBuf>,
}

impl SystemdBackend {
    pub fn new() -> Self {
        Self::with_unit_dir(UNIT_DIR)
    }

    /// Backend writing unit files under `unit_dir` instead of the system
    /// location.
    pub fn with_unit_dir(unit_dir: impl Into<PathBuf>) -> Self {
        SystemdBackend {
            unit_dir: unit_dir.into(),
            systemctl: which::which("systemctl").ok(),
        }
    }

    fn systemctl_path(&self) -> BackendResult<&Path> {
        self.systemctl
            .as_deref()
            .ok_or_else(|| BackendError::Os("systemctl not found in PATH".to_string()))
    }

    fn run_systemctl(&self, args: &[&str]) -> BackendResult<Output> {
        let systemctl = self.systemctl_path()?;
        Command::new(systemctl).args(args).output().map_err(|e| {
            BackendError::Os(format!(
                "failed to execute systemctl {}: {e}",
                args.join(" ")
            ))
        })
    }

    fn daemon_reload(&self) -> BackendResult<()> {
        let output = self.run_systemctl(&["daemon-reload"])?;
        if !output.status.success() {
            return Err(BackendError::Os(format!(
                "failed to reload systemd daemon: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn unit_name(name: &str) -> String {
        format!("{name}.service")
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(Self::unit_name(name))
    }

    fn write_unit_file(&self, path: &Path, content: &str) -> BackendResult<()> {
        fs::create_dir_all(&self.unit_dir)
            .map_err(|e| BackendError::Os(format!("failed to create unit directory: {e}")))?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.unit_dir)
            .map_err(|e| BackendError::Os(format!("failed to create temp unit file: {e}")))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| BackendError::Os(format!("failed to write temp unit file: {e}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| BackendError::Os(format!("failed to sync temp unit file: {e}")))?;
        temp.persist(path)
            .map_err(|e| BackendError::Os(format!("failed to persist unit file: {e}")))?;

        // Unit files are conventionally world-readable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o644))
                .map_err(|e| BackendError::Os(format!("failed to set unit permissions: {e}")))?;
        }

        Ok(())
    }
}

impl Default for SystemdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBackend for SystemdBackend {
    fn register(&self, name: &str, exec: &Path, config: &Path) -> BackendResult<()> {
        let unit_path = self.unit_path(name);
        if unit_path.exists() {
            return Err(BackendError::AlreadyRegistered);
        }

        let unit = render_unit(name, exec, config);
        self.write_unit_file(&unit_path, &unit)?;

        if let Err(e) = self.daemon_reload() {
            let _ = fs::remove_file(&unit_path);
            return Err(e);
        }

        debug!("registered systemd unit {}", unit_path.display());
        Ok(())
    }

    fn unregister(&self, name: &str) -> BackendResult<()> {
        let unit_path = self.unit_path(name);
        if !unit_path.exists() {
            return Err(BackendError::NotRegistered);
        }

        fs::remove_file(&unit_path)
            .map_err(|e| BackendError::Os(format!("failed to remove unit file: {e}")))?;
        self.daemon_reload()?;

        debug!("removed systemd unit {}", unit_path.display());
        Ok(())
    }

    fn start(&self, name: &str) -> BackendResult<()> {
        let unit = Self::unit_name(name);
        let output = self.run_systemctl(&["start", &unit])?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(())
    }

    fn stop(&self, name: &str) -> BackendResult<()> {
        let unit = Self::unit_name(name);
        let output = self.run_systemctl(&["stop", &unit])?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        // A unit that crashed stays in the failed state even after stop;
        // clear it so the next query reads inactive.
        let _ = self.run_systemctl(&["reset-failed", &unit]);
        Ok(())
    }

    fn query(&self, name: &str) -> BackendResult<BackendState> {
        let unit = Self::unit_name(name);
        let output =
            self.run_systemctl(&["show", &unit, "--property=LoadState,ActiveState,Result"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return match classify_failure(&stderr) {
                BackendError::NotRegistered => Ok(BackendState::NotRegistered),
                other => Err(other),
            };
        }

        let props = parse_show_output(&String::from_utf8_lossy(&output.stdout));
        Ok(state_from_properties(&props))
    }
}

/// Generate the unit file for one node service.
fn render_unit(name: &str, exec: &Path, config: &Path) -> String {
    let mut unit = String::with_capacity(512);

    unit.push_str("[Unit]\n");
    unit.push_str(&format!("Description=Xstream node service ({name})\n"));
    unit.push_str("After=network.target nss-lookup.target\n");
    unit.push('\n');

    unit.push_str("[Service]\n");
    unit.push_str("Type=simple\n");
    unit.push_str(&format!(
        "ExecStart={} run -c {}\n",
        exec.display(),
        config.display()
    ));
    unit.push_str("Restart=no\n");
    unit.push_str("LimitNPROC=10000\n");
    unit.push_str("LimitNOFILE=1000000\n");
    unit.push_str("StandardOutput=journal\n");
    unit.push_str("StandardError=journal\n");
    unit.push_str(&format!("SyslogIdentifier={name}\n"));
    unit.push('\n');

    unit.push_str("[Install]\n");
    unit.push_str("WantedBy=multi-user.target\n");

    unit
}

/// systemctl reports unknown units on stderr rather than with a dedicated
/// exit code.
fn classify_failure(stderr: &str) -> BackendError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("not be found") || lower.contains("not loaded")
    {
        BackendError::NotRegistered
    } else {
        BackendError::Os(stderr.trim().to_string())
    }
}

#[derive(Debug, Default)]
struct UnitProperties {
    load_state: String,
    active_state: String,
    result: String,
}

fn parse_show_output(stdout: &str) -> UnitProperties {
    let mut props = UnitProperties::default();
    for line in stdout.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key {
                "LoadState" => props.load_state = value.to_string(),
                "ActiveState" => props.active_state = value.to_string(),
                "Result" => props.result = value.to_string(),
                _ => {}
            }
        }
    }
    props
}

fn state_from_properties(props: &UnitProperties) -> BackendState {
    if props.load_state == "not-found" {
        return BackendState::NotRegistered;
    }
    match props.active_state.as_str() {
        "active" | "reloading" => BackendState::Running,
        "activating" => BackendState::StartPending,
        "deactivating" => BackendState::StopPending,
        "failed" => {
            let result = if props.result.is_empty() {
                "unknown"
            } else {
                props.result.as_str()
            };
            BackendState::Failed(format!("unit entered failed state ({result})"))
        }
        _ => BackendState::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_contains_exec_and_config() {
        let unit = render_unit(
            "xstream-node",
            Path::new("/opt/bin/xray"),
            Path::new("/var/lib/xstream/config.json"),
        );
        assert!(unit.starts_with("[Unit]\n"));
        assert!(unit.contains("ExecStart=/opt/bin/xray run -c /var/lib/xstream/config.json\n"));
        assert!(unit.contains("Description=Xstream node service (xstream-node)\n"));
        assert!(unit.contains("SyslogIdentifier=xstream-node\n"));
        assert!(unit.contains("[Install]\n"));
    }

    #[test]
    fn show_output_maps_to_states() {
        let cases = [
            ("LoadState=not-found\nActiveState=inactive\n", BackendState::NotRegistered),
            ("LoadState=loaded\nActiveState=active\n", BackendState::Running),
            ("LoadState=loaded\nActiveState=activating\n", BackendState::StartPending),
            ("LoadState=loaded\nActiveState=deactivating\n", BackendState::StopPending),
            ("LoadState=loaded\nActiveState=inactive\n", BackendState::Stopped),
        ];
        for (stdout, expected) in cases {
            let props = parse_show_output(stdout);
            assert_eq!(state_from_properties(&props), expected, "for {stdout:?}");
        }
    }

    #[test]
    fn failed_units_carry_the_systemd_result() {
        let props = parse_show_output("LoadState=loaded\nActiveState=failed\nResult=exit-code\n");
        match state_from_properties(&props) {
            BackendState::Failed(reason) => assert!(reason.contains("exit-code")),
            other => panic!("expected failed state, got {other:?}"),
        }
    }

    #[test]
    fn unknown_unit_stderr_classifies_as_not_registered() {
        let old = classify_failure("Failed to start a.service: Unit a.service not found.");
        assert!(matches!(old, BackendError::NotRegistered));
        let new = classify_failure("Unit a.service could not be found.");
        assert!(matches!(new, BackendError::NotRegistered));
        let other = classify_failure("Access denied");
        assert!(matches!(other, BackendError::Os(_)));
    }

    #[test]
    fn unit_file_lands_world_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SystemdBackend::with_unit_dir(dir.path());
        let unit_path = backend.unit_path("xstream-node");

        backend
            .write_unit_file(&unit_path, "[Unit]\nDescription=test\n")
            .expect("write unit");

        let written = fs::read_to_string(&unit_path).expect("read back");
        assert!(written.contains("Description=test"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&unit_path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[test]
    fn unregister_without_unit_reports_not_registered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SystemdBackend::with_unit_dir(dir.path());
        let err = backend.unregister("missing-node").unwrap_err();
        assert!(matches!(err, BackendError::NotRegistered));
    }
}
