//! Windows backend using the Service Control Manager API.
//!
//! Services are created demand-start in their own process; the controller
//! decides when the proxy runs.

use std::ffi::OsStr;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use log::debug;
use windows::Win32::Foundation::{
    ERROR_SERVICE_ALREADY_RUNNING, ERROR_SERVICE_DOES_NOT_EXIST, ERROR_SERVICE_EXISTS,
    ERROR_SERVICE_MARKED_FOR_DELETE, ERROR_SERVICE_NOT_ACTIVE, GetLastError,
};
use windows::Win32::System::Services::{
    CloseServiceHandle, ControlService, CreateServiceW, DeleteService, OpenSCManagerW,
    OpenServiceW, QueryServiceStatusEx, SC_HANDLE, SC_MANAGER_ALL_ACCESS, SC_MANAGER_CONNECT,
    SC_STATUS_PROCESS_INFO, SERVICE_ALL_ACCESS, SERVICE_CONTROL_STOP, SERVICE_DEMAND_START,
    SERVICE_ERROR_IGNORE, SERVICE_QUERY_STATUS, SERVICE_RUNNING, SERVICE_START,
    SERVICE_START_PENDING, SERVICE_STATUS, SERVICE_STATUS_PROCESS, SERVICE_STOP,
    SERVICE_STOP_PENDING, SERVICE_STOPPED, SERVICE_WIN32_OWN_PROCESS, StartServiceW,
};
use windows::core::PCWSTR;

use super::{BackendError, BackendResult, BackendState, ServiceBackend};

// Fixed-size buffers for wide-string conversion
const MAX_SERVICE_NAME: usize = 256;
const MAX_COMMAND_LINE: usize = 1024;
const MAX_DEPENDENCIES: usize = 64;

pub struct ScmBackend;

impl ScmBackend {
    pub fn new() -> Self {
        ScmBackend
    }
}

impl Default for ScmBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII wrapper for the Service Control Manager handle.
struct ScManagerHandle(SC_HANDLE);

impl ScManagerHandle {
    fn connect(access: u32) -> BackendResult<Self> {
        let handle = unsafe { OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), access) };
        if handle.is_invalid() {
            return Err(BackendError::Os(format!(
                "failed to open Service Control Manager: {}",
                unsafe { GetLastError().0 }
            )));
        }
        Ok(ScManagerHandle(handle))
    }

    fn handle(&self) -> SC_HANDLE {
        self.0
    }
}

impl Drop for ScManagerHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseServiceHandle(self.0);
            }
        }
    }
}

/// RAII wrapper for an individual service handle.
struct ServiceHandle(SC_HANDLE);

impl ServiceHandle {
    fn handle(&self) -> SC_HANDLE {
        self.0
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseServiceHandle(self.0);
            }
        }
    }
}

/// Convert a string to a NUL-terminated wide string in a fixed buffer.
fn str_to_wide(s: &str, buffer: &mut [u16]) -> BackendResult<()> {
    let wide: Vec<u16> = OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    if wide.len() > buffer.len() {
        return Err(BackendError::Os(format!(
            "string '{s}' too long for buffer (max {})",
            buffer.len()
        )));
    }

    buffer[..wide.len()].copy_from_slice(&wide);
    Ok(())
}

/// Open `name`, distinguishing "does not exist" from other failures.
fn open_service(
    manager: &ScManagerHandle,
    name: &str,
    access: u32,
) -> BackendResult<Option<ServiceHandle>> {
    let mut name_buf: [u16; MAX_SERVICE_NAME] = [0; MAX_SERVICE_NAME];
    str_to_wide(name, &mut name_buf)?;

    let handle =
        unsafe { OpenServiceW(manager.handle(), PCWSTR::from_raw(name_buf.as_ptr()), access) };

    if handle.is_invalid() {
        let error = unsafe { GetLastError() };
        if error == ERROR_SERVICE_DOES_NOT_EXIST {
            return Ok(None);
        }
        return Err(BackendError::Os(format!(
            "failed to open service '{name}': {}",
            error.0
        )));
    }

    Ok(Some(ServiceHandle(handle)))
}

impl ServiceBackend for ScmBackend {
    fn register(&self, name: &str, exec: &Path, config: &Path) -> BackendResult<()> {
        let manager = ScManagerHandle::connect(SC_MANAGER_ALL_ACCESS)?;

        let mut name_buf: [u16; MAX_SERVICE_NAME] = [0; MAX_SERVICE_NAME];
        let mut display_buf: [u16; MAX_SERVICE_NAME] = [0; MAX_SERVICE_NAME];
        let mut command_buf: [u16; MAX_COMMAND_LINE] = [0; MAX_COMMAND_LINE];
        let mut dependencies_buf: [u16; MAX_DEPENDENCIES] = [0; MAX_DEPENDENCIES];

        str_to_wide(name, &mut name_buf)?;
        str_to_wide(name, &mut display_buf)?;

        let command = format!("\"{}\" run -c \"{}\"", exec.display(), config.display());
        str_to_wide(&command, &mut command_buf)?;

        // The proxy is useless before the network stack is up.
        str_to_wide("Tcpip\0Afd\0", &mut dependencies_buf)?;

        let service_handle = unsafe {
            CreateServiceW(
                manager.handle(),
                PCWSTR::from_raw(name_buf.as_ptr()),
                PCWSTR::from_raw(display_buf.as_ptr()),
                SERVICE_ALL_ACCESS,
                SERVICE_WIN32_OWN_PROCESS,
                SERVICE_DEMAND_START,
                SERVICE_ERROR_IGNORE,
                PCWSTR::from_raw(command_buf.as_ptr()),
                PCWSTR::null(),
                None,
                PCWSTR::from_raw(dependencies_buf.as_ptr()),
                PCWSTR::null(),
                PCWSTR::null(),
            )
        };

        if service_handle.is_invalid() {
            let error = unsafe { GetLastError() };
            if error == ERROR_SERVICE_EXISTS {
                return Err(BackendError::AlreadyRegistered);
            }
            return Err(BackendError::Os(format!(
                "failed to create service '{name}': {}",
                error.0
            )));
        }

        let _service = ServiceHandle(service_handle);
        debug!("created SCM service '{name}' ({command})");
        Ok(())
    }

    fn unregister(&self, name: &str) -> BackendResult<()> {
        let manager = ScManagerHandle::connect(SC_MANAGER_ALL_ACCESS)?;
        let service = open_service(&manager, name, SERVICE_ALL_ACCESS)?
            .ok_or(BackendError::NotRegistered)?;

        if let Err(e) = unsafe { DeleteService(service.handle()) } {
            // A pending delete finishes once the last handle closes.
            if e.code() != ERROR_SERVICE_MARKED_FOR_DELETE.to_hresult() {
                return Err(BackendError::Os(format!(
                    "failed to delete service '{name}': {e}"
                )));
            }
        }

        debug!("deleted SCM service '{name}'");
        Ok(())
    }

    fn start(&self, name: &str) -> BackendResult<()> {
        let manager = ScManagerHandle::connect(SC_MANAGER_CONNECT.0)?;
        let service =
            open_service(&manager, name, SERVICE_START.0)?.ok_or(BackendError::NotRegistered)?;

        if let Err(e) = unsafe { StartServiceW(service.handle(), None) } {
            if e.code() != ERROR_SERVICE_ALREADY_RUNNING.to_hresult() {
                return Err(BackendError::Os(format!(
                    "failed to start service '{name}': {e}"
                )));
            }
        }

        Ok(())
    }

    fn stop(&self, name: &str) -> BackendResult<()> {
        let manager = ScManagerHandle::connect(SC_MANAGER_CONNECT.0)?;
        let service =
            open_service(&manager, name, SERVICE_STOP.0)?.ok_or(BackendError::NotRegistered)?;

        let mut status: SERVICE_STATUS = unsafe { mem::zeroed() };
        if let Err(e) =
            unsafe { ControlService(service.handle(), SERVICE_CONTROL_STOP, &mut status) }
        {
            if e.code() != ERROR_SERVICE_NOT_ACTIVE.to_hresult() {
                return Err(BackendError::Os(format!(
                    "failed to stop service '{name}': {e}"
                )));
            }
        }

        Ok(())
    }

    fn query(&self, name: &str) -> BackendResult<BackendState> {
        let manager = ScManagerHandle::connect(SC_MANAGER_CONNECT.0)?;
        let Some(service) = open_service(&manager, name, SERVICE_QUERY_STATUS.0)? else {
            return Ok(BackendState::NotRegistered);
        };

        let mut status: SERVICE_STATUS_PROCESS = unsafe { mem::zeroed() };
        let mut bytes_needed: u32 = 0;

        let result = unsafe {
            QueryServiceStatusEx(
                service.handle(),
                SC_STATUS_PROCESS_INFO,
                Some(&mut status as *mut _ as *mut u8),
                mem::size_of::<SERVICE_STATUS_PROCESS>() as u32,
                &mut bytes_needed,
            )
        };

        if result.is_err() {
            return Err(BackendError::Os(format!(
                "failed to query service '{name}': {}",
                unsafe { GetLastError().0 }
            )));
        }

        let state = status.dwCurrentState;
        Ok(if state == SERVICE_RUNNING.0 {
            BackendState::Running
        } else if state == SERVICE_START_PENDING.0 {
            BackendState::StartPending
        } else if state == SERVICE_STOP_PENDING.0 {
            BackendState::StopPending
        } else if state == SERVICE_STOPPED.0 {
            BackendState::Stopped
        } else {
            // Paused and continue-pending collapse to stopped for our purposes.
            BackendState::Stopped
        })
    }
}
