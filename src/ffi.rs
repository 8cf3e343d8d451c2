//! C boundary for host applications.
//!
//! Every exported function may be called from any thread. String results are
//! owned C strings: empty on success, an error message on failure. The caller
//! releases each returned string through [`FreeCString`] exactly once. Null
//! arguments are answered with an error, never dereferenced, and panics are
//! converted to internal errors instead of unwinding into the caller.

use std::ffi::{CStr, CString, c_char};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::LazyLock;

use log::error;

use crate::bridge::Bridge;
use crate::config_writer::{ConfigBundle, ConfigFile};
use crate::error::{BridgeError, BridgeResult};
use crate::status;

static BRIDGE: LazyLock<Bridge> = LazyLock::new(|| {
    init_logging();
    Bridge::new()
});

/// Default logging for hosts that configure none. An embedder's own logger
/// wins; `try_init` keeps this from tripping over it.
fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// Copy a C string argument. None for null or non-UTF-8 input.
unsafe fn read_arg(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .ok()
        .map(str::to_owned)
}

/// Hand `message` to the caller as an owned C string. Interior NUL bytes,
/// which can ride in on raw OS error text, are rewritten to `?` so a failure
/// report never collapses into the empty success string.
fn into_c_string(message: String) -> *mut c_char {
    let mut bytes = message.into_bytes();
    for byte in &mut bytes {
        if *byte == 0 {
            *byte = b'?';
        }
    }
    match CString::new(bytes) {
        Ok(text) => text.into_raw(),
        // No NUL survives the rewrite.
        Err(_) => CString::from(c"internal error: unrenderable message").into_raw(),
    }
}

fn invalid_argument() -> *mut c_char {
    into_c_string(BridgeError::internal("null or non-UTF-8 argument").to_string())
}

/// Run one boundary operation, translating its outcome (or a panic) into an
/// owned C string.
fn guarded<F>(what: &str, run: F) -> *mut c_char
where
    F: FnOnce() -> BridgeResult<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => into_c_string(String::new()),
        Ok(Err(err)) => into_c_string(err.to_string()),
        Err(_) => {
            error!("panic caught at the C boundary in {what}");
            into_c_string(format!("internal error: panic in {what}"))
        }
    }
}

/// Write the three config files and seal the credential, all-or-none.
///
/// # Safety
/// Every pointer must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn WriteConfigFiles(
    xray_path: *const c_char,
    xray_content: *const c_char,
    service_path: *const c_char,
    service_content: *const c_char,
    vpn_path: *const c_char,
    vpn_content: *const c_char,
    password: *const c_char,
) -> *mut c_char {
    let (
        Some(xray_path),
        Some(xray_content),
        Some(service_path),
        Some(service_content),
        Some(vpn_path),
        Some(vpn_content),
        Some(password),
    ) = (
        unsafe { read_arg(xray_path) },
        unsafe { read_arg(xray_content) },
        unsafe { read_arg(service_path) },
        unsafe { read_arg(service_content) },
        unsafe { read_arg(vpn_path) },
        unsafe { read_arg(vpn_content) },
        unsafe { read_arg(password) },
    )
    else {
        return invalid_argument();
    };

    guarded("WriteConfigFiles", move || {
        let bundle = ConfigBundle {
            xray: ConfigFile::new(xray_path, xray_content),
            service: ConfigFile::new(service_path, service_content),
            vpn: ConfigFile::new(vpn_path, vpn_content),
            credential: password,
        };
        BRIDGE.write_config_files(&bundle)
    })
}

/// Start the named node service.
///
/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn StartNodeService(name: *const c_char) -> *mut c_char {
    let Some(name) = (unsafe { read_arg(name) }) else {
        return invalid_argument();
    };
    guarded("StartNodeService", move || BRIDGE.start_service(&name))
}

/// Stop the named node service.
///
/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn StopNodeService(name: *const c_char) -> *mut c_char {
    let Some(name) = (unsafe { read_arg(name) }) else {
        return invalid_argument();
    };
    guarded("StopNodeService", move || BRIDGE.stop_service(&name))
}

/// Status of the named service as an integer code: one code per lifecycle
/// state, `-1` when the name is unknown, `-2` on any other failure.
///
/// # Safety
/// `name` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn CheckNodeStatus(name: *const c_char) -> i32 {
    let Some(name) = (unsafe { read_arg(name) }) else {
        return status::STATUS_ERROR;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| BRIDGE.status_code(&name))) {
        Ok(code) => code,
        Err(_) => {
            error!("panic caught at the C boundary in CheckNodeStatus");
            status::STATUS_ERROR
        }
    }
}

/// Register the service with the Windows SCM without starting it. On other
/// platforms the result is an error string.
///
/// # Safety
/// Every pointer must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn CreateWindowsService(
    name: *const c_char,
    exec_path: *const c_char,
    config_path: *const c_char,
) -> *mut c_char {
    let (Some(name), Some(exec_path), Some(config_path)) = (
        unsafe { read_arg(name) },
        unsafe { read_arg(exec_path) },
        unsafe { read_arg(config_path) },
    ) else {
        return invalid_argument();
    };
    guarded("CreateWindowsService", move || {
        BRIDGE.create_windows_service(&name, Path::new(&exec_path), Path::new(&config_path))
    })
}

/// Run a named privileged action, gated by the sealed credential.
///
/// # Safety
/// Every pointer must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PerformAction(
    action: *const c_char,
    password: *const c_char,
) -> *mut c_char {
    let (Some(action), Some(password)) = (
        unsafe { read_arg(action) },
        unsafe { read_arg(password) },
    ) else {
        return invalid_argument();
    };
    guarded("PerformAction", move || {
        BRIDGE.perform_action(&action, &password)
    })
}

/// 1 while an xray download is in flight, 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn IsXrayDownloading() -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(|| BRIDGE.is_downloading())) {
        Ok(true) => 1,
        _ => 0,
    }
}

/// Release a string returned by any function here. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this library that
/// has not been freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn FreeCString(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(ptr) });
}
