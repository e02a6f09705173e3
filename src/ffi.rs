//! C-compatible embedding API.
//!
//! Mirrors the library's Rust surface for hosts in other languages: start
//! and stop the standard server, observe run state and health, drive the
//! update queue, and register log sinks. All functions are callable from
//! plain C; strings are NUL-terminated UTF-8.
//!
//! Pointer contracts (see the data accessor docs): the getter must return a
//! pointer into storage that stays valid at least until the next call, and
//! the setter must copy everything it wants to keep before returning.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::Mutex;
use std::time::Duration;

use tracing::error;

use crate::gatt::ServerData;
use crate::logger::{self, LogLevel};
use crate::server::GattServer;
use crate::standard::standard_description;
use crate::state;
use crate::update_queue::{update_queue, PopStatus};
use crate::value::DataValue;

/// Returns a pointer to the data behind `key`, or null for unknown keys.
pub type GgsDataGetter = Option<unsafe extern "C" fn(key: *const c_char) -> *const c_void>;

/// Stores the data behind `key`; non-zero return means success.
pub type GgsDataSetter =
    Option<unsafe extern "C" fn(key: *const c_char, value: *const c_void) -> c_int>;

/// Receives one log line; must be re-entrant.
pub type GgsLogReceiver = Option<extern "C" fn(message: *const c_char)>;

static SERVER: Mutex<Option<GattServer>> = Mutex::new(None);

fn server_slot() -> std::sync::MutexGuard<'static, Option<GattServer>> {
    SERVER.lock().unwrap_or_else(|e| e.into_inner())
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        ""
    } else {
        CStr::from_ptr(ptr).to_str().unwrap_or("")
    }
}

/// Adapt the C data accessors to the typed accessors the model uses. The
/// standard description stores a byte under `battery/level` and a C string
/// under every other key.
fn wrap_data_accessors(getter: GgsDataGetter, setter: GgsDataSetter) -> ServerData {
    ServerData {
        getter: Box::new(move |key: &str| {
            let getter = getter?;
            let ckey = CString::new(key).ok()?;
            let ptr = unsafe { getter(ckey.as_ptr()) };
            if ptr.is_null() {
                return None;
            }
            if key == "battery/level" {
                Some(DataValue::Bytes(vec![unsafe { *(ptr as *const u8) }]))
            } else {
                let text = unsafe { CStr::from_ptr(ptr as *const c_char) };
                Some(DataValue::Text(text.to_string_lossy().into_owned()))
            }
        }),
        setter: Box::new(move |key: &str, value: &DataValue| {
            let Some(setter) = setter else {
                return false;
            };
            let Ok(ckey) = CString::new(key) else {
                return false;
            };
            match value {
                DataValue::Text(text) => {
                    let Ok(ctext) = CString::new(text.as_str()) else {
                        return false;
                    };
                    unsafe { setter(ckey.as_ptr(), ctext.as_ptr() as *const c_void) != 0 }
                }
                DataValue::Bytes(bytes) => {
                    unsafe { setter(ckey.as_ptr(), bytes.as_ptr() as *const c_void) != 0 }
                }
                _ => false,
            }
        }),
    }
}

/// Start the standard server. Blocks up to `max_async_init_timeout_ms` for
/// the engine to reach `Running`. Returns 1 on success, 0 on failure.
///
/// # Safety
/// `service_name`, `advertising_name` and `advertising_short_name` must be
/// null or valid NUL-terminated strings; the accessor contracts above must
/// hold for the lifetime of the server.
#[no_mangle]
pub unsafe extern "C" fn ggs_start(
    service_name: *const c_char,
    advertising_name: *const c_char,
    advertising_short_name: *const c_char,
    getter: GgsDataGetter,
    setter: GgsDataSetter,
    max_async_init_timeout_ms: c_int,
) -> c_int {
    let service_name = str_arg(service_name);
    let advertising_name = str_arg(advertising_name);
    let advertising_short_name = str_arg(advertising_short_name);

    let description = match standard_description(
        service_name,
        advertising_name,
        advertising_short_name,
        wrap_data_accessors(getter, setter),
    ) {
        Ok(description) => description,
        Err(e) => {
            error!("invalid server description: {:#}", e);
            return 0;
        }
    };

    let timeout = Duration::from_millis(max_async_init_timeout_ms.max(0) as u64);
    match GattServer::start(description, timeout) {
        Ok(server) => {
            *server_slot() = Some(server);
            1
        }
        Err(e) => {
            error!("server failed to start: {:#}", e);
            0
        }
    }
}

/// Begin shutdown without blocking.
#[no_mangle]
pub extern "C" fn ggs_trigger_shutdown() {
    crate::engine::trigger_shutdown();
}

/// Join the server; 1 on a clean stop, 0 otherwise.
#[no_mangle]
pub extern "C" fn ggs_wait() -> c_int {
    match server_slot().take() {
        Some(mut server) => server.wait() as c_int,
        None => 0,
    }
}

/// Trigger shutdown, then wait.
#[no_mangle]
pub extern "C" fn ggs_shutdown_and_wait() -> c_int {
    if state::is_server_running() {
        ggs_trigger_shutdown();
    }
    ggs_wait()
}

/// Current run state (see `RunState`).
#[no_mangle]
pub extern "C" fn ggs_get_server_run_state() -> c_int {
    state::run_state() as c_int
}

/// Human-readable name of a run state value.
#[no_mangle]
pub extern "C" fn ggs_get_server_run_state_string(run_state: c_int) -> *const c_char {
    let name: &CStr = match run_state {
        0 => c"Uninitialized",
        1 => c"Initializing",
        2 => c"Running",
        3 => c"Stopping",
        4 => c"Stopped",
        _ => c"Unknown",
    };
    name.as_ptr()
}

/// 1 while the server has not begun shutting down.
#[no_mangle]
pub extern "C" fn ggs_is_server_running() -> c_int {
    state::is_server_running() as c_int
}

/// Current health (see `Health`).
#[no_mangle]
pub extern "C" fn ggs_get_server_health() -> c_int {
    state::health() as c_int
}

/// Human-readable name of a health value.
#[no_mangle]
pub extern "C" fn ggs_get_server_health_string(health: c_int) -> *const c_char {
    let name: &CStr = match health {
        0 => c"Ok",
        1 => c"Failed initialization",
        2 => c"Failed run",
        _ => c"Unknown",
    };
    name.as_ptr()
}

/// Queue an update for the characteristic at `object_path`. Returns 1 on
/// success.
///
/// # Safety
/// `object_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ggs_notify_updated_characteristic(object_path: *const c_char) -> c_int {
    if object_path.is_null() {
        return 0;
    }
    update_queue().notify_updated_characteristic(str_arg(object_path));
    1
}

/// Queue an update for the descriptor at `object_path`. Returns 1 on
/// success.
///
/// # Safety
/// `object_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ggs_notify_updated_descriptor(object_path: *const c_char) -> c_int {
    if object_path.is_null() {
        return 0;
    }
    update_queue().notify_updated_descriptor(str_arg(object_path));
    1
}

/// Queue a raw `(path, interface)` update. Returns 1 on success.
///
/// # Safety
/// Both arguments must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn ggs_push_update_queue(
    object_path: *const c_char,
    interface_name: *const c_char,
) -> c_int {
    if object_path.is_null() || interface_name.is_null() {
        return 0;
    }
    update_queue().push(str_arg(object_path), str_arg(interface_name));
    1
}

/// Pop the oldest entry, formatted `"<path>|<interface>"`, into `buffer`
/// (NUL-terminated). `keep` non-zero leaves the entry in place. Returns 1
/// on success, 0 if the queue is empty, -1 if the buffer is too small.
///
/// # Safety
/// `buffer` must point to at least `buffer_len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn ggs_pop_update_queue(
    buffer: *mut c_char,
    buffer_len: c_int,
    keep: c_int,
) -> c_int {
    if buffer.is_null() || buffer_len <= 0 {
        return -1;
    }
    let slice = std::slice::from_raw_parts_mut(buffer as *mut u8, buffer_len as usize);
    match update_queue().pop_into(slice, keep != 0) {
        PopStatus::Ok(_) => 1,
        PopStatus::Empty => 0,
        PopStatus::BufferTooSmall => -1,
    }
}

/// 1 if the update queue is empty.
#[no_mangle]
pub extern "C" fn ggs_update_queue_is_empty() -> c_int {
    update_queue().is_empty() as c_int
}

/// Number of queued updates.
#[no_mangle]
pub extern "C" fn ggs_update_queue_size() -> c_int {
    update_queue().size() as c_int
}

/// Drop every queued update.
#[no_mangle]
pub extern "C" fn ggs_update_queue_clear() {
    update_queue().clear();
}

fn register_receiver(level: LogLevel, receiver: GgsLogReceiver) {
    match receiver {
        Some(receiver) => logger::register_sink(
            level,
            Some(Box::new(move |message: &str| {
                if let Ok(line) = CString::new(message.replace('\0', " ")) {
                    receiver(line.as_ptr());
                }
            })),
        ),
        None => logger::register_sink(level, None),
    }
}

#[no_mangle]
pub extern "C" fn ggs_log_register_debug(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Debug, receiver);
}

#[no_mangle]
pub extern "C" fn ggs_log_register_info(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Info, receiver);
}

#[no_mangle]
pub extern "C" fn ggs_log_register_status(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Status, receiver);
}

#[no_mangle]
pub extern "C" fn ggs_log_register_warn(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Warn, receiver);
}

#[no_mangle]
pub extern "C" fn ggs_log_register_error(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Error, receiver);
}

#[no_mangle]
pub extern "C" fn ggs_log_register_fatal(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Fatal, receiver);
}

#[no_mangle]
pub extern "C" fn ggs_log_register_always(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Always, receiver);
}

#[no_mangle]
pub extern "C" fn ggs_log_register_trace(receiver: GgsLogReceiver) {
    register_receiver(LogLevel::Trace, receiver);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_surface_round_trip() {
        ggs_update_queue_clear();

        let path = CString::new("/com/demo/battery/level").unwrap();
        assert_eq!(unsafe { ggs_notify_updated_characteristic(path.as_ptr()) }, 1);
        assert_eq!(ggs_update_queue_is_empty(), 0);
        assert_eq!(ggs_update_queue_size(), 1);

        let mut tiny = [0 as c_char; 4];
        assert_eq!(
            unsafe { ggs_pop_update_queue(tiny.as_mut_ptr(), tiny.len() as c_int, 0) },
            -1
        );
        assert_eq!(ggs_update_queue_size(), 1);

        let mut buffer = [0 as c_char; 128];
        assert_eq!(
            unsafe { ggs_pop_update_queue(buffer.as_mut_ptr(), buffer.len() as c_int, 1) },
            1
        );
        let entry = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        assert_eq!(
            entry.to_str().unwrap(),
            "/com/demo/battery/level|org.bluez.GattCharacteristic1"
        );
        assert_eq!(ggs_update_queue_size(), 1);

        assert_eq!(
            unsafe { ggs_pop_update_queue(buffer.as_mut_ptr(), buffer.len() as c_int, 0) },
            1
        );
        assert_eq!(
            unsafe { ggs_pop_update_queue(buffer.as_mut_ptr(), buffer.len() as c_int, 0) },
            0
        );

        ggs_update_queue_clear();
    }

    #[test]
    fn test_state_strings() {
        let running = unsafe { CStr::from_ptr(ggs_get_server_run_state_string(2)) };
        assert_eq!(running.to_str().unwrap(), "Running");
        let unknown = unsafe { CStr::from_ptr(ggs_get_server_run_state_string(99)) };
        assert_eq!(unknown.to_str().unwrap(), "Unknown");

        let ok = unsafe { CStr::from_ptr(ggs_get_server_health_string(0)) };
        assert_eq!(ok.to_str().unwrap(), "Ok");
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        assert_eq!(unsafe { ggs_notify_updated_characteristic(std::ptr::null()) }, 0);
        assert_eq!(
            unsafe { ggs_push_update_queue(std::ptr::null(), std::ptr::null()) },
            0
        );
        assert_eq!(unsafe { ggs_pop_update_queue(std::ptr::null_mut(), 16, 0) }, -1);
    }

    #[test]
    fn test_data_accessor_wrappers() {
        unsafe extern "C" fn getter(key: *const c_char) -> *const c_void {
            let key = CStr::from_ptr(key);
            if key.to_bytes() == b"text/string" {
                c"Hello, world!".as_ptr() as *const c_void
            } else {
                std::ptr::null()
            }
        }

        let data = wrap_data_accessors(Some(getter), None);
        assert_eq!(
            (data.getter)("text/string"),
            Some(DataValue::Text("Hello, world!".to_string()))
        );
        assert_eq!((data.getter)("battery/level"), None);
        assert!(!(data.setter)("text/string", &DataValue::Text("x".into())));
    }
}
