//! Bluetooth management protocol client.
//!
//! Speaks the kernel's management command/event protocol over the raw
//! control socket. One background thread owns the read loop: it decodes
//! every event in each batch, keeps the controller snapshot fresh, tracks
//! the active connection count, and completes the per-command waiters that
//! `send_command` registers. The thread never calls into the GATT model or
//! the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::config;
use crate::hci_socket::{HciSocket, ReadOutcome, WaitOutcome};

/// Management frame header: `(code, controller_index, data_size)`, all
/// little-endian u16.
pub const HEADER_SIZE: usize = 6;

/// Controller index meaning "no controller" (index-less commands).
pub const NON_CONTROLLER: u16 = 0xffff;

/// Default controller index (the first adapter).
pub const DEFAULT_CONTROLLER_INDEX: u16 = 0;

// Management commands used by this crate.
pub const CMD_READ_VERSION: u16 = 0x0001;
pub const CMD_READ_CONTROLLER_INFO: u16 = 0x0004;
pub const CMD_SET_POWERED: u16 = 0x0005;
pub const CMD_SET_DISCOVERABLE: u16 = 0x0006;
pub const CMD_SET_CONNECTABLE: u16 = 0x0007;
pub const CMD_SET_BONDABLE: u16 = 0x0009;
pub const CMD_SET_LOW_ENERGY: u16 = 0x000D;
pub const CMD_SET_LOCAL_NAME: u16 = 0x000F;
pub const CMD_SET_ADVERTISING: u16 = 0x0029;
pub const CMD_SET_BREDR: u16 = 0x002A;
pub const CMD_SET_SECURE_CONNECTIONS: u16 = 0x002D;

// Management events handled by the read loop.
pub const EVT_COMMAND_COMPLETE: u16 = 0x0001;
pub const EVT_COMMAND_STATUS: u16 = 0x0002;
pub const EVT_CONTROLLER_ERROR: u16 = 0x0003;
pub const EVT_NEW_SETTINGS: u16 = 0x0006;
pub const EVT_LOCAL_NAME_CHANGED: u16 = 0x0008;
pub const EVT_DEVICE_CONNECTED: u16 = 0x000B;
pub const EVT_DEVICE_DISCONNECTED: u16 = 0x000C;

const LAST_KNOWN_EVENT: u16 = 0x0025;

// Controller settings bits, shared by `supported_settings` and
// `current_settings`.
pub const SETTING_POWERED: u32 = 1 << 0;
pub const SETTING_CONNECTABLE: u32 = 1 << 1;
pub const SETTING_FAST_CONNECTABLE: u32 = 1 << 2;
pub const SETTING_DISCOVERABLE: u32 = 1 << 3;
pub const SETTING_BONDABLE: u32 = 1 << 4;
pub const SETTING_LINK_LEVEL_SECURITY: u32 = 1 << 5;
pub const SETTING_SECURE_SIMPLE_PAIRING: u32 = 1 << 6;
pub const SETTING_BREDR: u32 = 1 << 7;
pub const SETTING_HIGH_SPEED: u32 = 1 << 8;
pub const SETTING_LOW_ENERGY: u32 = 1 << 9;
pub const SETTING_ADVERTISING: u32 = 1 << 10;
pub const SETTING_SECURE_CONNECTIONS: u32 = 1 << 11;
pub const SETTING_DEBUG_KEYS: u32 = 1 << 12;
pub const SETTING_PRIVACY: u32 = 1 << 13;
pub const SETTING_CONTROLLER_CONFIGURATION: u32 = 1 << 14;
pub const SETTING_STATIC_ADDRESS: u32 = 1 << 15;

const MAX_NAME_BUF: usize = 249;
const MAX_SHORT_NAME_BUF: usize = 11;

/// Typed failures of the management protocol.
#[derive(Debug, Error)]
pub enum HciError {
    #[error("timed out waiting for completion of {0}")]
    Timeout(&'static str),
    #[error("{command} failed with status {status:#04x}")]
    CommandFailed { command: &'static str, status: u8 },
    #[error("HCI event truncated ({0} bytes)")]
    TruncatedEvent(usize),
}

/// Cached controller state, refreshed each time the adapter reports it.
#[derive(Debug, Clone, Default)]
pub struct ControllerInformation {
    pub address: [u8; 6],
    pub bt_version: u8,
    pub manufacturer: u16,
    pub supported_settings: u32,
    pub current_settings: u32,
    pub class_of_device: [u8; 3],
    pub name: String,
    pub short_name: String,
}

impl ControllerInformation {
    pub fn is_set(&self, bit: u32) -> bool {
        self.current_settings & bit != 0
    }

    /// `AA:BB:CC:DD:EE:FF` rendering of the controller address.
    pub fn address_string(&self) -> String {
        self.address
            .iter()
            .rev()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Human-readable rendering of a settings mask.
pub fn settings_string(bits: u32) -> String {
    let names = [
        (SETTING_POWERED, "Powered"),
        (SETTING_CONNECTABLE, "Connectable"),
        (SETTING_FAST_CONNECTABLE, "FC"),
        (SETTING_DISCOVERABLE, "Discov"),
        (SETTING_BONDABLE, "Bondable"),
        (SETTING_LINK_LEVEL_SECURITY, "LLS"),
        (SETTING_SECURE_SIMPLE_PAIRING, "SSP"),
        (SETTING_BREDR, "BR/EDR"),
        (SETTING_HIGH_SPEED, "HS"),
        (SETTING_LOW_ENERGY, "LE"),
        (SETTING_ADVERTISING, "Adv"),
        (SETTING_SECURE_CONNECTIONS, "SC"),
        (SETTING_DEBUG_KEYS, "DebugKeys"),
        (SETTING_PRIVACY, "Privacy"),
        (SETTING_CONTROLLER_CONFIGURATION, "ControllerConfig"),
        (SETTING_STATIC_ADDRESS, "StaticAddr"),
    ];

    names
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Name of a management command code; `"Unknown"` outside `0x0001..=0x0043`.
pub fn command_name(code: u16) -> &'static str {
    const NAMES: [&str; 0x43] = [
        "Read Version Information",
        "Read Supported Commands",
        "Read Controller Index List",
        "Read Controller Information",
        "Set Powered",
        "Set Discoverable",
        "Set Connectable",
        "Set Fast Connectable",
        "Set Bondable",
        "Set Link Security",
        "Set Secure Simple Pairing",
        "Set High Speed",
        "Set Low Energy",
        "Set Device Class",
        "Set Local Name",
        "Add UUID",
        "Remove UUID",
        "Load Link Keys",
        "Load Long Term Keys",
        "Disconnect",
        "Get Connections",
        "PIN Code Reply",
        "PIN Code Negative Reply",
        "Set IO Capability",
        "Pair Device",
        "Cancel Pair Device",
        "Unpair Device",
        "User Confirmation Reply",
        "User Confirmation Negative Reply",
        "User Passkey Reply",
        "User Passkey Negative Reply",
        "Read Local Out Of Band Data",
        "Add Remote Out Of Band Data",
        "Remove Remote Out Of Band Data",
        "Start Discovery",
        "Stop Discovery",
        "Confirm Name",
        "Block Device",
        "Unblock Device",
        "Set Device ID",
        "Set Advertising",
        "Set BR/EDR",
        "Set Static Address",
        "Set Scan Parameters",
        "Set Secure Connections",
        "Set Debug Keys",
        "Set Privacy",
        "Load Identity Resolving Keys",
        "Get Connection Information",
        "Get Clock Information",
        "Add Device",
        "Remove Device",
        "Load Connection Parameters",
        "Read Unconfigured Controller Index List",
        "Read Controller Configuration Information",
        "Set External Configuration",
        "Set Public Address",
        "Start Service Discovery",
        "Read Local Out Of Band Extended Data",
        "Read Extended Controller Index List",
        "Read Advertising Features",
        "Add Advertising",
        "Remove Advertising",
        "Get Advertising Size Information",
        "Start Limited Discovery",
        "Read Extended Controller Information",
        "Set Appearance",
    ];

    if code == 0 || code as usize > NAMES.len() {
        "Unknown"
    } else {
        NAMES[code as usize - 1]
    }
}

/// Name of a management event code; `"Unknown"` outside `0x0001..=0x0025`.
pub fn event_name(code: u16) -> &'static str {
    const NAMES: [&str; 0x25] = [
        "Command Complete",
        "Command Status",
        "Controller Error",
        "Index Added",
        "Index Removed",
        "New Settings",
        "Class Of Device Changed",
        "Local Name Changed",
        "New Link Key",
        "New Long Term Key",
        "Device Connected",
        "Device Disconnected",
        "Connect Failed",
        "PIN Code Request",
        "User Confirmation Request",
        "User Passkey Request",
        "Authentication Failed",
        "Device Found",
        "Discovering",
        "Device Blocked",
        "Device Unblocked",
        "Device Unpaired",
        "Passkey Notify",
        "New Identity Resolving Key",
        "New Signature Resolving Key",
        "Device Added",
        "Device Removed",
        "New Connection Parameter",
        "Unconfigured Index Added",
        "Unconfigured Index Removed",
        "New Configuration Options",
        "Extended Index Added",
        "Extended Index Removed",
        "Local Out Of Band Extended Data Updated",
        "Advertising Added",
        "Advertising Removed",
        "Extended Controller Information Changed",
    ];

    if code == 0 || code as usize > NAMES.len() {
        "Unknown"
    } else {
        NAMES[code as usize - 1]
    }
}

struct AdapterShared {
    socket: HciSocket,
    pending: Mutex<HashMap<u16, oneshot::Sender<u8>>>,
    info: Mutex<ControllerInformation>,
    version: Mutex<Option<(u8, u16)>>,
    connections: AtomicU32,
    running: AtomicBool,
}

/// The adapter controller. Owns the event thread and the typed command API
/// sits on top of it (see `mgmt`).
pub struct HciAdapter {
    shared: Arc<AdapterShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for HciAdapter {
    fn default() -> HciAdapter {
        HciAdapter::new()
    }
}

impl HciAdapter {
    pub fn new() -> HciAdapter {
        HciAdapter {
            shared: Arc::new(AdapterShared {
                socket: HciSocket::new(),
                pending: Mutex::new(HashMap::new()),
                info: Mutex::new(ControllerInformation::default()),
                version: Mutex::new(None),
                connections: AtomicU32::new(0),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// True while the event thread is alive and the socket is connected.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && self.shared.socket.is_connected()
    }

    /// Connect the socket and spawn the event thread. Re-entrant: a running
    /// adapter is left alone, a dead one is restarted.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let mut thread = lock(&self.thread);
        if let Some(handle) = thread.take() {
            // The previous event thread died (socket failure); reap it.
            let _ = handle.join();
        }

        self.shared
            .socket
            .connect()
            .context("failed to connect the HCI management socket")?;
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("hci-events".into())
            .spawn(move || run_event_loop(shared))
            .context("failed to spawn the HCI event thread")?;
        *thread = Some(handle);

        info!("HCI adapter started");
        Ok(())
    }

    /// Stop the event thread and close the socket. The thread observes the
    /// run state on its own; this join is bounded by the poll window.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.socket.disconnect();
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                warn!("HCI event thread panicked during shutdown");
            }
        }
        debug!("HCI adapter stopped");
    }

    /// Number of currently connected LE clients.
    pub fn active_connection_count(&self) -> u32 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// A copy of the latest controller snapshot.
    pub fn controller_information(&self) -> ControllerInformation {
        lock(&self.shared.info).clone()
    }

    /// Management API version, once `sync` has run: `(version, revision)`.
    pub fn version_information(&self) -> Option<(u8, u16)> {
        *lock(&self.shared.version)
    }

    /// Send one management command and wait for its completion event.
    ///
    /// Each in-flight command has its own completion channel, keyed by
    /// command code; a re-send of the same code cancels the stale waiter.
    pub async fn send_command(
        &self,
        code: u16,
        controller_index: u16,
        payload: &[u8],
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(code, tx);

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&code.to_le_bytes());
        frame.extend_from_slice(&controller_index.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);

        debug!(
            "sending management command {:#06x} ({})",
            code,
            command_name(code)
        );
        if let Err(e) = self.shared.socket.write(&frame) {
            lock(&self.shared.pending).remove(&code);
            return Err(e);
        }

        let status = match tokio::time::timeout(
            Duration::from_millis(config::MAX_EVENT_WAIT_MS),
            rx,
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                // Waiter replaced by a newer send of the same command.
                return Err(HciError::Timeout(command_name(code)).into());
            }
            Err(_) => {
                lock(&self.shared.pending).remove(&code);
                warn!(
                    "no completion for {} within {} ms",
                    command_name(code),
                    config::MAX_EVENT_WAIT_MS
                );
                return Err(HciError::Timeout(command_name(code)).into());
            }
        };

        if status != 0 {
            return Err(HciError::CommandFailed {
                command: command_name(code),
                status,
            }
            .into());
        }
        Ok(())
    }

    /// Refresh the version information and controller snapshot.
    pub async fn sync(&self, controller_index: u16) -> Result<()> {
        self.send_command(CMD_READ_VERSION, NON_CONTROLLER, &[]).await?;
        self.send_command(CMD_READ_CONTROLLER_INFO, controller_index, &[])
            .await?;
        Ok(())
    }
}

fn run_event_loop(shared: Arc<AdapterShared>) {
    let mut buf = vec![0u8; config::RESPONSE_MAX_SIZE];

    loop {
        match shared.socket.wait_for_data_or_shutdown(config::DATA_WAIT_TIME_MS) {
            WaitOutcome::Shutdown => break,
            WaitOutcome::Error => {
                shared.socket.disconnect();
                break;
            }
            WaitOutcome::Ready => {}
        }

        match shared.socket.read(&mut buf) {
            Ok(ReadOutcome::Data(n)) => process_events(&shared, &buf[..n]),
            Ok(ReadOutcome::WouldBlock) | Ok(ReadOutcome::Interrupted) => continue,
            Ok(ReadOutcome::Closed) => {
                shared.socket.disconnect();
                break;
            }
            Err(e) => {
                error!("HCI read failed: {:#}", e);
                shared.socket.disconnect();
                break;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    debug!("HCI event thread exiting");
}

/// Decode every event in a read batch. An event whose declared size overruns
/// the remaining buffer aborts the batch without crashing.
fn process_events(shared: &AdapterShared, mut data: &[u8]) {
    while !data.is_empty() {
        if data.len() < HEADER_SIZE {
            error!("{}", HciError::TruncatedEvent(data.len()));
            return;
        }

        let code = u16::from_le_bytes([data[0], data[1]]);
        let data_size = u16::from_le_bytes([data[4], data[5]]) as usize;

        if data_size > data.len() - HEADER_SIZE {
            error!(
                "event {:#06x} declares {} bytes but only {} remain; dropping batch",
                code,
                data_size,
                data.len() - HEADER_SIZE
            );
            return;
        }

        let payload = &data[HEADER_SIZE..HEADER_SIZE + data_size];
        handle_event(shared, code, payload);
        data = &data[HEADER_SIZE + data_size..];
    }
}

fn handle_event(shared: &AdapterShared, code: u16, payload: &[u8]) {
    match code {
        EVT_COMMAND_COMPLETE | EVT_COMMAND_STATUS => {
            if payload.len() < 3 {
                error!("{}", HciError::TruncatedEvent(payload.len()));
                return;
            }
            let command = u16::from_le_bytes([payload[0], payload[1]]);
            let status = payload[2];
            let params = &payload[3..];

            trace!(
                "{} for {} (status {:#04x})",
                event_name(code),
                command_name(command),
                status
            );

            if code == EVT_COMMAND_COMPLETE && status == 0 {
                apply_command_result(shared, command, params);
            }

            if let Some(waiter) = lock(&shared.pending).remove(&command) {
                let _ = waiter.send(status);
            }
        }
        EVT_CONTROLLER_ERROR => {
            let err = payload.first().copied().unwrap_or(0);
            error!("controller error {:#04x}", err);
        }
        EVT_NEW_SETTINGS => {
            if payload.len() >= 4 {
                let settings = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                lock(&shared.info).current_settings = settings;
                debug!("new settings: {}", settings_string(settings));
            }
        }
        EVT_LOCAL_NAME_CHANGED => {
            if let Some((name, short_name)) = parse_names(payload) {
                let mut info = lock(&shared.info);
                info.name = name;
                info.short_name = short_name;
            }
        }
        EVT_DEVICE_CONNECTED => {
            let count = shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
            info!("device connected (active connections: {})", count);
        }
        EVT_DEVICE_DISCONNECTED => {
            // Clamp at zero; the kernel can report a disconnect we never
            // saw the connect for.
            let _ = shared
                .connections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                    Some(c.saturating_sub(1))
                });
            info!(
                "device disconnected (active connections: {})",
                shared.connections.load(Ordering::SeqCst)
            );
        }
        code if code <= LAST_KNOWN_EVENT => {
            debug!("ignoring event {:#06x} ({})", code, event_name(code));
        }
        code => {
            warn!("event {:#06x} is out of the known range; ignoring", code);
        }
    }
}

/// Fold a successful command's return parameters into the snapshot.
fn apply_command_result(shared: &AdapterShared, command: u16, params: &[u8]) {
    match command {
        CMD_READ_VERSION => {
            if params.len() >= 3 {
                let version = params[0];
                let revision = u16::from_le_bytes([params[1], params[2]]);
                debug!("management API version {}.{}", version, revision);
                *lock(&shared.version) = Some((version, revision));
            }
        }
        CMD_READ_CONTROLLER_INFO => {
            if let Some(info) = parse_controller_information(params) {
                debug!(
                    "controller {} ({}), settings: {}",
                    info.address_string(),
                    info.name,
                    settings_string(info.current_settings)
                );
                *lock(&shared.info) = info;
            } else {
                error!("controller information response too short ({} bytes)", params.len());
            }
        }
        CMD_SET_LOCAL_NAME => {
            if let Some((name, short_name)) = parse_names(params) {
                let mut info = lock(&shared.info);
                info.name = name;
                info.short_name = short_name;
            }
        }
        CMD_SET_POWERED
        | CMD_SET_DISCOVERABLE
        | CMD_SET_CONNECTABLE
        | CMD_SET_BONDABLE
        | CMD_SET_LOW_ENERGY
        | CMD_SET_ADVERTISING
        | CMD_SET_BREDR
        | CMD_SET_SECURE_CONNECTIONS => {
            if params.len() >= 4 {
                let settings = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
                lock(&shared.info).current_settings = settings;
                debug!("settings now: {}", settings_string(settings));
            }
        }
        _ => {
            debug!(
                "no snapshot handling for completion of {}",
                command_name(command)
            );
        }
    }
}

fn parse_controller_information(params: &[u8]) -> Option<ControllerInformation> {
    // address[6] version[1] manufacturer[2] supported[4] current[4]
    // class_of_device[3] name[249] short_name[11]
    if params.len() < 6 + 1 + 2 + 4 + 4 + 3 + MAX_NAME_BUF + MAX_SHORT_NAME_BUF {
        return None;
    }

    let mut address = [0u8; 6];
    address.copy_from_slice(&params[0..6]);

    let mut class_of_device = [0u8; 3];
    class_of_device.copy_from_slice(&params[17..20]);

    Some(ControllerInformation {
        address,
        bt_version: params[6],
        manufacturer: u16::from_le_bytes([params[7], params[8]]),
        supported_settings: u32::from_le_bytes([params[9], params[10], params[11], params[12]]),
        current_settings: u32::from_le_bytes([params[13], params[14], params[15], params[16]]),
        class_of_device,
        name: string_from_fixed(&params[20..20 + MAX_NAME_BUF]),
        short_name: string_from_fixed(&params[20 + MAX_NAME_BUF..20 + MAX_NAME_BUF + MAX_SHORT_NAME_BUF]),
    })
}

fn parse_names(params: &[u8]) -> Option<(String, String)> {
    if params.len() < MAX_NAME_BUF + MAX_SHORT_NAME_BUF {
        return None;
    }
    Some((
        string_from_fixed(&params[..MAX_NAME_BUF]),
        string_from_fixed(&params[MAX_NAME_BUF..MAX_NAME_BUF + MAX_SHORT_NAME_BUF]),
    ))
}

fn string_from_fixed(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<AdapterShared> {
        HciAdapter::new().shared
    }

    fn frame(code: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&code.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_command_names_cover_the_known_range() {
        assert_eq!(command_name(0x0001), "Read Version Information");
        assert_eq!(command_name(0x0005), "Set Powered");
        assert_eq!(command_name(0x0029), "Set Advertising");
        assert_eq!(command_name(0x0043), "Set Appearance");
        assert_eq!(command_name(0x0000), "Unknown");
        assert_eq!(command_name(0x0044), "Unknown");
        assert_eq!(command_name(0xffff), "Unknown");
    }

    #[test]
    fn test_event_names_cover_the_known_range() {
        assert_eq!(event_name(0x0001), "Command Complete");
        assert_eq!(event_name(0x000B), "Device Connected");
        assert_eq!(event_name(0x0025), "Extended Controller Information Changed");
        assert_eq!(event_name(0x0026), "Unknown");
    }

    #[test]
    fn test_settings_string() {
        let s = settings_string(SETTING_POWERED | SETTING_LOW_ENERGY | SETTING_ADVERTISING);
        assert_eq!(s, "Powered, LE, Adv");
        assert_eq!(settings_string(0), "");
    }

    #[test]
    fn test_new_settings_event_updates_snapshot() {
        let shared = shared();
        let payload = (SETTING_POWERED | SETTING_LOW_ENERGY).to_le_bytes();
        process_events(&shared, &frame(EVT_NEW_SETTINGS, &payload));

        let info = lock(&shared.info);
        assert!(info.is_set(SETTING_POWERED));
        assert!(info.is_set(SETTING_LOW_ENERGY));
        assert!(!info.is_set(SETTING_BREDR));
    }

    #[test]
    fn test_connection_counter_clamps_at_zero() {
        let shared = shared();
        let disconnect = [0u8; 8];

        process_events(&shared, &frame(EVT_DEVICE_DISCONNECTED, &disconnect));
        assert_eq!(shared.connections.load(Ordering::SeqCst), 0);

        process_events(&shared, &frame(EVT_DEVICE_CONNECTED, &[0u8; 13]));
        process_events(&shared, &frame(EVT_DEVICE_CONNECTED, &[0u8; 13]));
        assert_eq!(shared.connections.load(Ordering::SeqCst), 2);

        process_events(&shared, &frame(EVT_DEVICE_DISCONNECTED, &disconnect));
        assert_eq!(shared.connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_event_is_dropped_without_crash() {
        let shared = shared();
        // Declares 100 payload bytes but carries none.
        let mut bad = Vec::new();
        bad.extend_from_slice(&EVT_NEW_SETTINGS.to_le_bytes());
        bad.extend_from_slice(&0u16.to_le_bytes());
        bad.extend_from_slice(&100u16.to_le_bytes());
        process_events(&shared, &bad);

        assert_eq!(lock(&shared.info).current_settings, 0);
    }

    #[test]
    fn test_every_event_in_a_batch_is_processed() {
        let shared = shared();
        let mut batch = frame(EVT_DEVICE_CONNECTED, &[0u8; 13]);
        batch.extend_from_slice(&frame(EVT_DEVICE_CONNECTED, &[0u8; 13]));
        batch.extend_from_slice(&frame(
            EVT_NEW_SETTINGS,
            &SETTING_POWERED.to_le_bytes(),
        ));

        process_events(&shared, &batch);
        assert_eq!(shared.connections.load(Ordering::SeqCst), 2);
        assert!(lock(&shared.info).is_set(SETTING_POWERED));
    }

    #[test]
    fn test_command_complete_parses_version() {
        let shared = shared();
        let mut payload = Vec::new();
        payload.extend_from_slice(&CMD_READ_VERSION.to_le_bytes());
        payload.push(0); // status
        payload.push(1); // version
        payload.extend_from_slice(&22u16.to_le_bytes()); // revision
        process_events(&shared, &frame(EVT_COMMAND_COMPLETE, &payload));

        assert_eq!(*lock(&shared.version), Some((1, 22)));
    }

    #[test]
    fn test_controller_information_parse() {
        let mut params = Vec::new();
        params.extend_from_slice(&[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]); // address (LE order)
        params.push(8); // bt version
        params.extend_from_slice(&2u16.to_le_bytes()); // manufacturer
        params.extend_from_slice(&0xffffu32.to_le_bytes()); // supported
        params.extend_from_slice(&(SETTING_POWERED | SETTING_LOW_ENERGY).to_le_bytes());
        params.extend_from_slice(&[0, 0, 0]); // class of device
        let mut name = [0u8; MAX_NAME_BUF];
        name[..4].copy_from_slice(b"demo");
        params.extend_from_slice(&name);
        let mut short = [0u8; MAX_SHORT_NAME_BUF];
        short[..2].copy_from_slice(b"dm");
        params.extend_from_slice(&short);

        let info = parse_controller_information(&params).unwrap();
        assert_eq!(info.address_string(), "11:22:33:44:55:66");
        assert_eq!(info.bt_version, 8);
        assert_eq!(info.name, "demo");
        assert_eq!(info.short_name, "dm");
        assert!(info.is_set(SETTING_POWERED));
    }

    #[test]
    fn test_command_complete_wakes_registered_waiter() {
        let shared = shared();
        let (tx, mut rx) = oneshot::channel();
        lock(&shared.pending).insert(CMD_SET_POWERED, tx);

        let mut payload = Vec::new();
        payload.extend_from_slice(&CMD_SET_POWERED.to_le_bytes());
        payload.push(0x11); // status: rejected
        process_events(&shared, &frame(EVT_COMMAND_COMPLETE, &payload));

        assert_eq!(rx.try_recv().unwrap(), 0x11);
    }
}
