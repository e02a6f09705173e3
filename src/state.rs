//! Process-wide run state and health.
//!
//! Both values are written only by the lifecycle engine and read everywhere,
//! including from the HCI event thread and host threads. Run state advances
//! forward only; the single allowed shortcut is `Initializing -> Stopped`
//! when initialization fails.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use tokio::sync::Notify;
use tracing::warn;

use crate::logger;

/// Lifecycle stage of the server, from construction to teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunState {
    Uninitialized = 0,
    Initializing = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            0 => RunState::Uninitialized,
            1 => RunState::Initializing,
            2 => RunState::Running,
            3 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }

    /// Human-readable name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Uninitialized => "Uninitialized",
            RunState::Initializing => "Initializing",
            RunState::Running => "Running",
            RunState::Stopping => "Stopping",
            RunState::Stopped => "Stopped",
        }
    }
}

/// Health of the server as observed after `wait` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Health {
    Ok = 0,
    FailedInit = 1,
    FailedRun = 2,
}

impl Health {
    fn from_u8(v: u8) -> Health {
        match v {
            0 => Health::Ok,
            1 => Health::FailedInit,
            _ => Health::FailedRun,
        }
    }

    /// Human-readable name of the health value.
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Ok => "Ok",
            Health::FailedInit => "Failed initialization",
            Health::FailedRun => "Failed run",
        }
    }
}

static RUN_STATE: AtomicU8 = AtomicU8::new(RunState::Uninitialized as u8);
static HEALTH: AtomicU8 = AtomicU8::new(Health::Ok as u8);

/// Current run state of the server.
pub fn run_state() -> RunState {
    RunState::from_u8(RUN_STATE.load(Ordering::SeqCst))
}

/// Current health of the server.
pub fn health() -> Health {
    Health::from_u8(HEALTH.load(Ordering::SeqCst))
}

/// True while the server has not begun shutting down (state <= Running).
pub fn is_server_running() -> bool {
    run_state() <= RunState::Running
}

pub(crate) fn set_run_state(new_state: RunState) {
    let old = run_state();
    if new_state < old {
        warn!(
            "refusing run state regression: {} -> {}",
            old.as_str(),
            new_state.as_str()
        );
        return;
    }

    logger::status(format!(
        "** SERVER RUN STATE CHANGED: {} -> {}",
        old.as_str(),
        new_state.as_str()
    ));
    RUN_STATE.store(new_state as u8, Ordering::SeqCst);

    if new_state > RunState::Running {
        shutdown_notify().notify_waiters();
    }
}

pub(crate) fn set_health(new_health: Health) {
    let old = health();
    logger::status(format!(
        "** SERVER HEALTH CHANGED: {} -> {}",
        old.as_str(),
        new_health.as_str()
    ));
    HEALTH.store(new_health as u8, Ordering::SeqCst);
}

/// Wakes the engine loop promptly when the run state advances past `Running`.
pub(crate) fn shutdown_notify() -> &'static Notify {
    static NOTIFY: OnceLock<Notify> = OnceLock::new();
    NOTIFY.get_or_init(Notify::new)
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    RUN_STATE.store(RunState::Uninitialized as u8, Ordering::SeqCst);
    HEALTH.store(Health::Ok as u8, Ordering::SeqCst);
}

#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_names() {
        assert_eq!(RunState::Uninitialized.as_str(), "Uninitialized");
        assert_eq!(RunState::Running.as_str(), "Running");
        assert_eq!(RunState::Stopped.as_str(), "Stopped");
        assert_eq!(Health::Ok.as_str(), "Ok");
        assert_eq!(Health::FailedRun.as_str(), "Failed run");
    }

    #[test]
    fn test_run_state_only_advances() {
        let _guard = test_guard();
        reset_for_tests();

        set_run_state(RunState::Initializing);
        set_run_state(RunState::Running);
        assert_eq!(run_state(), RunState::Running);

        // A regression is ignored.
        set_run_state(RunState::Initializing);
        assert_eq!(run_state(), RunState::Running);

        set_run_state(RunState::Stopping);
        set_run_state(RunState::Stopped);
        assert_eq!(run_state(), RunState::Stopped);
        assert!(!is_server_running());

        reset_for_tests();
    }

    #[test]
    fn test_init_failure_shortcut_allowed() {
        let _guard = test_guard();
        reset_for_tests();

        set_run_state(RunState::Initializing);
        set_run_state(RunState::Stopped);
        assert_eq!(run_state(), RunState::Stopped);

        reset_for_tests();
    }
}
