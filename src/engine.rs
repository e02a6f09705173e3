//! The lifecycle engine: initialization state processor, retry timer, main
//! event loop and teardown.
//!
//! Initialization is a re-entrant processor over nullable resources rather
//! than a numbered state machine: each pass performs the first missing step
//! and returns, so an out-of-order failure (a lost name, a vanished
//! adapter) is recovered by simply re-entering. Failed steps arm a retry
//! timestamp that the ~1 s periodic tick checks.
//!
//! The loop itself is cooperative: the periodic tick drives tick events and
//! retries, the ~10 ms idle tick drains the update queue, and the shutdown
//! notification ends it. Inbound bus dispatch runs on the connection's IO
//! task, which is also what lets the processor await `RegisterApplication`
//! inline without deadlocking on our own `GetManagedObjects`.

use std::sync::Arc;
use std::time::Duration;

use dbus::channel::{MatchingReceiver, Sender};
use dbus::message::MatchRule;
use dbus::nonblock::{MsgMatch, SyncConnection};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bridge::{self, BluezAdapter, DbusNotifier};
use crate::builder::ServerDescription;
use crate::config;
use crate::gatt::{ChangeNotifier, InterfaceContext, InterfaceKind, NullNotifier};
use crate::hci_adapter::{HciAdapter, DEFAULT_CONTROLLER_INDEX};
use crate::logger;
use crate::mgmt::Mgmt;
use crate::reconcile::{self, DesiredAdapterConfig};
use crate::state::{self, Health, RunState};
use crate::update_queue::update_queue;

/// Begin a graceful shutdown. Idempotent and non-blocking: the engine loop,
/// the HCI event thread and the transport all observe the state change at
/// their next poll boundary.
pub fn trigger_shutdown() {
    if state::run_state() > RunState::Running {
        warn!("ignoring call to shutdown (we are already shutting down)");
        return;
    }
    state::set_run_state(RunState::Stopping);
}

pub(crate) enum EngineEvent {
    /// The owned name was lost.
    NameLost,
    /// The connection's IO task ended.
    BusFailed(String),
}

pub(crate) struct Engine {
    description: Arc<ServerDescription>,
    adapter: Arc<HciAdapter>,
    controller_index: u16,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,

    // Initialization resources, in acquisition order. `None`/`false` means
    // the corresponding step has not completed yet.
    conn: Option<Arc<SyncConnection>>,
    io_task: Option<tokio::task::JoinHandle<()>>,
    name_acquired: bool,
    name_ever_acquired: bool,
    name_lost_match: Option<MsgMatch>,
    bluez_adapter: Option<BluezAdapter>,
    adapter_configured: bool,
    receive_token: Option<dbus::channel::Token>,
    app_registered: bool,

    retry_at: Option<Instant>,
}

impl Engine {
    pub(crate) fn new(description: ServerDescription) -> Engine {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Engine {
            description: Arc::new(description),
            adapter: Arc::new(HciAdapter::new()),
            controller_index: DEFAULT_CONTROLLER_INDEX,
            events_tx,
            events_rx,
            conn: None,
            io_task: None,
            name_acquired: false,
            name_ever_acquired: false,
            name_lost_match: None,
            bluez_adapter: None,
            adapter_configured: false,
            receive_token: None,
            app_registered: false,
            retry_at: None,
        }
    }

    pub(crate) async fn run(mut self) {
        state::set_run_state(RunState::Initializing);

        let mut periodic =
            tokio::time::interval(Duration::from_secs(config::PERIODIC_TIMER_FREQUENCY_SECONDS));
        periodic.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut idle = tokio::time::interval(Duration::from_millis(config::IDLE_FREQUENCY_MS));
        idle.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.process_init_states().await;

        enum Wakeup {
            Shutdown,
            Periodic,
            Idle,
            Event(EngineEvent),
        }

        loop {
            if state::run_state() > RunState::Running {
                break;
            }

            let wakeup = tokio::select! {
                _ = state::shutdown_notify().notified() => Wakeup::Shutdown,
                _ = periodic.tick() => Wakeup::Periodic,
                _ = idle.tick() => Wakeup::Idle,
                event = self.events_rx.recv() => match event {
                    Some(event) => Wakeup::Event(event),
                    None => Wakeup::Idle,
                },
            };

            match wakeup {
                Wakeup::Shutdown => break,
                Wakeup::Periodic => self.on_periodic_tick().await,
                Wakeup::Idle => self.on_idle_tick(),
                Wakeup::Event(event) => self.on_event(event).await,
            }
        }

        self.teardown().await;
        state::set_run_state(RunState::Stopped);
        info!("GATT server stopped");
    }

    async fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::NameLost => {
                self.name_acquired = false;
                if self.name_ever_acquired {
                    self.set_retry_failure();
                } else {
                    logger::fatal(format!(
                        "unable to acquire an owned name ('{}') on the bus",
                        self.description.owned_name()
                    ));
                    state::set_health(Health::FailedInit);
                    trigger_shutdown();
                }
            }
            EngineEvent::BusFailed(detail) => {
                logger::fatal(format!("lost the bus connection: {}", detail));
                if state::run_state() >= RunState::Running {
                    state::set_health(Health::FailedRun);
                } else {
                    state::set_health(Health::FailedInit);
                }
                trigger_shutdown();
            }
        }
    }

    async fn on_periodic_tick(&mut self) {
        if state::run_state() > RunState::Running {
            return;
        }

        if let Some(at) = self.retry_at {
            debug!("ticking retry timer");
            if Instant::now() >= at {
                self.retry_at = None;
                self.process_init_states().await;
            }
        }

        // Once registered, drive the tick events of published objects.
        if self.app_registered {
            match &self.conn {
                Some(conn) => {
                    let notifier = DbusNotifier::new(conn.clone());
                    self.description
                        .tree()
                        .tick_events(self.description.data(), &notifier);
                }
                None => {
                    self.description
                        .tree()
                        .tick_events(self.description.data(), &NullNotifier);
                }
            }
        }
    }

    /// Drain pending updates, oldest first. Handlers are non-blocking, so
    /// draining everything queued at this tick keeps the loop responsive.
    fn on_idle_tick(&mut self) {
        if state::run_state() != RunState::Running {
            return;
        }

        while let Some(entry) = update_queue().pop(false) {
            self.process_update(&entry);
        }
    }

    fn process_update(&self, entry: &str) {
        let Some((path, interface_name)) = entry.split_once('|') else {
            error!("queue entry '{}' is missing the separating token", entry);
            return;
        };

        let tree = self.description.tree();
        let Some((object, interface)) = tree.find_interface(path, interface_name) else {
            warn!(
                "unable to find interface for update: path[{}], name[{}]",
                path, interface_name
            );
            return;
        };

        if interface.kind != InterfaceKind::Characteristic {
            warn!(
                "update for non-characteristic interface '{}' at '{}' dropped",
                interface_name, path
            );
            return;
        }

        let notifier: Box<dyn ChangeNotifier> = match &self.conn {
            Some(conn) => Box::new(DbusNotifier::new(conn.clone())),
            None => Box::new(NullNotifier),
        };
        let ctx = InterfaceContext {
            tree,
            object,
            interface,
            data: self.description.data(),
            notifier: notifier.as_ref(),
            args: None,
        };
        debug!("processing updated value for '{}' at '{}'", interface_name, path);
        ctx.call_on_updated();
    }

    /// The state processor. Performs the first missing initialization step;
    /// completed steps fall through to the next check.
    async fn process_init_states(&mut self) {
        if state::run_state() > RunState::Running || self.retry_at.is_some() {
            return;
        }

        //
        // Bus connection
        //
        if self.conn.is_none() {
            debug!("acquiring bus connection");
            match dbus_tokio::connection::new_system_sync() {
                Ok((resource, conn)) => {
                    let tx = self.events_tx.clone();
                    self.io_task = Some(tokio::spawn(async move {
                        let err = resource.await;
                        let _ = tx.send(EngineEvent::BusFailed(err.to_string()));
                    }));
                    self.conn = Some(conn);
                }
                Err(e) => {
                    logger::fatal(format!("failed to get bus connection: {}", e));
                    state::set_health(Health::FailedInit);
                    trigger_shutdown();
                    return;
                }
            }
        }
        let Some(conn) = self.conn.clone() else { return };

        //
        // Owned name
        //
        if !self.name_acquired {
            let owned_name = self.description.owned_name();
            debug!("acquiring owned name: '{}'", owned_name);
            match bridge::request_owned_name(&conn, &owned_name).await {
                Ok(true) => {
                    self.name_acquired = true;
                    self.name_ever_acquired = true;
                    if self.name_lost_match.is_none() {
                        let tx = self.events_tx.clone();
                        match bridge::watch_name_lost(&conn, owned_name, move || {
                            let _ = tx.send(EngineEvent::NameLost);
                        })
                        .await
                        {
                            Ok(mm) => self.name_lost_match = Some(mm),
                            Err(e) => warn!("could not watch for NameLost: {:#}", e),
                        }
                    }
                }
                Ok(false) | Err(_) if self.name_ever_acquired => {
                    self.set_retry_failure();
                    return;
                }
                Ok(false) => {
                    logger::fatal(format!(
                        "unable to acquire an owned name ('{}') on the bus",
                        self.description.owned_name()
                    ));
                    state::set_health(Health::FailedInit);
                    trigger_shutdown();
                    return;
                }
                Err(e) => {
                    logger::fatal(format!("owned name request failed: {:#}", e));
                    state::set_health(Health::FailedInit);
                    trigger_shutdown();
                    return;
                }
            }
        }

        //
        // BlueZ GATT manager
        //
        if self.bluez_adapter.is_none() {
            debug!("finding BlueZ GattManager1 interface");
            match bridge::find_gatt_manager(&conn).await {
                Ok(Some(adapter)) => self.bluez_adapter = Some(adapter),
                Ok(None) => {
                    error!("unable to find a Bluetooth adapter with a GATT manager");
                    self.set_retry_failure();
                    return;
                }
                Err(e) => {
                    warn!("BlueZ is not answering yet: {:#}", e);
                    self.set_retry_failure();
                    return;
                }
            }
        }

        //
        // Controller configuration (through the management socket)
        //
        if !self.adapter_configured {
            debug!("configuring the Bluetooth controller");
            match self.configure_adapter().await {
                Ok(()) => self.adapter_configured = true,
                Err(e) => {
                    warn!("adapter configuration failed: {:#}", e);
                    self.set_retry_failure();
                    return;
                }
            }
        }

        //
        // Object registration on the bus
        //
        if self.receive_token.is_none() {
            debug!("registering object hierarchy with the bus");
            let description = self.description.clone();
            let dispatch_conn = conn.clone();
            let token = conn.start_receive(
                MatchRule::new_method_call(),
                Box::new(move |msg, _| {
                    if let Some(reply) =
                        bridge::dispatch_method_call(&msg, &dispatch_conn, &description)
                    {
                        if !msg.get_no_reply() {
                            let _ = dispatch_conn.send(reply);
                        }
                    }
                    true
                }),
            );
            self.receive_token = Some(token);
        }

        //
        // Application registration with BlueZ
        //
        if !self.app_registered {
            debug!("registering application with the BlueZ GATT manager");
            let Some(adapter) = self.bluez_adapter.clone() else {
                return;
            };
            match bridge::register_application(&conn, &adapter).await {
                Ok(()) => self.app_registered = true,
                Err(e) => {
                    error!("failed to register application: {:#}", e);
                    self.set_retry_failure();
                    return;
                }
            }
        }

        // Fully initialized. A health failure at this point means someone
        // flagged a problem mid-flight; honor it.
        if state::health() != Health::Ok {
            trigger_shutdown();
            return;
        }
        state::set_run_state(RunState::Running);
    }

    async fn configure_adapter(&mut self) -> anyhow::Result<()> {
        // Restart the event thread if a socket failure took it down.
        self.adapter.start()?;

        let mgmt = Mgmt::new(self.adapter.clone(), self.controller_index);
        mgmt.sync().await?;

        let info = self.adapter.controller_information();
        let desired = DesiredAdapterConfig {
            bredr: self.description.enable_bredr,
            secure_connections: self.description.enable_secure_connection,
            bondable: self.description.enable_bondable,
            connectable: self.description.enable_connectable,
            advertising: self.description.enable_advertising,
            name: self.description.advertising_name().to_string(),
            short_name: self.description.advertising_short_name().to_string(),
        };

        let steps = reconcile::plan(&info, &desired);
        if steps.is_empty() {
            info!("the Bluetooth adapter is already fully configured");
            return Ok(());
        }
        reconcile::apply(&mgmt, &steps).await
    }

    fn set_retry_failure(&mut self) {
        warn!(
            "will retry the failed operation in about {} seconds",
            config::RETRY_DELAY_SECONDS
        );
        self.retry_at =
            Some(Instant::now() + Duration::from_secs(config::RETRY_DELAY_SECONDS));
    }

    /// Release everything in reverse acquisition order. Runs on every exit
    /// path, including failed initialization.
    async fn teardown(&mut self) {
        self.adapter.stop();

        if let Some(conn) = &self.conn {
            if let Some(token) = self.receive_token.take() {
                conn.stop_receive(token);
            }
            if let Some(mm) = self.name_lost_match.take() {
                if let Err(e) = conn.remove_match(mm.token()).await {
                    warn!("failed to remove NameLost match: {}", e);
                }
            }
            if self.name_acquired {
                bridge::release_owned_name(conn, &self.description.owned_name()).await;
                self.name_acquired = false;
            }
        }

        self.app_registered = false;
        self.bluez_adapter = None;

        if let Some(io_task) = self.io_task.take() {
            io_task.abort();
        }
        self.conn = None;

        // The queue is defined to be empty once we report Stopped.
        update_queue().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_shutdown_is_idempotent() {
        let _guard = state::test_guard();
        state::reset_for_tests();

        state::set_run_state(RunState::Initializing);
        state::set_run_state(RunState::Running);

        trigger_shutdown();
        assert_eq!(state::run_state(), RunState::Stopping);

        // Second call is a no-op.
        trigger_shutdown();
        assert_eq!(state::run_state(), RunState::Stopping);

        state::reset_for_tests();
    }
}
