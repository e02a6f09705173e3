//! The host-facing server handle.
//!
//! `GattServer::start` spawns the engine on its own thread (with its own
//! tokio runtime) and blocks until initialization either reaches `Running`
//! or fails. Shutdown is split the same way the embedding API splits it:
//! a non-blocking trigger and a joining `wait`.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tracing::{error, info, warn};

use crate::builder::ServerDescription;
use crate::config;
use crate::engine::{self, Engine};
use crate::logger;
use crate::state::{self, Health, RunState};

pub struct GattServer {
    thread: Option<std::thread::JoinHandle<()>>,
}

impl GattServer {
    /// Start the server and block up to `max_async_init_timeout` for it to
    /// reach `Running`.
    ///
    /// Run state and health are process-wide and monotonic, so a process
    /// hosts one server lifecycle; a second `start` fails.
    pub fn start(
        description: ServerDescription,
        max_async_init_timeout: Duration,
    ) -> Result<GattServer> {
        logger::init_tracing();

        if state::run_state() != RunState::Uninitialized {
            bail!(
                "a server lifecycle has already run in this process (state: {})",
                state::run_state().as_str()
            );
        }

        info!("starting GATT server '{}'", description.advertising_name());

        let thread = std::thread::Builder::new()
            .name("gatt-server".to_string())
            .spawn(move || run_engine_thread(description))
            .map_err(|e| anyhow!("server thread was unable to start: {}", e))?;
        let mut server = GattServer {
            thread: Some(thread),
        };

        // Wait for the engine to get past Initializing.
        let check = Duration::from_millis(config::MAX_ASYNC_INIT_CHECK_INTERVAL_MS);
        let mut waited = Duration::ZERO;
        while waited < max_async_init_timeout && state::run_state() <= RunState::Initializing {
            std::thread::sleep(check);
            waited += check;
        }

        if waited >= max_async_init_timeout && state::run_state() <= RunState::Initializing {
            error!("server initialization timed out");
            state::set_health(Health::FailedInit);
            engine::trigger_shutdown();
        }

        if state::run_state() != RunState::Running {
            if !server.wait() {
                warn!("unable to stop the server after a failed start");
            }
            bail!("server failed to start (health: {})", state::health().as_str());
        }

        info!("GATT server has started");
        Ok(server)
    }

    /// Begin shutdown without waiting for it.
    pub fn trigger_shutdown(&self) {
        engine::trigger_shutdown();
    }

    /// Join the engine thread. Returns `true` on a clean stop. Join
    /// problems are reported as warnings; resources were released by the
    /// engine's own teardown.
    pub fn wait(&mut self) -> bool {
        if state::run_state() <= RunState::Running {
            info!("waiting for the GATT server to stop");
        }

        match self.thread.take() {
            None => {
                warn!("server thread was already joined");
                true
            }
            Some(handle) => {
                if std::thread::current().id() == handle.thread().id() {
                    warn!("deadlock avoided in wait() (the server thread tried to join itself)");
                    return false;
                }
                match handle.join() {
                    Ok(()) => true,
                    Err(_) => {
                        warn!("server thread panicked before joining");
                        false
                    }
                }
            }
        }
    }

    /// Trigger shutdown and block until the server has stopped.
    pub fn shutdown_and_wait(&mut self) -> bool {
        if state::is_server_running() {
            self.trigger_shutdown();
        }
        self.wait()
    }
}

fn run_engine_thread(description: ServerDescription) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            logger::fatal(format!("failed to build the engine runtime: {}", e));
            state::set_health(Health::FailedInit);
            state::set_run_state(RunState::Stopped);
            return;
        }
    };

    runtime.block_on(Engine::new(description).run());
}
