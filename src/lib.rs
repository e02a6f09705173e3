//! A user-space BLE GATT peripheral framework for Linux.
//!
//! The host declares a tree of GATT services, characteristics and
//! descriptors; the framework publishes it to remote BLE clients through
//! BlueZ. Three asynchronous worlds are kept in lockstep by one lifecycle
//! engine:
//!
//! 1. an HCI management client that configures and observes the local
//!    controller through the kernel's control socket ([`hci_adapter`],
//!    [`mgmt`]);
//! 2. a published object tree on the system message bus that answers
//!    introspection and property queries, dispatches method calls and
//!    emits change signals ([`gatt`], [`bridge`]);
//! 3. an application-facing update channel (data accessors plus the
//!    process-wide update queue) through which the host mutates values and
//!    fires notifications ([`update_queue`]).
//!
//! Typical use:
//!
//! ```no_run
//! use std::time::Duration;
//! use gatt_server::builder::ServerBuilder;
//!
//! let description = ServerBuilder::new("demo", "Demo", "demo")
//!     .service("device", "180A", |service| {
//!         service.characteristic("mfgr_name", "2A29", &["read"], |chr| {
//!             chr.on_read(|_ctx| Ok(b"Acme Inc.".to_vec()));
//!         });
//!     })
//!     .build()?;
//!
//! let mut server = gatt_server::GattServer::start(description, Duration::from_secs(30))?;
//! // ... the tree is now live on the bus; push updates via the queue ...
//! gatt_server::update_queue().notify_updated_characteristic("/com/demo/device/mfgr_name");
//! server.shutdown_and_wait();
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! A C-compatible surface covering the same lifecycle lives in [`ffi`].

pub mod bridge;
pub mod builder;
pub mod config;
pub mod engine;
pub mod ffi;
pub mod gatt;
pub mod gatt_uuid;
pub mod hci_adapter;
pub mod hci_socket;
pub mod introspect;
pub mod logger;
pub mod mgmt;
pub mod object_path;
pub mod reconcile;
pub mod server;
pub mod standard;
pub mod state;
pub mod update_queue;
pub mod value;

#[cfg(any(test, feature = "ble-mock"))]
pub mod mock;

pub use builder::{ServerBuilder, ServerDescription};
pub use engine::trigger_shutdown;
pub use gatt::{InterfaceContext, ServerData};
pub use gatt_uuid::GattUuid;
pub use object_path::ObjectPath;
pub use server::GattServer;
pub use state::{health, is_server_running, run_state, Health, RunState};
pub use update_queue::{update_queue, UpdateQueue};
pub use value::DataValue;
