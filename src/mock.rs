//! Simulated controller for tests and CI machines without Bluetooth
//! hardware. Applies reconciliation steps to an in-memory settings mask the
//! way a real adapter would respond to the management commands.

use crate::hci_adapter::{
    ControllerInformation, SETTING_ADVERTISING, SETTING_BONDABLE, SETTING_BREDR,
    SETTING_CONNECTABLE, SETTING_LOW_ENERGY, SETTING_POWERED, SETTING_SECURE_CONNECTIONS,
};
use crate::reconcile::AdapterStep;

/// An in-memory controller: everything off, names empty.
#[derive(Debug, Default)]
pub struct MockController {
    pub info: ControllerInformation,
}

impl MockController {
    pub fn new() -> MockController {
        MockController {
            info: ControllerInformation {
                supported_settings: 0xffff,
                ..ControllerInformation::default()
            },
        }
    }

    /// Mutate the simulated settings the way the adapter would.
    pub fn apply(&mut self, step: &AdapterStep) {
        match step {
            AdapterStep::PowerOff => self.clear(SETTING_POWERED),
            AdapterStep::PowerOn => self.set(SETTING_POWERED, true),
            AdapterStep::EnableLe => self.set(SETTING_LOW_ENERGY, true),
            AdapterStep::SetBredr(on) => self.set(SETTING_BREDR, *on),
            AdapterStep::SetSecureConnections(on) => self.set(SETTING_SECURE_CONNECTIONS, *on),
            AdapterStep::SetBondable(on) => self.set(SETTING_BONDABLE, *on),
            AdapterStep::SetConnectable(on) => self.set(SETTING_CONNECTABLE, *on),
            AdapterStep::SetAdvertising(on) => self.set(SETTING_ADVERTISING, *on),
            AdapterStep::SetName { name, short_name } => {
                self.info.name = name.clone();
                self.info.short_name = short_name.clone();
            }
        }
    }

    fn set(&mut self, bit: u32, on: bool) {
        if on {
            self.info.current_settings |= bit;
        } else {
            self.info.current_settings &= !bit;
        }
    }

    fn clear(&mut self, bit: u32) {
        self.set(bit, false);
    }
}
