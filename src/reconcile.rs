//! Adapter configuration reconciliation.
//!
//! Compares the cached controller snapshot against the server's desired
//! configuration and produces the ordered list of management commands that
//! brings the adapter in line. The order is mandatory: BR/EDR changes are
//! rejected while LE is off, and several bits can only change while the
//! adapter is powered down, so the plan powers off first and back on last.

use anyhow::Result;
use tracing::{debug, info};

use crate::hci_adapter::{
    ControllerInformation, SETTING_ADVERTISING, SETTING_BONDABLE, SETTING_BREDR,
    SETTING_CONNECTABLE, SETTING_LOW_ENERGY, SETTING_POWERED, SETTING_SECURE_CONNECTIONS,
};
use crate::mgmt::{truncate_name, truncate_short_name, Mgmt};

/// The adapter state a server wants. Power and LE are always driven on;
/// the rest comes from the server description's flags.
#[derive(Debug, Clone, Default)]
pub struct DesiredAdapterConfig {
    pub bredr: bool,
    pub secure_connections: bool,
    pub bondable: bool,
    pub connectable: bool,
    pub advertising: bool,
    /// Empty string suppresses the name write.
    pub name: String,
    /// Empty string suppresses the short-name write.
    pub short_name: String,
}

/// One management command of a reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStep {
    PowerOff,
    EnableLe,
    SetBredr(bool),
    SetSecureConnections(bool),
    SetBondable(bool),
    SetConnectable(bool),
    SetAdvertising(bool),
    SetName { name: String, short_name: String },
    PowerOn,
}

/// Compute the steps that take `current` to `desired`. An empty plan means
/// the adapter is already configured.
pub fn plan(current: &ControllerInformation, desired: &DesiredAdapterConfig) -> Vec<AdapterStep> {
    let name = truncate_name(&desired.name);
    let short_name = truncate_short_name(&desired.short_name);

    let power_ok = current.is_set(SETTING_POWERED);
    let le_ok = current.is_set(SETTING_LOW_ENERGY);
    let bredr_ok = current.is_set(SETTING_BREDR) == desired.bredr;
    let sc_ok = current.is_set(SETTING_SECURE_CONNECTIONS) == desired.secure_connections;
    let bondable_ok = current.is_set(SETTING_BONDABLE) == desired.bondable;
    let connectable_ok = current.is_set(SETTING_CONNECTABLE) == desired.connectable;
    let advertising_ok = current.is_set(SETTING_ADVERTISING) == desired.advertising;
    let names_ok = (name.is_empty() || name == current.name)
        && (short_name.is_empty() || short_name == current.short_name);

    if power_ok
        && le_ok
        && bredr_ok
        && sc_ok
        && bondable_ok
        && connectable_ok
        && advertising_ok
        && names_ok
    {
        return Vec::new();
    }

    let mut steps = Vec::new();

    // Settings can only be changed while powered down.
    if power_ok {
        steps.push(AdapterStep::PowerOff);
    }

    // LE is always driven on; this framework is GATT-only.
    if !le_ok {
        steps.push(AdapterStep::EnableLe);
    }

    if !bredr_ok {
        steps.push(AdapterStep::SetBredr(desired.bredr));
    }
    if !sc_ok {
        steps.push(AdapterStep::SetSecureConnections(desired.secure_connections));
    }
    if !bondable_ok {
        steps.push(AdapterStep::SetBondable(desired.bondable));
    }
    if !connectable_ok {
        steps.push(AdapterStep::SetConnectable(desired.connectable));
    }
    if !advertising_ok {
        steps.push(AdapterStep::SetAdvertising(desired.advertising));
    }
    if !names_ok {
        steps.push(AdapterStep::SetName {
            name: name.to_string(),
            short_name: short_name.to_string(),
        });
    }

    steps.push(AdapterStep::PowerOn);
    steps
}

/// Apply a plan through the management command surface. The first failing
/// step aborts; the caller schedules a retry.
pub async fn apply(mgmt: &Mgmt, steps: &[AdapterStep]) -> Result<()> {
    for step in steps {
        debug!("reconciliation step: {:?}", step);
        match step {
            AdapterStep::PowerOff => mgmt.set_powered(false).await?,
            AdapterStep::EnableLe => mgmt.set_le(true).await?,
            AdapterStep::SetBredr(on) => mgmt.set_bredr(*on).await?,
            AdapterStep::SetSecureConnections(on) => {
                mgmt.set_secure_connections(*on as u8).await?
            }
            AdapterStep::SetBondable(on) => mgmt.set_bondable(*on).await?,
            AdapterStep::SetConnectable(on) => mgmt.set_connectable(*on).await?,
            AdapterStep::SetAdvertising(on) => mgmt.set_advertising(*on as u8).await?,
            AdapterStep::SetName { name, short_name } => {
                mgmt.set_name(name, short_name).await?
            }
            AdapterStep::PowerOn => mgmt.set_powered(true).await?,
        }
    }

    if !steps.is_empty() {
        info!("the Bluetooth adapter is fully configured");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockController;

    fn desired_demo() -> DesiredAdapterConfig {
        DesiredAdapterConfig {
            bredr: false,
            secure_connections: false,
            bondable: false,
            connectable: true,
            advertising: true,
            name: "demo".to_string(),
            short_name: "demo".to_string(),
        }
    }

    #[test]
    fn test_configured_adapter_needs_no_steps() {
        let mut controller = MockController::new();
        controller.info.current_settings = SETTING_POWERED
            | SETTING_LOW_ENERGY
            | SETTING_CONNECTABLE
            | SETTING_ADVERTISING;
        controller.info.name = "demo".to_string();
        controller.info.short_name = "demo".to_string();

        assert!(plan(&controller.info, &desired_demo()).is_empty());
    }

    #[test]
    fn test_clean_state_plan_follows_the_mandatory_order() {
        let controller = MockController::new(); // everything off, names empty
        let steps = plan(&controller.info, &desired_demo());

        assert_eq!(
            steps,
            vec![
                AdapterStep::EnableLe,
                AdapterStep::SetConnectable(true),
                AdapterStep::SetAdvertising(true),
                AdapterStep::SetName {
                    name: "demo".to_string(),
                    short_name: "demo".to_string(),
                },
                AdapterStep::PowerOn,
            ]
        );
    }

    #[test]
    fn test_powered_adapter_is_powered_off_first_and_on_last() {
        let mut controller = MockController::new();
        controller.info.current_settings = SETTING_POWERED | SETTING_BREDR;

        let steps = plan(&controller.info, &desired_demo());
        assert_eq!(steps.first(), Some(&AdapterStep::PowerOff));
        assert_eq!(steps.last(), Some(&AdapterStep::PowerOn));
        assert!(steps.contains(&AdapterStep::SetBredr(false)));
    }

    #[test]
    fn test_applying_the_plan_reaches_the_desired_state() {
        let mut controller = MockController::new();
        let desired = desired_demo();

        for step in plan(&controller.info, &desired) {
            controller.apply(&step);
        }

        assert!(controller.info.is_set(SETTING_POWERED));
        assert!(controller.info.is_set(SETTING_LOW_ENERGY));
        assert!(controller.info.is_set(SETTING_CONNECTABLE));
        assert!(controller.info.is_set(SETTING_ADVERTISING));
        assert!(!controller.info.is_set(SETTING_BREDR));
        assert_eq!(controller.info.name, "demo");
        assert_eq!(controller.info.short_name, "demo");

        // Converged: a second pass plans nothing.
        assert!(plan(&controller.info, &desired).is_empty());
    }

    #[test]
    fn test_empty_names_suppress_the_name_write() {
        let controller = MockController::new();
        let mut desired = desired_demo();
        desired.name.clear();
        desired.short_name.clear();

        let steps = plan(&controller.info, &desired);
        assert!(!steps
            .iter()
            .any(|s| matches!(s, AdapterStep::SetName { .. })));
    }

    #[test]
    fn test_names_are_truncated_before_comparison() {
        let mut controller = MockController::new();
        controller.info.name = "a".repeat(248);

        let mut desired = desired_demo();
        desired.name = "a".repeat(249);
        desired.short_name.clear();
        // The truncated desired name matches what the controller has.
        let steps = plan(&controller.info, &desired);
        assert!(!steps
            .iter()
            .any(|s| matches!(s, AdapterStep::SetName { .. })));
    }
}
