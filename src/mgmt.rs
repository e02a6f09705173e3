//! Typed management commands for adapter configuration.
//!
//! Thin, typed wrappers over `HciAdapter::send_command` for the handful of
//! settings the framework drives, plus the name-length rules the management
//! API imposes.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::hci_adapter::{
    HciAdapter, CMD_SET_ADVERTISING, CMD_SET_BONDABLE, CMD_SET_BREDR, CMD_SET_CONNECTABLE,
    CMD_SET_DISCOVERABLE, CMD_SET_LOCAL_NAME, CMD_SET_LOW_ENERGY, CMD_SET_POWERED,
    CMD_SET_SECURE_CONNECTIONS,
};

/// Longest adapter name accepted by the management API, in bytes.
pub const MAX_ADVERTISING_NAME_LENGTH: usize = 248;

/// Longest adapter short name accepted by the management API, in bytes.
pub const MAX_ADVERTISING_SHORT_NAME_LENGTH: usize = 10;

const NAME_BUF: usize = MAX_ADVERTISING_NAME_LENGTH + 1;
const SHORT_NAME_BUF: usize = MAX_ADVERTISING_SHORT_NAME_LENGTH + 1;

/// Typed command surface for one controller.
pub struct Mgmt {
    adapter: Arc<HciAdapter>,
    controller_index: u16,
}

impl Mgmt {
    pub fn new(adapter: Arc<HciAdapter>, controller_index: u16) -> Mgmt {
        Mgmt {
            adapter,
            controller_index,
        }
    }

    /// Refresh version information and the controller snapshot.
    pub async fn sync(&self) -> Result<()> {
        self.adapter.sync(self.controller_index).await
    }

    pub async fn set_powered(&self, on: bool) -> Result<()> {
        self.set_state("Powered", CMD_SET_POWERED, on as u8).await
    }

    pub async fn set_le(&self, on: bool) -> Result<()> {
        self.set_state("LowEnergy", CMD_SET_LOW_ENERGY, on as u8).await
    }

    pub async fn set_bredr(&self, on: bool) -> Result<()> {
        self.set_state("BR/EDR", CMD_SET_BREDR, on as u8).await
    }

    /// 0 = off, 1 = on, 2 = secure-connections-only mode.
    pub async fn set_secure_connections(&self, mode: u8) -> Result<()> {
        self.set_state("SecureConnections", CMD_SET_SECURE_CONNECTIONS, mode)
            .await
    }

    pub async fn set_bondable(&self, on: bool) -> Result<()> {
        self.set_state("Bondable", CMD_SET_BONDABLE, on as u8).await
    }

    pub async fn set_connectable(&self, on: bool) -> Result<()> {
        self.set_state("Connectable", CMD_SET_CONNECTABLE, on as u8).await
    }

    /// 0 = off, 1 = on (respecting connectable), 2 = connectable mode.
    pub async fn set_advertising(&self, mode: u8) -> Result<()> {
        self.set_state("Advertising", CMD_SET_ADVERTISING, mode).await
    }

    /// General discoverable mode with a bounded timeout in seconds
    /// (0 = no timeout).
    pub async fn set_discoverable(&self, mode: u8, timeout_seconds: u16) -> Result<()> {
        let mut payload = [0u8; 3];
        payload[0] = mode;
        payload[1..3].copy_from_slice(&timeout_seconds.to_le_bytes());

        if let Err(e) = self
            .adapter
            .send_command(CMD_SET_DISCOVERABLE, self.controller_index, &payload)
            .await
        {
            warn!("failed to set Discoverable mode to {}: {:#}", mode, e);
            return Err(e);
        }
        debug!("Discoverable set to {} (timeout {}s)", mode, timeout_seconds);
        Ok(())
    }

    /// Set the adapter's name and short name, truncating to the management
    /// API's byte limits first.
    pub async fn set_name(&self, name: &str, short_name: &str) -> Result<()> {
        let name = truncate_name(name);
        let short_name = truncate_short_name(short_name);

        let mut payload = [0u8; NAME_BUF + SHORT_NAME_BUF];
        payload[..name.len()].copy_from_slice(name.as_bytes());
        payload[NAME_BUF..NAME_BUF + short_name.len()].copy_from_slice(short_name.as_bytes());

        if let Err(e) = self
            .adapter
            .send_command(CMD_SET_LOCAL_NAME, self.controller_index, &payload)
            .await
        {
            warn!("failed to set name: {:#}", e);
            return Err(e);
        }

        info!("name set to '{}', short name set to '{}'", name, short_name);
        Ok(())
    }

    async fn set_state(&self, setting_name: &str, command: u16, new_state: u8) -> Result<()> {
        if let Err(e) = self
            .adapter
            .send_command(command, self.controller_index, &[new_state])
            .await
        {
            warn!(
                "failed to set {} state to {}: {:#}",
                setting_name, new_state, e
            );
            return Err(e);
        }
        debug!("{} set to {}", setting_name, new_state);
        Ok(())
    }
}

/// Truncate to the 248-byte adapter name limit. Truncation is by byte, backed
/// off to the nearest UTF-8 boundary.
pub fn truncate_name(name: &str) -> &str {
    truncate_to(name, MAX_ADVERTISING_NAME_LENGTH)
}

/// Truncate to the 10-byte short name limit.
pub fn truncate_short_name(name: &str) -> &str {
    truncate_to(name, MAX_ADVERTISING_SHORT_NAME_LENGTH)
}

fn truncate_to(name: &str, limit: usize) -> &str {
    if name.len() <= limit {
        return name;
    }
    let mut end = limit;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_at_the_limit_pass_unchanged() {
        let name = "a".repeat(MAX_ADVERTISING_NAME_LENGTH);
        assert_eq!(truncate_name(&name), name);

        let short = "b".repeat(MAX_ADVERTISING_SHORT_NAME_LENGTH);
        assert_eq!(truncate_short_name(&short), short);
    }

    #[test]
    fn test_names_over_the_limit_are_truncated() {
        let name = "a".repeat(MAX_ADVERTISING_NAME_LENGTH + 1);
        assert_eq!(truncate_name(&name).len(), MAX_ADVERTISING_NAME_LENGTH);

        let short = "b".repeat(MAX_ADVERTISING_SHORT_NAME_LENGTH + 1);
        assert_eq!(
            truncate_short_name(&short).len(),
            MAX_ADVERTISING_SHORT_NAME_LENGTH
        );
    }

    #[test]
    fn test_truncation_respects_utf8_boundaries() {
        // Four-byte scorpion straddling the short-name limit.
        let name = format!("{}\u{1F982}", "abcdefgh");
        let truncated = truncate_short_name(&name);
        assert!(truncated.len() <= MAX_ADVERTISING_SHORT_NAME_LENGTH);
        assert_eq!(truncated, "abcdefgh");
    }

    #[test]
    fn test_short_ascii_names_untouched() {
        assert_eq!(truncate_name("demo"), "demo");
        assert_eq!(truncate_short_name(""), "");
    }
}
