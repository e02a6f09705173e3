//! GATT UUID handling.
//!
//! Services, characteristics and descriptors may be declared with the
//! Bluetooth SIG 16-bit short form (`"180A"`); it expands onto the Bluetooth
//! base UUID as `0000XXXX-0000-1000-8000-00805F9B34FB`. Full 128-bit forms
//! are accepted as-is and normalized to uppercase hyphenated form.

use anyhow::{bail, Context, Result};
use uuid::Uuid;

const BLUETOOTH_BASE_SUFFIX: &str = "-0000-1000-8000-00805F9B34FB";

/// A normalized 128-bit GATT UUID (uppercase, hyphenated).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattUuid {
    canonical: String,
}

impl GattUuid {
    /// Parse a short (4 hex digits) or long UUID string.
    pub fn parse(input: &str) -> Result<GattUuid> {
        let input = input.trim();

        if input.len() == 4 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(GattUuid {
                canonical: format!("0000{}{}", input.to_ascii_uppercase(), BLUETOOTH_BASE_SUFFIX),
            });
        }

        let parsed = Uuid::parse_str(input)
            .with_context(|| format!("not a valid GATT UUID: '{}'", input))?;
        if input.len() != 36 {
            bail!("GATT UUIDs must be 4-digit short form or hyphenated 128-bit form: '{}'", input);
        }

        Ok(GattUuid {
            canonical: parsed.hyphenated().to_string().to_ascii_uppercase(),
        })
    }

    /// The canonical uppercase hyphenated form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The 128-bit value behind the canonical form.
    pub fn to_uuid(&self) -> Uuid {
        // The canonical string was produced from a validated parse.
        Uuid::parse_str(&self.canonical).unwrap_or(Uuid::nil())
    }
}

impl std::fmt::Display for GattUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_form_expands_to_base_uuid() {
        let uuid = GattUuid::parse("180A").unwrap();
        assert_eq!(uuid.as_str(), "0000180A-0000-1000-8000-00805F9B34FB");
    }

    #[test]
    fn test_short_form_round_trips_to_same_128_bit_value() {
        let expanded = GattUuid::parse("180A").unwrap();
        let reparsed = GattUuid::parse(expanded.as_str()).unwrap();
        assert_eq!(expanded.to_uuid(), reparsed.to_uuid());
        assert_eq!(expanded.to_uuid().as_u128() >> 96, 0x0000180A);
    }

    #[test]
    fn test_long_form_normalizes_to_uppercase() {
        let uuid = GattUuid::parse("00000002-1e3c-fad4-74e2-97a033f1bfaa").unwrap();
        assert_eq!(uuid.as_str(), "00000002-1E3C-FAD4-74E2-97A033F1BFAA");
    }

    #[test]
    fn test_invalid_forms_are_rejected() {
        assert!(GattUuid::parse("18").is_err());
        assert!(GattUuid::parse("XYZW").is_err());
        assert!(GattUuid::parse("0000180A00001000800000805F9B34FB").is_err());
        assert!(GattUuid::parse("not-a-uuid").is_err());
    }
}
