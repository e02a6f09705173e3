//! The standard demonstration server description.
//!
//! This is the description the C embedding API serves: device information,
//! a battery service with change notifications, a current-time service
//! driven by tick events, a mutable text service, and an ASCII time
//! service. Hosts using the Rust API directly will usually build their own
//! description instead; this one doubles as a worked example of the
//! builder.
//!
//! Data flows through the host accessors under two keys:
//! - `"battery/level"`: one byte, the battery percentage;
//! - `"text/string"`: a UTF-8 string.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

use crate::builder::{ServerBuilder, ServerDescription};
use crate::gatt::ServerData;
use crate::update_queue::update_queue;
use crate::value::DataValue;

/// Build the standard description around the given data accessors.
pub fn standard_description(
    service_name: &str,
    advertising_name: &str,
    advertising_short_name: &str,
    data: ServerData,
) -> Result<ServerDescription> {
    ServerBuilder::new(service_name, advertising_name, advertising_short_name)
        .data(data)
        // Device Information (0x180A)
        .service("device", "180A", |service| {
            service
                .characteristic("mfgr_name", "2A29", &["read"], |chr| {
                    chr.on_read(|_ctx| Ok(b"Acme Inc.".to_vec()));
                })
                .characteristic("model_num", "2A24", &["read"], |chr| {
                    chr.on_read(|_ctx| Ok(b"Marvin-PA".to_vec()));
                });
        })
        // Battery Service (0x180F); the host pushes level updates through
        // the update queue, and the on-updated hook notifies subscribers.
        .service("battery", "180F", |service| {
            service.characteristic("level", "2A19", &["read", "notify"], |chr| {
                chr.on_read(|ctx| {
                    Ok(ctx
                        .get_data("battery/level")
                        .map(|v| v.as_bytes())
                        .unwrap_or_else(|| vec![0]))
                })
                .on_updated(|ctx| {
                    let Some(level) = ctx.get_data("battery/level") else {
                        return false;
                    };
                    ctx.notify_value(&DataValue::Bytes(level.as_bytes()));
                    true
                });
            });
        })
        // Current Time Service (0x1805); refreshed every tick.
        .service("time", "1805", |service| {
            service
                .characteristic("current", "2A2B", &["read", "notify"], |chr| {
                    chr.on_read(|_ctx| Ok(current_time_bytes()))
                        .on_event(1, |ctx| {
                            ctx.notify_value(&DataValue::Bytes(current_time_bytes()));
                        });
                })
                .characteristic("local", "2A0F", &["read"], |chr| {
                    // Timezone and DST offset; this server reports UTC.
                    chr.on_read(|_ctx| Ok(vec![0, 0]));
                });
        })
        // Custom mutable text service.
        .service("text", "00000001-1E3C-FAD4-74E2-97A033F1BFAA", |service| {
            service.characteristic(
                "string",
                "00000002-1E3C-FAD4-74E2-97A033F1BFAA",
                &["read", "write", "notify"],
                |chr| {
                    chr.on_read(|ctx| {
                        Ok(ctx
                            .get_data("text/string")
                            .map(|v| v.as_bytes())
                            .unwrap_or_default())
                    })
                    .on_write(|ctx, bytes| {
                        let text = String::from_utf8_lossy(bytes).into_owned();
                        if !ctx.set_data("text/string", &DataValue::Text(text)) {
                            return Err(anyhow!("host rejected the text update"));
                        }
                        // The idle drain picks this up and runs the
                        // on-updated hook below.
                        update_queue().notify_updated_characteristic(ctx.path().as_str());
                        Ok(())
                    })
                    .on_updated(|ctx| {
                        let Some(text) = ctx.get_data("text/string") else {
                            return false;
                        };
                        ctx.notify_value(&DataValue::Bytes(text.as_bytes()));
                        true
                    })
                    .descriptor("description", "2901", &["read"], |desc| {
                        desc.on_read(|_ctx| {
                            Ok(b"A mutable text string used for testing. Read and write to me, it tickles!".to_vec())
                        });
                    });
                },
            );
        })
        // Custom ASCII time service; a fresh value on every read.
        .service("ascii_time", "00000001-1E3D-FAD4-74E2-97A033F1BFEE", |service| {
            service.characteristic(
                "string",
                "00000002-1E3D-FAD4-74E2-97A033F1BFEE",
                &["read"],
                |chr| {
                    chr.on_read(|_ctx| Ok(ascii_time_string().into_bytes()))
                        .descriptor("description", "2901", &["read"], |desc| {
                            desc.on_read(|_ctx| {
                                Ok(b"Returns the local time each time it is read".to_vec())
                            });
                        });
                },
            );
        })
        .build()
}

/// The Current Time characteristic value: year (LE u16), month, day, hour,
/// minute, second, day-of-week (1 = Monday), fractions256, adjust reason.
pub fn current_time_bytes() -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let (year, month, day, hour, minute, second, weekday) = civil_from_unix(now);

    let mut bytes = Vec::with_capacity(10);
    bytes.extend_from_slice(&(year as u16).to_le_bytes());
    bytes.push(month as u8);
    bytes.push(day as u8);
    bytes.push(hour as u8);
    bytes.push(minute as u8);
    bytes.push(second as u8);
    bytes.push(weekday as u8);
    bytes.push(0); // fractions256
    bytes.push(0); // adjust reason
    bytes
}

/// `asctime`-style rendering: `Thu Jan  1 00:00:00 1970`.
pub fn ascii_time_string() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    format_ascii_time(now)
}

const WEEKDAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn format_ascii_time(unix_seconds: i64) -> String {
    let (year, month, day, hour, minute, second, weekday) = civil_from_unix(unix_seconds);
    format!(
        "{} {} {:2} {:02}:{:02}:{:02} {}",
        WEEKDAY_NAMES[(weekday - 1) as usize],
        MONTH_NAMES[(month - 1) as usize],
        day,
        hour,
        minute,
        second,
        year
    )
}

/// Split a unix timestamp into civil UTC fields.
/// Returns `(year, month, day, hour, minute, second, weekday)` with
/// weekday 1 = Monday .. 7 = Sunday.
fn civil_from_unix(unix_seconds: i64) -> (i64, u32, u32, u32, u32, u32, u32) {
    let days = unix_seconds.div_euclid(86_400);
    let tod = unix_seconds.rem_euclid(86_400);

    let (year, month, day) = civil_from_days(days);
    let weekday = ((days + 3).rem_euclid(7) + 1) as u32;

    (
        year,
        month,
        day,
        (tod / 3600) as u32,
        (tod % 3600 / 60) as u32,
        (tod % 60) as u32,
        weekday,
    )
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{CHARACTERISTIC_INTERFACE, SERVICE_INTERFACE};

    #[test]
    fn test_civil_from_unix_epoch() {
        // 1970-01-01 was a Thursday.
        assert_eq!(civil_from_unix(0), (1970, 1, 1, 0, 0, 0, 4));
    }

    #[test]
    fn test_civil_from_unix_known_date() {
        // 2018-06-24 12:30:45 UTC was a Sunday.
        assert_eq!(civil_from_unix(1_529_843_445), (2018, 6, 24, 12, 30, 45, 7));
    }

    #[test]
    fn test_ascii_time_epoch() {
        assert_eq!(format_ascii_time(0), "Thu Jan  1 00:00:00 1970");
    }

    #[test]
    fn test_current_time_bytes_layout() {
        let bytes = current_time_bytes();
        assert_eq!(bytes.len(), 10);
        let year = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert!(year >= 2026);
        assert!((1..=12).contains(&bytes[2]));
        assert!((1..=31).contains(&bytes[3]));
        assert!((1..=7).contains(&bytes[6]));
    }

    #[test]
    fn test_standard_description_shape() {
        let description =
            standard_description("demo", "Demo", "demo", ServerData::empty()).unwrap();
        let tree = description.tree();

        for path in [
            "/com/demo/device",
            "/com/demo/battery",
            "/com/demo/time",
            "/com/demo/text",
            "/com/demo/ascii_time",
        ] {
            assert!(
                tree.find_interface(path, SERVICE_INTERFACE).is_some(),
                "missing service at {}",
                path
            );
        }

        for path in [
            "/com/demo/device/mfgr_name",
            "/com/demo/device/model_num",
            "/com/demo/battery/level",
            "/com/demo/time/current",
            "/com/demo/time/local",
            "/com/demo/text/string",
            "/com/demo/ascii_time/string",
        ] {
            assert!(
                tree.find_interface(path, CHARACTERISTIC_INTERFACE).is_some(),
                "missing characteristic at {}",
                path
            );
        }

        // The battery and text characteristics react to queued updates.
        let (_, level) = tree
            .find_interface("/com/demo/battery/level", CHARACTERISTIC_INTERFACE)
            .unwrap();
        assert!(level.on_updated.is_some());
        let (_, text) = tree
            .find_interface("/com/demo/text/string", CHARACTERISTIC_INTERFACE)
            .unwrap();
        assert!(text.on_updated.is_some());

        // The current-time characteristic ticks every timer tick.
        let (_, current) = tree
            .find_interface("/com/demo/time/current", CHARACTERISTIC_INTERFACE)
            .unwrap();
        assert_eq!(current.tick_events.len(), 1);
        assert_eq!(current.tick_events[0].frequency, 1);
    }
}
