//! Fixed-point encodings and Mac-epoch timestamps.
//!
//! QuickTime stores rational values as binary fixed point (16.16 for
//! rates and dimensions, 2.30 for matrix perspective terms, 8.8 for
//! audio volume) and timestamps as seconds since 1904-01-01 UTC.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1904-01-01 and 1970-01-01 (both UTC).
pub const MAC_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Encode a value as unsigned 16.16 fixed point.
#[inline]
pub fn fixed_16_16(value: f64) -> u32 {
    (value * 65536.0).round() as u32
}

/// Encode a value as signed 2.30 fixed point.
#[inline]
pub fn fixed_2_30(value: f64) -> u32 {
    ((value * 1_073_741_824.0).round() as i64) as u32
}

/// Encode a value as unsigned 8.8 fixed point.
#[inline]
pub fn fixed_8_8(value: f64) -> u16 {
    (value * 256.0).round() as u16
}

/// Current time in seconds since the Mac epoch.
///
/// Saturates at `u32::MAX` in 2040; the 32-bit header fields leave no
/// wider representation.
pub fn mac_timestamp_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    mac_timestamp_from_unix(unix)
}

/// Convert seconds since the Unix epoch to seconds since the Mac epoch.
#[inline]
pub fn mac_timestamp_from_unix(unix_secs: u64) -> u32 {
    unix_secs
        .saturating_add(MAC_EPOCH_OFFSET)
        .min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_16_16() {
        assert_eq!(fixed_16_16(1.0), 0x0001_0000);
        assert_eq!(fixed_16_16(72.0), 0x0048_0000);
        assert_eq!(fixed_16_16(0.5), 0x0000_8000);
        assert_eq!(fixed_16_16(0.0), 0);
    }

    #[test]
    fn test_fixed_2_30() {
        assert_eq!(fixed_2_30(1.0), 0x4000_0000);
        assert_eq!(fixed_2_30(0.0), 0);
    }

    #[test]
    fn test_fixed_8_8() {
        assert_eq!(fixed_8_8(1.0), 0x0100);
        assert_eq!(fixed_8_8(0.5), 0x0080);
    }

    #[test]
    fn test_mac_timestamp() {
        // 1970-01-01 in Mac epoch seconds.
        assert_eq!(mac_timestamp_from_unix(0), 2_082_844_800);
        // Saturation instead of wraparound.
        assert_eq!(mac_timestamp_from_unix(u64::MAX), u32::MAX);
    }
}
