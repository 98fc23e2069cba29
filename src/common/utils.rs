//! Utility functions for ringkv

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum accepted key length in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Last timestamp handed out by [`timestamp_now_micros`].
static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Human-readable size for logs, e.g. `1.50 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let (size, unit) = UNITS[1..]
        .iter()
        .fold((bytes as f64, UNITS[0]), |(size, unit), next| {
            if size >= 1024.0 {
                (size / 1024.0, *next)
            } else {
                (size, unit)
            }
        });
    format!("{:.2} {}", size, unit)
}

/// Parse `<number><unit>` with unit `ms`, `s`, `m` or `h`.
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let invalid = || crate::Error::InvalidConfig(format!("invalid duration: {:?}", s));
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (digits, unit) = s.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let millis_per_unit = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return Err(invalid()),
    };
    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Wall-clock time in microseconds since the Unix epoch.
///
/// Strictly increasing within the process: two writes never share a
/// timestamp even when they land in the same microsecond. Never returns 0.
pub fn timestamp_now_micros() -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate key (must be non-empty, reasonable length)
pub fn validate_key(key: &[u8]) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidKey("key cannot be empty".into()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(crate::Error::InvalidKey(format!(
            "key too long (max {} bytes)",
            MAX_KEY_LEN
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.00 MB");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 2s ").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        for bad in ["", "10", "ms", "1.5s", "10x", "-1s"] {
            assert!(parse_duration(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut prev = timestamp_now_micros();
        assert!(prev > 0);
        for _ in 0..10_000 {
            let next = timestamp_now_micros();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key(b"normal-key").is_ok());
        assert!(validate_key(b"").is_err());
        assert!(validate_key(&[b'x'; 2000]).is_err());
    }
}
