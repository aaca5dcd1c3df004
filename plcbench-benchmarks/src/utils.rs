//! Formatting helpers for reports

use std::time::Duration;

/// Session or run length: milliseconds below a second, then seconds, then minutes
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{:.1}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.2}s", secs)
    } else {
        let whole = duration.as_secs();
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}

/// Format a byte rate or size with binary units
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut size = bytes;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0}{}", size, UNITS[0])
    } else {
        format!("{:.2}{}", size, UNITS[unit])
    }
}

pub fn format_rate(ops_per_sec: f64) -> String {
    format!("{:.2}/s", ops_per_sec)
}

/// Milliseconds with three decimals, or "no data"
pub fn format_ms_opt(ms: Option<f64>) -> String {
    match ms {
        Some(ms) => format!("{:.3}", ms),
        None => NO_DATA.to_string(),
    }
}

pub const NO_DATA: &str = "no data";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0.0ms");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_duration(Duration::from_millis(2250)), "2.25s");
        assert_eq!(format_duration(Duration::from_secs(754)), "12m34s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(800.0), "800B");
        assert_eq!(format_bytes(2048.0), "2.00KiB");
        assert_eq!(format_bytes(3.5 * 1024.0 * 1024.0), "3.50MiB");
    }

    #[test]
    fn test_optional_values() {
        assert_eq!(format_ms_opt(None), "no data");
        assert_eq!(format_ms_opt(Some(1.23456)), "1.235");
        assert_eq!(format_rate(20.166), "20.17/s");
    }
}
