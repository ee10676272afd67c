use crate::{EssError, EssResult};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parses capacity strings such as `"10G"`, `"512MB"`, `"1.5GiB"`; a bare number is bytes.
/// Units are powers of 1024.
pub fn parse_space(value: &str) -> EssResult<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EssError::InvalidParam("empty space value".to_string()));
    }

    let upper = value.to_ascii_uppercase();
    let split = upper
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(upper.len());
    let (number, unit) = upper.split_at(split);
    let shift = match unit.trim() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        "P" | "PB" | "PIB" => 50,
        other => {
            return Err(EssError::InvalidParam(format!(
                "unknown space unit {} in {}",
                other, value
            )))
        }
    };
    let number = number.trim();
    let invalid = || EssError::InvalidParam(format!("invalid space value: {}", value));
    let overflow = || EssError::InvalidParam(format!("space value overflows: {}", value));

    if let Ok(base) = number.parse::<u64>() {
        return base.checked_mul(1u64 << shift).ok_or_else(overflow);
    }
    let base: f64 = number.parse().map_err(|_| invalid())?;
    if !base.is_finite() || base < 0.0 {
        return Err(invalid());
    }
    let bytes = (base * (1u64 << shift) as f64).round();
    if bytes >= u64::MAX as f64 {
        return Err(overflow());
    }
    Ok(bytes as u64)
}

pub fn format_space(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["K", "M", "G", "T", "P"];
    let mut unit = None;
    let mut value = bytes;
    for u in UNITS {
        if value < 1024 || value % 1024 != 0 {
            break;
        }
        value /= 1024;
        unit = Some(u);
    }
    match unit {
        Some(u) => format!("{}{}", value, u),
        None => value.to_string(),
    }
}
