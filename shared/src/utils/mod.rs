//! Utility functions and helpers

pub mod time;

use anyhow::Result;

/// Convert bytes to a hexadecimal string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<std::time::Duration> {
    let s = s.trim();

    if let Some(num_str) = s.strip_suffix("ms") {
        let millis: u64 = num_str.parse()?;
        Ok(std::time::Duration::from_millis(millis))
    } else if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str.parse()?;
        Ok(std::time::Duration::from_secs(secs))
    } else if let Some(num_str) = s.strip_suffix('m') {
        let mins: u64 = num_str.parse()?;
        Ok(std::time::Duration::from_secs(mins * 60))
    } else if let Some(num_str) = s.strip_suffix('h') {
        let hours: u64 = num_str.parse()?;
        Ok(std::time::Duration::from_secs(hours * 3600))
    } else {
        // Default to seconds if no suffix
        let secs: u64 = s.parse()?;
        Ok(std::time::Duration::from_secs(secs))
    }
}

/// Parse a byte size string (e.g., "512", "64KiB", "10MiB", "1GiB")
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("GiB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MiB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("KiB") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        (s, 1)
    };
    let value: u64 = num_str.trim().parse()?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("size overflows u64: {}", s))
}
