use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_gib(bytes: u64) -> String {
    format!("{:.2} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

pub fn sanitize_slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Parses a byte size with an optional binary unit suffix
/// (`k`/`kib`, `m`/`mib`, `g`/`gib`; `b` or nothing for bytes).
pub fn parse_byte_size(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        anyhow::bail!("invalid size `{raw}`: expected a number with optional unit");
    }
    let value = digits
        .parse::<u64>()
        .map_err(|err| anyhow::anyhow!("invalid size `{raw}`: {err}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        other => anyhow::bail!("invalid size `{raw}`: unknown unit `{other}`"),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("invalid size `{raw}`: value overflows"))
}

#[cfg(test)]
mod tests {
    use super::{format_gib, parse_byte_size, sanitize_slug};

    #[test]
    fn slug_sanitization_is_stable() {
        assert_eq!(sanitize_slug("Photos 2012 / Backup"), "photos-2012-backup");
        assert_eq!(sanitize_slug("---"), "");
        assert_eq!(sanitize_slug("abc___def"), "abc-def");
    }

    #[test]
    fn byte_sizes_accept_binary_units() {
        assert_eq!(parse_byte_size("134217728").expect("bytes"), 134_217_728);
        assert_eq!(parse_byte_size("128MiB").expect("mib"), 134_217_728);
        assert_eq!(parse_byte_size("1 m").expect("m"), 1_048_576);
        assert_eq!(parse_byte_size("4GiB").expect("gib"), 4_294_967_296);
        assert!(parse_byte_size("MiB").is_err());
        assert!(parse_byte_size("12 parsecs").is_err());
    }

    #[test]
    fn gib_formatting_has_two_decimals() {
        assert_eq!(format_gib(0), "0.00 GiB");
        assert_eq!(format_gib(3 * 1024 * 1024 * 1024 / 2), "1.50 GiB");
    }
}
