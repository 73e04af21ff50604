//! Conversions between strings and values, following Go's `strconv`
//! and `time` packages.

use std::fmt::Write;
use std::time::Duration;

use anyhow::Result;

/// Equivalent to Go's strconv.ParseBool.
pub fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(anyhow::anyhow!("invalid boolean: {:?}", s)),
    }
}

/// Like Go's strconv.ParseUint with base 0 and 64 bits: the base is taken
/// from a `0x`, `0o` or `0b` prefix, and single underscores may separate digits.
pub fn parse_uint(s: &str) -> Result<u64> {
    let (digits, radix) = match s.get(..2) {
        Some("0x" | "0X") => (&s[2..], 16),
        Some("0o" | "0O") => (&s[2..], 8),
        Some("0b" | "0B") => (&s[2..], 2),
        _ => (s, 10),
    };
    anyhow::ensure!(
        !digits.is_empty() && digits.split('_').all(|group| !group.is_empty()),
        "invalid syntax: {:?}",
        s,
    );

    digits
        .chars()
        .filter(|&c| c != '_')
        .try_fold(0u64, |acc, c| {
            let digit = c
                .to_digit(radix)
                .ok_or_else(|| anyhow::anyhow!("invalid syntax: {:?}", s))?;
            acc.checked_mul(radix as u64)
                .and_then(|acc| acc.checked_add(digit as u64))
                .ok_or_else(|| anyhow::anyhow!("value out of range: {:?}", s))
        })
}

const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("\u{00B5}s", 1_000), // micro sign
    ("\u{03BC}s", 1_000), // Greek mu
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3600 * 1_000_000_000),
];

/// Go's time.ParseDuration, without negative durations.
///
/// A duration is a sequence of decimal numbers with optional fractions,
/// each followed by a unit, e.g. "300ms", "1.5h" or "2h45m". A unitless
/// "0" is accepted too.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = || anyhow::anyhow!("invalid duration: {:?}", s);

    anyhow::ensure!(!s.starts_with('-'), "negative duration: {:?}", s);
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos = 0u128;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| c != '.' && !c.is_ascii_digit())
            .ok_or_else(|| anyhow::anyhow!("missing unit in duration: {:?}", s))?;
        let (number, tail) = rest.split_at(number_len);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }

        let unit_len = tail
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| anyhow::anyhow!("unknown unit {:?} in duration {:?}", unit, s))?;

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        total_nanos = whole
            .checked_mul(scale)
            .and_then(|nanos| total_nanos.checked_add(nanos))
            .ok_or_else(invalid)?;

        // Fractions are truncated to whole nanoseconds
        let mut fraction_scale = scale;
        for digit in fraction.chars() {
            fraction_scale /= 10;
            let digit = digit.to_digit(10).ok_or_else(invalid)?;
            total_nanos += digit as u128 * fraction_scale;
        }

        rest = tail;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

/// Formats a duration similarly to Go's time.Duration.String, with at most
/// one decimal digit for seconds and three significant digits below a second.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let mut s = String::new();
    if d >= Duration::from_secs(1) {
        let hours = d.as_secs() / 3600;
        let minutes = d.as_secs() / 60 % 60;
        if hours > 0 {
            let _ = write!(s, "{hours}h");
        }
        if hours > 0 || minutes > 0 {
            let _ = write!(s, "{minutes}m");
        }
        let secs = d.as_secs_f64() % 60.0;
        let _ = write!(s, "{secs:.1}s");
        return s;
    }

    let nanos = d.subsec_nanos();
    let (value, unit) = if nanos >= 1_000_000 {
        (nanos as f64 / 1_000_000.0, "ms")
    } else if nanos >= 1_000 {
        (nanos as f64 / 1_000.0, "µs")
    } else {
        (nanos as f64, "ns")
    };
    let precision = match value {
        v if v >= 100.0 => 0,
        v if v >= 10.0 => 1,
        _ => 2,
    };
    let precision = if unit == "ns" { 0 } else { precision };
    let _ = write!(s, "{value:.precision$}{unit}");
    s
}

/// Quotes a string like Go's strconv.Quote, escaping more characters
/// than strictly necessary outside of ASCII.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == ' ' || c.is_ascii_graphic() || c.is_alphanumeric() => out.push(c),
            c if (c as u32) < 0x80 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if (c as u32) < 0x10000 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => {
                let _ = write!(out, "\\U{:08x}", c as u32);
            }
        }
    }
    out.push('"');
    out
}
