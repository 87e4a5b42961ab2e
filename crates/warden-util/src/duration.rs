//! Duration strings
//!
//! Durations are written as a sequence of decimal numbers, each with an
//! optional fraction and a unit suffix, such as `300ms`, `1.5h` or `2h45m`.
//! Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. This is the
//! format used on the wire, in policy files and in persisted lease sets.

use std::fmt::Write;
use std::time::Duration;

use crate::{Result, WardenError};

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Format a duration the way it appears on the wire.
///
/// Values of a second or more are written with hour, minute and second
/// components (`1h0m0s`, `1m30s`, `2.5s`); smaller values use the largest
/// unit that keeps the integer part non-zero (`1.5ms`, `250µs`, `7ns`).
/// The zero duration is written as `0s`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < NANOS_PER_MICRO {
        return format!("{}ns", nanos);
    }
    if nanos < NANOS_PER_MILLI {
        return format!("{}µs", decimal(nanos, NANOS_PER_MICRO, 3));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", decimal(nanos, NANOS_PER_MILLI, 6));
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = (total_secs % 60) as u128 * NANOS_PER_SEC + d.subsec_nanos() as u128;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{}h", hours);
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{}m", minutes);
    }
    let _ = write!(out, "{}s", decimal(secs, NANOS_PER_SEC, 9));
    out
}

/// Writes `value / unit` with its fraction, trimming trailing zeros.
fn decimal(value: u128, unit: u128, digits: usize) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = digits);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Parse a duration string such as `1m30s` or `1.5h`.
///
/// A bare `0` is accepted. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let mut s = input;
    if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    } else if s.starts_with('-') {
        return Err(WardenError::duration(input, "negative durations are not supported"));
    }

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(WardenError::duration(input, "empty duration"));
    }

    let mut total: u128 = 0;
    while !s.is_empty() {
        let int_len = s.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, rest) = s.split_at(int_len);

        let (frac_part, rest) = match rest.strip_prefix('.') {
            Some(after_dot) => {
                let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
                after_dot.split_at(frac_len)
            }
            None => ("", rest),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(WardenError::duration(input, "expected a number"));
        }

        let unit_len = rest
            .char_indices()
            .find(|(_, c)| *c == '.' || c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (unit, rest) = rest.split_at(unit_len);

        let scale = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => NANOS_PER_MICRO,
            "ms" => NANOS_PER_MILLI,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3600 * NANOS_PER_SEC,
            "" => return Err(WardenError::duration(input, "missing unit")),
            other => {
                return Err(WardenError::duration(
                    input,
                    format!("unknown unit \"{}\"", other),
                ));
            }
        };

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| WardenError::duration(input, "number out of range"))?
        };

        let mut value = whole
            .checked_mul(scale)
            .ok_or_else(|| WardenError::duration(input, "duration out of range"))?;

        // Fractions finer than a nanosecond are truncated
        if !frac_part.is_empty() {
            let digits = &frac_part[..frac_part.len().min(18)];
            let numerator: u128 = digits
                .parse()
                .map_err(|_| WardenError::duration(input, "fraction out of range"))?;
            let denominator = 10u128.pow(digits.len() as u32);
            value += numerator * scale / denominator;
        }

        total = total
            .checked_add(value)
            .ok_or_else(|| WardenError::duration(input, "duration out of range"))?;
        s = rest;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC)
        .map_err(|_| WardenError::duration(input, "duration out of range"))?;
    Ok(Duration::new(secs, (total % NANOS_PER_SEC) as u32))
}

/// Serde adapter for `Duration` fields encoded as duration strings.
///
/// Integer values are also accepted on input and read as nanoseconds.
///
/// ```ignore
/// #[serde(with = "warden_util::duration_str")]
/// duration: Duration,
/// ```
pub mod duration_str {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration string such as \"1m30s\"")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            if v.is_empty() {
                return Ok(Duration::ZERO);
            }
            super::parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_nanos(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_nanos)
                .map_err(|_| E::custom("negative durations are not supported"))
        }
    }
}
