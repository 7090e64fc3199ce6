/*
 * duration.rs
 *
 * Parse "30s", "250ms", "1.5m", "2h", "0.5d". No suffix means seconds.
 * Zero means no timeout. Case insensitive.
 */

use std::time::Duration;

use crate::error::{Error, Result};

fn invalid(msg: String) -> Error {
    Error::InvalidArgument(format!("invalid duration: {msg}"))
}

/// Parse a duration with an optional unit suffix.
///
/// # Examples
///
/// ```
/// use popen::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
/// ```
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid("empty".into()));
    }

    let (num_str, suffix) = split_number_and_suffix(input);
    if num_str.is_empty() {
        return Err(invalid(format!("no numeric value in '{input}'")));
    }

    let value: f64 = num_str
        .parse()
        .map_err(|_| invalid(format!("invalid number '{num_str}'")))?;
    if value.is_nan() || value.is_infinite() || value < 0.0 {
        return Err(invalid(format!("'{num_str}' is not a finite, non-negative number")));
    }

    /* ms divides rather than multiplying by an inexact 0.001 */
    let total_seconds = match suffix.to_ascii_lowercase().as_str() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        _ => return Err(invalid(format!("invalid suffix '{suffix}'"))),
    };

    Duration::try_from_secs_f64(total_seconds).map_err(|_| invalid("value too large".into()))
}

/* find where the number ends and suffix begins */
fn split_number_and_suffix(input: &str) -> (&str, &str) {
    let suffix_start = input
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_ascii_digit() || *c == '.')
        .map_or(0, |(i, c)| i + c.len_utf8());

    (&input[..suffix_start], &input[suffix_start..])
}

/// Zero = wait forever.
#[must_use]
pub fn as_timeout(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
