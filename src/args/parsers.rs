use std::time::Duration;

use crate::error::ValidationError;

pub(crate) fn parse_bool_env(s: &str) -> Result<bool, ValidationError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" | "" => Ok(false),
        _ => Err(ValidationError::InvalidBoolean {
            field: "flag".to_owned(),
            value: s.to_owned(),
        }),
    }
}

/// Accepts `1500ms`, `2s`, `5m`, `1h`, or a bare number of seconds.
pub(crate) fn parse_duration_arg(s: &str) -> Result<Duration, ValidationError> {
    let value = s.trim();
    let invalid = || ValidationError::InvalidDuration {
        value: s.to_owned(),
    };
    let digits_len = value.chars().take_while(char::is_ascii_digit).count();
    if digits_len == 0 {
        return Err(invalid());
    }
    let (num_part, unit_part) = value.split_at(digits_len);
    let number: u64 = num_part.parse().map_err(|_overflow| invalid())?;

    let duration = match unit_part.trim() {
        "ms" => Duration::from_millis(number),
        "" | "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number.checked_mul(60).ok_or_else(invalid)?),
        "h" => Duration::from_secs(number.checked_mul(3_600).ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };
    if duration.is_zero() {
        return Err(ValidationError::DurationZero);
    }
    Ok(duration)
}

pub(crate) fn parse_port(s: &str) -> Result<u16, ValidationError> {
    match s.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ValidationError::InvalidPort {
            value: s.to_owned(),
        }),
    }
}

/// Comma separated port list such as `5211,5212`. Blank entries are skipped.
pub(crate) fn parse_port_list(s: &str) -> Result<Vec<u16>, ValidationError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_port)
        .collect()
}
