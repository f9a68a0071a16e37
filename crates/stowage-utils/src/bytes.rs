use crate::error::{BytesError, BytesResult};

/// Parses a size limit such as `10mb`, `512KiB` or `1048576` into bytes.
///
/// Units are case-insensitive. `kb`/`mb`/`gb`/`tb` are treated as powers of 1024 to match
/// how registry body limits are usually written; the explicit `kib`/`mib` forms are accepted
/// too.
///
/// # Errors
///
/// * [`BytesError::ParseFailed`] if the number or the unit cannot be understood.
///
/// # Example
///
/// ```
/// use stowage_utils::bytes::parse_bytes;
///
/// assert_eq!(parse_bytes("10mb").unwrap(), 10 * 1024 * 1024);
/// ```
pub fn parse_bytes(input: &str) -> BytesResult<u64> {
    let trimmed = input.trim();
    if let Ok(value) = trimmed.parse::<u64>() {
        return Ok(value);
    }

    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| {
            BytesError::ParseFailed {
                input: input.to_string(),
                reason: "not a number".into(),
            }
        })?;
    let (number, unit) = trimmed.split_at(split);

    let number: f64 = number.trim().parse().map_err(|_| {
        BytesError::ParseFailed {
            input: input.to_string(),
            reason: "not a number".into(),
        }
    })?;
    if number < 0.0 {
        return Err(BytesError::ParseFailed {
            input: input.to_string(),
            reason: "size cannot be negative".into(),
        });
    }

    let exponent = match unit.to_ascii_lowercase().as_str() {
        "b" => 0,
        "k" | "kb" | "kib" => 1,
        "m" | "mb" | "mib" => 2,
        "g" | "gb" | "gib" => 3,
        "t" | "tb" | "tib" => 4,
        _ => {
            return Err(BytesError::ParseFailed {
                input: input.to_string(),
                reason: "unknown unit".into(),
            });
        }
    };

    Ok((number * 1024_f64.powi(exponent)).round() as u64)
}
