use std::time::Duration;

/// Parses a compact duration string such as `5s`, `1m30s` or `250ms` into a [`Duration`].
///
/// Each segment is a run of digits followed by one of `ms`, `s`, `m`, `h` or `d`. Returns
/// `None` for malformed input, a bare number without a unit, or when the total overflows.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use stowage_utils::time::parse_duration;
///
/// assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
/// ```
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut total_ms: u64 = 0;
    let mut rest = input.trim();

    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let number: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let (multiplier, unit_len) = if rest.starts_with("ms") {
            (1, 2)
        } else {
            match rest.chars().next()? {
                's' => (1_000, 1),
                'm' => (60_000, 1),
                'h' => (3_600_000, 1),
                'd' => (86_400_000, 1),
                _ => return None,
            }
        };
        rest = &rest[unit_len..];

        total_ms = total_ms.checked_add(number.checked_mul(multiplier)?)?;
    }

    Some(Duration::from_millis(total_ms))
}
