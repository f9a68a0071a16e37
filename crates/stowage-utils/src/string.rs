use std::sync::LazyLock;

use regex::Regex;

static ENCODED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(%[A-Fa-f0-9]{2})+").expect("unable to compile encoded url regex")
});

/// Decode percent-encoded octet runs into their UTF-8 characters.
///
/// Route parameters arrive encoded (`@scope%2fname`); contiguous runs of `%XX` are decoded
/// together so multi-byte characters survive. Invalid UTF-8 becomes the replacement character.
///
/// # Examples
///
/// ```
/// use stowage_utils::string::decode_uri;
///
/// assert_eq!(decode_uri("@scope%2fleft-pad"), "@scope/left-pad");
/// ```
pub fn decode_uri(s: &str) -> String {
    ENCODED_RE
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let bytes: Vec<u8> = caps[0]
                .as_bytes()
                .chunks(3)
                .filter_map(|chunk| {
                    let hex = std::str::from_utf8(chunk.get(1..3)?).ok()?;
                    u8::from_str_radix(hex, 16).ok()
                })
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        })
        .into_owned()
}
