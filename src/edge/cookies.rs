//! Header and cookie helpers for edge events.

use super::{HeaderEntry, Headers};

/// First value of a header, looked up case-insensitively.
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get(&name.to_ascii_lowercase())
        .and_then(|entries| entries.first())
        .map(|entry| entry.value.as_str())
}

/// Value of the cookie called `name`, searching every `cookie` header.
///
/// Names must match exactly; `session-id-old=x` is not `session-id`.
pub fn cookie_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get("cookie")?
        .iter()
        .flat_map(|entry| entry.value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(cookie, _)| cookie.trim() == name)
        .map(|(_, value)| value.trim())
}

/// Replace a header with a single value.
pub fn set_header(headers: &mut Headers, name: &str, value: impl Into<String>) {
    headers.insert(
        name.to_ascii_lowercase(),
        vec![HeaderEntry {
            key: name.to_string(),
            value: value.into(),
        }],
    );
}

/// A `Set-Cookie` value for a marker that lives `max_age_secs`.
pub fn set_cookie(name: &str, value: &str, max_age_secs: u64) -> String {
    format!("{}={}; Secure; Path=/; Max-Age={}", name, value, max_age_secs)
}
