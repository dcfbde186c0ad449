//! Environment variable parsing helpers
//!
//! Configuration values arrive through the external config source; these
//! helpers read the mapped environment names with typed defaults.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or return the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// Accepts `1`, `true`, `yes`, `on` (case-insensitive) as true; any other
/// set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
