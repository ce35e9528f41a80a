//! Environment variable utilities
//!
//! Small typed wrappers over `std::env::var` used by configuration and
//! logging. Unparseable values fall back to the caller's default.

use std::str::FromStr;

/// Read an environment variable and parse it, falling back to `default`.
pub fn env_get<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => val.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Read a boolean environment variable ("1", "true", "yes", "on").
pub fn env_get_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => matches!(val.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Read a string environment variable, falling back to `default`.
pub fn env_get_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

/// True if the variable is set at all.
pub fn env_is_set(name: &str) -> bool {
    std::env::var_os(name).is_some()
}
