//! Shared helpers for loading component configuration from the environment.
//!
//! Every component config has a `from_env()` that delegates to a
//! `from_lookup()` taking a key lookup function, so tests can feed a map
//! instead of mutating process-wide environment variables.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Key lookup used by the `from_lookup` constructors.
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
pub struct ProcessEnv;

impl Lookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl Lookup for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl Lookup for HashMap<&str, &str> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).map(|v| v.to_string())
    }
}

pub fn string_or(lookup: &dyn Lookup, key: &str, default: &str) -> String {
    lookup.get(key).unwrap_or_else(|| default.to_string())
}

/// Parses `key`, falling back to `default` (with a warning) when the value is
/// absent or unparsable.
pub fn parse_or<T>(lookup: &dyn Lookup, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match lookup.get(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', defaulting to {}", key, raw, default);
                default
            }
        },
        None => default,
    }
}

/// Comma-separated list; empty entries are skipped.
pub fn list_or(lookup: &dyn Lookup, key: &str, default: &[&str]) -> Vec<String> {
    match lookup.get(key) {
        Some(raw) => raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_on_garbage() {
        let map: HashMap<&str, &str> = [("A", "12"), ("B", "twelve")].into_iter().collect();
        assert_eq!(parse_or::<u32>(&map, "A", 1), 12);
        assert_eq!(parse_or::<u32>(&map, "B", 1), 1);
        assert_eq!(parse_or::<u32>(&map, "C", 7), 7);
    }

    #[test]
    fn test_list_or_skips_blanks() {
        let map: HashMap<&str, &str> = [("TOPICS", "CarData.z, ,TimingData,")].into_iter().collect();
        assert_eq!(list_or(&map, "TOPICS", &[]), vec!["CarData.z", "TimingData"]);
        assert_eq!(list_or(&map, "OTHER", &["x"]), vec!["x"]);
    }
}
