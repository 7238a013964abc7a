//! Connector settings, resolved from process overrides, supplied values and defaults.
//!
//! Each setting can be overridden from the process environment:
//!
//! | Variable                     | Setting              | Default |
//! |------------------------------|----------------------|---------|
//! | `EPICARS_CORE_THREADS`       | worker pool core     | 2       |
//! | `EPICARS_MAX_THREADS`        | worker pool maximum  | 8       |
//! | `EPICARS_READ_ONLY`          | refuse writes        | false   |
//! | `EPICARS_TIMEOUT`            | request timeout (s)  | 5.0     |
//! | `EPICARS_CONN_TMO`           | connect timeout (s)  | 3.0     |
//! | `EPICARS_REQUEST_CAPACITY`   | retained responses   | 1       |
//! | `EPICARS_SHUTDOWN_GRACE`     | shutdown drain (s)   | 2.0     |
//!
//! The environment wins over values given to [`ConnectorConfig`], which win over
//! the defaults.

use std::{env, time::Duration};

use tracing::warn;

use crate::error::Error;

pub const DEFAULT_CORE_THREADS: usize = 2;
pub const DEFAULT_MAX_THREADS: usize = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REQUEST_CAPACITY: usize = 1;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Shortest timeout accepted; anything lower is raised to this
const MIN_TIMEOUT: f64 = 0.001;

/// Optional settings for a [`crate::Connector`]. Unset fields fall back to defaults.
#[derive(Clone, Debug, Default)]
pub struct ConnectorConfig {
    pub core_threads: Option<usize>,
    pub max_threads: Option<usize>,
    pub read_only: Option<bool>,
    pub timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub request_capacity: Option<usize>,
    pub shutdown_grace: Option<Duration>,
}

/// Fully resolved, validated connector settings
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectorSettings {
    pub core_threads: usize,
    pub max_threads: usize,
    pub read_only: bool,
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub request_capacity: usize,
    pub shutdown_grace: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        ConnectorConfig::default().resolve_with(|_| None)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| Duration::from_secs_f64(v.max(MIN_TIMEOUT)))
}

/// Look up and parse an override, warning about values that don't parse
fn parsed<T, L, P>(lookup: &L, key: &str, parse: P) -> Option<T>
where
    L: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = lookup(key)?;
    let value = parse(&raw);
    if value.is_none() {
        warn!("Ignoring unparseable {key}={raw:?}");
    }
    value
}

impl ConnectorConfig {
    /// Resolve against the process environment
    pub fn resolve(&self) -> ConnectorSettings {
        self.resolve_with(|key| env::var(key).ok())
    }

    /// Resolve against an arbitrary override lookup, then correct invalid
    /// pool sizes
    pub fn resolve_with<F>(&self, lookup: F) -> ConnectorSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let usize_var = |key: &str| parsed(&lookup, key, |v| v.trim().parse::<usize>().ok());
        let seconds_var = |key: &str| parsed(&lookup, key, parse_seconds);

        let settings = ConnectorSettings {
            core_threads: usize_var("EPICARS_CORE_THREADS")
                .or(self.core_threads)
                .unwrap_or(DEFAULT_CORE_THREADS),
            max_threads: usize_var("EPICARS_MAX_THREADS")
                .or(self.max_threads)
                .unwrap_or(DEFAULT_MAX_THREADS),
            read_only: parsed(&lookup, "EPICARS_READ_ONLY", parse_bool)
                .or(self.read_only)
                .unwrap_or(false),
            timeout: seconds_var("EPICARS_TIMEOUT")
                .or(self.timeout)
                .unwrap_or(DEFAULT_TIMEOUT),
            connection_timeout: seconds_var("EPICARS_CONN_TMO")
                .or(self.connection_timeout)
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            request_capacity: usize_var("EPICARS_REQUEST_CAPACITY")
                .or(self.request_capacity)
                .unwrap_or(DEFAULT_REQUEST_CAPACITY),
            shutdown_grace: seconds_var("EPICARS_SHUTDOWN_GRACE")
                .or(self.shutdown_grace)
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE),
        };
        settings.corrected()
    }
}

impl ConnectorSettings {
    /// Is the worker pool disabled? Work then runs on the scheduler thread.
    pub fn pool_disabled(&self) -> bool {
        self.max_threads == 0
    }

    /// These settings with inconsistent values clamped, warning about each change
    pub(crate) fn corrected(mut self) -> ConnectorSettings {
        for correction in self.correct() {
            warn!("{correction}");
        }
        self
    }

    /// Clamp inconsistent values in place, returning a description of each change
    fn correct(&mut self) -> Vec<Error> {
        let mut corrections = Vec::new();
        if self.max_threads == 0 {
            if self.core_threads != 0 {
                corrections.push(Error::Configuration(format!(
                    "worker pool disabled (max 0), core threads {} -> 0",
                    self.core_threads
                )));
                self.core_threads = 0;
            }
        } else {
            if self.core_threads < 1 {
                corrections.push(Error::Configuration(
                    "core threads 0 -> 1 with an enabled pool".into(),
                ));
                self.core_threads = 1;
            }
            if self.max_threads < self.core_threads {
                corrections.push(Error::Configuration(format!(
                    "max threads {} raised to core threads {}",
                    self.max_threads, self.core_threads
                )));
                self.max_threads = self.core_threads;
            }
        }
        if self.request_capacity == 0 {
            corrections.push(Error::Configuration("request capacity 0 -> 1".into()));
            self.request_capacity = 1;
        }
        corrections
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = ConnectorSettings::default();
        assert_eq!(s.core_threads, DEFAULT_CORE_THREADS);
        assert_eq!(s.max_threads, DEFAULT_MAX_THREADS);
        assert!(!s.read_only);
        assert_eq!(s.timeout, DEFAULT_TIMEOUT);
        assert_eq!(s.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
        assert_eq!(s.request_capacity, 1);
    }

    #[test]
    fn override_beats_supplied() {
        let config = ConnectorConfig {
            core_threads: Some(3),
            read_only: Some(false),
            timeout: Some(Duration::from_secs(9)),
            ..Default::default()
        };
        let s = config.resolve_with(env_of(&[
            ("EPICARS_READ_ONLY", "yes"),
            ("EPICARS_TIMEOUT", "0.5"),
        ]));
        assert_eq!(s.core_threads, 3);
        assert!(s.read_only);
        assert_eq!(s.timeout, Duration::from_millis(500));
    }

    #[test]
    fn garbage_override_is_ignored() {
        let config = ConnectorConfig {
            max_threads: Some(4),
            ..Default::default()
        };
        let s = config.resolve_with(env_of(&[("EPICARS_MAX_THREADS", "many")]));
        assert_eq!(s.max_threads, 4);
    }

    #[test]
    fn disabled_pool_forces_core_to_zero() {
        let config = ConnectorConfig {
            core_threads: Some(4),
            max_threads: Some(0),
            ..Default::default()
        };
        let s = config.resolve_with(|_| None);
        assert_eq!((s.core_threads, s.max_threads), (0, 0));
        assert!(s.pool_disabled());
    }

    #[test]
    fn pool_sizes_are_clamped() {
        let s = ConnectorConfig {
            core_threads: Some(0),
            max_threads: Some(5),
            ..Default::default()
        }
        .resolve_with(|_| None);
        assert_eq!((s.core_threads, s.max_threads), (1, 5));

        let s = ConnectorConfig {
            core_threads: Some(6),
            max_threads: Some(2),
            ..Default::default()
        }
        .resolve_with(|_| None);
        assert_eq!((s.core_threads, s.max_threads), (6, 6));
    }
}
