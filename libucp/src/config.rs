//! Transport configuration.
//!
//! Options are plain string pairs, handed to the transport engine when a context is created. The effective value of
//! an option is resolved in three layers, each overriding the previous one:
//!
//! 1. The engine's built-in default.
//! 2. A process environment variable with the same name as the option.
//! 3. An option passed explicitly to [`init`](crate::init) or [`ApplicationContext::from_factory`](crate::ApplicationContext::from_factory).
//!
//! When `env_takes_precedence` is requested, explicit options that are also present in the environment are dropped
//! with [`filter_env_overrides`] before creation, so the environment wins instead.

use crate::error::UcpError;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A string-keyed option mapping. Ordering carries no meaning.
pub type ConfigMap = HashMap<String, String>;

/// Removes every option whose key is also the name of an environment variable.
///
/// Returns the keys that were dropped.
pub fn filter_env_overrides<I, K>(options: &mut ConfigMap, env_keys: I) -> Vec<String>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut dropped = Vec::new();
    for key in env_keys {
        let key = key.as_ref();
        if options.remove(key).is_some() {
            debug!("Option {key} is set in the environment. The environment value takes precedence.");
            dropped.push(key.to_string());
        }
    }
    dropped
}

/// Names of all variables in the process environment.
pub fn process_env_keys() -> Vec<String> {
    std::env::vars_os().filter_map(|(k, _)| k.into_string().ok()).collect()
}

/// Resolves the effective configuration from the engine defaults, the environment and explicit options.
///
/// `env` looks up an environment variable by name. Unknown option keys are rejected with [`UcpError::Config`].
pub fn resolve_options<F>(defaults: &ConfigMap, options: &ConfigMap, env: F) -> Result<ConfigMap, UcpError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = options.keys().find(|k| !defaults.contains_key(k.as_str())) {
        return Err(UcpError::config(format!("Unknown option {key}")));
    }
    let mut effective = defaults.clone();
    for (key, value) in effective.iter_mut() {
        if let Some(from_env) = env(key) {
            trace!("Option {key} taken from the environment: {from_env}");
            *value = from_env;
        }
    }
    effective.extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(effective)
}

/// Parses a yes/no style option value.
pub fn parse_flag(key: &str, value: &str) -> Result<bool, UcpError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "on" | "1" | "true" => Ok(true),
        "n" | "no" | "off" | "0" | "false" => Ok(false),
        other => Err(UcpError::config(format!("{key} expects a yes/no value, got '{other}'"))),
    }
}

/// Parses a byte size, accepting an optional `k`, `m` or `g` suffix (powers of 1024).
pub fn parse_size(key: &str, value: &str) -> Result<usize, UcpError> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();
    let (digits, multiplier) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1usize << 10),
        Some('m') => (&lower[..lower.len() - 1], 1 << 20),
        Some('g') => (&lower[..lower.len() - 1], 1 << 30),
        _ => (lower.as_str(), 1),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| UcpError::config(format!("{key} expects a size, got '{value}'")))
}

/// How in-flight operations get advanced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// The caller drives progress by calling `progress()` itself.
    Manual,
    /// A background task calls `progress()` on every scheduler iteration.
    Polling,
    /// A background task calls `progress()` whenever the engine's readiness descriptor fires, and right after every
    /// submission.
    Notification,
    /// `Notification` if the engine exposes a readiness descriptor, `Polling` otherwise.
    #[default]
    Auto,
}

impl Display for ProgressMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressMode::Manual => write!(f, "manual"),
            ProgressMode::Polling => write!(f, "polling"),
            ProgressMode::Notification => write!(f, "notification"),
            ProgressMode::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = UcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(ProgressMode::Manual),
            "polling" | "poll" => Ok(ProgressMode::Polling),
            "notification" | "blocking" | "event" => Ok(ProgressMode::Notification),
            "auto" => Ok(ProgressMode::Auto),
            other => Err(UcpError::config(format!("Unknown progress mode '{other}'"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn env_precedence_drops_options_present_in_environment() {
        let mut options = map(&[("OPT_A", "1"), ("OPT_B", "x")]);
        let dropped = filter_env_overrides(&mut options, ["PATH", "OPT_A", "HOME"]);
        assert_eq!(dropped, vec!["OPT_A".to_string()]);
        assert!(!options.contains_key("OPT_A"));
        assert_eq!(options["OPT_B"], "x");
    }

    #[test]
    fn explicit_option_beats_environment() {
        let defaults = map(&[("OPT_A", "0")]);
        let options = map(&[("OPT_A", "1")]);
        let effective = resolve_options(&defaults, &options, |k| (k == "OPT_A").then(|| "2".to_string())).unwrap();
        assert_eq!(effective["OPT_A"], "1");
    }

    #[test]
    fn environment_wins_once_option_is_filtered() {
        let defaults = map(&[("OPT_A", "0")]);
        let mut options = map(&[("OPT_A", "1")]);
        filter_env_overrides(&mut options, ["OPT_A"]);
        let effective = resolve_options(&defaults, &options, |k| (k == "OPT_A").then(|| "2".to_string())).unwrap();
        assert_eq!(effective["OPT_A"], "2");
    }

    #[test]
    fn defaults_apply_without_environment() {
        let defaults = map(&[("OPT_A", "0"), ("OPT_B", "y")]);
        let effective = resolve_options(&defaults, &ConfigMap::new(), |_| None).unwrap();
        assert_eq!(effective, defaults);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let defaults = map(&[("OPT_A", "0")]);
        let options = map(&[("NOPE", "1")]);
        let err = resolve_options(&defaults, &options, |_| None).unwrap_err();
        assert!(matches!(err, UcpError::Config(msg) if msg.contains("NOPE")));
    }

    #[test]
    fn sizes_and_flags() {
        assert_eq!(parse_size("K", "8192").unwrap(), 8192);
        assert_eq!(parse_size("K", "8k").unwrap(), 8192);
        assert_eq!(parse_size("K", "2M").unwrap(), 2 << 20);
        assert!(parse_size("K", "lots").is_err());
        assert!(parse_flag("F", "Yes").unwrap());
        assert!(!parse_flag("F", "n").unwrap());
        assert!(parse_flag("F", "maybe").is_err());
    }

    #[test]
    fn progress_mode_round_trips_through_strings() {
        for mode in [ProgressMode::Manual, ProgressMode::Polling, ProgressMode::Notification, ProgressMode::Auto] {
            assert_eq!(mode.to_string().parse::<ProgressMode>().unwrap(), mode);
        }
        assert_eq!("blocking".parse::<ProgressMode>().unwrap(), ProgressMode::Notification);
        assert!("sometimes".parse::<ProgressMode>().is_err());
    }
}
