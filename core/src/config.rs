//! Environment-variable configuration helpers.
//!
//! Every service reads its settings from the process environment with a
//! default for each key. Lookups go through [`Env`] so configs can be built
//! from a map in tests instead of mutating the real environment.

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
        /// Parse error
        reason: String,
    },
}

/// Typed access to a key/value source.
///
/// Blank values count as unset.
///
/// ```
/// use shopmesh_core::config::Env;
/// use std::collections::HashMap;
///
/// let vars = HashMap::from([("PORT", "8080"), ("HOST", "")]);
/// let env = Env::new(|key: &str| vars.get(key).map(|v| (*v).to_string()));
///
/// assert_eq!(env.parse("PORT", 3000_u16).unwrap(), 8080);
/// assert_eq!(env.string("HOST", "0.0.0.0"), "0.0.0.0");
/// ```
#[derive(Debug, Clone)]
pub struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Wrap a lookup function.
    pub const fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// The value of `key`, if set and not blank.
    pub fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    /// The value of `key`, or `default`.
    pub fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    /// `key` parsed as `T`, or `default` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not parse.
    pub fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse_optional(key)?.unwrap_or(default))
    }

    /// `key` parsed as `T`, or `None` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not parse.
    pub fn parse_optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.optional(key)
            .map(|value| {
                value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                    key: key.to_string(),
                    value: value.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}

/// The process environment.
#[must_use]
pub fn process_env() -> Env<fn(&str) -> Option<String>> {
    let lookup: fn(&str) -> Option<String> = |key| std::env::var(key).ok();
    Env::new(lookup)
}
