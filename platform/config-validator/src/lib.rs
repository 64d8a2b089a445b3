//! Shared builder for environment config validation.
//!
//! Services read every variable through a [`ConfigBuilder`], which records
//! each missing or malformed value instead of bailing on the first one. A
//! single [`ConfigBuilder::finish`] call then reports all problems together,
//! so an operator fixes the deployment in one pass.
//!
//! ```rust
//! use config_validator::ConfigBuilder;
//!
//! let mut cfg = ConfigBuilder::from_source("relay", |key| match key {
//!     "DATABASE_URL" => Some("postgres://localhost/relay".to_string()),
//!     _ => None,
//! });
//! let database_url = cfg.require("DATABASE_URL");
//! let port: u16 = cfg.parse_or("PORT", 8080);
//! cfg.finish().unwrap();
//!
//! assert_eq!(port, 8080);
//! assert_eq!(database_url, "postgres://localhost/relay");
//! ```

use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{service} configuration invalid:\n  - {}", .problems.join("\n  - "))]
    Invalid {
        service: String,
        problems: Vec<String>,
    },
}

impl ConfigError {
    pub fn problems(&self) -> &[String] {
        match self {
            ConfigError::Invalid { problems, .. } => problems,
        }
    }
}

type Source = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct ConfigBuilder {
    service: String,
    source: Source,
    problems: Vec<String>,
}

impl ConfigBuilder {
    /// Read from the process environment
    pub fn new(service: impl Into<String>) -> Self {
        Self::from_source(service, |key| std::env::var(key).ok())
    }

    /// Read from an arbitrary key lookup (tests, layered sources)
    pub fn from_source<F>(service: impl Into<String>, source: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            service: service.into(),
            source: Box::new(source),
            problems: Vec::new(),
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        (self.source)(key).filter(|v| !v.trim().is_empty())
    }

    /// Required string. Records a problem and returns an empty string when absent.
    pub fn require(&mut self, key: &str) -> String {
        match self.lookup(key) {
            Some(value) => value,
            None => {
                self.problems.push(format!("{} must be set", key));
                String::new()
            }
        }
    }

    pub fn optional(&mut self, key: &str, default: &str) -> String {
        self.lookup(key).unwrap_or_else(|| default.to_string())
    }

    /// Parse a value, falling back to `default` when the variable is unset.
    /// A present but unparsable value is a problem, never silently defaulted.
    pub fn parse_or<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        self.parse_optional(key).unwrap_or(default)
    }

    pub fn parse_optional<T>(&mut self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.lookup(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(e) => {
                self.problems
                    .push(format!("{} has invalid value '{}': {}", key, raw, e));
                None
            }
        }
    }

    /// String restricted to a fixed set of values
    pub fn one_of(&mut self, key: &str, default: &str, allowed: &[&str]) -> String {
        let value = self.optional(key, default);
        if !allowed.contains(&value.as_str()) {
            self.problems.push(format!(
                "{} must be one of [{}], got '{}'",
                key,
                allowed.join(", "),
                value
            ));
        }
        value
    }

    /// Record a cross-field problem when `ok` is false
    pub fn check(&mut self, ok: bool, problem: impl Into<String>) {
        if !ok {
            self.problems.push(problem.into());
        }
    }

    pub fn has_problems(&self) -> bool {
        !self.problems.is_empty()
    }

    pub fn finish(self) -> Result<(), ConfigError> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                service: self.service,
                problems: self.problems,
            })
        }
    }
}
