//! Environment-driven configuration.
//!
//! The surrounding runtime configures the facade entirely through the
//! environment: a pointer to the tool-server registry plus overrides for
//! every engine limit. A malformed value is a startup failure (non-zero
//! exit), never a silent fallback.

use std::time::Duration;

use anyhow::{Context, Result};

use mcsh_engine::registry::{REGISTRY_HOST_ENV, REGISTRY_PORT_ENV};
use mcsh_types::Limits;

const DEFAULT_REGISTRY_PORT: u16 = 8080;

/// Everything the facade needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host and port of the runtime that enumerates tool servers. When
    /// absent, tool stages fail with a diagnostic and tool listing is empty.
    pub registry: Option<(String, u16)>,
    /// Engine resource limits, with any environment overrides applied.
    pub limits: Limits,
}

impl ServerConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let registry = match std::env::var(REGISTRY_HOST_ENV) {
            Ok(host) if !host.is_empty() => {
                let port = env_parse(REGISTRY_PORT_ENV)?.unwrap_or(DEFAULT_REGISTRY_PORT);
                Some((host, port))
            }
            _ => None,
        };

        let mut limits = Limits::default();
        if let Some(v) = env_parse("MCSH_MAX_STAGE_INPUT_BYTES")? {
            limits.max_stage_input_bytes = v;
        }
        if let Some(v) = env_parse("MCSH_MAX_BUFFER_BYTES")? {
            limits.max_buffer_bytes = v;
        }
        if let Some(v) = env_parse("MCSH_MAX_OUTPUT_BYTES")? {
            limits.max_output_bytes = v;
        }
        if let Some(v) = env_parse::<f64>("MCSH_COMMAND_TIMEOUT_SECS")? {
            limits.command_timeout = positive_duration("MCSH_COMMAND_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = env_parse::<f64>("MCSH_TOOL_TIMEOUT_SECS")? {
            limits.tool_timeout = positive_duration("MCSH_TOOL_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = env_parse("MCSH_MAX_FOR_EACH_ITEMS")? {
            limits.max_for_each_items = v;
        }

        Ok(Self { registry, limits })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            registry: None,
            limits: Limits::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => {
            let parsed = value
                .parse()
                .with_context(|| format!("invalid value for {name}: {value:?}"))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

fn positive_duration(name: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        anyhow::bail!("{name} must be a positive number of seconds, got {secs}");
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_registry() {
        let config = ServerConfig::default();
        assert!(config.registry.is_none());
        assert_eq!(config.limits.max_for_each_items, 10_000);
    }

    #[test]
    fn positive_duration_rejects_zero_and_negative() {
        assert!(positive_duration("X", 0.0).is_err());
        assert!(positive_duration("X", -1.0).is_err());
        assert!(positive_duration("X", f64::NAN).is_err());
        assert_eq!(positive_duration("X", 1.5).unwrap(), Duration::from_millis(1500));
    }
}
