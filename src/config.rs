//! Service configuration loaded from environment variables.

use std::fmt::Display;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::sandbox::SandboxConfig;
use crate::validate::ValidationLimits;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3000;

/// Everything the service needs, passed explicitly to the constructor.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Cap on the raw request body, checked before JSON parsing.
    pub max_body_bytes: usize,
    pub validation: ValidationLimits,
    pub sandbox: SandboxConfig,
    pub cache_capacity: NonZeroUsize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_body_bytes: 256 * 1024,
            validation: ValidationLimits::default(),
            sandbox: SandboxConfig::default(),
            cache_capacity: NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional:
    /// - `PORT`: listen port (default: 3000)
    /// - `PREVIEW_HOST`: listen host (default: "0.0.0.0")
    /// - `PREVIEW_MAX_BODY_BYTES`: raw body cap (default: 262144)
    /// - `PREVIEW_MAX_FIELD_BYTES`: per-field cap after normalization (default: 65536)
    /// - `PREVIEW_REQUIRE_HTML`: reject payloads without html (default: false)
    /// - `PREVIEW_RENDER_TIMEOUT_MS`: render wall-clock limit (default: 2000)
    /// - `PREVIEW_MAX_MEMORY_BYTES`: render memory ceiling (default: 16777216)
    /// - `PREVIEW_MAX_OUTPUT_BYTES`: render output ceiling (default: 262144)
    /// - `PREVIEW_MAX_DEPTH`: markup nesting ceiling (default: 32)
    /// - `PREVIEW_MAX_CONCURRENT_RENDERS`: render slots (default: CPU count)
    /// - `PREVIEW_CACHE_CAPACITY`: cached artifacts (default: 1024)
    /// - `PREVIEW_ALLOWED_ORIGINS`: comma-separated origins previews may load from
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let cache_capacity: usize = env_nonzero("PREVIEW_CACHE_CAPACITY", defaults.cache_capacity.get())?;
        let cache_capacity = NonZeroUsize::new(cache_capacity)
            .ok_or_else(|| anyhow!("PREVIEW_CACHE_CAPACITY must be greater than zero"))?;

        let allowed_origins: Vec<String> = std::env::var("PREVIEW_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            host: std::env::var("PREVIEW_HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port)?,
            max_body_bytes: env_nonzero("PREVIEW_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            validation: ValidationLimits {
                max_field_bytes: env_nonzero("PREVIEW_MAX_FIELD_BYTES", defaults.validation.max_field_bytes)?,
                require_html: env_or("PREVIEW_REQUIRE_HTML", defaults.validation.require_html)?,
            },
            sandbox: SandboxConfig {
                timeout: Duration::from_millis(env_nonzero(
                    "PREVIEW_RENDER_TIMEOUT_MS",
                    defaults.sandbox.timeout.as_millis() as u64,
                )?),
                max_memory_bytes: env_nonzero("PREVIEW_MAX_MEMORY_BYTES", defaults.sandbox.max_memory_bytes)?,
                max_output_bytes: env_nonzero("PREVIEW_MAX_OUTPUT_BYTES", defaults.sandbox.max_output_bytes)?,
                max_depth: env_nonzero("PREVIEW_MAX_DEPTH", defaults.sandbox.max_depth)?,
                max_concurrent_renders: env_nonzero(
                    "PREVIEW_MAX_CONCURRENT_RENDERS",
                    defaults.sandbox.max_concurrent_renders,
                )?,
                allowed_origins,
            },
            cache_capacity,
        };

        tracing::info!(
            bind_addr = %config.bind_addr(),
            render_timeout_ms = config.sandbox.timeout.as_millis() as u64,
            max_field_bytes = config.validation.max_field_bytes,
            require_html = config.validation.require_html,
            cache_capacity = config.cache_capacity.get(),
            allowed_origins = config.sandbox.allowed_origins.len(),
            "preview configuration loaded"
        );

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse `key` if set, else fall back to `default`.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

/// Like [`env_or`], but zero is rejected.
fn env_nonzero<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + Default + PartialEq,
    T::Err: Display,
{
    let value = env_or(key, default)?;
    if value == T::default() {
        return Err(anyhow!("{key} must be greater than zero"));
    }
    Ok(value)
}
