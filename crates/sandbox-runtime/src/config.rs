//! Sandbox configuration and limits.
//!
//! Defines the resource boundaries enforced on extension scripts: engine
//! memory, stack depth, and the bounds on the plugin-visible `fetch`
//! primitive.
//!
//! # Examples
//!
//! ```
//! use sandbox_runtime::SandboxConfig;
//! use std::time::Duration;
//!
//! let config = SandboxConfig::builder()
//!     .memory_limit_mb(64)
//!     .fetch_timeout(Duration::from_secs(5))
//!     .build();
//! assert_eq!(config.memory_limit_bytes(), 64 * 1024 * 1024);
//! ```

use std::time::Duration;

/// Configuration for one sandbox instance.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum engine memory across all loaded scripts.
    memory_limit_bytes: usize,
    /// Maximum JS stack size.
    max_stack_bytes: usize,
    /// Whether plugins get a working `fetch` at all.
    fetch_enabled: bool,
    /// Per-request bound on the fetch primitive.
    fetch_timeout: Duration,
    /// Cap on fetched response bodies.
    fetch_max_response_bytes: usize,
}

impl SandboxConfig {
    /// Default engine memory limit: 32 MB.
    pub const DEFAULT_MEMORY_LIMIT_MB: usize = 32;

    /// Default JS stack size: 1 MB.
    pub const DEFAULT_MAX_STACK_BYTES: usize = 1024 * 1024;

    /// Default fetch timeout: 10 seconds.
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default fetch response cap: 5 MB.
    pub const DEFAULT_FETCH_MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

    /// Returns a builder pre-populated with the defaults.
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder {
            config: Self::default(),
        }
    }

    /// Builds a configuration from environment variables, falling back to
    /// the defaults for anything unset or unparseable.
    ///
    /// Recognized variables: `SANDBOX_MEMORY_LIMIT_MB`,
    /// `SANDBOX_MAX_STACK_BYTES`, `SANDBOX_FETCH_ENABLED`,
    /// `SANDBOX_FETCH_TIMEOUT_MS`, `SANDBOX_FETCH_MAX_RESPONSE_BYTES`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut builder = Self::builder();
        if let Some(mb) = env_parse::<usize>("SANDBOX_MEMORY_LIMIT_MB") {
            builder = builder.memory_limit_mb(mb);
        }
        if let Some(bytes) = env_parse::<usize>("SANDBOX_MAX_STACK_BYTES") {
            builder = builder.max_stack_bytes(bytes);
        }
        if let Some(enabled) = env_parse::<bool>("SANDBOX_FETCH_ENABLED") {
            builder = builder.fetch_enabled(enabled);
        }
        if let Some(ms) = env_parse::<u64>("SANDBOX_FETCH_TIMEOUT_MS") {
            builder = builder.fetch_timeout(Duration::from_millis(ms));
        }
        if let Some(bytes) = env_parse::<usize>("SANDBOX_FETCH_MAX_RESPONSE_BYTES") {
            builder = builder.fetch_max_response_bytes(bytes);
        }
        builder.build()
    }

    /// Engine memory limit in bytes.
    #[must_use]
    pub const fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_bytes
    }

    /// JS stack limit in bytes.
    #[must_use]
    pub const fn max_stack_bytes(&self) -> usize {
        self.max_stack_bytes
    }

    /// Whether the fetch primitive performs real requests.
    #[must_use]
    pub const fn fetch_enabled(&self) -> bool {
        self.fetch_enabled
    }

    /// Per-request fetch timeout.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Maximum accepted response body size for fetch.
    #[must_use]
    pub const fn fetch_max_response_bytes(&self) -> usize {
        self.fetch_max_response_bytes
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: Self::DEFAULT_MEMORY_LIMIT_MB * 1024 * 1024,
            max_stack_bytes: Self::DEFAULT_MAX_STACK_BYTES,
            fetch_enabled: true,
            fetch_timeout: Self::DEFAULT_FETCH_TIMEOUT,
            fetch_max_response_bytes: Self::DEFAULT_FETCH_MAX_RESPONSE_BYTES,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Builder for [`SandboxConfig`].
#[derive(Debug, Clone)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Sets the engine memory limit in megabytes.
    #[must_use]
    pub const fn memory_limit_mb(mut self, mb: usize) -> Self {
        self.config.memory_limit_bytes = mb * 1024 * 1024;
        self
    }

    /// Sets the JS stack limit in bytes.
    #[must_use]
    pub const fn max_stack_bytes(mut self, bytes: usize) -> Self {
        self.config.max_stack_bytes = bytes;
        self
    }

    /// Enables or disables the fetch primitive. When disabled, plugin
    /// `fetch` calls reject instead of reaching the network.
    #[must_use]
    pub const fn fetch_enabled(mut self, enabled: bool) -> Self {
        self.config.fetch_enabled = enabled;
        self
    }

    /// Sets the per-request fetch timeout.
    #[must_use]
    pub const fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Sets the response body cap for fetch.
    #[must_use]
    pub const fn fetch_max_response_bytes(mut self, bytes: usize) -> Self {
        self.config.fetch_max_response_bytes = bytes;
        self
    }

    /// Finalizes the configuration.
    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit_bytes(), 32 * 1024 * 1024);
        assert_eq!(config.max_stack_bytes(), 1024 * 1024);
        assert!(config.fetch_enabled());
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.fetch_max_response_bytes(), 5 * 1024 * 1024);
    }

    #[test]
    fn from_env_without_overrides_matches_defaults() {
        // None of the sandbox variables are set in the test environment.
        let config = SandboxConfig::from_env();
        assert_eq!(
            config.memory_limit_bytes(),
            SandboxConfig::default().memory_limit_bytes()
        );
        assert_eq!(config.fetch_timeout(), SandboxConfig::DEFAULT_FETCH_TIMEOUT);
    }

    #[test]
    fn builder_overrides() {
        let config = SandboxConfig::builder()
            .memory_limit_mb(8)
            .max_stack_bytes(256 * 1024)
            .fetch_enabled(false)
            .fetch_timeout(Duration::from_millis(1500))
            .fetch_max_response_bytes(1024)
            .build();
        assert_eq!(config.memory_limit_bytes(), 8 * 1024 * 1024);
        assert_eq!(config.max_stack_bytes(), 256 * 1024);
        assert!(!config.fetch_enabled());
        assert_eq!(config.fetch_timeout(), Duration::from_millis(1500));
        assert_eq!(config.fetch_max_response_bytes(), 1024);
    }
}
