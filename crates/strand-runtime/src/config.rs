//! Runtime configuration
//!
//! Compile-time defaults with environment overrides. The external
//! configuration source maps its keys onto the environment names below;
//! programmatic callers use the builder methods instead.
//!
//! | Key                   | Environment name          | Default              |
//! |-----------------------|---------------------------|----------------------|
//! | `coroutine.stack_size`| `STRAND_STACK_SIZE`       | 131072               |
//! | `scheduler.threads`   | `STRAND_THREADS`          | hardware concurrency |
//! | `epoll.timeout_ms`    | `STRAND_EPOLL_TIMEOUT_MS` | 10000                |
//! | `tcp.no_delay`        | `STRAND_TCP_NODELAY`      | true                 |

use strand_core::{env_get, env_get_bool};
use thiserror::Error;

pub mod defaults {
    /// Per-coroutine stack size in bytes.
    pub const STACK_SIZE: usize = 128 * 1024;

    /// Kernel wait bound for an idle processor.
    pub const EPOLL_TIMEOUT_MS: u64 = 10_000;

    /// Disable Nagle on accepted and connected sockets.
    pub const TCP_NO_DELAY: bool = true;

    /// Scheduler threads, including the main one.
    pub fn threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Scheduler and processor configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack bytes per coroutine (guard page excluded)
    pub stack_size: usize,
    /// Threads driving processors, main thread included (>= 1)
    pub threads: usize,
    /// Upper bound for one kernel wait, in milliseconds
    pub epoll_timeout_ms: u64,
    /// Set TCP_NODELAY on connection sockets
    pub tcp_no_delay: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            threads: env_get("STRAND_THREADS", defaults::threads()),
            epoll_timeout_ms: env_get("STRAND_EPOLL_TIMEOUT_MS", defaults::EPOLL_TIMEOUT_MS),
            tcp_no_delay: env_get_bool("STRAND_TCP_NODELAY", defaults::TCP_NO_DELAY),
        }
    }

    /// Plain defaults, no environment consulted. Useful in tests.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            threads: defaults::threads(),
            epoll_timeout_ms: defaults::EPOLL_TIMEOUT_MS,
            tcp_no_delay: defaults::TCP_NO_DELAY,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn epoll_timeout_ms(mut self, ms: u64) -> Self {
        self.epoll_timeout_ms = ms;
        self
    }

    pub fn tcp_no_delay(mut self, on: bool) -> Self {
        self.tcp_no_delay = on;
        self
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be >= 1"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16 KiB"));
        }
        if self.epoll_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("epoll_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::new();
        assert!(config.threads >= 1);
        assert_eq!(config.stack_size, 128 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = RuntimeConfig::new()
            .threads(4)
            .stack_size(256 * 1024)
            .epoll_timeout_ms(500)
            .tcp_no_delay(false);
        assert_eq!(config.threads, 4);
        assert_eq!(config.stack_size, 256 * 1024);
        assert_eq!(config.epoll_timeout_ms, 500);
        assert!(!config.tcp_no_delay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(RuntimeConfig::new().threads(0).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().epoll_timeout_ms(0).validate().is_err());
    }
}
