use crate::error::ProxyError;
use std::time::Duration;

pub const DEFAULT_LIBRARY: &str = "Main";

/// Runtime configuration for a proxy session and its catalog cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Upper bound on waiting for a prior delta to land on the mirror.
    pub serialization_timeout_ms: u64,
    /// Upper bound on acquiring the mirror's shared/exclusive lock.
    pub lock_timeout_ms: u64,
    /// Number of idle plan instances kept per session. Values <= 1 disable caching.
    pub plan_cache_size: usize,
    /// Rows fetched per round trip by a buffered cursor. Values <= 1 disable buffering.
    pub window_size: usize,
    pub default_library: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            serialization_timeout_ms: 30_000,
            lock_timeout_ms: 10_000,
            plan_cache_size: 1_000,
            window_size: 20,
            default_library: DEFAULT_LIBRARY.to_string(),
        }
    }
}

impl ProxyConfig {
    /// Every navigation call goes straight to the remote cursor.
    pub fn unbuffered() -> Self {
        Self {
            window_size: 1,
            ..Self::default()
        }
    }

    /// Short timeouts and a small window for interactive clients that prefer
    /// failing fast over stalling on a busy mirror.
    pub fn low_latency() -> Self {
        Self {
            serialization_timeout_ms: 2_000,
            lock_timeout_ms: 1_000,
            window_size: 8,
            ..Self::default()
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_plan_cache_size(mut self, plan_cache_size: usize) -> Self {
        self.plan_cache_size = plan_cache_size;
        self
    }

    pub fn with_timeouts(mut self, serialization_timeout_ms: u64, lock_timeout_ms: u64) -> Self {
        self.serialization_timeout_ms = serialization_timeout_ms;
        self.lock_timeout_ms = lock_timeout_ms;
        self
    }

    pub fn serialization_timeout(&self) -> Duration {
        Duration::from_millis(self.serialization_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn buffering_enabled(&self) -> bool {
        self.window_size > 1
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.serialization_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig {
                message: "serialization_timeout_ms must be > 0".into(),
            });
        }
        if self.lock_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig {
                message: "lock_timeout_ms must be > 0".into(),
            });
        }
        if self.window_size == 0 {
            return Err(ProxyError::InvalidConfig {
                message: "window_size must be > 0".into(),
            });
        }
        if self.default_library.trim().is_empty() {
            return Err(ProxyError::InvalidConfig {
                message: "default_library must not be empty".into(),
            });
        }
        Ok(())
    }
}
