//! Editor tunables parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_MAX_ITERATIONS: usize = 5;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_SCRIPT_MAX_OPERATIONS: u64 = 100_000;
pub const DEFAULT_CONTEXT_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorConfig {
    /// Iterate-directives allowed per node before the resolution fails.
    pub max_iterations: usize,
    /// Output token cap for each generator call.
    pub max_tokens: u32,
    /// Period between "still waiting" progress messages.
    pub progress_interval: Duration,
    /// Sandbox operation budget for a single script run.
    pub script_max_operations: u64,
    /// Ancestors rendered into a node's prompt context.
    pub context_depth: usize,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: DEFAULT_MAX_TOKENS,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            script_max_operations: DEFAULT_SCRIPT_MAX_OPERATIONS,
            context_depth: DEFAULT_CONTEXT_DEPTH,
        }
    }
}

impl EditorConfig {
    /// Read overrides from the environment; unset or unparsable values keep
    /// their defaults.
    ///
    /// - `RETOUCH_MAX_ITERATIONS`
    /// - `RETOUCH_MAX_TOKENS`
    /// - `RETOUCH_PROGRESS_INTERVAL_MS`
    /// - `RETOUCH_SCRIPT_MAX_OPERATIONS`
    /// - `RETOUCH_CONTEXT_DEPTH`
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_iterations: env_parse("RETOUCH_MAX_ITERATIONS", DEFAULT_MAX_ITERATIONS),
            max_tokens: env_parse("RETOUCH_MAX_TOKENS", DEFAULT_MAX_TOKENS),
            progress_interval: Duration::from_millis(
                env_parse("RETOUCH_PROGRESS_INTERVAL_MS", DEFAULT_PROGRESS_INTERVAL_MS).max(1),
            ),
            script_max_operations: env_parse("RETOUCH_SCRIPT_MAX_OPERATIONS", DEFAULT_SCRIPT_MAX_OPERATIONS),
            context_depth: env_parse("RETOUCH_CONTEXT_DEPTH", DEFAULT_CONTEXT_DEPTH),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "config: ignoring unparsable value");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
