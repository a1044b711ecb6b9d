use serde::{Deserialize, Serialize};

fn default_thread_prefix() -> String {
    "spool".to_string()
}

/// Runtime configuration for worker threads.
/// Keeps lifecycle knobs small and explicit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Stack size in bytes for spawned workers (`None` = platform default).
    pub stack_size: Option<usize>,

    /// Prefix for worker thread names; a unique suffix is appended.
    #[serde(default = "default_thread_prefix")]
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: None,
            thread_name_prefix: default_thread_prefix(),
        }
    }
}

impl RuntimeConfig {
    /// Loads runtime configuration from environment variables.
    /// If a variable is not set, it will use a default value.
    /// Recognized variables: SPOOL_STACK_SIZE, SPOOL_THREAD_PREFIX
    pub fn from_env() -> Self {
        let stack_size = std::env::var("SPOOL_STACK_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok());
        let thread_name_prefix =
            std::env::var("SPOOL_THREAD_PREFIX").unwrap_or_else(|_| default_thread_prefix());

        Self {
            stack_size,
            thread_name_prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_stack_override() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.stack_size.is_none());
        assert_eq!(cfg.thread_name_prefix, "spool");
    }
}
