//! Formatter configuration.

use serde::{Deserialize, Serialize};

use crate::DEFAULT_MAX_MESSAGE_SIZE;

/// Tunables for a [`MessagePackFormatter`](crate::MessagePackFormatter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatterOptions {
    /// Largest input buffer `decode` accepts, in bytes.
    pub max_message_size: usize,

    /// How many progress delivery failures are logged at warn level before
    /// further ones drop to debug.
    pub progress_failure_warn_limit: u64,
}

impl Default for FormatterOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            progress_failure_warn_limit: 10,
        }
    }
}

impl FormatterOptions {
    /// Builder: set the maximum message size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Builder: set the progress failure warn limit.
    pub fn with_progress_failure_warn_limit(mut self, limit: u64) -> Self {
        self.progress_failure_warn_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = FormatterOptions::default();
        assert_eq!(options.max_message_size, 16 * 1024 * 1024);
        assert_eq!(options.progress_failure_warn_limit, 10);
    }

    #[test]
    fn builders() {
        let options = FormatterOptions::default()
            .with_max_message_size(1024)
            .with_progress_failure_warn_limit(0);
        assert_eq!(options.max_message_size, 1024);
        assert_eq!(options.progress_failure_warn_limit, 0);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let options: FormatterOptions =
            serde_json::from_str(r#"{"max_message_size": 2048}"#).unwrap();
        assert_eq!(options.max_message_size, 2048);
        assert_eq!(options.progress_failure_warn_limit, 10);
    }
}
