//! Bridge configuration (`[chatbot]` table).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::worker::WorkerProcessConfig;

/// Limits and worker settings for the chat bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub worker: WorkerProcessConfig,
    /// Maximum number of live conversations (one process each).
    pub max_sessions: usize,
    /// Idle time after which a conversation's worker is stopped.
    pub idle_timeout_secs: u64,
    /// Deadline for buffered commands.
    pub call_timeout_secs: u64,
    /// Deadline for a whole streamed answer.
    pub stream_timeout_secs: u64,
    /// Longest accepted user message, in characters.
    pub max_message_chars: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker: WorkerProcessConfig::default(),
            max_sessions: 10,
            idle_timeout_secs: 300,
            call_timeout_secs: 30,
            stream_timeout_secs: 60,
            max_message_chars: 5000,
        }
    }
}

impl BridgeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker.program.trim().is_empty() {
            return Err("chatbot.worker.program must not be empty".to_string());
        }
        let limits = [
            ("chatbot.max_sessions", self.max_sessions as u64),
            ("chatbot.idle_timeout_secs", self.idle_timeout_secs),
            ("chatbot.call_timeout_secs", self.call_timeout_secs),
            ("chatbot.stream_timeout_secs", self.stream_timeout_secs),
            ("chatbot.max_message_chars", self.max_message_chars as u64),
            ("chatbot.worker.max_frame_bytes", self.worker.max_frame_bytes as u64),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.stream_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_message_chars, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = BridgeConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            "chatbot.max_sessions must be greater than zero"
        );

        let mut config = BridgeConfig::default();
        config.worker.program = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            max_sessions = 3

            [worker]
            program = "/opt/chatbot/venv/bin/python"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.worker.program, "/opt/chatbot/venv/bin/python");
        assert_eq!(config.worker.args, vec!["main.py", "--api"]);
        assert_eq!(config.call_timeout_secs, 30);
    }
}
