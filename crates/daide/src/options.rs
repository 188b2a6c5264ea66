use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_PORT;

/// Every option the protocol core reads. Built once by the composing
/// application and shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub host: String,
    pub port: u16,
    /// Answer a received Final or Error Message with one more Final Message.
    pub echo_final: bool,
    /// Send an empty Representation Message when the game uses the standard one.
    pub null_rep: bool,
    pub syntax_file: Option<PathBuf>,
    pub verbosity: u8,
    /// Upper bound on one readiness wait of the scheduler.
    pub wait_time_ms: u64,
    /// Pause taken when a loop iteration had nothing to do.
    pub sleep_time_ms: u64,
    pub first_message_timeout_ms: u64,
    pub peer_idle_timeout_ms: Option<u64>,
    pub block_exceptions: bool,
    pub syntax_level: i32,
    pub bind_attempts: u32,
    pub max_errors: u32,
    pub validate_incoming: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: DEFAULT_PORT,
            echo_final: false,
            null_rep: false,
            syntax_file: None,
            verbosity: 2,
            wait_time_ms: 600,
            sleep_time_ms: 10,
            first_message_timeout_ms: 30_000,
            peer_idle_timeout_ms: None,
            block_exceptions: true,
            syntax_level: 0,
            bind_attempts: 6,
            max_errors: 3,
            validate_incoming: true,
        }
    }
}

impl Options {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms)
    }

    pub fn first_message_timeout(&self) -> Duration {
        Duration::from_millis(self.first_message_timeout_ms)
    }

    pub fn peer_idle_timeout(&self) -> Option<Duration> {
        self.peer_idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.first_message_timeout(), Duration::from_secs(30));
        assert!(!options.echo_final);
        assert!(options.block_exceptions);
        assert_eq!(options.max_errors, 3);
        assert_eq!(options.address(), "127.0.0.1:16713");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: Options =
            serde_json::from_str(r#"{"port": 4000, "echo_final": true, "verbosity": 9}"#).unwrap();
        assert_eq!(options.port, 4000);
        assert!(options.echo_final);
        assert_eq!(options.log_level(), log::LevelFilter::Trace);
        assert_eq!(options.wait_time(), Duration::from_millis(600));
    }
}
