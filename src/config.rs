use std::time::Duration;

use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub table: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<u32>,
    pub init_retry_secs: Option<u64>,
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub reset_on_start: bool,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("OUTBOXMQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("outboxmq.db")
    }

    pub fn table(&self) -> &str {
        self.table
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("outbox_messages")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(1))
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(100)
    }

    /// Fixed backoff between schema initialization attempts.
    pub fn init_retry(&self) -> Duration {
        Duration::from_secs(self.init_retry_secs.unwrap_or(5))
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.db_path(), "outboxmq.db");
        assert_eq!(config.table(), "outbox_messages");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 100);
        assert_eq!(config.init_retry(), Duration::from_secs(5));
        assert_eq!(config.max_connections(), 10);
        assert!(!config.reset_on_start);
    }

    #[test]
    fn test_from_prefixed_vars() {
        let vars = vec![
            ("OUTBOXMQ_TABLE".to_owned(), "my_mq".to_owned()),
            ("OUTBOXMQ_POLL_INTERVAL_SECS".to_owned(), "3".to_owned()),
            ("OUTBOXMQ_RESET_ON_START".to_owned(), "true".to_owned()),
            ("UNRELATED".to_owned(), "x".to_owned()),
        ];

        let config: Config = envy::prefixed("OUTBOXMQ_").from_iter(vars).unwrap();

        assert_eq!(config.table(), "my_mq");
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert!(config.reset_on_start);
        assert_eq!(config.db_path(), "outboxmq.db");
    }
}
