//! Engine configuration.

use std::time::Duration;

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the store file if it doesn't exist.
    pub create_if_missing: bool,

    /// Checkpoint after this many journalled operations.
    pub checkpoint_ops: usize,

    /// Checkpoint when this much time has passed since the last one.
    /// Checked on mutation; `Duration::ZERO` disables the timer.
    pub checkpoint_interval: Duration,

    /// Whether to fsync the temp file before the checkpoint rename.
    pub sync_on_checkpoint: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            checkpoint_ops: 1000,
            checkpoint_interval: Duration::from_secs(30),
            sync_on_checkpoint: true,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store file if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the operation-count checkpoint threshold.
    #[must_use]
    pub const fn checkpoint_ops(mut self, ops: usize) -> Self {
        self.checkpoint_ops = ops;
        self
    }

    /// Sets the elapsed-time checkpoint threshold.
    #[must_use]
    pub const fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets whether checkpoints fsync before renaming.
    #[must_use]
    pub const fn sync_on_checkpoint(mut self, value: bool) -> Self {
        self.sync_on_checkpoint = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert_eq!(config.checkpoint_ops, 1000);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(30));
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .checkpoint_ops(10)
            .checkpoint_interval(Duration::ZERO)
            .sync_on_checkpoint(false);

        assert_eq!(config.checkpoint_ops, 10);
        assert_eq!(config.checkpoint_interval, Duration::ZERO);
        assert!(!config.sync_on_checkpoint);
    }
}
