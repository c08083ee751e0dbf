//! The in-memory operation journal.
//!
//! Mutations append an op record after updating the in-memory root. The
//! journal's only job between checkpoints is to answer "how far has
//! memory diverged from disk": its length and age drive the checkpoint
//! policy, and a successful checkpoint empties it.

use crate::config::Config;
use parking_lot::Mutex;
use std::time::Instant;

/// One journalled mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    /// A document insert.
    Insert {
        /// Database name.
        db: String,
        /// Collection name.
        coll: String,
    },
    /// A document update or replace.
    Update {
        /// Database name.
        db: String,
        /// Collection name.
        coll: String,
    },
    /// A document delete.
    Delete {
        /// Database name.
        db: String,
        /// Collection name.
        coll: String,
    },
    /// An index build or drop.
    IndexChange {
        /// Database name.
        db: String,
        /// Collection name.
        coll: String,
    },
    /// A collection drop or rename, or a database drop.
    NamespaceChange {
        /// Database name.
        db: String,
    },
}

/// Journal of operations since the last checkpoint.
#[derive(Debug)]
pub struct Journal {
    ops: Mutex<Vec<JournalOp>>,
    last_checkpoint: Mutex<Instant>,
}

impl Journal {
    /// Creates an empty journal stamped "just checkpointed".
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            last_checkpoint: Mutex::new(Instant::now()),
        }
    }

    /// Appends one operation.
    pub fn record(&self, op: JournalOp) {
        self.ops.lock().push(op);
    }

    /// Number of operations since the last checkpoint.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// True when nothing has happened since the last checkpoint.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Whether the checkpoint policy says it is time to flush: at least
    /// `checkpoint_ops` journalled operations, or a non-zero
    /// `checkpoint_interval` has elapsed with pending operations.
    #[must_use]
    pub fn checkpoint_due(&self, config: &Config) -> bool {
        let pending = self.len();
        if pending == 0 {
            return false;
        }
        if config.checkpoint_ops > 0 && pending >= config.checkpoint_ops {
            return true;
        }
        !config.checkpoint_interval.is_zero()
            && self.last_checkpoint.lock().elapsed() >= config.checkpoint_interval
    }

    /// Empties the journal after a successful checkpoint.
    pub fn mark_checkpoint(&self) {
        self.ops.lock().clear();
        *self.last_checkpoint.lock() = Instant::now();
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn insert() -> JournalOp {
        JournalOp::Insert {
            db: "d".into(),
            coll: "c".into(),
        }
    }

    #[test]
    fn op_threshold_triggers() {
        let config = Config::new()
            .checkpoint_ops(3)
            .checkpoint_interval(Duration::ZERO);
        let journal = Journal::new();

        journal.record(insert());
        journal.record(insert());
        assert!(!journal.checkpoint_due(&config));

        journal.record(insert());
        assert!(journal.checkpoint_due(&config));
    }

    #[test]
    fn empty_journal_never_due() {
        let config = Config::new().checkpoint_interval(Duration::ZERO).checkpoint_ops(1);
        let journal = Journal::new();
        assert!(!journal.checkpoint_due(&config));
    }

    #[test]
    fn checkpoint_clears() {
        let config = Config::new()
            .checkpoint_ops(1)
            .checkpoint_interval(Duration::ZERO);
        let journal = Journal::new();
        journal.record(insert());
        assert!(journal.checkpoint_due(&config));

        journal.mark_checkpoint();
        assert!(journal.is_empty());
        assert!(!journal.checkpoint_due(&config));
    }

    #[test]
    fn interval_triggers_only_with_pending_ops() {
        let config = Config::new()
            .checkpoint_ops(0)
            .checkpoint_interval(Duration::ZERO);
        let journal = Journal::new();
        // Zero interval disables the timer; zero ops threshold disables
        // the counter.
        journal.record(insert());
        assert!(!journal.checkpoint_due(&config));

        let config = Config::new()
            .checkpoint_ops(1000)
            .checkpoint_interval(Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(1));
        assert!(journal.checkpoint_due(&config));
    }
}
