//! Snapshot cursors and cancellation.

use crate::collection::CollectionShard;
use crate::crypto::FieldCrypto;
use crate::error::{EngineError, EngineResult};
use crate::query::Projection;
use mainydb_codec::Document;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation signal.
///
/// Cursors check the token between yielded documents; blocking
/// aggregation stages check it at periodic row counts. Cancelling makes
/// the next check surface [`EngineError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Errors with `Cancelled` if the token has been triggered.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A cursor over a snapshot of matching document ids.
///
/// The id set is fixed when the cursor is created (under the collection's
/// read lock); each yield re-resolves the id against the live collection
/// under a short read lock. Documents deleted since creation are skipped;
/// documents mutated since creation surface their current contents.
pub struct Cursor {
    shard: Arc<CollectionShard>,
    ids: std::vec::IntoIter<crate::index::DocId>,
    projection: Option<Projection>,
    crypto: Option<Arc<FieldCrypto>>,
    cancel: CancelToken,
}

impl Cursor {
    pub(crate) fn new(
        shard: Arc<CollectionShard>,
        ids: Vec<crate::index::DocId>,
        projection: Option<Projection>,
        crypto: Option<Arc<FieldCrypto>>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            shard,
            ids: ids.into_iter(),
            projection,
            crypto,
            cancel,
        }
    }

    /// The cursor's cancel token, for handing to another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drains the cursor into a vector.
    pub fn to_vec(self) -> EngineResult<Vec<Document>> {
        self.collect()
    }
}

impl Iterator for Cursor {
    type Item = EngineResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Err(err) = self.cancel.check() {
                return Some(Err(err));
            }
            let id = self.ids.next()?;
            let Some(mut doc) = self.shard.read_doc(&id) else {
                // Deleted since the snapshot was taken.
                continue;
            };
            if let Some(crypto) = &self.crypto {
                doc = crypto.on_read(doc);
            }
            return Some(match &self.projection {
                Some(p) => p.apply(&doc),
                None => Ok(doc),
            });
        }
    }
}
