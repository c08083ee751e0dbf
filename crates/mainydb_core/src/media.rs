//! Binary media hooks.
//!
//! On write, byte-array fields are stored as typed binary and string
//! fields naming a readable image file are auto-ingested. On point reads
//! the engine hands back raw bytes ([`MediaValue::Eager`]); scans hand
//! back a deferred handle ([`MediaValue::Deferred`]) that decodes on
//! demand through a process-wide cache with a two-hour TTL.

use crate::error::{EngineError, EngineResult};
use mainydb_codec::{hash_value, query_eq, Document, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// File suffixes treated as ingestable images.
const IMAGE_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".webp"];

/// Cache time-to-live for decoded blobs.
const CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Identifies one media field of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaKey {
    /// Database name.
    pub db: String,
    /// Collection name.
    pub coll: String,
    /// The owning document's `_id`.
    pub id: Value,
    /// Field name.
    pub field: String,
}

// `_id` values are never NaN floats, so the partial equality on Value is
// total here.
impl Eq for MediaKey {}

impl Hash for MediaKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.db.hash(state);
        self.coll.hash(state);
        hash_value(&self.id, state);
        self.field.hash(state);
    }
}

/// A media field's bytes, either materialized or deferred.
///
/// Deferred handles are small values (not closures): resolving one goes
/// through [`MediaCache`] and the live document.
#[derive(Debug, Clone)]
pub enum MediaValue {
    /// The decoded bytes, fetched eagerly.
    Eager(Vec<u8>),
    /// A handle resolved on demand via the cache.
    Deferred(MediaKey),
}

struct CacheEntry {
    stored_at: Instant,
    bytes: Arc<Vec<u8>>,
}

/// The process-wide decoded-blob cache.
pub struct MediaCache {
    entries: Mutex<HashMap<MediaKey, CacheEntry>>,
    ttl: Duration,
}

impl MediaCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// The process-wide cache instance.
    pub fn global() -> &'static MediaCache {
        static CACHE: OnceLock<MediaCache> = OnceLock::new();
        CACHE.get_or_init(|| MediaCache::new(CACHE_TTL))
    }

    /// Looks up a live entry, expiring stale ones.
    #[must_use]
    pub fn get(&self, key: &MediaKey) -> Option<Arc<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(Arc::clone(&entry.bytes)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores decoded bytes for a key.
    pub fn put(&self, key: MediaKey, bytes: Arc<Vec<u8>>) {
        let mut entries = self.entries.lock();
        // Opportunistic sweep keeps the map bounded without a timer
        // thread.
        entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                bytes,
            },
        );
    }

    /// Drops any cached bytes for a key (called when the field is
    /// rewritten or its document deleted).
    pub fn invalidate(&self, key: &MediaKey) {
        self.entries.lock().remove(key);
    }

    /// Drops every cached entry of one document.
    pub fn invalidate_doc(&self, db: &str, coll: &str, id: &Value) {
        self.entries
            .lock()
            .retain(|k, _| !(k.db == db && k.coll == coll && query_eq(&k.id, id)));
    }

    #[cfg(test)]
    fn with_ttl(ttl: Duration) -> Self {
        Self::new(ttl)
    }
}

/// The write-side hook: detects media values in top-level fields.
///
/// Byte arrays are kept as typed binary. Strings that end in a known
/// image suffix and name a readable file are replaced by the file's
/// bytes. Everything else passes through untouched; an unreadable path
/// is left as the string it was.
#[must_use]
pub fn ingest_document(mut doc: Document) -> Document {
    let media_fields: Vec<(String, Vec<u8>)> = doc
        .iter()
        .filter_map(|(field, value)| {
            let Value::Text(s) = value else { return None };
            ingest_path(s).map(|bytes| (field.to_string(), bytes))
        })
        .collect();

    for (field, bytes) in media_fields {
        doc.set(field, Value::Bytes(bytes));
    }
    doc
}

fn ingest_path(s: &str) -> Option<Vec<u8>> {
    let lower = s.to_ascii_lowercase();
    if !IMAGE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
        return None;
    }
    let path = Path::new(s);
    if !path.is_file() {
        return None;
    }
    std::fs::read(path).ok()
}

/// Resolves a deferred handle through the cache, using `load` to fetch
/// the live bytes on a miss.
pub fn resolve_deferred(
    key: &MediaKey,
    load: impl FnOnce() -> EngineResult<Vec<u8>>,
) -> EngineResult<Arc<Vec<u8>>> {
    if let Some(bytes) = MediaCache::global().get(key) {
        return Ok(bytes);
    }
    let bytes = Arc::new(load()?);
    MediaCache::global().put(key.clone(), Arc::clone(&bytes));
    Ok(bytes)
}

/// Extracts a media value from a document field.
pub(crate) fn media_from_doc(doc: &Document, field: &str) -> EngineResult<Vec<u8>> {
    match doc.get(field) {
        Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
        Some(other) => Err(EngineError::bad_query(format!(
            "field {field:?} holds {}, not binary media",
            other.type_name()
        ))),
        None => Err(EngineError::not_found(format!("media field {field:?}"))),
    }
}
