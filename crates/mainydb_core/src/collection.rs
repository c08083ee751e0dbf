//! The public per-collection API.
//!
//! Every single-document mutation is atomic under the collection's
//! write lock, including all affected index updates: unique constraints
//! are validated across every index before anything is touched, so a
//! rejected write leaves no partial state. Multi-document operations
//! are sequences of such atomic steps.

use crate::aggregate::{parse_sort_spec, DocStream, Pipeline};
use crate::crypto::FieldCrypto;
use crate::cursor::{CancelToken, Cursor};
use crate::database::{EngineInner, LookupSource};
use crate::error::{EngineError, EngineResult};
use crate::index::{DocId, IndexDef, IndexKind, IndexSet};
use crate::media::{self, MediaCache, MediaKey, MediaValue};
use crate::path;
use crate::planner::{self, AccessPath, Plan};
use crate::query::{FieldCond, Filter, Projection};
use crate::stats::CollectionStats;
use crate::store::JournalOp;
use crate::update::UpdateSpec;
use mainydb_codec::{query_eq, sort_cmp, Document, ObjectId, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// The guarded state of one collection.
pub(crate) struct CollectionInner {
    /// Live documents by `_id`.
    pub docs: BTreeMap<DocId, Document>,
    /// Insertion order of `_id`s, the scan order.
    pub order: Vec<DocId>,
    /// Secondary indexes (including the implicit `_id` index).
    pub indexes: IndexSet,
    /// Collection options, persisted as-is.
    pub options: Document,
}

impl CollectionInner {
    pub(crate) fn new(options: Document) -> Self {
        Self {
            docs: BTreeMap::new(),
            order: Vec::new(),
            indexes: IndexSet::new(),
            options,
        }
    }
}

/// One collection's shared state: the lock, its name, stats, and the
/// optional encryption transform.
pub(crate) struct CollectionShard {
    db: String,
    name: RwLock<String>,
    inner: RwLock<CollectionInner>,
    crypto: RwLock<Option<Arc<FieldCrypto>>>,
    stats: CollectionStats,
}

impl CollectionShard {
    pub(crate) fn new(db: &str, name: &str) -> Self {
        Self::with_inner(db, name, CollectionInner::new(Document::new()))
    }

    pub(crate) fn with_inner(db: &str, name: &str, inner: CollectionInner) -> Self {
        Self {
            db: db.to_string(),
            name: RwLock::new(name.to_string()),
            inner: RwLock::new(inner),
            crypto: RwLock::new(None),
            stats: CollectionStats::new(),
        }
    }

    pub(crate) fn inner(&self) -> &RwLock<CollectionInner> {
        &self.inner
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    /// Resolves one id to its live document under a short read lock.
    pub(crate) fn read_doc(&self, id: &DocId) -> Option<Document> {
        self.inner.read().docs.get(id).cloned()
    }

    fn crypto(&self) -> Option<Arc<FieldCrypto>> {
        self.crypto.read().clone()
    }
}

/// Result of `insert_one`.
#[derive(Debug, Clone)]
pub struct InsertOneResult {
    /// The `_id` of the inserted document (generated if absent).
    pub inserted_id: Value,
}

/// Result of `insert_many`.
#[derive(Debug)]
pub struct InsertManyResult {
    /// Ids of the documents that were inserted, in input order.
    pub inserted_ids: Vec<Value>,
    /// Per-input failures: `(input index, error)`. Ordered inserts stop
    /// at the first failure; unordered ones collect them all.
    pub errors: Vec<(usize, EngineError)>,
}

/// Result of updates and replaces.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Documents that matched the filter.
    pub matched: u64,
    /// Documents actually modified.
    pub modified: u64,
    /// The id inserted by an upsert, when one happened.
    pub upserted_id: Option<Value>,
}

/// Result of deletes.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    /// Documents removed.
    pub deleted: u64,
}

/// One operation inside a `bulk_write`.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a single document.
    InsertOne(Document),
    /// Update the first matching document.
    UpdateOne {
        /// The filter.
        filter: Document,
        /// The update document.
        update: Document,
        /// Insert a seeded document when nothing matches.
        upsert: bool,
    },
    /// Update every matching document.
    UpdateMany {
        /// The filter.
        filter: Document,
        /// The update document.
        update: Document,
    },
    /// Replace the first matching document.
    ReplaceOne {
        /// The filter.
        filter: Document,
        /// The replacement document.
        replacement: Document,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// Delete the first matching document.
    DeleteOne {
        /// The filter.
        filter: Document,
    },
    /// Delete every matching document.
    DeleteMany {
        /// The filter.
        filter: Document,
    },
}

/// Aggregated result of `bulk_write`.
#[derive(Debug, Default)]
pub struct BulkWriteResult {
    /// Documents inserted.
    pub inserted: u64,
    /// Documents matched by update/replace ops.
    pub matched: u64,
    /// Documents modified by update/replace ops.
    pub modified: u64,
    /// Documents deleted.
    pub deleted: u64,
    /// Ids inserted by upserts.
    pub upserted_ids: Vec<Value>,
    /// Per-op failures: `(op index, error)`. Ordered bulks stop at the
    /// first failure.
    pub errors: Vec<(usize, EngineError)>,
}

/// Options for `find`: projection, sort, skip, limit, cancellation.
///
/// The logical order of application is projection semantics over the
/// sorted, skipped, limited match set.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    projection: Option<Document>,
    sort: Vec<(String, i8)>,
    skip: usize,
    limit: Option<usize>,
    cancel: Option<CancelToken>,
}

impl FindOptions {
    /// Empty options: full documents, insertion order, no bounds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the projection document.
    #[must_use]
    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Appends a sort key; call repeatedly for composite sorts.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, direction: i8) -> Self {
        self.sort.push((field.into(), if direction < 0 { -1 } else { 1 }));
        self
    }

    /// Skips the first `n` matches.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Yields at most `n` documents.
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Attaches a cancel token checked between yields.
    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn sort_spec(&self) -> Option<&[(String, i8)]> {
        if self.sort.is_empty() {
            None
        } else {
            Some(&self.sort)
        }
    }
}

/// Options for `create_index`.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Explicit index name; generated from the keys when omitted.
    pub name: Option<String>,
    /// Reject duplicate key tuples.
    pub unique: bool,
    /// Build a hashed index (equality probes only) instead of an
    /// ordered one.
    pub hashed: bool,
}

/// A cursor over aggregation output.
pub struct AggregateCursor {
    stream: DocStream,
    cancel: CancelToken,
}

impl AggregateCursor {
    /// The pipeline's cancel token.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drains the cursor into a vector.
    pub fn to_vec(self) -> EngineResult<Vec<Document>> {
        self.collect()
    }
}

impl Iterator for AggregateCursor {
    type Item = EngineResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stream.next()
    }
}

/// A handle to one named collection.
///
/// Handles are cheap to clone and refer to the collection by name: the
/// underlying state springs into existence on the first write and is
/// resolved again on every operation.
#[derive(Clone)]
pub struct Collection {
    engine: Arc<EngineInner>,
    db: String,
    name: String,
}

impl Collection {
    pub(crate) fn new(engine: Arc<EngineInner>, db: String, name: &str) -> Self {
        Self {
            engine,
            db,
            name: name.to_string(),
        }
    }

    /// The collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning database's name.
    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.db
    }

    fn shard(&self) -> Option<Arc<CollectionShard>> {
        self.engine.shard(&self.db, &self.name)
    }

    fn shard_or_create(&self) -> Arc<CollectionShard> {
        self.engine.shard_or_create(&self.db, &self.name)
    }

    fn journal_op(&self, make: impl Fn(String, String) -> JournalOp) -> JournalOp {
        make(self.db.clone(), self.name.clone())
    }

    /// Applies the write-side hooks: media ingest, then encryption.
    fn transform_for_write(
        &self,
        shard: &CollectionShard,
        doc: Document,
    ) -> EngineResult<Document> {
        let doc = media::ingest_document(doc);
        match shard.crypto() {
            Some(crypto) => crypto.on_write(doc),
            None => Ok(doc),
        }
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    /// Inserts one document, generating `_id` when absent.
    pub fn insert_one(&self, doc: Document) -> EngineResult<InsertOneResult> {
        self.engine.ensure_open()?;
        let shard = self.shard_or_create();
        let (id, doc) = self.prepare_insert(&shard, doc)?;

        {
            let mut guard = shard.inner().write();
            let inner = &mut *guard;
            inner.indexes.insert_doc(&id, &doc)?;
            inner.order.push(id.clone());
            inner.docs.insert(id.clone(), doc);
        }
        shard.stats.record_inserts(1);
        self.engine
            .after_mutation(self.journal_op(|db, coll| JournalOp::Insert { db, coll }));

        Ok(InsertOneResult {
            inserted_id: id.0,
        })
    }

    /// Inserts many documents in order, stopping at the first failure.
    pub fn insert_many(&self, docs: Vec<Document>) -> EngineResult<InsertManyResult> {
        self.insert_many_with_options(docs, true)
    }

    /// Inserts many documents; when `ordered` is false, failures are
    /// collected and the rest proceed.
    pub fn insert_many_with_options(
        &self,
        docs: Vec<Document>,
        ordered: bool,
    ) -> EngineResult<InsertManyResult> {
        self.engine.ensure_open()?;
        let shard = self.shard_or_create();
        let mut result = InsertManyResult {
            inserted_ids: Vec::with_capacity(docs.len()),
            errors: Vec::new(),
        };

        let mut inserted = 0u64;
        for (at, doc) in docs.into_iter().enumerate() {
            let outcome = self.prepare_insert(&shard, doc).and_then(|(id, doc)| {
                let mut guard = shard.inner().write();
                let inner = &mut *guard;
                inner.indexes.insert_doc(&id, &doc)?;
                inner.order.push(id.clone());
                inner.docs.insert(id.clone(), doc);
                Ok(id)
            });
            match outcome {
                Ok(id) => {
                    inserted += 1;
                    result.inserted_ids.push(id.0);
                    self.engine
                        .after_mutation(self.journal_op(|db, coll| JournalOp::Insert { db, coll }));
                }
                Err(err) => {
                    result.errors.push((at, err));
                    if ordered {
                        break;
                    }
                }
            }
        }
        shard.stats.record_inserts(inserted);
        Ok(result)
    }

    /// Validates a document for insert and runs the write hooks.
    fn prepare_insert(
        &self,
        shard: &CollectionShard,
        mut doc: Document,
    ) -> EngineResult<(DocId, Document)> {
        match doc.get("_id") {
            None => {
                // _id leads the stored document.
                let mut with_id = Document::with_capacity(doc.len() + 1);
                with_id.set("_id", Value::ObjectId(ObjectId::new()));
                for (k, v) in doc.iter() {
                    with_id.set(k, v.clone());
                }
                doc = with_id;
            }
            Some(Value::Array(_) | Value::Doc(_)) => {
                return Err(EngineError::bad_update("_id cannot be an array or document"));
            }
            Some(_) => {}
        }
        let doc = self.transform_for_write(shard, doc)?;
        let id = DocId(doc.get("_id").cloned().unwrap_or(Value::Null));
        Ok((id, doc))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Finds all documents matching a filter.
    pub fn find(&self, filter: &Document) -> EngineResult<Cursor> {
        self.find_with_options(filter, FindOptions::new())
    }

    /// Finds documents with projection, sort, skip and limit.
    pub fn find_with_options(
        &self,
        filter: &Document,
        options: FindOptions,
    ) -> EngineResult<Cursor> {
        self.engine.ensure_open()?;
        let parsed = Filter::parse(filter)?;
        let projection = options
            .projection
            .as_ref()
            .map(|p| Projection::parse(p, false))
            .transpose()?;
        let cancel = options.cancel.clone().unwrap_or_default();

        let Some(shard) = self.shard() else {
            // The collection doesn't exist yet: an empty result, not an
            // error.
            return Ok(Cursor::new(
                Arc::new(CollectionShard::new(&self.db, &self.name)),
                Vec::new(),
                projection,
                None,
                cancel,
            ));
        };
        shard.stats.record_query();

        let ids = {
            let inner = shard.inner().read();
            let plan = planner::plan(&parsed, &inner.indexes, options.sort_spec());
            tracing::trace!(
                collection = %self.name,
                plan = ?plan.describe(),
                "snapshot cursor"
            );
            let mut ids = matching_ids(&inner, &parsed, &plan);

            if let Some(sort) = options.sort_spec() {
                if !plan.sorted {
                    sort_ids(&inner, &mut ids, sort);
                }
            }
            bound_ids(&mut ids, options.skip, options.limit);
            ids
        };

        Ok(Cursor::new(shard.clone(), ids, projection, shard.crypto(), cancel))
    }

    /// Finds the first matching document.
    pub fn find_one(&self, filter: &Document) -> EngineResult<Option<Document>> {
        self.find_one_with_options(filter, FindOptions::new())
    }

    /// Finds the first matching document under the given options.
    pub fn find_one_with_options(
        &self,
        filter: &Document,
        options: FindOptions,
    ) -> EngineResult<Option<Document>> {
        let mut cursor = self.find_with_options(filter, options.limit(1))?;
        cursor.next().transpose()
    }

    /// Counts matching documents by evaluating the filter, never by a
    /// metadata shortcut.
    pub fn count_documents(&self, filter: &Document) -> EngineResult<u64> {
        self.engine.ensure_open()?;
        let parsed = Filter::parse(filter)?;
        let Some(shard) = self.shard() else {
            return Ok(0);
        };
        shard.stats.record_query();
        let inner = shard.inner().read();
        let plan = planner::plan(&parsed, &inner.indexes, None);
        Ok(matching_ids(&inner, &parsed, &plan).len() as u64)
    }

    /// Distinct values at `field` across matching documents, in
    /// first-seen order. Array values contribute their elements.
    pub fn distinct(&self, field: &str, filter: &Document) -> EngineResult<Vec<Value>> {
        self.engine.ensure_open()?;
        let parsed = Filter::parse(filter)?;
        let Some(shard) = self.shard() else {
            return Ok(Vec::new());
        };
        shard.stats.record_query();
        let inner = shard.inner().read();

        let mut seen: Vec<Value> = Vec::new();
        let mut push = |v: &Value| {
            if !seen.iter().any(|s| query_eq(s, v)) {
                seen.push(v.clone());
            }
        };
        for id in &inner.order {
            let Some(doc) = inner.docs.get(id) else { continue };
            if !parsed.matches(doc) {
                continue;
            }
            match path::resolve(doc, field) {
                Some(Value::Array(items)) => items.iter().for_each(&mut push),
                Some(value) => push(value),
                None => {}
            }
        }
        Ok(seen)
    }

    /// Describes the access path the planner would choose for a filter.
    pub fn explain(&self, filter: &Document) -> EngineResult<Document> {
        self.explain_with_options(filter, &FindOptions::new())
    }

    /// Describes the plan for a filter under find options (sort
    /// pushdown shows up here).
    pub fn explain_with_options(
        &self,
        filter: &Document,
        options: &FindOptions,
    ) -> EngineResult<Document> {
        self.engine.ensure_open()?;
        let parsed = Filter::parse(filter)?;
        let plan = match self.shard() {
            Some(shard) => {
                let inner = shard.inner().read();
                planner::plan(&parsed, &inner.indexes, options.sort_spec())
            }
            None => planner::plan(&parsed, &IndexSet::new(), options.sort_spec()),
        };
        Ok(plan.describe())
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Applies an update to the first matching document.
    pub fn update_one(&self, filter: &Document, update: &Document) -> EngineResult<UpdateResult> {
        self.update_internal(filter, update, false, false)
    }

    /// Applies an update to the first match, inserting a seeded
    /// document when nothing matches and `upsert` is set.
    pub fn update_one_with_options(
        &self,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> EngineResult<UpdateResult> {
        self.update_internal(filter, update, false, upsert)
    }

    /// Applies an update to every matching document.
    pub fn update_many(&self, filter: &Document, update: &Document) -> EngineResult<UpdateResult> {
        self.update_internal(filter, update, true, false)
    }

    /// Replaces the first matching document, keeping its `_id`.
    pub fn replace_one(
        &self,
        filter: &Document,
        replacement: &Document,
    ) -> EngineResult<UpdateResult> {
        self.replace_one_with_options(filter, replacement, false)
    }

    /// Replaces the first match, inserting when nothing matches and
    /// `upsert` is set.
    pub fn replace_one_with_options(
        &self,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> EngineResult<UpdateResult> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(EngineError::bad_update(
                "replacement document cannot contain operators",
            ));
        }
        self.update_internal(filter, replacement, false, upsert)
    }

    fn update_internal(
        &self,
        filter: &Document,
        update: &Document,
        many: bool,
        upsert: bool,
    ) -> EngineResult<UpdateResult> {
        self.engine.ensure_open()?;
        // All validation happens before any state change.
        let parsed = Filter::parse(filter)?;
        let spec = UpdateSpec::parse(update)?;

        let shard = if upsert {
            Some(self.shard_or_create())
        } else {
            self.shard()
        };
        let Some(shard) = shard else {
            return Ok(UpdateResult {
                matched: 0,
                modified: 0,
                upserted_id: None,
            });
        };

        let now = now_ms();
        let mut matched = 0u64;
        let mut modified = 0u64;
        let mut upserted_id = None;

        {
            let mut guard = shard.inner().write();
            let inner = &mut *guard;
            let plan = planner::plan(&parsed, &inner.indexes, None);
            let candidates = candidate_ids(inner, &plan.access);

            for id in candidates {
                let Some(doc) = inner.docs.get(&id) else { continue };
                if !parsed.matches(doc) {
                    continue;
                }
                matched += 1;

                let (new_doc, was_modified) = spec.apply(doc, now)?;
                if was_modified {
                    let new_doc = self.transform_for_write(&shard, new_doc)?;
                    let old_doc = doc.clone();
                    inner.indexes.update_doc(&id, &old_doc, &new_doc)?;
                    inner.docs.insert(id.clone(), new_doc);
                    MediaCache::global().invalidate_doc(&self.db, &self.name, &id.0);
                    modified += 1;
                }
                if !many {
                    break;
                }
            }

            if matched == 0 && upsert {
                let mut seed = Document::new();
                upsert_seed(&parsed, &mut seed);
                let (applied, _) = spec.apply(&seed, now)?;
                let (id, doc) = self.prepare_insert(&shard, applied)?;
                inner.indexes.insert_doc(&id, &doc)?;
                inner.order.push(id.clone());
                inner.docs.insert(id.clone(), doc);
                upserted_id = Some(id.0);
            }
        }

        if modified > 0 || upserted_id.is_some() {
            shard.stats.record_updates(modified);
            self.engine
                .after_mutation(self.journal_op(|db, coll| JournalOp::Update { db, coll }));
        }

        Ok(UpdateResult {
            matched,
            modified,
            upserted_id,
        })
    }

    // ------------------------------------------------------------------
    // Deletes
    // ------------------------------------------------------------------

    /// Deletes the first matching document.
    pub fn delete_one(&self, filter: &Document) -> EngineResult<DeleteResult> {
        self.delete_internal(filter, false)
    }

    /// Deletes every matching document.
    pub fn delete_many(&self, filter: &Document) -> EngineResult<DeleteResult> {
        self.delete_internal(filter, true)
    }

    fn delete_internal(&self, filter: &Document, many: bool) -> EngineResult<DeleteResult> {
        self.engine.ensure_open()?;
        let parsed = Filter::parse(filter)?;
        let Some(shard) = self.shard() else {
            return Ok(DeleteResult { deleted: 0 });
        };

        let mut deleted = 0u64;
        {
            let mut guard = shard.inner().write();
            let inner = &mut *guard;
            let plan = planner::plan(&parsed, &inner.indexes, None);
            let candidates = candidate_ids(inner, &plan.access);

            for id in candidates {
                let matches = inner
                    .docs
                    .get(&id)
                    .is_some_and(|doc| parsed.matches(doc));
                if !matches {
                    continue;
                }
                let Some(doc) = inner.docs.remove(&id) else { continue };
                inner.indexes.remove_doc(&id, &doc);
                inner.order.retain(|o| o != &id);
                MediaCache::global().invalidate_doc(&self.db, &self.name, &id.0);
                deleted += 1;
                if !many {
                    break;
                }
            }
        }

        if deleted > 0 {
            shard.stats.record_deletes(deleted);
            self.engine
                .after_mutation(self.journal_op(|db, coll| JournalOp::Delete { db, coll }));
        }
        Ok(DeleteResult { deleted })
    }

    // ------------------------------------------------------------------
    // Bulk writes
    // ------------------------------------------------------------------

    /// Executes a sequence of write operations.
    ///
    /// When `ordered`, the first failure stops the run; partial counts
    /// plus the error are returned either way.
    pub fn bulk_write(&self, ops: Vec<WriteOp>, ordered: bool) -> EngineResult<BulkWriteResult> {
        self.engine.ensure_open()?;
        let mut result = BulkWriteResult::default();

        for (at, op) in ops.into_iter().enumerate() {
            let outcome = self.apply_bulk_op(op, &mut result);
            if let Err(err) = outcome {
                result.errors.push((at, err));
                if ordered {
                    break;
                }
            }
        }
        Ok(result)
    }

    fn apply_bulk_op(&self, op: WriteOp, result: &mut BulkWriteResult) -> EngineResult<()> {
        match op {
            WriteOp::InsertOne(doc) => {
                self.insert_one(doc)?;
                result.inserted += 1;
            }
            WriteOp::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let r = self.update_one_with_options(&filter, &update, upsert)?;
                result.matched += r.matched;
                result.modified += r.modified;
                result.upserted_ids.extend(r.upserted_id);
            }
            WriteOp::UpdateMany { filter, update } => {
                let r = self.update_many(&filter, &update)?;
                result.matched += r.matched;
                result.modified += r.modified;
            }
            WriteOp::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                let r = self.replace_one_with_options(&filter, &replacement, upsert)?;
                result.matched += r.matched;
                result.modified += r.modified;
                result.upserted_ids.extend(r.upserted_id);
            }
            WriteOp::DeleteOne { filter } => {
                result.deleted += self.delete_one(&filter)?.deleted;
            }
            WriteOp::DeleteMany { filter } => {
                result.deleted += self.delete_many(&filter)?.deleted;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Runs an aggregation pipeline over the collection.
    pub fn aggregate(&self, stages: &[Value]) -> EngineResult<AggregateCursor> {
        self.engine.ensure_open()?;
        let pipeline = Pipeline::parse(stages)?;

        // The source snapshot is cut under this collection's read lock;
        // $lookup takes each foreign collection's lock per probe, after
        // this one is released.
        let source = self.find(&Document::new())?;
        let cancel = source.cancel_token();
        let fetch = Arc::new(LookupSource {
            engine: Arc::clone(&self.engine),
            db: self.db.clone(),
        });
        let stream = pipeline.execute(Box::new(source), fetch, cancel.clone());
        Ok(AggregateCursor { stream, cancel })
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Builds an index over `keys` (`{field: ±1, …}`), returning its
    /// name.
    pub fn create_index(&self, keys: &Document, options: IndexOptions) -> EngineResult<String> {
        self.engine.ensure_open()?;
        let keys = parse_index_keys(keys)?;
        let def = IndexDef {
            name: options
                .name
                .unwrap_or_else(|| IndexDef::generated_name(&keys)),
            keys,
            unique: options.unique,
            kind: if options.hashed {
                IndexKind::Hashed
            } else {
                IndexKind::Ordered
            },
        };
        let name = def.name.clone();

        let shard = self.shard_or_create();
        {
            let mut guard = shard.inner().write();
            let inner = &mut *guard;
            let CollectionInner { docs, indexes, .. } = inner;
            indexes.build(def, docs.iter())?;
        }
        self.engine
            .after_mutation(self.journal_op(|db, coll| JournalOp::IndexChange { db, coll }));
        tracing::debug!(collection = %self.name, index = %name, "index built");
        Ok(name)
    }

    /// Drops a named index.
    pub fn drop_index(&self, name: &str) -> EngineResult<()> {
        self.engine.ensure_open()?;
        let shard = self
            .shard()
            .ok_or_else(|| EngineError::not_found(format!("index {name:?}")))?;
        shard.inner().write().indexes.drop(name)?;
        self.engine
            .after_mutation(self.journal_op(|db, coll| JournalOp::IndexChange { db, coll }));
        Ok(())
    }

    /// Drops every index except the implicit `_id` index.
    pub fn drop_indexes(&self) -> EngineResult<()> {
        self.engine.ensure_open()?;
        if let Some(shard) = self.shard() {
            shard.inner().write().indexes.drop_all();
            self.engine
                .after_mutation(self.journal_op(|db, coll| JournalOp::IndexChange { db, coll }));
        }
        Ok(())
    }

    /// Lists index definitions, the implicit `_id` index included.
    #[must_use]
    pub fn list_indexes(&self) -> Vec<Document> {
        match self.shard() {
            Some(shard) => shard
                .inner()
                .read()
                .indexes
                .iter()
                .map(|i| i.def().to_doc())
                .collect(),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Collection-level operations
    // ------------------------------------------------------------------

    /// Drops the collection and its indexes.
    pub fn drop(&self) -> EngineResult<()> {
        self.engine.drop_collection(&self.db, &self.name)
    }

    /// Renames the collection within its database.
    pub fn rename(&self, new_name: &str) -> EngineResult<()> {
        self.engine.ensure_open()?;
        {
            let mut root = self.engine.root().write();
            let colls = root
                .get_mut(&self.db)
                .ok_or_else(|| EngineError::not_found(format!("collection {:?}", self.name)))?;
            if colls.contains_key(new_name) {
                return Err(EngineError::bad_query(format!(
                    "collection {new_name:?} already exists"
                )));
            }
            let shard = colls
                .remove(&self.name)
                .ok_or_else(|| EngineError::not_found(format!("collection {:?}", self.name)))?;
            shard.set_name(new_name);
            colls.insert(new_name.to_string(), shard);
        }
        self.engine.after_mutation(JournalOp::NamespaceChange {
            db: self.db.clone(),
        });
        Ok(())
    }

    /// Collection statistics: document count, index count, op counters.
    #[must_use]
    pub fn stats(&self) -> Document {
        let mut out = Document::new();
        out.set("db", self.db.as_str());
        out.set("collection", self.name.as_str());
        match self.shard() {
            Some(shard) => {
                let inner = shard.inner().read();
                out.set("count", inner.order.len() as i64);
                out.set("indexes", inner.indexes.iter().count() as i64);
                drop(inner);
                out.set("inserts", shard.stats.inserts() as i64);
                out.set("updates", shard.stats.updates() as i64);
                out.set("deletes", shard.stats.deletes() as i64);
                out.set("queries", shard.stats.queries() as i64);
            }
            None => {
                out.set("count", 0i64);
                out.set("indexes", 0i64);
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Installs the field-encryption transform for this collection.
    pub fn set_encryption(&self, crypto: FieldCrypto) -> EngineResult<()> {
        self.engine.ensure_open()?;
        let shard = self.shard_or_create();
        *shard.crypto.write() = Some(Arc::new(crypto));
        Ok(())
    }

    /// Reads a media field eagerly, yielding its raw bytes.
    pub fn media(&self, id: &Value, field: &str) -> EngineResult<MediaValue> {
        self.engine.ensure_open()?;
        let shard = self
            .shard()
            .ok_or_else(|| EngineError::not_found(format!("collection {:?}", self.name)))?;
        let doc = shard
            .read_doc(&DocId(id.clone()))
            .ok_or_else(|| EngineError::not_found(format!("document {id:?}")))?;
        Ok(MediaValue::Eager(media::media_from_doc(&doc, field)?))
    }

    /// A deferred media handle, resolved on demand through the
    /// process-wide cache.
    #[must_use]
    pub fn media_deferred(&self, id: &Value, field: &str) -> MediaValue {
        MediaValue::Deferred(MediaKey {
            db: self.db.clone(),
            coll: self.name.clone(),
            id: id.clone(),
            field: field.to_string(),
        })
    }

    /// Resolves a media value to bytes, consulting the cache for
    /// deferred handles.
    pub fn fetch_media(&self, value: &MediaValue) -> EngineResult<Vec<u8>> {
        match value {
            MediaValue::Eager(bytes) => Ok(bytes.clone()),
            MediaValue::Deferred(key) => {
                self.engine.ensure_open()?;
                let bytes = media::resolve_deferred(key, || {
                    let shard = self.engine.shard(&key.db, &key.coll).ok_or_else(|| {
                        EngineError::not_found(format!("collection {:?}", key.coll))
                    })?;
                    let doc = shard
                        .read_doc(&DocId(key.id.clone()))
                        .ok_or_else(|| EngineError::not_found(format!("document {:?}", key.id)))?;
                    media::media_from_doc(&doc, &key.field)
                })?;
                Ok(bytes.as_ref().clone())
            }
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("db", &self.db)
            .field("name", &self.name)
            .finish()
    }
}

/// Current UTC time in milliseconds.
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Enumerates candidate ids for an access path, in access order.
fn candidate_ids(inner: &CollectionInner, access: &AccessPath) -> Vec<DocId> {
    match access {
        AccessPath::Scan => inner.order.clone(),
        AccessPath::IndexEq { index, prefix } => match inner.indexes.get(index) {
            Some(index) => index.probe_eq(prefix),
            None => inner.order.clone(),
        },
        AccessPath::IndexIn { index, values } => match inner.indexes.get(index) {
            Some(index) => {
                let mut seen = BTreeSet::new();
                let mut out = Vec::new();
                for value in values {
                    for id in index.probe_eq(std::slice::from_ref(value)) {
                        if seen.insert(id.clone()) {
                            out.push(id);
                        }
                    }
                }
                out
            }
            None => inner.order.clone(),
        },
        AccessPath::IndexRange {
            index,
            lower,
            upper,
        } => match inner.indexes.get(index) {
            Some(index) => index.probe_range(lower.as_ref(), upper.as_ref()),
            None => inner.order.clone(),
        },
        AccessPath::Union(branches) => {
            let mut seen = BTreeSet::new();
            let mut out = Vec::new();
            for branch in branches {
                for id in candidate_ids(inner, branch) {
                    if seen.insert(id.clone()) {
                        out.push(id);
                    }
                }
            }
            out
        }
    }
}

/// Residual evaluation: re-checks the full filter on every candidate.
fn matching_ids(inner: &CollectionInner, filter: &Filter, plan: &Plan) -> Vec<DocId> {
    candidate_ids(inner, &plan.access)
        .into_iter()
        .filter(|id| inner.docs.get(id).is_some_and(|doc| filter.matches(doc)))
        .collect()
}

/// Sorts matched ids by their documents' sort keys at snapshot time.
fn sort_ids(inner: &CollectionInner, ids: &mut [DocId], sort: &[(String, i8)]) {
    ids.sort_by(|a, b| {
        let (Some(da), Some(db_)) = (inner.docs.get(a), inner.docs.get(b)) else {
            return std::cmp::Ordering::Equal;
        };
        for (path, dir) in sort {
            let va = crate::path::resolve(da, path).unwrap_or(&Value::Null);
            let vb = crate::path::resolve(db_, path).unwrap_or(&Value::Null);
            let ord = sort_cmp(va, vb, *dir < 0);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn bound_ids(ids: &mut Vec<DocId>, skip: usize, limit: Option<usize>) {
    if skip > 0 {
        ids.drain(..skip.min(ids.len()));
    }
    if let Some(limit) = limit {
        ids.truncate(limit);
    }
}

/// Seeds an upsert document from the filter's equality constraints.
fn upsert_seed(filter: &Filter, seed: &mut Document) {
    match filter {
        Filter::And(subs) => {
            for sub in subs {
                upsert_seed(sub, seed);
            }
        }
        Filter::Field { path, conds } => {
            for cond in conds {
                if let FieldCond::Eq(value) = cond {
                    let _ = path::set_path(seed, path, value.clone());
                }
            }
        }
        // $or and $nor contribute nothing to the seed.
        Filter::Or(_) | Filter::Nor(_) => {}
    }
}

fn parse_index_keys(keys: &Document) -> EngineResult<Vec<(String, i8)>> {
    if keys.is_empty() {
        return Err(EngineError::bad_query("index needs at least one key"));
    }
    let spec = parse_sort_spec(&Value::Doc(keys.clone())).map_err(|_| {
        EngineError::bad_query("index keys must map fields to 1 or -1")
    })?;
    Ok(spec)
}
