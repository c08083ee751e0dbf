//! Per-collection index maintenance.
//!
//! Every index keeps its entries in one-to-one correspondence with the
//! live documents of its collection. Writers validate unique constraints
//! across all indexes *before* touching any of them, so a rejected write
//! leaves every index unchanged.

use crate::error::{EngineError, EngineResult};
use crate::index::key::{DocId, IndexKey};
use crate::path;
use mainydb_codec::{hash_value, total_cmp, Document, Value};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hasher;
use std::ops::Bound;
use std::sync::Arc;

/// Name of the implicit unique index on `_id`.
pub const ID_INDEX: &str = "_id_";

/// The physical layout of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Sorted by key tuple; supports equality, prefix, and range probes.
    Ordered,
    /// Hash table over the full key tuple; equality probes only.
    Hashed,
}

/// The definition of one index.
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// Index name (generated from key paths when not user-supplied).
    pub name: String,
    /// Key paths with direction (+1 ascending, -1 descending).
    pub keys: Vec<(String, i8)>,
    /// Whether key tuples must be unique across documents.
    pub unique: bool,
    /// Physical layout.
    pub kind: IndexKind,
}

impl IndexDef {
    /// The conventional generated name: `field_1_other_-1`.
    #[must_use]
    pub fn generated_name(keys: &[(String, i8)]) -> String {
        let parts: Vec<String> = keys.iter().map(|(p, d)| format!("{p}_{d}")).collect();
        parts.join("_")
    }

    /// Renders the definition as a document, for `list_indexes` and the
    /// persisted root.
    #[must_use]
    pub fn to_doc(&self) -> Document {
        let mut out = Document::with_capacity(4);
        out.set("name", self.name.as_str());
        out.set(
            "keys",
            Value::Array(
                self.keys
                    .iter()
                    .map(|(field, dir)| {
                        let mut key = Document::with_capacity(2);
                        key.set("field", field.as_str());
                        key.set("dir", i64::from(*dir));
                        Value::Doc(key)
                    })
                    .collect(),
            ),
        );
        out.set("unique", self.unique);
        out.set(
            "kind",
            match self.kind {
                IndexKind::Ordered => "ordered",
                IndexKind::Hashed => "hashed",
            },
        );
        out
    }
}

enum IndexData {
    Ordered(BTreeMap<IndexKey, BTreeSet<DocId>>),
    Hashed(HashMap<u64, Vec<HashedBucket>>),
}

struct HashedBucket {
    key: Vec<Value>,
    ids: BTreeSet<DocId>,
}

/// One live index.
pub struct Index {
    def: IndexDef,
    directions: Arc<[i8]>,
    data: IndexData,
}

impl Index {
    fn empty(def: IndexDef) -> Self {
        let directions: Arc<[i8]> = def.keys.iter().map(|(_, d)| *d).collect();
        let data = match def.kind {
            IndexKind::Ordered => IndexData::Ordered(BTreeMap::new()),
            IndexKind::Hashed => IndexData::Hashed(HashMap::new()),
        };
        Self {
            def,
            directions,
            data,
        }
    }

    /// The index definition.
    #[must_use]
    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    /// Extracts the key tuple a document contributes to this index.
    /// Missing fields contribute null.
    #[must_use]
    pub fn key_values(&self, doc: &Document) -> Vec<Value> {
        self.def
            .keys
            .iter()
            .map(|(p, _)| path::resolve(doc, p).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// True when another live document already owns this key tuple.
    fn has_conflict(&self, values: &[Value], exclude: &DocId) -> bool {
        match &self.data {
            IndexData::Ordered(map) => {
                let key = IndexKey::new(values.to_vec(), Arc::clone(&self.directions));
                map.get(&key)
                    .is_some_and(|ids| ids.iter().any(|id| id != exclude))
            }
            IndexData::Hashed(map) => map
                .get(&hash_values(values))
                .into_iter()
                .flatten()
                .filter(|bucket| values_equal(&bucket.key, values))
                .any(|bucket| bucket.ids.iter().any(|id| id != exclude)),
        }
    }

    fn add(&mut self, id: DocId, values: Vec<Value>) {
        match &mut self.data {
            IndexData::Ordered(map) => {
                let key = IndexKey::new(values, Arc::clone(&self.directions));
                map.entry(key).or_default().insert(id);
            }
            IndexData::Hashed(map) => {
                let buckets = map.entry(hash_values(&values)).or_default();
                match buckets.iter_mut().find(|b| values_equal(&b.key, &values)) {
                    Some(bucket) => {
                        bucket.ids.insert(id);
                    }
                    None => {
                        let mut ids = BTreeSet::new();
                        ids.insert(id);
                        buckets.push(HashedBucket { key: values, ids });
                    }
                }
            }
        }
    }

    fn drop_entry(&mut self, id: &DocId, values: &[Value]) {
        match &mut self.data {
            IndexData::Ordered(map) => {
                let key = IndexKey::new(values.to_vec(), Arc::clone(&self.directions));
                if let Some(ids) = map.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        map.remove(&key);
                    }
                }
            }
            IndexData::Hashed(map) => {
                let hash = hash_values(values);
                if let Some(buckets) = map.get_mut(&hash) {
                    for bucket in buckets.iter_mut() {
                        if values_equal(&bucket.key, values) {
                            bucket.ids.remove(id);
                        }
                    }
                    buckets.retain(|b| !b.ids.is_empty());
                    if buckets.is_empty() {
                        map.remove(&hash);
                    }
                }
            }
        }
    }

    /// All ids whose key tuple starts with the given equality prefix, in
    /// index order.
    #[must_use]
    pub fn probe_eq(&self, prefix: &[Value]) -> Vec<DocId> {
        match &self.data {
            IndexData::Ordered(map) => {
                let low = IndexKey::prefix_lower(prefix, Arc::clone(&self.directions));
                let high = IndexKey::prefix_upper(prefix, Arc::clone(&self.directions));
                map.range((Bound::Included(low), Bound::Included(high)))
                    .flat_map(|(_, ids)| ids.iter().cloned())
                    .collect()
            }
            IndexData::Hashed(map) => {
                // Hashed probes need the full key tuple.
                if prefix.len() != self.def.keys.len() {
                    return Vec::new();
                }
                map.get(&hash_values(prefix))
                    .into_iter()
                    .flatten()
                    .filter(|bucket| values_equal(&bucket.key, prefix))
                    .flat_map(|bucket| bucket.ids.iter().cloned())
                    .collect()
            }
        }
    }

    /// All ids whose first key component falls in the given bounds, in
    /// index order. Ordered indexes only.
    #[must_use]
    pub fn probe_range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Vec<DocId> {
        let IndexData::Ordered(map) = &self.data else {
            return Vec::new();
        };
        // A descending first key stores the interval reversed.
        let descending = self.directions.first().copied().unwrap_or(1) < 0;
        let (lo, hi) = if descending {
            (upper, lower)
        } else {
            (lower, upper)
        };
        let low = IndexKey::range_bound(lo, Arc::clone(&self.directions), true);
        let high = IndexKey::range_bound(hi, Arc::clone(&self.directions), false);
        map.range((low, high))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Number of distinct key tuples.
    #[must_use]
    pub fn key_count(&self) -> usize {
        match &self.data {
            IndexData::Ordered(map) => map.len(),
            IndexData::Hashed(map) => map.values().map(Vec::len).sum(),
        }
    }
}

/// The set of indexes on one collection.
pub struct IndexSet {
    indexes: Vec<Index>,
}

impl IndexSet {
    /// Creates the index set for a fresh collection, containing only the
    /// implicit unique `_id` index.
    #[must_use]
    pub fn new() -> Self {
        let mut set = Self {
            indexes: Vec::new(),
        };
        let def = IndexDef {
            name: ID_INDEX.to_string(),
            keys: vec![("_id".to_string(), 1)],
            unique: true,
            kind: IndexKind::Ordered,
        };
        set.indexes.push(Index::empty(def));
        set
    }

    /// Looks up an index by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.def.name == name)
    }

    /// Iterates over the indexes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter()
    }

    /// Builds a new index over the given documents.
    ///
    /// A unique violation aborts the build and leaves no partial index
    /// behind.
    pub fn build<'a>(
        &mut self,
        def: IndexDef,
        docs: impl Iterator<Item = (&'a DocId, &'a Document)>,
    ) -> EngineResult<()> {
        if self.get(&def.name).is_some() {
            return Err(EngineError::bad_query(format!(
                "index {:?} already exists",
                def.name
            )));
        }
        if def.keys.is_empty() {
            return Err(EngineError::bad_query("index needs at least one key"));
        }

        let mut index = Index::empty(def);
        for (id, doc) in docs {
            let values = index.key_values(doc);
            if index.def.unique && index.has_conflict(&values, id) {
                let key = IndexKey::new(values, Arc::clone(&index.directions));
                return Err(EngineError::duplicate_key(
                    index.def.name.clone(),
                    key.render(),
                ));
            }
            index.add(id.clone(), values);
        }
        self.indexes.push(index);
        Ok(())
    }

    /// Drops a named index. The implicit `_id` index cannot be dropped.
    pub fn drop(&mut self, name: &str) -> EngineResult<()> {
        if name == ID_INDEX {
            return Err(EngineError::bad_query("cannot drop the _id index"));
        }
        let pos = self
            .indexes
            .iter()
            .position(|i| i.def.name == name)
            .ok_or_else(|| EngineError::not_found(format!("index {name:?}")))?;
        self.indexes.remove(pos);
        Ok(())
    }

    /// Drops every index except the implicit `_id` index.
    pub fn drop_all(&mut self) {
        self.indexes.retain(|i| i.def.name == ID_INDEX);
    }

    /// Registers a document in every index, or fails without touching
    /// any of them.
    pub fn insert_doc(&mut self, id: &DocId, doc: &Document) -> EngineResult<()> {
        let mut per_index: Vec<Vec<Value>> = Vec::with_capacity(self.indexes.len());
        for index in &self.indexes {
            let values = index.key_values(doc);
            if index.def.unique && index.has_conflict(&values, id) {
                let key = IndexKey::new(values, Arc::clone(&index.directions));
                return Err(EngineError::duplicate_key(
                    index.def.name.clone(),
                    key.render(),
                ));
            }
            per_index.push(values);
        }
        for (index, values) in self.indexes.iter_mut().zip(per_index) {
            index.add(id.clone(), values);
        }
        Ok(())
    }

    /// Removes a document from every index.
    pub fn remove_doc(&mut self, id: &DocId, doc: &Document) {
        for index in &mut self.indexes {
            let values = index.key_values(doc);
            index.drop_entry(id, &values);
        }
    }

    /// Moves a document's entries from its old key tuples to its new
    /// ones, or fails without touching anything.
    pub fn update_doc(&mut self, id: &DocId, old: &Document, new: &Document) -> EngineResult<()> {
        struct Change {
            at: usize,
            old_values: Vec<Value>,
            new_values: Vec<Value>,
        }

        let mut changes = Vec::new();
        for (at, index) in self.indexes.iter().enumerate() {
            let old_values = index.key_values(old);
            let new_values = index.key_values(new);
            if values_equal(&old_values, &new_values) {
                continue;
            }
            if index.def.unique && index.has_conflict(&new_values, id) {
                let key = IndexKey::new(new_values, Arc::clone(&index.directions));
                return Err(EngineError::duplicate_key(
                    index.def.name.clone(),
                    key.render(),
                ));
            }
            changes.push(Change {
                at,
                old_values,
                new_values,
            });
        }

        for change in changes {
            let index = &mut self.indexes[change.at];
            index.drop_entry(id, &change.old_values);
            index.add(id.clone(), change.new_values);
        }
        Ok(())
    }
}

impl Default for IndexSet {
    fn default() -> Self {
        Self::new()
    }
}

fn values_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| total_cmp(x, y) == Ordering::Equal)
}

/// Hashes a key tuple consistently with [`values_equal`]: tuples that
/// compare equal (including int/float collisions) hash alike.
fn hash_values(values: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for value in values {
        hash_value(value, &mut hasher);
    }
    hasher.finish()
}
