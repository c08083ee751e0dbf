//! The root handle: databases, collections, and flush coordination.

use crate::collection::{Collection, CollectionInner, CollectionShard};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::index::{DocId, IndexDef, IndexKind, ID_INDEX};
use crate::query::Filter;
use crate::store::{JournalOp, Store, FORMAT_VERSION};
use mainydb_codec::{Document, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Databases by name; each maps collection name to its shard.
pub(crate) type RootMap = BTreeMap<String, BTreeMap<String, Arc<CollectionShard>>>;

/// Shared engine state behind every handle.
pub(crate) struct EngineInner {
    store: Store,
    root: RwLock<RootMap>,
    closed: AtomicBool,
}

impl EngineInner {
    /// Looks up an existing collection shard.
    pub(crate) fn shard(&self, db: &str, coll: &str) -> Option<Arc<CollectionShard>> {
        self.root.read().get(db)?.get(coll).cloned()
    }

    /// Looks up or lazily creates a collection shard. Creation is what
    /// makes a database or collection name exist.
    pub(crate) fn shard_or_create(&self, db: &str, coll: &str) -> Arc<CollectionShard> {
        if let Some(shard) = self.shard(db, coll) {
            return shard;
        }
        let mut root = self.root.write();
        Arc::clone(
            root.entry(db.to_string())
                .or_default()
                .entry(coll.to_string())
                .or_insert_with(|| Arc::new(CollectionShard::new(db, coll))),
        )
    }

    /// Fails with `NotFound` once the store has been closed.
    pub(crate) fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::not_found("store is closed"))
        } else {
            Ok(())
        }
    }

    /// Journals a mutation and runs the checkpoint policy.
    ///
    /// Implicit checkpoint failures never surface to the caller whose
    /// write already succeeded in memory; they are logged and deferred
    /// to the next close. Must be called without any collection lock
    /// held.
    pub(crate) fn after_mutation(&self, op: JournalOp) {
        self.store.journal().record(op);
        if self.store.journal().checkpoint_due(self.store.config()) {
            if let Err(err) = self.checkpoint() {
                self.store.defer_error(err);
            }
        }
    }

    /// Serializes the root and checkpoint-replaces the store file.
    ///
    /// Takes the root lock exclusively, then each collection lock
    /// shared, so no writes proceed while the snapshot is cut.
    pub(crate) fn checkpoint(&self) -> EngineResult<()> {
        let root = self.root.write();
        let value = serialize_root(&root);
        self.store.checkpoint(&value)
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn root(&self) -> &RwLock<RootMap> {
        &self.root
    }

    /// Removes a collection from its database, failing with `NotFound`
    /// when it doesn't exist.
    pub(crate) fn drop_collection(&self, db: &str, coll: &str) -> EngineResult<()> {
        self.ensure_open()?;
        {
            let mut root = self.root.write();
            let colls = root
                .get_mut(db)
                .ok_or_else(|| EngineError::not_found(format!("collection {coll:?}")))?;
            if colls.remove(coll).is_none() {
                return Err(EngineError::not_found(format!("collection {coll:?}")));
            }
            if colls.is_empty() {
                root.remove(db);
            }
        }
        self.after_mutation(JournalOp::NamespaceChange { db: db.to_string() });
        Ok(())
    }
}

/// Resolves `$lookup` probes for pipelines running against one database.
pub(crate) struct LookupSource {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) db: String,
}

impl crate::aggregate::ForeignFetch for LookupSource {
    fn foreign_matches(
        &self,
        from: &str,
        foreign_field: &str,
        local: &Value,
    ) -> EngineResult<Vec<Document>> {
        // A join against a collection that doesn't exist attaches empty
        // arrays, like any other unmatched left join.
        let Some(shard) = self.engine.shard(&self.db, from) else {
            return Ok(Vec::new());
        };

        let filter = Filter::Field {
            path: foreign_field.to_string(),
            conds: vec![crate::query::FieldCond::Eq(local.clone())],
        };

        let inner = shard.inner().read();
        // Prefer an index whose first key is the foreign field.
        let probe: Option<Vec<DocId>> = inner
            .indexes
            .iter()
            .find(|i| i.def().keys.first().is_some_and(|(p, _)| p == foreign_field))
            .map(|i| i.probe_eq(std::slice::from_ref(local)));

        let docs = match probe {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.docs.get(id))
                .filter(|d| filter.matches(d))
                .cloned()
                .collect(),
            None => inner
                .order
                .iter()
                .filter_map(|id| inner.docs.get(id))
                .filter(|d| filter.matches(d))
                .cloned()
                .collect(),
        };
        Ok(docs)
    }
}

/// The embedded store: a hierarchy of named databases holding named
/// collections of documents, all persisted in one file.
///
/// ```rust,ignore
/// use mainydb_core::MainyDb;
///
/// let db = MainyDb::open("./app.mdb")?;
/// let users = db.db("app").collection("users");
/// users.insert_one(doc! { "name": "Ada" })?;
/// db.close()?;
/// ```
pub struct MainyDb {
    inner: Arc<EngineInner>,
}

impl MainyDb {
    /// Opens (or creates) a store at `path` with default configuration.
    ///
    /// A path naming an existing directory keeps the store in
    /// `mainydb.mdb` inside it.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a store with custom configuration.
    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> EngineResult<Self> {
        let store = Store::at_path(path.as_ref(), config);
        let root = match store.load()? {
            Some(value) => load_root(&value)?,
            None => RootMap::new(),
        };
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                root: RwLock::new(root),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Opens a non-persistent store, for tests and scratch work.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store: Store::in_memory(Config::default()),
                root: RwLock::new(RootMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A handle to a named database. The name springs into existence on
    /// its first write.
    #[must_use]
    pub fn db(&self, name: &str) -> Database {
        Database {
            engine: Arc::clone(&self.inner),
            name: name.to_string(),
        }
    }

    /// Names of all databases that currently exist.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        self.inner.root.read().keys().cloned().collect()
    }

    /// Drops a database and everything in it. Unknown names are a
    /// no-op.
    pub fn drop_database(&self, name: &str) -> EngineResult<()> {
        self.inner.ensure_open()?;
        let removed = self.inner.root.write().remove(name).is_some();
        if removed {
            self.inner.after_mutation(JournalOp::NamespaceChange {
                db: name.to_string(),
            });
        }
        Ok(())
    }

    /// Forces a checkpoint now.
    pub fn flush(&self) -> EngineResult<()> {
        self.inner.ensure_open()?;
        self.inner.checkpoint()
    }

    /// Closes the store with a final blocking checkpoint.
    ///
    /// Reports the first checkpoint error deferred since the last
    /// close, even when the final checkpoint itself succeeds. Closing
    /// twice is a no-op.
    pub fn close(&self) -> EngineResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.checkpoint()?;
        match self.inner.store.take_deferred_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for MainyDb {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "error while closing store on drop");
        }
    }
}

impl std::fmt::Debug for MainyDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainyDb")
            .field("path", &self.inner.store.path())
            .field("databases", &self.database_names())
            .finish_non_exhaustive()
    }
}

/// A named database: a mapping from collection name to collection.
#[derive(Clone)]
pub struct Database {
    engine: Arc<EngineInner>,
    name: String,
}

impl Database {
    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle to a named collection, created lazily on first write.
    #[must_use]
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(Arc::clone(&self.engine), self.name.clone(), name)
    }

    /// Names of the collections that currently exist here.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.engine
            .root
            .read()
            .get(&self.name)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops a collection, failing with `NotFound` if it doesn't exist.
    pub fn drop_collection(&self, name: &str) -> EngineResult<()> {
        self.engine.drop_collection(&self.name, name)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

/// Builds the §6 root document: `{v, dbs: {name: {colls: {...}}}}`.
fn serialize_root(root: &RootMap) -> Value {
    let mut dbs = Document::with_capacity(root.len());
    for (db_name, colls) in root {
        let mut colls_doc = Document::with_capacity(colls.len());
        for (coll_name, shard) in colls {
            let inner = shard.inner().read();
            let mut coll = Document::with_capacity(3);
            coll.set("options", Value::Doc(inner.options.clone()));
            coll.set(
                "docs",
                Value::Array(
                    inner
                        .order
                        .iter()
                        .filter_map(|id| inner.docs.get(id).cloned().map(Value::Doc))
                        .collect(),
                ),
            );
            coll.set(
                "indexes",
                Value::Array(
                    inner
                        .indexes
                        .iter()
                        .map(|i| Value::Doc(i.def().to_doc()))
                        .collect(),
                ),
            );
            colls_doc.set(coll_name.as_str(), Value::Doc(coll));
        }
        let mut db_doc = Document::with_capacity(1);
        db_doc.set("colls", Value::Doc(colls_doc));
        dbs.set(db_name.as_str(), Value::Doc(db_doc));
    }

    let mut out = Document::with_capacity(2);
    out.set("v", i64::from(FORMAT_VERSION));
    out.set("dbs", Value::Doc(dbs));
    Value::Doc(out)
}

/// Rebuilds the in-memory root from the decoded root document. Index
/// entries are rebuilt from the documents rather than trusted from
/// disk.
fn load_root(value: &Value) -> EngineResult<RootMap> {
    let root_doc = value
        .as_doc()
        .ok_or_else(|| EngineError::corrupt("root is not a document"))?;
    let dbs = root_doc
        .get("dbs")
        .and_then(Value::as_doc)
        .ok_or_else(|| EngineError::corrupt("root has no dbs map"))?;

    let mut root = RootMap::new();
    for (db_name, db_value) in dbs.iter() {
        let colls = db_value
            .as_doc()
            .and_then(|d| d.get("colls"))
            .and_then(Value::as_doc)
            .ok_or_else(|| EngineError::corrupt(format!("database {db_name:?} has no colls")))?;

        let mut shards = BTreeMap::new();
        for (coll_name, coll_value) in colls.iter() {
            let shard = load_collection(db_name, coll_name, coll_value)?;
            shards.insert(coll_name.to_string(), Arc::new(shard));
        }
        root.insert(db_name.to_string(), shards);
    }
    Ok(root)
}

fn load_collection(db: &str, name: &str, value: &Value) -> EngineResult<CollectionShard> {
    let coll = value
        .as_doc()
        .ok_or_else(|| EngineError::corrupt(format!("collection {name:?} is not a document")))?;

    let options = coll
        .get("options")
        .and_then(Value::as_doc)
        .cloned()
        .unwrap_or_default();

    let mut inner = CollectionInner::new(options);

    for index_value in coll
        .get("indexes")
        .and_then(Value::as_array)
        .unwrap_or(&[])
    {
        let def = load_index_def(name, index_value)?;
        // The implicit _id index is already present.
        if def.name == ID_INDEX {
            continue;
        }
        inner
            .indexes
            .build(def, std::iter::empty::<(&DocId, &Document)>())
            .map_err(|e| EngineError::corrupt(format!("index on {name:?}: {e}")))?;
    }

    let docs = coll
        .get("docs")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::corrupt(format!("collection {name:?} has no docs array")))?;
    for doc_value in docs {
        let doc = doc_value
            .as_doc()
            .ok_or_else(|| EngineError::corrupt("stored document is not a document"))?;
        let id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| EngineError::corrupt("stored document has no _id"))?;
        let id = DocId(id);
        inner
            .indexes
            .insert_doc(&id, doc)
            .map_err(|e| EngineError::corrupt(format!("rebuilding indexes for {name:?}: {e}")))?;
        inner.order.push(id.clone());
        inner.docs.insert(id, doc.clone());
    }

    Ok(CollectionShard::with_inner(db, name, inner))
}

fn load_index_def(coll: &str, value: &Value) -> EngineResult<IndexDef> {
    let doc = value
        .as_doc()
        .ok_or_else(|| EngineError::corrupt(format!("index def on {coll:?} is not a document")))?;
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::corrupt("index def has no name"))?
        .to_string();

    let mut keys = Vec::new();
    for key in doc.get("keys").and_then(Value::as_array).unwrap_or(&[]) {
        let key = key
            .as_doc()
            .ok_or_else(|| EngineError::corrupt("index key is not a document"))?;
        let field = key
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::corrupt("index key has no field"))?;
        let dir = match key.get("dir").and_then(Value::as_i64) {
            Some(-1) => -1,
            _ => 1,
        };
        keys.push((field.to_string(), dir));
    }
    if keys.is_empty() {
        return Err(EngineError::corrupt(format!(
            "index {name:?} on {coll:?} has no keys"
        )));
    }

    let unique = doc.get("unique").and_then(Value::as_bool).unwrap_or(false);
    let kind = match doc.get("kind").and_then(Value::as_str) {
        Some("hashed") => IndexKind::Hashed,
        _ => IndexKind::Ordered,
    };

    Ok(IndexDef {
        name,
        keys,
        unique,
        kind,
    })
}
