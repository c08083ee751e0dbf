//! The single-file persistent store.
//!
//! All persistent state lives in one file: a fixed header (magic,
//! format version, reserved word) followed by the encoded root document.
//! Writes are checkpoint-replace: the root is serialized to a temp file
//! beside the target, synced, and atomically renamed over it. The
//! in-memory journal is truncated only after the rename lands, which
//! gives crash-atomicity at checkpoint granularity.

mod journal;

pub use journal::{Journal, JournalOp};

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use mainydb_codec::{decode_value, encode_value, Value};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File magic.
pub const MAGIC: [u8; 8] = *b"MAINYDB\0";

/// Current format version. Readers reject any other version.
pub const FORMAT_VERSION: u32 = 1;

/// Default file name when the store is opened on a directory.
pub const DEFAULT_FILE_NAME: &str = "mainydb.mdb";

const HEADER_LEN: usize = 16;

/// The persistence half of the engine: owns the file path, the journal,
/// and checkpoint errors deferred for reporting on close.
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    config: Config,
    journal: Journal,
    deferred_error: Mutex<Option<EngineError>>,
}

impl Store {
    /// A store with no backing file; checkpoints are no-ops.
    #[must_use]
    pub fn in_memory(config: Config) -> Self {
        Self {
            path: None,
            config,
            journal: Journal::new(),
            deferred_error: Mutex::new(None),
        }
    }

    /// A store backed by a file.
    ///
    /// A path naming an existing directory stores
    /// [`DEFAULT_FILE_NAME`] inside it; anything else names the file
    /// itself.
    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>, config: Config) -> Self {
        let path: PathBuf = path.into();
        let file = if path.is_dir() {
            path.join(DEFAULT_FILE_NAME)
        } else {
            path
        };
        Self {
            path: Some(file),
            config,
            journal: Journal::new(),
            deferred_error: Mutex::new(None),
        }
    }

    /// The backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The store's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The operation journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Loads the root value from disk.
    ///
    /// Returns `None` when the store is in-memory or the file does not
    /// exist yet (a fresh, empty root). Header or decode failures are
    /// `CorruptFile`; read failures are `IoError`.
    pub fn load(&self) -> EngineResult<Option<Value>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            if !self.config.create_if_missing {
                return Err(EngineError::not_found(format!(
                    "store file {}",
                    path.display()
                )));
            }
            return Ok(None);
        }

        let bytes = fs::read(path)?;
        if bytes.len() < HEADER_LEN {
            return Err(EngineError::corrupt(format!(
                "file is {} bytes, smaller than the header",
                bytes.len()
            )));
        }
        if bytes[..8] != MAGIC {
            return Err(EngineError::corrupt("bad magic"));
        }
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != FORMAT_VERSION {
            return Err(EngineError::corrupt(format!(
                "unsupported format version {version}"
            )));
        }

        let root = decode_value(&bytes[HEADER_LEN..])?;
        if root.as_doc().is_none() {
            return Err(EngineError::corrupt("root is not a document"));
        }
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "loaded store file");
        Ok(Some(root))
    }

    /// Checkpoint-replaces the file with a freshly serialized root, then
    /// truncates the journal.
    ///
    /// A failed write removes the temp file and leaves both the target
    /// file and the journal untouched.
    pub fn checkpoint(&self, root: &Value) -> EngineResult<()> {
        let Some(path) = &self.path else {
            // In-memory stores still honor the journal contract.
            self.journal.mark_checkpoint();
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut payload = Vec::with_capacity(HEADER_LEN + 1024);
        payload.extend_from_slice(&MAGIC);
        payload.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&encode_value(root));

        let tmp = path.with_extension("mdb.tmp");
        let result = (|| -> EngineResult<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            if self.config.sync_on_checkpoint {
                file.sync_all()?;
            }
            drop(file);
            fs::rename(&tmp, path)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.journal.mark_checkpoint();
                tracing::debug!(path = %path.display(), bytes = payload.len(), "checkpoint complete");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err)
            }
        }
    }

    /// Records a checkpoint failure for re-reporting on close.
    pub fn defer_error(&self, err: EngineError) {
        tracing::warn!(error = %err, "checkpoint failed; will retry and re-report on close");
        let mut slot = self.deferred_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Takes the earliest deferred checkpoint error, if any.
    pub fn take_deferred_error(&self) -> Option<EngineError> {
        self.deferred_error.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mainydb_codec::doc;
    use tempfile::tempdir;

    fn root() -> Value {
        Value::Doc(doc! { "v": 1i64, "dbs": doc! {} })
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = Store::at_path(dir.path().join("db.mdb"), Config::default());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn directory_path_uses_default_file_name() {
        let dir = tempdir().unwrap();
        let store = Store::at_path(dir.path(), Config::default());
        assert_eq!(
            store.path().unwrap(),
            dir.path().join(DEFAULT_FILE_NAME).as_path()
        );
    }

    #[test]
    fn checkpoint_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = Store::at_path(dir.path().join("db.mdb"), Config::default());

        let value = root();
        store.checkpoint(&value).unwrap();

        let loaded = Store::at_path(dir.path().join("db.mdb"), Config::default())
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn checkpoint_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = Store::at_path(dir.path().join("db.mdb"), Config::default());
        store.checkpoint(&root()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["db.mdb".to_string()]);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.mdb");
        fs::write(&path, b"NOTMAINYxxxxxxxx").unwrap();

        let err = Store::at_path(path, Config::default()).load().unwrap_err();
        assert!(matches!(err, EngineError::CorruptFile { .. }));
    }

    #[test]
    fn wrong_version_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.mdb");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&encode_value(&root()));
        fs::write(&path, &bytes).unwrap();

        let err = Store::at_path(path, Config::default()).load().unwrap_err();
        assert!(matches!(err, EngineError::CorruptFile { .. }));
    }

    #[test]
    fn truncated_body_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.mdb");
        let store = Store::at_path(path.clone(), Config::default());
        store.checkpoint(&root()).unwrap();

        // Truncate just after the header.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..HEADER_LEN]).unwrap();

        let err = Store::at_path(path, Config::default()).load().unwrap_err();
        assert!(matches!(err, EngineError::CorruptFile { .. }));
    }

    #[test]
    fn checkpoint_truncates_journal() {
        let store = Store::in_memory(Config::default());
        store.journal().record(JournalOp::Insert {
            db: "d".into(),
            coll: "c".into(),
        });
        assert!(!store.journal().is_empty());

        store.checkpoint(&root()).unwrap();
        assert!(store.journal().is_empty());
    }

    #[test]
    fn deferred_errors_keep_the_first() {
        let store = Store::in_memory(Config::default());
        store.defer_error(EngineError::corrupt("first"));
        store.defer_error(EngineError::corrupt("second"));

        match store.take_deferred_error() {
            Some(EngineError::CorruptFile { message }) => assert_eq!(message, "first"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(store.take_deferred_error().is_none());
    }
}
