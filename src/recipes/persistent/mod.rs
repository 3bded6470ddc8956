//! File-backed recipe store.
//!
//! Recipes are appended to a single CRC-framed log (`recipes.log`) inside a
//! directory owned exclusively through a lock file. On open, the whole log is
//! replayed into memory; a record cut short by a crash is truncated away.

mod codec;
mod file_lock;

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::StorageError;

use self::codec::{encode_record, read_header, read_record, write_header, Frame, HEADER_LEN};
use self::file_lock::DirLock;
use super::store::{RecipeStore, StoredRecipe};

const LOG_FILE: &str = "recipes.log";

/// Configuration for the file-backed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentRecipeConfig {
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentRecipeConfig {
    fn default() -> Self {
        Self { sync_on_write: true }
    }
}

#[derive(Debug)]
struct LogState {
    file: File,
    /// End of the last record known to be complete.
    committed_len: u64,
    recipes: Vec<StoredRecipe>,
}

impl LogState {
    /// Cuts the log back to `committed_len` and repositions at the end.
    fn rewind(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.committed_len)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8], sync: bool) -> std::io::Result<()> {
        self.file.write_all(bytes)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// [`RecipeStore`] persisted in a directory.
#[derive(Debug)]
pub struct FileRecipeStore {
    dir: PathBuf,
    config: PersistentRecipeConfig,
    state: Mutex<LogState>,
    _lock: DirLock,
}

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

impl FileRecipeStore {
    /// Opens (or creates) a store with default configuration.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_config(dir, PersistentRecipeConfig::default())
    }

    /// Opens (or creates) a store.
    ///
    /// # Errors
    /// Fails if another store owns the directory, the log header is foreign,
    /// or a complete record fails its checksum.
    pub fn open_with_config(
        dir: impl AsRef<Path>,
        config: PersistentRecipeConfig,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_err("create store directory", &e))?;
        let lock = DirLock::acquire(&dir).map_err(|e| io_err("lock store directory", &e))?;

        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err("open recipe log", &e))?;
        let len = file
            .metadata()
            .map_err(|e| io_err("stat recipe log", &e))?
            .len();

        let recipes = if len == 0 {
            write_header(&mut file).map_err(|e| io_err("write log header", &e))?;
            file.sync_all().map_err(|e| io_err("sync log header", &e))?;
            Vec::new()
        } else {
            replay(&file, &path)?
        };
        let committed_len = file
            .seek(SeekFrom::End(0))
            .map_err(|e| io_err("seek recipe log", &e))?;

        info!(
            path = %path.display(),
            lock = %lock.path().display(),
            recipes = recipes.len(),
            "recipe store opened"
        );
        Ok(Self {
            dir,
            config,
            state: Mutex::new(LogState {
                file,
                committed_len,
                recipes,
            }),
            _lock: lock,
        })
    }

    /// Directory the store lives in.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn replay(file: &File, path: &Path) -> Result<Vec<StoredRecipe>, StorageError> {
    let mut reader = BufReader::new(file);
    read_header(&mut reader).map_err(|e| io_err("read log header", &e))?;

    let mut recipes = Vec::new();
    let mut offset = HEADER_LEN;
    loop {
        match read_record::<StoredRecipe>(&mut reader).map_err(|e| io_err("read recipe log", &e))? {
            Frame::Record(recipe, size) => {
                offset += size;
                recipes.push(recipe);
            }
            Frame::End => break,
            Frame::TornTail => {
                warn!(path = %path.display(), offset, "truncating torn recipe log tail");
                file.set_len(offset)
                    .map_err(|e| io_err("truncate recipe log", &e))?;
                file.sync_all()
                    .map_err(|e| io_err("sync recipe log", &e))?;
                break;
            }
        }
    }
    Ok(recipes)
}

impl RecipeStore for FileRecipeStore {
    fn load_all(&self) -> Result<Vec<StoredRecipe>, StorageError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StorageError::BackendError("poisoned lock: recipe_log".to_string()))?;
        Ok(state.recipes.clone())
    }

    fn save(&self, recipe: &StoredRecipe) -> Result<(), StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::BackendError("poisoned lock: recipe_log".to_string()))?;
        if state.recipes.iter().any(|r| r.id == recipe.id) {
            return Ok(());
        }

        let bytes = encode_record(recipe)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        // Bytes past the last complete record belong to an append that failed.
        let len = state
            .file
            .metadata()
            .map_err(|e| io_err("stat recipe log", &e))?
            .len();
        if len != state.committed_len {
            warn!(len, committed = state.committed_len, "discarding partial recipe record");
            state.rewind().map_err(|e| io_err("rewind recipe log", &e))?;
        }

        if let Err(err) = state.append(&bytes, self.config.sync_on_write) {
            if let Err(rewind) = state.rewind() {
                warn!(error = %rewind, "failed to rewind recipe log after a failed append");
            }
            return Err(io_err("append recipe", &err));
        }
        state.committed_len += bytes.len() as u64;
        state.recipes.push(recipe.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::recipes::{RecipeDefinition, RecipeId};

    fn stored() -> StoredRecipe {
        stored_for("tags")
    }

    fn stored_for(collection: &str) -> StoredRecipe {
        let definition: RecipeDefinition = serde_json::from_value(json!({
            "select": {"app": "src", "collection": collection, "placeholder": "tag"}
        }))
        .unwrap();
        StoredRecipe {
            id: RecipeId::for_definition(&definition).unwrap(),
            definition,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn directory_has_a_single_owner() {
        let dir = tempdir().unwrap();
        let _store = FileRecipeStore::open(dir.path()).unwrap();
        assert!(FileRecipeStore::open(dir.path()).is_err());
    }

    #[test]
    fn duplicate_save_appends_once() {
        let dir = tempdir().unwrap();
        {
            let store = FileRecipeStore::open(dir.path()).unwrap();
            store.save(&stored()).unwrap();
            store.save(&stored()).unwrap();
            assert_eq!(store.load_all().unwrap().len(), 1);
        }
        let store = FileRecipeStore::open(dir.path()).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn partial_append_is_discarded_before_the_next_record() {
        let dir = tempdir().unwrap();
        let log = dir.path().join(LOG_FILE);
        {
            let store = FileRecipeStore::open(dir.path()).unwrap();
            store.save(&stored_for("first")).unwrap();

            // An append that died after writing part of its frame.
            let mut raw = OpenOptions::new().append(true).open(&log).unwrap();
            raw.write_all(&[0x40, 0x00, 0x00, 0x00, b'{', b'"']).unwrap();
            drop(raw);

            store.save(&stored_for("second")).unwrap();
        }

        let store = FileRecipeStore::open(dir.path()).unwrap();
        let collections: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.definition.select.collection)
            .collect();
        assert_eq!(collections, vec!["first".to_string(), "second".to_string()]);
    }
}
