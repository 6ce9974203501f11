//! The persisted `key -> (fingerprint, artifact)` index.
//!
//! One [`Hashchain`] handle exists per cache directory session. It is read
//! once when the session opens, consulted by the optimizer, updated by the
//! compute-store wrappers while the graph executes (possibly from many
//! worker threads at once), and written back as a whole with an atomic
//! rename.
//!
//! ## Durability
//!
//! With [`Durability::OnFinish`] the index is persisted once, when the
//! session finishes. A crash before that loses the index entries of the
//! run, but not the artifacts; the affected nodes simply recompute on the
//! next run. With [`Durability::EveryUpdate`] the whole index is rewritten
//! after every update, so a crash loses at most the node that was in
//! flight.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Key;
use crate::error::IndexError;
use crate::fingerprint::Fingerprint;
use crate::store::ArtifactId;

/// File name of the index inside the cache directory.
pub const INDEX_FILE: &str = "hashchain.bin";

const INDEX_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub fingerprint: Fingerprint,
    pub artifact: ArtifactId,
}

/// When index updates reach the disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// Persist once, when the session finishes.
    #[default]
    OnFinish,
    /// Persist after every update.
    EveryUpdate,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: BTreeMap<String, Entry>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<Key, Entry>,
    /// Updated since the last successful persist.
    dirty: bool,
}

pub struct Hashchain {
    path: Utf8PathBuf,
    durability: Durability,
    state: RwLock<State>,
}

impl Hashchain {
    /// Loads the index of `directory`. A missing file yields an empty index.
    /// So does an unreadable one: a corrupt index only costs recomputation.
    pub fn load(directory: &Utf8Path, durability: Durability) -> Self {
        let path = directory.join(INDEX_FILE);

        let entries = match read_entries(&path) {
            Ok(Some(entries)) => {
                tracing::debug!(%path, entries = entries.len(), "loaded hashchain");
                entries
            }
            Ok(None) => {
                tracing::debug!(%path, "no hashchain yet, starting empty");
                BTreeMap::new()
            }
            Err(reason) => {
                tracing::warn!(%path, %reason, "hashchain is corrupt, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            path,
            durability,
            state: RwLock::new(State {
                entries,
                dirty: false,
            }),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn lookup(&self, key: &str) -> Option<Entry> {
        self.read().entries.get(key).copied()
    }

    /// Records the entry for `key`. Only touches memory unless the handle
    /// was opened with [`Durability::EveryUpdate`].
    pub fn update(&self, key: Key, entry: Entry) -> Result<(), IndexError> {
        let mut state = self.write();
        state.entries.insert(key, entry);
        state.dirty = true;

        match self.durability {
            Durability::OnFinish => Ok(()),
            Durability::EveryUpdate => self.flush(&mut state),
        }
    }

    /// Writes the full index atomically if anything changed since the last
    /// persist, or if the file vanished while entries are held in memory.
    pub fn persist(&self) -> Result<(), IndexError> {
        let mut state = self.write();

        if !state.dirty && (state.entries.is_empty() || self.path.is_file()) {
            return Ok(());
        }

        self.flush(&mut state)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> BTreeMap<Key, Entry> {
        self.read().entries.clone()
    }

    fn flush(&self, state: &mut State) -> Result<(), IndexError> {
        let file = IndexFile {
            version: INDEX_VERSION,
            entries: state
                .entries
                .iter()
                .map(|(key, entry)| (key.to_string(), *entry))
                .collect(),
        };

        let mut buffer = Vec::new();
        ciborium::into_writer(&file, &mut buffer).map_err(|e| IndexError::Encode(e.to_string()))?;

        crate::io::write_atomic(&self.path, &buffer).map_err(|source| IndexError::Io {
            path: self.path.clone(),
            source,
        })?;

        state.dirty = false;
        tracing::debug!(path = %self.path, entries = file.entries.len(), "persisted hashchain");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Hashchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hashchain")
            .field("path", &self.path)
            .field("durability", &self.durability)
            .field("entries", &self.len())
            .finish()
    }
}

fn read_entries(path: &Utf8Path) -> Result<Option<BTreeMap<Key, Entry>>, String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.to_string()),
    };

    let file: IndexFile = ciborium::from_reader(bytes.as_slice()).map_err(|e| e.to_string())?;

    if file.version != INDEX_VERSION {
        return Err(format!("unsupported version {}", file.version));
    }

    Ok(Some(
        file.entries
            .into_iter()
            .map(|(key, entry)| (Key::from(key), entry))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::Hash32;

    fn dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, path)
    }

    fn entry(seed: &str) -> Entry {
        let hash = Hash32::hash(seed);
        Entry {
            fingerprint: Fingerprint(hash),
            artifact: ArtifactId(hash),
        }
    }

    #[test]
    fn missing_file_is_empty_index() {
        let (_guard, dir) = dir();
        let index = Hashchain::load(&dir, Durability::OnFinish);
        assert!(index.is_empty());
        assert_eq!(index.lookup("a"), None);
    }

    #[test]
    fn update_is_deferred_until_persist() {
        let (_guard, dir) = dir();
        let index = Hashchain::load(&dir, Durability::OnFinish);

        index.update("a".into(), entry("a")).unwrap();
        assert_eq!(index.lookup("a"), Some(entry("a")));
        assert!(!dir.join(INDEX_FILE).exists());

        index.persist().unwrap();
        let reloaded = Hashchain::load(&dir, Durability::OnFinish);
        assert_eq!(reloaded.lookup("a"), Some(entry("a")));
    }

    #[test]
    fn every_update_persists_immediately() {
        let (_guard, dir) = dir();
        let index = Hashchain::load(&dir, Durability::EveryUpdate);

        index.update("a".into(), entry("a")).unwrap();
        let reloaded = Hashchain::load(&dir, Durability::OnFinish);
        assert_eq!(reloaded.lookup("a"), Some(entry("a")));
    }

    #[test]
    fn clean_index_is_not_rewritten() {
        let (_guard, dir) = dir();
        let index = Hashchain::load(&dir, Durability::OnFinish);
        index.persist().unwrap();
        assert!(!dir.join(INDEX_FILE).exists());
    }

    #[test]
    fn vanished_file_is_rewritten() {
        let (_guard, dir) = dir();
        let index = Hashchain::load(&dir, Durability::OnFinish);
        index.update("a".into(), entry("a")).unwrap();
        index.persist().unwrap();

        fs::remove_file(dir.join(INDEX_FILE)).unwrap();
        index.persist().unwrap();
        assert_eq!(
            Hashchain::load(&dir, Durability::OnFinish).lookup("a"),
            Some(entry("a"))
        );
    }

    #[test]
    fn corrupt_file_is_empty_index() {
        let (_guard, dir) = dir();
        fs::write(dir.join(INDEX_FILE), b"definitely not cbor \xff\xff").unwrap();

        let index = Hashchain::load(&dir, Durability::OnFinish);
        assert!(index.is_empty());

        index.update("a".into(), entry("a")).unwrap();
        index.persist().unwrap();
        assert_eq!(
            Hashchain::load(&dir, Durability::OnFinish).lookup("a"),
            Some(entry("a"))
        );
    }

    #[test]
    fn foreign_version_is_empty_index() {
        let (_guard, dir) = dir();
        let file = IndexFile {
            version: INDEX_VERSION + 1,
            entries: BTreeMap::from([("a".to_string(), entry("a"))]),
        };
        let mut buffer = Vec::new();
        ciborium::into_writer(&file, &mut buffer).unwrap();
        fs::write(dir.join(INDEX_FILE), buffer).unwrap();

        assert!(Hashchain::load(&dir, Durability::OnFinish).is_empty());
    }

    #[test]
    fn concurrent_updates_all_land() {
        let (_guard, dir) = dir();
        let index = Arc::new(Hashchain::load(&dir, Durability::OnFinish));

        std::thread::scope(|s| {
            for t in 0..8 {
                let index = index.clone();
                s.spawn(move || {
                    for i in 0..50 {
                        let key = format!("k{t}-{i}");
                        index.update(key.as_str().into(), entry(&key)).unwrap();
                    }
                });
            }
        });

        index.persist().unwrap();
        let reloaded = Hashchain::load(&dir, Durability::OnFinish);
        assert_eq!(reloaded.len(), 400);
        assert_eq!(reloaded.lookup("k7-49"), Some(entry("k7-49")));
    }
}
