//! Content-addressed storage for computed node results.
//!
//! Every artifact is a single CBOR blob named `<hex id>.bin` inside the
//! cache directory, so `exists` and `read` need nothing but the id. Blobs
//! are written through [`crate::io::write_atomic`]; a concurrent reader of
//! the same id sees either no blob or the complete one.

use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, Value};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

/// File extension of artifact blobs.
pub const ARTIFACT_EXTENSION: &str = "bin";

/// Identifier of a stored artifact. Equal to the fingerprint of the node
/// that produced it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub(crate) Hash32);

impl ArtifactId {
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }

    /// Name of the blob holding this artifact.
    pub fn file_name(self) -> String {
        format!("{}.{ARTIFACT_EXTENSION}", self.0.to_hex())
    }

    fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(ARTIFACT_EXTENSION)?.strip_suffix('.')?;
        Hash32::from_hex(stem).map(ArtifactId)
    }
}

impl From<Fingerprint> for ArtifactId {
    fn from(fingerprint: Fingerprint) -> Self {
        ArtifactId(fingerprint.0)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

impl fmt::Debug for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactId({})", self.0.to_hex())
    }
}

/// Handle to the artifact blobs of one cache directory.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path(&self, id: ArtifactId) -> Utf8PathBuf {
        self.root.join(id.file_name())
    }

    pub fn exists(&self, id: ArtifactId) -> bool {
        self.path(id).is_file()
    }

    pub fn read(&self, id: ArtifactId) -> Result<Value, StoreError> {
        let path = self.path(id);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ArtifactMissing(id));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        ciborium::from_reader(bytes.as_slice()).map_err(|e| StoreError::Decode(id, e.to_string()))
    }

    /// Stores `value` under `id`. Rewriting an existing id replaces the blob
    /// atomically; since ids are fingerprints the content is the same.
    pub fn write(&self, id: ArtifactId, value: &Value) -> Result<(), StoreError> {
        let bytes = value
            .to_cbor()
            .map_err(|e| StoreError::Encode(id, e.to_string()))?;

        let path = self.path(id);
        crate::io::write_atomic(&path, &bytes).map_err(|source| StoreError::Io { path, source })?;

        tracing::trace!(artifact = %id, bytes = bytes.len(), "stored artifact");
        Ok(())
    }

    /// All artifact ids currently present, sorted.
    pub fn list(&self) -> Result<Vec<ArtifactId>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;

            if let Some(id) = entry.file_name().to_str().and_then(ArtifactId::from_file_name) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }
}
