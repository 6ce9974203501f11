use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Key;
use crate::store::ArtifactId;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Cycle detected in task graph at '{0}'")]
    CycleDetected(Key),

    #[error("Node '{key}' cannot be hashed deterministically: {reason}")]
    UnhashableInput { key: Key, reason: String },

    #[error("Node '{key}' depends on unknown key '{dependency}'")]
    UnknownDependency { key: Key, dependency: Key },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact {0} is missing from the store")]
    ArtifactMissing(ArtifactId),

    #[error("Store I/O failure at {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't encode artifact {0}:\n{1}")]
    Encode(ArtifactId, String),

    #[error("Couldn't decode artifact {0}:\n{1}")]
    Decode(ArtifactId, String),
}

/// Failures while writing the hashchain index. A corrupt index on disk is
/// never an error: it is recovered as an empty index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Hashchain I/O failure at {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't encode hashchain:\n{0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("Requested key '{0}' is not in the task graph")]
    UnknownKey(Key),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Task '{key}':\n{source}")]
    Task {
        key: Key,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task '{key}' panicked: {message}")]
    Panic { key: Key, message: String },

    #[error("Node '{0}' is not in the task graph")]
    UnknownKey(Key),

    #[error(transparent)]
    Graph(#[from] FingerprintError),
}

#[derive(Debug, Error)]
pub enum GraphchainError {
    #[error("Couldn't prepare cache directory {path}:\n{source}")]
    CacheDirectory {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error while optimizing the task graph.\n{0}")]
    Optimize(#[from] OptimizeError),

    #[error("Error while executing the task graph.\n{0}")]
    Exec(#[from] ExecError),

    #[error("Error while persisting the hashchain.\n{0}")]
    Index(#[from] IndexError),
}
