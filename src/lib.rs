#![forbid(unsafe_code)]
//! Incremental computation cache for task graphs.
//!
//! `graphchain` takes a task graph, a DAG of literal values and function
//! calls, and rewrites it so that every node either loads its previously
//! computed result from a content-addressed store, or runs the original
//! computation and stores the result. Running an unchanged graph a second
//! time computes nothing; changing a function or a literal recomputes exactly
//! that node and everything downstream of it.
//!
//! ## How it works
//!
//! * Every node gets a [`Fingerprint`], a BLAKE3 digest of its function
//!   identity, its literal arguments and the fingerprints of its
//!   dependencies. Upstream changes ripple into downstream fingerprints on
//!   their own; there is no invalidation pass.
//! * The [`Hashchain`] index remembers, per key, the fingerprint and artifact
//!   of the last stored result.
//! * The [`ArtifactStore`] keeps one immutable CBOR blob per fingerprint.
//! * [`optimize`] compares fresh fingerprints against the index and emits a
//!   load node (no dependencies) for every hit and a compute-store node for
//!   every miss.
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphchain::{Arg, Config, Func, Graph, Session, Value};
//!
//! let inc = Func::new("inc", "inc-v1", |args| {
//!     Ok(Value::Int(args[0].as_int().unwrap_or_default() + 1))
//! });
//!
//! let mut graph = Graph::new();
//! graph
//!     .literal("x", 41)
//!     .call("y", inc, [Arg::key("x")]);
//!
//! let session = Session::open(Config::new(".cache/graphchain").keys(["y"]))?;
//! let values = session.run(&graph)?;
//! assert_eq!(values, [Value::Int(42)]);
//! # Ok::<(), graphchain::GraphchainError>(())
//! ```

mod core;
mod error;
pub mod executor;
pub mod fingerprint;
pub mod graph;
pub mod hashchain;
mod io;
#[cfg(feature = "logging")]
pub mod logging;
pub mod optimizer;
pub mod store;
mod wrapper;

use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

pub use crate::core::{Key, Value};
pub use crate::error::*;
pub use crate::executor::execute;
pub use crate::fingerprint::{Fingerprint, Fingerprints, fingerprint};
pub use crate::graph::{Arg, Func, Graph, Node};
pub use crate::hashchain::{Durability, Entry, Hashchain, INDEX_FILE};
pub use crate::optimizer::{Decision, Optimized, optimize};
pub use crate::store::{ARTIFACT_EXTENSION, ArtifactId, ArtifactStore};
pub use crate::wrapper::{COMPUTE_STORE_WRAPPER, LOAD_WRAPPER};

/// Settings of a cache session.
#[derive(Debug, Clone)]
pub struct Config {
    keys: Vec<Key>,
    cache_directory: Utf8PathBuf,
    verbose: bool,
    durability: Durability,
}

impl Config {
    pub fn new(cache_directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            keys: Vec::new(),
            cache_directory: cache_directory.into(),
            verbose: false,
            durability: Durability::default(),
        }
    }

    /// Result keys the session computes in [`Session::run`]. Each one must
    /// exist in the optimized graph.
    pub fn keys<K>(mut self, keys: impl IntoIterator<Item = K>) -> Self
    where
        K: Into<Key>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Log every hit/miss decision at `info` instead of `debug`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn get_keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn get_cache_directory(&self) -> &Utf8Path {
        &self.cache_directory
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// One cache directory, opened for a run.
///
/// The session owns the [`Hashchain`] handle for its directory. Wrappers in
/// graphs it produced hold clones of that handle, so the index stays
/// consistent however the rewritten graph is executed; [`Session::finish`]
/// writes it back.
pub struct Session {
    config: Config,
    index: Arc<Hashchain>,
    store: ArtifactStore,
}

impl Session {
    pub fn open(config: Config) -> Result<Self, GraphchainError> {
        let dir = config.cache_directory.clone();
        fs::create_dir_all(&dir).map_err(|source| GraphchainError::CacheDirectory {
            path: dir.clone(),
            source,
        })?;

        let index = Arc::new(Hashchain::load(&dir, config.durability));
        tracing::debug!(%dir, entries = index.len(), "opened cache session");

        Ok(Self {
            config,
            index,
            store: ArtifactStore::new(dir),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Hashchain {
        &self.index
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Rewrites `graph` against this session's cache. Fails before anything
    /// runs if the graph cannot be fingerprinted.
    pub fn optimize(&self, graph: &Graph) -> Result<Optimized, OptimizeError> {
        if let Some(missing) = self.config.keys.iter().find(|key| !graph.contains(key)) {
            return Err(OptimizeError::UnknownKey(missing.clone()));
        }

        optimize(graph, &self.index, &self.store, self.config.verbose)
    }

    /// Optimizes `graph`, evaluates the configured keys with the bundled
    /// executor and persists the index. The index is persisted even when
    /// execution fails, so nodes that did finish stay cached. When both
    /// fail, the execution error is returned.
    pub fn run(&self, graph: &Graph) -> Result<Vec<Value>, GraphchainError> {
        let optimized = self.optimize(graph)?;
        let result = execute(&optimized.graph, &self.config.keys);
        let persisted = self.finish();

        let values = match result {
            Ok(values) => values,
            Err(err) => {
                if let Err(index) = persisted {
                    tracing::error!(%index, "couldn't persist hashchain after a failed run");
                }
                return Err(err.into());
            }
        };

        persisted?;
        Ok(values)
    }

    /// Persists the index. Safe to call repeatedly.
    pub fn finish(&self) -> Result<(), IndexError> {
        self.index.persist()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, path)
    }

    fn graph(x: i64) -> Graph {
        let double = Func::new("double", "double-v1", |args| {
            Ok(Value::Int(args[0].as_int().unwrap_or_default() * 2))
        });
        let mut graph = Graph::new();
        graph.literal("x", x).call("y", double, [Arg::key("x")]);
        graph
    }

    #[test]
    fn open_creates_missing_directory() {
        let (_guard, root) = root();
        let dir = root.join("nested").join("cache");

        let session = Session::open(Config::new(&dir)).unwrap();
        assert!(dir.is_dir());
        assert!(session.index().is_empty());
    }

    #[test]
    fn unknown_key_fails_before_running() {
        let (_guard, root) = root();
        let session = Session::open(Config::new(&root).keys(["nope"])).unwrap();

        assert!(matches!(
            session.optimize(&graph(1)),
            Err(OptimizeError::UnknownKey(_))
        ));
    }

    #[test]
    fn run_persists_and_reuses() {
        let (_guard, root) = root();
        let config = Config::new(&root).keys(["y"]);

        let first = Session::open(config.clone()).unwrap();
        assert_eq!(first.run(&graph(21)).unwrap(), [Value::Int(42)]);
        assert!(root.join(INDEX_FILE).is_file());

        let second = Session::open(config).unwrap();
        let optimized = second.optimize(&graph(21)).unwrap();
        assert_eq!(optimized.misses().count(), 0);
        assert_eq!(second.run(&graph(21)).unwrap(), [Value::Int(42)]);
    }

    #[test]
    fn failed_run_keeps_finished_nodes() {
        let (_guard, root) = root();
        let failing = Func::new("fail", "fail", |_| anyhow::bail!("broken"));

        let mut broken = graph(3);
        broken.call("z", failing, [Arg::key("y")]);

        let session = Session::open(Config::new(&root).keys(["z"])).unwrap();
        assert!(matches!(
            session.run(&broken),
            Err(GraphchainError::Exec(ExecError::Task { .. }))
        ));

        let reopened = Session::open(Config::new(&root).keys(["y"])).unwrap();
        let optimized = reopened.optimize(&broken).unwrap();
        let hits: Vec<_> = optimized.hits().map(|k| k.to_string()).collect();
        assert_eq!(hits, ["x", "y"]);
    }

    #[test]
    fn failed_run_reports_task_error_over_persist_error() {
        let (_guard, root) = root();
        let doomed = root.join("cache");

        // Runs after `x` was stored, so the index is dirty, then takes the
        // directory away from under the final persist.
        let dir = doomed.clone();
        let vandal = Func::new("vandal", "vandal", move |_| {
            fs::remove_dir_all(&dir)?;
            anyhow::bail!("directory removed")
        });

        let mut broken = Graph::new();
        broken.literal("x", 1).call("y", vandal, [Arg::key("x")]);

        let session = Session::open(Config::new(&doomed).keys(["y"])).unwrap();
        match session.run(&broken) {
            Err(GraphchainError::Exec(ExecError::Task { key, .. })) => assert_eq!(&*key, "y"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(session.finish(), Err(IndexError::Io { .. })));
    }

    #[test]
    fn every_update_survives_without_finish() {
        let (_guard, root) = root();
        let config = Config::new(&root)
            .keys(["y"])
            .durability(Durability::EveryUpdate);

        let session = Session::open(config).unwrap();
        let optimized = session.optimize(&graph(5)).unwrap();
        execute(&optimized.graph, &[Key::from("y")]).unwrap();
        drop(session);

        let reopened = Session::open(Config::new(&root)).unwrap();
        assert_eq!(reopened.index().len(), 2);
    }
}
