//! Rewrites a task graph into load and compute-store nodes.
//!
//! Every key of the input graph is kept. A node whose fresh fingerprint
//! matches its index entry, and whose artifact is still present, becomes a
//! load node without dependencies, which is what lets the executor skip the
//! whole subtree below a hit. Every other node becomes a compute-store node
//! with its original arguments.

use std::collections::BTreeMap;
use std::sync::Arc;

use console::style;

use crate::core::Key;
use crate::error::OptimizeError;
use crate::fingerprint::{Fingerprint, Fingerprints, fingerprint};
use crate::graph::{Graph, Node};
use crate::hashchain::Hashchain;
use crate::store::{ArtifactId, ArtifactStore};
use crate::wrapper::{self, Body};

/// Outcome for a single key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Cache hit, the node loads this artifact.
    Load { artifact: ArtifactId },
    /// Cache miss, the node recomputes and stores under this fingerprint.
    ComputeStore { fingerprint: Fingerprint },
}

impl Decision {
    pub fn is_hit(&self) -> bool {
        matches!(self, Decision::Load { .. })
    }
}

/// A rewritten graph together with the decisions that shaped it.
#[derive(Debug)]
pub struct Optimized {
    pub graph: Graph,
    pub decisions: BTreeMap<Key, Decision>,
    pub fingerprints: Fingerprints,
}

impl Optimized {
    pub fn hits(&self) -> impl Iterator<Item = &Key> {
        self.decisions
            .iter()
            .filter(|(_, decision)| decision.is_hit())
            .map(|(key, _)| key)
    }

    pub fn misses(&self) -> impl Iterator<Item = &Key> {
        self.decisions
            .iter()
            .filter(|(_, decision)| !decision.is_hit())
            .map(|(key, _)| key)
    }

    pub fn decision(&self, key: &str) -> Option<Decision> {
        self.decisions.get(key).copied()
    }
}

pub fn optimize(
    graph: &Graph,
    index: &Arc<Hashchain>,
    store: &ArtifactStore,
    verbose: bool,
) -> Result<Optimized, OptimizeError> {
    let span = tracing::info_span!("optimize", nodes = graph.len());
    let _enter = span.enter();

    let fingerprints = fingerprint(graph)?;

    let mut rewritten = Graph::new();
    let mut decisions = BTreeMap::new();

    for (key, node) in graph.iter() {
        let fingerprint = fingerprints[key];
        let decision = decide(key, fingerprint, index, store);

        if verbose {
            let word = if decision.is_hit() {
                style("hit").green()
            } else {
                style("miss").yellow()
            };
            tracing::info!(%key, %fingerprint, "{word}");
        } else {
            tracing::debug!(%key, %fingerprint, hit = decision.is_hit());
        }

        let node = match decision {
            Decision::Load { artifact } => Node::Call {
                func: wrapper::load(store, key.clone(), artifact),
                args: Vec::new(),
            },
            Decision::ComputeStore { fingerprint } => match node {
                Node::Literal(value) => Node::Call {
                    func: wrapper::compute_store(
                        store,
                        index,
                        key.clone(),
                        fingerprint,
                        Body::Literal(value.clone()),
                    ),
                    args: Vec::new(),
                },
                Node::Call { func, args } => Node::Call {
                    func: wrapper::compute_store(
                        store,
                        index,
                        key.clone(),
                        fingerprint,
                        Body::Call(func.clone()),
                    ),
                    args: args.clone(),
                },
            },
        };

        rewritten.insert(key.clone(), node);
        decisions.insert(key.clone(), decision);
    }

    if verbose {
        let hits = decisions.values().filter(|d| d.is_hit()).count();
        tracing::info!(
            hits,
            misses = decisions.len() - hits,
            "optimized {} nodes",
            decisions.len()
        );
    }

    Ok(Optimized {
        graph: rewritten,
        decisions,
        fingerprints,
    })
}

fn decide(
    key: &Key,
    fingerprint: Fingerprint,
    index: &Hashchain,
    store: &ArtifactStore,
) -> Decision {
    match index.lookup(key) {
        Some(entry) if entry.fingerprint == fingerprint => {
            if store.exists(entry.artifact) {
                return Decision::Load {
                    artifact: entry.artifact,
                };
            }
            tracing::warn!(%key, artifact = %entry.artifact, "artifact missing, recomputing");
        }
        Some(_) => tracing::trace!(%key, "fingerprint changed"),
        None => tracing::trace!(%key, "no index entry"),
    }

    Decision::ComputeStore { fingerprint }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::Value;
    use crate::error::{ExecError, FingerprintError, StoreError};
    use crate::executor::execute;
    use crate::graph::{Arg, Func};
    use crate::hashchain::Durability;
    use crate::wrapper::{COMPUTE_STORE_WRAPPER, LOAD_WRAPPER};

    struct Cache {
        _guard: tempfile::TempDir,
        root: Utf8PathBuf,
        store: ArtifactStore,
    }

    impl Cache {
        fn new() -> Self {
            let guard = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(guard.path().to_path_buf()).unwrap();
            Self {
                _guard: guard,
                store: ArtifactStore::new(root.clone()),
                root,
            }
        }

        /// Optimize, execute every key, persist: one full session.
        /// Returns the value of `target`.
        fn run(&self, graph: &Graph, target: &str) -> (Optimized, Value) {
            let index = Arc::new(Hashchain::load(&self.root, Durability::OnFinish));
            let optimized = optimize(graph, &index, &self.store, false).unwrap();

            let keys: Vec<Key> = graph.keys().cloned().collect();
            let values = execute(&optimized.graph, &keys).unwrap();
            index.persist().unwrap();

            let position = keys.iter().position(|key| &**key == target).unwrap();
            (optimized, values[position].clone())
        }
    }

    fn inc(version: &str) -> Func {
        Func::new("inc", format!("inc-{version}"), |args| {
            Ok(Value::Int(args.iter().filter_map(Value::as_int).sum::<i64>() + 1))
        })
    }

    /// x = 1, y = inc(x), z = inc(y), w = 5
    fn chain() -> Graph {
        let mut graph = Graph::new();
        graph
            .literal("x", 1)
            .call("y", inc("v1"), [Arg::key("x")])
            .call("z", inc("v1"), [Arg::key("y")])
            .literal("w", 5);
        graph
    }

    fn func_name(optimized: &Optimized, key: &str) -> String {
        optimized.graph.get(key).unwrap().func().unwrap().name().to_string()
    }

    #[test]
    fn first_run_computes_everything() {
        let cache = Cache::new();
        let (optimized, value) = cache.run(&chain(), "z");

        assert_eq!(value, Value::Int(3));
        assert_eq!(optimized.hits().count(), 0);
        for key in ["w", "x", "y", "z"] {
            assert_eq!(func_name(&optimized, key), COMPUTE_STORE_WRAPPER);
            assert_eq!(optimized.graph.dependencies(key), chain().dependencies(key));
        }
    }

    #[test]
    fn second_run_loads_everything() {
        let cache = Cache::new();
        cache.run(&chain(), "z");
        let (optimized, value) = cache.run(&chain(), "z");

        assert_eq!(value, Value::Int(3));
        assert_eq!(optimized.misses().count(), 0);
        for key in ["w", "x", "y", "z"] {
            assert_eq!(func_name(&optimized, key), LOAD_WRAPPER);
            assert!(optimized.graph.dependencies(key).is_empty());
        }
    }

    #[test]
    fn literal_change_invalidates_dependents() {
        let cache = Cache::new();
        cache.run(&chain(), "z");

        let mut graph = chain();
        graph.literal("x", 10);
        let (optimized, value) = cache.run(&graph, "z");

        assert_eq!(value, Value::Int(12));
        let misses: Vec<_> = optimized.misses().map(|k| k.to_string()).collect();
        assert_eq!(misses, ["x", "y", "z"]);
        assert!(optimized.graph.dependencies("x").is_empty());
        assert_eq!(optimized.graph.dependencies("y"), [Key::from("x")]);
    }

    #[test]
    fn function_change_invalidates_dependents() {
        let cache = Cache::new();
        cache.run(&chain(), "z");

        let mut graph = chain();
        graph.call("y", inc("v2"), [Arg::key("x")]);
        let (optimized, _) = cache.run(&graph, "z");

        let misses: Vec<_> = optimized.misses().map(|k| k.to_string()).collect();
        assert_eq!(misses, ["y", "z"]);
    }

    #[test]
    fn missing_artifact_demotes_hit() {
        let cache = Cache::new();
        let (first, _) = cache.run(&chain(), "z");

        let artifact = ArtifactId::from(first.fingerprints["y"]);
        fs::remove_file(cache.store.path(artifact)).unwrap();

        let (optimized, value) = cache.run(&chain(), "y");
        assert_eq!(value, Value::Int(2));
        let misses: Vec<_> = optimized.misses().map(|k| k.to_string()).collect();
        assert_eq!(misses, ["y"]);
        assert!(cache.store.exists(artifact));
    }

    #[test]
    fn failed_store_write_reaches_caller_and_skips_index() {
        let cache = Cache::new();
        let index = Arc::new(Hashchain::load(&cache.root, Durability::OnFinish));
        let optimized = optimize(&chain(), &index, &cache.store, false).unwrap();

        fs::remove_dir_all(&cache.root).unwrap();

        match execute(&optimized.graph, &[Key::from("z")]) {
            Err(ExecError::Task { source, .. }) => assert!(matches!(
                source.downcast_ref::<StoreError>(),
                Some(StoreError::Io { .. })
            )),
            other => panic!("unexpected {other:?}"),
        }
        for key in ["x", "y", "z"] {
            assert_eq!(index.lookup(key), None, "{key}");
        }
    }

    #[test]
    fn hit_requires_index_entry() {
        let cache = Cache::new();
        cache.run(&chain(), "z");
        fs::remove_file(cache.root.join(crate::hashchain::INDEX_FILE)).unwrap();

        let (optimized, _) = cache.run(&chain(), "z");
        assert_eq!(optimized.hits().count(), 0);
    }

    #[test]
    fn fingerprint_errors_propagate() {
        let cache = Cache::new();
        let index = Arc::new(Hashchain::load(&cache.root, Durability::OnFinish));

        let mut graph = chain();
        graph.call("x", inc("v1"), [Arg::key("z")]);

        let err = optimize(&graph, &index, &cache.store, false).unwrap_err();
        assert!(matches!(
            err,
            OptimizeError::Fingerprint(FingerprintError::CycleDetected(_))
        ));
    }
}
