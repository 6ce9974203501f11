//! Deterministic per-node fingerprints.
//!
//! A fingerprint is computed bottom-up: literals hash their canonical CBOR
//! encoding, calls hash the function identity, their literal arguments and
//! the fingerprints of the nodes they reference. Changing anything upstream
//! therefore changes every downstream fingerprint, and nothing else.
//!
//! Keys never enter the digest. Two nodes with the same definition over
//! dependencies with the same fingerprints share one fingerprint, and with
//! it one artifact.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32, Key, Value};
use crate::error::FingerprintError;
use crate::graph::{Arg, Graph, Node};

const TAG_LITERAL: u8 = 0x00;
const TAG_CALL: u8 = 0x01;
const TAG_ARG_VALUE: u8 = 0x02;
const TAG_ARG_KEY: u8 = 0x03;

/// Digest of a node's definition and everything it transitively depends on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub(crate) Hash32);

impl Fingerprint {
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.0.to_hex())
    }
}

pub type Fingerprints = BTreeMap<Key, Fingerprint>;

/// Fingerprints every node of `graph` in a single dependency-first pass.
pub fn fingerprint(graph: &Graph) -> Result<Fingerprints, FingerprintError> {
    let mut prints = Fingerprints::new();

    for key in topological_order(graph)? {
        if let Some(node) = graph.get(&key) {
            let print = fingerprint_node(&key, node, &prints)?;
            prints.insert(key, print);
        }
    }

    Ok(prints)
}

/// Orders keys so each one comes after all of its dependencies.
pub(crate) fn topological_order(graph: &Graph) -> Result<Vec<Key>, FingerprintError> {
    let mut dag = DiGraph::<Key, ()>::with_capacity(graph.len(), graph.len());
    let mut indices: HashMap<&str, NodeIndex> = HashMap::with_capacity(graph.len());

    for key in graph.keys() {
        indices.insert(key, dag.add_node(key.clone()));
    }

    for (key, node) in graph.iter() {
        let target = indices[key.as_ref()];

        for dependency in node.dependencies() {
            let source = *indices.get(dependency.as_ref()).ok_or_else(|| {
                FingerprintError::UnknownDependency {
                    key: key.clone(),
                    dependency: dependency.clone(),
                }
            })?;

            dag.add_edge(source, target, ());
        }
    }

    let order = toposort(&dag, None)
        .map_err(|cycle| FingerprintError::CycleDetected(dag[cycle.node_id()].clone()))?;

    Ok(order.into_iter().map(|index| dag[index].clone()).collect())
}

fn encode(key: &Key, value: &Value) -> Result<Vec<u8>, FingerprintError> {
    if let Some(reason) = value.find_unhashable() {
        return Err(FingerprintError::UnhashableInput {
            key: key.clone(),
            reason,
        });
    }

    value
        .to_cbor()
        .map_err(|e| FingerprintError::UnhashableInput {
            key: key.clone(),
            reason: e.to_string(),
        })
}

fn fingerprint_node(
    key: &Key,
    node: &Node,
    prints: &Fingerprints,
) -> Result<Fingerprint, FingerprintError> {
    let mut hasher = Blake3Hasher::default();

    match node {
        Node::Literal(value) => {
            hasher.update(&[TAG_LITERAL]).update(&encode(key, value)?);
        }
        Node::Call { func, args } => {
            let identity = func
                .identity()
                .ok_or_else(|| FingerprintError::UnhashableInput {
                    key: key.clone(),
                    reason: format!("function '{}' has no stable identity", func.name()),
                })?;

            hasher
                .update(&[TAG_CALL])
                .update(identity.as_bytes())
                .update(&(args.len() as u64).to_le_bytes());

            for arg in args {
                match arg {
                    Arg::Value(value) => {
                        let bytes = encode(key, value)?;
                        hasher
                            .update(&[TAG_ARG_VALUE])
                            .update(&(bytes.len() as u64).to_le_bytes())
                            .update(&bytes);
                    }
                    Arg::Key(dependency) => {
                        let print = prints.get(dependency).ok_or_else(|| {
                            FingerprintError::UnknownDependency {
                                key: key.clone(),
                                dependency: dependency.clone(),
                            }
                        })?;
                        hasher.update(&[TAG_ARG_KEY]).update(print.0.as_bytes());
                    }
                }
            }
        }
    }

    Ok(Fingerprint(hasher.into()))
}
