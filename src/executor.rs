//! A small parallel executor for task graphs.
//!
//! The cache only rewrites graphs; running them belongs to whatever engine
//! the caller uses. This executor exists so a rewritten graph can be run end
//! to end without one. It computes exactly the transitive dependencies of
//! the requested keys.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError, channel};

use indicatif::ProgressStyle;
use rayon::Yield;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Key, Value};
use crate::error::ExecError;
use crate::fingerprint::topological_order;
use crate::graph::{Arg, Graph, Node};

/// Evaluates `keys` in `graph`, returning their values in request order.
///
/// The algorithm works as follows:
/// 1. The set of nodes needed for `keys` is collected by walking
///    dependency edges.
/// 2. Every needed node without pending dependencies is spawned on the
///    rayon pool.
/// 3. The calling thread waits on a channel for results. Each result
///    decrements the dependency count of its dependents, and a dependent
///    whose count reaches zero is spawned immediately.
/// 4. The first failure aborts the run; nodes still in flight finish but
///    their results are discarded.
pub fn execute(graph: &Graph, keys: &[Key]) -> Result<Vec<Value>, ExecError> {
    // A cycle would leave dependency counts above zero forever.
    topological_order(graph)?;

    let needed = collect_needed(graph, keys)?;

    // Dependents of every needed node. Repeated arguments are kept on both
    // sides, so counts and decrements stay balanced.
    let mut dependents: HashMap<&Key, Vec<&Key>> = HashMap::new();
    let mut dependency_counts: HashMap<&Key, usize> = HashMap::new();

    for &key in &needed {
        let node = graph_node(graph, key)?;
        let mut count = 0;
        for dependency in node.dependencies() {
            dependents.entry(dependency).or_default().push(key);
            count += 1;
        }
        dependency_counts.insert(key, count);
    }

    let total = needed.len();
    let mut results: HashMap<Key, Arc<Value>> = HashMap::with_capacity(total);

    let root_span = tracing::span!(Level::INFO, "execute", nodes = total);
    root_span.pb_set_length(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        root_span.pb_set_style(&style.progress_chars("=>-"));
    }
    let _enter = root_span.enter();

    rayon::scope(|s| -> Result<(), ExecError> {
        let (sender, receiver) = channel::<(Key, Result<Value, ExecError>)>();

        let spawn = |results: &HashMap<Key, Arc<Value>>, key: &Key| -> Result<(), ExecError> {
            let node = graph_node(graph, key)?;
            let args = resolve(node, results)?;
            let sender = sender.clone();
            let key = key.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::DEBUG, "node", key = %key);
                let _enter = span.enter();

                let output = run_node(&key, node, &args);
                // The receiver is gone only after the run already failed.
                let _ = sender.send((key, output));
            });

            Ok(())
        };

        for (&key, &count) in &dependency_counts {
            if count == 0 {
                spawn(&results, key)?;
            }
        }

        let mut completed = 0;
        while completed < total {
            let Some((key, output)) = wait(&receiver) else {
                break;
            };

            results.insert(key.clone(), Arc::new(output?));
            completed += 1;
            root_span.pb_inc(1);

            if let Some(waiting) = dependents.get(&key) {
                for &dependent in waiting {
                    if let Some(count) = dependency_counts.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            spawn(&results, dependent)?;
                        }
                    }
                }
            }
        }

        Ok(())
    })?;

    keys.iter()
        .map(|key| {
            results
                .get(key)
                .map(|value| Value::clone(value))
                .ok_or_else(|| ExecError::UnknownKey(key.clone()))
        })
        .collect()
}

/// Blocks until a result arrives. The caller runs on a pool thread, so it
/// keeps executing pool jobs while it waits; a single-threaded pool would
/// deadlock otherwise.
fn wait<T>(receiver: &Receiver<T>) -> Option<T> {
    loop {
        match receiver.try_recv() {
            Ok(message) => return Some(message),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {
                if !matches!(rayon::yield_now(), Some(Yield::Executed)) {
                    std::thread::yield_now();
                }
            }
        }
    }
}

fn graph_node<'g>(graph: &'g Graph, key: &Key) -> Result<&'g Node, ExecError> {
    graph.get(key).ok_or_else(|| ExecError::UnknownKey(key.clone()))
}

fn collect_needed<'g>(graph: &'g Graph, keys: &[Key]) -> Result<HashSet<&'g Key>, ExecError> {
    let mut needed = HashSet::new();
    let mut stack = Vec::new();

    for key in keys {
        let (key, _) = graph
            .entry(key)
            .ok_or_else(|| ExecError::UnknownKey(key.clone()))?;
        stack.push(key);
    }

    while let Some(key) = stack.pop() {
        if !needed.insert(key) {
            continue;
        }

        for dependency in graph_node(graph, key)?.dependencies() {
            if !needed.contains(dependency) {
                stack.push(dependency);
            }
        }
    }

    Ok(needed)
}

fn resolve(node: &Node, results: &HashMap<Key, Arc<Value>>) -> Result<Vec<Value>, ExecError> {
    node.args()
        .iter()
        .map(|arg| match arg {
            Arg::Value(value) => Ok(value.clone()),
            Arg::Key(key) => results
                .get(key)
                .map(|value| Value::clone(value))
                .ok_or_else(|| ExecError::UnknownKey(key.clone())),
        })
        .collect()
}

fn run_node(key: &Key, node: &Node, args: &[Value]) -> Result<Value, ExecError> {
    let func = match node {
        Node::Literal(value) => return Ok(value.clone()),
        Node::Call { func, .. } => func,
    };

    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func.call(args))) {
        Ok(result) => result.map_err(|source| ExecError::Task {
            key: key.clone(),
            source,
        }),
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };

            Err(ExecError::Panic {
                key: key.clone(),
                message,
            })
        }
    }
}
