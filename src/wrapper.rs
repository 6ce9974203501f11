//! Node bodies substituted into the rewritten graph.

use std::sync::Arc;

use crate::core::{Key, Value};
use crate::fingerprint::Fingerprint;
use crate::graph::Func;
use crate::hashchain::{Entry, Hashchain};
use crate::store::{ArtifactId, ArtifactStore};

/// Diagnostic name of load nodes.
pub const LOAD_WRAPPER: &str = "load_wrapper";
/// Diagnostic name of compute-store nodes.
pub const COMPUTE_STORE_WRAPPER: &str = "exec_store_wrapper";

/// What a compute-store node evaluates before storing.
pub(crate) enum Body {
    Literal(Value),
    Call(Func),
}

/// A zero-argument node returning the stored artifact.
pub(crate) fn load(store: &ArtifactStore, key: Key, artifact: ArtifactId) -> Func {
    let store = store.clone();

    Func::opaque(LOAD_WRAPPER, move |_| {
        let value = store.read(artifact)?;
        tracing::trace!(%key, %artifact, "loaded artifact");
        Ok(value)
    })
}

/// Evaluates `body`, stores the result under `fingerprint` and records it in
/// the index, in that order. The index never points at an artifact that was
/// not written.
pub(crate) fn compute_store(
    store: &ArtifactStore,
    index: &Arc<Hashchain>,
    key: Key,
    fingerprint: Fingerprint,
    body: Body,
) -> Func {
    let store = store.clone();
    let index = Arc::clone(index);

    Func::opaque(COMPUTE_STORE_WRAPPER, move |args| {
        let value = match &body {
            Body::Literal(value) => value.clone(),
            Body::Call(func) => func.call(args)?,
        };

        let artifact = ArtifactId::from(fingerprint);
        store.write(artifact, &value)?;
        index.update(
            key.clone(),
            Entry {
                fingerprint,
                artifact,
            },
        )?;

        tracing::trace!(%key, %artifact, "computed and stored");
        Ok(value)
    })
}
