//! The task graph consumed and produced by the cache.
//!
//! A [`Graph`] maps every [`Key`] to a [`Node`]. A node is either a literal
//! [`Value`] or a call of a [`Func`] over an ordered list of [`Arg`]s, where
//! each argument is explicitly tagged as a literal or as a reference to
//! another key. Dependency edges are exactly the [`Arg::Key`] arguments.
//!
//! ## Function identity
//!
//! The cache needs to know when a function *changed*. A function pointer or a
//! Rust type name is not stable across builds, so every [`Func`] carries an
//! identity digest computed from a definition string provided by the caller:
//! the function's source text, or an explicit version tag. Bumping the tag is
//! how a caller tells the cache that the behaviour changed.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{Hash32, Key, Value};

type Callback = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// A callable node body with a content-level identity.
#[derive(Clone)]
pub struct Func {
    name: Cow<'static, str>,
    identity: Option<Hash32>,
    callback: Callback,
}

impl Func {
    /// Creates a function whose identity is the digest of `definition`.
    ///
    /// The name is only used for diagnostics and never enters the
    /// fingerprint, so two functions with the same definition are the same
    /// function as far as the cache is concerned.
    pub fn new<F>(
        name: impl Into<Cow<'static, str>>,
        definition: impl AsRef<[u8]>,
        callback: F,
    ) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            identity: Some(Hash32::hash(definition)),
            callback: Arc::new(callback),
        }
    }

    /// Creates a function without a stable identity. Nodes calling it can be
    /// executed but not fingerprinted.
    pub fn opaque<F>(name: impl Into<Cow<'static, str>>, callback: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            identity: None,
            callback: Arc::new(callback),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn identity(&self) -> Option<Hash32> {
        self.identity
    }

    pub fn call(&self, args: &[Value]) -> anyhow::Result<Value> {
        (self.callback)(args)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity {
            Some(identity) => write!(f, "Func({}, {})", self.name, &identity.to_hex()[..12]),
            None => write!(f, "Func({}, opaque)", self.name),
        }
    }
}

/// A single argument of a call.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// A dependency edge: the result of the node under this key.
    Key(Key),
    /// An inline literal.
    Value(Value),
}

impl Arg {
    pub fn key(key: impl Into<Key>) -> Self {
        Arg::Key(key.into())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Arg::Value(value.into())
    }
}

#[derive(Clone, Debug)]
pub enum Node {
    Literal(Value),
    Call { func: Func, args: Vec<Arg> },
}

impl Node {
    /// Keys this node depends on, in argument order, duplicates included.
    pub fn dependencies(&self) -> impl Iterator<Item = &Key> {
        let args = match self {
            Node::Literal(_) => &[][..],
            Node::Call { args, .. } => args.as_slice(),
        };

        args.iter().filter_map(|arg| match arg {
            Arg::Key(key) => Some(key),
            Arg::Value(_) => None,
        })
    }

    pub fn func(&self) -> Option<&Func> {
        match self {
            Node::Literal(_) => None,
            Node::Call { func, .. } => Some(func),
        }
    }

    pub fn args(&self) -> &[Arg] {
        match self {
            Node::Literal(_) => &[],
            Node::Call { args, .. } => args,
        }
    }
}

/// A task graph: key to node, iterated in key order.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<Key, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node, returning the node previously stored under `key`.
    pub fn insert(&mut self, key: impl Into<Key>, node: Node) -> Option<Node> {
        self.nodes.insert(key.into(), node)
    }

    pub fn literal(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> &mut Self {
        self.insert(key, Node::Literal(value.into()));
        self
    }

    pub fn call(
        &mut self,
        key: impl Into<Key>,
        func: Func,
        args: impl IntoIterator<Item = Arg>,
    ) -> &mut Self {
        self.insert(
            key,
            Node::Call {
                func,
                args: args.into_iter().collect(),
            },
        );
        self
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// The stored key and node for `key`.
    pub fn entry(&self, key: &str) -> Option<(&Key, &Node)> {
        self.nodes.get_key_value(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.nodes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Node)> {
        self.nodes.iter()
    }

    /// Dependency keys of the node under `key`; empty if the key is absent.
    pub fn dependencies(&self, key: &str) -> Vec<Key> {
        self.nodes
            .get(key)
            .map(|node| node.dependencies().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<(Key, Node)> for Graph {
    fn from_iter<T: IntoIterator<Item = (Key, Node)>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}
