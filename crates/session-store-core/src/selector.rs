//! Plain and memoized derived-value selectors.
//!
//! Memoization is a call-time cache-hit optimization, not a reactive graph:
//! every `select` evaluates dependencies top-down against the given state and
//! reuses the cached output only while each dependency's fresh output equals
//! (by value) the cached input from the previous call.

use std::sync::{Arc, Mutex};

use serde_json::Value;

/// A plain selector function over the full state.
pub type SelectFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// A memoized selector's compute function over its dependency outputs.
pub type ComputeFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// A derived-value function over store state.
#[derive(Clone)]
pub enum Selector {
    /// Evaluated on every call.
    Plain(SelectFn),
    /// Cached while dependency outputs are unchanged by value.
    Memoized(Arc<MemoSelector>),
}

/// Dependencies, compute function, and the single-slot cache.
pub struct MemoSelector {
    dependencies: Vec<Selector>,
    compute: ComputeFn,
    cache: Mutex<Option<MemoCache>>,
}

struct MemoCache {
    inputs: Vec<Value>,
    output: Value,
}

impl Selector {
    /// Create a plain selector from a closure.
    #[must_use]
    pub fn new<F>(select: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Plain(Arc::new(select))
    }

    /// Selector for a dot-separated path into the state, e.g.
    /// `"counter.count"`. Missing paths yield `Value::Null`.
    #[must_use]
    pub fn path(path: &str) -> Self {
        let pointer = format!("/{}", path.replace('.', "/"));
        Self::new(move |state| Ok(state.pointer(&pointer).cloned().unwrap_or(Value::Null)))
    }

    /// Create a memoized selector over the given dependencies.
    #[must_use]
    pub fn memoized<F>(dependencies: Vec<Selector>, compute: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Memoized(Arc::new(MemoSelector {
            dependencies,
            compute: Arc::new(compute),
            cache: Mutex::new(None),
        }))
    }

    /// Evaluate against a state snapshot.
    ///
    /// # Errors
    /// Propagates the first failure from a dependency or compute function.
    pub fn select(&self, state: &Value) -> anyhow::Result<Value> {
        match self {
            Self::Plain(select) => select(state),
            Self::Memoized(memo) => memo.select(state),
        }
    }
}

impl MemoSelector {
    fn select(&self, state: &Value) -> anyhow::Result<Value> {
        let inputs = self
            .dependencies
            .iter()
            .map(|dep| dep.select(state))
            .collect::<anyhow::Result<Vec<Value>>>()?;

        let mut cache = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(cached) = cache.as_ref() {
            if cached.inputs == inputs {
                return Ok(cached.output.clone());
            }
        }

        let output = (self.compute)(&inputs)?;
        *cache = Some(MemoCache {
            inputs,
            output: output.clone(),
        });
        Ok(output)
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("Selector::Plain"),
            Self::Memoized(memo) => f
                .debug_struct("Selector::Memoized")
                .field("dependencies", &memo.dependencies.len())
                .finish(),
        }
    }
}
