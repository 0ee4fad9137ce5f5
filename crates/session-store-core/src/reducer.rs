//! Named reducers, registration, and action routing.
//!
//! Each reducer owns one state slice and only ever sees that slice. Routing
//! picks the target set for an action in three tiers: an exact `meta.reducers`
//! list, a `meta.reducer_prefix` match, or the default rule (empty prefix, or
//! prefix equal to the action type's segment before the first `.`).

use std::time::Duration;

use serde_json::Value;

use crate::{
    action::Action,
    async_runner::AsyncReturn,
    gate::TypePattern,
    store::Dispatcher,
};

/// Sync slice reducer. `Ok(None)` means the action was not recognized and
/// the slice stays unchanged; errors are contained per entry.
pub type ApplyFn = Box<dyn Fn(&Value, &Action) -> anyhow::Result<Option<Value>> + Send>;

/// Async handler. Starts side-effecting work, re-enters the store through
/// the dispatcher, and returns a cancellation handle.
pub type AsyncApplyFn = Box<dyn Fn(&Action, Dispatcher, &Value) -> AsyncReturn + Send>;

/// Per-entry handler for actions the reducer did not recognize. Observes
/// `(action, slice)`; the slice always stays unchanged.
pub type UnmatchedFn = Box<dyn Fn(&Action, &Value) + Send>;

/// Registration-time configuration for one reducer.
///
/// Throttle and debounce are declared here as explicit
/// `(action type pattern, window)` pairs; patterns are an exact type,
/// `"prefix.*"`, or `"*"`.
#[derive(Default)]
pub struct ReducerOpts {
    /// Routing prefix; empty means "matches every default-routed action".
    pub prefix: String,
    /// Initial slice value installed on first registration.
    pub initial_slice: Value,
    /// Optional async handler for `meta.async` actions.
    pub async_apply: Option<AsyncApplyFn>,
    /// Optional per-entry unmatched-action handler.
    pub unmatched: Option<UnmatchedFn>,
    /// Throttle windows per action type pattern.
    pub throttle: Vec<(String, Duration)>,
    /// Debounce windows per action type pattern.
    pub debounce: Vec<(String, Duration)>,
}

impl ReducerOpts {
    /// Opts with just a routing prefix.
    #[must_use]
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Set the initial slice.
    #[must_use]
    pub fn with_initial_slice(mut self, slice: Value) -> Self {
        self.initial_slice = slice;
        self
    }

    /// Add a throttle window.
    #[must_use]
    pub fn throttled(mut self, pattern: impl Into<String>, window: Duration) -> Self {
        self.throttle.push((pattern.into(), window));
        self
    }

    /// Add a debounce window.
    #[must_use]
    pub fn debounced(mut self, pattern: impl Into<String>, window: Duration) -> Self {
        self.debounce.push((pattern.into(), window));
        self
    }
}

/// A registered reducer. Lives for the store's lifetime.
pub(crate) struct ReducerEntry {
    pub(crate) name: String,
    pub(crate) prefix: String,
    pub(crate) apply: ApplyFn,
    pub(crate) async_apply: Option<AsyncApplyFn>,
    pub(crate) unmatched: Option<UnmatchedFn>,
    pub(crate) throttle: Vec<(TypePattern, Duration)>,
    pub(crate) debounce: Vec<(TypePattern, Duration)>,
}

/// Holds reducers in registration order.
#[derive(Default)]
pub(crate) struct ReducerRegistry {
    entries: Vec<ReducerEntry>,
}

impl ReducerRegistry {
    /// Insert or replace by name. Returns true when an existing entry was
    /// replaced (the caller preserves the live slice in that case).
    pub(crate) fn register(
        &mut self,
        name: impl Into<String>,
        apply: ApplyFn,
        opts: ReducerOpts,
    ) -> bool {
        let name = name.into();
        let entry = ReducerEntry {
            name: name.clone(),
            prefix: opts.prefix,
            apply,
            async_apply: opts.async_apply,
            unmatched: opts.unmatched,
            throttle: opts
                .throttle
                .into_iter()
                .map(|(p, d)| (TypePattern::parse(&p), d))
                .collect(),
            debounce: opts
                .debounce
                .into_iter()
                .map(|(p, d)| (TypePattern::parse(&p), d))
                .collect(),
        };

        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == name) {
            *existing = entry;
            true
        } else {
            self.entries.push(entry);
            false
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &ReducerEntry> {
        self.entries.iter()
    }

    /// Decide which reducers an action targets. The gate evaluates exactly
    /// this candidate set; entries the action never routes to are untouched
    /// by throttle windows and debounce timers.
    pub(crate) fn route<'a>(&'a self, action: &Action) -> Vec<&'a ReducerEntry> {
        if let Some(names) = &action.meta.reducers {
            // Exact targeting: keep the given order, drop unknown names.
            return names
                .iter()
                .filter_map(|name| {
                    let entry = self.entries.iter().find(|e| &e.name == name);
                    if entry.is_none() {
                        tracing::warn!(
                            reducer = %name,
                            action_type = %action.action_type,
                            "action targets an unregistered reducer, skipping"
                        );
                    }
                    entry
                })
                .collect();
        }

        if let Some(prefix) = &action.meta.reducer_prefix {
            return self.entries.iter().filter(|e| &e.prefix == prefix).collect();
        }

        let type_prefix = action.type_prefix();
        self.entries
            .iter()
            .filter(|e| e.prefix.is_empty() || e.prefix == type_prefix)
            .collect()
    }
}
