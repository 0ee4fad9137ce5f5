//! Store core: normalize, route, gate, reduce, record, notify.
//!
//! A `Store` is exclusively owned by one session's serialized execution
//! unit; all methods assume sequential, non-reentrant calls and take no
//! internal locks. Re-entry from async handlers and debounce timers goes
//! through the [`Dispatcher`], which enqueues into the feedback channel the
//! owning loop drains back into [`Store::dispatch`].

use std::{collections::HashMap, sync::Arc};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::{
    action::{Action, DispatchOpts, RawAction},
    async_runner::{AsyncRunner, HandleRegistry},
    error::StoreError,
    gate::{Gate, GateDecision},
    history::{History, HistoryEntry},
    middleware::{self, Middleware, Outcome},
    reducer::{ApplyFn, ReducerOpts, ReducerRegistry},
    selector::Selector,
    subscription::{Observer, SubscriptionId, SubscriptionManager},
};

/// Global fallback for actions no reducer recognized.
#[derive(Clone, Default)]
pub enum UnmatchedPolicy {
    /// Log at info level.
    Log,
    /// Log at warn level.
    #[default]
    Warn,
    /// Do nothing.
    Silent,
    /// Invoke a callback with the reducer name and the action.
    Custom(Arc<dyn Fn(&str, &Action) + Send + Sync>),
}

impl UnmatchedPolicy {
    fn handle(&self, reducer: &str, action: &Action) {
        match self {
            Self::Log => {
                tracing::info!(reducer, action_type = %action.action_type, "unmatched action");
            }
            Self::Warn => {
                tracing::warn!(reducer, action_type = %action.action_type, "unmatched action");
            }
            Self::Silent => {}
            Self::Custom(callback) => callback(reducer, action),
        }
    }
}

/// Store construction parameters.
#[derive(Clone)]
pub struct StoreConfig {
    /// Maximum retained history entries.
    pub max_history: usize,
    /// Fallback for unmatched actions on entries without their own handler.
    pub unmatched: UnmatchedPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            unmatched: UnmatchedPolicy::default(),
        }
    }
}

/// Re-entry point into a store's serialized path.
///
/// Safe to invoke from any execution context: it only enqueues. Handed to
/// async handlers and debounce timers; cloning is cheap.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Action>,
}

impl Dispatcher {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Action>) -> Self {
        Self { tx }
    }

    /// Normalize and enqueue an action for the owning store.
    ///
    /// # Errors
    /// [`StoreError::InvalidActionType`] on a malformed action,
    /// [`StoreError::Closed`] when the session has ended.
    pub fn dispatch(&self, raw: impl Into<RawAction>) -> Result<(), StoreError> {
        self.send(raw.into().normalize()?)
    }

    pub(crate) fn send(&self, action: Action) -> Result<(), StoreError> {
        self.tx.send(action).map_err(|_| StoreError::Closed)
    }
}

/// The reactive store: reducers over named slices, a middleware pipeline,
/// memoized selectors, subscriptions, bounded history, and async hand-off.
pub struct Store {
    config: StoreConfig,
    slices: Map<String, Value>,
    registry: ReducerRegistry,
    middleware: Vec<Box<dyn Middleware>>,
    selectors: HashMap<String, Selector>,
    subscriptions: SubscriptionManager,
    gate: Gate,
    runner: AsyncRunner,
    history: History,
    dispatcher: Dispatcher,
    feedback: Option<mpsc::UnboundedReceiver<Action>>,
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            history: History::new(config.max_history),
            config,
            slices: Map::new(),
            registry: ReducerRegistry::default(),
            middleware: Vec::new(),
            selectors: HashMap::new(),
            subscriptions: SubscriptionManager::default(),
            gate: Gate::default(),
            runner: AsyncRunner::new(),
            dispatcher: Dispatcher::new(tx),
            feedback: Some(rx),
        }
    }

    /// Register or replace a reducer. Replacement preserves the live slice;
    /// a first registration installs `opts.initial_slice`. Registration may
    /// happen at any point in the store's life.
    pub fn register_reducer(
        &mut self,
        name: impl Into<String>,
        apply: ApplyFn,
        opts: ReducerOpts,
    ) {
        let name = name.into();
        let initial = opts.initial_slice.clone();
        let replaced = self.registry.register(name.clone(), apply, opts);
        if replaced {
            tracing::debug!(reducer = %name, "reducer replaced, slice preserved");
        }
        if !self.slices.contains_key(&name) {
            self.slices.insert(name, initial);
        }
    }

    /// Append a middleware; declaration order is execution order, first
    /// declared runs outermost.
    pub fn add_middleware(&mut self, middleware: Box<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Register a named selector.
    pub fn register_selector(&mut self, name: impl Into<String>, selector: Selector) {
        self.selectors.insert(name.into(), selector);
    }

    /// Evaluate a pre-registered named selector against current state.
    ///
    /// # Errors
    /// [`StoreError::UnknownSelector`] for an unregistered name,
    /// [`StoreError::Selector`] when evaluation fails.
    pub fn select(&self, name: &str) -> Result<Value, StoreError> {
        let selector = self
            .selectors
            .get(name)
            .ok_or_else(|| StoreError::UnknownSelector(name.to_string()))?;
        selector.select(&self.get_state()).map_err(StoreError::Selector)
    }

    /// Point-in-time snapshot of all slices.
    #[must_use]
    pub fn get_state(&self) -> Value {
        Value::Object(self.slices.clone())
    }

    /// Evaluate an ad hoc selector against current state.
    ///
    /// # Errors
    /// [`StoreError::Selector`] when evaluation fails.
    pub fn get_state_with(&self, selector: &Selector) -> Result<Value, StoreError> {
        selector.select(&self.get_state()).map_err(StoreError::Selector)
    }

    /// Subscribe an observer; the current value is delivered before the id
    /// is returned.
    pub fn subscribe(
        &mut self,
        selector: Selector,
        tag: impl Into<String>,
        observer: Box<dyn Observer>,
    ) -> SubscriptionId {
        let state = self.get_state();
        self.subscriptions.subscribe(selector, tag, observer, &state)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Snapshot of the bounded action history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }

    /// Re-entry dispatcher for async handlers, timers, and external callers.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// The receiving end of re-entrant dispatches. The owning loop takes it
    /// once and feeds received actions back into [`Store::dispatch`].
    pub fn take_feedback(&mut self) -> Option<mpsc::UnboundedReceiver<Action>> {
        self.feedback.take()
    }

    /// Registry of outstanding async/debounce cancellation handles, shared
    /// with the external teardown path.
    #[must_use]
    pub fn handle_registry(&self) -> &HandleRegistry {
        self.runner.registry()
    }

    /// Cancel all pending async and debounced work. Returns how many
    /// handles were still live.
    pub fn cancel_pending(&self) -> usize {
        self.runner.registry().cancel_all()
    }

    /// Dispatch a raw action.
    ///
    /// Returns `Some(snapshot)` for a synchronous dispatch and `None` when
    /// the action was handed to the async runner.
    ///
    /// # Errors
    /// [`StoreError::InvalidActionType`] before anything runs;
    /// [`StoreError::AsyncHandlerContract`] fails the dispatch with state
    /// untouched.
    pub fn dispatch(&mut self, raw: impl Into<RawAction>) -> Result<Option<Value>, StoreError> {
        let action = raw.into().normalize()?;
        self.dispatch_action(action)
    }

    /// Dispatch with per-call meta overrides.
    ///
    /// # Errors
    /// Same as [`Store::dispatch`].
    pub fn dispatch_with(
        &mut self,
        raw: impl Into<RawAction>,
        opts: DispatchOpts,
    ) -> Result<Option<Value>, StoreError> {
        let action = raw.into().normalize_with(opts)?;
        self.dispatch_action(action)
    }

    fn dispatch_action(&mut self, action: Action) -> Result<Option<Value>, StoreError> {
        let dispatcher = self.dispatcher.clone();
        let Self {
            config,
            slices,
            registry,
            middleware,
            subscriptions,
            gate,
            runner,
            history,
            ..
        } = self;

        // Gate the routing candidates before the route is committed. Only
        // entries the action actually targets can open a throttle window or
        // schedule a debounce timer.
        let routed: Vec<_> = registry
            .route(&action)
            .into_iter()
            .filter(|entry| {
                gate.check(entry, &action, &dispatcher, runner.registry()) == GateDecision::Pass
            })
            .collect();
        let is_async = action.meta.is_async;
        let mut updates: Vec<(String, Value)> = Vec::new();

        for entry in routed {
            let slice = slices.get(&entry.name).cloned().unwrap_or(Value::Null);

            if is_async {
                runner.run(
                    &entry.name,
                    entry.async_apply.as_ref(),
                    &action,
                    dispatcher.clone(),
                    &slice,
                )?;
                continue;
            }

            let mut terminal = |a: Action| -> Option<Value> {
                match (entry.apply)(&slice, &a) {
                    Ok(Some(updated)) => Some(updated),
                    Ok(None) => {
                        if let Some(unmatched) = &entry.unmatched {
                            unmatched(&a, &slice);
                        } else {
                            config.unmatched.handle(&entry.name, &a);
                        }
                        None
                    }
                    Err(err) => {
                        tracing::error!(
                            reducer = %entry.name,
                            error = %err,
                            "reducer failed, slice unchanged"
                        );
                        None
                    }
                }
            };

            match middleware::run_chain(middleware, action.clone(), &slice, &mut terminal) {
                Outcome::Applied(Some(updated)) => updates.push((entry.name.clone(), updated)),
                Outcome::Applied(None) | Outcome::Suppressed => {}
            }
        }

        for (name, slice) in updates {
            slices.insert(name, slice);
        }

        history.push(action);

        let snapshot = Value::Object(slices.clone());
        subscriptions.notify(&snapshot);

        if is_async {
            Ok(None)
        } else {
            Ok(Some(snapshot))
        }
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
