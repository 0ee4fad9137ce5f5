//! Per (action type, reducer) throttle and debounce gating.
//!
//! The gate runs before the route is committed: each routing candidate is
//! checked against the incoming action, and suppressed entries are dropped
//! from the final set. Reducers the action does not route to are never
//! gated. Throttle executes the first match in a window and drops the
//! rest; debounce collapses a burst into one trailing execution carrying the
//! latest action, re-entering the serialized path through the store's
//! dispatcher when the timer fires.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::{
    action::Action,
    async_runner::{CancellationHandle, HandleRegistry, spawn_cancellable},
    reducer::ReducerEntry,
    store::Dispatcher,
};

/// Action type pattern for gate configuration: exact, `"prefix.*"`, or `"*"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TypePattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl TypePattern {
    pub(crate) fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::Any
        } else if let Some(head) = pattern.strip_suffix(".*") {
            Self::Prefix(head.to_string())
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    pub(crate) fn matches(&self, action_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(t) => action_type == t,
            Self::Prefix(head) => action_type
                .strip_prefix(head.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.')),
        }
    }
}

/// Outcome of the gate check for one (action, reducer) pair.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GateDecision {
    Pass,
    Suppress,
}

type GateKey = (String, String); // (action type, reducer name)

/// Tracks open throttle windows and pending debounce timers.
#[derive(Default)]
pub(crate) struct Gate {
    throttle_windows: HashMap<GateKey, Instant>,
    debounce_pending: HashMap<GateKey, (u64, CancellationHandle)>,
}

impl Gate {
    /// Evaluate throttle then debounce for one reducer. Debounce-fired
    /// re-entries are exempt; their arrival clears the pending timer slot.
    pub(crate) fn check(
        &mut self,
        entry: &ReducerEntry,
        action: &Action,
        dispatcher: &Dispatcher,
        registry: &HandleRegistry,
    ) -> GateDecision {
        let key = (action.action_type.clone(), entry.name.clone());

        if action.meta.gate_exempt {
            if let Some((id, _)) = self.debounce_pending.remove(&key) {
                registry.remove(id);
            }
            return GateDecision::Pass;
        }

        if let Some(window) = match_window(&entry.throttle, &action.action_type) {
            let now = Instant::now();
            match self.throttle_windows.get(&key) {
                Some(start) if now.duration_since(*start) < window => {
                    tracing::debug!(
                        reducer = %entry.name,
                        action_type = %action.action_type,
                        "throttled, dropping"
                    );
                    return GateDecision::Suppress;
                }
                _ => {
                    self.throttle_windows.insert(key.clone(), now);
                }
            }
        }

        if let Some(window) = match_window(&entry.debounce, &action.action_type) {
            self.schedule_debounce(key, entry, action, window, dispatcher, registry);
            return GateDecision::Suppress;
        }

        GateDecision::Pass
    }

    /// (Re)schedule the trailing timer with the latest action. An earlier
    /// pending timer for the same pair is cancelled, never fired.
    fn schedule_debounce(
        &mut self,
        key: GateKey,
        entry: &ReducerEntry,
        action: &Action,
        window: Duration,
        dispatcher: &Dispatcher,
        registry: &HandleRegistry,
    ) {
        if let Some((old_id, old_handle)) = self.debounce_pending.remove(&key) {
            old_handle.cancel();
            registry.remove(old_id);
        }

        let mut fired = action.clone();
        fired.meta.reducers = Some(vec![entry.name.clone()]);
        fired.meta.reducer_prefix = None;
        fired.meta.gate_exempt = true;

        let dispatcher = dispatcher.clone();
        let handle = spawn_cancellable(async move {
            tokio::time::sleep(window).await;
            // Send fails only when the session already ended; the fire is
            // dropped rather than dispatched posthumously.
            let _ = dispatcher.send(fired);
        });

        let id = registry.register(handle.clone());
        self.debounce_pending.insert(key, (id, handle));
        tracing::debug!(
            reducer = %entry.name,
            action_type = %action.action_type,
            window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            "debounce timer scheduled"
        );
    }
}

fn match_window(patterns: &[(TypePattern, Duration)], action_type: &str) -> Option<Duration> {
    patterns
        .iter()
        .find(|(pattern, _)| pattern.matches(action_type))
        .map(|(_, window)| *window)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::reducer::{ReducerOpts, ReducerRegistry};

    #[test]
    fn test_type_pattern_matching() {
        assert!(TypePattern::parse("*").matches("anything.at.all"));
        assert!(TypePattern::parse("scroll.move").matches("scroll.move"));
        assert!(!TypePattern::parse("scroll.move").matches("scroll.stop"));
        assert!(TypePattern::parse("scroll.*").matches("scroll.move"));
        assert!(TypePattern::parse("scroll.*").matches("scroll"));
        assert!(!TypePattern::parse("scroll.*").matches("scrolling.move"));
    }

    fn throttled_entry() -> ReducerRegistry {
        let mut registry = ReducerRegistry::default();
        registry.register(
            "scroll",
            Box::new(|_: &Value, _: &Action| Ok(None)),
            ReducerOpts::prefixed("scroll").throttled("scroll.*", Duration::from_millis(100)),
        );
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_first_passes_rest_dropped_until_window_elapses() {
        let registry = throttled_entry();
        let entry = registry.entries().next().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let handles = HandleRegistry::default();
        let mut gate = Gate::default();

        let action = Action::new("scroll.move");
        assert_eq!(gate.check(entry, &action, &dispatcher, &handles), GateDecision::Pass);
        for _ in 0..4 {
            assert_eq!(
                gate.check(entry, &action, &dispatcher, &handles),
                GateDecision::Suppress
            );
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(gate.check(entry, &action, &dispatcher, &handles), GateDecision::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_fires_once_with_latest_payload() {
        let mut registry = ReducerRegistry::default();
        registry.register(
            "search",
            Box::new(|_: &Value, _: &Action| Ok(None)),
            ReducerOpts::prefixed("search").debounced("search.query", Duration::from_millis(50)),
        );
        let entry = registry.entries().next().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let handles = HandleRegistry::default();
        let mut gate = Gate::default();

        for i in 0..5 {
            let action = Action::new("search.query").with_payload(json!(format!("term-{i}")));
            assert_eq!(
                gate.check(entry, &action, &dispatcher, &handles),
                GateDecision::Suppress
            );
        }

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.payload, json!("term-4"));
        assert_eq!(fired.meta.reducers, Some(vec!["search".to_string()]));
        // Only the trailing timer fired.
        assert!(rx.try_recv().is_err());

        // The re-entry is exempt and clears the pending slot.
        assert_eq!(gate.check(entry, &fired, &dispatcher, &handles), GateDecision::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_debounce_never_fires() {
        let mut registry = ReducerRegistry::default();
        registry.register(
            "search",
            Box::new(|_: &Value, _: &Action| Ok(None)),
            ReducerOpts::prefixed("search").debounced("search.query", Duration::from_millis(50)),
        );
        let entry = registry.entries().next().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let handles = HandleRegistry::default();
        let mut gate = Gate::default();

        gate.check(entry, &Action::new("search.query"), &dispatcher, &handles);
        assert_eq!(handles.cancel_all(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
