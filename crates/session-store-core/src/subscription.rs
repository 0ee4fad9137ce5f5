//! Observer subscriptions and the per-dispatch notify pass.
//!
//! A subscription pairs an observer handle with a selector and the last
//! value delivered. Observers are opaque deliverable handles, never owned by
//! the store; liveness is an injectable capability of the [`Observer`] trait
//! so dead observers are reaped without ever erroring a dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::selector::Selector;

/// Subscription identifier.
pub type SubscriptionId = Uuid;

/// What a subscribed observer receives on change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// The event tag chosen at subscribe time.
    pub tag: String,
    /// The selector's new value.
    pub value: Value,
}

/// The observer's channel is gone; the subscription will be reaped.
#[derive(Debug)]
pub struct ObserverGone;

/// Deliverable handle for one observer, with a liveness probe.
pub trait Observer: Send {
    /// Deliver a notification.
    ///
    /// # Errors
    /// Returns [`ObserverGone`] when the observer can no longer receive.
    fn deliver(&self, notification: Notification) -> Result<(), ObserverGone>;

    /// Whether the observer is still able to receive.
    fn is_alive(&self) -> bool;
}

/// The provided observer: an unbounded channel sender. A dropped receiver
/// is the observer-death signal.
impl Observer for tokio::sync::mpsc::UnboundedSender<Notification> {
    fn deliver(&self, notification: Notification) -> Result<(), ObserverGone> {
        self.send(notification).map_err(|_| ObserverGone)
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }
}

struct Subscription {
    id: SubscriptionId,
    observer: Box<dyn Observer>,
    selector: Selector,
    tag: String,
    last_value: Value,
}

/// Tracks subscriptions, recomputes selectors on change, reaps the dead.
#[derive(Default)]
pub(crate) struct SubscriptionManager {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionManager {
    /// Register a subscription, delivering the current value before the id
    /// is returned so the observer never starts blind.
    pub(crate) fn subscribe(
        &mut self,
        selector: Selector,
        tag: impl Into<String>,
        observer: Box<dyn Observer>,
        state: &Value,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        let tag = tag.into();

        let last_value = match selector.select(state) {
            Ok(value) => {
                let _ = observer.deliver(Notification {
                    tag: tag.clone(),
                    value: value.clone(),
                });
                value
            }
            Err(err) => {
                tracing::error!(%id, tag, error = %err, "selector failed at subscribe");
                Value::Null
            }
        };

        self.subscriptions.push(Subscription {
            id,
            observer,
            selector,
            tag,
            last_value,
        });
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Recompute every subscription against the new state and deliver where
    /// the selected value changed. Dead observers are dropped silently;
    /// selector faults keep the previous value and the subscription alive.
    pub(crate) fn notify(&mut self, state: &Value) {
        self.subscriptions.retain_mut(|sub| {
            if !sub.observer.is_alive() {
                tracing::debug!(id = %sub.id, tag = %sub.tag, "observer gone, dropping subscription");
                return false;
            }

            let value = match sub.selector.select(state) {
                Ok(value) => value,
                Err(err) => {
                    tracing::error!(id = %sub.id, tag = %sub.tag, error = %err, "selector failed during notify");
                    return true;
                }
            };

            if value == sub.last_value {
                return true;
            }

            sub.last_value = value.clone();
            match sub.observer.deliver(Notification {
                tag: sub.tag.clone(),
                value,
            }) {
                Ok(()) => true,
                Err(ObserverGone) => {
                    tracing::debug!(id = %sub.id, tag = %sub.tag, "delivery failed, dropping subscription");
                    false
                }
            }
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn channel_observer() -> (
        Box<dyn Observer>,
        mpsc::UnboundedReceiver<Notification>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(tx), rx)
    }

    #[test]
    fn test_subscribe_delivers_current_value_first() {
        let mut manager = SubscriptionManager::default();
        let (observer, mut rx) = channel_observer();
        let state = json!({"counter": {"count": 7}});

        manager.subscribe(Selector::path("counter.count"), "count", observer, &state);

        let first = rx.try_recv().unwrap();
        assert_eq!(first, Notification { tag: "count".into(), value: json!(7) });
    }

    #[test]
    fn test_unchanged_value_produces_no_notification() {
        let mut manager = SubscriptionManager::default();
        let (observer, mut rx) = channel_observer();
        let state = json!({"counter": {"count": 7}, "other": 1});

        manager.subscribe(Selector::path("counter.count"), "count", observer, &state);
        rx.try_recv().unwrap();

        manager.notify(&json!({"counter": {"count": 7}, "other": 2}));
        assert!(rx.try_recv().is_err());

        manager.notify(&json!({"counter": {"count": 8}, "other": 2}));
        assert_eq!(rx.try_recv().unwrap().value, json!(8));
    }

    #[test]
    fn test_dead_observer_is_reaped_silently() {
        let mut manager = SubscriptionManager::default();
        let (observer, rx) = channel_observer();

        manager.subscribe(Selector::path("n"), "n", observer, &json!({"n": 1}));
        assert_eq!(manager.len(), 1);

        drop(rx);
        manager.notify(&json!({"n": 2}));
        assert_eq!(manager.len(), 0);

        // A later pass does not attempt delivery and does not error.
        manager.notify(&json!({"n": 3}));
    }

    #[test]
    fn test_unsubscribe() {
        let mut manager = SubscriptionManager::default();
        let (observer, _rx) = channel_observer();
        let id = manager.subscribe(Selector::path("n"), "n", observer, &json!({"n": 1}));

        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_selector_fault_keeps_subscription_alive() {
        let mut manager = SubscriptionManager::default();
        let (observer, mut rx) = channel_observer();
        let flaky = Selector::new(|state| {
            if state["broken"] == json!(true) {
                anyhow::bail!("selector exploded");
            }
            Ok(state["n"].clone())
        });

        manager.subscribe(flaky, "n", observer, &json!({"n": 1, "broken": false}));
        rx.try_recv().unwrap();

        manager.notify(&json!({"n": 2, "broken": true}));
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.len(), 1);

        // Recovers with lastValue untouched by the faulting pass.
        manager.notify(&json!({"n": 2, "broken": false}));
        assert_eq!(rx.try_recv().unwrap().value, json!(2));
    }
}
