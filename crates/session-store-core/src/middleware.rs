//! Ordered middleware pipeline wrapping reducer application.
//!
//! The chain is folded so the first-declared middleware runs outermost: it
//! sees the action first, may rewrite it, and may short-circuit the rest of
//! the chain (including the innermost reducer application) by returning
//! without invoking its `next` continuation. That escape hatch is the
//! intended mechanism for validation/rejection middleware.

use serde_json::Value;

use crate::action::Action;

/// Result of one middleware-wrapped reducer leg.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// The chain reached the reducer. `Some` carries an updated slice,
    /// `None` means the slice is unchanged (unmatched or contained fault).
    Applied(Option<Value>),
    /// A middleware dropped the leg without invoking `next`.
    Suppressed,
}

/// Continuation invoking the rest of the chain with a (possibly rewritten)
/// action.
pub type Next<'a> = &'a mut dyn FnMut(Action) -> anyhow::Result<Outcome>;

/// One link in the dispatch pipeline.
pub trait Middleware: Send {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Handle the action for one reducer leg. Call `next` to continue the
    /// chain, or return [`Outcome::Suppressed`] to drop the leg.
    ///
    /// # Errors
    /// A returned error is contained by the pipeline: the failing link is
    /// skipped and the chain continues with the action it received.
    fn call(&self, action: Action, slice: &Value, next: Next<'_>) -> anyhow::Result<Outcome>;
}

/// Middleware that logs every action at debug level and passes it through.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn call(&self, action: Action, _slice: &Value, next: Next<'_>) -> anyhow::Result<Outcome> {
        tracing::debug!(action_type = %action.action_type, "dispatching");
        next(action)
    }
}

/// Run the chain over one reducer leg. `terminal` is the reducer application
/// itself; it never fails (reducer faults are contained inside it).
pub(crate) fn run_chain(
    links: &[Box<dyn Middleware>],
    action: Action,
    slice: &Value,
    terminal: &mut dyn FnMut(Action) -> Option<Value>,
) -> Outcome {
    let Some((head, rest)) = links.split_first() else {
        return Outcome::Applied(terminal(action));
    };

    let fallback = action.clone();
    let result = {
        let mut next = |a: Action| Ok(run_chain(rest, a, slice, &mut *terminal));
        head.call(action, slice, &mut next)
    };

    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(
                middleware = head.name(),
                error = %err,
                "middleware failed, continuing without it"
            );
            run_chain(rest, fallback, slice, &mut *terminal)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn call(&self, action: Action, _slice: &Value, next: Next<'_>) -> anyhow::Result<Outcome> {
            self.seen.lock().unwrap().push(self.label.to_string());
            next(action)
        }
    }

    struct Rejecting;

    impl Middleware for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        fn call(&self, _action: Action, _slice: &Value, _next: Next<'_>) -> anyhow::Result<Outcome> {
            Ok(Outcome::Suppressed)
        }
    }

    struct Failing;

    impl Middleware for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn call(&self, _action: Action, _slice: &Value, _next: Next<'_>) -> anyhow::Result<Outcome> {
            anyhow::bail!("middleware exploded")
        }
    }

    struct Retagging;

    impl Middleware for Retagging {
        fn name(&self) -> &str {
            "retagging"
        }

        fn call(&self, action: Action, _slice: &Value, next: Next<'_>) -> anyhow::Result<Outcome> {
            next(action.with_meta("tagged", json!(true)))
        }
    }

    #[test]
    fn test_first_declared_runs_outermost() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let links: Vec<Box<dyn Middleware>> = vec![
            Box::new(Recorder { label: "outer", seen: Arc::clone(&seen) }),
            Box::new(Recorder { label: "inner", seen: Arc::clone(&seen) }),
        ];
        let order = Arc::clone(&seen);
        let mut terminal = |_a: Action| {
            order.lock().unwrap().push("reducer".to_string());
            None
        };
        run_chain(&links, Action::new("x.y"), &Value::Null, &mut terminal);
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner", "reducer"]);
    }

    #[test]
    fn test_suppression_skips_reducer() {
        let links: Vec<Box<dyn Middleware>> = vec![Box::new(Rejecting)];
        let mut called = false;
        let outcome = run_chain(&links, Action::new("x.y"), &Value::Null, &mut |_| {
            called = true;
            None
        });
        assert_eq!(outcome, Outcome::Suppressed);
        assert!(!called);
    }

    #[test]
    fn test_failing_link_is_skipped_not_fatal() {
        let links: Vec<Box<dyn Middleware>> = vec![Box::new(Failing), Box::new(Retagging)];
        let mut seen_tag = false;
        let outcome = run_chain(&links, Action::new("x.y"), &Value::Null, &mut |a| {
            seen_tag = a.meta.extra.contains_key("tagged");
            Some(json!(1))
        });
        // Retagging still ran after the failing link was dropped.
        assert!(seen_tag);
        assert_eq!(outcome, Outcome::Applied(Some(json!(1))));
    }
}
