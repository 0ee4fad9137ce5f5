//! Bounded action history for time-travel style debugging.

use std::{
    collections::VecDeque,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::action::Action;

/// One recorded dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The normalized action as it entered the store.
    pub action: Action,
    /// Dispatch time, Unix epoch milliseconds.
    pub at: i64,
}

/// Bounded FIFO of past actions. Oldest entries are evicted first.
pub(crate) struct History {
    entries: VecDeque<HistoryEntry>,
    max: usize,
}

impl History {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max.min(32)),
            max,
        }
    }

    pub(crate) fn push(&mut self, action: Action) {
        if self.max == 0 {
            return;
        }
        while self.entries.len() >= self.max {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            action,
            at: now_millis(),
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_bounded_oldest_evicted_first() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.push(Action::new(format!("tick.{i}")));
        }
        assert_eq!(history.len(), 3);
        let types: Vec<String> = history
            .snapshot()
            .into_iter()
            .map(|e| e.action.action_type)
            .collect();
        assert_eq!(types, vec!["tick.2", "tick.3", "tick.4"]);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut history = History::new(0);
        history.push(Action::new("tick"));
        assert_eq!(history.len(), 0);
    }
}
