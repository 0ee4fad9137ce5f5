//! Store error taxonomy.
//!
//! Unmatched actions are deliberately absent here: they are routed to a
//! configurable policy, not treated as errors. Faults inside user-supplied
//! reducers, middleware, and selectors are contained at the call site and
//! logged; only contract-level failures surface as `StoreError`.

use thiserror::Error;

/// Errors surfaced by the store API.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The action's type field was missing, empty, or not a string.
    #[error("Invalid action type: {0}")]
    InvalidActionType(String),

    /// `select` was called with a name that was never registered.
    #[error("Unknown selector: {0}")]
    UnknownSelector(String),

    /// An async handler returned a plain value instead of a cancellation
    /// handle. This is a programmer mistake, not a runtime fault, and it
    /// fails the whole dispatch without touching state.
    #[error("Async handler for reducer '{reducer}' returned a value instead of a cancellation handle")]
    AsyncHandlerContract { reducer: String },

    /// A selector passed to `get_state_with` failed.
    #[error("Selector failed: {0}")]
    Selector(#[source] anyhow::Error),

    /// The store's serialized path is gone (session ended).
    #[error("Store is closed")]
    Closed,
}
