//! Serialized per-session execution unit for `session-store-core`.
//!
//! This crate provides the boundary the store core assumes but does not
//! implement itself:
//! - `SessionHandle` - cloneable API over one session's store, serialized
//!   onto a single owning task (the single-writer discipline)
//! - channel-backed observers with liveness via channel closure
//! - teardown that cancels all pending async and debounced work in one pass
//!
//! Supervision, session directories, eviction, and admission control are the
//! caller's concern; this crate only hosts the store.

pub mod session;

pub use session::{SessionError, SessionHandle};

// Re-export the core vocabulary so callers need one import path.
pub use session_store_core::{
    Action, ApplyFn, AsyncReturn, CancellationHandle, DispatchOpts, HistoryEntry, Middleware,
    Notification, Observer, RawAction, ReducerOpts, Selector, StoreConfig, StoreError,
    SubscriptionId, spawn_cancellable,
};
