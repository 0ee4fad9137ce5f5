//! Redux-style reactive store engine for session-scoped state.
//!
//! This crate provides the store core and its building blocks:
//! - `Action` / `RawAction` - canonical action shape and normalization
//! - `Store` - dispatch orchestration over named reducer slices
//! - `Selector` - plain and memoized derived values
//! - `Middleware` - ordered pipeline wrapping reducer application
//! - Subscriptions with dead-observer reaping and bounded action history
//! - Async hand-off with idempotent cancellation handles
//!
//! A `Store` is single-writer by design: it is meant to be owned by one
//! session's serialized execution unit (see `session-store-runtime`), with
//! concurrency confined to observers, async workers, and timers that re-enter
//! through the `Dispatcher`.

pub mod action;
pub mod async_runner;
pub mod error;
mod gate;
pub mod history;
pub mod middleware;
pub mod reducer;
pub mod selector;
pub mod store;
pub mod subscription;

pub use action::{Action, ActionMeta, DispatchOpts, RawAction};
pub use async_runner::{AsyncReturn, CancellationHandle, HandleRegistry, spawn_cancellable};
pub use error::StoreError;
pub use history::HistoryEntry;
pub use middleware::{LoggingMiddleware, Middleware, Next, Outcome};
pub use reducer::{ApplyFn, AsyncApplyFn, ReducerOpts, UnmatchedFn};
pub use selector::Selector;
pub use store::{Dispatcher, Store, StoreConfig, UnmatchedPolicy};
pub use subscription::{Notification, Observer, ObserverGone, SubscriptionId};
