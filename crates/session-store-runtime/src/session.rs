//! Per-session execution unit hosting one store.
//!
//! One tokio task owns the `Store` and serializes everything that touches
//! it: API commands from any number of cloned handles, plus re-entrant
//! actions from async handlers and debounce timers arriving on the store's
//! feedback channel. This is the single-writer discipline the store core
//! assumes; nothing else ever holds the store.

use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;
use session_store_core::{
    ApplyFn, DispatchOpts, HistoryEntry, Middleware, Notification, Observer, RawAction,
    ReducerOpts, Selector, Store, StoreConfig, StoreError, SubscriptionId,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Session API error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session task has ended; no further calls are possible.
    #[error("Session ended")]
    Closed,
    /// The store rejected the call.
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Command {
    Dispatch {
        raw: RawAction,
        opts: Option<DispatchOpts>,
        reply: Option<oneshot::Sender<Result<Option<Value>, StoreError>>>,
    },
    RegisterReducer {
        name: String,
        apply: ApplyFn,
        opts: ReducerOpts,
        reply: oneshot::Sender<()>,
    },
    RegisterSelector {
        name: String,
        selector: Selector,
        reply: oneshot::Sender<()>,
    },
    AddMiddleware {
        middleware: Box<dyn Middleware>,
        reply: oneshot::Sender<()>,
    },
    GetState {
        reply: oneshot::Sender<Value>,
    },
    GetStateWith {
        selector: Selector,
        reply: oneshot::Sender<Result<Value, StoreError>>,
    },
    Select {
        name: String,
        reply: oneshot::Sender<Result<Value, StoreError>>,
    },
    Subscribe {
        selector: Selector,
        tag: String,
        observer: Box<dyn Observer>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    History {
        reply: oneshot::Sender<Vec<HistoryEntry>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to one session's store.
///
/// All methods enqueue onto the session's serialized path and await the
/// reply; the handle itself is safe to use from any task or thread.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Spawn a session execution unit with an empty store.
    #[must_use]
    pub fn spawn(config: StoreConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(Store::new(config), rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Dispatch and await the result: `Some(snapshot)` for a sync action,
    /// `None` for an async hand-off.
    ///
    /// # Errors
    /// Store errors pass through; [`SessionError::Closed`] after shutdown.
    pub async fn dispatch(
        &self,
        raw: impl Into<RawAction>,
    ) -> Result<Option<Value>, SessionError> {
        let raw = raw.into();
        let result = self
            .request(|reply| Command::Dispatch { raw, opts: None, reply: Some(reply) })
            .await?;
        Ok(result?)
    }

    /// Dispatch with per-call meta overrides.
    ///
    /// # Errors
    /// Same as [`SessionHandle::dispatch`].
    pub async fn dispatch_with(
        &self,
        raw: impl Into<RawAction>,
        opts: DispatchOpts,
    ) -> Result<Option<Value>, SessionError> {
        let raw = raw.into();
        let result = self
            .request(|reply| Command::Dispatch { raw, opts: Some(opts), reply: Some(reply) })
            .await?;
        Ok(result?)
    }

    /// Fire-and-forget dispatch; results are observed via subscriptions.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub fn dispatch_forget(&self, raw: impl Into<RawAction>) -> Result<(), SessionError> {
        self.tx
            .send(Command::Dispatch { raw: raw.into(), opts: None, reply: None })
            .map_err(|_| SessionError::Closed)
    }

    /// Register or replace a reducer.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn register_reducer(
        &self,
        name: impl Into<String>,
        apply: ApplyFn,
        opts: ReducerOpts,
    ) -> Result<(), SessionError> {
        let name = name.into();
        self.request(|reply| Command::RegisterReducer { name, apply, opts, reply })
            .await
    }

    /// Register a named selector.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn register_selector(
        &self,
        name: impl Into<String>,
        selector: Selector,
    ) -> Result<(), SessionError> {
        let name = name.into();
        self.request(|reply| Command::RegisterSelector { name, selector, reply })
            .await
    }

    /// Append a middleware to the store's pipeline.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn add_middleware(
        &self,
        middleware: Box<dyn Middleware>,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::AddMiddleware { middleware, reply })
            .await
    }

    /// Point-in-time snapshot of all slices.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn get_state(&self) -> Result<Value, SessionError> {
        self.request(|reply| Command::GetState { reply }).await
    }

    /// Evaluate an ad hoc selector against current state.
    ///
    /// # Errors
    /// Store errors pass through; [`SessionError::Closed`] after shutdown.
    pub async fn get_state_with(&self, selector: Selector) -> Result<Value, SessionError> {
        let result = self
            .request(|reply| Command::GetStateWith { selector, reply })
            .await?;
        Ok(result?)
    }

    /// Evaluate a pre-registered named selector.
    ///
    /// # Errors
    /// Store errors pass through; [`SessionError::Closed`] after shutdown.
    pub async fn select(&self, name: impl Into<String>) -> Result<Value, SessionError> {
        let name = name.into();
        let result = self.request(|reply| Command::Select { name, reply }).await?;
        Ok(result?)
    }

    /// Subscribe with a channel observer. The first notification (the
    /// current value) is already in the returned receiver.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn subscribe(
        &self,
        selector: Selector,
        tag: impl Into<String>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Notification>), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe_observer(selector, tag, Box::new(tx)).await?;
        Ok((id, rx))
    }

    /// Subscribe and adapt the notifications into a stream.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn subscribe_stream(
        &self,
        selector: Selector,
        tag: impl Into<String>,
    ) -> Result<(SubscriptionId, BoxStream<'static, Notification>), SessionError> {
        let (id, rx) = self.subscribe(selector, tag).await?;
        Ok((id, UnboundedReceiverStream::new(rx).boxed()))
    }

    /// Subscribe with a custom observer implementation.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn subscribe_observer(
        &self,
        selector: Selector,
        tag: impl Into<String>,
        observer: Box<dyn Observer>,
    ) -> Result<SubscriptionId, SessionError> {
        let tag = tag.into();
        self.request(|reply| Command::Subscribe { selector, tag, observer, reply })
            .await
    }

    /// Remove a subscription. Returns whether it existed.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, SessionError> {
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// Snapshot of the bounded action history.
    ///
    /// # Errors
    /// [`SessionError::Closed`] after shutdown.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, SessionError> {
        self.request(|reply| Command::History { reply }).await
    }

    /// End the session: cancel all pending async and debounced work, then
    /// stop the execution unit. Returns how many handles were cancelled.
    ///
    /// # Errors
    /// [`SessionError::Closed`] if the session already ended.
    pub async fn shutdown(&self) -> Result<usize, SessionError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn run_loop(mut store: Store, mut commands: mpsc::UnboundedReceiver<Command>) {
    let Some(mut feedback) = store.take_feedback() else {
        return;
    };

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => break,
                Some(Command::Shutdown { reply }) => {
                    let cancelled = store.cancel_pending();
                    tracing::debug!(cancelled, "session shut down");
                    let _ = reply.send(cancelled);
                    return;
                }
                Some(command) => handle_command(&mut store, command),
            },
            action = feedback.recv() => {
                if let Some(action) = action {
                    if let Err(err) = store.dispatch(action) {
                        tracing::warn!(error = %err, "re-entrant dispatch failed");
                    }
                }
            }
        }
    }

    // Every handle dropped: same teardown as an explicit shutdown.
    let cancelled = store.cancel_pending();
    if cancelled > 0 {
        tracing::debug!(cancelled, "session ended, pending work cancelled");
    }
}

fn handle_command(store: &mut Store, command: Command) {
    match command {
        Command::Dispatch { raw, opts, reply } => {
            let result = match opts {
                Some(opts) => store.dispatch_with(raw, opts),
                None => store.dispatch(raw),
            };
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "fire-and-forget dispatch failed");
                    }
                }
            }
        }
        Command::RegisterReducer { name, apply, opts, reply } => {
            store.register_reducer(name, apply, opts);
            let _ = reply.send(());
        }
        Command::RegisterSelector { name, selector, reply } => {
            store.register_selector(name, selector);
            let _ = reply.send(());
        }
        Command::AddMiddleware { middleware, reply } => {
            store.add_middleware(middleware);
            let _ = reply.send(());
        }
        Command::GetState { reply } => {
            let _ = reply.send(store.get_state());
        }
        Command::GetStateWith { selector, reply } => {
            let _ = reply.send(store.get_state_with(&selector));
        }
        Command::Select { name, reply } => {
            let _ = reply.send(store.select(&name));
        }
        Command::Subscribe { selector, tag, observer, reply } => {
            let _ = reply.send(store.subscribe(selector, tag, observer));
        }
        Command::Unsubscribe { id, reply } => {
            let _ = reply.send(store.unsubscribe(id));
        }
        Command::History { reply } => {
            let _ = reply.send(store.history());
        }
        Command::Shutdown { .. } => unreachable!("handled in run_loop"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use session_store_core::Action;

    use super::*;

    fn counter_apply() -> ApplyFn {
        Box::new(|slice: &Value, action: &Action| {
            let count = slice["count"].as_i64().unwrap_or(0);
            match action.action_type.as_str() {
                "counter.increment" => Ok(Some(json!({"count": count + 1}))),
                "counter.set" => Ok(Some(json!({"count": action.payload.clone()}))),
                _ => Ok(None),
            }
        })
    }

    async fn counter_session() -> SessionHandle {
        let session = SessionHandle::spawn(StoreConfig::default());
        session
            .register_reducer(
                "counter",
                counter_apply(),
                ReducerOpts::prefixed("counter").with_initial_slice(json!({"count": 0})),
            )
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_counter_end_to_end_through_handle() {
        let session = counter_session().await;

        for _ in 0..3 {
            session.dispatch("counter.increment").await.unwrap();
        }
        assert_eq!(session.get_state().await.unwrap()["counter"]["count"], json!(3));

        session.dispatch(("counter.set", json!(10))).await.unwrap();

        let (_id, mut rx) = session
            .subscribe(Selector::path("counter.count"), "count")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().value, json!(10));

        session.dispatch("counter.increment").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().value, json!(11));
    }

    #[tokio::test]
    async fn test_cloned_handles_share_one_store() {
        let session = counter_session().await;
        let clone = session.clone();

        clone.dispatch("counter.increment").await.unwrap();
        assert_eq!(session.get_state().await.unwrap()["counter"]["count"], json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_fires_through_the_session_loop() {
        let session = SessionHandle::spawn(StoreConfig::default());
        session
            .register_reducer(
                "counter",
                counter_apply(),
                ReducerOpts::prefixed("counter")
                    .with_initial_slice(json!({"count": 0}))
                    .debounced("counter.set", Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let (_id, mut rx) = session
            .subscribe(Selector::path("counter.count"), "count")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().value, json!(0));

        for i in 0..5 {
            session.dispatch(("counter.set", json!(i))).await.unwrap();
        }

        // Only the trailing fire reaches the reducer, with the last payload.
        assert_eq!(rx.recv().await.unwrap().value, json!(4));
        assert_eq!(session.get_state().await.unwrap()["counter"]["count"], json!(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_work() {
        let session = SessionHandle::spawn(StoreConfig::default());
        session
            .register_reducer(
                "counter",
                counter_apply(),
                ReducerOpts::prefixed("counter")
                    .with_initial_slice(json!({"count": 0}))
                    .debounced("counter.set", Duration::from_millis(50)),
            )
            .await
            .unwrap();

        session.dispatch(("counter.set", json!(1))).await.unwrap();
        assert_eq!(session.shutdown().await.unwrap(), 1);

        // The session is gone and the debounce never fired anywhere.
        assert!(matches!(
            session.dispatch("counter.increment").await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_stream_adapter() {
        let session = counter_session().await;
        let (_id, mut stream) = session
            .subscribe_stream(Selector::path("counter.count"), "count")
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().value, json!(0));
        session.dispatch("counter.increment").await.unwrap();
        assert_eq!(stream.next().await.unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let session = counter_session().await;
        let (id, mut rx) = session
            .subscribe(Selector::path("counter.count"), "count")
            .await
            .unwrap();
        rx.recv().await.unwrap();

        assert!(session.unsubscribe(id).await.unwrap());
        session.dispatch("counter.increment").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_through_handle() {
        let session = counter_session().await;
        session.dispatch("counter.increment").await.unwrap();
        session.dispatch(("counter.set", json!(5))).await.unwrap();

        let history = session.history().await.unwrap();
        let types: Vec<String> = history.into_iter().map(|e| e.action.action_type).collect();
        assert_eq!(types, vec!["counter.increment", "counter.set"]);
    }
}
