//! Counter session demo.
//!
//! Run with: cargo run -p counter-demo
//!
//! Spawns one session store, registers a counter reducer with a debounced
//! `counter.set`, subscribes to the count, and prints every notification.

use std::time::Duration;

use serde_json::{Value, json};
use session_store_core::{
    Action, ApplyFn, LoggingMiddleware, ReducerOpts, Selector, StoreConfig,
};
use session_store_runtime::SessionHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

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

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let session = SessionHandle::spawn(StoreConfig::default());
    session
        .add_middleware(Box::new(LoggingMiddleware))
        .await
        .expect("session alive");
    session
        .register_reducer(
            "counter",
            counter_apply(),
            ReducerOpts::prefixed("counter")
                .with_initial_slice(json!({"count": 0}))
                .debounced("counter.set", Duration::from_millis(200)),
        )
        .await
        .expect("session alive");

    let (_id, mut notifications) = session
        .subscribe(Selector::path("counter.count"), "count")
        .await
        .expect("session alive");

    let printer = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            tracing::info!(tag = %notification.tag, value = %notification.value, "observed");
        }
    });

    for _ in 0..3 {
        session.dispatch("counter.increment").await.expect("session alive");
    }

    // A burst of sets collapses into one trailing execution.
    for i in 0..5 {
        session
            .dispatch(("counter.set", json!(i * 10)))
            .await
            .expect("session alive");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let state = session.get_state().await.expect("session alive");
    tracing::info!(%state, "final state");

    let cancelled = session.shutdown().await.expect("session alive");
    tracing::info!(cancelled, "session shut down");
    printer.abort();
}
