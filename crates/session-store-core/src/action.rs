//! Action shape and normalization.
//!
//! Every dispatch input is canonicalized into one [`Action`] shape before it
//! touches routing: a non-empty string type, an arbitrary JSON payload, and a
//! meta map whose reserved keys (`async`, `reducers`, `reducer_prefix`) drive
//! routing while everything else passes through untouched for middleware and
//! observability use.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Reserved meta key: route to the async action runner.
pub const META_ASYNC: &str = "async";
/// Reserved meta key: route to exactly these named reducers.
pub const META_REDUCERS: &str = "reducers";
/// Reserved meta key: route to reducers registered under this prefix.
pub const META_REDUCER_PREFIX: &str = "reducer_prefix";

/// Routing and extension metadata carried by an [`Action`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionMeta {
    /// Route to `async_apply` handlers instead of sync reducers.
    #[serde(rename = "async", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_async: bool,

    /// Route to exactly these named reducers, bypassing prefix filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducers: Option<Vec<String>>,

    /// Route to reducers whose registered prefix equals this string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer_prefix: Option<String>,

    /// Set on debounce-fired re-entries so the gate does not re-evaluate.
    #[serde(skip)]
    pub(crate) gate_exempt: bool,

    /// Non-reserved keys, passed through unchanged.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// A normalized action: `{type, payload, meta}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action type. Always a non-empty string after normalization.
    #[serde(rename = "type")]
    pub action_type: String,

    /// Arbitrary payload.
    #[serde(default)]
    pub payload: Value,

    /// Routing and extension metadata.
    #[serde(default)]
    pub meta: ActionMeta,
}

impl Action {
    /// Create an action with a null payload.
    #[must_use]
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: Value::Null,
            meta: ActionMeta::default(),
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Target exactly the given reducers, bypassing prefix routing.
    #[must_use]
    pub fn targeting<I, S>(mut self, reducers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.reducers = Some(reducers.into_iter().map(Into::into).collect());
        self
    }

    /// Target reducers registered under the given prefix.
    #[must_use]
    pub fn with_reducer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.meta.reducer_prefix = Some(prefix.into());
        self
    }

    /// Mark the action for the async action runner.
    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.meta.is_async = true;
        self
    }

    /// Attach a non-reserved meta entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.extra.insert(key.into(), value);
        self
    }

    /// The substring of the type before the first `.` separator, or the
    /// whole type when there is none.
    #[must_use]
    pub fn type_prefix(&self) -> &str {
        self.action_type
            .split_once('.')
            .map_or(self.action_type.as_str(), |(head, _)| head)
    }
}

/// Per-dispatch overrides merged into the normalized action's meta.
#[derive(Debug, Clone, Default)]
pub struct DispatchOpts {
    /// Override the async flag.
    pub is_async: Option<bool>,
    /// Override the exact-target reducer list.
    pub reducers: Option<Vec<String>>,
    /// Override the prefix target.
    pub reducer_prefix: Option<String>,
    /// Additional non-reserved meta entries.
    pub extra: HashMap<String, Value>,
}

/// Raw dispatch input accepted by the normalizer.
#[derive(Debug, Clone)]
pub enum RawAction {
    /// A bare type string.
    Type(String),
    /// A `(type, payload)` pair.
    WithPayload(String, Value),
    /// A JSON map carrying at least a `"type"` field.
    Map(Value),
    /// An already-shaped action (still validated).
    Full(Action),
}

impl RawAction {
    /// Canonicalize into an [`Action`].
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidActionType`] when the type field is
    /// missing, empty, or not a string.
    pub fn normalize(self) -> Result<Action, StoreError> {
        let action = match self {
            Self::Type(t) => Action::new(t),
            Self::WithPayload(t, payload) => Action::new(t).with_payload(payload),
            Self::Full(action) => action,
            Self::Map(value) => normalize_map(value)?,
        };
        if action.action_type.is_empty() {
            return Err(StoreError::InvalidActionType("empty type".into()));
        }
        Ok(action)
    }

    /// Canonicalize, then merge per-dispatch overrides into the meta.
    ///
    /// # Errors
    /// Same as [`RawAction::normalize`].
    pub fn normalize_with(self, opts: DispatchOpts) -> Result<Action, StoreError> {
        let mut action = self.normalize()?;
        if let Some(is_async) = opts.is_async {
            action.meta.is_async = is_async;
        }
        if let Some(reducers) = opts.reducers {
            action.meta.reducers = Some(reducers);
        }
        if let Some(prefix) = opts.reducer_prefix {
            action.meta.reducer_prefix = Some(prefix);
        }
        action.meta.extra.extend(opts.extra);
        Ok(action)
    }
}

fn normalize_map(value: Value) -> Result<Action, StoreError> {
    let Value::Object(mut map) = value else {
        return Err(StoreError::InvalidActionType(format!(
            "expected an object with a \"type\" field, got {value}"
        )));
    };

    let action_type = match map.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(other) => {
            return Err(StoreError::InvalidActionType(format!(
                "type must be a string, got {other}"
            )));
        }
        None => {
            return Err(StoreError::InvalidActionType(
                "object has no \"type\" field".into(),
            ));
        }
    };

    let payload = map.remove("payload").unwrap_or(Value::Null);

    let mut meta = ActionMeta::default();
    if let Some(Value::Object(meta_map)) = map.remove("meta") {
        for (key, value) in meta_map {
            match key.as_str() {
                META_ASYNC => meta.is_async = value.as_bool().unwrap_or(false),
                META_REDUCERS => {
                    if let Value::Array(names) = value {
                        meta.reducers = Some(
                            names
                                .into_iter()
                                .filter_map(|n| n.as_str().map(String::from))
                                .collect(),
                        );
                    }
                }
                META_REDUCER_PREFIX => {
                    meta.reducer_prefix = value.as_str().map(String::from);
                }
                _ => {
                    meta.extra.insert(key, value);
                }
            }
        }
    }

    Ok(Action {
        action_type,
        payload,
        meta,
    })
}

impl From<&str> for RawAction {
    fn from(t: &str) -> Self {
        Self::Type(t.to_string())
    }
}

impl From<String> for RawAction {
    fn from(t: String) -> Self {
        Self::Type(t)
    }
}

impl From<(&str, Value)> for RawAction {
    fn from((t, payload): (&str, Value)) -> Self {
        Self::WithPayload(t.to_string(), payload)
    }
}

impl From<(String, Value)> for RawAction {
    fn from((t, payload): (String, Value)) -> Self {
        Self::WithPayload(t, payload)
    }
}

impl From<Value> for RawAction {
    fn from(value: Value) -> Self {
        Self::Map(value)
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        Self::Full(action)
    }
}
