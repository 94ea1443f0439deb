use core::{future::Future, time::Duration};
use serde_json::{Value, json};
use tower::BoxError;

/// Outcome of transforming one item: `Ok(None)` (or an empty string) means
/// the item produced nothing to emit.
pub type TransformResult = Result<Option<String>, BoxError>;

/// Asynchronous per-item work executed by the worker pool.
///
/// Implemented for any `Fn(T) -> impl Future<Output = TransformResult>`, so
/// closures can be passed directly.
pub trait Transform<T>: Send + Sync + 'static {
    fn apply(&self, item: T) -> impl Future<Output = TransformResult> + Send;
}

impl<T, F, Fut> Transform<T> for F
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransformResult> + Send,
{
    fn apply(&self, item: T) -> impl Future<Output = TransformResult> + Send {
        self(item)
    }
}

/// A work item paired with its position in the submitted list.
#[derive(Debug, Clone, PartialEq)]
pub struct Positioned<T> {
    pub position: usize,
    pub value: T,
}

impl<T> Positioned<T> {
    /// Pairs every item with its index.
    pub fn enumerate(items: Vec<T>) -> Vec<Self> {
        items
            .into_iter()
            .enumerate()
            .map(|(position, value)| Self { position, value })
            .collect()
    }
}

/// Default transform of the server binary.
///
/// Echoes each item back as a one-line JSON record keyed by the item's own
/// `key` field when present, otherwise by its position:
///
/// ```text
/// {"key":"0","position":0,"item":"a"}
/// ```
///
/// `null` items produce no event. A non-zero `latency` delays every item,
/// which is handy for watching results trickle in.
#[derive(Debug, Clone, Default)]
pub struct EchoTransform {
    latency: Duration,
}

impl EchoTransform {
    pub const fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Transform<Positioned<Value>> for EchoTransform {
    async fn apply(&self, item: Positioned<Value>) -> TransformResult {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let Positioned { position, value } = item;
        if value.is_null() {
            return Ok(None);
        }

        let key = match value.get("key") {
            Some(Value::String(key)) => key.clone(),
            Some(key) if !key.is_null() => key.to_string(),
            _ => position.to_string(),
        };
        let record = json!({ "key": key, "position": position, "item": value });
        Ok(Some(serde_json::to_string(&record)?))
    }
}
