//! Submitting item lists and consuming their event streams.

use crate::{
    error::{BoxError, Error, Result},
    store::{Keyed, KeyedStore},
};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sluice_core::{
    decoder::{DEFAULT_MAX_LINE_BYTES, EventDecoder, Received},
    types::{
        EVENT_STREAM_CONTENT_TYPE, SESSION_ID_PARAM, SESSIONS_PATH, STREAM_PATH, SessionId,
        SubmitRequest, SubmitResponse,
    },
};
use std::sync::Arc;

/// Turns a data payload into a record. The default parses the payload as
/// JSON into `R`.
pub type Parser<R> = Arc<dyn Fn(&str) -> core::result::Result<R, BoxError> + Send + Sync>;

/// What to do with a payload that cannot be turned into a keyed record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseFailurePolicy {
    /// Stop reading and return the error.
    #[default]
    Close,
    /// Log the payload and keep reading.
    Skip,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub on_parse_failure: ParseFailurePolicy,
    /// Longest event-stream line accepted before failing with
    /// [`Error::Decode`].
    pub max_line_bytes: usize,
    pub client: reqwest::Client,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            on_parse_failure: ParseFailurePolicy::default(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            client: reqwest::Client::new(),
        }
    }
}

/// Counts for a subscription that reached `end-of-stream`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subscription {
    /// Records upserted into the store.
    pub records: usize,
    /// Payloads dropped under [`ParseFailurePolicy::Skip`].
    pub skipped: usize,
    pub heartbeats: usize,
}

/// Builds the stream URL for `session_id` under `base_url`.
pub fn stream_url(base_url: &str, session_id: &str) -> String {
    format!(
        "{}{STREAM_PATH}?{SESSION_ID_PARAM}={session_id}",
        base_url.trim_end_matches('/')
    )
}

/// Submits `items` to the server at `base_url` and returns the new session
/// id.
///
/// # Errors
///
/// [`Error::Status`] if the server rejects the submission, [`Error::Http`] on
/// transport failure.
pub async fn submit(base_url: &str, items: Vec<Value>) -> Result<SessionId> {
    let url = format!("{}{SESSIONS_PATH}", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(url)
        .json(&SubmitRequest { items })
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Status { status, body });
    }

    let SubmitResponse { session_id } = response.json().await?;
    tracing::debug!(%session_id, "Session submitted");
    Ok(session_id)
}

/// Opens the event stream at `url` and upserts every record into `store`
/// until the server sends `end-of-stream`.
///
/// `parser` defaults to JSON deserialization into `R`. Parse failures close
/// the subscription; see [`subscribe_with`] to skip them instead.
///
/// # Errors
///
/// - [`Error::Status`] if the stream could not be opened (e.g. unknown or
///   already consumed session).
/// - [`Error::Parse`] / [`Error::MissingKey`] for a payload that is not a
///   keyed record.
/// - [`Error::Remote`] if the server reports a failed run.
/// - [`Error::Decode`] if the server sends a line over the length limit.
/// - [`Error::UnexpectedEof`] if the connection ends before `end-of-stream`.
pub async fn subscribe<R>(
    url: &str,
    store: &KeyedStore<R>,
    parser: Option<Parser<R>>,
) -> Result<Subscription>
where
    R: Keyed + DeserializeOwned + Send + Sync + 'static,
{
    subscribe_with(url, store, parser, &SubscribeOptions::default()).await
}

/// [`subscribe`] with an explicit HTTP client and parse-failure policy.
pub async fn subscribe_with<R>(
    url: &str,
    store: &KeyedStore<R>,
    parser: Option<Parser<R>>,
    options: &SubscribeOptions,
) -> Result<Subscription>
where
    R: Keyed + DeserializeOwned + Send + Sync + 'static,
{
    let parser: Parser<R> = match parser {
        Some(parser) => parser,
        None => Arc::new(parse_json::<R>),
    };
    subscribe_parsed(url, store, parser, options).await
}

/// [`subscribe_with`] for records built only by `parser`. `R` need not
/// implement `Deserialize`.
#[tracing::instrument(skip(store, parser, options), fields(policy = ?options.on_parse_failure))]
pub async fn subscribe_parsed<R>(
    url: &str,
    store: &KeyedStore<R>,
    parser: Parser<R>,
    options: &SubscribeOptions,
) -> Result<Subscription>
where
    R: Keyed + Send + Sync + 'static,
{
    let response = options
        .client
        .get(url)
        .header(ACCEPT, EVENT_STREAM_CONTENT_TYPE)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Status { status, body });
    }

    let mut decoder = EventDecoder::with_max_line(options.max_line_bytes);
    let mut summary = Subscription::default();
    let mut chunks = response.bytes_stream();

    while let Some(chunk) = chunks.next().await {
        for received in decoder.push(&chunk?)? {
            match received {
                Received::Message(payload) => {
                    match ingest(&payload, parser.as_ref(), store) {
                        Ok(()) => summary.records += 1,
                        Err(e) if options.on_parse_failure == ParseFailurePolicy::Skip => {
                            tracing::warn!("Skipping payload: {e}");
                            summary.skipped += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Received::Heartbeat => summary.heartbeats += 1,
                Received::EndOfStream => {
                    tracing::debug!(records = summary.records, "End of stream");
                    return Ok(summary);
                }
                Received::Error(message) => return Err(Error::Remote { message }),
                Received::Other { event, .. } => {
                    tracing::debug!("Ignoring unknown event {event:?}");
                }
            }
        }
    }

    Err(Error::UnexpectedEof)
}

fn parse_json<R: DeserializeOwned>(payload: &str) -> core::result::Result<R, BoxError> {
    Ok(serde_json::from_str(payload)?)
}

fn ingest<R>(
    payload: &str,
    parser: &(dyn Fn(&str) -> core::result::Result<R, BoxError> + Send + Sync),
    store: &KeyedStore<R>,
) -> Result<()>
where
    R: Keyed,
{
    let record = parser(payload).map_err(|e| Error::Parse {
        payload: payload.to_string(),
        reason: e.to_string(),
    })?;
    let key = record.key().ok_or_else(|| Error::MissingKey {
        payload: payload.to_string(),
    })?;
    store.upsert(key, record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        body::Body,
        http::StatusCode,
        routing::{get, post},
    };
    use bytes::Bytes;
    use core::convert::Infallible;
    use serde_json::json;
    use sluice_core::decoder::DecodeError;
    use tokio::net::TcpListener;

    /// Serves `chunks` as one event-stream body at `/stream`, plus a
    /// submission endpoint that names sessions after their item count.
    async fn serve(chunks: Vec<&'static str>) -> String {
        let app = Router::new()
            .route(
                "/stream",
                get(move || {
                    let chunks = chunks.clone();
                    async move {
                        Body::from_stream(tokio_stream::iter(
                            chunks
                                .into_iter()
                                .map(|c| Ok::<_, Infallible>(Bytes::from_static(c.as_bytes()))),
                        ))
                    }
                }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "no such session") }),
            )
            .route(
                SESSIONS_PATH,
                post(|Json(request): Json<SubmitRequest>| async move {
                    Json(SubmitResponse {
                        session_id: format!("session-{}", request.items.len()),
                    })
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn upserts_by_key_until_end_of_stream() {
        let base = serve(vec![
            "data: {\"key\":\"x\",\"v\":1}\n\n:\n\n",
            "data: {\"key\":\"x\",\"v\":2}\n\ndata: {\"ke",
            "y\":\"y\",\"v\":3}\n\nevent: end-of-stream\ndata: \n\n",
        ])
        .await;

        let store = KeyedStore::<Value>::new();
        let summary = subscribe(&format!("{base}/stream"), &store, None)
            .await
            .unwrap();

        assert_eq!(summary.records, 3);
        assert_eq!(summary.heartbeats, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("x"), Some(json!({"key": "x", "v": 2})));
        assert_eq!(store.get("y"), Some(json!({"key": "y", "v": 3})));
    }

    #[tokio::test]
    async fn truncated_stream_is_unexpected_eof() {
        let base = serve(vec!["data: {\"key\":\"x\"}\n\n"]).await;
        let store = KeyedStore::<Value>::new();
        let err = subscribe(&format!("{base}/stream"), &store, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn error_event_is_remote_error() {
        let base = serve(vec!["event: error\ndata: Transform failed\n\n"]).await;
        let store = KeyedStore::<Value>::new();
        let err = subscribe(&format!("{base}/stream"), &store, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { message } if message == "Transform failed"));
    }

    #[tokio::test]
    async fn parse_failure_closes_by_default() {
        let base = serve(vec![
            "data: not json\n\ndata: {\"key\":\"x\"}\n\nevent: end-of-stream\ndata: \n\n",
        ])
        .await;
        let store = KeyedStore::<Value>::new();
        let err = subscribe(&format!("{base}/stream"), &store, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse { payload, .. } if payload == "not json"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn parse_failure_can_be_skipped() {
        let base = serve(vec![
            "data: not json\n\ndata: {\"v\":1}\n\ndata: {\"key\":\"x\"}\n\n",
            "event: end-of-stream\ndata: \n\n",
        ])
        .await;
        let store = KeyedStore::<Value>::new();
        let options = SubscribeOptions {
            on_parse_failure: ParseFailurePolicy::Skip,
            ..SubscribeOptions::default()
        };
        let summary = subscribe_with(&format!("{base}/stream"), &store, None, &options)
            .await
            .unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(store.get("x"), Some(json!({"key": "x"})));
    }

    #[tokio::test]
    async fn custom_parser_builds_records() {
        let base = serve(vec![
            "data: a=1\n\ndata: b=2\n\ndata: a=3\n\nevent: end-of-stream\ndata: \n\n",
        ])
        .await;
        let parser: Parser<Value> = Arc::new(|payload: &str| -> core::result::Result<Value, BoxError> {
            let (key, v) = payload.split_once('=').ok_or("missing '='")?;
            Ok(json!({ "key": key, "v": v.parse::<i64>()? }))
        });
        let store = KeyedStore::new();
        subscribe(&format!("{base}/stream"), &store, Some(parser))
            .await
            .unwrap();
        assert_eq!(store.get("a"), Some(json!({"key": "a", "v": 3})));
        assert_eq!(store.get("b"), Some(json!({"key": "b", "v": 2})));
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Tally {
        name: String,
        count: u32,
    }

    impl Keyed for Tally {
        fn key(&self) -> Option<String> {
            Some(self.name.clone())
        }
    }

    #[tokio::test]
    async fn parser_only_records_need_no_deserialize() {
        let base = serve(vec![
            "data: a 1\n\ndata: b 2\n\ndata: a 5\n\nevent: end-of-stream\ndata: \n\n",
        ])
        .await;
        let parser: Parser<Tally> =
            Arc::new(|payload: &str| -> core::result::Result<Tally, BoxError> {
                let (name, count) = payload.split_once(' ').ok_or("missing count")?;
                Ok(Tally {
                    name: name.to_string(),
                    count: count.parse()?,
                })
            });
        let store = KeyedStore::new();
        let summary = subscribe_parsed(
            &format!("{base}/stream"),
            &store,
            parser,
            &SubscribeOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(summary.records, 3);
        assert_eq!(
            store.get("a"),
            Some(Tally {
                name: "a".into(),
                count: 5
            })
        );
        assert_eq!(store.get("b").map(|t| t.count), Some(2));
    }

    #[tokio::test]
    async fn oversized_line_is_decode_error() {
        let base = serve(vec!["data: {\"key\":\"x\"}\n\n", "data: 0123456789abcdef"]).await;
        let store = KeyedStore::<Value>::new();
        let options = SubscribeOptions {
            max_line_bytes: 20,
            ..SubscribeOptions::default()
        };
        let err = subscribe_with(&format!("{base}/stream"), &store, None, &options)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Decode(DecodeError::LineTooLong { limit: 20 })
        ));
    }

    #[tokio::test]
    async fn unknown_session_reports_status() {
        let base = serve(vec![]).await;
        let store = KeyedStore::<Value>::new();
        let err = subscribe(&format!("{base}/missing"), &store, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn submit_returns_session_id() {
        let base = serve(vec![]).await;
        let id = submit(&format!("{base}/"), vec![json!("a"), json!("b")])
            .await
            .unwrap();
        assert_eq!(id, "session-2");
        assert_eq!(
            stream_url(&base, &id),
            format!("{base}/api/stream?sessionId=session-2")
        );
    }
}
