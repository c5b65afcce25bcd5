//! SSE relay between upstream and the client.
//!
//! Upstream is read in a dedicated task so downstream write-back can never
//! block read progress. Two independent timers run: a data-interval
//! watchdog keyed on monotonic upstream read time, and a downstream
//! keep-alive keyed on write time. When the client goes away the relay
//! keeps draining upstream so the usage observed in the terminal event is
//! still billed.

use std::borrow::Cow;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::model::Usage;
use crate::relay::rewrite::ModelRewrite;

/// Channel the relay writes client-bound bytes into; the HTTP layer wraps
/// the receiving end into the response body.
pub type ClientTx = mpsc::Sender<Result<Bytes, std::convert::Infallible>>;

/// Codex tool-call names corrected in flight.
const CODEX_TOOL_RENAMES: &[(&str, &str)] = &[("apply_patch", "edit")];

/// Relay tuning, copied out of the gateway config.
#[derive(Debug, Clone)]
pub struct SsePumpConfig {
    pub max_line_size: usize,
    pub data_interval_timeout: Duration,
    pub keepalive_interval: Duration,
}

/// How the upstream read side ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream closed the stream normally.
    Completed,
    /// The request's cancellation token fired.
    Cancelled,
    /// No upstream byte within the data-interval timeout.
    Stalled,
    /// A line exceeded the configured maximum.
    LineTooLong,
    ReadError(String),
}

/// Everything the recorder needs from a finished stream. All ends carry the
/// usage collected so far so partial requests still bill.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub first_token_ms: Option<u64>,
    pub client_disconnected: bool,
    pub end: StreamEnd,
}

struct ReadOutcome {
    usage: Usage,
    first_token_ms: Option<u64>,
    end: StreamEnd,
}

/// Relay an upstream SSE response to the client channel.
pub async fn pump(
    upstream: reqwest::Response,
    client: ClientTx,
    model_rewrite: Option<ModelRewrite>,
    fix_tool_calls: bool,
    cfg: SsePumpConfig,
    cancel: CancellationToken,
) -> StreamOutcome {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    let keepalive = cfg.keepalive_interval;
    let reader = tokio::spawn(read_loop(
        upstream,
        line_tx,
        model_rewrite,
        fix_tool_calls,
        cfg,
        cancel,
    ));

    let mut disconnected = false;
    let mut last_write = tokio::time::Instant::now();
    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => {
                    if !disconnected {
                        if client.send(Ok(Bytes::from(line))).await.is_err() {
                            // Client went away; keep draining upstream so
                            // the terminal usage event is still observed.
                            disconnected = true;
                        } else {
                            last_write = tokio::time::Instant::now();
                        }
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(last_write + keepalive), if !disconnected => {
                // Comment line keeps intermediate proxies from idling out.
                if client.send(Ok(Bytes::from_static(b":\n\n"))).await.is_err() {
                    disconnected = true;
                }
                last_write = tokio::time::Instant::now();
            }
        }
    }

    let read = match reader.await {
        Ok(read) => read,
        Err(e) => ReadOutcome {
            usage: Usage::default(),
            first_token_ms: None,
            end: StreamEnd::ReadError(format!("reader task failed: {e}")),
        },
    };

    // At most one protocol-conformant error event, and only while the
    // client is still attached. Cancelled/disconnected paths stay silent.
    if !disconnected {
        if let Some(event) = terminal_error_event(&read.end) {
            let _ = client.send(Ok(Bytes::from(event))).await;
        }
    }

    StreamOutcome {
        usage: read.usage,
        first_token_ms: read.first_token_ms,
        client_disconnected: disconnected,
        end: read.end,
    }
}

async fn read_loop(
    upstream: reqwest::Response,
    line_tx: mpsc::UnboundedSender<String>,
    model_rewrite: Option<ModelRewrite>,
    fix_tool_calls: bool,
    cfg: SsePumpConfig,
    cancel: CancellationToken,
) -> ReadOutcome {
    let started = tokio::time::Instant::now();
    let byte_stream = Box::pin(
        upstream
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    );
    let reader = StreamReader::new(byte_stream);
    let mut frames = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(cfg.max_line_size),
    );

    let mut usage = Usage::default();
    let mut first_token_ms = None;
    let mut last_read = tokio::time::Instant::now();

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            _ = tokio::time::sleep_until(last_read + cfg.data_interval_timeout) => {
                break StreamEnd::Stalled;
            }
            frame = frames.next() => match frame {
                None => break StreamEnd::Completed,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    break StreamEnd::LineTooLong;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    break StreamEnd::ReadError(e.to_string());
                }
                Some(Ok(line)) => {
                    last_read = tokio::time::Instant::now();
                    let line = process_line(
                        line,
                        model_rewrite.as_ref(),
                        fix_tool_calls,
                        &mut usage,
                        &mut first_token_ms,
                        started,
                    );
                    // Receiver gone means the writer side ended; keep
                    // reading for usage anyway.
                    let _ = line_tx.send(line);
                }
            }
        }
    };

    ReadOutcome {
        usage,
        first_token_ms,
        end,
    }
}

fn process_line(
    line: String,
    model_rewrite: Option<&ModelRewrite>,
    fix_tool_calls: bool,
    usage: &mut Usage,
    first_token_ms: &mut Option<u64>,
    started: tokio::time::Instant,
) -> String {
    let Some(payload) = data_payload(&line) else {
        return format!("{line}\n");
    };

    if first_token_ms.is_none() && !payload.is_empty() {
        *first_token_ms = Some(started.elapsed().as_millis() as u64);
    }

    if let Some(observed) = parse_usage_event(payload) {
        *usage = observed;
    }

    let mut out = Cow::Borrowed(line.as_str());
    if let Some(rewrite) = model_rewrite {
        if let Cow::Owned(rewritten) = rewrite_model_in_line(&out, rewrite) {
            out = Cow::Owned(rewritten);
        }
    }
    if fix_tool_calls {
        if let Cow::Owned(corrected) = correct_tool_call_names(&out) {
            out = Cow::Owned(corrected);
        }
    }
    format!("{out}\n")
}

/// Extract the payload of a `data:` line, tolerating a missing space.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Rewrite `model` / `response.model` fields via targeted text edits.
///
/// Operating on the JSON fields directly (never a full re-serialize) keeps
/// typed payloads like `thinking` blocks byte-identical.
pub fn rewrite_model_in_line<'a>(line: &'a str, rewrite: &ModelRewrite) -> Cow<'a, str> {
    if rewrite.is_identity() {
        return Cow::Borrowed(line);
    }
    let compact = format!("\"model\":\"{}\"", rewrite.upstream);
    let spaced = format!("\"model\": \"{}\"", rewrite.upstream);
    if !line.contains(compact.as_str()) && !line.contains(spaced.as_str()) {
        return Cow::Borrowed(line);
    }
    Cow::Owned(
        line.replace(
            compact.as_str(),
            &format!("\"model\":\"{}\"", rewrite.requested),
        )
        .replace(
            spaced.as_str(),
            &format!("\"model\": \"{}\"", rewrite.requested),
        ),
    )
}

/// Rename Codex-internal tool-call names to their client-visible forms.
pub fn correct_tool_call_names(line: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(line);
    for (from, to) in CODEX_TOOL_RENAMES {
        let needle = format!("\"name\":\"{from}\"");
        if out.contains(needle.as_str()) {
            out = Cow::Owned(out.replace(needle.as_str(), &format!("\"name\":\"{to}\"")));
        }
    }
    out
}

/// Apply the tool-call rename to a parsed response payload (the buffered
/// OAuth non-stream path owns its JSON, so editing the tree is fine there).
pub fn correct_tool_calls_value(response: &mut Value) {
    let Some(output) = response.get_mut("output").and_then(Value::as_array_mut) else {
        return;
    };
    for item in output {
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            continue;
        }
        let Some(name) = item.get("name").and_then(Value::as_str) else {
            continue;
        };
        if let Some((_, to)) = CODEX_TOOL_RENAMES.iter().find(|(from, _)| *from == name) {
            item["name"] = Value::String((*to).to_string());
        }
    }
}

/// Usage from a terminal `response.completed` / `response.done` event.
pub fn parse_usage_event(payload: &str) -> Option<Usage> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let kind = value.get("type")?.as_str()?;
    if kind != "response.completed" && kind != "response.done" {
        return None;
    }
    let usage = value.get("response")?.get("usage")?;
    Some(usage_from_value(usage))
}

/// Map a Responses-API usage object into token counts.
pub fn usage_from_value(usage: &Value) -> Usage {
    let get = |field: &str| usage.get(field).and_then(Value::as_u64).unwrap_or(0);
    Usage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_read_tokens: usage
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

/// Buffered-SSE fallback: extract the terminal `response` payload from an
/// SSE-shaped body (OAuth upstream answering a non-streaming client).
pub fn extract_terminal_response(text: &str) -> Option<Value> {
    for line in text.lines() {
        let Some(payload) = data_payload(line) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("response.completed") | Some("response.done") => {
                return value.get("response").cloned();
            }
            _ => {}
        }
    }
    None
}

/// Buffered-SSE fallback: best-effort usage scan over an SSE-shaped body.
pub fn scan_usage(text: &str) -> Usage {
    let mut usage = Usage::default();
    for line in text.lines() {
        if let Some(payload) = data_payload(line) {
            if let Some(observed) = parse_usage_event(payload) {
                usage = observed;
            }
        }
    }
    usage
}

/// The single terminal error event for abnormal ends. `None` for ends that
/// must stay silent.
fn terminal_error_event(end: &StreamEnd) -> Option<String> {
    let (code, message) = match end {
        StreamEnd::Stalled => ("upstream_timeout", "upstream stream stalled"),
        StreamEnd::LineTooLong => ("upstream_overflow", "upstream event exceeded size limit"),
        StreamEnd::ReadError(_) => ("upstream_error", "upstream read failed"),
        StreamEnd::Completed | StreamEnd::Cancelled => return None,
    };
    let body = serde_json::json!({
        "type": "upstream_error",
        "message": message,
        "code": code,
    });
    Some(format!("event: error\ndata: {body}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http;

    fn rewrite() -> ModelRewrite {
        ModelRewrite {
            upstream: "gpt-5.1-codex".into(),
            requested: "gpt-5-codex".into(),
        }
    }

    #[test]
    fn data_payload_tolerates_missing_space() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("event: done"), None);
        assert_eq!(data_payload(""), None);
    }

    #[test]
    fn model_rewrite_is_identity_when_models_match() {
        let rw = ModelRewrite {
            upstream: "m".into(),
            requested: "m".into(),
        };
        let line = r#"{"model":"m","x":1}"#;
        assert!(matches!(rewrite_model_in_line(line, &rw), Cow::Borrowed(_)));
    }

    #[test]
    fn model_rewrite_is_identity_when_absent() {
        let line = r#"{"type":"response.output_text.delta","delta":"hi"}"#;
        assert!(matches!(
            rewrite_model_in_line(line, &rewrite()),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn model_rewrite_replaces_field_precisely() {
        let line = r#"{"type":"response.created","response":{"model":"gpt-5.1-codex","thinking":{"raw":" "}}}"#;
        let out = rewrite_model_in_line(line, &rewrite());
        assert!(out.contains(r#""model":"gpt-5-codex""#));
        // Unrelated bytes untouched.
        assert!(out.contains(r#""thinking":{"raw":" "}"#));
    }

    #[test]
    fn model_rewrite_handles_spaced_json() {
        let line = r#"{"model": "gpt-5.1-codex"}"#;
        let out = rewrite_model_in_line(line, &rewrite());
        assert_eq!(out, r#"{"model": "gpt-5-codex"}"#);
    }

    #[test]
    fn tool_call_names_are_corrected() {
        let line = r#"{"type":"response.output_item.added","item":{"type":"function_call","name":"apply_patch"}}"#;
        let out = correct_tool_call_names(line);
        assert!(out.contains(r#""name":"edit""#));

        let untouched = r#"{"item":{"name":"read_file"}}"#;
        assert!(matches!(
            correct_tool_call_names(untouched),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn tool_call_value_correction() {
        let mut response = serde_json::json!({
            "output": [
                {"type": "function_call", "name": "apply_patch", "call_id": "c1"},
                {"type": "message", "content": []}
            ]
        });
        correct_tool_calls_value(&mut response);
        assert_eq!(response["output"][0]["name"], "edit");
    }

    #[test]
    fn usage_parsed_from_completed_event() {
        let payload = r#"{"type":"response.completed","response":{"usage":{"input_tokens":100,"output_tokens":25,"input_tokens_details":{"cached_tokens":40}}}}"#;
        let usage = parse_usage_event(payload).unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 25);
        assert_eq!(usage.cache_read_tokens, 40);
    }

    #[test]
    fn non_terminal_events_carry_no_usage() {
        assert!(parse_usage_event(r#"{"type":"response.output_text.delta"}"#).is_none());
        assert!(parse_usage_event("not json").is_none());
    }

    #[test]
    fn terminal_response_extraction() {
        let text = concat!(
            "event: response.created\n",
            "data: {\"type\":\"response.created\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"r1\",\"usage\":{\"input_tokens\":7,\"output_tokens\":3}}}\n\n",
        );
        let response = extract_terminal_response(text).unwrap();
        assert_eq!(response["id"], "r1");

        let usage = scan_usage(text);
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
    }

    // ---- pump tests ----

    fn sse_response(chunks: Vec<&'static str>) -> reqwest::Response {
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
        );
        let body = reqwest::Body::wrap_stream(stream);
        reqwest::Response::from(
            http::Response::builder()
                .status(200)
                .header("content-type", "text/event-stream")
                .body(body)
                .unwrap(),
        )
    }

    fn test_cfg() -> SsePumpConfig {
        SsePumpConfig {
            max_line_size: 64 * 1024,
            data_interval_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<Result<Bytes, std::convert::Infallible>>) -> String {
        let mut out = String::new();
        while let Some(Ok(chunk)) = rx.recv().await {
            out.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn pump_relays_and_collects_usage() {
        let upstream = sse_response(vec![
            "data: {\"type\":\"response.created\",\"response\":{\"model\":\"gpt-5.1-codex\"}}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"hello\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":11,\"output_tokens\":4}}}\n\n",
        ]);
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = pump(
            upstream,
            tx,
            Some(rewrite()),
            false,
            test_cfg(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.end, StreamEnd::Completed);
        assert!(!outcome.client_disconnected);
        assert_eq!(outcome.usage.input_tokens, 11);
        assert_eq!(outcome.usage.output_tokens, 4);
        assert!(outcome.first_token_ms.is_some());

        let body = collect(&mut rx).await;
        // Model rewritten back to the client's requested name.
        assert!(body.contains(r#""model":"gpt-5-codex""#));
        assert!(!body.contains("gpt-5.1-codex"));
        assert!(body.contains("hello"));
    }

    #[tokio::test]
    async fn pump_drains_after_client_disconnect() {
        let upstream = sse_response(vec![
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"a\"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"b\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":9,\"output_tokens\":2}}}\n\n",
        ]);
        let (tx, rx) = mpsc::channel(1);
        // Client vanishes immediately.
        drop(rx);

        let outcome = pump(
            upstream,
            tx,
            None,
            false,
            test_cfg(),
            CancellationToken::new(),
        )
        .await;

        assert!(outcome.client_disconnected);
        // Upstream was drained to the terminal event regardless.
        assert_eq!(outcome.usage.input_tokens, 9);
        assert_eq!(outcome.usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn pump_stall_emits_single_error_event() {
        // A stream that never completes: one event, then silence.
        let (body_tx, body_rx) =
            mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
        body_tx
            .send(Ok(Bytes::from_static(
                b"data: {\"type\":\"response.created\"}\n\n",
            )))
            .unwrap();
        // Keep the sender alive so the stream stays open without data.
        let upstream = reqwest::Response::from(
            http::Response::builder()
                .status(200)
                .body(reqwest::Body::wrap_stream(
                    tokio_stream::wrappers::UnboundedReceiverStream::new(body_rx),
                ))
                .unwrap(),
        );

        let cfg = SsePumpConfig {
            data_interval_timeout: Duration::from_millis(120),
            ..test_cfg()
        };
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = pump(upstream, tx, None, false, cfg, CancellationToken::new()).await;
        drop(body_tx);

        assert_eq!(outcome.end, StreamEnd::Stalled);
        let body = collect(&mut rx).await;
        assert_eq!(body.matches("event: error").count(), 1);
        assert!(body.contains("upstream_error"));
    }

    #[tokio::test]
    async fn pump_cancellation_is_silent() {
        let (body_tx, body_rx) =
            mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
        body_tx
            .send(Ok(Bytes::from_static(
                b"data: {\"type\":\"response.created\"}\n\n",
            )))
            .unwrap();
        let upstream = reqwest::Response::from(
            http::Response::builder()
                .status(200)
                .body(reqwest::Body::wrap_stream(
                    tokio_stream::wrappers::UnboundedReceiverStream::new(body_rx),
                ))
                .unwrap(),
        );

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);

        let cancel_trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_trigger.cancel();
        });

        let outcome = pump(upstream, tx, None, false, test_cfg(), cancel).await;
        drop(body_tx);

        assert_eq!(outcome.end, StreamEnd::Cancelled);
        let body = collect(&mut rx).await;
        assert!(!body.contains("event: error"));
    }

    #[tokio::test]
    async fn pump_oversize_line_stops_with_error_event() {
        let big = format!("data: {}\n\n", "x".repeat(1024));
        let chunks: Vec<&'static str> = vec![Box::leak(big.into_boxed_str())];
        let upstream = sse_response(chunks);

        let cfg = SsePumpConfig {
            max_line_size: 256,
            ..test_cfg()
        };
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = pump(upstream, tx, None, false, cfg, CancellationToken::new()).await;
        assert_eq!(outcome.end, StreamEnd::LineTooLong);
        let body = collect(&mut rx).await;
        assert!(body.contains("upstream_overflow"));
    }

    #[tokio::test]
    async fn pump_writes_keepalive_on_idle_downstream() {
        let (body_tx, body_rx) =
            mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
        let upstream = reqwest::Response::from(
            http::Response::builder()
                .status(200)
                .body(reqwest::Body::wrap_stream(
                    tokio_stream::wrappers::UnboundedReceiverStream::new(body_rx),
                ))
                .unwrap(),
        );

        let cfg = SsePumpConfig {
            keepalive_interval: Duration::from_millis(40),
            data_interval_timeout: Duration::from_millis(400),
            ..test_cfg()
        };
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = pump(upstream, tx, None, false, cfg, CancellationToken::new()).await;
        drop(body_tx);

        // The stream stalls eventually, but keep-alives flowed meanwhile.
        assert_eq!(outcome.end, StreamEnd::Stalled);
        let body = collect(&mut rx).await;
        assert!(body.contains(":\n\n"));
    }
}
