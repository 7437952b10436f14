//! Remote transports: streamable HTTP and legacy SSE.

use std::io;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::{drain_pending, route_message, Error, Notification, PendingRequests};
use crate::{response_into_result, JsonRpcResponse};

/// Options shared by the remote transports.
///
/// `headers` are installed as reqwest default headers, so they ride on every
/// outgoing request of the transport (the SSE GET included).
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

fn build_http_client(options: &HttpOptions) -> Result<reqwest::Client, Error> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (key, value) in &options.headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| Error::Protocol(format!("invalid http header name: {key}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|_| Error::Protocol(format!("invalid http header value: {key}")))?;
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        // Avoid automatic proxy environment variable loading by default.
        .no_proxy()
        .redirect(reqwest::redirect::Policy::limited(10))
        .default_headers(headers);
    if let Some(timeout) = options.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder
        .build()
        .map_err(|err| Error::Protocol(format!("build http client failed: {err}")))
}

async fn send_with_timeout(
    req: reqwest::RequestBuilder,
    timeout: Option<Duration>,
) -> Result<reqwest::Response, Error> {
    let send = req.send();
    let resp = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| Error::Protocol("http request timed out".to_string()))?,
        None => send.await,
    };
    resp.map_err(|err| {
        Error::Protocol(format!(
            "http request failed: {}",
            redact_reqwest_error(&err)
        ))
    })
}

/// Streamable HTTP: one POST per message against a single URL.
pub(crate) struct HttpTransport {
    http: reqwest::Client,
    url: String,
    session_id: Option<String>,
    request_timeout: Option<Duration>,
}

impl HttpTransport {
    pub(crate) fn new(url: &str, options: &HttpOptions) -> Result<Self, Error> {
        Ok(Self {
            http: build_http_client(options)?,
            url: url.to_string(),
            session_id: None,
            request_timeout: options.request_timeout,
        })
    }

    async fn post(&mut self, body: &Value) -> Result<reqwest::Response, Error> {
        let mut req = self
            .http
            .post(&self.url)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(session) = self.session_id.as_deref() {
            req = req.header("mcp-session-id", session);
        }

        let resp = send_with_timeout(req, self.request_timeout).await?;

        if let Some(value) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            if self.session_id.as_deref() != Some(value) {
                self.session_id = Some(value.to_owned());
            }
        }

        if !resp.status().is_success() {
            return Err(Error::Protocol(format!("http error: {}", resp.status())));
        }
        Ok(resp)
    }

    pub(crate) async fn request(&mut self, id: u64, req: &Value) -> Result<Value, Error> {
        let resp = self.post(req).await?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            let scan = scan_stream_for_response(resp, id);
            return match self.request_timeout {
                Some(timeout) => tokio::time::timeout(timeout, scan)
                    .await
                    .map_err(|_| Error::Protocol("http response stream timed out".to_string()))?,
                None => scan.await,
            };
        }

        if !is_json_content_type(&content_type) {
            return Err(Error::Protocol(format!(
                "unexpected content-type for json response: {content_type}"
            )));
        }

        let body = resp.bytes().await.map_err(|err| {
            Error::Protocol(format!(
                "http response read failed: {}",
                redact_reqwest_error(&err)
            ))
        })?;
        if body.is_empty() {
            return Err(Error::Protocol("http response is empty".to_string()));
        }
        let response: JsonRpcResponse = serde_json::from_slice(&body)?;
        if response_id(&response) != Some(id) {
            return Err(Error::Protocol("http response id mismatch".to_string()));
        }
        response_into_result(response)
    }

    pub(crate) async fn notify(&mut self, msg: &Value) -> Result<(), Error> {
        // Notifications expect no body; 202 Accepted is the common reply.
        let _ = self.post(msg).await?;
        Ok(())
    }
}

fn response_id(response: &JsonRpcResponse) -> Option<u64> {
    response.id.as_u64()
}

/// Scan an SSE response body for the JSON-RPC response matching `id`.
async fn scan_stream_for_response(resp: reqwest::Response, id: u64) -> Result<Value, Error> {
    let stream = resp
        .bytes_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let mut reader = tokio::io::BufReader::new(StreamReader::new(stream));

    loop {
        let Some(event) = next_sse_event(&mut reader).await? else {
            return Err(Error::Protocol(
                "sse stream ended without a response".to_string(),
            ));
        };
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };
        if value.get("id").and_then(Value::as_u64) != Some(id) {
            continue;
        }
        let response: JsonRpcResponse = serde_json::from_value(value)
            .map_err(|err| Error::Protocol(format!("invalid response: {err}")))?;
        return response_into_result(response);
    }
}

/// Legacy SSE: a long-lived GET stream for server messages plus a POST
/// endpoint (announced by the server's first `endpoint` event) for client
/// messages.
pub(crate) struct SseTransport {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    request_timeout: Option<Duration>,
}

impl SseTransport {
    pub(crate) async fn connect(
        url: &str,
        options: &HttpOptions,
        pending: PendingRequests,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), Error> {
        let http = build_http_client(options)?;

        let req = http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let resp = send_with_timeout(req, options.connect_timeout).await?;

        if !resp.status().is_success() {
            return Err(Error::Protocol(format!(
                "sse connect failed: status={}",
                resp.status()
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !is_event_stream_content_type(content_type) {
            return Err(Error::Protocol(format!(
                "sse connect failed: expected content-type text/event-stream, got {content_type}"
            )));
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other));
        let mut reader = tokio::io::BufReader::new(StreamReader::new(stream));

        // The server announces where to POST before anything else.
        let endpoint = loop {
            match next_sse_event(&mut reader).await? {
                None => {
                    return Err(Error::Protocol(
                        "sse stream ended before the endpoint event".to_string(),
                    ));
                }
                Some(event) if event.name == "endpoint" => break event.data,
                Some(_) => continue,
            }
        };
        let base = reqwest::Url::parse(url)
            .map_err(|err| Error::Protocol(format!("invalid sse url: {err}")))?;
        let endpoint = base
            .join(endpoint.trim())
            .map_err(|err| Error::Protocol(format!("invalid sse endpoint: {err}")))?;

        let task = tokio::spawn(async move {
            loop {
                match next_sse_event(&mut reader).await {
                    Ok(Some(event)) => {
                        let value: Value = match serde_json::from_str(&event.data) {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        if let Err(err) = route_message(value, &pending, &notify_tx).await {
                            drain_pending(&pending, err).await;
                            return;
                        }
                    }
                    Ok(None) => {
                        drain_pending(
                            &pending,
                            Error::Protocol("server closed connection".to_string()),
                        )
                        .await;
                        return;
                    }
                    Err(err) => {
                        drain_pending(&pending, Error::Io(err)).await;
                        return;
                    }
                }
            }
        });

        Ok((
            Self {
                http,
                endpoint,
                request_timeout: options.request_timeout,
            },
            task,
        ))
    }

    pub(crate) async fn post(&mut self, msg: &Value) -> Result<(), Error> {
        let req = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(msg);
        let resp = send_with_timeout(req, self.request_timeout).await?;
        if !resp.status().is_success() {
            return Err(Error::Protocol(format!(
                "sse message post failed: status={}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct SseEvent {
    name: String,
    data: String,
}

async fn next_sse_event<R>(reader: &mut R) -> io::Result<Option<SseEvent>>
where
    R: AsyncBufRead + Unpin,
{
    let mut name: Option<String> = None;
    let mut data = String::new();
    let mut saw_field = false;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
        if trimmed.is_empty() {
            if !saw_field {
                continue;
            }
            return Ok(Some(SseEvent {
                name: name.unwrap_or_else(|| "message".to_string()),
                data,
            }));
        }
        if trimmed.starts_with(':') {
            // comment line
            continue;
        }
        saw_field = true;
        if let Some(rest) = trimmed.strip_prefix("event:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Other fields (id, retry, comments) are ignored.
    }
}

fn ends_with_ignore_ascii_case(haystack: &str, suffix: &str) -> bool {
    if suffix.len() > haystack.len() {
        return false;
    }
    haystack
        .get(haystack.len() - suffix.len()..)
        .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
}

fn media_type(content_type: &str) -> &str {
    content_type.trim().split(';').next().unwrap_or("").trim()
}

fn is_event_stream_content_type(content_type: &str) -> bool {
    media_type(content_type).eq_ignore_ascii_case("text/event-stream")
}

fn is_json_content_type(content_type: &str) -> bool {
    if content_type.trim().is_empty() {
        return true;
    }
    let ct = media_type(content_type);
    let Some((ty, subty)) = ct.split_once('/') else {
        return false;
    };
    if !ty.eq_ignore_ascii_case("application") {
        return false;
    }
    if subty.eq_ignore_ascii_case("json") {
        return true;
    }
    ends_with_ignore_ascii_case(subty, "+json")
}

fn redact_reqwest_error(err: &reqwest::Error) -> String {
    let mut msg = err.to_string();
    let Some(url) = err.url() else {
        return msg;
    };

    let full = url.as_str();
    let redacted = redact_url_for_error(url);
    msg = msg.replace(full, &redacted);
    msg
}

fn redact_url_for_error(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn content_type_helpers_handle_common_variants() {
        assert!(is_event_stream_content_type("text/event-stream"));
        assert!(is_event_stream_content_type("Text/Event-Stream"));
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));

        assert!(is_json_content_type(""));
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("Application/Json; charset=utf-8"));
        assert!(is_json_content_type("application/problem+json"));
        assert!(!is_json_content_type("text/plain"));
        assert!(!is_json_content_type("application/xml"));
    }

    #[tokio::test]
    async fn sse_events_are_parsed_with_names_and_multiline_data() {
        let sse = concat!(
            ": a comment to skip\n",
            "\n",
            "event: endpoint\n",
            "data: /messages?sessionId=abc\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\n",
            "data: \"method\":\"demo/notify\"}\n",
            "\n",
        );

        let (mut in_write, in_read) = tokio::io::duplex(1024);
        let write_task = tokio::spawn(async move {
            in_write.write_all(sse.as_bytes()).await.unwrap();
            drop(in_write);
        });
        let mut reader = tokio::io::BufReader::new(in_read);

        let first = next_sse_event(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.name, "endpoint");
        assert_eq!(first.data, "/messages?sessionId=abc");

        let second = next_sse_event(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.name, "message");
        assert_eq!(
            second.data,
            "{\"jsonrpc\":\"2.0\",\n\"method\":\"demo/notify\"}"
        );

        assert!(next_sse_event(&mut reader).await.unwrap().is_none());
        write_task.await.unwrap();
    }
}
