//! Line-delimited and HTTP JSON-RPC 2.0 client transports.
//!
//! `Client` speaks JSON-RPC 2.0 over one of four transports:
//! - a spawned child process (newline-delimited messages on stdio),
//! - an arbitrary `AsyncRead`/`AsyncWrite` pair (`connect_io`, used by
//!   in-memory tests),
//! - streamable HTTP (one POST per request, JSON or SSE response bodies),
//! - legacy SSE (server-sent event stream plus a POST endpoint).
//!
//! The crate has no MCP knowledge; callers layer protocol semantics on top.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

mod http;

pub use http::HttpOptions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json-rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub(crate) type PendingRequests =
    Arc<tokio::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Value, Error>>>>>;

enum Transport {
    Child {
        child: Option<Child>,
        stdin: ChildStdin,
    },
    Io {
        write: Box<dyn AsyncWrite + Send + Unpin>,
    },
    Http(http::HttpTransport),
    Sse(http::SseTransport),
}

pub struct Client {
    transport: Transport,
    next_id: u64,
    pending: PendingRequests,
    notifications_rx: Option<mpsc::UnboundedReceiver<Notification>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Client {
    /// Spawn `cmd` and speak line-delimited JSON-RPC over its stdio.
    ///
    /// stdin/stdout are piped; stderr stays inherited so server diagnostics
    /// reach the host's stderr. The child is killed when the client drops.
    pub async fn spawn_command(mut cmd: Command) -> Result<Self, Error> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("child stdout not captured".to_string()))?;
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<Notification>();
        let pending: PendingRequests = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let task = spawn_reader_task(stdout, pending.clone(), notify_tx);

        Ok(Self {
            transport: Transport::Child {
                child: Some(child),
                stdin,
            },
            next_id: 1,
            pending,
            notifications_rx: Some(notify_rx),
            tasks: vec![task],
        })
    }

    /// Speak line-delimited JSON-RPC over an arbitrary stream pair.
    pub async fn connect_io<R, W>(read: R, write: W) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<Notification>();
        let pending: PendingRequests = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let task = spawn_reader_task(read, pending.clone(), notify_tx);

        Ok(Self {
            transport: Transport::Io {
                write: Box::new(write),
            },
            next_id: 1,
            pending,
            notifications_rx: Some(notify_rx),
            tasks: vec![task],
        })
    }

    /// Streamable HTTP transport: every request is an HTTP POST against `url`.
    ///
    /// No connection is established up front; the first request surfaces any
    /// reachability problem. `options.headers` become default headers on every
    /// outgoing request.
    pub fn connect_streamable_http(url: &str, options: HttpOptions) -> Result<Self, Error> {
        let transport = http::HttpTransport::new(url, &options)?;
        Ok(Self {
            transport: Transport::Http(transport),
            next_id: 1,
            pending: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            notifications_rx: None,
            tasks: Vec::new(),
        })
    }

    /// Legacy SSE transport: GET `url` for the event stream, wait for the
    /// server's `endpoint` event, then POST requests to that endpoint.
    pub async fn connect_sse(url: &str, options: HttpOptions) -> Result<Self, Error> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel::<Notification>();
        let pending: PendingRequests = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let (transport, task) =
            http::SseTransport::connect(url, &options, pending.clone(), notify_tx).await?;

        Ok(Self {
            transport: Transport::Sse(transport),
            next_id: 1,
            pending,
            notifications_rx: Some(notify_rx),
            tasks: vec![task],
        })
    }

    pub fn child_id(&self) -> Option<u32> {
        match &self.transport {
            Transport::Child { child, .. } => child.as_ref().and_then(|child| child.id()),
            _ => None,
        }
    }

    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications_rx.take()
    }

    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let mut msg = Map::new();
        msg.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        msg.insert("method".to_string(), Value::String(method.to_string()));
        msg.insert("params".to_string(), params.unwrap_or(Value::Null));
        let msg = Value::Object(msg);

        match &mut self.transport {
            Transport::Child { stdin, .. } => write_line(stdin, &msg).await,
            Transport::Io { write } => write_line(write.as_mut(), &msg).await,
            Transport::Http(http) => http.notify(&msg).await,
            Transport::Sse(sse) => sse.post(&msg).await,
        }
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, Error> {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);

        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Transport::Http(http) = &mut self.transport {
            return http.request(id, &req).await;
        }

        let (tx, rx) = oneshot::channel::<Result<Value, Error>>();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }
        let mut guard = PendingRequestGuard::new(self.pending.clone(), id);

        let sent = match &mut self.transport {
            Transport::Child { stdin, .. } => write_line(stdin, &req).await,
            Transport::Io { write } => write_line(write.as_mut(), &req).await,
            Transport::Sse(sse) => sse.post(&req).await,
            Transport::Http(_) => Err(Error::Protocol("unsupported transport".to_string())),
        };
        if let Err(err) = sent {
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            guard.disarm();
            return Err(err);
        }

        match rx.await {
            Ok(result) => {
                guard.disarm();
                result
            }
            Err(_) => Err(Error::Protocol("response channel closed".to_string())),
        }
    }

    /// Tear the channel down: abort background tasks and reap the child.
    pub async fn close(mut self) -> Result<(), Error> {
        for task in &self.tasks {
            task.abort();
        }
        if let Transport::Child { child, .. } = &mut self.transport {
            if let Some(mut child) = child.take() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_line<W>(write: &mut W, msg: &Value) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    write.flush().await?;
    Ok(())
}

struct PendingRequestGuard {
    pending: PendingRequests,
    id: u64,
    armed: bool,
}

impl PendingRequestGuard {
    fn new(pending: PendingRequests, id: u64) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRequestGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.remove(&self.id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct JsonRpcResponse {
    pub(crate) id: Value,
    #[serde(default)]
    pub(crate) result: Option<Value>,
    #[serde(default)]
    pub(crate) error: Option<JsonRpcError>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct JsonRpcError {
    pub(crate) code: i64,
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) data: Option<Value>,
}

pub(crate) fn response_into_result(response: JsonRpcResponse) -> Result<Value, Error> {
    if let Some(err) = response.error {
        return Err(Error::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    response
        .result
        .ok_or_else(|| Error::Protocol("missing result".to_string()))
}

/// Route one incoming message to the pending map or the notification channel.
///
/// Returns an error only for unrecoverable framing problems; the caller is
/// expected to drain pending requests and stop reading.
pub(crate) async fn route_message(
    value: Value,
    pending: &PendingRequests,
    notify_tx: &mpsc::UnboundedSender<Notification>,
) -> Result<(), Error> {
    if let Some(method) = value
        .get("method")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
    {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let _ = notify_tx.send(Notification { method, params });
        return Ok(());
    }

    if value.get("id").is_none() {
        return Ok(());
    }
    let response: JsonRpcResponse = serde_json::from_value(value)
        .map_err(|err| Error::Protocol(format!("invalid response: {err}")))?;

    let Some(id) = response.id.as_u64() else {
        return Ok(());
    };
    let tx = {
        let mut pending = pending.lock().await;
        pending.remove(&id)
    };
    let Some(tx) = tx else {
        return Ok(());
    };
    let _ = tx.send(response_into_result(response));
    Ok(())
}

fn spawn_reader_task<R>(
    reader: R,
    pending: PendingRequests,
    notify_tx: mpsc::UnboundedSender<Notification>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(&line) {
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
    })
}

pub(crate) async fn drain_pending(pending: &PendingRequests, err: Error) {
    let pending = {
        let mut pending = pending.lock().await;
        std::mem::take(&mut *pending)
    };

    for (_id, tx) in pending {
        let _ = tx.send(Err(Error::Protocol(err.to_string())));
    }
}
