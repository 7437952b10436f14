use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

struct Request {
    method: String,
    path: String,
    headers: String,
    body: Vec<u8>,
}

async fn read_http_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::<u8>::new();
    let header_end = loop {
        let mut tmp = [0u8; 1024];
        let n = match socket.read(&mut tmp).await {
            Ok(0) => return None,
            Ok(n) => n,
            Err(_) => return None,
        };
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_double_crlf(&buf) {
            break pos;
        }
        if buf.len() > 1024 * 64 {
            return None;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let (method, path, content_length) = parse_request_line(&headers)?;

    let total_needed = header_end + 4 + content_length;
    while buf.len() < total_needed {
        let mut tmp = vec![0u8; total_needed - buf.len()];
        let n = match socket.read(&mut tmp).await {
            Ok(0) => return None,
            Ok(n) => n,
            Err(_) => return None,
        };
        buf.extend_from_slice(&tmp[..n]);
    }

    let body_start = header_end + 4;
    Some(Request {
        method,
        path,
        headers,
        body: buf[body_start..body_start + content_length].to_vec(),
    })
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(headers: &str) -> Option<(String, String, usize)> {
    let mut lines = headers.split("\r\n");
    let request_line = lines.next()?.trim();
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse().ok()?;
        }
    }
    Some((method, path, content_length))
}

fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    for line in headers.split("\r\n").skip(1) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim());
        }
    }
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamable_http_roundtrip_captures_session_header() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seen_headers: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let server_headers = seen_headers.clone();
    let server = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let server_headers = server_headers.clone();
            tokio::spawn(async move {
                let Some(request) = read_http_request(&mut socket).await else {
                    return;
                };
                assert_eq!(request.method, "POST");
                assert_eq!(request.path, "/mcp");
                server_headers.lock().await.push(request.headers.clone());

                let parsed: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
                let id = parsed.get("id").cloned().unwrap_or(serde_json::Value::Null);
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "ok": true },
                });
                let body = serde_json::to_vec(&response).unwrap();
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nmcp-session-id: session-123\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
            });
        }
    });

    let url = format!("http://{addr}/mcp");
    let mut client = toolbridge_jsonrpc::Client::connect_streamable_http(
        &url,
        toolbridge_jsonrpc::HttpOptions::default(),
    )
    .expect("connect streamable http");

    for _ in 0..2 {
        let result = client
            .request("ping", serde_json::json!({}))
            .await
            .expect("request ok");
        assert_eq!(result, serde_json::json!({ "ok": true }));
    }

    let headers = seen_headers.lock().await;
    assert_eq!(headers.len(), 2);
    assert!(header_value(&headers[0], "accept")
        .is_some_and(|v| v.contains("application/json") && v.contains("text/event-stream")));
    assert!(header_value(&headers[0], "mcp-session-id").is_none());
    assert_eq!(
        header_value(&headers[1], "mcp-session-id"),
        Some("session-123"),
        "second request should echo the captured session id"
    );
    drop(headers);

    drop(client);
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamable_http_reads_sse_response_bodies() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let Some(request) = read_http_request(&mut socket).await else {
                    return;
                };
                let parsed: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
                let id = parsed.get("id").cloned().unwrap_or(serde_json::Value::Null);

                let stray = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {},
                });
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "via": "sse" },
                });
                let mut body = Vec::new();
                body.extend_from_slice(b"event: message\ndata: ");
                body.extend_from_slice(&serde_json::to_vec(&stray).unwrap());
                body.extend_from_slice(b"\n\nevent: message\ndata: ");
                body.extend_from_slice(&serde_json::to_vec(&response).unwrap());
                body.extend_from_slice(b"\n\n");

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
            });
        }
    });

    let url = format!("http://{addr}/mcp");
    let mut client = toolbridge_jsonrpc::Client::connect_streamable_http(
        &url,
        toolbridge_jsonrpc::HttpOptions::default(),
    )
    .expect("connect streamable http");

    let result = client
        .request("ping", serde_json::json!({}))
        .await
        .expect("request ok");
    assert_eq!(result, serde_json::json!({ "via": "sse" }));

    drop(client);
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamable_http_surfaces_error_statuses() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let Some(_request) = read_http_request(&mut socket).await else {
                    return;
                };
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    )
                    .await;
            });
        }
    });

    let url = format!("http://{addr}/mcp");
    let mut client = toolbridge_jsonrpc::Client::connect_streamable_http(
        &url,
        toolbridge_jsonrpc::HttpOptions::default(),
    )
    .expect("connect streamable http");

    let err = client
        .request("ping", serde_json::json!({}))
        .await
        .expect_err("500 should fail the request");
    assert!(
        err.to_string().contains("http error"),
        "unexpected error: {err}"
    );

    drop(client);
    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sse_transport_roundtrip_sends_default_headers_everywhere() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    struct State {
        response_json: Mutex<Option<Vec<u8>>>,
        response_ready: Notify,
        header_seen: Mutex<Vec<String>>,
    }
    let state = Arc::new(State {
        response_json: Mutex::new(None),
        response_ready: Notify::new(),
        header_seen: Mutex::new(Vec::new()),
    });

    let server_state = state.clone();
    let server = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let server_state = server_state.clone();
            tokio::spawn(async move {
                let Some(request) = read_http_request(&mut socket).await else {
                    return;
                };
                if let Some(value) = header_value(&request.headers, "x-api-key") {
                    server_state
                        .header_seen
                        .lock()
                        .await
                        .push(format!("{} {}", request.method, value));
                }

                match (request.method.as_str(), request.path.as_str()) {
                    ("GET", "/sse") => {
                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n",
                            )
                            .await;
                        let _ = socket
                            .write_all(b"event: endpoint\ndata: /messages?session=1\n\n")
                            .await;
                        let _ = socket.flush().await;

                        let response = loop {
                            if let Some(response) =
                                server_state.response_json.lock().await.clone()
                            {
                                break response;
                            }
                            server_state.response_ready.notified().await;
                        };

                        let mut sse = Vec::new();
                        sse.extend_from_slice(b"event: message\ndata: ");
                        sse.extend_from_slice(&response);
                        sse.extend_from_slice(b"\n\n");
                        let _ = socket.write_all(&sse).await;
                        let _ = socket.flush().await;

                        // Keep the stream open until the client goes away.
                        let mut drain = [0u8; 1024];
                        let _ = tokio::time::timeout(Duration::from_secs(2), async {
                            loop {
                                match socket.read(&mut drain).await {
                                    Ok(0) => break,
                                    Ok(_) => continue,
                                    Err(_) => break,
                                }
                            }
                        })
                        .await;
                    }
                    ("POST", "/messages?session=1") => {
                        let parsed: serde_json::Value =
                            serde_json::from_slice(&request.body).unwrap();
                        let id = parsed.get("id").cloned().unwrap_or(serde_json::Value::Null);
                        let response = serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": { "ok": true },
                        });
                        *server_state.response_json.lock().await =
                            Some(serde_json::to_vec(&response).unwrap());
                        server_state.response_ready.notify_waiters();

                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            )
                            .await;
                    }
                    _ => {
                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            )
                            .await;
                    }
                }
            });
        }
    });

    let url = format!("http://{addr}/sse");
    let options = toolbridge_jsonrpc::HttpOptions {
        headers: vec![("x-api-key".to_string(), "secret-1".to_string())],
        ..Default::default()
    };
    let mut client = toolbridge_jsonrpc::Client::connect_sse(&url, options)
        .await
        .expect("connect sse");

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.request("ping", serde_json::json!({})),
    )
    .await
    .expect("request completed")
    .expect("request ok");
    assert_eq!(result, serde_json::json!({ "ok": true }));

    let seen = state.header_seen.lock().await;
    assert!(
        seen.contains(&"GET secret-1".to_string()),
        "stream GET should carry caller headers: {seen:?}"
    );
    assert!(
        seen.contains(&"POST secret-1".to_string()),
        "message POST should carry caller headers: {seen:?}"
    );
    drop(seen);

    drop(client);
    server.abort();
}
