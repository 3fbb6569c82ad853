use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::correlator::{CorrelatorError, RpcCorrelator};

const CONTROL_HTTP_READ_CHUNK_BYTES: usize = 8 * 1024;
const CONTROL_HTTP_MAX_REQUEST_BYTES: usize = 12 * 1024 * 1024;
const TOOLS_ROUTE_PREFIX: &str = "/api/tools/";

#[derive(Debug)]
struct ControlHttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

struct ControlHttpState {
    correlator: Arc<RpcCorrelator>,
    cors_origin: Option<String>,
}

/// REST mirror of the WebSocket operations. Bind failures are logged and
/// end the task; the relay keeps serving WebSocket clients.
pub fn spawn(
    bind: String,
    correlator: Arc<RpcCorrelator>,
    cors_origin: Option<String>,
) -> JoinHandle<()> {
    let state = Arc::new(ControlHttpState {
        correlator,
        cors_origin,
    });
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!("control-http bind failed on {bind}: {err}");
                return;
            }
        };
        let bound = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or(bind.clone());
        info!("control-http listening on http://{bound}");
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_control_http_connection(stream, state).await {
                            warn!("control-http connection {remote_addr} failed: {err:#}");
                        }
                    });
                }
                Err(err) => {
                    warn!("control-http accept failed: {err}");
                }
            }
        }
    })
}

async fn handle_control_http_connection(
    mut stream: tokio::net::TcpStream,
    state: Arc<ControlHttpState>,
) -> Result<()> {
    let Some(request) = read_control_http_request(&mut stream).await? else {
        return Ok(());
    };
    debug!("control-http {} {}", request.method, request.path);
    let cors = state.cors_origin.as_deref();

    if request.method == "OPTIONS" {
        return write_http_response(&mut stream, 204, None, &[], cors).await;
    }

    let (status, payload) = match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/api/health") => (
            200,
            json!({
                "status": "ok",
                "mcpConnected": state.correlator.is_connected(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        ),
        ("GET", "/api/tools") => {
            outcome_response("list-tools", state.correlator.list_tools(), &state).await
        }
        ("GET", "/api/resources") => {
            outcome_response("list-resources", state.correlator.list_resources(), &state).await
        }
        ("POST", path) if path.starts_with(TOOLS_ROUTE_PREFIX) => {
            let name = path[TOOLS_ROUTE_PREFIX.len()..].trim_matches('/');
            if name.is_empty() || name.contains('/') {
                (404, json!({ "error": "not found", "path": path }))
            } else {
                match parse_tool_arguments(&request.body) {
                    Ok(arguments) => {
                        outcome_response(
                            "call-tool",
                            state.correlator.call_tool(name, arguments),
                            &state,
                        )
                        .await
                    }
                    Err(err) => (
                        400,
                        json!({ "error": "invalid request body", "details": err.to_string() }),
                    ),
                }
            }
        }
        ("GET", path) | ("POST", path) => (404, json!({ "error": "not found", "path": path })),
        _ => (405, json!({ "error": "method not allowed" })),
    };
    write_http_json_response(&mut stream, status, &payload, cors).await
}

async fn outcome_response<F>(operation: &str, call: F, state: &ControlHttpState) -> (u16, Value)
where
    F: std::future::Future<Output = Result<Value, CorrelatorError>>,
{
    if !state.correlator.is_connected() {
        return (
            500,
            json!({
                "error": "worker not connected",
                "details": CorrelatorError::NotConnected.to_string(),
            }),
        );
    }
    match call.await {
        Ok(result) => (200, result),
        Err(err) => {
            warn!("control-http {operation} failed: {err}");
            (
                500,
                json!({ "error": format!("{operation} failed"), "details": err.to_string() }),
            )
        }
    }
}

fn parse_tool_arguments(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    let parsed: Value = serde_json::from_slice(body).context("body is not valid JSON")?;
    match parsed.get("arguments") {
        None | Some(Value::Null) => Ok(json!({})),
        Some(arguments) if arguments.is_object() => Ok(arguments.clone()),
        Some(_) => anyhow::bail!("arguments must be an object"),
    }
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2))
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

async fn read_control_http_request(
    stream: &mut tokio::net::TcpStream,
) -> Result<Option<ControlHttpRequest>> {
    let mut buffer = Vec::with_capacity(CONTROL_HTTP_READ_CHUNK_BYTES);
    let mut chunk = vec![0_u8; CONTROL_HTTP_READ_CHUNK_BYTES];
    let mut header_info: Option<(usize, usize, usize)> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading control-http request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > CONTROL_HTTP_MAX_REQUEST_BYTES {
            anyhow::bail!("control-http request exceeds max size");
        }

        if header_info.is_none() {
            if let Some((header_end, separator_len)) = find_http_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_http_content_length(&headers).unwrap_or(0);
                header_info = Some((header_end, separator_len, content_length));
            }
        }
        if let Some((header_end, separator_len, content_length)) = header_info {
            if buffer.len() >= header_end + separator_len + content_length {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    let Some((header_end, separator_len, content_length)) = header_info else {
        anyhow::bail!("invalid control-http request: missing header terminator");
    };
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let mut segments = headers.lines().next().unwrap_or_default().split_whitespace();
    let method = segments.next().unwrap_or_default().to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid control-http request line");
    }
    let path_raw = segments.next().unwrap_or("/");
    let path = path_raw.split('?').next().unwrap_or(path_raw).to_owned();

    let body_start = header_end + separator_len;
    if buffer.len() < body_start + content_length {
        anyhow::bail!("truncated control-http request body");
    }
    let body = buffer[body_start..body_start + content_length].to_vec();
    Ok(Some(ControlHttpRequest { method, path, body }))
}

async fn write_http_json_response(
    stream: &mut tokio::net::TcpStream,
    status_code: u16,
    payload: &Value,
    cors_origin: Option<&str>,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing control-http JSON body")?;
    write_http_response(
        stream,
        status_code,
        Some("application/json; charset=utf-8"),
        &body,
        cors_origin,
    )
    .await
}

async fn write_http_response(
    stream: &mut tokio::net::TcpStream,
    status_code: u16,
    content_type: Option<&str>,
    body: &[u8],
    cors_origin: Option<&str>,
) -> Result<()> {
    let status_text = match status_code {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let mut head = format!("HTTP/1.1 {status_code} {status_text}\r\n");
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if let Some(origin) = cors_origin {
        head.push_str(&format!(
            "Access-Control-Allow-Origin: {origin}\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\n"
        ));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    ));
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing control-http headers")?;
    stream
        .write_all(body)
        .await
        .context("failed writing control-http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}
