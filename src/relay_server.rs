use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::control_http;
use crate::correlator::{RpcCorrelator, WorkerEvent};
use crate::protocol::{
    event_frame, parse_client_frame, payload_request_id, CallToolPayload, ClientFrame,
    ClientLogPayload, GetResourcePayload, EVENT_CALL_TOOL, EVENT_CLIENT_LOG,
    EVENT_CONNECTION_STATUS, EVENT_ERROR, EVENT_GET_RESOURCE, EVENT_LIST_RESOURCES,
    EVENT_LIST_TOOLS, EVENT_RECONNECT, EVENT_RESOURCES_LIST, EVENT_RESOURCE_DATA,
    EVENT_TOOLS_LIST, EVENT_TOOL_RESULT, EVENT_WORKER_NOTIFICATION,
};

const NOT_CONNECTED_MESSAGE: &str = "worker not connected";

/// WebSocket front end multiplexing UI clients onto one correlator.
pub struct RelayServer {
    relay: RelayConfig,
    correlator: Arc<RpcCorrelator>,
}

struct ServerState {
    correlator: Arc<RpcCorrelator>,
    broadcaster: RelayBroadcaster,
    allowed_origins: Arc<Vec<String>>,
    event_queue_capacity: usize,
}

impl ServerState {
    fn worker_connected(&self) -> bool {
        self.correlator.is_connected()
    }
}

#[derive(Clone)]
struct RelayBroadcaster {
    clients: Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>,
    next_client: Arc<AtomicU64>,
}

/// Reply handle scoped to one connection.
#[derive(Clone)]
struct ClientHandle {
    id: String,
    tx: mpsc::Sender<Message>,
}

impl RelayServer {
    pub fn new(relay: RelayConfig, correlator: Arc<RpcCorrelator>) -> Self {
        Self { relay, correlator }
    }

    pub async fn run_forever(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.relay.bind)
            .await
            .with_context(|| format!("failed binding relay listener on {}", self.relay.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("relay listening on ws://{bound_addr}");

        let state = Arc::new(ServerState {
            correlator: self.correlator.clone(),
            broadcaster: RelayBroadcaster::new(),
            allowed_origins: Arc::new(self.relay.allowed_origins.clone()),
            event_queue_capacity: self.relay.event_queue_capacity.max(8),
        });
        let worker_events_task = spawn_worker_event_task(state.clone());
        let http_task = self.relay.http_bind.clone().map(|bind| {
            control_http::spawn(
                bind,
                self.correlator.clone(),
                self.relay.allowed_origins.first().cloned(),
            )
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, state).await {
                                    warn!("relay connection {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("relay accept failed: {err}");
                        }
                    }
                }
            }
        }

        worker_events_task.abort();
        let _ = worker_events_task.await;
        if let Some(task) = http_task {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

impl RelayBroadcaster {
    fn new() -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_client: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_client_id(&self) -> String {
        let n = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        format!("client-{n}")
    }

    async fn register(&self, client_id: String, tx: mpsc::Sender<Message>) {
        let mut guard = self.clients.lock().await;
        guard.insert(client_id, tx);
    }

    async fn unregister(&self, client_id: &str) {
        let mut guard = self.clients.lock().await;
        guard.remove(client_id);
    }

    #[cfg(test)]
    async fn client_count(&self) -> usize {
        let guard = self.clients.lock().await;
        guard.len()
    }

    /// Queues the event for every client. Closed queues are pruned. A full
    /// queue skips the frame when `drop_if_slow`; otherwise the frame is
    /// handed to a task that waits for room, and the client stays registered.
    async fn broadcast(&self, event: &str, payload: Value, drop_if_slow: bool) {
        let frame_text = event_frame(event, payload);
        let mut stale = Vec::new();
        let mut guard = self.clients.lock().await;
        for (client_id, tx) in guard.iter() {
            match tx.try_send(Message::Text(frame_text.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stale.push(client_id.clone());
                }
                Err(mpsc::error::TrySendError::Full(message)) => {
                    if drop_if_slow {
                        debug!("dropping {event} for slow client {client_id}");
                        continue;
                    }
                    debug!("deferring {event} for slow client {client_id}");
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(message).await;
                    });
                }
            }
        }
        for client_id in stale {
            debug!("pruning relay client {client_id}");
            guard.remove(&client_id);
        }
    }
}

impl ClientHandle {
    async fn emit(&self, event: &str, payload: Value) {
        if self
            .tx
            .send(Message::Text(event_frame(event, payload)))
            .await
            .is_err()
        {
            debug!("client {} went away before {event} was delivered", self.id);
        }
    }

    async fn emit_error(&self, message: &str, details: Option<String>, request_id: Option<Value>) {
        let mut payload = json!({ "message": message });
        if let Some(details) = details {
            payload["details"] = Value::String(details);
        }
        if let Some(request_id) = request_id {
            payload["requestId"] = request_id;
        }
        self.emit(EVENT_ERROR, payload).await;
    }
}

fn spawn_worker_event_task(state: Arc<ServerState>) -> JoinHandle<()> {
    let mut events = state.correlator.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::Notification(message)) => {
                    state
                        .broadcaster
                        .broadcast(EVENT_WORKER_NOTIFICATION, message, true)
                        .await;
                }
                Ok(WorkerEvent::Exited { generation, code }) => {
                    warn!("worker generation={generation} exited code={code:?}; notifying clients");
                    state
                        .broadcaster
                        .broadcast(
                            EVENT_CONNECTION_STATUS,
                            json!({ "connected": false, "message": "worker exited" }),
                            false,
                        )
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("relay skipped {skipped} worker events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Requests without an `Origin` header (non-browser tools) are accepted; an
/// empty allow-list disables the check.
fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if allowed.is_empty() {
        return true;
    }
    let origin = origin.trim().trim_end_matches('/');
    allowed
        .iter()
        .any(|candidate| candidate.trim().trim_end_matches('/').eq_ignore_ascii_case(origin))
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let allowed_origins = state.allowed_origins.clone();
    let check_origin = move |request: &Request, response: Response| {
        let origin = request
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());
        if origin_allowed(&allowed_origins, origin) {
            return Ok(response);
        }
        warn!("rejecting relay client {remote_addr} with origin {origin:?}");
        let mut rejection = ErrorResponse::new(Some("origin not allowed".to_owned()));
        *rejection.status_mut() = StatusCode::FORBIDDEN;
        Err(rejection)
    };
    let ws = accept_hdr_async(stream, check_origin)
        .await
        .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let client_id = state.broadcaster.next_client_id();
    let (mut write, mut read) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(state.event_queue_capacity);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let client = ClientHandle {
        id: client_id.clone(),
        tx: out_tx.clone(),
    };
    state
        .broadcaster
        .register(client_id.clone(), out_tx.clone())
        .await;
    client
        .emit(
            EVENT_CONNECTION_STATUS,
            json!({ "connected": state.worker_connected(), "clientId": client_id }),
        )
        .await;
    info!("relay client connected client_id={client_id} remote={remote_addr}");

    while let Some(inbound) = read.next().await {
        let inbound = match inbound {
            Ok(message) => message,
            Err(err) => {
                debug!("relay client {client_id} read failed: {err}");
                break;
            }
        };
        match inbound {
            Message::Text(text) => {
                let frame = match parse_client_frame(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("invalid frame from {client_id}: {err:#}");
                        client
                            .emit_error("invalid frame", Some(format!("{err:#}")), None)
                            .await;
                        continue;
                    }
                };
                let state = state.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    handle_client_event(state, client, frame).await;
                });
            }
            Message::Ping(payload) => {
                let _ = out_tx.try_send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    state.broadcaster.unregister(&client_id).await;
    drop(client);
    drop(out_tx);
    // In-flight requests still hold queue senders; their replies have no reader.
    writer.abort();
    let _ = writer.await;
    info!("relay client disconnected client_id={client_id}");
    Ok(())
}

async fn handle_client_event(state: Arc<ServerState>, client: ClientHandle, frame: ClientFrame) {
    match frame.event.as_str() {
        EVENT_LIST_TOOLS => handle_list_tools(&state, &client).await,
        EVENT_CALL_TOOL => handle_call_tool(&state, &client, frame.payload).await,
        EVENT_RECONNECT => handle_reconnect(&state, &client).await,
        EVENT_LIST_RESOURCES => handle_list_resources(&state, &client).await,
        EVENT_GET_RESOURCE => handle_get_resource(&state, &client, frame.payload).await,
        EVENT_CLIENT_LOG => handle_client_log(&client, frame.payload),
        other => {
            client
                .emit_error(&format!("unknown event: {other}"), None, None)
                .await;
        }
    }
}

async fn handle_list_tools(state: &ServerState, client: &ClientHandle) {
    if !state.worker_connected() {
        client.emit_error(NOT_CONNECTED_MESSAGE, None, None).await;
        return;
    }
    match state.correlator.list_tools().await {
        Ok(result) => {
            let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
            client.emit(EVENT_TOOLS_LIST, json!({ "tools": tools })).await;
        }
        Err(err) => {
            warn!("list-tools for {} failed: {err}", client.id);
            client
                .emit_error("list-tools failed", Some(err.to_string()), None)
                .await;
        }
    }
}

async fn handle_call_tool(state: &ServerState, client: &ClientHandle, payload: Value) {
    let request: CallToolPayload = match serde_json::from_value(payload.clone()) {
        Ok(request) => request,
        Err(err) => {
            client
                .emit_error(
                    "invalid call-tool payload",
                    Some(err.to_string()),
                    payload_request_id(&payload),
                )
                .await;
            return;
        }
    };
    if !state.worker_connected() {
        client
            .emit_error(NOT_CONNECTED_MESSAGE, None, request.request_id.clone())
            .await;
        return;
    }

    info!("client {} calling tool {}", client.id, request.name);
    match state
        .correlator
        .call_tool(&request.name, request.arguments_or_empty())
        .await
    {
        Ok(result) => {
            client
                .emit(
                    EVENT_TOOL_RESULT,
                    json!({
                        "result": result,
                        "requestId": request.request_id.clone().unwrap_or(Value::Null),
                        "toolName": request.name,
                    }),
                )
                .await;
        }
        Err(err) => {
            warn!("tool {} for {} failed: {err}", request.name, client.id);
            client
                .emit_error("call-tool failed", Some(err.to_string()), request.request_id)
                .await;
        }
    }
}

async fn handle_reconnect(state: &ServerState, client: &ClientHandle) {
    info!("client {} requested worker reconnect", client.id);
    let outcome = state.correlator.start().await;
    let connected = state.worker_connected();
    let message = if outcome.is_ok() {
        "worker reconnected"
    } else {
        "worker reconnect failed"
    };
    state
        .broadcaster
        .broadcast(
            EVENT_CONNECTION_STATUS,
            json!({ "connected": connected, "message": message }),
            false,
        )
        .await;
    if let Err(err) = outcome {
        error!("worker reconnect requested by {} failed: {err}", client.id);
        client
            .emit_error("worker reconnect failed", Some(err.to_string()), None)
            .await;
    }
}

async fn handle_list_resources(state: &ServerState, client: &ClientHandle) {
    if !state.worker_connected() {
        client.emit_error(NOT_CONNECTED_MESSAGE, None, None).await;
        return;
    }
    match state.correlator.list_resources().await {
        Ok(result) => {
            let resources = result.get("resources").cloned().unwrap_or_else(|| json!([]));
            client
                .emit(EVENT_RESOURCES_LIST, json!({ "resources": resources }))
                .await;
        }
        Err(err) => {
            client
                .emit_error("list-resources failed", Some(err.to_string()), None)
                .await;
        }
    }
}

async fn handle_get_resource(state: &ServerState, client: &ClientHandle, payload: Value) {
    let request: GetResourcePayload = match serde_json::from_value(payload.clone()) {
        Ok(request) => request,
        Err(err) => {
            client
                .emit_error(
                    "invalid get-resource payload",
                    Some(err.to_string()),
                    payload_request_id(&payload),
                )
                .await;
            return;
        }
    };
    if !state.worker_connected() {
        client
            .emit_error(NOT_CONNECTED_MESSAGE, None, request.request_id)
            .await;
        return;
    }
    match state.correlator.read_resource(&request.uri).await {
        Ok(data) => {
            client
                .emit(
                    EVENT_RESOURCE_DATA,
                    json!({
                        "uri": request.uri,
                        "data": data,
                        "requestId": request.request_id.unwrap_or(Value::Null),
                    }),
                )
                .await;
        }
        Err(err) => {
            client
                .emit_error("get-resource failed", Some(err.to_string()), request.request_id)
                .await;
        }
    }
}

fn handle_client_log(client: &ClientHandle, payload: Value) {
    let log: ClientLogPayload = serde_json::from_value(payload).unwrap_or_default();
    let level = log.level.as_deref().unwrap_or("info").to_ascii_lowercase();
    match level.as_str() {
        "error" => error!("[client {}] {}", client.id, log.message),
        "warn" | "warning" => warn!("[client {}] {}", client.id, log.message),
        "debug" | "trace" => debug!("[client {}] {}", client.id, log.message),
        _ => info!("[client {}] {}", client.id, log.message),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use futures_util::{FutureExt, SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::{origin_allowed, RelayBroadcaster, RelayServer};
    use crate::config::RelayConfig;
    use crate::correlator::RpcCorrelator;
    use crate::notifications::NotificationLog;
    use crate::transport::memory::{result_line, MemoryLauncher};
    use crate::worker::tools::stub::RecordingBackend;
    use crate::worker::tools::ModelSelection;
    use crate::worker::{serve, ToolDispatcher};

    type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn reserve_bind() -> Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(addr.to_string())
    }

    fn test_relay(bind: String) -> RelayConfig {
        RelayConfig {
            bind,
            http_bind: None,
            allowed_origins: vec!["http://localhost:3000".to_owned()],
            event_queue_capacity: 16,
        }
    }

    struct RunningRelay {
        url: String,
        correlator: Arc<RpcCorrelator>,
        shutdown: Option<oneshot::Sender<()>>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    impl RunningRelay {
        async fn stop(mut self) -> Result<()> {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            self.server.await??;
            self.correlator.stop().await;
            Ok(())
        }
    }

    async fn start_relay(launcher: Arc<MemoryLauncher>, start_worker: bool) -> Result<RunningRelay> {
        let bind = reserve_bind()?;
        let correlator = Arc::new(RpcCorrelator::new(
            launcher,
            Duration::from_secs(5),
            false,
        ));
        if start_worker {
            correlator.start().await?;
        }
        let server = RelayServer::new(test_relay(bind.clone()), correlator.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            server
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        Ok(RunningRelay {
            url: format!("ws://{bind}"),
            correlator,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    async fn connect_ws_with_retry(url: &str) -> Result<ClientSocket> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..5 {
            match connect_async(url).await {
                Ok((ws, _)) => return Ok(ws),
                Err(err) => {
                    last_err = Some(err.into());
                    if attempt < 4 {
                        tokio::time::sleep(Duration::from_millis(30 * (attempt + 1) as u64)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("websocket connect failed")))
    }

    async fn next_event(ws: &mut ClientSocket) -> Result<(String, Value)> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(3), ws.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(&text)?;
                let event = frame["event"].as_str().unwrap_or_default().to_owned();
                return Ok((event, frame["payload"].clone()));
            }
        }
    }

    async fn expect_silence(ws: &mut ClientSocket, window: Duration) {
        let next = tokio::time::timeout(window, ws.next()).await;
        assert!(next.is_err(), "expected no frame, got {next:?}");
    }

    async fn send_event(ws: &mut ClientSocket, event: &str, payload: Value) -> Result<()> {
        let frame = json!({ "event": event, "payload": payload });
        ws.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    /// Scripted worker that echoes `tools/call` arguments back as text and
    /// emits a notification when asked to.
    fn echo_worker() -> Arc<MemoryLauncher> {
        MemoryLauncher::answering(|request| {
            let id = &request["id"];
            match request["method"].as_str().unwrap_or_default() {
                "tools/list" => vec![result_line(
                    id,
                    json!({ "tools": [{ "name": "chat", "description": "chat", "inputSchema": {} }] }),
                )],
                "tools/call" => {
                    let arguments = &request["params"]["arguments"];
                    let mut lines = Vec::new();
                    if arguments["announce"].as_bool() == Some(true) {
                        lines.push(format!(
                            "{}\n",
                            json!({
                                "jsonrpc": "2.0",
                                "method": "notifications/message",
                                "params": { "data": "menu updated" }
                            })
                        ));
                    }
                    lines.push(result_line(
                        id,
                        json!({ "content": [{ "type": "text", "text": arguments["message"] }] }),
                    ));
                    lines
                }
                _ => Vec::new(),
            }
        })
    }

    #[tokio::test]
    async fn call_tool_result_reaches_only_the_requesting_client() -> Result<()> {
        let relay = start_relay(echo_worker(), true).await?;
        let mut alice = connect_ws_with_retry(&relay.url).await?;
        let mut bob = connect_ws_with_retry(&relay.url).await?;

        let (event, status) = next_event(&mut alice).await?;
        assert_eq!(event, "connection-status");
        assert_eq!(status["connected"], true);
        assert!(status["clientId"].as_str().unwrap_or_default().starts_with("client-"));
        let _ = next_event(&mut bob).await?;

        send_event(
            &mut alice,
            "call-tool",
            json!({ "name": "chat", "arguments": { "message": "hello" }, "requestId": "r1" }),
        )
        .await?;
        let (event, payload) = next_event(&mut alice).await?;
        assert_eq!(event, "tool-result");
        assert_eq!(
            payload,
            json!({
                "result": { "content": [{ "type": "text", "text": "hello" }] },
                "requestId": "r1",
                "toolName": "chat"
            })
        );
        expect_silence(&mut bob, Duration::from_millis(200)).await;
        expect_silence(&mut alice, Duration::from_millis(100)).await;

        relay.stop().await
    }

    #[tokio::test]
    async fn worker_notifications_fan_out_to_every_client() -> Result<()> {
        let relay = start_relay(echo_worker(), true).await?;
        let mut alice = connect_ws_with_retry(&relay.url).await?;
        let mut bob = connect_ws_with_retry(&relay.url).await?;
        let _ = next_event(&mut alice).await?;
        let _ = next_event(&mut bob).await?;

        send_event(
            &mut alice,
            "call-tool",
            json!({ "name": "chat", "arguments": { "message": "hi", "announce": true }, "requestId": "r2" }),
        )
        .await?;

        let mut alice_events = Vec::new();
        for _ in 0..2 {
            alice_events.push(next_event(&mut alice).await?.0);
        }
        alice_events.sort();
        assert_eq!(alice_events, vec!["mcp-notification", "tool-result"]);

        let (event, payload) = next_event(&mut bob).await?;
        assert_eq!(event, "mcp-notification");
        assert_eq!(payload["method"], "notifications/message");
        assert_eq!(payload["params"]["data"], "menu updated");
        expect_silence(&mut bob, Duration::from_millis(200)).await;

        relay.stop().await
    }

    #[tokio::test]
    async fn requests_without_worker_fail_fast_with_not_connected() -> Result<()> {
        let launcher = echo_worker();
        let relay = start_relay(launcher.clone(), false).await?;
        let mut ws = connect_ws_with_retry(&relay.url).await?;
        let (_, status) = next_event(&mut ws).await?;
        assert_eq!(status["connected"], false);

        send_event(&mut ws, "list-tools", Value::Null).await?;
        let (event, payload) = next_event(&mut ws).await?;
        assert_eq!(event, "error");
        assert_eq!(payload["message"], "worker not connected");

        send_event(
            &mut ws,
            "call-tool",
            json!({ "name": "chat", "args": { "message": "x" }, "requestId": "r7" }),
        )
        .await?;
        let (event, payload) = next_event(&mut ws).await?;
        assert_eq!(event, "error");
        assert_eq!(payload["requestId"], "r7");
        assert_eq!(launcher.launch_count(), 0);

        relay.stop().await
    }

    #[tokio::test]
    async fn reconnect_broadcasts_status_to_all_clients() -> Result<()> {
        let launcher = echo_worker();
        let relay = start_relay(launcher.clone(), false).await?;
        let mut alice = connect_ws_with_retry(&relay.url).await?;
        let mut bob = connect_ws_with_retry(&relay.url).await?;
        let _ = next_event(&mut alice).await?;
        let _ = next_event(&mut bob).await?;

        send_event(&mut alice, "reconnect-mcp", Value::Null).await?;
        for ws in [&mut alice, &mut bob] {
            let (event, payload) = next_event(ws).await?;
            assert_eq!(event, "connection-status");
            assert_eq!(payload["connected"], true);
        }
        assert_eq!(launcher.launch_count(), 1);

        send_event(&mut bob, "list-tools", Value::Null).await?;
        let (event, payload) = next_event(&mut bob).await?;
        assert_eq!(event, "tools-list");
        assert_eq!(payload["tools"][0]["name"], "chat");

        launcher.set_refuse(true);
        send_event(&mut bob, "reconnect-mcp", Value::Null).await?;
        let (event, payload) = next_event(&mut alice).await?;
        assert_eq!(event, "connection-status");
        assert_eq!(payload["connected"], false);
        let mut bob_events = Vec::new();
        for _ in 0..2 {
            bob_events.push(next_event(&mut bob).await?.0);
        }
        bob_events.sort();
        assert_eq!(bob_events, vec!["connection-status", "error"]);

        relay.stop().await
    }

    #[tokio::test]
    async fn worker_exit_is_broadcast_as_disconnected() -> Result<()> {
        let launcher = MemoryLauncher::new(|mut requests: DuplexStream, responses: DuplexStream| {
            async move {
                let mut chunk = vec![0_u8; 1024];
                let _ = requests.read(&mut chunk).await;
                drop(responses);
            }
            .boxed()
        });
        let relay = start_relay(launcher, true).await?;
        let mut alice = connect_ws_with_retry(&relay.url).await?;
        let mut bob = connect_ws_with_retry(&relay.url).await?;
        let _ = next_event(&mut alice).await?;
        let _ = next_event(&mut bob).await?;

        send_event(
            &mut alice,
            "call-tool",
            json!({ "name": "chat", "arguments": {}, "requestId": "r3" }),
        )
        .await?;

        let (event, payload) = next_event(&mut bob).await?;
        assert_eq!(event, "connection-status");
        assert_eq!(payload, json!({ "connected": false, "message": "worker exited" }));

        let mut alice_events = Vec::new();
        for _ in 0..2 {
            let (event, payload) = next_event(&mut alice).await?;
            if event == "error" {
                assert_eq!(payload["requestId"], "r3");
            }
            alice_events.push(event);
        }
        alice_events.sort();
        assert_eq!(alice_events, vec!["connection-status", "error"]);

        relay.stop().await
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_get_scoped_errors() -> Result<()> {
        let relay = start_relay(echo_worker(), true).await?;
        let mut ws = connect_ws_with_retry(&relay.url).await?;
        let _ = next_event(&mut ws).await?;

        ws.send(Message::Text("not json".to_owned())).await?;
        let (event, payload) = next_event(&mut ws).await?;
        assert_eq!(event, "error");
        assert_eq!(payload["message"], "invalid frame");

        send_event(&mut ws, "launch-rockets", json!({})).await?;
        let (event, payload) = next_event(&mut ws).await?;
        assert_eq!(event, "error");
        assert_eq!(payload["message"], "unknown event: launch-rockets");

        send_event(
            &mut ws,
            "client-log",
            json!({ "message": "rendered chat", "level": "debug", "timestamp": 1 }),
        )
        .await?;
        expect_silence(&mut ws, Duration::from_millis(150)).await;

        relay.stop().await
    }

    #[tokio::test]
    async fn relay_drives_the_real_tool_worker_end_to_end() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("nutria-e2e-{}", uuid::Uuid::new_v4().simple()));
        let notifications_dir = dir.clone();
        let launcher = MemoryLauncher::new(move |requests: DuplexStream, responses: DuplexStream| {
            let dispatcher = ToolDispatcher::with_backend(
                Some(Arc::new(RecordingBackend::replying("🥑 Prueba un bowl de avena."))),
                NotificationLog::new(notifications_dir.clone()),
                ModelSelection {
                    chat: "gpt-4o-mini".to_owned(),
                    vision: "gpt-4o".to_owned(),
                },
            );
            async move {
                let _ = serve(requests, responses, &dispatcher).await;
            }
            .boxed()
        });
        let bind = reserve_bind()?;
        let correlator = Arc::new(RpcCorrelator::new(launcher, Duration::from_secs(5), true));
        correlator.start().await?;
        let server = RelayServer::new(test_relay(bind.clone()), correlator.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            server
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let mut ws = connect_ws_with_retry(&format!("ws://{bind}")).await?;
        let (_, status) = next_event(&mut ws).await?;
        assert_eq!(status["connected"], true);

        send_event(&mut ws, "list-tools", Value::Null).await?;
        let (event, payload) = next_event(&mut ws).await?;
        assert_eq!(event, "tools-list");
        let names = payload["tools"]
            .as_array()
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| tool["name"].as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        assert_eq!(names, "chat,nutrition-advice,image-nutrition-analysis");

        send_event(
            &mut ws,
            "call-tool",
            json!({ "name": "chat", "arguments": { "message": "¿Desayuno?" }, "requestId": 41 }),
        )
        .await?;
        let (event, payload) = next_event(&mut ws).await?;
        assert_eq!(event, "tool-result");
        assert_eq!(payload["requestId"], 41);
        assert_eq!(
            payload["result"]["content"][0]["text"],
            "🥑 Prueba un bowl de avena."
        );

        send_event(
            &mut ws,
            "call-tool",
            json!({ "name": "teleport", "arguments": {}, "requestId": "r-bad" }),
        )
        .await?;
        let (event, payload) = next_event(&mut ws).await?;
        assert_eq!(event, "error");
        assert_eq!(payload["requestId"], "r-bad");
        assert!(payload["details"].as_str().unwrap_or_default().contains("teleport"));

        let _ = shutdown_tx.send(());
        server.await??;
        correlator.stop().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn foreign_origin_is_refused_during_upgrade() -> Result<()> {
        let relay = start_relay(echo_worker(), true).await?;
        // Wait for the listener with an origin-less connection first.
        let probe = connect_ws_with_retry(&relay.url).await?;
        drop(probe);

        let mut request = relay.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static("http://evil.example"));
        match connect_async(request).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 403);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("foreign origin must be refused"),
        }

        let mut request = relay.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static("http://localhost:3000"));
        let (mut ws, _) = connect_async(request).await?;
        let (event, _) = next_event(&mut ws).await?;
        assert_eq!(event, "connection-status");

        relay.stop().await
    }

    #[test]
    fn origin_matching_ignores_case_and_trailing_slash() {
        let allowed = vec!["http://localhost:3000/".to_owned()];
        assert!(origin_allowed(&allowed, Some("HTTP://LOCALHOST:3000")));
        assert!(origin_allowed(&allowed, None));
        assert!(!origin_allowed(&allowed, Some("http://localhost:3001")));
        assert!(origin_allowed(&[], Some("http://anything.example")));
    }

    #[tokio::test]
    async fn broadcaster_prunes_closed_queues_and_keeps_slow_clients() -> Result<()> {
        let broadcaster = RelayBroadcaster::new();
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        drop(closed_rx);

        broadcaster.register("client-1".to_owned(), fast_tx).await;
        broadcaster.register("client-2".to_owned(), slow_tx).await;
        broadcaster.register("client-3".to_owned(), closed_tx).await;
        assert_eq!(broadcaster.client_count().await, 3);

        broadcaster.broadcast("mcp-notification", json!({ "n": 1 }), true).await;
        assert_eq!(broadcaster.client_count().await, 2);
        broadcaster.broadcast("mcp-notification", json!({ "n": 2 }), true).await;
        assert_eq!(broadcaster.client_count().await, 2);
        broadcaster
            .broadcast("connection-status", json!({ "connected": false }), false)
            .await;
        assert_eq!(broadcaster.client_count().await, 2);

        let mut received = 0;
        while let Ok(message) = fast_rx.try_recv() {
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(&text)?;
                assert!(frame.get("event").is_some());
                received += 1;
            }
        }
        assert_eq!(received, 3);

        let mut slow_events = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(1), slow_rx.recv())
                .await?
                .ok_or_else(|| anyhow::anyhow!("slow queue closed"))?;
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(&text)?;
                slow_events.push(frame["event"].as_str().unwrap_or_default().to_owned());
            }
        }
        assert_eq!(slow_events, vec!["mcp-notification", "connection-status"]);

        broadcaster
            .broadcast("mcp-notification", json!({ "n": 3 }), true)
            .await;
        let message = tokio::time::timeout(Duration::from_secs(1), slow_rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("slow queue closed"))?;
        assert!(matches!(message, Message::Text(text) if text.contains("\"n\":3")));
        Ok(())
    }
}
