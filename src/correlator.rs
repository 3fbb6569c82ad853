use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::line_buffer::LineBuffer;
use crate::protocol::{
    message_id, message_method, response_outcome, RpcRequest, MCP_PROTOCOL_VERSION,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::transport::{BoxedReader, BoxedWriter, WorkerLauncher};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_BYTES: usize = 8 * 1024;
const EXIT_CODE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    NotConnected,
    Timeout,
    Rpc { code: i64, message: String },
    Transport(String),
    Disconnected,
    Spawn(String),
}

impl fmt::Display for CorrelatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => f.write_str("worker not connected"),
            Self::Timeout => f.write_str("Request timeout"),
            Self::Rpc { message, .. } => f.write_str(message),
            Self::Transport(detail) => write!(f, "worker transport error: {detail}"),
            Self::Disconnected => f.write_str("worker disconnected before responding"),
            Self::Spawn(detail) => write!(f, "failed starting worker: {detail}"),
        }
    }
}

impl std::error::Error for CorrelatorError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub connected: bool,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Method-only line that matched no pending request, passed through raw.
    Notification(Value),
    Exited { generation: u64, code: Option<i32> },
}

type Completion = oneshot::Sender<Result<Value, CorrelatorError>>;

struct PendingRequest {
    method: String,
    created_at: Instant,
    tx: Completion,
}

#[derive(Default)]
struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, PendingRequest>,
}

impl PendingTable {
    fn allocate(&mut self, method: &str, tx: Completion) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            PendingRequest {
                method: method.to_owned(),
                created_at: Instant::now(),
                tx,
            },
        );
        id
    }

    fn reset(&mut self) {
        self.next_id = 0;
        self.entries.clear();
    }
}

struct WorkerSession {
    generation: u64,
    reader_task: JoinHandle<()>,
    diagnostics_task: Option<JoinHandle<()>>,
    process: Option<Child>,
}

struct Shared {
    pending: Mutex<PendingTable>,
    input: Mutex<Option<BoxedWriter>>,
    session: Mutex<Option<WorkerSession>>,
    next_generation: AtomicU64,
    status_tx: watch::Sender<WorkerStatus>,
    events_tx: broadcast::Sender<WorkerEvent>,
}

/// Owns the worker link and matches response lines to callers by id.
pub struct RpcCorrelator {
    launcher: Arc<dyn WorkerLauncher>,
    request_timeout: Duration,
    handshake: bool,
    lifecycle: Mutex<()>,
    shared: Arc<Shared>,
}

impl RpcCorrelator {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, request_timeout: Duration, handshake: bool) -> Self {
        let (status_tx, _) = watch::channel(WorkerStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            launcher,
            request_timeout,
            handshake,
            lifecycle: Mutex::new(()),
            shared: Arc::new(Shared {
                pending: Mutex::new(PendingTable::default()),
                input: Mutex::new(None),
                session: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                status_tx,
                events_tx,
            }),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn status(&self) -> WorkerStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WorkerStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events_tx.subscribe()
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.entries.len()
    }

    /// Launches a fresh worker, replacing any running one.
    pub async fn start(&self) -> Result<(), CorrelatorError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;

        let link = self
            .launcher
            .launch()
            .await
            .map_err(|err| CorrelatorError::Spawn(format!("{err:#}")))?;
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.shared.pending.lock().await.reset();
        *self.shared.input.lock().await = Some(link.input);
        {
            // Held across the spawn so an instant exit still finds its session.
            let mut session = self.shared.session.lock().await;
            let reader_task = tokio::spawn(read_worker_output(
                self.shared.clone(),
                generation,
                link.output,
            ));
            let diagnostics_task = link
                .diagnostics
                .map(|stream| tokio::spawn(relog_diagnostics(stream)));
            *session = Some(WorkerSession {
                generation,
                reader_task,
                diagnostics_task,
                process: link.process,
            });
        }
        info!(
            "worker launched ({}) generation={generation}",
            self.launcher.describe()
        );

        if self.handshake {
            if let Err(err) = self.initialize().await {
                warn!("worker handshake failed: {err}");
                self.stop_locked().await;
                return Err(err);
            }
            if let Err(err) = self.notify(METHOD_INITIALIZED, json!({})).await {
                warn!("worker handshake failed: {err}");
                self.stop_locked().await;
                return Err(err);
            }
        }

        {
            let session = self.shared.session.lock().await;
            if session.as_ref().map(|session| session.generation) != Some(generation) {
                warn!("worker generation={generation} exited during startup");
                return Err(CorrelatorError::Disconnected);
            }
            self.shared.status_tx.send_replace(WorkerStatus {
                connected: true,
                generation,
            });
        }
        info!("worker connected generation={generation}");
        Ok(())
    }

    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let session = self.shared.session.lock().await.take();
        if let Some(session) = session {
            session.reader_task.abort();
            let _ = session.reader_task.await;
            if let Some(task) = session.diagnostics_task {
                task.abort();
                let _ = task.await;
            }
            if let Some(mut child) = session.process {
                if let Err(err) = child.kill().await {
                    debug!("worker kill failed: {err}");
                }
            }
            info!("worker stopped generation={}", session.generation);
        }
        self.shared.detach().await;
    }

    /// Sends a request and waits for the matching response or the deadline.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut input = self.shared.input.lock().await;
            let Some(writer) = input.as_mut() else {
                return Err(CorrelatorError::NotConnected);
            };
            // Allocation and write share the input lock so ids hit the pipe in order.
            let id = self.shared.pending.lock().await.allocate(method, tx);
            let written = match RpcRequest::call(id, method, params).to_line() {
                Ok(line) => write_line(writer, &line).await,
                Err(err) => Err(CorrelatorError::Transport(format!("{err:#}"))),
            };
            if let Err(err) = written {
                self.shared.pending.lock().await.entries.remove(&id);
                return Err(err);
            }
            id
        };
        debug!("worker request id={id} method={method}");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CorrelatorError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().await.entries.remove(&id);
                warn!(
                    "worker request id={id} method={method} timed out after {}ms",
                    self.request_timeout.as_millis()
                );
                Err(CorrelatorError::Timeout)
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), CorrelatorError> {
        let line = RpcRequest::notification(method, params)
            .to_line()
            .map_err(|err| CorrelatorError::Transport(format!("{err:#}")))?;
        let mut input = self.shared.input.lock().await;
        let Some(writer) = input.as_mut() else {
            return Err(CorrelatorError::NotConnected);
        };
        write_line(writer, &line).await
    }

    pub async fn initialize(&self) -> Result<Value, CorrelatorError> {
        self.request(
            METHOD_INITIALIZE,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
                "clientInfo": {
                    "name": "nutria-relay",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await
    }

    pub async fn list_tools(&self) -> Result<Value, CorrelatorError> {
        self.request(METHOD_TOOLS_LIST, json!({})).await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CorrelatorError> {
        self.request(
            METHOD_TOOLS_CALL,
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    pub async fn list_resources(&self) -> Result<Value, CorrelatorError> {
        self.request(METHOD_RESOURCES_LIST, json!({})).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, CorrelatorError> {
        self.request(METHOD_RESOURCES_READ, json!({ "uri": uri })).await
    }
}

impl Drop for RpcCorrelator {
    fn drop(&mut self) {
        if let Ok(mut session) = self.shared.session.try_lock() {
            if let Some(session) = session.take() {
                session.reader_task.abort();
                if let Some(task) = session.diagnostics_task {
                    task.abort();
                }
            }
        }
    }
}

impl Shared {
    async fn dispatch_line(&self, line: &str) {
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    "dropping unparsable worker line ({err}): {}",
                    truncate_line(line, 200)
                );
                return;
            }
        };

        if let Some(id) = message_id(&message) {
            let entry = self.pending.lock().await.entries.remove(&id);
            if let Some(entry) = entry {
                debug!(
                    "worker response id={id} method={} elapsed_ms={}",
                    entry.method,
                    entry.created_at.elapsed().as_millis()
                );
                let outcome = response_outcome(&message).map_err(|err| CorrelatorError::Rpc {
                    code: err.code,
                    message: err.message,
                });
                let _ = entry.tx.send(outcome);
                return;
            }
        }

        if let Some(method) = message_method(&message) {
            debug!("worker notification method={method}");
            let _ = self.events_tx.send(WorkerEvent::Notification(message));
            return;
        }

        let stale_id = message.get("id").cloned().unwrap_or(serde_json::Value::Null);
        debug!("dropping worker response for unknown or expired id {stale_id}");
    }

    async fn detach(&self) {
        if let Some(mut writer) = self.input.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let discarded = {
            let mut pending = self.pending.lock().await;
            let count = pending.entries.len();
            pending.entries.clear();
            count
        };
        if discarded > 0 {
            debug!("discarded {discarded} pending worker requests");
        }
        self.status_tx.send_if_modified(|status| {
            let was_connected = status.connected;
            status.connected = false;
            was_connected
        });
    }

    async fn handle_worker_exit(&self, generation: u64) {
        // Teardown happens under the session lock: a concurrent start() cannot
        // install its link until this generation's input and pending are gone.
        let (session, was_connected) = {
            let mut guard = self.session.lock().await;
            let session = match guard.as_ref() {
                Some(session) if session.generation == generation => guard.take(),
                _ => None,
            };
            let Some(session) = session else {
                return;
            };
            let was_connected = {
                let status = *self.status_tx.borrow();
                status.connected && status.generation == generation
            };
            self.detach().await;
            (session, was_connected)
        };

        let mut code = None;
        if let Some(mut child) = session.process {
            code = match tokio::time::timeout(EXIT_CODE_GRACE, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => {
                    let _ = child.start_kill();
                    None
                }
            };
        }

        if !was_connected {
            return;
        }
        let superseded = self.status_tx.borrow().generation != generation;
        if superseded {
            debug!("worker generation={generation} exited after a newer worker started");
            return;
        }
        warn!("worker exited unexpectedly generation={generation} code={code:?}");
        let _ = self.events_tx.send(WorkerEvent::Exited { generation, code });
    }
}

async fn read_worker_output(shared: Arc<Shared>, generation: u64, mut output: BoxedReader) {
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        match output.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                for line in buffer.push(&chunk[..read]) {
                    shared.dispatch_line(&line).await;
                }
            }
            Err(err) => {
                warn!("worker output read failed: {err}");
                break;
            }
        }
    }
    shared.handle_worker_exit(generation).await;
}

async fn relog_diagnostics(stream: BoxedReader) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => info!("worker: {line}"),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(err) => {
                debug!("worker diagnostics stream ended: {err}");
                break;
            }
        }
    }
}

async fn write_line(writer: &mut BoxedWriter, line: &str) -> Result<(), CorrelatorError> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|err| CorrelatorError::Transport(err.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|err| CorrelatorError::Transport(err.to_string()))
}

fn truncate_line(line: &str, max_chars: usize) -> String {
    if line.chars().count() <= max_chars {
        return line.to_owned();
    }
    let mut out = line.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}
