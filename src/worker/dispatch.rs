use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::registry::ToolRegistry;
use super::tools::{ModelSelection, ToolError, ToolExecutor};
use crate::config::Config;
use crate::llm::{CompletionBackend, OpenAiCompatibleBackend};
use crate::notifications::NotificationLog;
use crate::protocol::{
    RpcRequest, RpcResponse, MCP_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST,
};

pub const WORKER_NAME: &str = "nutria-worker";

/// Request -> response over a fixed registry.
pub struct ToolDispatcher {
    registry: ToolRegistry,
    executor: Arc<ToolExecutor>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, executor: ToolExecutor) -> Self {
        Self {
            registry,
            executor: Arc::new(executor),
        }
    }

    /// Tools follow the credential: without a completion backend only
    /// `setup-required` is offered.
    pub fn with_backend(
        completions: Option<Arc<dyn CompletionBackend>>,
        notifications: NotificationLog,
        models: ModelSelection,
    ) -> Self {
        let registry = ToolRegistry::for_credentials(completions.is_some());
        Self::new(
            registry,
            ToolExecutor::new(completions, Arc::new(notifications), models),
        )
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let completions = OpenAiCompatibleBackend::from_config(&config.llm)?
            .map(|backend| Arc::new(backend) as Arc<dyn CompletionBackend>);
        Ok(Self::with_backend(
            completions,
            NotificationLog::new(config.notifications.dir.clone()),
            ModelSelection {
                chat: config.llm.chat_model.clone(),
                vision: config.llm.vision_model.clone(),
            },
        ))
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn completions_enabled(&self) -> bool {
        self.executor.has_completions()
    }

    /// `None` for notifications and for lines that do not parse.
    pub async fn handle_line(&self, line: &str) -> Option<RpcResponse> {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                warn!("skipping unparsable request line: {err}");
                return None;
            }
        };
        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: RpcRequest) -> Option<RpcResponse> {
        if request.is_notification() {
            debug!("notification {}", request.method);
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        let outcome = match request.method.as_str() {
            METHOD_INITIALIZE => Ok(initialize_result()),
            METHOD_TOOLS_LIST => Ok(json!({ "tools": self.registry.advertised() })),
            METHOD_TOOLS_CALL => self.call_tool(&request.params).await,
            other => Err(ToolError::method_not_found(other)),
        };
        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(err) => {
                debug!("request {} failed: {err}", request.method);
                RpcResponse::failure(id, err.code, err.message)
            }
        })
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, ToolError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ToolError::invalid_params("tools/call requires a tool name"))?;
        let Some(tool) = self.registry.resolve(name) else {
            return Err(ToolError::internal(format!("Herramienta no encontrada: {name}")));
        };
        let tool_name = tool.name.clone();
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(arguments) => arguments.clone(),
        };

        // A panicking tool body becomes an error response instead of ending the loop.
        let executor = self.executor.clone();
        let task_name = tool_name.clone();
        tokio::spawn(async move { executor.execute(&task_name, &arguments).await })
            .await
            .unwrap_or_else(|err| Err(ToolError::internal(format!("tool {tool_name} aborted: {err}"))))
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": WORKER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}
