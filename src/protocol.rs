use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";

pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;

// client -> relay
pub const EVENT_LIST_TOOLS: &str = "list-tools";
pub const EVENT_CALL_TOOL: &str = "call-tool";
pub const EVENT_RECONNECT: &str = "reconnect-mcp";
pub const EVENT_LIST_RESOURCES: &str = "list-resources";
pub const EVENT_GET_RESOURCE: &str = "get-resource";
pub const EVENT_CLIENT_LOG: &str = "client-log";

// relay -> client
pub const EVENT_CONNECTION_STATUS: &str = "connection-status";
pub const EVENT_TOOLS_LIST: &str = "tools-list";
pub const EVENT_TOOL_RESULT: &str = "tool-result";
pub const EVENT_RESOURCES_LIST: &str = "resources-list";
pub const EVENT_RESOURCE_DATA: &str = "resource-data";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_WORKER_NOTIFICATION: &str = "mcp-notification";

/// One line on the worker pipe. `id` absent means a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn call(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(Value::from(id)),
            method: method.to_owned(),
            params,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: method.to_owned(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.as_ref().map_or(true, Value::is_null)
    }

    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).context("failed serializing rpc request")?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).context("failed serializing rpc response")?;
        line.push('\n');
        Ok(line)
    }
}

/// Integer id carried by a worker line, if any. String ids that hold an
/// integer are accepted too.
pub fn message_id(message: &Value) -> Option<u64> {
    match message.get("id")? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

pub fn message_method(message: &Value) -> Option<&str> {
    message
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|method| !method.is_empty())
}

/// Splits a response line into its result or its error object.
pub fn response_outcome(message: &Value) -> std::result::Result<Value, RpcErrorObject> {
    if let Some(error) = message.get("error").filter(|error| !error.is_null()) {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(CODE_INTERNAL_ERROR);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or("unknown worker error")
            .to_owned();
        return Err(RpcErrorObject {
            code,
            message,
            data: error.get("data").cloned(),
        });
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

/// Frame exchanged with UI clients over the relay socket.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

pub fn parse_client_frame(text: &str) -> Result<ClientFrame> {
    let frame: ClientFrame = serde_json::from_str(text).context("invalid client frame JSON")?;
    if frame.event.trim().is_empty() {
        anyhow::bail!("client frame is missing an event name");
    }
    Ok(frame)
}

pub fn event_frame(event: &str, payload: Value) -> String {
    json!({
        "event": event,
        "payload": payload,
    })
    .to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolPayload {
    pub name: String,
    #[serde(default, alias = "args")]
    pub arguments: Value,
    #[serde(default)]
    pub request_id: Option<Value>,
}

impl CallToolPayload {
    pub fn arguments_or_empty(&self) -> Value {
        if self.arguments.is_null() {
            json!({})
        } else {
            self.arguments.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResourcePayload {
    pub uri: String,
    #[serde(default)]
    pub request_id: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClientLogPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Best-effort `requestId` lookup on a payload that failed typed parsing.
pub fn payload_request_id(payload: &Value) -> Option<Value> {
    payload
        .get("requestId")
        .filter(|value| !value.is_null())
        .cloned()
}
