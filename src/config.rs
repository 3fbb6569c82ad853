use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_bind")]
    pub bind: String,
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_relay_bind(),
            http_bind: None,
            allowed_origins: default_allowed_origins(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker program. When unset the relay re-launches its own executable
    /// with the `worker` subcommand.
    #[serde(default)]
    pub command: Option<PathBuf>,
    /// Extra arguments, only used together with an explicit `command`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_handshake")]
    pub handshake: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake: default_handshake(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_llm_base_url(),
            chat_model: default_chat_model(),
            vision_model: default_vision_model(),
            timeout_ms: default_llm_timeout_ms(),
        }
    }
}

impl LlmConfig {
    /// The credential, ignoring blank values.
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notifications_dir")]
    pub dir: PathBuf,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dir: default_notifications_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            worker: WorkerConfig::default(),
            llm: LlmConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            Self::from_toml_str(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(text)?)
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>) {
        if let Some(bind) = bind.map(str::trim).filter(|value| !value.is_empty()) {
            self.relay.bind = bind.to_owned();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("PORT") {
            if let Ok(port) = v.trim().parse::<u16>() {
                self.relay.bind = format!("0.0.0.0:{port}");
            }
        }
        if let Ok(v) = env::var("NUTRIA_RELAY_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.relay.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("NUTRIA_HTTP_BIND") {
            let trimmed = v.trim();
            self.relay.http_bind = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
        if let Ok(v) = env::var("NUTRIA_ALLOWED_ORIGINS") {
            self.relay.allowed_origins = split_csv(&v);
        }
        if let Ok(v) = env::var("NUTRIA_EVENT_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.relay.event_queue_capacity = n.max(8);
            }
        }
        if let Ok(v) = env::var("NUTRIA_WORKER_COMMAND") {
            let trimmed = v.trim();
            self.worker.command = if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            };
        }
        if let Ok(v) = env::var("NUTRIA_REQUEST_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.worker.request_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("NUTRIA_WORKER_HANDSHAKE") {
            self.worker.handshake = parse_bool(&v);
        }
        if let Ok(v) = env::var("NUTRIA_LLM_API_KEY").or_else(|_| env::var("OPENAI_API_KEY")) {
            let trimmed = v.trim();
            self.llm.api_key = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            };
        }
        if let Ok(v) = env::var("NUTRIA_LLM_BASE_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.llm.base_url = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("NUTRIA_NOTIFICATIONS_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.notifications.dir = PathBuf::from(trimmed);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.bind.trim().is_empty() {
            anyhow::bail!("relay.bind must not be empty");
        }
        if self
            .relay
            .http_bind
            .as_deref()
            .is_some_and(|bind| bind.trim().is_empty())
        {
            anyhow::bail!("relay.http_bind must not be empty when provided");
        }
        if self.relay.event_queue_capacity == 0 {
            anyhow::bail!("relay.event_queue_capacity must be > 0");
        }
        for origin in &self.relay.allowed_origins {
            url::Url::parse(origin)
                .with_context(|| format!("relay.allowed_origins entry {origin:?} is not a URL"))?;
        }
        if self.worker.request_timeout_ms == 0 {
            anyhow::bail!("worker.request_timeout_ms must be > 0");
        }
        if self
            .worker
            .command
            .as_deref()
            .is_some_and(|command| command.as_os_str().is_empty())
        {
            anyhow::bail!("worker.command must not be empty when provided");
        }
        if self.llm.timeout_ms == 0 {
            anyhow::bail!("llm.timeout_ms must be > 0");
        }
        url::Url::parse(&self.llm.base_url)
            .with_context(|| format!("llm.base_url {:?} is not a URL", self.llm.base_url))?;
        if self.llm.chat_model.trim().is_empty() || self.llm.vision_model.trim().is_empty() {
            anyhow::bail!("llm.chat_model and llm.vision_model must not be empty");
        }
        Ok(())
    }
}

fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_relay_bind() -> String {
    "0.0.0.0:3001".to_owned()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_owned()]
}

fn default_event_queue_capacity() -> usize {
    64
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_handshake() -> bool {
    true
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_owned()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_owned()
}

fn default_vision_model() -> String {
    "gpt-4o".to_owned()
}

fn default_llm_timeout_ms() -> u64 {
    60_000
}

fn default_notifications_dir() -> PathBuf {
    PathBuf::from("notifications")
}
