use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_RECIPIENT: &str = "nutricionista@example.com";
pub const DEFAULT_SUBJECT: &str = "Notificación de nutrIA";
pub const DEFAULT_MESSAGE: &str = "Sin mensaje";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Direct,
    Validation,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationDraft {
    pub to: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
    pub user_profile: Value,
    pub validation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEntry {
    pub timestamp: String,
    pub to: String,
    pub subject: String,
    pub message: String,
    pub user_profile: Value,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl NotificationEntry {
    fn from_draft(draft: NotificationDraft, now: DateTime<Utc>) -> Self {
        let kind = if draft.validation {
            NotificationKind::Validation
        } else {
            NotificationKind::Direct
        };
        Self {
            timestamp: now.to_rfc3339(),
            to: non_blank_or(draft.to, DEFAULT_RECIPIENT),
            subject: non_blank_or(draft.subject, DEFAULT_SUBJECT),
            message: non_blank_or(draft.message, DEFAULT_MESSAGE),
            user_profile: if draft.user_profile.is_null() {
                Value::Object(Default::default())
            } else {
                draft.user_profile
            },
            kind: kind.as_str().to_owned(),
            id: generate_entry_id(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    LocalFile,
    Console,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalFile => "local-file",
            Self::Console => "console",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationReceipt {
    pub method: DeliveryMethod,
    pub entry: NotificationEntry,
    pub path: Option<PathBuf>,
}

/// Per-day JSON array files under one directory.
pub struct NotificationLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl NotificationLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records the entry; a failed write degrades to a log line and still
    /// succeeds.
    pub async fn record(&self, draft: NotificationDraft) -> NotificationReceipt {
        let now = Utc::now();
        let entry = NotificationEntry::from_draft(draft, now);
        match self.append(&entry, now).await {
            Ok(path) => {
                info!(
                    "notification {} saved to {} (to={}, type={})",
                    entry.id,
                    path.display(),
                    entry.to,
                    entry.kind
                );
                NotificationReceipt {
                    method: DeliveryMethod::LocalFile,
                    entry,
                    path: Some(path),
                }
            }
            Err(err) => {
                warn!("failed writing notification log: {err:#}");
                info!(
                    "notification {} (console fallback) to={} subject={:?} type={} message={:?}",
                    entry.id, entry.to, entry.subject, entry.kind, entry.message
                );
                NotificationReceipt {
                    method: DeliveryMethod::Console,
                    entry,
                    path: None,
                }
            }
        }
    }

    async fn append(&self, entry: &NotificationEntry, now: DateTime<Utc>) -> Result<PathBuf> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed creating {}", self.dir.display()))?;
        let path = self.dir.join(daily_file_name(now));

        let mut entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<Vec<Value>>(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        "notification file {} is not a JSON array ({err}); starting fresh",
                        path.display()
                    );
                    Vec::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(
                    "failed reading notification file {} ({err}); starting fresh",
                    path.display()
                );
                Vec::new()
            }
        };
        entries.push(serde_json::to_value(entry).context("failed serializing notification")?);
        let rendered =
            serde_json::to_string_pretty(&entries).context("failed rendering notification log")?;
        tokio::fs::write(&path, rendered)
            .await
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(path)
    }
}

fn daily_file_name(now: DateTime<Utc>) -> String {
    format!("notification-{}.json", now.format("%Y-%m-%d"))
}

fn generate_entry_id(now: DateTime<Utc>) -> String {
    let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
    let random = Uuid::new_v4().simple().to_string();
    format!("{}{}", to_base36(millis), &random[..8])
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn non_blank_or(value: Option<String>, fallback: &str) -> String {
    value
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}
