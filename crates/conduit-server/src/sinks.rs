//! Concrete collaborators for the orchestration loop: tools behind an HTTP
//! webhook, JSON-lines ledgers and documents on the local disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conduit::context::ConversationContext;
use conduit::errors::{ToolError, ToolResult};
use conduit::executor::{ToolAuditRecord, ToolHistory, ToolOutput, ToolSink};
use conduit::store::ConversationStore;
use conduit::tag_parser::CapturedDocument;
use conduit::usage::{UsageRecord, UsageSink};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const MAX_ERROR_BODY: usize = 500;

/// Forwards every tool call to one HTTP endpoint, which answers with a
/// [`ToolOutput`] body.
pub struct WebhookToolSink {
    client: Client,
    url: String,
}

impl WebhookToolSink {
    pub fn new<S: Into<String>>(url: S, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ToolSink for WebhookToolSink {
    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        context: &ConversationContext,
    ) -> ToolResult<ToolOutput> {
        let payload = json!({
            "name": name,
            "arguments": arguments,
            "user_id": context.user_id,
            "project_id": context.project_id,
            "conversation_id": context.conversation_id,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("tool service unreachable: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ToolError::NotFound(name.to_string()));
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::InvalidParameters(shorten(&body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::ExecutionFailed(format!("{}: {}", status, shorten(&body))));
        }

        response
            .json::<ToolOutput>()
            .await
            .map_err(|e| ToolError::Internal(format!("unreadable tool response: {}", e)))
    }
}

fn shorten(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

/// Append-only JSON-lines file. Used for both usage records and the tool
/// audit trail.
pub struct JsonlLedger {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlLedger {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, record: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl UsageSink for JsonlLedger {
    async fn record_usage(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.append(&record).await
    }
}

#[async_trait]
impl ToolHistory for JsonlLedger {
    async fn record(&self, record: ToolAuditRecord) -> anyhow::Result<()> {
        self.append(&record).await
    }
}

/// Documents and partial responses under
/// `<root>/<project>/<conversation>/`.
pub struct FsConversationStore {
    root: PathBuf,
}

impl FsConversationStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn conversation_dir(&self, context: &ConversationContext) -> PathBuf {
        let project = context.project_id.as_deref().unwrap_or("default");
        let conversation = context.conversation_id.as_deref().unwrap_or("default");
        self.root
            .join(path_component(project))
            .join(path_component(conversation))
    }
}

/// Ids come from requests; keep them to a single safe path segment.
fn path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(80)
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl ConversationStore for FsConversationStore {
    async fn save_document(
        &self,
        context: &ConversationContext,
        document: &CapturedDocument,
    ) -> anyhow::Result<()> {
        let dir = self.conversation_dir(context).join("documents");
        tokio::fs::create_dir_all(&dir).await?;

        let stem = format!(
            "{}-{}",
            path_component(document.doc_type.as_ref()),
            path_component(&document.id)
        );
        tokio::fs::write(dir.join(format!("{}.md", stem)), &document.content).await?;
        let meta = json!({
            "id": document.id,
            "type": document.doc_type,
            "name": document.name,
            "force_closed": document.force_closed,
            "saved": Utc::now(),
        });
        tokio::fs::write(dir.join(format!("{}.json", stem)), serde_json::to_vec_pretty(&meta)?).await?;
        tracing::info!(document = %document.name, dir = %dir.display(), "saved document");
        Ok(())
    }

    async fn save_partial_response(
        &self,
        context: &ConversationContext,
        text: &str,
    ) -> anyhow::Result<()> {
        let ledger = JsonlLedger::new(self.conversation_dir(context).join("partial_responses.jsonl"));
        ledger
            .append(&json!({"text": text, "saved": Utc::now()}))
            .await
    }
}
