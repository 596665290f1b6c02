use crate::assistant::{AssistantReply, AssistantRequest, HttpLlmClient, LlmClient, run_assistant};
use crate::changes::ChangeOp;
use crate::config::ServerConfig;
use crate::errors::InvalidParamsError;
use crate::export::ExportMode;
use crate::security::canonicalize_and_enforce_within_workspace;
use crate::session::WorkbookSession;
use anyhow::{Context, Result, anyhow};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::task;

/// File-in, file-out operations for the CLI. Each call opens its own session.
#[derive(Debug, Clone)]
pub struct StatelessRuntime {
    config: ServerConfig,
}

impl StatelessRuntime {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn normalize_existing_file(&self, path: &Path) -> Result<PathBuf> {
        let resolved = self.config.resolve_path(path);
        anyhow::ensure!(
            resolved.is_file(),
            "workbook {:?} does not exist",
            resolved
        );
        Ok(resolved)
    }

    pub async fn open_session(&self, path: &Path) -> Result<WorkbookSession> {
        let path = self.normalize_existing_file(path)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("workbook.xlsx")
            .to_string();
        task::spawn_blocking(move || {
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            WorkbookSession::open(bytes, &file_name)
        })
        .await?
    }

    pub fn read_changes(&self, path: &Path) -> Result<Vec<ChangeOp>> {
        let path = self.normalize_existing_file(path)?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let list = match value {
            serde_json::Value::Object(mut object) => object
                .remove("changes")
                .ok_or_else(|| anyhow!("changes file must be an array or have a 'changes' field"))?,
            other => other,
        };
        let ops: Vec<ChangeOp> = serde_json::from_value(list).map_err(|e| {
            InvalidParamsError::new("apply", format!("invalid change list: {e}"))
                .with_path("changes")
        })?;
        if ops.is_empty() {
            return Err(InvalidParamsError::new("apply", "at least one change is required")
                .with_path("changes")
                .into());
        }
        Ok(ops)
    }

    /// Write bytes to `dest` inside the workspace, replacing any existing file atomically.
    pub fn write_output(&self, dest: &Path, bytes: &[u8], tool: &'static str) -> Result<PathBuf> {
        let dest = self.config.resolve_path(dest);
        let root = &self.config.workspace_root;
        let dest = canonicalize_and_enforce_within_workspace(root, &dest, tool, "out")?;
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("output path {:?} has no parent", dest))?;
        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to stage output in {}", parent.display()))?;
        staged.write_all(bytes)?;
        staged
            .persist(&dest)
            .map_err(|e| anyhow!("failed to write {}: {}", dest.display(), e.error))?;
        tracing::info!(path = %dest.display(), bytes = bytes.len(), "wrote workbook");
        Ok(dest)
    }

    pub async fn export(&self, session: WorkbookSession, mode: ExportMode) -> Result<Vec<u8>> {
        task::spawn_blocking(move || session.export(mode)).await?
    }

    pub fn llm_client(&self) -> Result<Box<dyn LlmClient>> {
        Ok(Box::new(HttpLlmClient::new(&self.config.assistant)?))
    }

    pub async fn chat(
        &self,
        client: &dyn LlmClient,
        session: &WorkbookSession,
        request: &AssistantRequest,
    ) -> Result<AssistantReply> {
        run_assistant(
            client,
            session.workbook(),
            session.active_sheet(),
            request,
            &self.config.assistant,
        )
        .await
    }
}
