use anyhow::Result;
use serde_json::{Value, json};
use std::path::PathBuf;

use crate::assistant::{AssistantRequest, LlmClient};
use crate::errors::InvalidParamsError;
use crate::export::ExportMode;
use crate::runtime::stateless::StatelessRuntime;

#[derive(Debug, Clone)]
pub struct ChatArgs {
    pub file: PathBuf,
    pub message: String,
    pub sheet: Option<String>,
    pub selection: Option<String>,
    pub out: Option<PathBuf>,
    pub apply: bool,
}

/// One assistant turn against a file. Proposed changes are only written when `apply`
/// is set and an output path is given.
pub async fn chat(
    runtime: &StatelessRuntime,
    client: &dyn LlmClient,
    args: ChatArgs,
) -> Result<Value> {
    if args.message.trim().is_empty() {
        return Err(InvalidParamsError::new("chat", "message must not be empty")
            .with_path("message")
            .into());
    }
    if args.apply && args.out.is_none() {
        return Err(InvalidParamsError::new("chat", "--apply needs --out")
            .with_path("out")
            .into());
    }

    let mut session = runtime.open_session(&args.file).await?;
    if let Some(sheet) = args.sheet.as_deref() {
        session.switch_sheet(sheet)?;
    }

    let request = AssistantRequest {
        message: args.message,
        history: Vec::new(),
        selection: args.selection,
        auto_apply: args.apply,
    };
    let mut reply = runtime.chat(client, &session, &request).await?;

    let mut written = None;
    if let (true, Some(out)) = (args.apply, args.out.as_ref())
        && !reply.changes.is_empty()
    {
        reply.summary = session.apply_changes(&reply.changes);
        reply.applied = true;
        let bytes = runtime.export(session, ExportMode::Patch).await?;
        written = Some(runtime.write_output(out, &bytes, "chat")?);
    }

    let mut payload = serde_json::to_value(&reply)?;
    if let Some(path) = written {
        payload["out"] = json!(path.display().to_string());
    }
    Ok(payload)
}
