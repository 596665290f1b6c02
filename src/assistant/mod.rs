//! Tool-calling loop that turns a chat message into a list of proposed changes.
//!
//! Every tool call is previewed on a copy of the normalized workbook, so the model sees
//! the effect of its edits (including computed formula results) before the user does.

pub mod client;
pub mod context;
pub mod tools;

pub use client::{
    CompletionRequest, CompletionResponse, ContentBlock, HttpLlmClient, LlmClient, Message, Role,
    ToolDefinition,
};
pub use context::build_context;
pub use tools::tool_definitions;

use crate::address::{CellRef, RangeRef};
use crate::changes::{ChangeOp, apply_changes, evaluate_workbook};
use crate::config::AssistantSettings;
use crate::model::{CellValue, ChangeSummary, ParsedWorkbook, Warning};
use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const WARN_TOOL_ROUNDS_EXHAUSTED: &str = "WARN_TOOL_ROUNDS_EXHAUSTED";

const SYSTEM_PROMPT: &str = "You are a spreadsheet assistant working inside a grid editor. \
Make the changes the user asks for by calling the editing tools; each call is applied to a \
preview of the workbook and the result is reported back. Rows are 1-based, columns are letters, \
and cells use A1 notation. Prefer formulas over hard-coded results when the value depends on \
other cells. Call read_range when you need cells that are not listed below. When you are done, \
reply with a short summary of what you changed.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AssistantRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    /// Range the user has selected, e.g. "B2:D8".
    #[serde(default)]
    pub selection: Option<String>,
    /// Apply the proposed changes to the session before replying.
    #[serde(default)]
    pub auto_apply: bool,
}

/// Before/after for one proposed change, as computed on the preview copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChangePreview {
    pub index: usize,
    pub kind: String,
    pub description: String,
    pub sheet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<CellValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<CellValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AssistantReply {
    pub message: String,
    pub changes: Vec<ChangeOp>,
    pub previews: Vec<ChangePreview>,
    pub summary: ChangeSummary,
    pub rounds: u32,
    #[serde(default)]
    pub applied: bool,
}

struct ToolOutcome {
    content: String,
    is_error: bool,
}

/// Run the tool loop for one user message. `workbook` is only read; changes are
/// previewed on a copy and returned for the caller to apply.
pub async fn run_assistant(
    client: &dyn LlmClient,
    workbook: &ParsedWorkbook,
    active_sheet: &str,
    request: &AssistantRequest,
    settings: &AssistantSettings,
) -> Result<AssistantReply> {
    let context = build_context(
        workbook,
        active_sheet,
        request.selection.as_deref(),
        settings.max_context_cells,
    );
    let system = format!("{SYSTEM_PROMPT}\n\n{context}");

    let mut messages: Vec<Message> = request
        .history
        .iter()
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| match turn.role {
            ChatRole::User => Message::user_text(turn.content.clone()),
            ChatRole::Assistant => Message::assistant_text(turn.content.clone()),
        })
        .collect();
    messages.push(Message::user_text(request.message.clone()));

    let tools = tool_definitions();
    let mut preview = workbook.clone();
    let mut changes = Vec::new();
    let mut previews = Vec::new();
    let mut summary = ChangeSummary::default();
    let mut final_text = String::new();
    let mut rounds = 0u32;
    let mut finished = false;

    while rounds < settings.max_tool_rounds {
        rounds += 1;
        let completion = CompletionRequest {
            model: settings.model.clone(),
            system: system.clone(),
            messages: messages.clone(),
            tools: tools.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        };
        let response = client.complete(&completion).await?;

        let text = response.text();
        if !text.trim().is_empty() {
            final_text = text;
        }

        let content: Vec<ContentBlock> = response
            .content
            .into_iter()
            .filter(|block| !matches!(block, ContentBlock::Unsupported))
            .collect();
        let calls: Vec<(String, String, serde_json::Value)> = content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();
        messages.push(Message {
            role: Role::Assistant,
            content,
        });

        if calls.is_empty() {
            finished = true;
            break;
        }

        let mut results = Vec::with_capacity(calls.len());
        for (id, name, input) in calls {
            tracing::debug!(tool = %name, round = rounds, "assistant tool call");
            let (next, outcome) = run_tool(
                preview,
                workbook,
                active_sheet,
                &name,
                input,
                &mut changes,
                &mut previews,
                &mut summary,
            )
            .await?;
            preview = next;
            results.push(ContentBlock::ToolResult {
                tool_use_id: id,
                content: outcome.content,
                is_error: outcome.is_error,
            });
        }
        messages.push(Message {
            role: Role::User,
            content: results,
        });
    }

    if !finished {
        tracing::warn!(rounds, "assistant stopped at the tool round limit");
        summary.warnings.push(Warning::new(
            WARN_TOOL_ROUNDS_EXHAUSTED,
            format!(
                "stopped after {} model rounds; the proposed changes may be incomplete",
                rounds
            ),
        ));
        if final_text.trim().is_empty() {
            final_text = format!("I stopped after {} rounds of edits.", rounds);
        }
    }

    tracing::info!(
        rounds,
        changes = changes.len(),
        warnings = summary.warnings.len(),
        "assistant finished"
    );
    Ok(AssistantReply {
        message: final_text,
        changes,
        previews,
        summary,
        rounds,
        applied: false,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_tool(
    preview: ParsedWorkbook,
    original: &ParsedWorkbook,
    active_sheet: &str,
    name: &str,
    input: serde_json::Value,
    changes: &mut Vec<ChangeOp>,
    previews: &mut Vec<ChangePreview>,
    summary: &mut ChangeSummary,
) -> Result<(ParsedWorkbook, ToolOutcome)> {
    if name == tools::READ_RANGE {
        let outcome = match tools::read_range(&preview, active_sheet, &input) {
            Ok(text) => ToolOutcome {
                content: text,
                is_error: false,
            },
            Err(e) => ToolOutcome {
                content: e.to_string(),
                is_error: true,
            },
        };
        return Ok((preview, outcome));
    }

    let op = match ChangeOp::from_tool_call(name, &input) {
        Ok(op) => op,
        Err(e) => {
            return Ok((
                preview,
                ToolOutcome {
                    content: e.to_string(),
                    is_error: true,
                },
            ));
        }
    };

    let active = active_sheet.to_string();
    let staged = op.clone();
    let (preview, outcome) = tokio::task::spawn_blocking(move || {
        let mut preview = preview;
        let outcome = apply_changes(&mut preview, None, &active, std::slice::from_ref(&staged));
        if outcome.summary.ops_applied > 0
            && let Err(e) = evaluate_workbook(&mut preview)
        {
            tracing::warn!(error = %e, "preview evaluation failed");
        }
        (preview, outcome)
    })
    .await?;

    let op_summary = outcome.summary;
    if op_summary.ops_applied == 0 {
        let message = op_summary
            .warnings
            .iter()
            .map(|w| w.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Ok((
            preview,
            ToolOutcome {
                content: message,
                is_error: true,
            },
        ));
    }

    let index = changes.len();
    let change_preview = describe_preview(index, &op, original, &preview, active_sheet);
    let mut content = format!("applied: {}", change_preview.description);
    if let (Some(target), Some(after)) = (&change_preview.target, &change_preview.after) {
        content.push_str(&format!(
            "; {} now shows {}",
            target,
            context::render_value(after)
        ));
    }
    for warning in &op_summary.warnings {
        content.push_str(&format!("\nwarning {}: {}", warning.code, warning.message));
    }

    changes.push(op);
    previews.push(change_preview);
    summary.absorb(op_summary);
    Ok((
        preview,
        ToolOutcome {
            content,
            is_error: false,
        },
    ))
}

fn describe_preview(
    index: usize,
    op: &ChangeOp,
    original: &ParsedWorkbook,
    preview: &ParsedWorkbook,
    active_sheet: &str,
) -> ChangePreview {
    let sheet = op.sheet().unwrap_or(active_sheet).to_string();
    let target = match op {
        ChangeOp::SetValue { cell, .. } | ChangeOp::SetFormula { cell, .. } => {
            CellRef::parse(cell).ok()
        }
        ChangeOp::ApplyFormulaToRange { range, .. } => RangeRef::parse(range).ok().map(|r| r.start),
        _ => None,
    };

    let mut out = ChangePreview {
        index,
        kind: op.kind().to_string(),
        description: op.describe(active_sheet),
        sheet: sheet.clone(),
        target: target.map(|c| c.to_a1()),
        before: None,
        after: None,
        formula: None,
    };
    if let Some(cell) = target {
        out.before = original
            .sheet(&sheet)
            .map(|s| s.get(cell.row, cell.col).clone());
        if let Some(s) = preview.sheet(&sheet) {
            out.after = Some(s.get(cell.row, cell.col).clone());
            out.formula = s.formula_at(cell.row, cell.col).map(str::to_string);
        }
    }
    out
}
