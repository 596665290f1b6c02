use super::client::ToolDefinition;
use super::context::render_value;
use crate::address::{RangeRef, split_sheet_qualifier};
use crate::changes::ChangeOp;
use crate::model::ParsedWorkbook;
use anyhow::{Result, anyhow, bail};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::json;

pub const READ_RANGE: &str = "read_range";
const MAX_READ_CELLS: u64 = 500;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadRangeArgs {
    /// Sheet name; omit for the active sheet.
    pub sheet: Option<String>,
    /// Range in A1 notation, e.g. "A1:F40".
    pub range: String,
}

fn input_schema<T: JsonSchema>() -> serde_json::Value {
    let mut value = serde_json::to_value(schema_for!(T)).unwrap_or_default();
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    value
}

fn tool(name: &str, description: &str, input_schema: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// Input schema for one `ChangeOp` variant: its fields minus the `kind` tag, which the
/// tool name carries.
fn change_schema(root: &serde_json::Value, kind: &str) -> serde_json::Value {
    let tagged = |variant: &&serde_json::Value| {
        let tag = &variant["properties"]["kind"];
        tag["const"] == kind || tag["enum"][0] == kind
    };
    let mut schema = root["oneOf"]
        .as_array()
        .and_then(|variants| variants.iter().find(tagged))
        .cloned()
        .unwrap_or_else(|| json!({ "type": "object" }));
    if let Some(object) = schema.as_object_mut() {
        object.remove("description");
        if let Some(props) = object.get_mut("properties").and_then(|p| p.as_object_mut()) {
            props.remove("kind");
        }
        if let Some(required) = object.get_mut("required").and_then(|r| r.as_array_mut()) {
            required.retain(|field| field != "kind");
        }
        if let Some(defs) = root.get("$defs") {
            object.insert("$defs".to_string(), defs.clone());
        }
    }
    schema
}

/// One tool per change kind plus the read-only `read_range`.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    let changes = input_schema::<ChangeOp>();
    let change_tool =
        |kind: &str, description: &str| tool(kind, description, change_schema(&changes, kind));
    vec![
        change_tool("set_value", "Write a literal value into one cell."),
        change_tool("set_formula", "Write a formula into one cell."),
        change_tool(
            "insert_row",
            "Insert blank rows. References, merges and dropdowns below move down.",
        ),
        change_tool(
            "insert_column",
            "Insert blank columns. References, merges and dropdowns to the right move right.",
        ),
        change_tool(
            "apply_formula_to_range",
            "Fill a range with a formula, adjusting relative references per cell like a fill.",
        ),
        change_tool(
            "delete_row",
            "Delete rows. References into deleted cells become #REF!.",
        ),
        change_tool(
            "delete_column",
            "Delete columns. References into deleted cells become #REF!.",
        ),
        tool(
            READ_RANGE,
            "Read current values and formulas in a range, including your earlier edits.",
            input_schema::<ReadRangeArgs>(),
        ),
    ]
}

/// Render a range as `A1 = value` lines for a tool result.
pub fn read_range(
    workbook: &ParsedWorkbook,
    active_sheet: &str,
    input: &serde_json::Value,
) -> Result<String> {
    let args: ReadRangeArgs = serde_json::from_value(input.clone())
        .map_err(|e| anyhow!("invalid arguments for '{}': {}", READ_RANGE, e))?;
    let (qualifier, coords) = split_sheet_qualifier(&args.range);
    let sheet_name = args
        .sheet
        .or(qualifier)
        .unwrap_or_else(|| active_sheet.to_string());
    let sheet = workbook
        .sheet(&sheet_name)
        .ok_or_else(|| anyhow!("sheet '{}' not found", sheet_name))?;
    let range = RangeRef::parse(coords)?;
    if range.cell_count() > MAX_READ_CELLS {
        bail!(
            "range {} has {} cells; read at most {} at a time",
            range,
            range.cell_count(),
            MAX_READ_CELLS
        );
    }

    let mut lines = Vec::new();
    for cell in range.cells() {
        let value = sheet.get(cell.row, cell.col);
        match sheet.formula_at(cell.row, cell.col) {
            Some(formula) => {
                lines.push(format!("{} = {} -> {}", cell, formula, render_value(value)))
            }
            None if !value.is_empty() => lines.push(format!("{} = {}", cell, render_value(value))),
            None => {}
        }
    }
    if lines.is_empty() {
        return Ok(format!("{}!{} is empty", sheet_name, range));
    }
    Ok(lines.join("\n"))
}
