use crate::address::CellRef;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upper bound on the stored grid of one sheet (rows x columns of its used rectangle).
pub const MAX_SHEET_CELLS: u64 = 2_000_000;

/// A single cell's content as shown to the user. Formula cells carry their last computed value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
    Error { error: String },
}

impl CellValue {
    pub fn error(code: impl Into<String>) -> Self {
        CellValue::Error { error: code.into() }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Interpret free text the way a grid editor does: numbers and booleans are recognized.
    pub fn from_input(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CellValue::Empty;
        }
        if let Ok(n) = trimmed.parse::<f64>()
            && n.is_finite()
        {
            return CellValue::Number(n);
        }
        match trimmed.to_ascii_uppercase().as_str() {
            "TRUE" => CellValue::Bool(true),
            "FALSE" => CellValue::Bool(false),
            _ => CellValue::Text(raw.to_string()),
        }
    }

    /// Strings stay text; use `from_input` when the source is user-typed.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CellValue::Empty,
            serde_json::Value::Bool(b) => CellValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(CellValue::Number)
                .unwrap_or_else(|| CellValue::Text(n.to_string())),
            serde_json::Value::String(s) if s.is_empty() => CellValue::Empty,
            serde_json::Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Bool(true) => "TRUE".to_string(),
            CellValue::Bool(false) => "FALSE".to_string(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Text(s) => s.clone(),
            CellValue::Error { error } => error.clone(),
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// 0-based, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MergeRange {
    pub start_row: u32,
    pub start_col: u32,
    pub end_row: u32,
    pub end_col: u32,
}

impl MergeRange {
    pub fn to_a1(&self) -> String {
        format!(
            "{}:{}",
            CellRef::new(self.start_row, self.start_col),
            CellRef::new(self.end_row, self.end_col)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DropdownValidation {
    /// sqref as stored in the file, space separated when there are several areas.
    pub range: String,
    pub options: Vec<String>,
    /// Raw list source (`"a,b"`, `$A$1:$A$4`, a defined name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub allow_blank: bool,
    /// Position in the source file's data validation list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NamedRange {
    pub name: String,
    pub reference: String,
    /// Sheet name for sheet-local names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetData {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
    /// A1 address -> formula text including the leading `=`.
    pub formulas: IndexMap<String, String>,
    pub merges: Vec<MergeRange>,
    pub column_widths: BTreeMap<u32, f64>,
    pub row_heights: BTreeMap<u32, f64>,
    pub validations: Vec<DropdownValidation>,
}

impl SheetData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// (rows, cols) of the stored grid.
    pub fn dimensions(&self) -> (u32, u32) {
        let rows = self.rows.len() as u32;
        let cols = self.rows.iter().map(Vec::len).max().unwrap_or(0) as u32;
        (rows, cols)
    }

    pub fn get(&self, row: u32, col: u32) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.rows
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
            .unwrap_or(&EMPTY)
    }

    /// Size of the stored grid once it covers at least `rows` x `cols`.
    pub fn area_with(&self, rows: u32, cols: u32) -> u64 {
        let (r, c) = self.dimensions();
        u64::from(r.max(rows)) * u64::from(c.max(cols))
    }

    pub fn ensure_size(&mut self, rows: u32, cols: u32) {
        let width = (self.dimensions().1).max(cols) as usize;
        while self.rows.len() < rows as usize {
            self.rows.push(Vec::new());
        }
        for row in &mut self.rows {
            if row.len() < width {
                row.resize(width, CellValue::Empty);
            }
        }
    }

    pub fn set(&mut self, row: u32, col: u32, value: CellValue) {
        self.ensure_size(row + 1, col + 1);
        self.rows[row as usize][col as usize] = value;
    }

    pub fn formula_at(&self, row: u32, col: u32) -> Option<&str> {
        self.formulas
            .get(&CellRef::new(row, col).to_a1())
            .map(String::as_str)
    }

    pub fn set_formula(&mut self, row: u32, col: u32, formula: &str) {
        let text = if formula.starts_with('=') {
            formula.to_string()
        } else {
            format!("={formula}")
        };
        self.formulas.insert(CellRef::new(row, col).to_a1(), text);
        // cached value is unknown until the next evaluation
        self.set(row, col, CellValue::Empty);
    }

    pub fn clear_formula(&mut self, row: u32, col: u32) -> bool {
        self.formulas
            .shift_remove(&CellRef::new(row, col).to_a1())
            .is_some()
    }

    /// Formula cells as parsed positions, skipping keys that no longer parse.
    pub fn formula_cells(&self) -> Vec<(CellRef, String)> {
        self.formulas
            .iter()
            .filter_map(|(addr, f)| CellRef::parse(addr).ok().map(|c| (c, f.clone())))
            .collect()
    }

    pub fn non_empty_cells(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|r| r.iter())
            .filter(|v| !v.is_empty())
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedWorkbook {
    pub file_name: String,
    pub sheets: Vec<SheetData>,
    pub named_ranges: Vec<NamedRange>,
}

impl ParsedWorkbook {
    pub fn sheet(&self, name: &str) -> Option<&SheetData> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut SheetData> {
        self.sheets.iter_mut().find(|s| s.name == name)
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.sheets.iter().any(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

impl Warning {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChangeSummary {
    pub op_kinds: Vec<String>,
    pub ops_applied: u32,
    pub ops_skipped: u32,
    pub affected_sheets: Vec<String>,
    pub affected_bounds: Vec<String>,
    pub counts: BTreeMap<String, u64>,
    pub warnings: Vec<Warning>,
}

impl ChangeSummary {
    pub fn bump(&mut self, key: &str, by: u64) {
        self.counts
            .entry(key.to_string())
            .and_modify(|v| *v += by)
            .or_insert(by);
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn finish(&mut self, kinds: BTreeSet<String>, sheets: BTreeSet<String>) {
        self.op_kinds = kinds.into_iter().collect();
        self.affected_sheets = sheets.into_iter().collect();
    }

    /// Fold a later batch's summary into this one.
    pub fn absorb(&mut self, other: ChangeSummary) {
        let kinds: BTreeSet<String> = self.op_kinds.drain(..).chain(other.op_kinds).collect();
        let sheets: BTreeSet<String> = self
            .affected_sheets
            .drain(..)
            .chain(other.affected_sheets)
            .collect();
        self.finish(kinds, sheets);
        self.ops_applied += other.ops_applied;
        self.ops_skipped += other.ops_skipped;
        self.affected_bounds.extend(other.affected_bounds);
        for (key, value) in other.counts {
            self.bump(&key, value);
        }
        self.warnings.extend(other.warnings);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SheetSummary {
    pub name: String,
    pub rows: u32,
    pub columns: u32,
    pub formula_count: usize,
    pub merge_count: usize,
    pub validation_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkbookSummary {
    pub session_id: SessionId,
    pub file_name: String,
    pub active_sheet: String,
    pub revision: u64,
    pub source_sha256: String,
    pub sheets: Vec<SheetSummary>,
    pub named_ranges: Vec<NamedRange>,
}

impl From<&SheetData> for SheetSummary {
    fn from(sheet: &SheetData) -> Self {
        let (rows, columns) = sheet.dimensions();
        Self {
            name: sheet.name.clone(),
            rows,
            columns,
            formula_count: sheet.formulas.len(),
            merge_count: sheet.merges.len(),
            validation_count: sheet.validations.len(),
        }
    }
}
