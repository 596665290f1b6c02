use crate::address::{CellRef, MAX_COLS, MAX_ROWS, RangeRef, column_index};
use crate::formula::structure::{
    adjust_index, adjust_merge, rewrite_formula, rewrite_reference, rewrite_sqref, shift_keys,
};
use crate::formula::{
    Axis, RelativeMode, StructuralChange, StructureEdit, parse_base_formula, shift_formula_ast,
};
use crate::grid::GridEngine;
use crate::model::{
    CellValue, ChangeSummary, MAX_SHEET_CELLS, ParsedWorkbook, SheetData, Warning,
};
use crate::parser::resolve_list_options;
use anyhow::{Result, anyhow, bail};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const WARN_FORMULA_PREFIX: &str = "WARN_FORMULA_PREFIX";
pub const WARN_SKIPPED_OP: &str = "WARN_SKIPPED_OP";
pub const WARN_FORMULA_SHIFT: &str = "WARN_FORMULA_SHIFT";
pub const WARN_FORMULA_REWRITE: &str = "WARN_FORMULA_REWRITE";
pub const WARN_GRID_SYNC: &str = "WARN_GRID_SYNC";

const MAX_FILL_CELLS: u64 = 50_000;

/// One structured edit, as issued by the assistant or posted by a client.
///
/// Rows are 1-based as displayed, columns are letters, cells are A1. A missing
/// `sheet` means the active sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeOp {
    SetValue {
        /// Sheet name; the active sheet when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// A1 address, e.g. `B7`.
        cell: String,
        /// Number, string, boolean or null. Strings starting with `=` are treated as formulas.
        value: serde_json::Value,
    },
    SetFormula {
        /// Sheet name; the active sheet when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// A1 address, e.g. `B7`.
        cell: String,
        /// Formula text, with or without the leading `=`.
        formula: String,
    },
    InsertRow {
        /// Sheet name; the active sheet when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// 1-based row where new rows appear; the existing row moves down.
        row: u32,
        /// How many to insert or delete; 1 when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u32>,
    },
    InsertColumn {
        /// Sheet name; the active sheet when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// Column letters where new columns appear; the existing column moves right.
        column: String,
        /// How many to insert or delete; 1 when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u32>,
    },
    ApplyFormulaToRange {
        /// Sheet name; the active sheet when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// A1 range, e.g. `D2:D20`.
        range: String,
        /// Written for the top-left cell of `range`; other cells get shifted copies.
        formula: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relative_mode: Option<RelativeMode>,
    },
    DeleteRow {
        /// Sheet name; the active sheet when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// 1-based row.
        row: u32,
        /// How many to insert or delete; 1 when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u32>,
    },
    DeleteColumn {
        /// Sheet name; the active sheet when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// Column letters, e.g. `C`.
        column: String,
        /// How many to insert or delete; 1 when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u32>,
    },
}

impl ChangeOp {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeOp::SetValue { .. } => "set_value",
            ChangeOp::SetFormula { .. } => "set_formula",
            ChangeOp::InsertRow { .. } => "insert_row",
            ChangeOp::InsertColumn { .. } => "insert_column",
            ChangeOp::ApplyFormulaToRange { .. } => "apply_formula_to_range",
            ChangeOp::DeleteRow { .. } => "delete_row",
            ChangeOp::DeleteColumn { .. } => "delete_column",
        }
    }

    pub fn sheet(&self) -> Option<&str> {
        match self {
            ChangeOp::SetValue { sheet, .. }
            | ChangeOp::SetFormula { sheet, .. }
            | ChangeOp::InsertRow { sheet, .. }
            | ChangeOp::InsertColumn { sheet, .. }
            | ChangeOp::ApplyFormulaToRange { sheet, .. }
            | ChangeOp::DeleteRow { sheet, .. }
            | ChangeOp::DeleteColumn { sheet, .. } => sheet.as_deref(),
        }
    }

    /// Decode a tool call whose name is the op kind and whose input holds the fields.
    pub fn from_tool_call(name: &str, input: &serde_json::Value) -> Result<Self> {
        let mut object = match input {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => bail!("tool input for '{}' must be an object, got {}", name, other),
        };
        object.insert("kind".to_string(), serde_json::Value::String(name.to_string()));
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| anyhow!("invalid arguments for '{}': {}", name, e))
    }

    /// Human-readable one-liner for previews and logs.
    pub fn describe(&self, active_sheet: &str) -> String {
        let sheet = self.sheet().unwrap_or(active_sheet);
        match self {
            ChangeOp::SetValue { cell, value, .. } => format!("set {sheet}!{cell} to {value}"),
            ChangeOp::SetFormula { cell, formula, .. } => {
                format!("set {sheet}!{cell} to formula {formula}")
            }
            ChangeOp::InsertRow { row, count, .. } => {
                format!("insert {} row(s) at {sheet}!{row}", count.unwrap_or(1))
            }
            ChangeOp::InsertColumn { column, count, .. } => {
                format!("insert {} column(s) at {sheet}!{column}", count.unwrap_or(1))
            }
            ChangeOp::ApplyFormulaToRange { range, formula, .. } => {
                format!("fill {sheet}!{range} with {formula}")
            }
            ChangeOp::DeleteRow { row, count, .. } => {
                format!("delete {} row(s) from {sheet}!{row}", count.unwrap_or(1))
            }
            ChangeOp::DeleteColumn { column, count, .. } => {
                format!("delete {} column(s) from {sheet}!{column}", count.unwrap_or(1))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub summary: ChangeSummary,
    /// Structural edits in the order they were applied, for patch export.
    pub structural: Vec<StructuralChange>,
}

struct Applicator<'a> {
    workbook: &'a mut ParsedWorkbook,
    grid: Option<&'a mut GridEngine>,
    active_sheet: String,
    summary: ChangeSummary,
    structural: Vec<StructuralChange>,
    kinds: BTreeSet<String>,
    sheets: BTreeSet<String>,
    grid_dirty: bool,
    touched_inactive: bool,
    active_structure_changed: bool,
}

/// Apply `ops` in order. Normalized data is always updated; the grid mirrors edits to
/// the active sheet. Invalid ops are skipped with a warning and the rest still apply.
pub fn apply_changes(
    workbook: &mut ParsedWorkbook,
    grid: Option<&mut GridEngine>,
    active_sheet: &str,
    ops: &[ChangeOp],
) -> ApplyOutcome {
    let mut applicator = Applicator {
        workbook,
        grid,
        active_sheet: active_sheet.to_string(),
        summary: ChangeSummary::default(),
        structural: Vec::new(),
        kinds: BTreeSet::new(),
        sheets: BTreeSet::new(),
        grid_dirty: false,
        touched_inactive: false,
        active_structure_changed: false,
    };

    for (idx, op) in ops.iter().enumerate() {
        match applicator.apply(op) {
            Ok(()) => {
                applicator.summary.ops_applied += 1;
                applicator.kinds.insert(op.kind().to_string());
            }
            Err(e) => {
                tracing::warn!(op = op.kind(), index = idx, error = %e, "skipped change");
                applicator.summary.ops_skipped += 1;
                applicator.summary.warnings.push(Warning::new(
                    WARN_SKIPPED_OP,
                    format!("op {} ({}) skipped: {}", idx, op.kind(), e),
                ));
            }
        }
    }

    applicator.finish()
}

impl Applicator<'_> {
    fn resolve_sheet(&self, op: &ChangeOp) -> Result<String> {
        let name = op.sheet().unwrap_or(&self.active_sheet);
        if !self.workbook.has_sheet(name) {
            bail!("sheet '{}' not found", name);
        }
        Ok(name.to_string())
    }

    fn sheet_mut(&mut self, name: &str) -> Result<&mut SheetData> {
        self.workbook
            .sheet_mut(name)
            .ok_or_else(|| anyhow!("sheet '{}' not found", name))
    }

    /// Refuse writes that would grow the stored grid of `sheet` past [`MAX_SHEET_CELLS`].
    fn ensure_room(&self, sheet: &str, rows: u32, cols: u32) -> Result<()> {
        let data = self
            .workbook
            .sheet(sheet)
            .ok_or_else(|| anyhow!("sheet '{}' not found", sheet))?;
        let area = data.area_with(rows, cols);
        if area > MAX_SHEET_CELLS {
            bail!(
                "sheet '{}' would grow to {} cells, limit is {}",
                sheet,
                area,
                MAX_SHEET_CELLS
            );
        }
        Ok(())
    }

    fn mirrors_to_grid(&self, sheet: &str) -> bool {
        self.grid.is_some() && sheet == self.active_sheet
    }

    fn note_sheet(&mut self, sheet: &str) {
        self.sheets.insert(sheet.to_string());
        if sheet != self.active_sheet {
            self.touched_inactive = true;
        }
    }

    fn grid_call(&mut self, what: &str, f: impl FnOnce(&mut GridEngine) -> Result<()>) {
        if self.grid_dirty {
            return;
        }
        if let Some(grid) = self.grid.as_deref_mut()
            && let Err(e) = f(grid)
        {
            tracing::warn!(error = %e, what, "grid rejected edit, will rebuild");
            self.summary.warnings.push(Warning::new(
                WARN_GRID_SYNC,
                format!("grid could not apply {what}: {e}; grid rebuilt from workbook data"),
            ));
            self.grid_dirty = true;
        }
    }

    fn apply(&mut self, op: &ChangeOp) -> Result<()> {
        let sheet = self.resolve_sheet(op)?;
        match op {
            ChangeOp::SetValue { cell, value, .. } => {
                let cell = CellRef::parse(cell)?;
                if let serde_json::Value::String(text) = value
                    && let Some(stripped) = text.trim_start().strip_prefix('=')
                {
                    self.summary.warnings.push(Warning::new(
                        WARN_FORMULA_PREFIX,
                        format!("value for {} starts with '=', stored as a formula", cell),
                    ));
                    return self.write_formula(&sheet, cell, stripped);
                }
                self.write_value(&sheet, cell, CellValue::from_json(value))
            }
            ChangeOp::SetFormula { cell, formula, .. } => {
                let cell = CellRef::parse(cell)?;
                self.write_formula(&sheet, cell, formula)
            }
            ChangeOp::ApplyFormulaToRange {
                range,
                formula,
                relative_mode,
                ..
            } => self.fill_range(&sheet, range, formula, relative_mode.unwrap_or_default()),
            ChangeOp::InsertRow { row, count, .. } => {
                let at = row_index(*row)?;
                let count = checked_count(*count)?;
                self.structural_edit(&sheet, Axis::Row, StructureEdit::Insert { at, count })
            }
            ChangeOp::DeleteRow { row, count, .. } => {
                let start = row_index(*row)?;
                let count = checked_count(*count)?;
                self.structural_edit(&sheet, Axis::Row, StructureEdit::Delete { start, count })
            }
            ChangeOp::InsertColumn { column, count, .. } => {
                let at = col_index(column)?;
                let count = checked_count(*count)?;
                self.structural_edit(&sheet, Axis::Col, StructureEdit::Insert { at, count })
            }
            ChangeOp::DeleteColumn { column, count, .. } => {
                let start = col_index(column)?;
                let count = checked_count(*count)?;
                self.structural_edit(&sheet, Axis::Col, StructureEdit::Delete { start, count })
            }
        }
    }

    fn write_value(&mut self, sheet: &str, cell: CellRef, value: CellValue) -> Result<()> {
        self.ensure_room(sheet, cell.row + 1, cell.col + 1)?;
        {
            let data = self.sheet_mut(sheet)?;
            data.clear_formula(cell.row, cell.col);
            data.set(cell.row, cell.col, value.clone());
        }
        if self.mirrors_to_grid(sheet) {
            self.grid_call("set_value", |g| g.set_value(cell.row, cell.col, &value));
        }
        self.note_sheet(sheet);
        self.summary.bump("cells_written", 1);
        self.summary.affected_bounds.push(format!("{sheet}!{cell}"));
        Ok(())
    }

    fn write_formula(&mut self, sheet: &str, cell: CellRef, formula: &str) -> Result<()> {
        self.ensure_room(sheet, cell.row + 1, cell.col + 1)?;
        parse_base_formula(formula)?;
        let text = normalized_formula(formula);
        self.store_formula(sheet, cell, &text)?;
        self.note_sheet(sheet);
        self.summary.bump("cells_written", 1);
        self.summary.affected_bounds.push(format!("{sheet}!{cell}"));
        Ok(())
    }

    fn store_formula(&mut self, sheet: &str, cell: CellRef, text: &str) -> Result<()> {
        self.sheet_mut(sheet)?.set_formula(cell.row, cell.col, text);
        if self.mirrors_to_grid(sheet) {
            let owned = text.to_string();
            self.grid_call("set_formula", move |g| g.set_formula(cell.row, cell.col, &owned));
        }
        Ok(())
    }

    fn fill_range(
        &mut self,
        sheet: &str,
        range: &str,
        formula: &str,
        mode: RelativeMode,
    ) -> Result<()> {
        let range = RangeRef::parse(range)?;
        if range.cell_count() > MAX_FILL_CELLS {
            bail!(
                "range {} has {} cells, limit is {}",
                range,
                range.cell_count(),
                MAX_FILL_CELLS
            );
        }
        self.ensure_room(sheet, range.end.row + 1, range.end.col + 1)?;
        let ast = parse_base_formula(formula)?;

        let mut filled = 0u64;
        for cell in range.cells() {
            let delta_col = cell.col as i32 - range.start.col as i32;
            let delta_row = cell.row as i32 - range.start.row as i32;
            match shift_formula_ast(&ast, delta_col, delta_row, mode) {
                Ok(text) => {
                    self.store_formula(sheet, cell, &text)?;
                    filled += 1;
                }
                Err(e) => {
                    self.summary.warnings.push(Warning::new(
                        WARN_FORMULA_SHIFT,
                        format!("{sheet}!{cell} skipped: {e}"),
                    ));
                }
            }
        }
        if filled == 0 {
            bail!("no cell in {} could take the formula", range);
        }

        self.note_sheet(sheet);
        self.summary.bump("cells_written", filled);
        self.summary.affected_bounds.push(format!("{sheet}!{range}"));
        Ok(())
    }

    fn structural_edit(&mut self, sheet: &str, axis: Axis, edit: StructureEdit) -> Result<()> {
        let data = self
            .workbook
            .sheet(sheet)
            .ok_or_else(|| anyhow!("sheet '{}' not found", sheet))?;
        check_structure_bounds(data, axis, edit)?;
        let change = StructuralChange::new(sheet, axis, edit);
        let rewrite_failures = apply_structural_change(self.workbook, &change);
        for failure in rewrite_failures {
            self.summary
                .warnings
                .push(Warning::new(WARN_FORMULA_REWRITE, failure));
        }

        if self.mirrors_to_grid(sheet) {
            self.active_structure_changed = true;
            match (axis, edit) {
                (Axis::Row, StructureEdit::Insert { at, count }) => {
                    self.grid_call("insert_row", |g| g.insert_rows(at, count))
                }
                (Axis::Row, StructureEdit::Delete { start, count }) => {
                    self.grid_call("delete_row", |g| g.delete_rows(start, count))
                }
                (Axis::Col, StructureEdit::Insert { at, count }) => {
                    self.grid_call("insert_column", |g| g.insert_columns(at, count))
                }
                (Axis::Col, StructureEdit::Delete { start, count }) => {
                    self.grid_call("delete_column", |g| g.delete_columns(start, count))
                }
            }
        }

        let key = match (axis, edit) {
            (Axis::Row, StructureEdit::Insert { .. }) => "rows_inserted",
            (Axis::Row, StructureEdit::Delete { .. }) => "rows_deleted",
            (Axis::Col, StructureEdit::Insert { .. }) => "columns_inserted",
            (Axis::Col, StructureEdit::Delete { .. }) => "columns_deleted",
        };
        let count = match edit {
            StructureEdit::Insert { count, .. } | StructureEdit::Delete { count, .. } => count,
        };
        self.summary.bump(key, count as u64);
        self.note_sheet(sheet);
        // other sheets' formulas may have been rewritten too
        if self.workbook.sheets.len() > 1 {
            self.touched_inactive = true;
        }
        self.structural.push(change);
        Ok(())
    }

    fn finish(mut self) -> ApplyOutcome {
        refresh_validation_options(self.workbook);

        if let Some(grid) = self.grid.as_deref_mut() {
            let needs_rebuild = self.grid_dirty || self.touched_inactive;
            let synced = if needs_rebuild {
                GridEngine::load(self.workbook, &self.active_sheet).map(|fresh| *grid = fresh)
            } else {
                if self.active_structure_changed
                    && let Some(data) = self.workbook.sheet(&self.active_sheet)
                {
                    grid.sync_formula_text(&self.active_sheet, data.formula_cells());
                }
                grid.recalculate()
            };
            match synced {
                Ok(()) => refresh_cached_values(self.workbook, grid),
                Err(e) => {
                    tracing::warn!(error = %e, "grid refresh failed");
                    self.summary.warnings.push(Warning::new(
                        WARN_GRID_SYNC,
                        format!("grid could not be refreshed: {e}"),
                    ));
                }
            }
        }

        let kinds = std::mem::take(&mut self.kinds);
        let sheets = std::mem::take(&mut self.sheets);
        self.summary.finish(kinds, sheets);
        tracing::debug!(
            applied = self.summary.ops_applied,
            skipped = self.summary.ops_skipped,
            "change batch finished"
        );
        ApplyOutcome {
            summary: self.summary,
            structural: self.structural,
        }
    }
}

fn normalized_formula(formula: &str) -> String {
    let trimmed = formula.trim();
    if trimmed.starts_with('=') {
        trimmed.to_string()
    } else {
        format!("={trimmed}")
    }
}

fn row_index(row: u32) -> Result<u32> {
    if row == 0 || row > MAX_ROWS {
        bail!("row {} is out of range (1..={})", row, MAX_ROWS);
    }
    Ok(row - 1)
}

fn col_index(column: &str) -> Result<u32> {
    column_index(column)
        .filter(|c| *c < MAX_COLS)
        .ok_or_else(|| anyhow!("invalid column '{}'", column))
}

fn checked_count(count: Option<u32>) -> Result<u32> {
    match count.unwrap_or(1) {
        0 => bail!("count must be at least 1"),
        n => Ok(n),
    }
}

/// Reject edits that reach past the last row/column, inserts that would push occupied
/// cells off the sheet, and inserts that would grow the stored grid past its budget.
fn check_structure_bounds(sheet: &SheetData, axis: Axis, edit: StructureEdit) -> Result<()> {
    let limit = axis.limit();
    let noun = match axis {
        Axis::Row => "row",
        Axis::Col => "column",
    };
    let (first, count) = match edit {
        StructureEdit::Insert { at, count } => (at, count),
        StructureEdit::Delete { start, count } => (start, count),
    };
    if first.checked_add(count).is_none_or(|end| end > limit) {
        bail!("{count} {noun}(s) from {noun} {} run past the last {noun} ({limit})", first + 1);
    }

    if let StructureEdit::Insert { at, count } = edit {
        let used = used_extent(sheet, axis);
        if used > at && u64::from(used) + u64::from(count) > u64::from(limit) {
            bail!("inserting {count} {noun}(s) would push occupied cells past the last {noun}");
        }
        let (rows, cols) = sheet.dimensions();
        let area = match axis {
            Axis::Row if at < rows => u64::from(rows + count) * u64::from(cols),
            Axis::Col if at < cols => u64::from(rows) * u64::from(cols + count),
            _ => 0,
        };
        if area > MAX_SHEET_CELLS {
            bail!("inserting {count} {noun}(s) would grow the sheet to {area} cells");
        }
    }
    Ok(())
}

/// One past the last row/column holding a value, a formula or a merge.
fn used_extent(sheet: &SheetData, axis: Axis) -> u32 {
    let values = match axis {
        Axis::Row => sheet
            .rows
            .iter()
            .rposition(|row| row.iter().any(|v| !v.is_empty()))
            .map_or(0, |r| r + 1),
        Axis::Col => sheet
            .rows
            .iter()
            .filter_map(|row| row.iter().rposition(|v| !v.is_empty()))
            .max()
            .map_or(0, |c| c + 1),
    } as u32;
    let formulas = sheet
        .formula_cells()
        .iter()
        .map(|(cell, _)| match axis {
            Axis::Row => cell.row + 1,
            Axis::Col => cell.col + 1,
        })
        .max()
        .unwrap_or(0);
    let merges = sheet
        .merges
        .iter()
        .map(|m| match axis {
            Axis::Row => m.end_row + 1,
            Axis::Col => m.end_col + 1,
        })
        .max()
        .unwrap_or(0);
    values.max(formulas).max(merges)
}

/// Apply a row/column insert or delete to normalized data: cell values, formula keys,
/// formula text on every sheet, merges, validations, sizing and named ranges.
/// Returns messages for formulas that could not be rewritten (they are left as-is).
pub fn apply_structural_change(
    workbook: &mut ParsedWorkbook,
    change: &StructuralChange,
) -> Vec<String> {
    let mut failures = Vec::new();

    if let Some(sheet) = workbook.sheet_mut(&change.sheet) {
        move_cells(sheet, change.axis, change.edit);
        rekey_formulas(sheet, change.axis, change.edit);

        sheet.merges = sheet
            .merges
            .iter()
            .filter_map(|m| adjust_merge(*m, change.axis, change.edit))
            .collect();

        sheet.validations = std::mem::take(&mut sheet.validations)
            .into_iter()
            .filter_map(|mut dv| {
                dv.range = rewrite_sqref(&dv.range, change.axis, change.edit)?;
                Some(dv)
            })
            .collect();

        match change.axis {
            Axis::Row => {
                sheet.row_heights = shift_keys(&sheet.row_heights, Axis::Row, change.edit)
            }
            Axis::Col => {
                sheet.column_widths = shift_keys(&sheet.column_widths, Axis::Col, change.edit)
            }
        }
    }

    for sheet in &mut workbook.sheets {
        let host = sheet.name.clone();
        for (addr, text) in sheet.formulas.iter_mut() {
            match rewrite_formula(text, Some(&host), change) {
                Ok(Some(rewritten)) => *text = rewritten,
                Ok(None) => {}
                Err(e) => failures.push(format!("{host}!{addr}: {e}")),
            }
        }
        for dv in &mut sheet.validations {
            if let Some(source) = dv.source.as_mut()
                && let Ok(rewritten) = rewrite_reference(source, Some(&host), change)
            {
                *source = rewritten;
            }
        }
    }

    for named in &mut workbook.named_ranges {
        match rewrite_reference(&named.reference, named.scope.as_deref(), change) {
            Ok(rewritten) => named.reference = rewritten,
            Err(e) => failures.push(format!("name {}: {e}", named.name)),
        }
    }

    failures
}

fn move_cells(sheet: &mut SheetData, axis: Axis, edit: StructureEdit) {
    let (rows, cols) = sheet.dimensions();
    match (axis, edit) {
        (Axis::Row, StructureEdit::Insert { at, count }) => {
            if at < rows {
                let blank = vec![CellValue::Empty; cols as usize];
                let at = at as usize;
                sheet
                    .rows
                    .splice(at..at, std::iter::repeat_n(blank, count as usize));
            }
        }
        (Axis::Row, StructureEdit::Delete { start, count }) => {
            if start < rows {
                let end = start.saturating_add(count).min(rows) as usize;
                sheet.rows.drain(start as usize..end);
            }
        }
        (Axis::Col, StructureEdit::Insert { at, count }) => {
            if at < cols {
                for row in &mut sheet.rows {
                    let at = at as usize;
                    row.splice(
                        at..at,
                        std::iter::repeat_n(CellValue::Empty, count as usize),
                    );
                }
            }
        }
        (Axis::Col, StructureEdit::Delete { start, count }) => {
            if start < cols {
                for row in &mut sheet.rows {
                    let end = (start.saturating_add(count) as usize).min(row.len());
                    if (start as usize) < end {
                        row.drain(start as usize..end);
                    }
                }
            }
        }
    }
}

fn rekey_formulas(sheet: &mut SheetData, axis: Axis, edit: StructureEdit) {
    let mut moved = IndexMap::with_capacity(sheet.formulas.len());
    for (addr, text) in std::mem::take(&mut sheet.formulas) {
        let Ok(cell) = CellRef::parse(&addr) else {
            moved.insert(addr, text);
            continue;
        };
        let target = match axis {
            Axis::Row => adjust_index(cell.row, edit)
                .filter(|r| *r < MAX_ROWS)
                .map(|r| CellRef::new(r, cell.col)),
            Axis::Col => adjust_index(cell.col, edit)
                .filter(|c| *c < MAX_COLS)
                .map(|c| CellRef::new(cell.row, c)),
        };
        if let Some(target) = target {
            moved.insert(target.to_a1(), text);
        }
    }
    sheet.formulas = moved;
}

/// Copy evaluated formula results from the grid into the normalized cached values.
pub fn refresh_cached_values(workbook: &mut ParsedWorkbook, grid: &GridEngine) {
    for sheet in &mut workbook.sheets {
        for (cell, _) in sheet.formula_cells() {
            let value = grid.cached_value_at(&sheet.name, cell.row, cell.col);
            sheet.set(cell.row, cell.col, value);
        }
    }
}

/// Evaluate every formula in `workbook` with a throwaway grid and store the results.
pub fn evaluate_workbook(workbook: &mut ParsedWorkbook) -> Result<()> {
    let Some(first) = workbook.sheets.first().map(|s| s.name.clone()) else {
        return Ok(());
    };
    let grid = GridEngine::load(workbook, &first)?;
    refresh_cached_values(workbook, &grid);
    Ok(())
}

fn refresh_validation_options(workbook: &mut ParsedWorkbook) {
    let mut updates = Vec::new();
    for sheet in &workbook.sheets {
        for (idx, dv) in sheet.validations.iter().enumerate() {
            if let Some(source) = dv.source.as_deref() {
                let options = resolve_list_options(source, &sheet.name, workbook);
                if options != dv.options {
                    updates.push((sheet.name.clone(), idx, options));
                }
            }
        }
    }
    for (sheet, idx, options) in updates {
        if let Some(dv) = workbook
            .sheet_mut(&sheet)
            .and_then(|s| s.validations.get_mut(idx))
        {
            dv.options = options;
        }
    }
}
