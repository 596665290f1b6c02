//! Live grid backed by the formualizer engine.
//!
//! Every sheet is loaded so cross-sheet formulas evaluate, but only the active
//! sheet is rendered and edited.

use crate::address::{CellRef, RangeRef, split_sheet_qualifier};
use crate::model::{CellValue, DropdownValidation, ParsedWorkbook};
use anyhow::{Result, anyhow, bail};
use formualizer::workbook::{
    LiteralValue, NamedRangeScope, RangeAddress, Workbook, WorkbookConfig,
};
use formualizer::ExcelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridCell {
    pub value: CellValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

/// What the editor shows for one sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridView {
    pub sheet: String,
    pub rows: Vec<Vec<GridCell>>,
    pub column_widths: BTreeMap<u32, f64>,
    pub row_heights: BTreeMap<u32, f64>,
    pub merges: Vec<String>,
    pub validations: Vec<DropdownValidation>,
}

pub struct GridEngine {
    book: Workbook,
    active: String,
    /// Used extent per sheet, (rows, cols).
    extents: BTreeMap<String, (u32, u32)>,
    /// Formula text as written, keyed by sheet then A1. The engine only hands back canonical text.
    formulas: BTreeMap<String, BTreeMap<CellRef, String>>,
}

impl GridEngine {
    pub fn load(workbook: &ParsedWorkbook, active_sheet: &str) -> Result<Self> {
        if !workbook.has_sheet(active_sheet) {
            bail!("sheet '{}' not found", active_sheet);
        }

        let mut book = Workbook::new_with_config(WorkbookConfig::ephemeral());
        let mut extents = BTreeMap::new();
        let mut formulas: BTreeMap<String, BTreeMap<CellRef, String>> = BTreeMap::new();

        for sheet in &workbook.sheets {
            book.add_sheet(&sheet.name)
                .map_err(|e| anyhow!("failed to add sheet '{}' to grid: {e}", sheet.name))?;
            extents.insert(sheet.name.clone(), sheet.dimensions());
            formulas.insert(sheet.name.clone(), BTreeMap::new());
        }

        for named in &workbook.named_ranges {
            let Some(address) = named_range_address(&named.reference) else {
                continue;
            };
            let scope = name_scope(named.scope.as_deref(), &address);
            if let Err(e) = book.define_named_range(&named.name, &address, scope) {
                tracing::debug!(name = %named.name, error = %e, "named range not loaded");
            }
        }

        for sheet in &workbook.sheets {
            for (r, row) in sheet.rows.iter().enumerate() {
                for (c, value) in row.iter().enumerate() {
                    if value.is_empty() || sheet.formula_at(r as u32, c as u32).is_some() {
                        continue;
                    }
                    let cell = CellRef::new(r as u32, c as u32);
                    book.set_value(&sheet.name, cell.row + 1, cell.col + 1, to_literal(value))
                        .map_err(|e| anyhow!("failed to load {}!{}: {e}", sheet.name, cell))?;
                }
            }
        }

        let mut grid = Self {
            book,
            active: active_sheet.to_string(),
            extents,
            formulas,
        };

        for sheet in &workbook.sheets {
            for (cell, formula) in sheet.formula_cells() {
                if let Err(e) = grid.write_formula(&sheet.name, cell, &formula) {
                    // an unparseable formula still renders its cached value
                    tracing::warn!(sheet = %sheet.name, %cell, error = %e, "formula not loaded");
                    let cached = sheet.get(cell.row, cell.col).clone();
                    grid.write_value(&sheet.name, cell, &cached)?;
                }
            }
        }

        grid.recalculate()?;
        Ok(grid)
    }

    pub fn active_sheet(&self) -> &str {
        &self.active
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extents.get(&self.active).copied().unwrap_or((0, 0))
    }

    /// Evaluated value of a cell on the active sheet.
    pub fn get_value(&mut self, row: u32, col: u32) -> Result<CellValue> {
        let sheet = self.active.clone();
        self.value_at(&sheet, row, col)
    }

    pub fn value_at(&mut self, sheet: &str, row: u32, col: u32) -> Result<CellValue> {
        let value = self
            .book
            .evaluate_cell(sheet, row + 1, col + 1)
            .map_err(|e| anyhow!("failed to evaluate {}!{}: {e}", sheet, CellRef::new(row, col)))?;
        Ok(from_literal(&value))
    }

    /// Last computed value without triggering evaluation.
    pub fn cached_value_at(&self, sheet: &str, row: u32, col: u32) -> CellValue {
        self.book
            .get_value(sheet, row + 1, col + 1)
            .map(|v| from_literal(&v))
            .unwrap_or_default()
    }

    pub fn get_formula(&self, row: u32, col: u32) -> Option<String> {
        self.formulas
            .get(&self.active)
            .and_then(|cells| cells.get(&CellRef::new(row, col)))
            .cloned()
    }

    pub fn set_value(&mut self, row: u32, col: u32, value: &CellValue) -> Result<()> {
        let sheet = self.active.clone();
        self.write_value(&sheet, CellRef::new(row, col), value)
    }

    pub fn set_formula(&mut self, row: u32, col: u32, formula: &str) -> Result<()> {
        let sheet = self.active.clone();
        self.write_formula(&sheet, CellRef::new(row, col), formula)
    }

    fn write_value(&mut self, sheet: &str, cell: CellRef, value: &CellValue) -> Result<()> {
        self.book
            .set_value(sheet, cell.row + 1, cell.col + 1, to_literal(value))
            .map_err(|e| anyhow!("failed to set {}!{}: {e}", sheet, cell))?;
        if let Some(cells) = self.formulas.get_mut(sheet) {
            cells.remove(&cell);
        }
        self.grow(sheet, cell);
        Ok(())
    }

    fn write_formula(&mut self, sheet: &str, cell: CellRef, formula: &str) -> Result<()> {
        let text = if formula.starts_with('=') {
            formula.to_string()
        } else {
            format!("={formula}")
        };
        self.book
            .set_formula(sheet, cell.row + 1, cell.col + 1, &text)
            .map_err(|e| anyhow!("failed to set formula at {}!{}: {e}", sheet, cell))?;
        self.formulas
            .entry(sheet.to_string())
            .or_default()
            .insert(cell, text);
        self.grow(sheet, cell);
        Ok(())
    }

    fn grow(&mut self, sheet: &str, cell: CellRef) {
        let extent = self.extents.entry(sheet.to_string()).or_insert((0, 0));
        extent.0 = extent.0.max(cell.row + 1);
        extent.1 = extent.1.max(cell.col + 1);
    }

    pub fn insert_rows(&mut self, at: u32, count: u32) -> Result<()> {
        let sheet = self.active.clone();
        self.book
            .engine_mut()
            .insert_rows(&sheet, at + 1, count)
            .map_err(|e| anyhow!("grid insert_rows failed: {e:?}"))?;
        self.shift_tracked(&sheet, |c| {
            (c.row >= at)
                .then(|| CellRef::new(c.row.saturating_add(count), c.col))
                .or(Some(c))
        });
        if let Some(extent) = self.extents.get_mut(&sheet)
            && extent.0 > at
        {
            extent.0 = extent.0.saturating_add(count);
        }
        Ok(())
    }

    pub fn delete_rows(&mut self, start: u32, count: u32) -> Result<()> {
        let sheet = self.active.clone();
        self.book
            .engine_mut()
            .delete_rows(&sheet, start + 1, count)
            .map_err(|e| anyhow!("grid delete_rows failed: {e:?}"))?;
        let end = start.saturating_add(count);
        self.shift_tracked(&sheet, |c| {
            if c.row < start {
                Some(c)
            } else if c.row >= end {
                Some(CellRef::new(c.row - count, c.col))
            } else {
                None
            }
        });
        if let Some(extent) = self.extents.get_mut(&sheet) {
            let removed = extent.0.saturating_sub(start).min(count);
            extent.0 -= removed;
        }
        Ok(())
    }

    pub fn insert_columns(&mut self, at: u32, count: u32) -> Result<()> {
        let sheet = self.active.clone();
        self.book
            .engine_mut()
            .insert_columns(&sheet, at + 1, count)
            .map_err(|e| anyhow!("grid insert_columns failed: {e:?}"))?;
        self.shift_tracked(&sheet, |c| {
            (c.col >= at)
                .then(|| CellRef::new(c.row, c.col.saturating_add(count)))
                .or(Some(c))
        });
        if let Some(extent) = self.extents.get_mut(&sheet)
            && extent.1 > at
        {
            extent.1 = extent.1.saturating_add(count);
        }
        Ok(())
    }

    pub fn delete_columns(&mut self, start: u32, count: u32) -> Result<()> {
        let sheet = self.active.clone();
        self.book
            .engine_mut()
            .delete_columns(&sheet, start + 1, count)
            .map_err(|e| anyhow!("grid delete_columns failed: {e:?}"))?;
        let end = start.saturating_add(count);
        self.shift_tracked(&sheet, |c| {
            if c.col < start {
                Some(c)
            } else if c.col >= end {
                Some(CellRef::new(c.row, c.col - count))
            } else {
                None
            }
        });
        if let Some(extent) = self.extents.get_mut(&sheet) {
            let removed = extent.1.saturating_sub(start).min(count);
            extent.1 -= removed;
        }
        Ok(())
    }

    /// Move tracked formula positions after a structural edit. Formula text is replaced
    /// wholesale by the caller through `sync_formula_text`.
    fn shift_tracked(&mut self, sheet: &str, mut map: impl FnMut(CellRef) -> Option<CellRef>) {
        if let Some(cells) = self.formulas.get_mut(sheet) {
            let moved: BTreeMap<CellRef, String> = std::mem::take(cells)
                .into_iter()
                .filter_map(|(cell, text)| map(cell).map(|c| (c, text)))
                .collect();
            *cells = moved;
        }
    }

    /// Replace tracked formula text for a sheet without touching the engine.
    pub fn sync_formula_text(
        &mut self,
        sheet: &str,
        formulas: impl IntoIterator<Item = (CellRef, String)>,
    ) {
        let entry = self.formulas.entry(sheet.to_string()).or_default();
        entry.clear();
        entry.extend(formulas);
    }

    pub fn recalculate(&mut self) -> Result<()> {
        let result = self
            .book
            .evaluate_all()
            .map_err(|e| anyhow!("grid evaluation failed: {e}"))?;
        if result.cycle_errors > 0 {
            tracing::warn!(cycles = result.cycle_errors, "circular references in workbook");
        }
        Ok(())
    }

    /// Evaluated values plus formula text for the active sheet.
    pub fn render(&mut self, workbook: &ParsedWorkbook) -> Result<GridView> {
        let sheet_name = self.active.clone();
        let (rows, cols) = self.extent();
        let mut out = Vec::with_capacity(rows as usize);
        for r in 0..rows {
            let mut row = Vec::with_capacity(cols as usize);
            for c in 0..cols {
                let formula = self.get_formula(r, c);
                let value = if formula.is_some() {
                    self.value_at(&sheet_name, r, c)?
                } else {
                    self.cached_value_at(&sheet_name, r, c)
                };
                row.push(GridCell { value, formula });
            }
            out.push(row);
        }

        let layout = workbook.sheet(&sheet_name);
        Ok(GridView {
            sheet: sheet_name.clone(),
            rows: out,
            column_widths: layout.map(|s| s.column_widths.clone()).unwrap_or_default(),
            row_heights: layout.map(|s| s.row_heights.clone()).unwrap_or_default(),
            merges: layout
                .map(|s| s.merges.iter().map(|m| m.to_a1()).collect())
                .unwrap_or_default(),
            validations: layout.map(|s| s.validations.clone()).unwrap_or_default(),
        })
    }
}

/// The engine scopes a sheet-local name to the sheet its address points at. A name local
/// to one sheet that points into another is registered workbook-wide so it still
/// resolves from its own sheet.
fn name_scope(scope: Option<&str>, address: &RangeAddress) -> NamedRangeScope {
    match scope {
        Some(sheet) if sheet == address.sheet => NamedRangeScope::Sheet,
        _ => NamedRangeScope::Workbook,
    }
}

fn named_range_address(reference: &str) -> Option<RangeAddress> {
    let (sheet, coords) = split_sheet_qualifier(reference);
    let sheet = sheet?;
    let range = RangeRef::parse(coords).ok()?;
    RangeAddress::new(
        sheet,
        range.start.row + 1,
        range.start.col + 1,
        range.end.row + 1,
        range.end.col + 1,
    )
    .ok()
}

pub(crate) fn to_literal(value: &CellValue) -> LiteralValue {
    match value {
        CellValue::Empty => LiteralValue::Empty,
        CellValue::Bool(b) => LiteralValue::Boolean(*b),
        CellValue::Number(n) => LiteralValue::Number(*n),
        CellValue::Text(s) => LiteralValue::Text(s.clone()),
        CellValue::Error { error } => LiteralValue::Error(ExcelError::from_error_string(error)),
    }
}

pub(crate) fn from_literal(value: &LiteralValue) -> CellValue {
    match value {
        LiteralValue::Int(i) => CellValue::Number(*i as f64),
        LiteralValue::Number(n) => CellValue::Number(*n),
        LiteralValue::Text(s) => CellValue::Text(s.clone()),
        LiteralValue::Boolean(b) => CellValue::Bool(*b),
        LiteralValue::Empty | LiteralValue::Pending => CellValue::Empty,
        LiteralValue::Error(e) => CellValue::error(e.kind.to_string()),
        LiteralValue::Array(rows) => rows
            .first()
            .and_then(|r| r.first())
            .map(from_literal)
            .unwrap_or_default(),
        other => other
            .as_serial_number()
            .map(CellValue::Number)
            .unwrap_or_default(),
    }
}
