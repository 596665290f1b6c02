use crate::address::{CellRef, column_name, split_sheet_qualifier};
use crate::formula::structure::rewrite_sqref;
use crate::formula::{Axis, StructuralChange, StructureEdit};
use crate::model::{CellValue, DropdownValidation, NamedRange, ParsedWorkbook, SheetData};
use crate::parser::{cell_value_from_umya, read_book};
use anyhow::{Context, Result, anyhow};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Cursor;
use umya_spreadsheet::{
    Cell, DataValidation, DataValidationValues, DataValidations, Spreadsheet, Worksheet,
};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ExportMode {
    /// Patch the uploaded file so untracked parts survive.
    #[default]
    Patch,
    /// Build a new workbook from normalized data only.
    Fresh,
}

/// Serialize `workbook` to xlsx bytes.
///
/// `journal` is the ordered list of structural edits applied since `original` was read;
/// patch mode replays it so styles and comments follow their cells.
pub fn export_workbook(
    workbook: &ParsedWorkbook,
    mode: ExportMode,
    original: Option<&[u8]>,
    journal: &[StructuralChange],
) -> Result<Vec<u8>> {
    let book = match (mode, original) {
        (ExportMode::Patch, Some(bytes)) => patch_book(workbook, bytes, journal)?,
        (ExportMode::Patch, None) => {
            tracing::warn!(
                file = %workbook.file_name,
                "no original bytes to patch, exporting a fresh workbook"
            );
            fresh_book(workbook)?
        }
        (ExportMode::Fresh, _) => fresh_book(workbook)?,
    };
    write_bytes(&book)
}

fn write_bytes(book: &Spreadsheet) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    umya_spreadsheet::writer::xlsx::write_writer(book, &mut cursor)
        .map_err(|e| anyhow!("failed to write xlsx: {e}"))?;
    Ok(cursor.into_inner())
}

fn fresh_book(workbook: &ParsedWorkbook) -> Result<Spreadsheet> {
    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    for sheet in &workbook.sheets {
        let ws = book
            .new_sheet(sheet.name.as_str())
            .map_err(|e| anyhow!("failed to add sheet '{}': {e}", sheet.name))?;
        fill_sheet(ws, sheet);
    }
    add_named_ranges(&mut book, workbook, &workbook.named_ranges)?;
    tracing::debug!(sheets = workbook.sheets.len(), "built fresh workbook");
    Ok(book)
}

fn fill_sheet(ws: &mut Worksheet, sheet: &SheetData) {
    let (rows, cols) = sheet.dimensions();
    for row in 0..rows {
        for col in 0..cols {
            let formula = sheet.formula_at(row, col);
            let value = sheet.get(row, col);
            if formula.is_none() && value.is_empty() {
                continue;
            }
            write_cell(ws.get_cell_mut((col + 1, row + 1)), value, formula);
        }
    }
    for merge in &sheet.merges {
        ws.add_merge_cells(merge.to_a1());
    }
    apply_sizing(ws, sheet);
    if !sheet.validations.is_empty() {
        let mut dvs = DataValidations::default();
        for dv in &sheet.validations {
            dvs.add_data_validation_list(new_list_validation(dv));
        }
        ws.set_data_validations(dvs);
    }
}

fn apply_sizing(ws: &mut Worksheet, sheet: &SheetData) {
    for (col, width) in &sheet.column_widths {
        ws.get_column_dimension_by_number_mut(&(col + 1))
            .set_width(*width);
    }
    for (row, height) in &sheet.row_heights {
        ws.get_row_dimension_mut(&(row + 1)).set_height(*height);
    }
}

fn write_cell(cell: &mut Cell, value: &CellValue, formula: Option<&str>) {
    cell.get_cell_value_mut().remove_formula();
    match value {
        CellValue::Empty => {
            cell.set_blank();
        }
        CellValue::Bool(b) => {
            cell.set_value_bool(*b);
        }
        CellValue::Number(n) => {
            cell.set_value_number(*n);
        }
        CellValue::Text(s) => {
            cell.set_value_string(s.as_str());
        }
        CellValue::Error { error } => {
            cell.set_value(error.as_str());
        }
    }
    if let Some(formula) = formula {
        // umya keeps formula text without the leading '='
        cell.set_formula(formula.strip_prefix('=').unwrap_or(formula));
        if value.is_empty() {
            cell.set_formula_result_default("");
        }
    }
}

fn new_list_validation(dv: &DropdownValidation) -> DataValidation {
    let mut out = DataValidation::default();
    out.set_type(DataValidationValues::List);
    out.set_allow_blank(dv.allow_blank);
    // umya-spreadsheet 2.3 has no showDropDown setter and never emits the
    // attribute, so the in-cell dropdown is shown (showDropDown=false) by default.
    out.get_sequence_of_references_mut().set_sqref(dv.range.as_str());
    out.set_formula1(list_formula(dv));
    out
}

fn list_formula(dv: &DropdownValidation) -> String {
    match dv.source.as_deref() {
        Some(source) => source.to_string(),
        None => format!("\"{}\"", dv.options.join(",")),
    }
}

fn add_named_ranges(
    book: &mut Spreadsheet,
    workbook: &ParsedWorkbook,
    names: &[NamedRange],
) -> Result<()> {
    let Some(first) = workbook.sheets.first().map(|s| s.name.clone()) else {
        return Ok(());
    };
    for named in names {
        let scope_index = named
            .scope
            .as_deref()
            .and_then(|scope| workbook.sheets.iter().position(|s| s.name == scope));
        let host = match (&named.scope, scope_index) {
            (Some(scope), Some(_)) => scope.clone(),
            _ => split_sheet_qualifier(&named.reference)
                .0
                .filter(|s| workbook.has_sheet(s))
                .unwrap_or_else(|| first.clone()),
        };
        let ws = book
            .get_sheet_by_name_mut(&host)
            .ok_or_else(|| anyhow!("sheet '{}' not found", host))?;
        ws.add_defined_name(named.name.as_str(), named.reference.as_str())
            .map_err(|e| anyhow!("failed to add name '{}': {e}", named.name))?;
        if let (Some(idx), Some(defined)) = (scope_index, ws.get_defined_names_mut().last_mut()) {
            defined.set_local_sheet_id(idx as u32);
        }
    }
    Ok(())
}

fn patch_book(
    workbook: &ParsedWorkbook,
    original: &[u8],
    journal: &[StructuralChange],
) -> Result<Spreadsheet> {
    let mut book = read_book(original).context("failed to reopen original workbook")?;

    // validations are rebuilt from the pre-replay state, so take them before umya moves anything
    let validation_snapshot: Vec<(String, Vec<DataValidation>)> = book
        .get_sheet_collection()
        .iter()
        .map(|ws| {
            let list = ws
                .get_data_validations()
                .map(|dvs| dvs.get_data_validation_list().to_vec())
                .unwrap_or_default();
            (ws.get_name().to_string(), list)
        })
        .collect();

    replay_journal(&mut book, journal)?;

    let existing: BTreeSet<String> = book
        .get_sheet_collection()
        .iter()
        .map(|ws| ws.get_name().to_string())
        .collect();

    let mut appended = Vec::new();
    for sheet in &workbook.sheets {
        if !existing.contains(&sheet.name) {
            let ws = book
                .new_sheet(sheet.name.as_str())
                .map_err(|e| anyhow!("failed to add sheet '{}': {e}", sheet.name))?;
            fill_sheet(ws, sheet);
            appended.push(sheet.name.clone());
            continue;
        }
        let ws = book
            .get_sheet_by_name_mut(&sheet.name)
            .ok_or_else(|| anyhow!("sheet '{}' not found", sheet.name))?;
        let written = reconcile_cells(ws, sheet);
        reconcile_merges(ws, sheet);
        apply_sizing_changes(ws, sheet);
        let original_dvs = validation_snapshot
            .iter()
            .find(|(name, _)| name == &sheet.name)
            .map(|(_, list)| list.as_slice())
            .unwrap_or_default();
        reconcile_validations(ws, sheet, original_dvs, journal);
        tracing::debug!(sheet = %sheet.name, cells = written, "patched sheet");
    }

    reconcile_named_ranges(&mut book, workbook)?;

    if !appended.is_empty() {
        tracing::debug!(sheets = ?appended, "appended sheets missing from original");
    }
    Ok(book)
}

fn replay_journal(book: &mut Spreadsheet, journal: &[StructuralChange]) -> Result<()> {
    for change in journal {
        let ws = book
            .get_sheet_by_name_mut(&change.sheet)
            .ok_or_else(|| anyhow!("sheet '{}' not found in original", change.sheet))?;
        match (change.axis, change.edit) {
            (Axis::Row, StructureEdit::Insert { at, count }) => {
                ws.insert_new_row(&(at + 1), &count);
            }
            (Axis::Row, StructureEdit::Delete { start, count }) => {
                ws.remove_row(&(start + 1), &count);
            }
            (Axis::Col, StructureEdit::Insert { at, count }) => {
                ws.insert_new_column(&column_name(at), &count);
            }
            (Axis::Col, StructureEdit::Delete { start, count }) => {
                ws.remove_column(&column_name(start), &count);
            }
        }
    }
    Ok(())
}

/// Overwrite only cells whose value or formula differs. Returns the number written.
fn reconcile_cells(ws: &mut Worksheet, sheet: &SheetData) -> usize {
    let mut written = 0usize;

    let stale: Vec<CellRef> = ws
        .get_cell_collection()
        .iter()
        .filter_map(|cell| {
            let coord = cell.get_coordinate();
            let (col, row) = (*coord.get_col_num(), *coord.get_row_num());
            if col == 0 || row == 0 {
                return None;
            }
            let at = CellRef::new(row - 1, col - 1);
            let has_content =
                cell.is_formula() || !cell_value_from_umya(cell.get_cell_value()).is_empty();
            let tracked = sheet.formula_at(at.row, at.col).is_some()
                || !sheet.get(at.row, at.col).is_empty();
            (has_content && !tracked).then_some(at)
        })
        .collect();
    for at in stale {
        let cell = ws.get_cell_mut((at.col + 1, at.row + 1));
        cell.get_cell_value_mut().remove_formula();
        cell.set_blank();
        written += 1;
    }

    let (rows, cols) = sheet.dimensions();
    let mut targets: BTreeSet<CellRef> =
        sheet.formula_cells().into_iter().map(|(c, _)| c).collect();
    for row in 0..rows {
        for col in 0..cols {
            if !sheet.get(row, col).is_empty() {
                targets.insert(CellRef::new(row, col));
            }
        }
    }

    for at in targets {
        let value = sheet.get(at.row, at.col);
        let formula = sheet.formula_at(at.row, at.col);
        let coords = (at.col + 1, at.row + 1);
        if let Some(cell) = ws.get_cell(coords)
            && cell_matches(cell, value, formula)
        {
            continue;
        }
        write_cell(ws.get_cell_mut(coords), value, formula);
        written += 1;
    }
    written
}

fn cell_matches(cell: &Cell, value: &CellValue, formula: Option<&str>) -> bool {
    let current = cell_value_from_umya(cell.get_cell_value());
    match formula {
        Some(formula) => {
            let wanted = formula.strip_prefix('=').unwrap_or(formula);
            cell.is_formula()
                && cell.get_formula() == wanted
                && (value.is_empty() || &current == value)
        }
        // shared-formula children read back without text; keep them when the value agrees
        None => (!cell.is_formula() || cell.get_formula().is_empty()) && &current == value,
    }
}

fn reconcile_merges(ws: &mut Worksheet, sheet: &SheetData) {
    let current: BTreeSet<String> = ws
        .get_merge_cells()
        .iter()
        .map(|range| range.get_range().to_string())
        .collect();
    let wanted: BTreeSet<String> = sheet.merges.iter().map(|m| m.to_a1()).collect();
    if current == wanted {
        return;
    }
    ws.get_merge_cells_mut().clear();
    for merge in &sheet.merges {
        ws.add_merge_cells(merge.to_a1());
    }
}

fn apply_sizing_changes(ws: &mut Worksheet, sheet: &SheetData) {
    for (col, width) in &sheet.column_widths {
        let dim = ws.get_column_dimension_by_number_mut(&(col + 1));
        if (*dim.get_width() - *width).abs() > f64::EPSILON {
            dim.set_width(*width);
        }
    }
    for (row, height) in &sheet.row_heights {
        let dim = ws.get_row_dimension_mut(&(row + 1));
        if (*dim.get_height() - *height).abs() > f64::EPSILON {
            dim.set_height(*height);
        }
    }
}

/// Rebuild the sheet's validation list: tracked list validations come from normalized
/// data by `origin`, everything else is carried over with its ranges moved by the journal.
fn reconcile_validations(
    ws: &mut Worksheet,
    sheet: &SheetData,
    original: &[DataValidation],
    journal: &[StructuralChange],
) {
    if original.is_empty() && sheet.validations.is_empty() {
        return;
    }

    let mut rebuilt = DataValidations::default();
    for (idx, dv) in original.iter().enumerate() {
        if dv.get_type() == &DataValidationValues::List {
            let Some(tracked) = sheet.validations.iter().find(|v| v.origin == Some(idx)) else {
                continue;
            };
            let mut updated = dv.clone();
            updated
                .get_sequence_of_references_mut()
                .set_sqref(tracked.range.as_str());
            if let Some(source) = tracked.source.as_deref() {
                updated.set_formula1(source);
            }
            rebuilt.add_data_validation_list(updated);
            continue;
        }

        let mut sqref = dv.get_sequence_of_references().get_sqref().to_string();
        let mut survives = true;
        for change in journal.iter().filter(|c| c.sheet == sheet.name) {
            match rewrite_sqref(&sqref, change.axis, change.edit) {
                Some(next) => sqref = next,
                None => {
                    survives = false;
                    break;
                }
            }
        }
        if survives {
            let mut moved = dv.clone();
            moved.get_sequence_of_references_mut().set_sqref(sqref);
            rebuilt.add_data_validation_list(moved);
        }
    }

    for dv in sheet.validations.iter().filter(|v| v.origin.is_none()) {
        rebuilt.add_data_validation_list(new_list_validation(dv));
    }

    ws.set_data_validations(rebuilt);
}

fn normalize_reference(reference: &str) -> String {
    reference
        .trim()
        .trim_start_matches('=')
        .replace(['\'', '$'], "")
        .to_ascii_uppercase()
}

fn reconcile_named_ranges(book: &mut Spreadsheet, workbook: &ParsedWorkbook) -> Result<()> {
    let sheet_names: Vec<String> = book
        .get_sheet_collection()
        .iter()
        .map(|ws| ws.get_name().to_string())
        .collect();
    let mut seen: BTreeSet<(String, Option<String>)> = BTreeSet::new();

    let mut update = |defined: &mut umya_spreadsheet::DefinedName| {
        let scope = defined
            .has_local_sheet_id()
            .then(|| sheet_names.get(*defined.get_local_sheet_id() as usize).cloned())
            .flatten();
        let Some(named) = workbook
            .named_ranges
            .iter()
            .find(|n| n.name == defined.get_name() && n.scope == scope)
        else {
            return;
        };
        seen.insert((named.name.clone(), named.scope.clone()));
        if normalize_reference(&defined.get_address()) != normalize_reference(&named.reference) {
            defined.set_address(named.reference.as_str());
        }
    };

    for defined in book.get_defined_names_mut().iter_mut() {
        update(defined);
    }
    for ws in book.get_sheet_collection_mut().iter_mut() {
        for defined in ws.get_defined_names_mut().iter_mut() {
            update(defined);
        }
    }

    let missing: Vec<NamedRange> = workbook
        .named_ranges
        .iter()
        .filter(|n| !seen.contains(&(n.name.clone(), n.scope.clone())))
        .cloned()
        .collect();
    add_named_ranges(book, workbook, &missing)
}
