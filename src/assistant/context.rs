use crate::address::{CellRef, RangeRef, split_sheet_qualifier};
use crate::model::{CellValue, ParsedWorkbook};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Describe the workbook for the model: sheets, the active sheet's cells (selection first),
/// dropdowns and named ranges.
pub fn build_context(
    workbook: &ParsedWorkbook,
    active_sheet: &str,
    selection: Option<&str>,
    max_cells: usize,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Workbook: {}", workbook.file_name);
    let _ = writeln!(out, "Sheets:");
    for sheet in &workbook.sheets {
        let (rows, cols) = sheet.dimensions();
        let marker = if sheet.name == active_sheet { " (active)" } else { "" };
        let _ = writeln!(
            out,
            "- {}{}: {} rows x {} columns, {} formulas",
            sheet.name,
            marker,
            rows,
            cols,
            sheet.formulas.len()
        );
    }

    let Some(sheet) = workbook.sheet(active_sheet) else {
        return out;
    };

    let selection = selection.and_then(|s| {
        let (sheet_part, coords) = split_sheet_qualifier(s);
        match sheet_part {
            Some(name) if name != active_sheet => None,
            _ => RangeRef::parse(coords).ok(),
        }
    });

    let mut ordered: Vec<CellRef> = Vec::new();
    let mut seen = BTreeSet::new();
    if let Some(range) = selection {
        let _ = writeln!(out, "Selection: {}!{}", active_sheet, range);
        for cell in range.cells().take(max_cells) {
            if seen.insert(cell) {
                ordered.push(cell);
            }
        }
    }
    let (rows, cols) = sheet.dimensions();
    'scan: for row in 0..rows {
        for col in 0..cols {
            let cell = CellRef::new(row, col);
            let occupied = !sheet.get(row, col).is_empty() || sheet.formula_at(row, col).is_some();
            if occupied && seen.insert(cell) {
                ordered.push(cell);
                if ordered.len() > max_cells {
                    break 'scan;
                }
            }
        }
    }

    let total = sheet.non_empty_cells().max(sheet.formulas.len());
    let _ = writeln!(out, "Cells on {}:", active_sheet);
    for cell in ordered.iter().take(max_cells) {
        let value = sheet.get(cell.row, cell.col);
        match sheet.formula_at(cell.row, cell.col) {
            Some(formula) => {
                let _ = writeln!(out, "{} = {} -> {}", cell, formula, render_value(value));
            }
            None => {
                let _ = writeln!(out, "{} = {}", cell, render_value(value));
            }
        }
    }
    if ordered.len() > max_cells || total > max_cells {
        let _ = writeln!(
            out,
            "(listing capped at {} cells; call read_range for the rest)",
            max_cells
        );
    }

    let dropdowns: Vec<_> = workbook
        .sheets
        .iter()
        .flat_map(|s| s.validations.iter().map(move |dv| (s.name.as_str(), dv)))
        .collect();
    if !dropdowns.is_empty() {
        let _ = writeln!(out, "Dropdowns:");
        for (sheet_name, dv) in dropdowns {
            let _ = writeln!(
                out,
                "- {}!{}: {}",
                sheet_name,
                dv.range,
                dv.options.join(", ")
            );
        }
    }

    if !workbook.named_ranges.is_empty() {
        let _ = writeln!(out, "Named ranges:");
        for named in &workbook.named_ranges {
            match &named.scope {
                Some(scope) => {
                    let _ = writeln!(out, "- {} ({}) = {}", named.name, scope, named.reference);
                }
                None => {
                    let _ = writeln!(out, "- {} = {}", named.name, named.reference);
                }
            }
        }
    }

    out
}

pub(crate) fn render_value(value: &CellValue) -> String {
    match value {
        CellValue::Empty => "(empty)".to_string(),
        CellValue::Text(s) => format!("{:?}", s),
        other => other.display(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DropdownValidation, NamedRange, SheetData};

    fn workbook() -> ParsedWorkbook {
        let mut sheet = SheetData::new("Sales");
        for row in 0..10 {
            sheet.set(row, 0, CellValue::Number(row as f64));
        }
        sheet.set_formula(10, 0, "=SUM(A1:A10)");
        sheet.set(10, 0, CellValue::Number(45.0));
        sheet.validations.push(DropdownValidation {
            range: "B1:B10".into(),
            options: vec!["Open".into(), "Closed".into()],
            source: Some("\"Open,Closed\"".into()),
            allow_blank: true,
            origin: Some(0),
        });
        ParsedWorkbook {
            file_name: "sales.xlsx".into(),
            sheets: vec![sheet, SheetData::new("Notes")],
            named_ranges: vec![NamedRange {
                name: "Totals".into(),
                reference: "Sales!$A$11".into(),
                scope: None,
            }],
        }
    }

    #[test]
    fn lists_sheets_cells_and_metadata() {
        let text = build_context(&workbook(), "Sales", None, 100);
        assert!(text.contains("- Sales (active): 11 rows x 1 columns, 1 formulas"));
        assert!(text.contains("A11 = =SUM(A1:A10) -> 45"));
        assert!(text.contains("- Sales!B1:B10: Open, Closed"));
        assert!(text.contains("- Totals = Sales!$A$11"));
        assert!(!text.contains("capped"));
    }

    #[test]
    fn selection_comes_first_and_listing_is_capped() {
        let text = build_context(&workbook(), "Sales", Some("A9:A10"), 3);
        let cells: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with('A') && l.contains(" = "))
            .collect();
        assert_eq!(cells.len(), 3);
        assert!(cells[0].starts_with("A9 "));
        assert!(cells[1].starts_with("A10 "));
        assert!(text.contains("listing capped at 3 cells"));
    }
}
