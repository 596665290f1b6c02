use serde_json::json;
use sheetpilot::address::CellRef;
use sheetpilot::changes::{ChangeOp, WARN_FORMULA_SHIFT, WARN_SKIPPED_OP};
use sheetpilot::grid::GridView;
use sheetpilot::model::CellValue;
use sheetpilot::session::WorkbookSession;

mod support;

fn open_budget() -> WorkbookSession {
    let bytes = support::workbook_bytes(support::budget_book);
    WorkbookSession::open(bytes, "budget.xlsx").expect("open session")
}

fn ops(value: serde_json::Value) -> Vec<ChangeOp> {
    serde_json::from_value(value).expect("change list")
}

fn value(view: &GridView, a1: &str) -> CellValue {
    let cell = CellRef::parse(a1).expect("a1");
    view.rows
        .get(cell.row as usize)
        .and_then(|row| row.get(cell.col as usize))
        .map(|c| c.value.clone())
        .unwrap_or_default()
}

fn formula(view: &GridView, a1: &str) -> Option<String> {
    let cell = CellRef::parse(a1).expect("a1");
    view.rows
        .get(cell.row as usize)
        .and_then(|row| row.get(cell.col as usize))
        .and_then(|c| c.formula.clone())
}

fn unanchored(reference: &str) -> String {
    reference.replace('$', "")
}

#[test]
fn opening_computes_formulas_without_cached_results() {
    let mut session = open_budget();
    assert_eq!(session.active_sheet(), "Sheet1");
    assert_eq!(session.revision(), 0);

    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "B5"), CellValue::Number(1650.0));
    assert_eq!(formula(&view, "B5").as_deref(), Some("=SUM(B2:B4)"));
    assert_eq!(view.merges, vec!["D1:E1".to_string()]);
    assert_eq!(view.validations.len(), 1);

    let summary = session.summary();
    assert_eq!(summary.sheets.len(), 2);
    assert_eq!(summary.sheets[0].formula_count, 1);
    assert_eq!(summary.source_sha256.len(), 64);
}

#[test]
fn typed_edits_recalculate_dependents() {
    let mut session = open_budget();
    let summary = session.set_cell(None, "B2", "2000").unwrap();
    assert_eq!(summary.ops_applied, 1);
    assert_eq!(session.revision(), 1);

    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "B2"), CellValue::Number(2000.0));
    assert_eq!(value(&view, "B5"), CellValue::Number(2450.0));

    session.set_cell(None, "B6", "=B5/2").unwrap();
    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "B6"), CellValue::Number(1225.0));
}

#[test]
fn inserting_rows_moves_formulas_validations_and_names() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "insert_row", "row": 3}
    ])));
    assert_eq!(summary.ops_applied, 1);
    assert_eq!(summary.count("rows_inserted"), 1);

    let view = session.view(None).unwrap();
    assert_eq!(formula(&view, "B6").as_deref(), Some("=SUM(B2:B5)"));
    assert_eq!(value(&view, "B6"), CellValue::Number(1650.0));
    assert_eq!(value(&view, "A4"), CellValue::Text("Groceries".to_string()));
    assert!(value(&view, "A3").is_empty());
    assert_eq!(view.merges, vec!["D1:E1".to_string()]);

    let sheet = session.workbook().sheet("Sheet1").unwrap();
    assert_eq!(sheet.validations[0].range, "C2:C11");
    let amounts = &session.workbook().named_ranges[0];
    assert_eq!(unanchored(&amounts.reference), "Sheet1!B2:B5");
    assert_eq!(session.journal().len(), 1);
}

#[test]
fn deleting_a_column_shifts_everything_left() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "delete_column", "column": "A"}
    ])));
    assert_eq!(summary.count("columns_deleted"), 1);

    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "A1"), CellValue::Text("Amount".to_string()));
    assert_eq!(formula(&view, "A5").as_deref(), Some("=SUM(A2:A4)"));
    assert_eq!(value(&view, "A5"), CellValue::Number(1650.0));
    assert_eq!(view.merges, vec!["C1:D1".to_string()]);

    let sheet = session.workbook().sheet("Sheet1").unwrap();
    assert_eq!(sheet.validations[0].range, "B2:B10");
    assert_eq!(sheet.column_widths.get(&0).copied(), Some(18.0));
    assert_eq!(
        unanchored(&session.workbook().named_ranges[0].reference),
        "Sheet1!A2:A4"
    );
}

#[test]
fn deleting_a_referenced_row_produces_ref_errors() {
    let mut session = open_budget();
    session.set_cell(None, "C12", "=B3*2").unwrap();
    session.apply_changes(&ops(json!([
        {"kind": "delete_row", "row": 3}
    ])));

    let view = session.view(None).unwrap();
    let moved = formula(&view, "C11").expect("moved formula");
    assert!(moved.contains("#REF!"), "got {moved}");
    assert_eq!(formula(&view, "B4").as_deref(), Some("=SUM(B2:B3)"));
    assert_eq!(value(&view, "B4"), CellValue::Number(1350.0));
}

#[test]
fn fill_range_adjusts_relative_references() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "apply_formula_to_range", "range": "D2:D4", "formula": "=B2*2"}
    ])));
    assert_eq!(summary.count("cells_written"), 3);

    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "D2"), CellValue::Number(2400.0));
    assert_eq!(value(&view, "D3"), CellValue::Number(600.0));
    assert_eq!(value(&view, "D4"), CellValue::Number(300.0));
    let d4 = formula(&view, "D4").expect("filled formula");
    assert!(d4.replace(' ', "").contains("B4*2"), "got {d4}");
}

#[test]
fn inactive_sheet_edits_reach_dropdowns_and_formulas() {
    let mut session = open_budget();
    session.apply_changes(&ops(json!([
        {"kind": "set_value", "sheet": "Lists", "cell": "A1", "value": "Rent & Bills"},
        {"kind": "set_formula", "cell": "D5", "formula": "COUNTA(Lists!A1:A3)"}
    ])));
    assert_eq!(session.active_sheet(), "Sheet1");

    let sheet = session.workbook().sheet("Sheet1").unwrap();
    assert_eq!(sheet.validations[0].options[0], "Rent & Bills");

    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "D5"), CellValue::Number(3.0));

    let lists = session.view(Some("Lists")).unwrap();
    assert_eq!(lists.sheet, "Lists");
    assert_eq!(value(&lists, "A1"), CellValue::Text("Rent & Bills".to_string()));
}

#[test]
fn switching_sheets_moves_the_grid() {
    let mut session = open_budget();
    let view = session.switch_sheet("Lists").unwrap();
    assert_eq!(view.sheet, "Lists");
    assert_eq!(session.active_sheet(), "Lists");

    session.set_cell(None, "A4", "Travel").unwrap();
    let lists = session.workbook().sheet("Lists").unwrap();
    assert_eq!(lists.get(3, 0), &CellValue::Text("Travel".to_string()));

    assert!(session.switch_sheet("Missing").is_err());
    assert_eq!(session.active_sheet(), "Lists");
}

#[test]
fn bad_operations_are_skipped_with_a_warning() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "set_value", "sheet": "Nope", "cell": "A1", "value": 1},
        {"kind": "set_formula", "cell": "A7", "formula": "=SUM(("},
        {"kind": "set_value", "cell": "A8", "value": 5}
    ])));
    assert_eq!(summary.ops_applied, 1);
    assert_eq!(summary.ops_skipped, 2);
    assert!(summary.warnings.iter().all(|w| w.code == WARN_SKIPPED_OP));
    assert_eq!(session.revision(), 1);
}

#[test]
fn sheet_local_names_pointing_elsewhere_evaluate() {
    let bytes = support::workbook_bytes(support::rates_book);
    let mut session = WorkbookSession::open(bytes, "rates.xlsx").expect("open session");
    assert_eq!(session.active_sheet(), "Summary");

    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "A1"), CellValue::Number(10.0));

    session.apply_changes(&ops(json!([
        {"kind": "set_value", "sheet": "Data", "cell": "A1", "value": 8}
    ])));
    let view = session.view(None).unwrap();
    assert_eq!(value(&view, "A1"), CellValue::Number(16.0));
}

#[test]
fn structural_edits_past_the_sheet_edge_are_skipped() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "delete_row", "row": 2, "count": 4294967295u32},
        {"kind": "insert_row", "row": 5, "count": 4294967295u32},
        {"kind": "insert_row", "row": 1, "count": 1048576},
        {"kind": "insert_column", "column": "B", "count": 16383},
        {"kind": "delete_column", "column": "XFD", "count": 2}
    ])));
    assert_eq!(summary.ops_applied, 0);
    assert_eq!(summary.ops_skipped, 5);
    assert!(summary.warnings.iter().all(|w| w.code == WARN_SKIPPED_OP));
    assert!(session.journal().is_empty());

    let sheet = session.workbook().sheet("Sheet1").unwrap();
    assert_eq!(sheet.formula_at(4, 1), Some("=SUM(B2:B4)"));
    assert!(sheet.formulas.keys().all(|key| CellRef::parse(key).is_ok()));
}

#[test]
fn inserting_up_to_the_last_row_keeps_formula_keys_valid() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "insert_row", "row": 6, "count": 1048570}
    ])));
    assert_eq!(summary.ops_applied, 1, "warnings: {:?}", summary.warnings);

    let sheet = session.workbook().sheet("Sheet1").unwrap();
    assert_eq!(sheet.formula_at(4, 1), Some("=SUM(B2:B4)"));
    assert!(sheet.formulas.keys().all(|key| CellRef::parse(key).is_ok()));
    assert_eq!(sheet.validations[0].range, "C2:C1048576");
}

#[test]
fn writes_that_would_blow_up_the_grid_are_skipped() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "set_value", "cell": "ZZ1000", "value": 1},
        {"kind": "set_value", "cell": "XFD1048576", "value": 1},
        {"kind": "set_formula", "cell": "XFD1048576", "formula": "=1"},
        {"kind": "apply_formula_to_range", "range": "ZZ5000:ZZ5001", "formula": "=1"},
        {"kind": "set_value", "cell": "F6", "value": "kept"}
    ])));
    assert_eq!(summary.ops_applied, 2, "warnings: {:?}", summary.warnings);
    assert_eq!(summary.ops_skipped, 3);

    let sheet = session.workbook().sheet("Sheet1").unwrap();
    assert_eq!(sheet.dimensions(), (1000, 702));
    assert_eq!(sheet.get(5, 5), &CellValue::Text("kept".to_string()));
}

#[test]
fn fill_stops_at_the_last_row_with_a_warning() {
    let mut session = open_budget();
    let summary = session.apply_changes(&ops(json!([
        {"kind": "apply_formula_to_range", "range": "D1:D2", "formula": "=A1048576*2"}
    ])));
    assert_eq!(summary.ops_applied, 1);
    assert_eq!(summary.count("cells_written"), 1);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].code, WARN_FORMULA_SHIFT);

    let sheet = session.workbook().sheet("Sheet1").unwrap();
    assert!(sheet.formula_at(0, 3).is_some());
    assert!(sheet.formula_at(1, 3).is_none());
}
