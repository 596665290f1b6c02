use serde_json::json;
use sheetpilot::changes::ChangeOp;
use sheetpilot::export::ExportMode;
use sheetpilot::session::WorkbookSession;
use umya_spreadsheet::{Spreadsheet, Worksheet};

mod support;

fn open_budget() -> WorkbookSession {
    let bytes = support::workbook_bytes(support::budget_book);
    WorkbookSession::open(bytes, "budget.xlsx").expect("open session")
}

fn apply(session: &mut WorkbookSession, value: serde_json::Value) {
    let ops: Vec<ChangeOp> = serde_json::from_value(value).expect("change list");
    let summary = session.apply_changes(&ops);
    assert_eq!(summary.ops_skipped, 0, "warnings: {:?}", summary.warnings);
}

fn sheet1(book: &Spreadsheet) -> &Worksheet {
    book.get_sheet_by_name("Sheet1").expect("Sheet1")
}

fn formula_at(sheet: &Worksheet, a1: &str) -> String {
    sheet
        .get_cell(a1)
        .map(|c| c.get_formula().to_string())
        .unwrap_or_default()
}

fn is_bold(sheet: &Worksheet, a1: &str) -> bool {
    sheet
        .get_cell(a1)
        .and_then(|c| c.get_style().get_font().map(|f| *f.get_bold()))
        .unwrap_or(false)
}

fn merges(sheet: &Worksheet) -> Vec<String> {
    sheet
        .get_merge_cells()
        .iter()
        .map(|m| m.get_range().to_string())
        .collect()
}

fn validation_sqrefs(sheet: &Worksheet) -> Vec<String> {
    sheet
        .get_data_validations()
        .map(|dvs| {
            dvs.get_data_validation_list()
                .iter()
                .map(|dv| dv.get_sequence_of_references().get_sqref().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn defined_name(book: &Spreadsheet, name: &str) -> Option<String> {
    book.get_defined_names()
        .iter()
        .chain(book.get_sheet_collection().iter().flat_map(|s| s.get_defined_names().iter()))
        .find(|d| d.get_name() == name)
        .map(|d| d.get_address().to_string())
}

fn column_width(sheet: &Worksheet, col: u32) -> Option<f64> {
    sheet
        .get_column_dimensions()
        .iter()
        .find(|c| *c.get_col_num() == col)
        .map(|c| *c.get_width())
}

#[test]
fn patch_export_keeps_styles_and_layout_around_value_edits() {
    let mut session = open_budget();
    apply(
        &mut session,
        json!([{"kind": "set_value", "cell": "B2", "value": 2000}]),
    );

    let book = support::read_back(&session.export(ExportMode::Patch).unwrap());
    let sheet = sheet1(&book);
    assert_eq!(sheet.get_value("B2"), "2000");
    assert_eq!(formula_at(sheet, "B5"), "SUM(B2:B4)");
    assert!(is_bold(sheet, "A1"), "header style survives");
    assert_eq!(merges(sheet), vec!["D1:E1"]);
    assert_eq!(validation_sqrefs(sheet), vec!["C2:C10"]);
    assert_eq!(column_width(sheet, 2), Some(18.0));
    assert_eq!(
        defined_name(&book, "Amounts").as_deref(),
        Some("Sheet1!$B$2:$B$4")
    );
    assert_eq!(
        book.get_sheet_by_name("Lists").unwrap().get_value("A3"),
        "Leisure"
    );
}

#[test]
fn patch_export_replays_row_inserts() {
    let mut session = open_budget();
    apply(
        &mut session,
        json!([
            {"kind": "insert_row", "row": 3},
            {"kind": "set_value", "cell": "A3", "value": "Internet"},
            {"kind": "set_value", "cell": "B3", "value": 45}
        ]),
    );

    let book = support::read_back(&session.export(ExportMode::Patch).unwrap());
    let sheet = sheet1(&book);
    assert_eq!(sheet.get_value("A3"), "Internet");
    assert_eq!(sheet.get_value("A4"), "Groceries");
    assert_eq!(formula_at(sheet, "B6"), "SUM(B2:B5)");
    assert!(formula_at(sheet, "B5").is_empty());
    assert!(is_bold(sheet, "B1"));
    assert_eq!(merges(sheet), vec!["D1:E1"]);
    assert_eq!(validation_sqrefs(sheet), vec!["C2:C11"]);
    assert_eq!(
        defined_name(&book, "Amounts").map(|a| a.replace('$', "")),
        Some("Sheet1!B2:B5".to_string())
    );
}

#[test]
fn patch_export_replays_column_deletes() {
    let mut session = open_budget();
    apply(&mut session, json!([{"kind": "delete_column", "column": "A"}]));

    let book = support::read_back(&session.export(ExportMode::Patch).unwrap());
    let sheet = sheet1(&book);
    assert_eq!(sheet.get_value("A1"), "Amount");
    assert_eq!(formula_at(sheet, "A5"), "SUM(A2:A4)");
    assert_eq!(merges(sheet), vec!["C1:D1"]);
    assert_eq!(validation_sqrefs(sheet), vec!["B2:B10"]);
}

#[test]
fn fresh_export_rebuilds_content_without_the_original() {
    let mut session = open_budget();
    apply(
        &mut session,
        json!([{"kind": "set_formula", "cell": "C5", "formula": "=B5*2"}]),
    );

    let book = support::read_back(&session.export(ExportMode::Fresh).unwrap());
    let names: Vec<String> = book
        .get_sheet_collection()
        .iter()
        .map(|s| s.get_name().to_string())
        .collect();
    assert_eq!(names, vec!["Sheet1", "Lists"]);

    let sheet = sheet1(&book);
    assert_eq!(sheet.get_value("A2"), "Rent");
    assert_eq!(formula_at(sheet, "B5"), "SUM(B2:B4)");
    assert_eq!(formula_at(sheet, "C5"), "B5*2");
    assert_eq!(merges(sheet), vec!["D1:E1"]);
    assert_eq!(validation_sqrefs(sheet), vec!["C2:C10"]);
    assert!(defined_name(&book, "Amounts").is_some());
}

#[test]
fn exported_bytes_reopen_as_a_session() {
    let mut session = open_budget();
    apply(
        &mut session,
        json!([{"kind": "insert_column", "column": "B"}]),
    );
    let bytes = session.export(ExportMode::Patch).unwrap();

    let reopened = WorkbookSession::open(bytes, "budget.xlsx").unwrap();
    let sheet = reopened.workbook().sheet("Sheet1").unwrap();
    assert_eq!(sheet.formula_at(4, 2), Some("=SUM(C2:C4)"));
    assert_eq!(sheet.validations[0].range, "D2:D10");
    assert_eq!(sheet.validations[0].options.len(), 3);
}
