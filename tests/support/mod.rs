#![allow(dead_code)]
pub mod builders;

use builders::CellVal;
use sheetpilot::config::{CliArgs, ServerConfig};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use umya_spreadsheet::{DataValidation, DataValidationValues, DataValidations, Spreadsheet};

pub struct TestWorkspace {
    _tempdir: TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let root = tempdir.path().canonicalize().expect("canonical tempdir");
        Self {
            _tempdir: tempdir,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn create_workbook<F>(&self, name: &str, f: F) -> PathBuf
    where
        F: FnOnce(&mut Spreadsheet),
    {
        let path = self.path(name);
        std::fs::write(&path, workbook_bytes(f)).expect("write workbook");
        path
    }

    pub fn write_json(&self, name: &str, value: &serde_json::Value) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, serde_json::to_vec_pretty(value).expect("json")).expect("write json");
        path
    }

    pub fn config(&self) -> ServerConfig {
        self.config_with(|_| {})
    }

    pub fn config_with<F>(&self, f: F) -> ServerConfig
    where
        F: FnOnce(&mut ServerConfig),
    {
        let mut config = ServerConfig::from_args(CliArgs {
            workspace_root: Some(self.root.clone()),
            ..CliArgs::default()
        })
        .expect("config");
        f(&mut config);
        config
    }
}

pub fn workbook_bytes<F>(f: F) -> Vec<u8>
where
    F: FnOnce(&mut Spreadsheet),
{
    let mut book = umya_spreadsheet::new_file();
    f(&mut book);
    let mut cursor = Cursor::new(Vec::new());
    umya_spreadsheet::writer::xlsx::write_writer(&book, &mut cursor).expect("write xlsx");
    cursor.into_inner()
}

pub fn read_back(bytes: &[u8]) -> Spreadsheet {
    umya_spreadsheet::reader::xlsx::read_reader(Cursor::new(bytes.to_vec()), true)
        .expect("read exported xlsx")
}

/// Sheet1 holds a small budget with a total formula, a merged note header, a wide
/// column, a dropdown fed from `Lists` and a defined name over the amounts.
pub fn budget_book(book: &mut Spreadsheet) {
    let _ = book.new_sheet("Lists");
    {
        let lists = book.get_sheet_by_name_mut("Lists").expect("lists sheet");
        builders::fill_sparse(
            lists,
            &[
                ("A1", "Housing".into()),
                ("A2", "Food".into()),
                ("A3", "Leisure".into()),
            ],
        );
    }

    let sheet = book.get_sheet_by_name_mut("Sheet1").expect("default sheet");
    builders::fill_table(
        sheet,
        "A1",
        &["Item", "Amount", "Category"],
        &[
            vec![CellVal::from("Rent"), 1200.into(), "Housing".into()],
            vec![CellVal::from("Groceries"), 300.into(), "Food".into()],
            vec![CellVal::from("Cinema"), 150.into(), CellVal::Empty],
        ],
    );
    builders::fill_sparse(
        sheet,
        &[
            ("A5", "Total".into()),
            ("B5", CellVal::Formula("SUM(B2:B4)".to_string())),
            ("D1", "Notes".into()),
        ],
    );
    sheet.add_merge_cells("D1:E1");
    sheet.get_column_dimension_by_number_mut(&2).set_width(18.0);

    let mut dv = DataValidation::default();
    dv.set_type(DataValidationValues::List);
    dv.set_allow_blank(true);
    dv.get_sequence_of_references_mut().set_sqref("C2:C10");
    dv.set_formula1("Lists!$A$1:$A$3");
    let mut dvs = DataValidations::default();
    dvs.add_data_validation_list(dv);
    sheet.set_data_validations(dvs);

    sheet
        .add_defined_name("Amounts", "Sheet1!$B$2:$B$4")
        .expect("defined name");
}

/// `Summary` (first sheet) computes from a rate on `Data` through a name local to `Summary`.
pub fn rates_book(book: &mut Spreadsheet) {
    let _ = book.new_sheet("Data");
    {
        let data = book.get_sheet_by_name_mut("Data").expect("data sheet");
        builders::fill_sparse(data, &[("A1", 5.into())]);
    }

    let summary = book.get_sheet_by_name_mut("Sheet1").expect("default sheet");
    summary.set_name("Summary");
    builders::fill_sparse(summary, &[("A1", CellVal::Formula("Rate*2".to_string()))]);
    summary
        .add_defined_name("Rate", "Data!$A$1")
        .expect("defined name");
    if let Some(defined) = summary.get_defined_names_mut().last_mut() {
        defined.set_local_sheet_id(0);
    }
}
