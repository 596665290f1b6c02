#![allow(dead_code)]
use sheetpilot::address::CellRef;
use umya_spreadsheet::Worksheet;

#[derive(Clone, Debug)]
pub enum CellVal {
    Text(String),
    Num(f64),
    Formula(String),
    Empty,
}

impl From<&str> for CellVal {
    fn from(s: &str) -> Self {
        CellVal::Text(s.to_string())
    }
}

impl From<i32> for CellVal {
    fn from(n: i32) -> Self {
        CellVal::Num(f64::from(n))
    }
}

/// umya's 1-based (col, row) for an A1 address; panics on anything else.
fn position(a1: &str) -> (u32, u32) {
    let cell = CellRef::parse(a1).unwrap_or_else(|e| panic!("fixture address {a1}: {e}"));
    (cell.col + 1, cell.row + 1)
}

fn put(sheet: &mut Worksheet, at: (u32, u32), val: &CellVal) {
    match val {
        CellVal::Text(s) => {
            sheet.get_cell_mut(at).set_value(s.clone());
        }
        CellVal::Num(n) => {
            sheet.get_cell_mut(at).set_value_number(*n);
        }
        CellVal::Formula(f) => {
            sheet.get_cell_mut(at).set_formula(f.clone());
        }
        CellVal::Empty => {}
    }
}

/// Bold header row at `origin`, data rows below it.
pub fn fill_table(sheet: &mut Worksheet, origin: &str, headers: &[&str], rows: &[Vec<CellVal>]) {
    let (col, row) = position(origin);
    for (offset, header) in (0u32..).zip(headers) {
        let at = (col + offset, row);
        sheet.get_cell_mut(at).set_value(header.to_string());
        sheet.get_style_mut(at).get_font_mut().set_bold(true);
    }
    for (down, values) in (1u32..).zip(rows) {
        for (right, val) in (0u32..).zip(values) {
            put(sheet, (col + right, row + down), val);
        }
    }
}

pub fn fill_sparse(sheet: &mut Worksheet, cells: &[(&str, CellVal)]) {
    for (a1, val) in cells {
        put(sheet, position(a1), val);
    }
}
