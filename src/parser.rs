use crate::address::{CellRef, RangeRef, split_sheet_qualifier};
use crate::errors::UploadError;
use crate::model::{
    CellValue, DropdownValidation, MAX_SHEET_CELLS, MergeRange, NamedRange, ParsedWorkbook,
    SheetData,
};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use umya_spreadsheet::{CellRawValue, DataValidationValues, Spreadsheet, Worksheet};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

static LITERAL_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"(?P<items>.*)"$"#).expect("literal list regex"));

pub(crate) fn read_book(bytes: &[u8]) -> Result<Spreadsheet> {
    if bytes.is_empty() {
        return Err(UploadError::Empty.into());
    }
    if !bytes.starts_with(ZIP_MAGIC) {
        return Err(UploadError::NotXlsx.into());
    }
    umya_spreadsheet::reader::xlsx::read_reader(Cursor::new(bytes.to_vec()), true)
        .map_err(|e| UploadError::Unreadable(e.to_string()).into())
}

/// Parse uploaded xlsx bytes into the normalized workbook.
pub fn parse_workbook(bytes: &[u8], file_name: &str) -> Result<ParsedWorkbook> {
    let book = read_book(bytes)?;
    let mut parsed = ParsedWorkbook {
        file_name: file_name.to_string(),
        sheets: Vec::new(),
        named_ranges: collect_named_ranges(&book),
    };

    let mut pending = Vec::new();
    for sheet in book.get_sheet_collection() {
        let (data, validations) = read_sheet(sheet)?;
        pending.push((data.name.clone(), validations));
        parsed.sheets.push(data);
    }
    if parsed.sheets.is_empty() {
        return Err(UploadError::Unreadable("workbook has no sheets".to_string()).into());
    }

    // list sources may point at other sheets or names, so resolve after every sheet is loaded
    for (sheet_name, validations) in pending {
        let resolved: Vec<DropdownValidation> = validations
            .into_iter()
            .map(|mut dv| {
                if let Some(source) = dv.source.as_deref() {
                    dv.options = resolve_list_options(source, &sheet_name, &parsed);
                }
                dv
            })
            .collect();
        if let Some(sheet) = parsed.sheet_mut(&sheet_name) {
            sheet.validations = resolved;
        }
    }

    tracing::debug!(
        file = file_name,
        sheets = parsed.sheets.len(),
        names = parsed.named_ranges.len(),
        "parsed workbook"
    );
    Ok(parsed)
}

fn read_sheet(sheet: &Worksheet) -> Result<(SheetData, Vec<DropdownValidation>)> {
    let mut data = SheetData::new(sheet.get_name());

    let (rows, cols) = stored_extent(sheet);
    let area = u64::from(rows) * u64::from(cols);
    if area > MAX_SHEET_CELLS {
        return Err(UploadError::Unreadable(format!(
            "sheet '{}' spans {} rows x {} columns, more than {} cells",
            sheet.get_name(),
            rows,
            cols,
            MAX_SHEET_CELLS
        ))
        .into());
    }

    for cell in sheet.get_cell_collection() {
        let coord = cell.get_coordinate();
        let col = *coord.get_col_num();
        let row = *coord.get_row_num();
        if row == 0 || col == 0 {
            continue;
        }
        let (row, col) = (row - 1, col - 1);
        let cv = cell.get_cell_value();
        let value = cell_value_from_umya(cv);

        if cv.is_formula() && !cv.get_formula().is_empty() {
            let formula = cv.get_formula();
            data.formulas
                .insert(CellRef::new(row, col).to_a1(), with_equals(formula));
            data.set(row, col, value);
        } else if !value.is_empty() {
            data.set(row, col, value);
        }
    }

    // IndexMap keeps insertion order; make it row-major regardless of file order
    data.formulas.sort_by(|a, _, b, _| match (CellRef::parse(a), CellRef::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    });

    for merge in sheet.get_merge_cells().iter() {
        if let Ok(range) = RangeRef::parse(&merge.get_range()) {
            data.merges.push(MergeRange {
                start_row: range.start.row,
                start_col: range.start.col,
                end_row: range.end.row,
                end_col: range.end.col,
            });
        }
    }

    for column in sheet.get_column_dimensions().iter() {
        let col = *column.get_col_num();
        let width = *column.get_width();
        if col > 0 && width > 0.0 {
            data.column_widths.insert(col - 1, width);
        }
    }

    for row in sheet.get_row_dimensions().iter() {
        let row_num = *row.get_row_num();
        let height = *row.get_height();
        if row_num > 0 && height > 0.0 {
            data.row_heights.insert(row_num - 1, height);
        }
    }

    let mut validations = Vec::new();
    if let Some(dvs) = sheet.get_data_validations() {
        for (idx, dv) in dvs.get_data_validation_list().iter().enumerate() {
            if dv.get_type() != &DataValidationValues::List {
                continue;
            }
            let formula = dv.get_formula1().trim().trim_start_matches('=').to_string();
            validations.push(DropdownValidation {
                range: dv.get_sequence_of_references().get_sqref().to_string(),
                options: Vec::new(),
                source: if formula.is_empty() {
                    None
                } else {
                    Some(formula)
                },
                allow_blank: *dv.get_allow_blank(),
                origin: Some(idx),
            });
        }
    }

    Ok((data, validations))
}

/// Rows and columns the normalized grid needs for the cells worth keeping.
fn stored_extent(sheet: &Worksheet) -> (u32, u32) {
    sheet
        .get_cell_collection()
        .into_iter()
        .filter(|cell| {
            let cv = cell.get_cell_value();
            !cv.get_raw_value().is_empty() || cv.is_formula()
        })
        .map(|cell| {
            let coord = cell.get_coordinate();
            (*coord.get_row_num(), *coord.get_col_num())
        })
        .fold((0, 0), |(rows, cols), (r, c)| (rows.max(r), cols.max(c)))
}

pub(crate) fn cell_value_from_umya(cv: &umya_spreadsheet::CellValue) -> CellValue {
    let raw = cv.get_raw_value();
    if raw.is_empty() {
        return CellValue::Empty;
    }
    if raw.is_error() {
        return CellValue::error(cv.get_value().to_string());
    }
    match raw {
        CellRawValue::Numeric(n) => CellValue::Number(*n),
        CellRawValue::Bool(b) => CellValue::Bool(*b),
        CellRawValue::String(s) => CellValue::Text(s.to_string()),
        CellRawValue::RichText(rt) => CellValue::Text(rt.get_text().to_string()),
        CellRawValue::Lazy(s) => CellValue::from_input(s.as_ref()),
        CellRawValue::Error(_) => CellValue::error(cv.get_value().to_string()),
        CellRawValue::Empty => CellValue::Empty,
    }
}

fn with_equals(formula: &str) -> String {
    if formula.starts_with('=') {
        formula.to_string()
    } else {
        format!("={formula}")
    }
}

fn collect_named_ranges(book: &Spreadsheet) -> Vec<NamedRange> {
    let sheet_names: Vec<String> = book
        .get_sheet_collection()
        .iter()
        .map(|s| s.get_name().to_string())
        .collect();

    let mut out: Vec<NamedRange> = Vec::new();
    let mut push = |name: &str, address: String, scope: Option<String>| {
        if name.starts_with("_xlnm.") {
            return;
        }
        if out.iter().any(|n| n.name == name && n.scope == scope) {
            return;
        }
        out.push(NamedRange {
            name: name.to_string(),
            reference: address.trim_start_matches('=').to_string(),
            scope,
        });
    };

    for defined in book.get_defined_names() {
        let scope = defined
            .has_local_sheet_id()
            .then(|| sheet_names.get(*defined.get_local_sheet_id() as usize).cloned())
            .flatten();
        push(defined.get_name(), defined.get_address().to_string(), scope);
    }
    for sheet in book.get_sheet_collection() {
        for defined in sheet.get_defined_names() {
            let scope = defined
                .has_local_sheet_id()
                .then(|| sheet_names.get(*defined.get_local_sheet_id() as usize).cloned())
                .flatten();
            push(defined.get_name(), defined.get_address().to_string(), scope);
        }
    }
    out
}

/// Options for a list validation: a quoted literal list, a range, or a name that points at one.
pub fn resolve_list_options(
    source: &str,
    host_sheet: &str,
    workbook: &ParsedWorkbook,
) -> Vec<String> {
    let source = source.trim().trim_start_matches('=');
    if let Some(caps) = LITERAL_LIST.captures(source) {
        return caps["items"]
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let reference = match workbook.named_ranges.iter().find(|n| {
        n.name.eq_ignore_ascii_case(source)
            && (n.scope.is_none() || n.scope.as_deref() == Some(host_sheet))
    }) {
        Some(named) => named.reference.clone(),
        None => source.to_string(),
    };

    let (sheet_name, coords) = split_sheet_qualifier(&reference);
    let sheet_name = sheet_name.unwrap_or_else(|| host_sheet.to_string());
    let (Some(sheet), Ok(range)) = (workbook.sheet(&sheet_name), RangeRef::parse(coords)) else {
        return Vec::new();
    };

    range
        .cells()
        .map(|cell| sheet.get(cell.row, cell.col).display())
        .filter(|s| !s.is_empty())
        .collect()
}
