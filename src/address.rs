use anyhow::{Result, anyhow, bail};
use std::cmp::Ordering;
use std::fmt;

/// Largest row/column the xlsx format addresses.
pub const MAX_ROWS: u32 = 1_048_576;
pub const MAX_COLS: u32 = 16_384;

/// A single cell position, 0-based.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse `B7`, `$B$7` or `b7`.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let stripped: String = trimmed.chars().filter(|c| *c != '$').collect();
        let split_idx = stripped
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| anyhow!("invalid cell address '{}'", s))?;
        let (col_str, row_str) = stripped.split_at(split_idx);
        if col_str.is_empty() {
            bail!("invalid cell address '{}'", s);
        }

        let row = row_str
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid cell address '{}'", s))?;
        if row == 0 || row > MAX_ROWS {
            bail!("row out of range in '{}'", s);
        }
        let col = column_index(col_str).ok_or_else(|| anyhow!("invalid cell address '{}'", s))?;

        Ok(Self { row: row - 1, col })
    }

    pub fn to_a1(&self) -> String {
        format!("{}{}", column_name(self.col), self.row + 1)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_name(self.col), self.row + 1)
    }
}

impl Ord for CellRef {
    fn cmp(&self, other: &Self) -> Ordering {
        // Row-major ordering
        match self.row.cmp(&other.row) {
            Ordering::Equal => self.col.cmp(&other.col),
            ord => ord,
        }
    }
}

impl PartialOrd for CellRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Rectangular block of cells, inclusive on both ends.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RangeRef {
    pub start: CellRef,
    pub end: CellRef,
}

impl RangeRef {
    pub fn new(a: CellRef, b: CellRef) -> Self {
        Self {
            start: CellRef::new(a.row.min(b.row), a.col.min(b.col)),
            end: CellRef::new(a.row.max(b.row), a.col.max(b.col)),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((a, b)) => Ok(Self::new(CellRef::parse(a)?, CellRef::parse(b)?)),
            None => {
                let cell = CellRef::parse(s)?;
                Ok(Self::new(cell, cell))
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    pub fn height(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        cell.row >= self.start.row
            && cell.row <= self.end.row
            && cell.col >= self.start.col
            && cell.col <= self.end.col
    }

    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        (self.start.row..=self.end.row).flat_map(move |row| {
            (self.start.col..=self.end.col).map(move |col| CellRef::new(row, col))
        })
    }

    pub fn cell_count(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

impl fmt::Display for RangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Split `Sheet1!A1` / `'My Sheet'!A1:B2` into the unquoted sheet name and the rest.
pub fn split_sheet_qualifier(reference: &str) -> (Option<String>, &str) {
    let trimmed = reference.trim().trim_start_matches('=');
    let Some(bang) = trimmed.rfind('!') else {
        return (None, trimmed);
    };
    let (sheet_part, rest) = trimmed.split_at(bang);
    (Some(unquote_sheet_name(sheet_part)), &rest[1..])
}

pub fn unquote_sheet_name(sheet_part: &str) -> String {
    let trimmed = sheet_part.trim();
    if let Some(stripped) = trimmed.strip_prefix('\'')
        && let Some(inner) = stripped.strip_suffix('\'')
    {
        return inner.replace("''", "'");
    }
    trimmed.to_string()
}

pub fn sheet_part_matches(sheet_part: &str, name: &str) -> bool {
    unquote_sheet_name(sheet_part) == name
}

pub fn format_sheet_prefix(sheet_name: &str) -> String {
    if sheet_name_needs_quoting(sheet_name) {
        let escaped = sheet_name.replace('\'', "''");
        format!("'{escaped}'!")
    } else {
        format!("{sheet_name}!")
    }
}

fn sheet_name_needs_quoting(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let bytes = name.as_bytes();
    if bytes[0].is_ascii_digit() {
        return true;
    }
    for &byte in bytes {
        match byte {
            b' ' | b'!' | b'"' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+'
            | b',' | b'-' | b'.' | b'/' | b':' | b';' | b'<' | b'=' | b'>' | b'?' | b'@' | b'['
            | b'\\' | b']' | b'^' | b'`' | b'{' | b'|' | b'}' | b'~' => return true,
            _ => {}
        }
    }
    let upper = name.to_uppercase();
    matches!(
        upper.as_str(),
        "TRUE" | "FALSE" | "NULL" | "REF" | "DIV" | "NAME" | "NUM" | "VALUE" | "N/A"
    )
}

/// 0-based column index to letters (0 -> A, 26 -> AA).
pub fn column_name(col: u32) -> String {
    let mut n = col + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        out.push(b'A' + rem);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Column letters to a 0-based index. `None` for anything that isn't letters or is past XFD.
pub fn column_index(letters: &str) -> Option<u32> {
    let letters = letters.trim().trim_start_matches('$');
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut col: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        col = col * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    if col == 0 || col > MAX_COLS {
        return None;
    }
    Some(col - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let a1 = CellRef::parse("A1").unwrap();
        let b1 = CellRef::parse("B1").unwrap();
        let a2 = CellRef::parse("A2").unwrap();
        let aa1 = CellRef::parse("AA1").unwrap();

        assert!(a1 < b1);
        assert!(b1 < aa1); // B=2, AA=27
        assert!(aa1 < a2); // Row 1 < Row 2
    }

    #[test]
    fn parses_absolute_and_lowercase() {
        assert_eq!(CellRef::parse("$C$10").unwrap(), CellRef::new(9, 2));
        assert_eq!(CellRef::parse("c10").unwrap(), CellRef::new(9, 2));
        assert!(CellRef::parse("10").is_err());
        assert!(CellRef::parse("A0").is_err());
        assert!(CellRef::parse("XFE1").is_err());
    }

    #[test]
    fn column_names_round_trip_at_boundaries() {
        assert_eq!(column_name(0), "A");
        assert_eq!(column_name(25), "Z");
        assert_eq!(column_name(26), "AA");
        assert_eq!(column_name(16_383), "XFD");
        assert_eq!(column_index("xfd"), Some(16_383));
        assert_eq!(column_index("A1"), None);
    }

    #[test]
    fn range_normalizes_corners() {
        let range = RangeRef::parse("C5:A1").unwrap();
        assert_eq!(range.to_string(), "A1:C5");
        assert_eq!(range.width(), 3);
        assert_eq!(range.height(), 5);
        let cells: Vec<String> = RangeRef::parse("A1:B2")
            .unwrap()
            .cells()
            .map(|c| c.to_a1())
            .collect();
        assert_eq!(cells, vec!["A1", "B1", "A2", "B2"]);
    }

    #[test]
    fn splits_quoted_sheet_names() {
        let (sheet, rest) = split_sheet_qualifier("='Q1 ''24'!$A$1:$A$9");
        assert_eq!(sheet.as_deref(), Some("Q1 '24"));
        assert_eq!(rest, "$A$1:$A$9");
        assert_eq!(format_sheet_prefix("Q1 '24"), "'Q1 ''24'!");
        assert_eq!(format_sheet_prefix("Data"), "Data!");
    }
}
