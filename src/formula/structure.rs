//! Reference rewriting for row/column inserts and deletes.
//!
//! Formulas are tokenized rather than parsed so untouched text (spacing, function
//! casing, string literals) survives byte for byte. Only range tokens that point at
//! the edited sheet are rewritten.

use crate::address::{MAX_COLS, MAX_ROWS, column_index, column_name, sheet_part_matches};
use crate::model::MergeRange;
use anyhow::{Result, anyhow};
use formualizer_parse::{TokenSubType, Tokenizer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Row,
    Col,
}

/// Positions are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructureEdit {
    Insert { at: u32, count: u32 },
    Delete { start: u32, count: u32 },
}

/// One structural edit as journaled by a session and replayed on export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralChange {
    pub sheet: String,
    pub axis: Axis,
    pub edit: StructureEdit,
}

impl Axis {
    /// Number of addressable rows or columns.
    pub fn limit(self) -> u32 {
        match self {
            Axis::Row => MAX_ROWS,
            Axis::Col => MAX_COLS,
        }
    }
}

impl StructuralChange {
    pub fn new(sheet: impl Into<String>, axis: Axis, edit: StructureEdit) -> Self {
        Self {
            sheet: sheet.into(),
            axis,
            edit,
        }
    }
}

/// New position of a single row/column, `None` when it was deleted.
/// Inserts saturate; callers bound the result against [`Axis::limit`].
pub fn adjust_index(value: u32, edit: StructureEdit) -> Option<u32> {
    match edit {
        StructureEdit::Insert { at, count } => {
            if value >= at {
                Some(value.saturating_add(count))
            } else {
                Some(value)
            }
        }
        StructureEdit::Delete { start, count } => {
            let end = start.saturating_add(count.saturating_sub(1));
            if value >= start && value <= end {
                None
            } else if value > end {
                Some(value - count)
            } else {
                Some(value)
            }
        }
    }
}

/// New bounds of an inclusive span. Deletes shrink the span; it disappears only when
/// every row/column of it was deleted.
pub fn adjust_span(start: u32, end: u32, edit: StructureEdit) -> Option<(u32, u32)> {
    match edit {
        StructureEdit::Insert { .. } => {
            Some((adjust_index(start, edit)?, adjust_index(end, edit)?))
        }
        StructureEdit::Delete {
            start: del_start,
            count,
        } => {
            let del_end = del_start.saturating_add(count.saturating_sub(1));
            if start >= del_start && end <= del_end {
                return None;
            }
            let new_start = if start < del_start {
                start
            } else if start > del_end {
                start - count
            } else {
                del_start
            };
            let new_end = if end < del_start {
                end
            } else if end > del_end {
                end - count
            } else {
                del_start - 1
            };
            Some((new_start, new_end))
        }
    }
}

/// Rewrite every reference in `formula` that targets `change.sheet`.
///
/// `host_sheet` is the sheet the formula lives on; unqualified references are only
/// rewritten when it matches. Pass `None` for text with no host (defined names).
/// Returns `None` when nothing changed.
pub fn rewrite_formula(
    formula: &str,
    host_sheet: Option<&str>,
    change: &StructuralChange,
) -> Result<Option<String>> {
    let had_equals = formula.trim_start().starts_with('=');
    let formula_in = if had_equals {
        formula.trim_start().to_string()
    } else {
        format!("={}", formula.trim_start())
    };

    let tokenizer = Tokenizer::new(&formula_in)
        .map_err(|e| anyhow!("failed to tokenize formula: {}", e.message))?;

    let mut out = String::with_capacity(formula_in.len());
    let mut cursor = 0usize;
    let mut changed = false;

    for token in &tokenizer.items {
        if token.start > cursor {
            out.push_str(&formula_in[cursor..token.start]);
        }

        let mut value = token.value.clone();
        if token.subtype == TokenSubType::Range
            && let Some(rewritten) = rewrite_range_token(&value, host_sheet, change)
        {
            value = rewritten;
            changed = true;
        }

        out.push_str(&value);
        cursor = token.end;
    }

    if cursor < formula_in.len() {
        out.push_str(&formula_in[cursor..]);
    }

    if !changed {
        return Ok(None);
    }
    if had_equals {
        Ok(Some(out))
    } else {
        Ok(Some(out.strip_prefix('=').unwrap_or(&out).to_string()))
    }
}

fn rewrite_range_token(
    token: &str,
    host_sheet: Option<&str>,
    change: &StructuralChange,
) -> Option<String> {
    let (sheet_part, coord_part) = match token.rfind('!') {
        Some(idx) => (Some(&token[..idx]), &token[idx + 1..]),
        None => (None, token),
    };

    let targets_sheet = match sheet_part {
        Some(part) => sheet_part_matches(part, &change.sheet),
        None => host_sheet == Some(change.sheet.as_str()),
    };
    if !targets_sheet {
        return None;
    }

    let adjusted = adjust_coord_part(coord_part, change.axis, change.edit)?;
    if adjusted == coord_part {
        return None;
    }
    if adjusted == "#REF!" {
        return Some(adjusted);
    }
    Some(match sheet_part {
        Some(part) => format!("{part}!{adjusted}"),
        None => adjusted,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RefSegment {
    col: Option<(u32, bool)>,
    row: Option<(u32, bool)>,
}

impl RefSegment {
    /// Strict: `A1`, `$A$1`, `A`, `$A`, `1`, `$1`. Anything else (names, errors) is `None`.
    fn parse(segment: &str) -> Option<Self> {
        let bytes = segment.as_bytes();
        let mut idx = 0;

        let col_abs = bytes.get(idx) == Some(&b'$');
        if col_abs {
            idx += 1;
        }
        let letters_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
            idx += 1;
        }
        let letters = &segment[letters_start..idx];

        let mut row_abs = false;
        if idx < bytes.len() && bytes[idx] == b'$' {
            row_abs = true;
            idx += 1;
        }
        let digits_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx != bytes.len() {
            return None;
        }
        let digits = &segment[digits_start..idx];

        let col = if letters.is_empty() {
            None
        } else {
            Some((column_index(letters)?, col_abs))
        };
        let row = if digits.is_empty() {
            None
        } else {
            let n: u32 = digits.parse().ok()?;
            if n == 0 {
                return None;
            }
            Some((n - 1, row_abs))
        };

        match (col, row) {
            (None, None) => None,
            // `$5` style: the leading `$` belonged to the row
            (None, Some((r, _))) => Some(Self {
                col: None,
                row: Some((r, col_abs || row_abs)),
            }),
            _ => Some(Self { col, row }),
        }
    }

    fn kind(&self) -> (bool, bool) {
        (self.col.is_some(), self.row.is_some())
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some((c, abs)) = self.col {
            if abs {
                out.push('$');
            }
            out.push_str(&column_name(c));
        }
        if let Some((r, abs)) = self.row {
            if abs {
                out.push('$');
            }
            out.push_str(&(r + 1).to_string());
        }
        out
    }
}

/// Adjust the coordinate part of a reference (`A1`, `$A$1:B9`, `C:D`, `3:7`).
/// `None` when the text is not a plain reference and must be left alone.
fn adjust_coord_part(coord_part: &str, axis: Axis, edit: StructureEdit) -> Option<String> {
    if let Some((start, end)) = coord_part.split_once(':') {
        let mut a = RefSegment::parse(start)?;
        let mut b = RefSegment::parse(end)?;
        if a.kind() != b.kind() {
            return None;
        }
        let (lo, hi) = match axis {
            Axis::Row => (a.row, b.row),
            Axis::Col => (a.col, b.col),
        };
        let (Some((lo, lo_abs)), Some((hi, hi_abs))) = (lo, hi) else {
            // e.g. a column-only range under a row edit
            return Some(coord_part.to_string());
        };
        let Some((new_lo, new_hi)) = bounded_span(lo.min(hi), lo.max(hi), axis, edit) else {
            return Some("#REF!".to_string());
        };
        match axis {
            Axis::Row => {
                a.row = Some((new_lo, lo_abs));
                b.row = Some((new_hi, hi_abs));
            }
            Axis::Col => {
                a.col = Some((new_lo, lo_abs));
                b.col = Some((new_hi, hi_abs));
            }
        }
        Some(format!("{}:{}", a.render(), b.render()))
    } else {
        let mut seg = RefSegment::parse(coord_part)?;
        if seg.kind() != (true, true) {
            return None;
        }
        let slot = match axis {
            Axis::Row => &mut seg.row,
            Axis::Col => &mut seg.col,
        };
        if let Some((value, abs)) = *slot {
            match adjust_index(value, edit).filter(|v| *v < axis.limit()) {
                Some(moved) => *slot = Some((moved, abs)),
                None => return Some("#REF!".to_string()),
            }
        }
        Some(seg.render())
    }
}

/// `adjust_span` clipped to the sheet: an end pushed past the last row/column stops
/// there, a span pushed off entirely is gone.
fn bounded_span(start: u32, end: u32, axis: Axis, edit: StructureEdit) -> Option<(u32, u32)> {
    let last = axis.limit() - 1;
    let (start, end) = adjust_span(start, end, edit)?;
    (start <= last).then(|| (start, end.min(last)))
}

/// Rewrite a bare reference such as a defined name's target (`Sheet1!$A$1:$A$9`).
pub fn rewrite_reference(
    reference: &str,
    host_sheet: Option<&str>,
    change: &StructuralChange,
) -> Result<String> {
    Ok(rewrite_formula(reference, host_sheet, change)?.unwrap_or_else(|| reference.to_string()))
}

/// Rewrite a validation/conditional sqref (space separated areas on the edited sheet).
/// Areas that were deleted entirely are dropped; `None` when nothing is left.
pub fn rewrite_sqref(sqref: &str, axis: Axis, edit: StructureEdit) -> Option<String> {
    let mut areas = Vec::new();
    for area in sqref.split_whitespace() {
        match adjust_coord_part(area, axis, edit) {
            Some(adjusted) if adjusted == "#REF!" => {}
            Some(adjusted) => areas.push(adjusted),
            None => areas.push(area.to_string()),
        }
    }
    if areas.is_empty() {
        None
    } else {
        Some(areas.join(" "))
    }
}

pub fn adjust_merge(merge: MergeRange, axis: Axis, edit: StructureEdit) -> Option<MergeRange> {
    let mut out = merge;
    match axis {
        Axis::Row => {
            let (s, e) = bounded_span(merge.start_row, merge.end_row, axis, edit)?;
            out.start_row = s;
            out.end_row = e;
        }
        Axis::Col => {
            let (s, e) = bounded_span(merge.start_col, merge.end_col, axis, edit)?;
            out.start_col = s;
            out.end_col = e;
        }
    }
    // a merge collapsed to one cell is no longer a merge
    if out.start_row == out.end_row && out.start_col == out.end_col {
        return None;
    }
    Some(out)
}

/// Re-key a per-row or per-column map (widths, heights) after an edit on that axis.
pub fn shift_keys<V: Clone>(
    map: &BTreeMap<u32, V>,
    axis: Axis,
    edit: StructureEdit,
) -> BTreeMap<u32, V> {
    map.iter()
        .filter_map(|(k, v)| {
            let moved = adjust_index(*k, edit).filter(|nk| *nk < axis.limit())?;
            Some((moved, v.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(sheet: &str, edit: StructureEdit) -> StructuralChange {
        StructuralChange::new(sheet, Axis::Row, edit)
    }

    #[test]
    fn insert_moves_refs_at_or_after_point() {
        let change = rows("Sheet1", StructureEdit::Insert { at: 1, count: 2 });
        let out = rewrite_formula("=A1+A2+$B$5", Some("Sheet1"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=A1+A4+$B$7");
    }

    #[test]
    fn other_sheets_only_follow_qualified_refs() {
        let change = rows("Data", StructureEdit::Insert { at: 0, count: 1 });
        let out = rewrite_formula("=A1+Data!A1+'Data'!B2", Some("Summary"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=A1+Data!A2+'Data'!B3");
        assert!(
            rewrite_formula("=A1", Some("Summary"), &change)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn delete_shrinks_ranges_and_breaks_cells() {
        let change = rows("S", StructureEdit::Delete { start: 4, count: 1 });
        let out = rewrite_formula("=SUM(A1:A10)+A5+A6", Some("S"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=SUM(A1:A9)+#REF!+A5");
    }

    #[test]
    fn deleting_a_whole_range_gives_ref_error() {
        let change = rows("S", StructureEdit::Delete { start: 1, count: 3 });
        let out = rewrite_formula("=SUM(B2:B4)", Some("S"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=SUM(#REF!)");
    }

    #[test]
    fn names_and_strings_are_left_alone() {
        let edit = StructureEdit::Insert { at: 0, count: 1 };
        let change = StructuralChange::new("S", Axis::Col, edit);
        let out = rewrite_formula("=Rates*A1&\"A1\"", Some("S"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=Rates*B1&\"A1\"");
    }

    #[test]
    fn column_only_ranges_follow_column_edits() {
        let edit = StructureEdit::Delete { start: 0, count: 1 };
        let change = StructuralChange::new("S", Axis::Col, edit);
        let out = rewrite_formula("=SUM(B:C)", Some("S"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=SUM(A:B)");
    }

    #[test]
    fn sqref_drops_deleted_areas() {
        let edit = StructureEdit::Delete { start: 0, count: 1 };
        assert_eq!(rewrite_sqref("A1 B2:B5", Axis::Row, edit).as_deref(), Some("B1:B4"));
        assert_eq!(rewrite_sqref("A1", Axis::Row, edit), None);
    }

    #[test]
    fn merges_collapse_when_reduced_to_one_cell() {
        let merge = MergeRange {
            start_row: 0,
            start_col: 0,
            end_row: 1,
            end_col: 0,
        };
        let edit = StructureEdit::Delete { start: 1, count: 1 };
        assert_eq!(adjust_merge(merge, Axis::Row, edit), None);
        let edit = StructureEdit::Insert { at: 1, count: 1 };
        assert_eq!(
            adjust_merge(merge, Axis::Row, edit).map(|m| m.end_row),
            Some(2)
        );
    }

    #[test]
    fn span_insert_inside_expands() {
        let inside = StructureEdit::Insert { at: 3, count: 2 };
        let at_start = StructureEdit::Insert { at: 2, count: 1 };
        assert_eq!(adjust_span(2, 5, inside), Some((2, 7)));
        assert_eq!(adjust_span(2, 5, at_start), Some((3, 6)));
    }

    #[test]
    fn huge_inserts_saturate_instead_of_overflowing() {
        let edit = StructureEdit::Insert { at: 4, count: u32::MAX };
        assert_eq!(adjust_index(9, edit), Some(u32::MAX));
        let change = rows("S", edit);
        let out = rewrite_formula("=A10+SUM(A1:A20)", Some("S"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=#REF!+SUM(A1:A1048576)");
    }

    #[test]
    fn references_pushed_off_the_sheet_break() {
        let change = rows("S", StructureEdit::Insert { at: 0, count: 2 });
        let out = rewrite_formula("=A1048575+A2", Some("S"), &change)
            .unwrap()
            .unwrap();
        assert_eq!(out, "=#REF!+A4");
        let mut widths = BTreeMap::new();
        widths.insert(MAX_ROWS - 1, 20.0);
        widths.insert(0, 12.0);
        let moved = shift_keys(&widths, Axis::Row, change.edit);
        assert_eq!(moved.into_iter().collect::<Vec<_>>(), vec![(2, 12.0)]);
    }
}
