use crate::address::{MAX_COLS, MAX_ROWS};
use anyhow::{Result, anyhow, bail};
use formualizer_parse::parser::ReferenceType;
use formualizer_parse::pretty::canonical_formula;
use formualizer_parse::{ASTNode, ASTNodeType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How references move when a formula is copied to another cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RelativeMode {
    /// `$` anchors are honored, everything else moves.
    #[default]
    Excel,
    /// Columns are pinned as if written with `$`.
    AbsCols,
    /// Rows are pinned as if written with `$`.
    AbsRows,
}

pub fn parse_base_formula(formula: &str) -> Result<ASTNode> {
    let body = formula.trim();
    let source = match body.strip_prefix('=') {
        Some(_) => body.to_string(),
        None => format!("={body}"),
    };
    formualizer_parse::parse(&source)
        .map_err(|e| anyhow!("failed to parse formula '{}': {}", body, e.message))
}

/// Copy of `ast` moved `delta_row`/`delta_col` away, rendered with its leading `=`.
///
/// Fails when a moved reference would leave the sheet in either direction.
pub fn shift_formula_ast(
    ast: &ASTNode,
    delta_col: i32,
    delta_row: i32,
    mode: RelativeMode,
) -> Result<String> {
    let offset = Offset {
        rows: delta_row,
        cols: delta_col,
        mode,
    };
    let mut moved = ast.clone();
    offset.visit(&mut moved)?;
    let text = canonical_formula(&moved);
    Ok(match text.strip_prefix('=') {
        Some(_) => text,
        None => format!("={text}"),
    })
}

#[cfg(test)]
fn shift_formula(formula: &str, cols: i32, rows: i32, mode: RelativeMode) -> Result<String> {
    shift_formula_ast(&parse_base_formula(formula)?, cols, rows, mode)
}

struct Offset {
    rows: i32,
    cols: i32,
    mode: RelativeMode,
}

impl Offset {
    fn visit(&self, node: &mut ASTNode) -> Result<()> {
        match &mut node.node_type {
            ASTNodeType::Reference {
                original,
                reference,
            } => {
                if self.move_reference(reference)? {
                    *original = reference.to_string();
                }
                Ok(())
            }
            ASTNodeType::UnaryOp { expr, .. } => self.visit(expr),
            ASTNodeType::BinaryOp { left, right, .. } => {
                self.visit(left)?;
                self.visit(right)
            }
            ASTNodeType::Function { args, .. } => args.iter_mut().try_for_each(|a| self.visit(a)),
            ASTNodeType::Array(rows) => rows
                .iter_mut()
                .flat_map(|row| row.iter_mut())
                .try_for_each(|item| self.visit(item)),
            ASTNodeType::Literal(_) => Ok(()),
        }
    }

    /// `false` for references that never move (names, tables, external links).
    fn move_reference(&self, reference: &mut ReferenceType) -> Result<bool> {
        let pin_cols = self.mode == RelativeMode::AbsCols;
        let pin_rows = self.mode == RelativeMode::AbsRows;
        match reference {
            ReferenceType::Cell {
                row,
                col,
                row_abs,
                col_abs,
                ..
            } => {
                *col_abs |= pin_cols;
                *row_abs |= pin_rows;
                *col = step(*col, *col_abs, self.cols, MAX_COLS, "column")?;
                *row = step(*row, *row_abs, self.rows, MAX_ROWS, "row")?;
            }
            ReferenceType::Range {
                start_row,
                start_col,
                end_row,
                end_col,
                start_row_abs,
                start_col_abs,
                end_row_abs,
                end_col_abs,
                ..
            } => {
                *start_col_abs |= pin_cols && start_col.is_some();
                *end_col_abs |= pin_cols && end_col.is_some();
                *start_row_abs |= pin_rows && start_row.is_some();
                *end_row_abs |= pin_rows && end_row.is_some();
                for (slot, abs) in [(start_col, *start_col_abs), (end_col, *end_col_abs)] {
                    if let Some(v) = slot.as_mut() {
                        *v = step(*v, abs, self.cols, MAX_COLS, "column")?;
                    }
                }
                for (slot, abs) in [(start_row, *start_row_abs), (end_row, *end_row_abs)] {
                    if let Some(v) = slot.as_mut() {
                        *v = step(*v, abs, self.rows, MAX_ROWS, "row")?;
                    }
                }
            }
            ReferenceType::Table(_) | ReferenceType::NamedRange(_) | ReferenceType::External(_) => {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Move a 1-based coordinate, keeping it within `1..=limit`.
fn step(value: u32, anchored: bool, delta: i32, limit: u32, axis: &str) -> Result<u32> {
    if anchored || delta == 0 {
        return Ok(value);
    }
    let moved = i64::from(value) + i64::from(delta);
    if moved < 1 {
        bail!("{axis} reference would move before the first {axis}");
    }
    if moved > i64::from(limit) {
        bail!("{axis} reference would move past the last {axis} ({limit})");
    }
    Ok(moved as u32)
}
