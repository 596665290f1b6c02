use crate::address::CellRef;
use crate::changes::{ChangeOp, apply_changes, refresh_cached_values};
use crate::errors::InvalidParamsError;
use crate::export::{ExportMode, export_workbook};
use crate::formula::StructuralChange;
use crate::grid::{GridEngine, GridView};
use crate::model::{ChangeSummary, ParsedWorkbook, SessionId, SheetSummary, WorkbookSummary};
use crate::parser::parse_workbook;
use anyhow::Result;
use sha2::{Digest, Sha256};

/// One uploaded workbook being edited: the original bytes, normalized data, and the live grid
/// for the active sheet.
pub struct WorkbookSession {
    id: SessionId,
    original: Vec<u8>,
    source_sha256: String,
    workbook: ParsedWorkbook,
    active_sheet: String,
    grid: GridEngine,
    journal: Vec<StructuralChange>,
    revision: u64,
}

impl WorkbookSession {
    pub fn open(bytes: Vec<u8>, file_name: &str) -> Result<Self> {
        let mut workbook = parse_workbook(&bytes, file_name)?;
        let active_sheet = workbook
            .sheets
            .first()
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let grid = GridEngine::load(&workbook, &active_sheet)?;
        // files written without cached results still show computed values
        refresh_cached_values(&mut workbook, &grid);
        let source_sha256 = format!("{:x}", Sha256::digest(&bytes));
        let id = SessionId::generate();
        tracing::info!(
            session_id = %id,
            file = file_name,
            sheets = workbook.sheets.len(),
            "opened workbook session"
        );
        Ok(Self {
            id,
            original: bytes,
            source_sha256,
            workbook,
            active_sheet,
            grid,
            journal: Vec::new(),
            revision: 0,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.workbook.file_name
    }

    pub fn active_sheet(&self) -> &str {
        &self.active_sheet
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn workbook(&self) -> &ParsedWorkbook {
        &self.workbook
    }

    pub fn journal(&self) -> &[StructuralChange] {
        &self.journal
    }

    fn require_sheet(&self, tool: &'static str, name: &str) -> Result<()> {
        if self.workbook.has_sheet(name) {
            Ok(())
        } else {
            Err(InvalidParamsError::new(tool, format!("sheet '{}' not found", name))
                .with_path("sheet")
                .into())
        }
    }

    /// Make `name` the active sheet and rebuild the grid around it.
    pub fn switch_sheet(&mut self, name: &str) -> Result<GridView> {
        self.require_sheet("switch_sheet", name)?;
        if name != self.active_sheet {
            self.grid = GridEngine::load(&self.workbook, name)?;
            self.active_sheet = name.to_string();
            tracing::debug!(session_id = %self.id, sheet = name, "switched active sheet");
        }
        self.grid.render(&self.workbook)
    }

    /// Typed-in edit from the grid UI. Text starting with `=` is a formula; numbers and
    /// booleans are recognized.
    pub fn set_cell(
        &mut self,
        sheet: Option<&str>,
        cell: &str,
        input: &str,
    ) -> Result<ChangeSummary> {
        if let Some(sheet) = sheet {
            self.require_sheet("set_cell", sheet)?;
        }
        CellRef::parse(cell).map_err(|e| {
            InvalidParamsError::new("set_cell", e.to_string()).with_path("cell")
        })?;

        let sheet = sheet.map(str::to_string);
        let op = match input.trim_start().strip_prefix('=') {
            Some(formula) => ChangeOp::SetFormula {
                sheet,
                cell: cell.to_string(),
                formula: formula.to_string(),
            },
            None => ChangeOp::SetValue {
                sheet,
                cell: cell.to_string(),
                value: serde_json::to_value(crate::model::CellValue::from_input(input))?,
            },
        };

        let summary = self.apply_changes(std::slice::from_ref(&op));
        if summary.ops_applied == 0 {
            let message = summary
                .warnings
                .first()
                .map(|w| w.message.clone())
                .unwrap_or_else(|| format!("could not set {}", cell));
            return Err(InvalidParamsError::new("set_cell", message)
                .with_path("input")
                .into());
        }
        Ok(summary)
    }

    pub fn apply_changes(&mut self, ops: &[ChangeOp]) -> ChangeSummary {
        let outcome = apply_changes(
            &mut self.workbook,
            Some(&mut self.grid),
            &self.active_sheet,
            ops,
        );
        self.journal.extend(outcome.structural);
        if outcome.summary.ops_applied > 0 {
            self.revision += 1;
        }
        tracing::info!(
            session_id = %self.id,
            applied = outcome.summary.ops_applied,
            skipped = outcome.summary.ops_skipped,
            revision = self.revision,
            "applied changes"
        );
        outcome.summary
    }

    /// Render `sheet` (default: the active one). Inactive sheets are evaluated with a
    /// throwaway grid so the active one is left alone.
    pub fn view(&mut self, sheet: Option<&str>) -> Result<GridView> {
        match sheet {
            None => self.grid.render(&self.workbook),
            Some(name) if name == self.active_sheet => self.grid.render(&self.workbook),
            Some(name) => {
                self.require_sheet("view", name)?;
                GridEngine::load(&self.workbook, name)?.render(&self.workbook)
            }
        }
    }

    pub fn summary(&self) -> WorkbookSummary {
        WorkbookSummary {
            session_id: self.id.clone(),
            file_name: self.workbook.file_name.clone(),
            active_sheet: self.active_sheet.clone(),
            revision: self.revision,
            source_sha256: self.source_sha256.clone(),
            sheets: self.workbook.sheets.iter().map(SheetSummary::from).collect(),
            named_ranges: self.workbook.named_ranges.clone(),
        }
    }

    pub fn export(&self, mode: ExportMode) -> Result<Vec<u8>> {
        let bytes = export_workbook(&self.workbook, mode, Some(&self.original), &self.journal)?;
        tracing::info!(
            session_id = %self.id,
            mode = %mode,
            bytes = bytes.len(),
            "exported workbook"
        );
        Ok(bytes)
    }
}
