use anyhow::Result;
use serde_json::{Value, json};
use std::path::PathBuf;

use crate::export::ExportMode;
use crate::runtime::stateless::StatelessRuntime;

pub async fn apply(
    runtime: &StatelessRuntime,
    file: PathBuf,
    changes: PathBuf,
    out: PathBuf,
    mode: ExportMode,
) -> Result<Value> {
    let ops = runtime.read_changes(&changes)?;
    let mut session = runtime.open_session(&file).await?;
    let summary = session.apply_changes(&ops);
    let revision = session.revision();
    let bytes = runtime.export(session, mode).await?;
    let written = runtime.write_output(&out, &bytes, "apply")?;

    Ok(json!({
        "out": written.display().to_string(),
        "mode": mode.to_string(),
        "bytes": bytes.len(),
        "revision": revision,
        "summary": summary,
    }))
}
