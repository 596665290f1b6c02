use anyhow::Result;
use serde_json::Value;
use std::io::Write;

pub fn emit_value(value: &Value, compact: bool, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let mut out = std::io::stdout().lock();
    if compact {
        serde_json::to_writer(&mut out, value)?;
    } else {
        serde_json::to_writer_pretty(&mut out, value)?;
    }
    out.write_all(b"\n")?;
    Ok(())
}
