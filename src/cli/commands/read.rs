use anyhow::Result;
use serde_json::Value;
use std::path::PathBuf;

use crate::runtime::stateless::StatelessRuntime;

pub async fn inspect(runtime: &StatelessRuntime, file: PathBuf) -> Result<Value> {
    let session = runtime.open_session(&file).await?;
    Ok(serde_json::to_value(session.summary())?)
}

pub async fn view(
    runtime: &StatelessRuntime,
    file: PathBuf,
    sheet: Option<String>,
) -> Result<Value> {
    let mut session = runtime.open_session(&file).await?;
    let view = session.view(sheet.as_deref())?;
    Ok(serde_json::to_value(view)?)
}
