use crate::errors::{AssistantUnavailable, InvalidParamsError, UploadError};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub try_this: Option<String>,
}

impl ErrorEnvelope {
    fn new(code: &str, message: String) -> Self {
        Self {
            code: code.to_string(),
            message,
            try_this: None,
        }
    }

    fn try_this(mut self, hint: &str) -> Self {
        self.try_this = Some(hint.to_string());
        self
    }
}

pub fn envelope_for(error: &anyhow::Error) -> ErrorEnvelope {
    let message = error.to_string();

    if error.is::<AssistantUnavailable>() {
        return ErrorEnvelope::new("ASSISTANT_UNAVAILABLE", message)
            .try_this("set SHEETPILOT_API_KEY or pass --api-key");
    }

    if error.is::<UploadError>() {
        return ErrorEnvelope::new("INVALID_WORKBOOK", message)
            .try_this("pass an .xlsx file saved by Excel or a compatible editor");
    }

    if let Some(invalid) = error.downcast_ref::<InvalidParamsError>() {
        if invalid.message().contains("within workspace_root") {
            return ErrorEnvelope::new("PATH_OUTSIDE_WORKSPACE", invalid.message().to_string())
                .try_this("write under --workspace-root or change it");
        }
        let mut envelope = ErrorEnvelope::new("INVALID_ARGUMENT", invalid.message().to_string());
        if invalid.path() == Some("changes") {
            envelope = envelope.try_this(
                "pass a JSON array like [{\"kind\":\"set_value\",\"cell\":\"A1\",\"value\":1}]",
            );
        }
        if invalid.path() == Some("sheet") {
            envelope = envelope.try_this("run `sheetpilot-cli inspect <file>` to list sheet names");
        }
        return envelope;
    }

    if message.contains("does not exist") {
        return ErrorEnvelope::new("FILE_NOT_FOUND", message)
            .try_this("check the workbook path and permissions");
    }

    ErrorEnvelope::new("COMMAND_FAILED", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_map_to_codes() {
        let err = anyhow::Error::new(AssistantUnavailable);
        assert_eq!(envelope_for(&err).code, "ASSISTANT_UNAVAILABLE");

        let err = anyhow::Error::new(UploadError::NotXlsx);
        assert_eq!(envelope_for(&err).code, "INVALID_WORKBOOK");

        let err = anyhow::Error::new(
            InvalidParamsError::new("apply", "at least one change is required")
                .with_path("changes"),
        );
        let envelope = envelope_for(&err);
        assert_eq!(envelope.code, "INVALID_ARGUMENT");
        assert_eq!(envelope.message, "at least one change is required");
        assert!(envelope.try_this.is_some());
    }

    #[test]
    fn message_fallbacks() {
        let err = anyhow::anyhow!("workbook \"/tmp/x.xlsx\" does not exist");
        assert_eq!(envelope_for(&err).code, "FILE_NOT_FOUND");

        let err = anyhow::anyhow!("boom");
        let envelope = envelope_for(&err);
        assert_eq!(envelope.code, "COMMAND_FAILED");
        assert!(envelope.try_this.is_none());
    }
}
