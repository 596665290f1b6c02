use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct InvalidParamsError {
    tool: &'static str,
    message: String,
    path: Option<String>,
}

impl InvalidParamsError {
    pub fn new(tool: &'static str, message: impl Into<String>) -> Self {
        Self {
            tool,
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn tool(&self) -> &'static str {
        self.tool
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

#[derive(Debug, Error)]
#[error("workbook session '{0}' not found")]
pub struct SessionNotFound(pub String);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("uploaded file is empty")]
    Empty,
    #[error("uploaded file is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("uploaded file exceeds the {limit} byte limit")]
    OverLimit { limit: usize },
    #[error("uploaded file is not an xlsx workbook")]
    NotXlsx,
    #[error("failed to read workbook: {0}")]
    Unreadable(String),
}

#[derive(Debug, Error)]
#[error("assistant is not configured (set SHEETPILOT_API_KEY)")]
pub struct AssistantUnavailable;
