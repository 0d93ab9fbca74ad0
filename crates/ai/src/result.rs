use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 500;

/// Human-readable metadata for a generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedMetadata {
    pub title: String,
    pub description: String,
}

impl GeneratedMetadata {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }

    /// Trim and bound provider output; an empty title is rejected.
    pub fn sanitized(self) -> Result<Self, AiError> {
        let title = truncate_chars(self.title.trim(), MAX_TITLE_CHARS);
        let description = truncate_chars(self.description.trim(), MAX_DESCRIPTION_CHARS);
        if title.is_empty() {
            return Err(AiError::InvalidOutput("empty title".to_string()));
        }
        Ok(Self { title, description })
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiError {
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("generation failed: {0}")]
    InferenceFailed(String),

    #[error("provider returned unusable output: {0}")]
    InvalidOutput(String),

    #[error("internal error: {0}")]
    Internal(String),
}
