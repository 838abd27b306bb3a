use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("OCR engine '{backend}' unavailable: {reason} ({hint})")]
    EngineUnavailable {
        backend: String,
        reason: String,
        hint: String,
    },

    #[error("MRZ format error: {0}")]
    MrzFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtractError {
    pub fn engine_unavailable(
        backend: impl Into<String>,
        reason: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        ExtractError::EngineUnavailable {
            backend: backend.into(),
            reason: reason.into(),
            hint: hint.into(),
        }
    }

    /// Short machine-readable kind, used in the error envelope and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::InvalidImage(_) => "invalid_image",
            ExtractError::EngineUnavailable { .. } => "engine_unavailable",
            ExtractError::MrzFormat(_) => "mrz_format",
            ExtractError::Config(_) => "config",
            ExtractError::Io(_) => "io",
            ExtractError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_unavailable_message_carries_hint() {
        let err = ExtractError::engine_unavailable(
            "local",
            "tesseract executable not found",
            "install tesseract or set tesseract.path",
        );
        let message = err.to_string();
        assert!(message.contains("local"));
        assert!(message.contains("set tesseract.path"));
        assert_eq!(err.kind(), "engine_unavailable");
    }
}
