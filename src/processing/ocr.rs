use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::models::{DocumentType, OcrResult};
use crate::processing::image::NormalizedImage;
use crate::processing::remote::{CloudVisionBackend, LlmBackend};
use crate::processing::tesseract::TesseractEngine;
use crate::utils::{ExtractError, Result};

/// Part of the document a recognition call covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Page,
    /// Machine-readable zone only; engines restrict their alphabet to `A-Z0-9<`.
    Mrz,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionRequest {
    /// Tesseract-style hint such as `eng+ind`.
    pub language_hint: String,
    pub document_type: DocumentType,
    pub region: Region,
}

impl RecognitionRequest {
    pub fn page(language_hint: &str, document_type: DocumentType) -> Self {
        RecognitionRequest {
            language_hint: language_hint.to_string(),
            document_type,
            region: Region::Page,
        }
    }

    pub fn mrz(language_hint: &str, document_type: DocumentType) -> Self {
        RecognitionRequest {
            region: Region::Mrz,
            ..Self::page(language_hint, document_type)
        }
    }

    pub fn languages(&self) -> Vec<&str> {
        self.language_hint
            .split('+')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Anything that turns a normalized image into text lines.
pub trait Recognizer {
    fn id(&self) -> &str;
    fn recognize(&self, image: &NormalizedImage, request: &RecognitionRequest) -> Result<OcrResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    #[serde(alias = "tesseract")]
    Local,
    CloudVision,
    Llm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::CloudVision => "cloud_vision",
            BackendKind::Llm => "llm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ExtractError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "tesseract" => Ok(BackendKind::Local),
            "cloud_vision" | "cloud-vision" | "vision" => Ok(BackendKind::CloudVision),
            "llm" | "gemini" => Ok(BackendKind::Llm),
            other => Err(ExtractError::Config(format!(
                "unknown backend '{}', expected local, cloud_vision or llm",
                other
            ))),
        }
    }
}

/// The closed set of recognition engines.
pub enum OcrBackend {
    Local(TesseractEngine),
    CloudVision(CloudVisionBackend),
    Llm(LlmBackend),
}

impl OcrBackend {
    pub fn from_config(kind: BackendKind, config: &Config) -> Result<OcrBackend> {
        log::debug!("initializing {} backend", kind);
        Ok(match kind {
            BackendKind::Local => OcrBackend::Local(TesseractEngine::new(&config.tesseract)?),
            BackendKind::CloudVision => {
                OcrBackend::CloudVision(CloudVisionBackend::new(&config.cloud_vision)?)
            }
            BackendKind::Llm => OcrBackend::Llm(LlmBackend::new(&config.llm)?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            OcrBackend::Local(_) => BackendKind::Local,
            OcrBackend::CloudVision(_) => BackendKind::CloudVision,
            OcrBackend::Llm(_) => BackendKind::Llm,
        }
    }
}

impl Recognizer for OcrBackend {
    fn id(&self) -> &str {
        self.kind().as_str()
    }

    fn recognize(&self, image: &NormalizedImage, request: &RecognitionRequest) -> Result<OcrResult> {
        match self {
            OcrBackend::Local(engine) => engine.recognize(image, request),
            OcrBackend::CloudVision(backend) => backend.recognize(image, request),
            OcrBackend::Llm(backend) => backend.recognize(image, request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse_with_aliases() {
        assert_eq!("tesseract".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("Cloud_Vision".parse::<BackendKind>().unwrap(), BackendKind::CloudVision);
        assert_eq!("llm".parse::<BackendKind>().unwrap(), BackendKind::Llm);
        assert!("paddle".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::CloudVision.to_string(), "cloud_vision");
    }

    #[test]
    fn request_splits_language_hint() {
        let request = RecognitionRequest::mrz(" eng + ind ", DocumentType::Passport);
        assert_eq!(request.languages(), vec!["eng", "ind"]);
        assert_eq!(request.region, Region::Mrz);
    }

    #[test]
    fn remote_backend_without_key_is_unavailable() {
        let mut config = Config::default();
        config.llm.api_key_env = Some("IDSCAN_TEST_UNSET_GEMINI_KEY".to_string());
        config.llm.api_key = None;
        let err = OcrBackend::from_config(BackendKind::Llm, &config).err().unwrap();
        assert_eq!(err.kind(), "engine_unavailable");
    }
}
