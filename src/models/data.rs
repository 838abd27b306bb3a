use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::ExtractError;

/// Sentinel stored in place of a value that no heuristic could recover.
pub const NOT_FOUND: &str = "Not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[serde(alias = "ktp")]
    NationalId,
    Passport,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::NationalId => "national_id",
            DocumentType::Passport => "passport",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "national_id" | "ktp" | "id" => Ok(DocumentType::NationalId),
            "passport" => Ok(DocumentType::Passport),
            other => Err(ExtractError::Config(format!(
                "unknown document type '{}', expected national_id or passport",
                other
            ))),
        }
    }
}

/// An ingested image together with the type the caller declared for it.
#[derive(Debug, Clone)]
pub struct Document {
    bytes: Vec<u8>,
    document_type: DocumentType,
}

impl Document {
    pub fn new(bytes: Vec<u8>, document_type: DocumentType) -> Self {
        Document {
            bytes,
            document_type,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }
}

/// Text produced by one backend invocation over one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OcrResult {
    pub backend: String,
    pub lines: Vec<String>,
    /// Languages the engine actually ran with, which may be a subset of the hint.
    pub languages: Vec<String>,
    pub confidence: Option<f32>,
    pub usage: Option<serde_json::Value>,
    /// Fields already structured by the backend (LLM extraction), keyed by field name.
    pub structured: Option<BTreeMap<String, String>>,
}

impl OcrResult {
    pub fn from_text(backend: impl Into<String>, text: &str) -> Self {
        OcrResult {
            backend: backend.into(),
            lines: split_lines(text),
            ..Default::default()
        }
    }

    pub fn empty(backend: impl Into<String>) -> Self {
        OcrResult {
            backend: backend.into(),
            ..Default::default()
        }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.structured.as_ref().map_or(true, |s| s.is_empty())
    }
}

/// Non-empty trimmed lines, in reading order.
pub fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Label,
    Heuristic,
    Structured,
    Mrz,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedField {
    pub name: String,
    pub raw: Option<String>,
    /// Set only when the confusion table was needed to confirm the value.
    pub corrected: Option<String>,
    pub value: String,
    pub found: bool,
    pub source: FieldSource,
    pub line: Option<usize>,
}

impl ExtractedField {
    pub fn not_found(name: &str) -> Self {
        ExtractedField {
            name: name.to_string(),
            raw: None,
            corrected: None,
            value: NOT_FOUND.to_string(),
            found: false,
            source: FieldSource::None,
            line: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MrzFormat {
    TD1, // ID card, 3 x 30
    TD2, // 2 x 36
    TD3, // Passport, 2 x 44
}

impl MrzFormat {
    pub fn mrz_lines(&self) -> usize {
        match self {
            MrzFormat::TD1 => 3,
            MrzFormat::TD2 => 2,
            MrzFormat::TD3 => 2,
        }
    }

    pub fn mrz_chars_per_line(&self) -> usize {
        match self {
            MrzFormat::TD1 => 30,
            MrzFormat::TD2 => 36,
            MrzFormat::TD3 => 44,
        }
    }
}

/// One check-digit protected MRZ field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MrzField {
    /// Characters at the field's fixed position, exactly as read.
    pub value: String,
    pub check_digit: char,
    pub corrected: Option<String>,
    pub checksum_valid: bool,
}

impl MrzField {
    /// The value the checksum was confirmed against.
    pub fn effective(&self) -> &str {
        self.corrected.as_deref().unwrap_or(&self.value)
    }

    /// Value with filler characters removed.
    pub fn display(&self) -> String {
        self.effective().trim_end_matches('<').replace('<', " ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MrzRecord {
    pub format: MrzFormat,
    pub document_code: String,
    pub issuing_state: String,
    pub surname: String,
    pub given_names: String,
    pub document_number: MrzField,
    pub nationality: String,
    pub birth_date: MrzField,
    pub sex: String,
    pub expiry_date: MrzField,
    /// TD3 only; TD1 and TD2 carry unchecked optional data instead.
    pub personal_number: Option<MrzField>,
    pub optional_data: String,
    pub optional_data_2: String,
    pub composite_check: char,
    pub composite_valid: bool,
    pub mrz_valid: bool,
    pub raw_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub issue_type: ValidationIssueType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssueType {
    FieldNotFound,
    ChecksumMismatch,
    MrzUnreadable,
    EmptyRecognition,
}

impl ValidationIssue {
    pub fn new(issue_type: ValidationIssueType, message: impl Into<String>) -> Self {
        ValidationIssue {
            issue_type,
            message: message.into(),
        }
    }
}

/// Outcome of one extraction run. Built once by the assembler and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub document_type: DocumentType,
    pub fields: BTreeMap<String, ExtractedField>,
    pub mrz: Option<MrzRecord>,
    pub issues: Vec<ValidationIssue>,
    pub valid: bool,
    pub timestamp: String,
    pub usage: Option<serde_json::Value>,
}

impl ExtractionResult {
    pub fn field(&self, name: &str) -> Option<&ExtractedField> {
        self.fields.get(name)
    }

    /// Normalized value of a field, or `NOT_FOUND` when the template has no such field.
    pub fn value(&self, name: &str) -> &str {
        self.fields.get(name).map_or(NOT_FOUND, |f| f.value.as_str())
    }

    pub fn to_response(&self) -> Response {
        Response::Success {
            data: self
                .fields
                .iter()
                .map(|(name, field)| (name.clone(), field.value.clone()))
                .collect(),
            valid: self.valid,
            timestamp: self.timestamp.clone(),
            mrz: self.mrz.clone(),
            usage: self.usage.clone(),
        }
    }
}

/// External JSON envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Success {
        data: BTreeMap<String, String>,
        valid: bool,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mrz: Option<MrzRecord>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<serde_json::Value>,
    },
    Error {
        message: String,
        timestamp: String,
    },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }
}
