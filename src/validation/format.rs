use chrono::Local;
use std::collections::BTreeMap;

use crate::models::{
    CompiledTemplate, DocumentType, ExtractedField, ExtractionResult, MrzRecord, ValidationIssue,
    ValidationIssueType,
};

pub struct FormatValidator;

impl FormatValidator {
    /// One `FieldNotFound` issue per template field that was not recovered.
    pub fn missing_fields(
        fields: &BTreeMap<String, ExtractedField>,
        template: &CompiledTemplate,
    ) -> Vec<ValidationIssue> {
        template
            .fields
            .iter()
            .filter(|f| fields.get(f.name()).map_or(true, |e| !e.found))
            .map(|f| {
                let kind = if f.definition.mandatory { "Mandatory field" } else { "Field" };
                ValidationIssue::new(
                    ValidationIssueType::FieldNotFound,
                    format!("{} '{}' not found", kind, f.name()),
                )
            })
            .collect()
    }

    pub fn mandatory_fields_found(
        fields: &BTreeMap<String, ExtractedField>,
        template: &CompiledTemplate,
    ) -> bool {
        template
            .mandatory_fields()
            .all(|f| fields.get(f.name()).map_or(false, |e| e.found))
    }
}

/// Merges parser and MRZ output into the final, immutable result.
pub struct ResultAssembler;

impl ResultAssembler {
    pub fn assemble(
        template: &CompiledTemplate,
        fields: BTreeMap<String, ExtractedField>,
        mrz: Option<MrzRecord>,
        usage: Option<serde_json::Value>,
        issues: Vec<ValidationIssue>,
    ) -> ExtractionResult {
        let document_type = template.document_type;
        let valid = match document_type {
            DocumentType::NationalId => FormatValidator::mandatory_fields_found(&fields, template),
            DocumentType::Passport => mrz.as_ref().map_or(false, |m| m.mrz_valid),
        };

        ExtractionResult {
            document_type,
            fields,
            mrz,
            issues,
            valid,
            timestamp: Local::now().to_rfc3339(),
            usage,
        }
    }
}
