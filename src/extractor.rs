use log::{debug, info, warn};
use serde_json::json;
use std::collections::BTreeMap;

use crate::config::{Config, PreprocessConfig};
use crate::models::{
    CompiledTemplate, Document, DocumentType, ExtractedField, ExtractionResult, FieldSource, MrzField,
    MrzRecord, MrzSource, TemplateSet, ValidationIssue, ValidationIssueType,
};
use crate::processing::field_correction::normalize;
use crate::processing::{BackendKind, FieldParser, ImageProcessor, OcrBackend, RecognitionRequest, Recognizer};
use crate::utils::{ExtractError, Result};
use crate::validation::{FormatValidator, MrzValidator, ResultAssembler};

/// Share of the page height, from the bottom, searched for the MRZ.
const MRZ_BAND: f32 = 0.35;

/// Runs the whole pipeline for one document: normalize, recognize, parse,
/// validate the MRZ and assemble the result.
pub struct DocumentExtractor<R: Recognizer> {
    recognizer: R,
    templates: TemplateSet,
    preprocess: PreprocessConfig,
    language: String,
}

impl DocumentExtractor<OcrBackend> {
    /// Extractor over the configured backend, or `backend` when given.
    pub fn from_config(config: &Config, backend: Option<BackendKind>) -> Result<Self> {
        let kind = backend.unwrap_or(config.ocr.default_backend);
        let recognizer = OcrBackend::from_config(kind, config)?;
        Self::new(recognizer, config)
    }
}

impl<R: Recognizer> DocumentExtractor<R> {
    pub fn new(recognizer: R, config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(DocumentExtractor {
            recognizer,
            templates: config.template_set()?,
            preprocess: config.preprocess.clone(),
            language: config.ocr.language.clone(),
        })
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    pub fn extract_bytes(&self, bytes: Vec<u8>, document_type: DocumentType) -> Result<ExtractionResult> {
        self.extract(&Document::new(bytes, document_type))
    }

    pub fn extract(&self, document: &Document) -> Result<ExtractionResult> {
        let document_type = document.document_type();
        let template = self.templates.get(document_type)?;

        // Step 1: Normalize the image
        let image = ImageProcessor::normalize(document.bytes(), &self.preprocess)?;

        // Step 2: Recognize the page
        let request = RecognitionRequest::page(&self.language, document_type);
        let page = self.recognizer.recognize(&image, &request)?;
        info!(
            "{} recognized {} line(s) of a {}",
            self.recognizer.id(),
            page.lines.len(),
            document_type
        );

        let mut issues = Vec::new();
        if page.is_empty() {
            warn!("{} returned no text", self.recognizer.id());
            issues.push(ValidationIssue::new(
                ValidationIssueType::EmptyRecognition,
                format!("backend '{}' recognized no text", self.recognizer.id()),
            ));
        }

        // Step 3: Parse template fields
        let mut fields = FieldParser::parse(&page, template);

        // Step 4: Read and validate the MRZ of passports
        let mut usage = page.usage.clone();
        let mut mrz = None;
        if document_type == DocumentType::Passport {
            let band = image.crop_bottom(MRZ_BAND)?;
            let zone = self
                .recognizer
                .recognize(&band, &RecognitionRequest::mrz(&self.language, document_type))?;
            usage = merge_usage(usage, zone.usage.clone());

            let mut lines = MrzValidator::find_lines(&zone.lines);
            if lines.is_empty() {
                debug!("no MRZ in the bottom band, searching the full page");
                lines = MrzValidator::find_lines(&page.lines);
            }

            match MrzValidator::parse(&lines) {
                Ok(record) => {
                    issues.extend(MrzValidator::issues(&record));
                    fill_from_mrz(&mut fields, template, &record);
                    mrz = Some(record);
                }
                Err(ExtractError::MrzFormat(reason)) => {
                    warn!("MRZ unreadable: {}", reason);
                    issues.push(ValidationIssue::new(ValidationIssueType::MrzUnreadable, reason));
                }
                Err(e) => return Err(e),
            }
        }

        // Step 5: Assemble
        issues.extend(FormatValidator::missing_fields(&fields, template));
        let result = ResultAssembler::assemble(template, fields, mrz, usage, issues);
        info!(
            "{} extraction finished, valid = {}, {} issue(s)",
            document_type,
            result.valid,
            result.issues.len()
        );
        Ok(result)
    }
}

fn merge_usage(page: Option<serde_json::Value>, zone: Option<serde_json::Value>) -> Option<serde_json::Value> {
    match (page, zone) {
        (Some(page), Some(zone)) => Some(json!({ "page": page, "mrz": zone })),
        (page, zone) => page.or(zone),
    }
}

// MRZ values replace visual ones that are missing, or whose MRZ counterpart passed its checksum.
fn fill_from_mrz(
    fields: &mut BTreeMap<String, ExtractedField>,
    template: &CompiledTemplate,
    record: &MrzRecord,
) {
    for field in &template.fields {
        let Some(source) = field.definition.mrz else { continue };
        let Some((raw, value, trusted)) = mrz_value(record, source) else { continue };
        if value.is_empty() {
            continue;
        }

        let visual_found = fields.get(field.name()).map_or(false, |f| f.found);
        if visual_found && !trusted {
            continue;
        }
        debug!("field {} taken from the MRZ ({:?})", field.name(), source);
        fields.insert(
            field.name().to_string(),
            ExtractedField {
                name: field.name().to_string(),
                raw: Some(raw),
                corrected: None,
                value: normalize(&value, field.definition.normalize),
                found: true,
                source: FieldSource::Mrz,
                line: None,
            },
        );
    }
}

// (raw characters, display value, checksum-backed)
fn mrz_value(record: &MrzRecord, source: MrzSource) -> Option<(String, String, bool)> {
    let date = |field: &MrzField, iso: Option<chrono::NaiveDate>| {
        let value = iso
            .map(|d| d.format("%d-%m-%Y").to_string())
            .unwrap_or_else(|| field.display());
        (field.value.clone(), value, field.checksum_valid)
    };

    Some(match source {
        MrzSource::DocumentNumber => {
            let f = &record.document_number;
            (f.value.clone(), f.display(), f.checksum_valid)
        }
        MrzSource::BirthDate => date(&record.birth_date, record.birth_date_iso()),
        MrzSource::ExpiryDate => date(&record.expiry_date, record.expiry_date_iso()),
        MrzSource::PersonalNumber => {
            let f = record.personal_number.as_ref()?;
            (f.value.clone(), f.display(), f.checksum_valid)
        }
        MrzSource::Name => (record.full_name(), record.full_name(), record.mrz_valid),
        MrzSource::Nationality => (record.nationality.clone(), record.nationality.clone(), record.mrz_valid),
        MrzSource::Sex => (record.sex.clone(), record.sex.clone(), record.mrz_valid),
        MrzSource::IssuingState => (record.issuing_state.clone(), record.issuing_state.clone(), record.mrz_valid),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OcrResult, NOT_FOUND};
    use crate::processing::{NormalizedImage, Region};
    use image::{DynamicImage, GrayImage, ImageOutputFormat};
    use std::io::Cursor;

    const TD3: [&str; 2] = [
        "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<",
        "L898902C36UTO7408122F1204159ZE184226B<<<<<10",
    ];

    /// Recognizer returning canned text per region.
    struct FakeRecognizer {
        page: String,
        mrz: String,
    }

    impl FakeRecognizer {
        fn new(page: &str, mrz: &str) -> Self {
            FakeRecognizer {
                page: page.to_string(),
                mrz: mrz.to_string(),
            }
        }
    }

    impl Recognizer for FakeRecognizer {
        fn id(&self) -> &str {
            "fake"
        }

        fn recognize(&self, image: &NormalizedImage, request: &RecognitionRequest) -> Result<OcrResult> {
            assert!(!image.jpeg().is_empty());
            let text = match request.region {
                Region::Page => &self.page,
                Region::Mrz => &self.mrz,
            };
            Ok(OcrResult::from_text("fake", text))
        }
    }

    fn page_png() -> Vec<u8> {
        let img = GrayImage::from_fn(300, 200, |x, y| image::Luma([if (x + y) % 7 == 0 { 0 } else { 255 }]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    fn extractor(page: &str, mrz: &str) -> DocumentExtractor<FakeRecognizer> {
        DocumentExtractor::new(FakeRecognizer::new(page, mrz), &Config::default()).unwrap()
    }

    #[test]
    fn national_id_pipeline_produces_a_valid_result() {
        let page = "PROVINSI DKI JAKARTA\nKOTA JAKARTA SELATAN\nNIK : 3171234567890123\n\
Nama : BUDI SANTOSO\nTempat/Tgl Lahir : JAKARTA, 17-08-1945\nJenis Kelamin : LAKI-LAKI\n\
Alamat : JL. MERDEKA NO. 5\nRT/RW : 2OO8/OO5\nKel/Desa : MENTENG\nKecamatan : MENTENG\n\
Agama : ISLAM\nStatus Perkawinan : BELUM KAWIN";
        let result = extractor(page, "")
            .extract_bytes(page_png(), DocumentType::NationalId)
            .unwrap();

        assert!(result.valid);
        assert!(result.mrz.is_none());
        assert_eq!(result.value("rt_rw"), "2008 / 005");
        assert_eq!(result.value("marital_status"), "BELUM KAWIN");
        // optional fields absent from this card are reported but do not invalidate it
        assert!(result
            .issues
            .iter()
            .all(|i| i.issue_type == ValidationIssueType::FieldNotFound));
        assert_eq!(result.value("occupation"), NOT_FOUND);
    }

    #[test]
    fn passport_fields_are_completed_from_the_mrz() {
        let page = "PASSPORT\nSurname : ERIKSSON\nNationality : UTOPIAN\nSex : F";
        let mrz = format!("{}\n{}", TD3[0], TD3[1]);
        let result = extractor(page, &mrz)
            .extract_bytes(page_png(), DocumentType::Passport)
            .unwrap();

        assert!(result.valid);
        let record = result.mrz.as_ref().unwrap();
        assert!(record.mrz_valid);
        assert_eq!(result.value("passport_number"), "L898902C3");
        assert_eq!(result.value("date_of_birth"), "12-08-1974");
        assert_eq!(result.value("expiration_date"), "15-04-2012");
        assert_eq!(result.value("country_code"), "UTO");
        // checksum-valid MRZ wins over the visual reading
        assert_eq!(result.value("name"), "ANNA MARIA ERIKSSON");
        assert_eq!(result.field("nationality").unwrap().source, FieldSource::Mrz);
        assert_eq!(result.value("gender"), "F");
        assert!(result.fields.values().all(|f| f.found));
    }

    #[test]
    fn mrz_is_searched_on_the_page_when_the_band_is_empty() {
        let page = format!("PASSPORT\n{}\n{}", TD3[0], TD3[1]);
        let result = extractor(&page, "")
            .extract_bytes(page_png(), DocumentType::Passport)
            .unwrap();
        assert!(result.valid);
        assert_eq!(result.value("passport_number"), "L898902C3");
    }

    #[test]
    fn corrupted_mrz_invalidates_but_keeps_values() {
        let corrupted = TD3[1].replacen("7408122", "7408121", 1);
        let mrz = format!("{}\n{}", TD3[0], corrupted);
        let result = extractor("PASSPORT", &mrz)
            .extract_bytes(page_png(), DocumentType::Passport)
            .unwrap();

        assert!(!result.valid);
        assert!(result
            .issues
            .iter()
            .any(|i| i.issue_type == ValidationIssueType::ChecksumMismatch));
        // not found visually, so the unverified MRZ reading is still used
        assert_eq!(result.value("date_of_birth"), "12-08-1974");
        assert_eq!(result.mrz.unwrap().birth_date.value, "740812");
    }

    #[test]
    fn passport_without_mrz_is_invalid() {
        let result = extractor("PASSPORT\nSurname : ERIKSSON", "")
            .extract_bytes(page_png(), DocumentType::Passport)
            .unwrap();
        assert!(!result.valid);
        assert!(result.mrz.is_none());
        assert!(result
            .issues
            .iter()
            .any(|i| i.issue_type == ValidationIssueType::MrzUnreadable));
    }

    #[test]
    fn empty_recognition_degrades_gracefully() {
        let result = extractor("", "")
            .extract_bytes(page_png(), DocumentType::NationalId)
            .unwrap();
        assert!(!result.valid);
        assert!(result.fields.values().all(|f| !f.found && f.value == NOT_FOUND));
        assert!(result
            .issues
            .iter()
            .any(|i| i.issue_type == ValidationIssueType::EmptyRecognition));
    }

    #[test]
    fn invalid_image_is_fatal() {
        let err = extractor("", "")
            .extract_bytes(b"GIF89a-truncated".to_vec(), DocumentType::NationalId)
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidImage(_)));
    }

    #[test]
    fn extractor_can_be_shared_between_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DocumentExtractor<OcrBackend>>();
    }

    #[test]
    fn usage_from_both_passes_is_kept() {
        let merged = merge_usage(Some(json!({"totalTokenCount": 10})), Some(json!({"totalTokenCount": 4})));
        assert_eq!(merged.unwrap()["mrz"]["totalTokenCount"], 4);
        assert_eq!(merge_usage(None, Some(json!(1))), Some(json!(1)));
    }
}
