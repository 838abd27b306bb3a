use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::models::DocumentType;
use crate::utils::ExtractError;

/// Per-field normalization applied to every produced value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    None,
    #[default]
    Text,
    Digits,
    RtRw,
    Date,
    Gender,
    Sex,
}

impl Normalization {
    /// Whether values of this kind may be confirmed through the confusion table.
    pub fn numeric(&self) -> bool {
        matches!(
            self,
            Normalization::Digits | Normalization::RtRw | Normalization::Date
        )
    }
}

/// Heuristic tried when no label-anchored value was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    #[default]
    None,
    /// Any line of the page may hold the value.
    Anywhere,
    /// Only lines within `window` lines of one of the field's `keywords`.
    NearLabel,
}

/// MRZ field that can stand in for a visual-page field of a passport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrzSource {
    DocumentNumber,
    Name,
    Nationality,
    BirthDate,
    Sex,
    ExpiryDate,
    IssuingState,
    PersonalNumber,
}

fn default_window() -> usize {
    1
}

fn default_lookahead() -> usize {
    2
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    /// Label variants, each a whitespace separated token sequence.
    #[serde(default)]
    pub labels: Vec<String>,
    pub pattern: String,
    #[serde(default)]
    pub normalize: Normalization,
    #[serde(default)]
    pub fallback: Fallback,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// Overrides the confusion-table default derived from `normalize`.
    #[serde(default)]
    pub confusable: Option<bool>,
    #[serde(default)]
    pub mrz: Option<MrzSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTemplate {
    pub fields: Vec<FieldDefinition>,
}

/// A field definition with its patterns compiled and labels tokenized.
#[derive(Debug, Clone)]
pub struct CompiledField {
    pub definition: FieldDefinition,
    pub labels: Vec<Vec<String>>,
    pub keywords: Vec<Vec<String>>,
    pub pattern: Regex,
    pub confusable: bool,
}

impl CompiledField {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub document_type: DocumentType,
    pub fields: Vec<CompiledField>,
}

impl CompiledTemplate {
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name()).collect()
    }

    pub fn mandatory_fields(&self) -> impl Iterator<Item = &CompiledField> {
        self.fields.iter().filter(|f| f.definition.mandatory)
    }
}

/// Uppercase alphanumeric form of an OCR token, used for label comparison.
pub fn clean_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

fn tokenize_label(label: &str) -> Vec<String> {
    label
        .split_whitespace()
        .map(clean_token)
        .filter(|t| !t.is_empty())
        .collect()
}

impl FieldTemplate {
    /// Validates the template and compiles every pattern, rejecting malformed
    /// definitions before any parsing happens.
    pub fn compile(&self, document_type: DocumentType) -> Result<CompiledTemplate, ExtractError> {
        if self.fields.is_empty() {
            return Err(ExtractError::Config(format!(
                "template '{}' declares no fields",
                document_type
            )));
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(self.fields.len());

        for definition in &self.fields {
            let name = definition.name.trim();
            if name.is_empty() {
                return Err(ExtractError::Config(format!(
                    "template '{}' has a field without a name",
                    document_type
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(ExtractError::Config(format!(
                    "template '{}' declares field '{}' twice",
                    document_type, name
                )));
            }

            let pattern = RegexBuilder::new(&definition.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ExtractError::Config(format!(
                        "field '{}' has an invalid pattern: {}",
                        name, e
                    ))
                })?;

            let labels: Vec<Vec<String>> = definition.labels.iter().map(|l| tokenize_label(l)).collect();
            if labels.iter().any(Vec::is_empty) {
                return Err(ExtractError::Config(format!(
                    "field '{}' has a label with no alphanumeric tokens",
                    name
                )));
            }

            let keywords: Vec<Vec<String>> = definition.keywords.iter().map(|k| tokenize_label(k)).collect();
            if keywords.iter().any(Vec::is_empty) {
                return Err(ExtractError::Config(format!(
                    "field '{}' has an empty keyword",
                    name
                )));
            }
            if definition.fallback == Fallback::NearLabel && keywords.is_empty() {
                return Err(ExtractError::Config(format!(
                    "field '{}' uses the near_label fallback without keywords",
                    name
                )));
            }
            if labels.is_empty() && definition.fallback == Fallback::None && definition.mrz.is_none() {
                return Err(ExtractError::Config(format!(
                    "field '{}' has no labels, no fallback and no MRZ source; it can never match",
                    name
                )));
            }

            let mut definition = definition.clone();
            definition.name = name.to_string();
            let confusable = definition.confusable.unwrap_or(definition.normalize.numeric());

            fields.push(CompiledField {
                definition,
                labels,
                keywords,
                pattern,
                confusable,
            });
        }

        Ok(CompiledTemplate {
            document_type,
            fields,
        })
    }

    pub fn default_for(document_type: DocumentType) -> FieldTemplate {
        match document_type {
            DocumentType::NationalId => national_id_template(),
            DocumentType::Passport => passport_template(),
        }
    }
}

/// Compiled templates for every supported document type.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: BTreeMap<DocumentType, CompiledTemplate>,
}

impl TemplateSet {
    /// Built-in templates, overridden per document type by `overrides`.
    pub fn new(overrides: &BTreeMap<DocumentType, FieldTemplate>) -> Result<Self, ExtractError> {
        let mut templates = BTreeMap::new();
        for document_type in [DocumentType::NationalId, DocumentType::Passport] {
            let template = overrides
                .get(&document_type)
                .cloned()
                .unwrap_or_else(|| FieldTemplate::default_for(document_type));
            templates.insert(document_type, template.compile(document_type)?);
        }
        Ok(TemplateSet { templates })
    }

    pub fn get(&self, document_type: DocumentType) -> Result<&CompiledTemplate, ExtractError> {
        self.templates.get(&document_type).ok_or_else(|| {
            ExtractError::Config(format!("no template for document type '{}'", document_type))
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn field(
    name: &str,
    labels: &[&str],
    pattern: &str,
    normalize: Normalization,
    fallback: Fallback,
    keywords: &[&str],
    mandatory: bool,
    mrz: Option<MrzSource>,
) -> FieldDefinition {
    FieldDefinition {
        name: name.to_string(),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        pattern: pattern.to_string(),
        normalize,
        fallback,
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        window: default_window(),
        lookahead: default_lookahead(),
        mandatory,
        confusable: None,
        mrz,
    }
}

const NAME_VALUE: &str = r"[A-Z][A-Z .,'-]*[A-Z.]";
const PLACE_VALUE: &str = r"[A-Z][A-Z .'-]*[A-Z]";
const NUMERIC_DATE: &str = r"\d{1,2}\s*[-./]\s*\d{1,2}\s*[-./]\s*\d{4}";
const ANY_DATE: &str = r"\d{1,2}\s*[-./ ]\s*(?:\d{1,2}|[A-Z]{3,9})\s*[-./ ]\s*\d{4}";

// Indonesian KTP. Label variants include misreadings seen in practice.
fn national_id_template() -> FieldTemplate {
    use Fallback::*;
    use Normalization as N;

    let birth_labels = [
        "TEMPAT TGL LAHIR",
        "TEMPAT LAHIR",
        "TEMPATL LAHIR",
        "TEMPALTGL LAHIR",
        "TEMPATTGL LAHIR",
    ];

    FieldTemplate {
        fields: vec![
            field("province", &["PROVINSI"], PLACE_VALUE, N::Text, None, &[], true, Option::None),
            field(
                "city",
                &["KABUPATEN", "KOTA", "KOTAMADYA"],
                PLACE_VALUE,
                N::Text,
                NearLabel,
                &["PROVINSI"],
                true,
                Option::None,
            ),
            field("nik", &["NIK"], r"\b\d{16}\b", N::Digits, Anywhere, &[], true, Option::None),
            field("name", &["NAMA"], NAME_VALUE, N::Text, None, &[], true, Option::None),
            field(
                "birth_place",
                &birth_labels,
                r"([A-Z][A-Z .'-]*[A-Z])\s*(?:,|\d|$)",
                N::Text,
                NearLabel,
                &["LAHIR"],
                true,
                Option::None,
            ),
            field(
                "birth_date",
                &birth_labels,
                NUMERIC_DATE,
                N::Date,
                NearLabel,
                &["LAHIR", "TGL"],
                true,
                Option::None,
            ),
            field(
                "gender",
                &["JENIS KELAMIN", "JNS KELAMIN", "JENIS KEL"],
                r"LAKI[\s-]*LAKI|PEREMPUAN|\bLAKI\b|\bPRIA\b|\bWANITA\b",
                N::Gender,
                Anywhere,
                &[],
                true,
                Option::None,
            ),
            // printed after the gender on the same line; read when on a line of its own or structured
            field(
                "blood_type",
                &["GOL DARAH", "GOLONGAN DARAH", "GOL DAR"],
                r"\b(AB|A|B|O)\b",
                N::Text,
                None,
                &[],
                false,
                Option::None,
            ),
            field(
                "address",
                &["ALAMAT", "ALMAT", "ALANAT", "ATOMAT", "ALAMAP"],
                r"[A-Z0-9].*[A-Z0-9.]",
                N::Text,
                NearLabel,
                &["RT/RW"],
                true,
                Option::None,
            ),
            field(
                "rt_rw",
                &["RT/RW", "RT RW", "RTRW", "RT TRW"],
                r"\d{1,4}\s*[/|\\-]\s*\d{1,4}",
                N::RtRw,
                None,
                &[],
                true,
                Option::None,
            ),
            field(
                "kelurahan_desa",
                &["KEL DESA", "KELURAHAN", "DESA", "KELDESA", "KEL/DEEA"],
                PLACE_VALUE,
                N::Text,
                None,
                &[],
                true,
                Option::None,
            ),
            field("kecamatan", &["KECAMATAN", "KEC"], PLACE_VALUE, N::Text, None, &[], true, Option::None),
            field(
                "religion",
                &["AGAMA", "AGAM"],
                r"\b(ISLAM|KRISTEN|PROTESTAN|KATOLIK|KATHOLIK|HINDU|BUDDHA|BUDHA|KONGHUCU|KEPERCAYAAN)\b",
                N::Text,
                Anywhere,
                &[],
                true,
                Option::None,
            ),
            field(
                "marital_status",
                &["STATUS PERKAWINAN", "STATUS KAWIN", "STATUS PERK"],
                r"\b(BELUM\s+KAWIN|KAWIN|CERAI\s+HIDUP|CERAI\s+MATI)\b",
                N::Text,
                Anywhere,
                &[],
                true,
                Option::None,
            ),
            field("occupation", &["PEKERJAAN", "POKERJAAN"], r"[A-Z][A-Z /.'-]*[A-Z]", N::Text, None, &[], false, Option::None),
            field("nationality", &["KEWARGANEGARAAN"], r"\bWNI\b|\bWNA\b|[A-Z]{3,}", N::Text, None, &[], false, Option::None),
            field(
                "valid_until",
                &["BERLAKU HINGGA"],
                r"SEUMUR\s+HIDUP|\d{1,2}\s*[-./]\s*\d{1,2}\s*[-./]\s*\d{4}",
                N::Text,
                None,
                &[],
                false,
                Option::None,
            ),
        ],
    }
}

// Visual data page of a passport. Every field can also be filled from the MRZ.
fn passport_template() -> FieldTemplate {
    use Fallback::*;
    use Normalization as N;

    FieldTemplate {
        fields: vec![
            field(
                "passport_number",
                &["PASSPORT NO", "PASSPORT NUMBER", "NO PASPOR", "DOCUMENT NO"],
                r"\b[A-Z0-9]{6,9}\b",
                N::Text,
                None,
                &[],
                true,
                Some(MrzSource::DocumentNumber),
            ),
            field(
                "name",
                &["NAME", "SURNAME", "FULL NAME", "NAMA"],
                NAME_VALUE,
                N::Text,
                None,
                &[],
                true,
                Some(MrzSource::Name),
            ),
            field(
                "nationality",
                &["NATIONALITY", "KEWARGANEGARAAN"],
                r"[A-Z][A-Z ]*[A-Z]",
                N::Text,
                None,
                &[],
                true,
                Some(MrzSource::Nationality),
            ),
            field(
                "date_of_birth",
                &["DATE OF BIRTH", "BIRTH DATE", "TANGGAL LAHIR"],
                ANY_DATE,
                N::Date,
                NearLabel,
                &["BIRTH"],
                true,
                Some(MrzSource::BirthDate),
            ),
            field(
                "gender",
                &["SEX", "GENDER", "JENIS KELAMIN"],
                r"\b(FEMALE|MALE|M|F|LAKI[\s-]*LAKI|PEREMPUAN)\b",
                N::Sex,
                None,
                &[],
                true,
                Some(MrzSource::Sex),
            ),
            field(
                "expiration_date",
                &["DATE OF EXPIRY", "EXPIRY DATE", "DATE OF EXPIRATION", "TANGGAL HABIS BERLAKU"],
                ANY_DATE,
                N::Date,
                NearLabel,
                &["EXPIRY"],
                true,
                Some(MrzSource::ExpiryDate),
            ),
            field(
                "country_code",
                &["COUNTRY CODE", "CODE", "KODE NEGARA"],
                r"\b[A-Z]{3}\b",
                N::Text,
                None,
                &[],
                true,
                Some(MrzSource::IssuingState),
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_templates_compile() {
        let set = TemplateSet::new(&BTreeMap::new()).unwrap();
        let ktp = set.get(DocumentType::NationalId).unwrap();
        assert!(ktp.field_names().contains(&"rt_rw"));
        assert_eq!(ktp.mandatory_fields().count(), 13);
        let passport = set.get(DocumentType::Passport).unwrap();
        assert!(passport.fields.iter().all(|f| f.definition.mrz.is_some()));
    }

    #[test]
    fn labels_are_tokenized_and_cleaned() {
        let compiled = national_id_template().compile(DocumentType::NationalId).unwrap();
        let rt_rw = compiled.fields.iter().find(|f| f.name() == "rt_rw").unwrap();
        assert_eq!(rt_rw.labels[0], vec!["RTRW"]);
        assert_eq!(rt_rw.labels[1], vec!["RT", "RW"]);
        assert!(rt_rw.confusable);
    }

    #[test]
    fn invalid_pattern_is_rejected_at_load() {
        let template = FieldTemplate {
            fields: vec![field("nik", &["NIK"], r"(\d{16", Normalization::Digits, Fallback::None, &[], true, None)],
        };
        let err = template.compile(DocumentType::NationalId).unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn duplicate_and_unreachable_fields_are_rejected() {
        let duplicate = FieldTemplate {
            fields: vec![
                field("nik", &["NIK"], r"\d+", Normalization::Digits, Fallback::None, &[], true, None),
                field(" nik ", &["NO"], r"\d+", Normalization::Digits, Fallback::None, &[], true, None),
            ],
        };
        assert!(duplicate.compile(DocumentType::NationalId).is_err());

        let unreachable = FieldTemplate {
            fields: vec![field("nik", &[], r"\d+", Normalization::Digits, Fallback::None, &[], true, None)],
        };
        assert!(unreachable.compile(DocumentType::NationalId).is_err());

        let near_without_keywords = FieldTemplate {
            fields: vec![field("nik", &["NIK"], r"\d+", Normalization::Digits, Fallback::NearLabel, &[], true, None)],
        };
        assert!(near_without_keywords.compile(DocumentType::NationalId).is_err());
    }

    #[test]
    fn templates_deserialize_from_toml() {
        let text = r#"
            [[fields]]
            name = "nik"
            labels = ["NIK", "N I K"]
            pattern = '\d{16}'
            normalize = "digits"
            fallback = "anywhere"

            [[fields]]
            name = "name"
            labels = ["NAMA"]
            pattern = '[A-Z ]+'
            mandatory = false
        "#;
        let template: FieldTemplate = toml::from_str(text).unwrap();
        assert_eq!(template.fields[0].normalize, Normalization::Digits);
        assert_eq!(template.fields[0].fallback, Fallback::Anywhere);
        assert_eq!(template.fields[1].normalize, Normalization::Text);
        assert!(!template.fields[1].mandatory);
        assert_eq!(template.fields[1].lookahead, 2);
        template.compile(DocumentType::NationalId).unwrap();
    }
}
