// Template-driven field extraction over noisy OCR lines.
//
// Every field goes through up to three passes: a value the backend already
// structured, a value anchored on a fuzzily matched label, and finally the
// field's fallback heuristic. Values are always confirmed against the field's
// pattern before they are accepted.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;

use crate::models::{
    clean_token, CompiledField, CompiledTemplate, ExtractedField, Fallback, FieldSource, OcrResult,
    NOT_FOUND,
};
use crate::processing::field_correction::{correct_digits, normalize};

/// Minimum LCS ratio for a token to count as a label token.
pub const LABEL_SIMILARITY: f32 = 0.72;

/// A label must start within this many tokens of the line start.
const LABEL_START_WINDOW: usize = 2;

const VALUE_DELIMITERS: &[char] = &[':', '=', '-', '.', '/', ' ', '\t'];

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"[^\s:=]+").unwrap();
}

struct Token {
    clean: String,
    end: usize,
}

struct Line<'a> {
    text: &'a str,
    tokens: Vec<Token>,
}

impl<'a> Line<'a> {
    fn new(text: &'a str) -> Self {
        let tokens = TOKEN
            .find_iter(text)
            .map(|m| Token {
                clean: clean_token(m.as_str()),
                end: m.end(),
            })
            .filter(|t| !t.clean.is_empty())
            .collect();
        Line { text, tokens }
    }
}

#[derive(Debug, Clone, Copy)]
struct LabelHit {
    /// Byte offset in the line right after the label.
    value_start: usize,
    score: f32,
}

struct Confirmed {
    raw: String,
    corrected: Option<String>,
}

pub struct FieldParser;

impl FieldParser {
    pub fn parse(ocr: &OcrResult, template: &CompiledTemplate) -> BTreeMap<String, ExtractedField> {
        let lines: Vec<Line> = ocr.lines.iter().map(|l| Line::new(l)).collect();

        // hits[line][field]: label occurrences, kept only for the best scoring field(s) of a line
        let hits: Vec<Vec<Option<LabelHit>>> = lines
            .iter()
            .map(|line| {
                let mut row: Vec<Option<LabelHit>> = template
                    .fields
                    .iter()
                    .map(|field| best_label_hit(field, line))
                    .collect();
                let best = row.iter().flatten().map(|h| h.score).fold(0.0f32, f32::max);
                for hit in row.iter_mut() {
                    if hit.map_or(false, |h| h.score + f32::EPSILON < best) {
                        *hit = None;
                    }
                }
                row
            })
            .collect();

        let mut fields = BTreeMap::new();
        for (index, field) in template.fields.iter().enumerate() {
            let extracted = Self::structured_pass(ocr, field)
                .or_else(|| Self::label_pass(field, index, &lines, &hits))
                .or_else(|| Self::fallback_pass(field, index, &lines, &hits))
                .unwrap_or_else(|| ExtractedField::not_found(field.name()));
            debug!(
                "field {} -> {:?} ({:?})",
                extracted.name, extracted.value, extracted.source
            );
            fields.insert(field.name().to_string(), extracted);
        }
        fields
    }

    pub fn parse_text(text: &str, template: &CompiledTemplate) -> BTreeMap<String, ExtractedField> {
        Self::parse(&OcrResult::from_text("text", text), template)
    }

    fn structured_pass(ocr: &OcrResult, field: &CompiledField) -> Option<ExtractedField> {
        let value = ocr.structured.as_ref()?.get(field.name())?.trim();
        if value.is_empty() || value.eq_ignore_ascii_case(NOT_FOUND) {
            return None;
        }
        confirm(value, field).map(|c| found(field, c, FieldSource::Structured, None))
    }

    fn label_pass(
        field: &CompiledField,
        index: usize,
        lines: &[Line],
        hits: &[Vec<Option<LabelHit>>],
    ) -> Option<ExtractedField> {
        for (i, line) in lines.iter().enumerate() {
            let Some(hit) = hits[i][index] else { continue };

            let remainder = line.text[hit.value_start..].trim_start_matches(VALUE_DELIMITERS);
            if let Some(c) = confirm(remainder, field) {
                return Some(found(field, c, FieldSource::Label, Some(i)));
            }

            // value printed below its label
            for (j, next) in lines.iter().enumerate().skip(i + 1).take(field.definition.lookahead) {
                if hits[j].iter().any(Option::is_some) {
                    break;
                }
                if let Some(c) = confirm(next.text, field) {
                    return Some(found(field, c, FieldSource::Label, Some(j)));
                }
            }
        }
        None
    }

    fn fallback_pass(
        field: &CompiledField,
        index: usize,
        lines: &[Line],
        hits: &[Vec<Option<LabelHit>>],
    ) -> Option<ExtractedField> {
        let eligible = |j: usize| {
            hits[j]
                .iter()
                .enumerate()
                .all(|(other, hit)| other == index || hit.is_none())
        };

        let mut candidates: Vec<usize> = match field.definition.fallback {
            Fallback::None => return None,
            Fallback::Anywhere => (0..lines.len()).filter(|&j| eligible(j)).collect(),
            Fallback::NearLabel => {
                let window = field.definition.window;
                let anchors: Vec<usize> = lines
                    .iter()
                    .enumerate()
                    .filter(|(_, line)| field.keywords.iter().any(|k| contains_sequence(line, k)))
                    .map(|(i, _)| i)
                    .collect();
                (0..lines.len())
                    .filter(|&j| anchors.iter().any(|&a| a.abs_diff(j) <= window))
                    .filter(|&j| eligible(j))
                    .collect()
            }
        };

        // nearest to the field's own label first, else reading order
        if let Some(anchor) = hits.iter().position(|row| row[index].is_some()) {
            candidates.sort_by_key(|&j| (anchor.abs_diff(j), j));
        }

        // unanchored lines only get a confusion correction when most of the value was read as digits
        let anywhere = field.definition.fallback == Fallback::Anywhere;
        candidates.into_iter().find_map(|j| {
            confirm(lines[j].text, field)
                .filter(|c| !anywhere || c.corrected.is_none() || mostly_digits(&c.raw))
                .map(|c| found(field, c, FieldSource::Heuristic, Some(j)))
        })
    }
}

fn mostly_digits(raw: &str) -> bool {
    let alnum = raw.chars().filter(|c| c.is_alphanumeric()).count();
    let digits = raw.chars().filter(|c| c.is_ascii_digit()).count();
    digits * 2 > alnum
}

fn found(field: &CompiledField, confirmed: Confirmed, source: FieldSource, line: Option<usize>) -> ExtractedField {
    let basis = confirmed.corrected.as_deref().unwrap_or(&confirmed.raw);
    ExtractedField {
        name: field.name().to_string(),
        value: normalize(basis, field.definition.normalize),
        raw: Some(confirmed.raw),
        corrected: confirmed.corrected,
        found: true,
        source,
        line,
    }
}

// Group 1 when the pattern has one, else the whole match, as a byte range.
fn find_value(pattern: &Regex, text: &str) -> Option<(usize, usize)> {
    let caps = pattern.captures(text)?;
    let m = caps.get(1).or_else(|| caps.get(0))?;
    let (start, end) = (m.start(), m.end());
    if text[start..end].trim().is_empty() {
        None
    } else {
        Some((start, end))
    }
}

fn confirm(text: &str, field: &CompiledField) -> Option<Confirmed> {
    if text.is_empty() {
        return None;
    }
    if let Some((start, end)) = find_value(&field.pattern, text) {
        return Some(Confirmed {
            raw: text[start..end].trim().to_string(),
            corrected: None,
        });
    }
    if !field.confusable {
        return None;
    }

    // the confusion table maps ASCII to ASCII, so byte offsets carry over
    let corrected = correct_digits(text);
    let (start, end) = find_value(&field.pattern, &corrected)?;
    Some(Confirmed {
        raw: text[start..end].trim().to_string(),
        corrected: Some(corrected[start..end].trim().to_string()),
    })
}

fn best_label_hit(field: &CompiledField, line: &Line) -> Option<LabelHit> {
    field
        .labels
        .iter()
        .filter_map(|label| match_label(label, line))
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

// Label tokens must fuzzily match consecutive line tokens, the first of them
// within `LABEL_START_WINDOW` tokens of the line start.
fn match_label(label: &[String], line: &Line) -> Option<LabelHit> {
    let last_start = LABEL_START_WINDOW.min(line.tokens.len());
    (0..last_start)
        .filter_map(|start| {
            let window = line.tokens.get(start..start + label.len())?;
            let mut total = 0.0;
            for (expected, token) in label.iter().zip(window) {
                let score = similarity(expected, &token.clean);
                if score < LABEL_SIMILARITY {
                    return None;
                }
                total += score;
            }
            Some(LabelHit {
                value_start: window[window.len() - 1].end,
                score: total / label.len() as f32,
            })
        })
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

fn contains_sequence(line: &Line, keyword: &[String]) -> bool {
    line.tokens.windows(keyword.len()).any(|window| {
        keyword
            .iter()
            .zip(window)
            .all(|(k, t)| similarity(k, &t.clean) >= LABEL_SIMILARITY)
    })
}

/// `2 * LCS / (len(a) + len(b))`, 1.0 for identical strings.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    2.0 * prev[b.len()] as f32 / (a.len() + b.len()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentType, FieldTemplate, TemplateSet};
    use std::collections::BTreeMap;

    const CLEAN_KTP: &str = "\
PROVINSI DKI JAKARTA
KOTA JAKARTA SELATAN
NIK : 3171234567890123
Nama : BUDI SANTOSO
Tempat/Tgl Lahir : JAKARTA, 17-08-1945
Jenis Kelamin : LAKI-LAKI Gol. Darah : O
Alamat : JL. MERDEKA NO. 5
RT/RW : 004/011
Kel/Desa : MENTENG
Kecamatan : MENTENG
Agama : ISLAM
Status Perkawinan : KAWIN
Pekerjaan : KARYAWAN SWASTA
Kewarganegaraan : WNI
Berlaku Hingga : SEUMUR HIDUP";

    fn ktp() -> CompiledTemplate {
        TemplateSet::new(&BTreeMap::new())
            .unwrap()
            .get(DocumentType::NationalId)
            .unwrap()
            .clone()
    }

    fn value<'a>(fields: &'a BTreeMap<String, ExtractedField>, name: &str) -> &'a str {
        &fields[name].value
    }

    #[test]
    fn clean_ktp_text_yields_every_field() {
        let fields = FieldParser::parse_text(CLEAN_KTP, &ktp());
        // blood type shares the gender line, past the label start window
        assert!(!fields["blood_type"].found);
        assert!(
            fields.values().filter(|f| f.name != "blood_type").all(|f| f.found),
            "{:#?}",
            fields
        );
        assert_eq!(value(&fields, "province"), "DKI JAKARTA");
        assert_eq!(value(&fields, "city"), "JAKARTA SELATAN");
        assert_eq!(value(&fields, "nik"), "3171234567890123");
        assert_eq!(value(&fields, "name"), "BUDI SANTOSO");
        assert_eq!(value(&fields, "birth_place"), "JAKARTA");
        assert_eq!(value(&fields, "birth_date"), "17-08-1945");
        assert_eq!(value(&fields, "gender"), "LAKI-LAKI");
        assert_eq!(value(&fields, "address"), "JL. MERDEKA NO. 5");
        assert_eq!(value(&fields, "rt_rw"), "004 / 011");
        assert_eq!(value(&fields, "kelurahan_desa"), "MENTENG");
        assert_eq!(value(&fields, "kecamatan"), "MENTENG");
        assert_eq!(value(&fields, "religion"), "ISLAM");
        assert_eq!(value(&fields, "marital_status"), "KAWIN");
        assert_eq!(value(&fields, "occupation"), "KARYAWAN SWASTA");
        assert_eq!(value(&fields, "valid_until"), "SEUMUR HIDUP");
        assert_eq!(fields["nik"].source, FieldSource::Label);
        assert_eq!(fields["nik"].line, Some(2));
    }

    #[test]
    fn every_template_field_appears_exactly_once() {
        let template = ktp();
        for text in [CLEAN_KTP, "", "lorem ipsum\n12 34\n::::"] {
            let fields = FieldParser::parse_text(text, &template);
            assert_eq!(fields.len(), template.fields.len());
            for name in template.field_names() {
                let field = &fields[name];
                assert_eq!(field.name, name);
                assert!(field.found || field.value == NOT_FOUND);
            }
        }
    }

    #[test]
    fn scrambled_text_finds_almost_nothing() {
        let scrambled = "xq7 &&% lorem\nipsum 42 dolor\n~~ ## ~~\nzzzz yyyy\n0101 ab";
        let fields = FieldParser::parse_text(scrambled, &ktp());
        let missing = fields.values().filter(|f| !f.found).count();
        assert!(missing > fields.len() / 2);
        assert!(fields.values().filter(|f| !f.found).all(|f| f.value == NOT_FOUND));
    }

    #[test]
    fn rt_rw_is_confirmed_through_the_confusion_table() {
        let fields = FieldParser::parse_text("RT/RW 2OO8/OO5", &ktp());
        let rt_rw = &fields["rt_rw"];
        assert!(rt_rw.found);
        assert_eq!(rt_rw.value, "2008 / 005");
        assert_eq!(rt_rw.raw.as_deref(), Some("2OO8/OO5"));
        assert_eq!(rt_rw.corrected.as_deref(), Some("2008/005"));
    }

    #[test]
    fn misread_labels_still_anchor() {
        let text = "NIK : 317I234567890I23\nALMAT : JL. SUDIRMAN 1\nKEL/DEEA : MENTENG";
        let fields = FieldParser::parse_text(text, &ktp());
        assert_eq!(value(&fields, "nik"), "3171234567890123");
        assert_eq!(fields["nik"].raw.as_deref(), Some("317I234567890I23"));
        assert_eq!(value(&fields, "address"), "JL. SUDIRMAN 1");
        assert_eq!(value(&fields, "kelurahan_desa"), "MENTENG");
    }

    #[test]
    fn value_on_the_next_line_is_picked_up() {
        let text = "NAMA\nBUDI SANTOSO\nAGAMA\nISLAM";
        let fields = FieldParser::parse_text(text, &ktp());
        assert_eq!(value(&fields, "name"), "BUDI SANTOSO");
        assert_eq!(fields["name"].line, Some(1));
        assert_eq!(value(&fields, "religion"), "ISLAM");
    }

    #[test]
    fn lookahead_stops_at_the_next_label() {
        let text = "NAMA :\nAGAMA : ISLAM";
        let fields = FieldParser::parse_text(text, &ktp());
        assert!(!fields["name"].found);
        assert_eq!(value(&fields, "religion"), "ISLAM");
    }

    #[test]
    fn religion_line_is_not_mistaken_for_address() {
        let fields = FieldParser::parse_text("AGAMA : ISLAM", &ktp());
        assert!(!fields["address"].found);
    }

    #[test]
    fn fallbacks_recover_unlabelled_values() {
        let text = "PROVINSI JAWA BARAT\nKABUPATEN BANDUNG\n3204123456789012\nJL. ASIA AFRIKA 8\nRT/RW 001/002\nPEREMPUAN";
        let fields = FieldParser::parse_text(text, &ktp());
        assert_eq!(value(&fields, "nik"), "3204123456789012");
        assert_eq!(fields["nik"].source, FieldSource::Heuristic);
        assert_eq!(value(&fields, "address"), "JL. ASIA AFRIKA 8");
        assert_eq!(fields["address"].source, FieldSource::Heuristic);
        assert_eq!(value(&fields, "gender"), "PEREMPUAN");
        assert_eq!(value(&fields, "city"), "BANDUNG");
    }

    #[test]
    fn unlabelled_letters_are_not_read_as_a_number() {
        let fields = FieldParser::parse_text("OOOOIIIISSSSZZZZ", &ktp());
        assert!(!fields["nik"].found);

        let fields = FieldParser::parse_text("3171O3456789O123", &ktp());
        assert_eq!(value(&fields, "nik"), "3171034567890123");
        assert_eq!(fields["nik"].source, FieldSource::Heuristic);
        assert_eq!(fields["nik"].raw.as_deref(), Some("3171O3456789O123"));
    }

    #[test]
    fn near_label_fallback_prefers_lines_close_to_the_label() {
        let template: FieldTemplate = toml::from_str(
            r#"
            [[fields]]
            name = "expiry"
            labels = ["EXPIRY"]
            pattern = '\d{2}-\d{2}-\d{4}'
            normalize = "date"
            fallback = "near_label"
            keywords = ["VALID"]
            window = 3
            lookahead = 0
            "#,
        )
        .unwrap();
        let template = template.compile(DocumentType::Passport).unwrap();
        let text = "VALID 01-01-2001\nfiller\nEXPIRY unreadable\nVALID 02-02-2002";
        let fields = FieldParser::parse_text(text, &template);
        assert_eq!(value(&fields, "expiry"), "02-02-2002");
        assert_eq!(fields["expiry"].line, Some(3));
    }

    #[test]
    fn structured_values_are_confirmed_before_use() {
        let mut structured = BTreeMap::new();
        structured.insert("nik".to_string(), "3171O34567890123".to_string());
        structured.insert("name".to_string(), "1234".to_string());
        let ocr = OcrResult {
            backend: "llm".to_string(),
            structured: Some(structured),
            ..Default::default()
        };
        let fields = FieldParser::parse(&ocr, &ktp());
        assert_eq!(fields["nik"].source, FieldSource::Structured);
        assert_eq!(value(&fields, "nik"), "3171034567890123");
        assert!(!fields["name"].found);
    }

    #[test]
    fn blood_type_comes_from_structured_output_or_its_own_line() {
        let mut structured = BTreeMap::new();
        structured.insert("blood_type".to_string(), "AB".to_string());
        let ocr = OcrResult {
            backend: "llm".to_string(),
            structured: Some(structured),
            ..Default::default()
        };
        let fields = FieldParser::parse(&ocr, &ktp());
        assert_eq!(fields["blood_type"].source, FieldSource::Structured);
        assert_eq!(value(&fields, "blood_type"), "AB");

        let fields = FieldParser::parse_text("Jenis Kelamin : PEREMPUAN\nGol. Darah : O", &ktp());
        assert_eq!(value(&fields, "blood_type"), "O");
        assert_eq!(fields["blood_type"].line, Some(1));
        assert_eq!(value(&fields, "gender"), "PEREMPUAN");
    }

    #[test]
    fn similarity_is_an_lcs_ratio() {
        assert_eq!(similarity("NIK", "NIK"), 1.0);
        assert!(similarity("ALAMAT", "ALMAT") >= LABEL_SIMILARITY);
        assert!(similarity("NAMA", "AGAMA") < LABEL_SIMILARITY);
        assert_eq!(similarity("", "X"), 0.0);
    }
}
