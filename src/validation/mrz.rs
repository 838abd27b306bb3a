use chrono::{Datelike, Local, NaiveDate};
use log::debug;

use crate::models::{MrzField, MrzFormat, MrzRecord, ValidationIssue, ValidationIssueType};
use crate::processing::field_correction::{confirm_digit, correct_digits};
use crate::utils::{ExtractError, Result};

/// Lines shorter than this are never treated as MRZ lines.
const MIN_MRZ_LINE: usize = 20;

pub struct MrzValidator;

impl MrzValidator {
    /// ICAO 9303 check digit: weights 7, 3, 1 over character values, mod 10.
    pub fn check_digit(data: &str) -> u32 {
        const WEIGHTS: [u32; 3] = [7, 3, 1];
        data.chars()
            .enumerate()
            .map(|(i, c)| char_value(c) * WEIGHTS[i % 3])
            .sum::<u32>()
            % 10
    }

    /// Uppercases, turns spaces into fillers and drops anything outside `A-Z0-9<`.
    pub fn clean_line(line: &str) -> String {
        line.trim()
            .chars()
            .map(|c| if c == ' ' { '<' } else { c.to_ascii_uppercase() })
            .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '<')
            .collect()
    }

    /// Cleaned lines of an OCR page that look like MRZ lines.
    pub fn find_lines(lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .map(|l| Self::clean_line(l))
            .filter(|l| l.len() >= 30 && l.contains('<'))
            .collect()
    }

    pub fn parse(lines: &[String]) -> Result<MrzRecord> {
        let cleaned: Vec<String> = lines
            .iter()
            .map(|l| Self::clean_line(l))
            .filter(|l| l.len() >= MIN_MRZ_LINE)
            .collect();

        let longest = cleaned.iter().map(String::len).max().unwrap_or(0);
        let format = match cleaned.len() {
            n if n >= 2 && longest >= 40 => MrzFormat::TD3,
            n if n >= 2 && longest >= 33 => MrzFormat::TD2,
            n if n >= 3 => MrzFormat::TD1,
            n => {
                return Err(ExtractError::MrzFormat(format!(
                    "found {} usable MRZ line(s), longest {} characters",
                    n, longest
                )))
            }
        };

        // The zone sits at the bottom of the page, so the last lines win.
        let width = format.mrz_chars_per_line();
        let rows: Vec<String> = cleaned[cleaned.len() - format.mrz_lines()..]
            .iter()
            .map(|l| fit(l, width))
            .collect();
        debug!("parsing {:?} MRZ: {:?}", format, rows);

        let mut record = match format {
            MrzFormat::TD3 => parse_td3(&rows),
            MrzFormat::TD2 => parse_td2(&rows),
            MrzFormat::TD1 => parse_td1(&rows),
        };
        record.revalidate();
        Ok(record)
    }

    pub fn issues(record: &MrzRecord) -> Vec<ValidationIssue> {
        let mut checked = vec![
            ("document number", &record.document_number),
            ("birth date", &record.birth_date),
            ("expiry date", &record.expiry_date),
        ];
        if let Some(personal) = &record.personal_number {
            checked.push(("personal number", personal));
        }

        let mut issues: Vec<ValidationIssue> = checked
            .into_iter()
            .filter(|(_, field)| !field.checksum_valid)
            .map(|(name, field)| {
                ValidationIssue::new(
                    ValidationIssueType::ChecksumMismatch,
                    format!(
                        "MRZ {} '{}' does not match check digit '{}'",
                        name, field.value, field.check_digit
                    ),
                )
            })
            .collect();
        if !record.composite_valid {
            issues.push(ValidationIssue::new(
                ValidationIssueType::ChecksumMismatch,
                format!("MRZ composite check digit '{}' does not match", record.composite_check),
            ));
        }
        issues
    }
}

fn char_value(c: char) -> u32 {
    match c {
        '0'..='9' => c as u32 - '0' as u32,
        'A'..='Z' => c as u32 - 'A' as u32 + 10,
        _ => 0,
    }
}

// A read check character: digit, confusable glyph, or filler for zero.
fn check_value(c: char) -> Option<u32> {
    if c == '<' {
        return Some(0);
    }
    confirm_digit(c).and_then(|d| d.to_digit(10))
}

fn check_matches(value: &str, check: char) -> bool {
    check_value(check) == Some(MrzValidator::check_digit(value))
}

fn fit(line: &str, width: usize) -> String {
    let mut fitted: String = line.chars().take(width).collect();
    while fitted.len() < width {
        fitted.push('<');
    }
    fitted
}

fn slice(row: &str, start: usize, end: usize) -> String {
    row[start..end].to_string()
}

fn at(row: &str, index: usize) -> char {
    row.as_bytes()[index] as char
}

fn strip_fillers(value: &str) -> String {
    value
        .split('<')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn field(value: String, check_digit: char) -> MrzField {
    MrzField {
        value,
        check_digit,
        corrected: None,
        checksum_valid: false,
    }
}

fn split_names(zone: &str) -> (String, String) {
    match zone.split_once("<<") {
        Some((surname, given)) => (strip_fillers(surname), strip_fillers(given)),
        None => (strip_fillers(zone), String::new()),
    }
}

fn sex(c: char) -> String {
    match c {
        'M' | 'F' => c.to_string(),
        _ => "X".to_string(),
    }
}

fn parse_td3(rows: &[String]) -> MrzRecord {
    let (l1, l2) = (&rows[0], &rows[1]);
    let (surname, given_names) = split_names(&l1[5..44]);
    MrzRecord {
        format: MrzFormat::TD3,
        document_code: strip_fillers(&l1[0..2]),
        issuing_state: strip_fillers(&l1[2..5]),
        surname,
        given_names,
        document_number: field(slice(l2, 0, 9), at(l2, 9)),
        nationality: strip_fillers(&l2[10..13]),
        birth_date: field(slice(l2, 13, 19), at(l2, 19)),
        sex: sex(at(l2, 20)),
        expiry_date: field(slice(l2, 21, 27), at(l2, 27)),
        personal_number: Some(field(slice(l2, 28, 42), at(l2, 42))),
        optional_data: String::new(),
        optional_data_2: String::new(),
        composite_check: at(l2, 43),
        composite_valid: false,
        mrz_valid: false,
        raw_lines: rows.to_vec(),
    }
}

fn parse_td2(rows: &[String]) -> MrzRecord {
    let (l1, l2) = (&rows[0], &rows[1]);
    let (surname, given_names) = split_names(&l1[5..36]);
    MrzRecord {
        format: MrzFormat::TD2,
        document_code: strip_fillers(&l1[0..2]),
        issuing_state: strip_fillers(&l1[2..5]),
        surname,
        given_names,
        document_number: field(slice(l2, 0, 9), at(l2, 9)),
        nationality: strip_fillers(&l2[10..13]),
        birth_date: field(slice(l2, 13, 19), at(l2, 19)),
        sex: sex(at(l2, 20)),
        expiry_date: field(slice(l2, 21, 27), at(l2, 27)),
        personal_number: None,
        optional_data: slice(l2, 28, 35),
        optional_data_2: String::new(),
        composite_check: at(l2, 35),
        composite_valid: false,
        mrz_valid: false,
        raw_lines: rows.to_vec(),
    }
}

fn parse_td1(rows: &[String]) -> MrzRecord {
    let (l1, l2, l3) = (&rows[0], &rows[1], &rows[2]);
    let (surname, given_names) = split_names(l3);
    MrzRecord {
        format: MrzFormat::TD1,
        document_code: strip_fillers(&l1[0..2]),
        issuing_state: strip_fillers(&l1[2..5]),
        surname,
        given_names,
        document_number: field(slice(l1, 5, 14), at(l1, 14)),
        nationality: strip_fillers(&l2[15..18]),
        birth_date: field(slice(l2, 0, 6), at(l2, 6)),
        sex: sex(at(l2, 7)),
        expiry_date: field(slice(l2, 8, 14), at(l2, 14)),
        personal_number: None,
        optional_data: slice(l1, 15, 30),
        optional_data_2: slice(l2, 18, 29),
        composite_check: at(l2, 29),
        composite_valid: false,
        mrz_valid: false,
        raw_lines: rows.to_vec(),
    }
}

// Validates one field; dates may be confirmed through the confusion table.
fn validate_field(field: &mut MrzField, allow_correction: bool) {
    field.corrected = None;
    field.checksum_valid = check_matches(&field.value, field.check_digit);
    if field.checksum_valid || !allow_correction {
        return;
    }
    let corrected = correct_digits(&field.value);
    if corrected != field.value && check_matches(&corrected, field.check_digit) {
        field.corrected = Some(corrected);
        field.checksum_valid = true;
    }
}

// Composite segment: effective value plus the check character as the field check read it.
fn with_check(field: &MrzField) -> String {
    let check = confirm_digit(field.check_digit).unwrap_or(field.check_digit);
    format!("{}{}", field.effective(), check)
}

impl MrzRecord {
    /// Recomputes every checksum flag from the stored values and check characters.
    pub fn revalidate(&mut self) {
        validate_field(&mut self.document_number, false);
        validate_field(&mut self.birth_date, true);
        validate_field(&mut self.expiry_date, true);
        if let Some(personal) = self.personal_number.as_mut() {
            validate_field(personal, false);
        }

        let composite = match self.format {
            MrzFormat::TD3 => format!(
                "{}{}{}{}",
                with_check(&self.document_number),
                with_check(&self.birth_date),
                with_check(&self.expiry_date),
                self.personal_number.as_ref().map(with_check).unwrap_or_default()
            ),
            MrzFormat::TD2 => format!(
                "{}{}{}{}",
                with_check(&self.document_number),
                with_check(&self.birth_date),
                with_check(&self.expiry_date),
                self.optional_data
            ),
            MrzFormat::TD1 => format!(
                "{}{}{}{}",
                with_check(&self.document_number),
                self.optional_data,
                with_check(&self.birth_date),
                with_check(&self.expiry_date),
            ) + &self.optional_data_2,
        };
        self.composite_valid = check_matches(&composite, self.composite_check);

        self.mrz_valid = self.document_number.checksum_valid
            && self.birth_date.checksum_valid
            && self.expiry_date.checksum_valid
            && self.personal_number.as_ref().map_or(true, |p| p.checksum_valid)
            && self.composite_valid;
    }

    /// Given names followed by the surname.
    pub fn full_name(&self) -> String {
        [self.given_names.as_str(), self.surname.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Two-digit years later than the current year belong to the 1900s.
    pub fn birth_date_iso(&self) -> Option<NaiveDate> {
        let this_year = (Local::now().year() % 100) as u32;
        mrz_date(self.birth_date.effective(), |yy| {
            if yy > this_year {
                1900 + yy as i32
            } else {
                2000 + yy as i32
            }
        })
    }

    pub fn expiry_date_iso(&self) -> Option<NaiveDate> {
        mrz_date(self.expiry_date.effective(), |yy| 2000 + yy as i32)
    }
}

fn mrz_date(yymmdd: &str, century: impl Fn(u32) -> i32) -> Option<NaiveDate> {
    if yymmdd.len() != 6 || !yymmdd.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let yy: u32 = yymmdd[0..2].parse().ok()?;
    let mm: u32 = yymmdd[2..4].parse().ok()?;
    let dd: u32 = yymmdd[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(century(yy), mm, dd)
}
