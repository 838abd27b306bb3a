// Character-confusion table and per-field value normalization.
//
// The confusion table is only consulted to confirm that a value which failed
// its expected numeric format was a misread of one that passes. Extracted text
// is never rewritten wholesale; callers keep both the raw and corrected forms.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::Normalization;

/// Bumped whenever an entry of `DIGIT_CONFUSIONS` changes.
pub const CONFUSION_TABLE_VERSION: u32 = 1;

/// Glyphs commonly produced by OCR in place of a digit.
pub const DIGIT_CONFUSIONS: &[(char, char)] = &[
    ('O', '0'),
    ('o', '0'),
    ('Q', '0'),
    ('D', '0'),
    ('I', '1'),
    ('l', '1'),
    ('|', '1'),
    ('i', '1'),
    ('Z', '2'),
    ('z', '2'),
    ('S', '5'),
    ('s', '5'),
    ('G', '6'),
    ('b', '6'),
    ('B', '8'),
    ('g', '9'),
];

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref DATE: Regex =
        Regex::new(r"(\d{1,2})\s*[-./ ]\s*(\d{1,2})\s*[-./ ]\s*(\d{4})").unwrap();
    static ref NAMED_DATE: Regex =
        Regex::new(r"(?i)\b(\d{1,2})\s*[-./ ]?\s*([A-Z]{3,9})\s*[-./ ]?\s*(\d{4})\b").unwrap();
    static ref ALNUM_RUN: Regex = Regex::new(r"[0-9A-Za-z]+").unwrap();
}

const EDGE_DELIMITERS: &[char] = &[':', '=', '-', '.', ',', '/', ';', ' ', '\t'];

/// Digit a character stands for, when it is a digit or a known misread of one.
pub fn confirm_digit(c: char) -> Option<char> {
    if c.is_ascii_digit() {
        return Some(c);
    }
    DIGIT_CONFUSIONS
        .iter()
        .find(|(from, _)| *from == c)
        .map(|(_, to)| *to)
}

/// Maps confusable glyphs to digits, one character for one character.
pub fn correct_digits(text: &str) -> String {
    text.chars().map(|c| confirm_digit(c).unwrap_or(c)).collect()
}

/// Confirms a token as purely numeric, returning its digit form.
pub fn confirm_numeric(token: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    token.chars().map(confirm_digit).collect()
}

pub fn normalize(value: &str, rule: Normalization) -> String {
    match rule {
        Normalization::None => value.trim().to_string(),
        Normalization::Text => normalize_text(value),
        Normalization::Digits => normalize_digits(value),
        Normalization::RtRw => normalize_rt_rw(value),
        Normalization::Date => normalize_date(value),
        Normalization::Gender => normalize_gender(value),
        Normalization::Sex => normalize_sex(value),
    }
}

// Collapses whitespace and strips edge delimiters without touching case, so
// a rejected value cannot become confirmable on a second pass.
fn collapse(value: &str) -> String {
    WHITESPACE
        .replace_all(value, " ")
        .trim_matches(|c| EDGE_DELIMITERS.contains(&c))
        .to_string()
}

fn normalize_text(value: &str) -> String {
    collapse(value).to_uppercase()
}

fn normalize_digits(value: &str) -> String {
    let trimmed = collapse(value);
    let compact: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '.' | ':'))
        .collect();
    confirm_numeric(&compact).unwrap_or(trimmed)
}

fn normalize_rt_rw(value: &str) -> String {
    let parts: Vec<String> = ALNUM_RUN
        .find_iter(value)
        .filter_map(|m| confirm_numeric(m.as_str()))
        .collect();
    if parts.len() >= 2 {
        format!("{} / {}", parts[0], parts[1])
    } else {
        collapse(value)
    }
}

fn normalize_date(value: &str) -> String {
    let corrected = correct_digits(value);
    if let Some(caps) = DATE.captures(&corrected) {
        let day: u32 = caps[1].parse().unwrap_or(0);
        let month: u32 = caps[2].parse().unwrap_or(0);
        return format!("{:02}-{:02}-{}", day, month, &caps[3]);
    }
    if let Some(caps) = NAMED_DATE.captures(value) {
        if let Some(month) = month_number(&caps[2]) {
            let day: u32 = caps[1].parse().unwrap_or(0);
            return format!("{:02}-{:02}-{}", day, month, &caps[3]);
        }
    }
    collapse(value)
}

// English and Indonesian month names, matched on their first three letters.
fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).flat_map(char::to_uppercase).collect();
    let month = match prefix.as_str() {
        "JAN" => 1,
        "FEB" | "PEB" => 2,
        "MAR" => 3,
        "APR" => 4,
        "MAY" | "MEI" => 5,
        "JUN" => 6,
        "JUL" => 7,
        "AUG" | "AGU" | "AGT" => 8,
        "SEP" => 9,
        "OCT" | "OKT" => 10,
        "NOV" | "NOP" => 11,
        "DEC" | "DES" => 12,
        _ => return None,
    };
    Some(month)
}

fn normalize_gender(value: &str) -> String {
    let upper = normalize_text(value);
    let compact: String = upper.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    if compact.contains("PEREMPUAN") || compact.contains("WANITA") || compact.contains("FEMALE") || compact == "P" {
        "PEREMPUAN".to_string()
    } else if compact.contains("LAKI") || compact.contains("PRIA") || compact.contains("MALE") || compact == "L" {
        "LAKI-LAKI".to_string()
    } else {
        upper
    }
}

fn normalize_sex(value: &str) -> String {
    let upper = normalize_text(value);
    let compact: String = upper.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    if compact == "F" || compact.contains("FEMALE") || compact.contains("PEREMPUAN") || compact.contains("WANITA") {
        "F".to_string()
    } else if compact == "M" || compact.contains("MALE") || compact.contains("LAKI") || compact.contains("PRIA") {
        "M".to_string()
    } else if compact == "X" {
        "X".to_string()
    } else {
        upper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_RULES: [Normalization; 7] = [
        Normalization::None,
        Normalization::Text,
        Normalization::Digits,
        Normalization::RtRw,
        Normalization::Date,
        Normalization::Gender,
        Normalization::Sex,
    ];

    #[test]
    fn rt_rw_recovers_misread_zeros() {
        assert_eq!(normalize("2OO8/OO5", Normalization::RtRw), "2008 / 005");
        assert_eq!(normalize("RT/RW 2OO8/OO5", Normalization::RtRw), "2008 / 005");
        assert_eq!(normalize("004 | 011", Normalization::RtRw), "004 / 011");
    }

    #[test]
    fn dates_are_standardized() {
        assert_eq!(normalize("7.8.1945", Normalization::Date), "07-08-1945");
        assert_eq!(normalize("17/O8/1945", Normalization::Date), "17-08-1945");
        assert_eq!(normalize("17 - 08 - 1945", Normalization::Date), "17-08-1945");
        assert_eq!(normalize("12 AUG 1974", Normalization::Date), "12-08-1974");
        assert_eq!(normalize("1 Desember 2030", Normalization::Date), "01-12-2030");
        assert_eq!(normalize("SEUMUR HIDUP", Normalization::Date), "SEUMUR HIDUP");
    }

    #[test]
    fn gender_variants_collapse() {
        assert_eq!(normalize("LAKI LAKI", Normalization::Gender), "LAKI-LAKI");
        assert_eq!(normalize(": pria", Normalization::Gender), "LAKI-LAKI");
        assert_eq!(normalize("WANITA", Normalization::Gender), "PEREMPUAN");
        assert_eq!(normalize("Female", Normalization::Sex), "F");
        assert_eq!(normalize("m", Normalization::Sex), "M");
    }

    #[test]
    fn digits_only_rewritten_when_fully_numeric() {
        assert_eq!(normalize("3171 O12 345", Normalization::Digits), "3171012345");
        assert_eq!(normalize(" ktp ", Normalization::Digits), "ktp");
    }

    #[test]
    fn text_trims_delimiters_and_uppercases() {
        assert_eq!(normalize(" : jl. merdeka   no 5 ", Normalization::Text), "JL. MERDEKA NO 5");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "2OO8/OO5",
            "RT/RW 004 / 011",
            " : budi   santoso ",
            "17.8.1945",
            "JAKARTA, 17-08-1945",
            "LAKI LAKI",
            "perempuan",
            "3171 O12 345",
            "F",
            "",
            "-- ISLAM --",
            "12 aug 1974",
        ];
        for rule in ALL_RULES {
            for sample in samples {
                let once = normalize(sample, rule);
                let twice = normalize(&once, rule);
                assert_eq!(once, twice, "rule {:?} not idempotent on {:?}", rule, sample);
            }
        }
    }

    #[test]
    fn confusion_correction_keeps_length() {
        let raw = "3l7IO2";
        let corrected = correct_digits(raw);
        assert_eq!(corrected, "317102");
        assert_eq!(raw.chars().count(), corrected.chars().count());
        assert_eq!(confirm_numeric("OO5").as_deref(), Some("005"));
        assert_eq!(confirm_numeric("RW"), None);
    }
}
