//! The 49-digit SRI access key (clave de acceso).
//!
//! Layout, left to right:
//!
//! | field          | width |
//! |----------------|-------|
//! | emission date  | 8 (`ddMMyyyy`) |
//! | document type  | 2 |
//! | issuer RUC     | 13 |
//! | environment    | 1 |
//! | establishment  | 3 |
//! | emission point | 3 |
//! | sequence       | 9 |
//! | numeric code   | 8 |
//! | emission type  | 1 |
//! | check digit    | 1 |
//!
//! The check digit is the SRI modulo-11 digit over the first 48 digits.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AccessKeyError;
use crate::models::{DocumentType, Environment};

pub const ACCESS_KEY_LEN: usize = 49;
pub const NORMAL_EMISSION: &str = "1";
pub const DEFAULT_NUMERIC_CODE: &str = "12345678";

const FACTORS: [u32; 6] = [2, 3, 4, 5, 6, 7];
const DATE_FORMAT: &str = "%d%m%Y";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[ACCESS_KEY_LEN - 1] - b'0'
    }

    pub fn decode(&self) -> Result<DocumentKeyFields, AccessKeyError> {
        decode(&self.0)
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccessKey {
    type Err = AccessKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if validate(s) {
            Ok(AccessKey(s.to_string()))
        } else {
            Err(AccessKeyError::InvalidAccessKey(s.to_string()))
        }
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

/// Fields needed to build a key.
#[derive(Debug, Clone)]
pub struct KeyInput<'a> {
    pub emission_date: NaiveDate,
    pub document_type: DocumentType,
    pub issuer_ruc: &'a str,
    pub environment: Environment,
    pub establishment: &'a str,
    pub emission_point: &'a str,
    pub sequence: &'a str,
}

/// Fields sliced back out of a valid key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentKeyFields {
    pub emission_date: NaiveDate,
    pub document_type_code: String,
    pub document_type: Option<DocumentType>,
    pub issuer_ruc: String,
    pub environment: String,
    pub establishment: String,
    pub emission_point: String,
    pub sequence: String,
    pub numeric_code: String,
    pub emission_type: String,
    pub check_digit: u8,
}

/// Generates keys with a fixed numeric code.
#[derive(Debug, Clone)]
pub struct AccessKeyCodec {
    numeric_code: String,
}

impl Default for AccessKeyCodec {
    fn default() -> Self {
        Self {
            numeric_code: DEFAULT_NUMERIC_CODE.to_string(),
        }
    }
}

impl AccessKeyCodec {
    pub fn new(numeric_code: &str) -> Result<Self, AccessKeyError> {
        let numeric_code = pad("numeric_code", numeric_code, 8)?;
        Ok(Self { numeric_code })
    }

    pub fn numeric_code(&self) -> &str {
        &self.numeric_code
    }

    pub fn generate(&self, input: &KeyInput<'_>) -> Result<AccessKey, AccessKeyError> {
        let mut key = String::with_capacity(ACCESS_KEY_LEN);
        key.push_str(&input.emission_date.format(DATE_FORMAT).to_string());
        key.push_str(input.document_type.code());
        key.push_str(&pad("issuer_ruc", input.issuer_ruc, 13)?);
        key.push_str(&input.environment.code().to_string());
        key.push_str(&pad("establishment", input.establishment, 3)?);
        key.push_str(&pad("emission_point", input.emission_point, 3)?);
        key.push_str(&pad("sequence", input.sequence, 9)?);
        key.push_str(&self.numeric_code);
        key.push_str(NORMAL_EMISSION);

        let digit = mod11_check_digit(&digits(&key));
        key.push(char::from(b'0' + digit));
        debug_assert_eq!(key.len(), ACCESS_KEY_LEN);
        Ok(AccessKey(key))
    }
}

fn pad(field: &'static str, value: &str, width: usize) -> Result<String, AccessKeyError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessKeyError::InvalidInput {
            field,
            reason: format!("`{value}` is not a non-empty digit string"),
        });
    }
    if value.len() > width {
        return Err(AccessKeyError::InvalidInput {
            field,
            reason: format!("`{value}` exceeds {width} digits"),
        });
    }
    Ok(format!("{value:0>width$}"))
}

fn digits(s: &str) -> Vec<u8> {
    s.bytes().map(|b| b - b'0').collect()
}

/// Weighted sum modulo 11, weights 2..=7 cycling from the rightmost digit.
pub fn mod11_remainder(digits: &[u8]) -> u32 {
    let sum: u32 = digits
        .iter()
        .rev()
        .zip(FACTORS.iter().cycle())
        .map(|(d, f)| u32::from(*d) * f)
        .sum();
    sum % 11
}

/// SRI check digit: `11 - remainder`, with 11 written as 0 and 10 as 1.
pub fn mod11_check_digit(digits: &[u8]) -> u8 {
    match 11 - mod11_remainder(digits) {
        11 => 0,
        10 => 1,
        d => d as u8,
    }
}

/// True when `key` is 49 digits with a matching check digit.
pub fn validate(key: &str) -> bool {
    if key.len() != ACCESS_KEY_LEN || !key.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let all = digits(key);
    mod11_check_digit(&all[..ACCESS_KEY_LEN - 1]) == all[ACCESS_KEY_LEN - 1]
}

pub fn decode(key: &str) -> Result<DocumentKeyFields, AccessKeyError> {
    if !validate(key) {
        return Err(AccessKeyError::InvalidAccessKey(key.to_string()));
    }
    let emission_date = NaiveDate::parse_from_str(&key[0..8], DATE_FORMAT)
        .map_err(|e| AccessKeyError::InvalidAccessKey(format!("{key}: bad date: {e}")))?;
    let document_type_code = key[8..10].to_string();
    Ok(DocumentKeyFields {
        emission_date,
        document_type: DocumentType::from_code(&document_type_code),
        document_type_code,
        issuer_ruc: key[10..23].to_string(),
        environment: key[23..24].to_string(),
        establishment: key[24..27].to_string(),
        emission_point: key[27..30].to_string(),
        sequence: key[30..39].to_string(),
        numeric_code: key[39..47].to_string(),
        emission_type: key[47..48].to_string(),
        check_digit: key.as_bytes()[48] - b'0',
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample_input() -> KeyInput<'static> {
        KeyInput {
            emission_date: date(2023, 11, 20),
            document_type: DocumentType::Invoice,
            issuer_ruc: "0992877878001",
            environment: Environment::Production,
            establishment: "001",
            emission_point: "001",
            sequence: "000000001",
        }
    }

    #[test]
    fn generates_known_invoice_key() {
        let key = AccessKeyCodec::default().generate(&sample_input()).unwrap();
        assert_eq!(key.as_str().len(), ACCESS_KEY_LEN);
        assert_eq!(
            key.as_str(),
            "2011202301099287787800120010010000000011234567812"
        );
        assert!(validate(key.as_str()));
    }

    #[test]
    fn remainder_one_maps_to_digit_one() {
        let codec = AccessKeyCodec::default();
        let key = codec
            .generate(&KeyInput {
                emission_date: date(2024, 5, 2),
                document_type: DocumentType::CreditNote,
                issuer_ruc: "1790011674001",
                environment: Environment::Test,
                establishment: "2",
                emission_point: "105",
                sequence: "123",
            })
            .unwrap();
        assert_eq!(
            key.as_str(),
            "0205202404179001167400110021050000001231234567811"
        );
        assert_eq!(mod11_remainder(&digits(&key.as_str()[..48])), 1);
    }

    #[test]
    fn decode_round_trips_fields() {
        let key = AccessKeyCodec::default().generate(&sample_input()).unwrap();
        let fields = key.decode().unwrap();
        assert_eq!(fields.emission_date, date(2023, 11, 20));
        assert_eq!(fields.document_type, Some(DocumentType::Invoice));
        assert_eq!(fields.issuer_ruc, "0992877878001");
        assert_eq!(fields.environment, "2");
        assert_eq!(fields.sequence, "000000001");
        assert_eq!(fields.numeric_code, DEFAULT_NUMERIC_CODE);
        assert_eq!(fields.emission_type, "1");
        assert_eq!(fields.check_digit, key.check_digit());
    }

    #[test]
    fn pads_short_fields() {
        let mut input = sample_input();
        input.sequence = "42";
        input.establishment = "7";
        let fields = AccessKeyCodec::default().generate(&input).unwrap().decode().unwrap();
        assert_eq!(fields.sequence, "000000042");
        assert_eq!(fields.establishment, "007");
    }

    #[test]
    fn rejects_oversized_sequence() {
        let mut input = sample_input();
        input.sequence = "1000000000";
        let err = AccessKeyCodec::default().generate(&input).unwrap_err();
        assert!(matches!(err, AccessKeyError::InvalidInput { field: "sequence", .. }));
    }

    #[test]
    fn rejects_non_digit_input() {
        let mut input = sample_input();
        input.issuer_ruc = "09928778780A1";
        assert!(AccessKeyCodec::default().generate(&input).is_err());
        assert!(AccessKeyCodec::new("1234567X").is_err());
    }

    #[test]
    fn validate_is_false_for_malformed_keys() {
        let key = AccessKeyCodec::default().generate(&sample_input()).unwrap();
        assert!(!validate(&key.as_str()[..48]));
        assert!(!validate(&format!("{}0", key)));
        assert!(!validate(&key.as_str().replacen('0', "a", 1)));
        assert!(!validate(""));
        assert!(matches!(
            decode("123"),
            Err(AccessKeyError::InvalidAccessKey(_))
        ));
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let key = AccessKeyCodec::default().generate(&sample_input()).unwrap();
        let mut tampered = key.to_string();
        tampered.replace_range(48..49, "0");
        assert!(tampered.parse::<AccessKey>().is_err());
        assert_eq!(key.to_string().parse::<AccessKey>().unwrap(), key);
    }

    #[test]
    fn single_digit_substitutions_are_detected_except_mod11_collisions() {
        let key = AccessKeyCodec::default().generate(&sample_input()).unwrap();
        let original = digits(key.as_str());
        let original_rem = mod11_remainder(&original[..48]);

        for pos in 0..ACCESS_KEY_LEN {
            for d in 0..=9u8 {
                if original[pos] == d {
                    continue;
                }
                let mut tampered = original.clone();
                tampered[pos] = d;
                let text: String = tampered.iter().map(|x| char::from(b'0' + x)).collect();
                if validate(&text) {
                    // Only the 1/10 remainder pair shares a check digit.
                    assert!(pos < 48, "check digit change went undetected");
                    let rem = mod11_remainder(&tampered[..48]);
                    let pair = [original_rem, rem];
                    assert!(
                        pair == [1, 10] || pair == [10, 1],
                        "undetected substitution at {pos} -> {d}"
                    );
                }
            }
        }
    }

    #[test]
    fn serde_rejects_invalid_key() {
        let key = AccessKeyCodec::default().generate(&sample_input()).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let back: AccessKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<AccessKey>("\"123\"").is_err());
    }
}
