//! Turning raw record payloads into downstream call parameters.

use serde_json::Value;

use crate::errors::DecodeError;
use crate::sink::Param;

pub trait Decoder: Send + 'static {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<Param>, DecodeError>;
}

/// Decodes a JSON array into one parameter per element. Any other JSON value
/// becomes a single parameter.
#[derive(Debug, Default, Clone)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<Param>, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }
        match serde_json::from_slice::<Value>(payload)? {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }
}

/// Decodes one delimited record into string parameters. Fields may be
/// wrapped in double quotes, with a doubled quote standing for a literal
/// one. Surrounding whitespace is trimmed.
#[derive(Debug, Clone)]
pub struct CsvDecoder {
    separator: u8,
}

impl Default for CsvDecoder {
    fn default() -> Self {
        Self { separator: b',' }
    }
}

impl CsvDecoder {
    pub fn new(separator: u8) -> Self {
        Self { separator }
    }
}

impl Decoder for CsvDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<Param>, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.separator)
            .trim(csv::Trim::Fields)
            .from_reader(payload);
        let mut record = csv::StringRecord::new();
        if !reader.read_record(&mut record)? {
            return Err(DecodeError::Empty);
        }
        if reader.read_record(&mut csv::StringRecord::new())? {
            return Err(DecodeError::Malformed {
                reason: "payload holds more than one record".to_string(),
            });
        }
        Ok(record
            .iter()
            .map(|field| Value::String(field.to_string()))
            .collect())
    }
}
