//! `Key: Value` header files.
//!
//! A header file starts with one or more `Key: Value` lines and ends its
//! header at the first blank line (or end of file). Anything after the blank
//! line is an opaque body that is carried through unchanged.

use std::io::{BufRead, BufReader, ErrorKind, Read};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Not a header file: {0}")]
    NotHeader(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed header file. Field order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFile {
    fields: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HeaderFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        let mut reader = BufReader::new(data);
        let fields = read_fields(&mut reader)?;
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        Ok(Self { fields, body })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.fields {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }
}

/// Read only the header fields from `reader`, leaving the body unread.
pub fn read_header<R: Read>(reader: R) -> Result<Vec<(String, String)>, HeaderError> {
    read_fields(&mut BufReader::new(reader))
}

fn read_fields<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>, HeaderError> {
    let mut fields = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let read = match reader.read_line(&mut line) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(HeaderError::NotHeader("not valid UTF-8".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if read == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        match trimmed.split_once(':') {
            Some((key, value)) if is_key(key) => {
                fields.push((key.to_string(), value.trim().to_string()));
            }
            _ => {
                return Err(HeaderError::NotHeader(format!(
                    "line {} is not a header field",
                    fields.len() + 1
                )))
            }
        }
    }
    if fields.is_empty() {
        return Err(HeaderError::NotHeader("no header fields".to_string()));
    }
    Ok(fields)
}

fn is_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"PatientName: Doe^Jane\nPatientID: 1234\nStudyInstanceUID: 1.2.3\n\nBODY\x00\x01";

    #[test]
    fn test_parse_and_serialize() {
        let mut header = HeaderFile::parse(SAMPLE).unwrap();
        assert_eq!(header.get("PatientName"), Some("Doe^Jane"));
        assert_eq!(header.body(), b"BODY\x00\x01");
        assert_eq!(header.to_bytes(), SAMPLE);

        header.set("PatientName", "");
        assert_eq!(header.remove("PatientID").as_deref(), Some("1234"));
        let again = HeaderFile::parse(&header.to_bytes()).unwrap();
        assert_eq!(again.get("PatientName"), Some(""));
        assert_eq!(again.get("PatientID"), None);
        assert_eq!(again.body(), b"BODY\x00\x01");
    }

    #[test]
    fn test_read_header_only() {
        let fields = read_header(SAMPLE).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2], ("StudyInstanceUID".to_string(), "1.2.3".to_string()));
    }

    #[test]
    fn test_rejects_non_header() {
        assert!(HeaderFile::parse(b"just some text\n").is_err());
        assert!(HeaderFile::parse(b"").is_err());
    }
}
