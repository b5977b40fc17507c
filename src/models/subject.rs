//! Subject code mapping.

use std::sync::LazyLock;

use regex::Regex;

static CODE_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{SubjectCode(?::(0)?(\d+)d?)?\}").expect("subject code placeholder regex")
});

/// A stable pseudonymous code assigned to one set of identifying fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectMapping {
    pub map_id: i64,
    pub ingest_id: i64,
    pub subject_id: i64,
    pub subject_code: String,
    pub field_values: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewSubjectMapping {
    pub ingest_id: i64,
    pub subject_id: i64,
    pub subject_code: String,
    pub field_values: Vec<String>,
}

/// Format string for subject codes, e.g. `ex{SubjectCode:04d}`.
///
/// Supports `{SubjectCode}` and zero/space padded widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectCodeFormat {
    template: String,
}

impl SubjectCodeFormat {
    pub fn parse(template: &str) -> Result<Self, String> {
        if !CODE_PLACEHOLDER.is_match(template) {
            return Err(format!(
                "subject code format '{template}' has no {{SubjectCode}} placeholder"
            ));
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn format(&self, subject_id: i64) -> String {
        CODE_PLACEHOLDER
            .replace_all(&self.template, |caps: &regex::Captures<'_>| {
                let width = caps
                    .get(2)
                    .and_then(|w| w.as_str().parse::<usize>().ok())
                    .unwrap_or(0);
                if caps.get(1).is_some() {
                    format!("{subject_id:0width$}")
                } else {
                    format!("{subject_id:width$}")
                }
            })
            .into_owned()
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }
}

impl Default for SubjectCodeFormat {
    fn default() -> Self {
        Self {
            template: "{SubjectCode}".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_code_format() {
        assert_eq!(SubjectCodeFormat::default().format(7), "7");
        assert_eq!(
            SubjectCodeFormat::parse("ex{SubjectCode:04d}").unwrap().format(12),
            "ex0012"
        );
        assert_eq!(
            SubjectCodeFormat::parse("S{SubjectCode:3}").unwrap().format(5),
            "S  5"
        );
        assert!(SubjectCodeFormat::parse("no placeholder").is_err());
    }
}
