//! CSV import and export of audit trails and mappings.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use csv::{ReaderBuilder, Writer};

use crate::models::{AuditLog, DeidLog, NewPrivateTag, NewSubjectMapping, SubjectMapping};

pub const AUDIT_LOG_HEADER: [&str; 4] = ["Source Path", "Destination Path", "Failed", "Message"];

pub fn write_audit_log<W: Write>(out: W, entries: &[AuditLog]) -> csv::Result<()> {
    let mut writer = Writer::from_writer(out);
    writer.write_record(AUDIT_LOG_HEADER)?;
    for entry in entries {
        writer.write_record([
            entry.src_path.as_str(),
            entry.fw_path.as_deref().unwrap_or(""),
            if entry.failed { "true" } else { "false" },
            entry.message.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write subject mappings with one column per identifying field.
pub fn write_subject_map<W: Write>(
    out: W,
    mappings: &[SubjectMapping],
    fields: &[String],
) -> csv::Result<()> {
    let mut writer = Writer::from_writer(out);
    let mut header = vec!["SubjectId".to_string(), "SubjectCode".to_string()];
    header.extend(fields.iter().cloned());
    writer.write_record(&header)?;
    for mapping in mappings {
        let mut row = vec![mapping.subject_id.to_string(), mapping.subject_code.clone()];
        row.extend(mapping.field_values.iter().cloned());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read mappings written by [`write_subject_map`].
pub fn read_subject_map<R: Read>(input: R, ingest_id: i64) -> csv::Result<Vec<NewSubjectMapping>> {
    let mut reader = ReaderBuilder::new().flexible(true).from_reader(input);
    let mut mappings = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let subject_id = record
            .get(0)
            .and_then(|id| id.trim().parse::<i64>().ok())
            .ok_or_else(|| bad_row(index, "SubjectId is not an integer"))?;
        let subject_code = record
            .get(1)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| bad_row(index, "SubjectCode is empty"))?
            .to_string();
        mappings.push(NewSubjectMapping {
            ingest_id,
            subject_id,
            subject_code,
            field_values: record.iter().skip(2).map(str::to_string).collect(),
        });
    }
    Ok(mappings)
}

fn bad_row(index: usize, message: &str) -> csv::Error {
    csv::Error::from(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("row {}: {}", index + 2, message),
    ))
}

/// Write de-identification records, one column per field seen in any record.
pub fn write_deid_log<W: Write>(out: W, entries: &[DeidLog]) -> csv::Result<()> {
    let fields: BTreeSet<&str> = entries
        .iter()
        .flat_map(|entry| entry.field_values.keys().map(String::as_str))
        .collect();

    let mut writer = Writer::from_writer(out);
    let mut header = vec!["path", "type"];
    header.extend(fields.iter().copied());
    writer.write_record(&header)?;
    for entry in entries {
        let mut row = vec![entry.path.as_str(), entry.log_type.as_str()];
        row.extend(
            fields
                .iter()
                .map(|field| entry.field_values.get(*field).map(String::as_str).unwrap_or("")),
        );
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a private tag dictionary (`PrivateCreator,Tag,VR,Description,VM`).
pub fn read_private_tags<R: Read>(input: R) -> csv::Result<Vec<NewPrivateTag>> {
    ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input)
        .deserialize()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[test]
    fn test_audit_log_csv() {
        let entries = vec![
            AuditLog {
                log_id: 1,
                ingest_id: 1,
                src_path: "s1/a.dat".into(),
                fw_path: Some("s1/ses1/a.dat".into()),
                failed: false,
                message: Some("Completed".into()),
            },
            AuditLog {
                log_id: 2,
                ingest_id: 1,
                src_path: "s1/b.dat".into(),
                fw_path: None,
                failed: true,
                message: Some("disk full, retry".into()),
            },
        ];
        let mut out = Vec::new();
        write_audit_log(&mut out, &entries).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Source Path,Destination Path,Failed,Message\n\
             s1/a.dat,s1/ses1/a.dat,false,Completed\n\
             s1/b.dat,,true,\"disk full, retry\"\n"
        );
    }

    #[test]
    fn test_subject_map_csv_reload() {
        let mappings = vec![SubjectMapping {
            map_id: 1,
            ingest_id: 1,
            subject_id: 3,
            subject_code: "ex003".into(),
            field_values: vec!["Doe^Jane".into(), "19700101".into()],
        }];
        let fields = vec!["PatientName".to_string(), "PatientBirthDate".to_string()];
        let mut out = Vec::new();
        write_subject_map(&mut out, &mappings, &fields).unwrap();

        let loaded = read_subject_map(out.as_slice(), 7).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].ingest_id, 7);
        assert_eq!(loaded[0].subject_id, 3);
        assert_eq!(loaded[0].subject_code, "ex003");
        assert_eq!(loaded[0].field_values, mappings[0].field_values);

        assert!(read_subject_map("SubjectId,SubjectCode\nx,y\n".as_bytes(), 1).is_err());
    }

    #[test]
    fn test_deid_log_columns() {
        let entry = |log_type: &str, pairs: &[(&str, &str)]| DeidLog {
            log_id: 0,
            ingest_id: 1,
            path: "a.hdr".into(),
            log_type: log_type.into(),
            field_values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            created: Utc::now(),
        };
        let entries = vec![
            entry("before", &[("PatientName", "Doe"), ("PatientID", "42")]),
            entry("after", &[("PatientID", "ANON")]),
        ];
        let mut out = Vec::new();
        write_deid_log(&mut out, &entries).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "path,type,PatientID,PatientName\na.hdr,before,42,Doe\na.hdr,after,ANON,\n"
        );
    }

    #[test]
    fn test_read_private_tags() {
        let csv = "PrivateCreator,Tag,VR,Description,VM\nACME 1.0, 0019xx10 ,LO,Scanner Serial,1\n";
        let tags = read_private_tags(csv.as_bytes()).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag, "0019xx10");
        assert_eq!(tags[0].description, "Scanner Serial");
    }
}
