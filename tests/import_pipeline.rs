//! End-to-end imports through the driver, the executor and a local
//! destination directory.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bulk_import::config::{ImporterConfig, Settings};
use bulk_import::deid::{DeidProfileConfig, HeaderDeidConfig, SubjectsMappingConfig};
use bulk_import::importer::{BulkImport, ImportContext, ReviewSummary};
use bulk_import::models::{IngestStage, ItemType, QueueKind};
use bulk_import::repository::DbContext;
use bulk_import::template::{parse_template_string, TemplateNodeConfig};
use bulk_import::upload::LocalUploader;
use tempfile::tempdir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, body) in files {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, body).unwrap();
    }
}

async fn context(work: &Path) -> Arc<ImportContext> {
    let settings = Settings {
        database_url: format!("sqlite:{}", work.join("import.db").display()),
        workers: 2,
        poll_interval_ms: 20,
        destination: work.join("uploads"),
        ..Settings::default()
    };
    let db = DbContext::new(&work.join("import.db"));
    db.initialize().await.unwrap();
    let uploader = Arc::new(LocalUploader::new(settings.destination.clone()));
    Arc::new(ImportContext::new(db, settings, uploader))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_import_subject_session_tree() {
    let source = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_tree(
        source.path(),
        &[
            ("subject1/session1/a.dat", "alpha"),
            ("subject1/session1/b.dat", "bravo"),
        ],
    );

    let ctx = context(work.path()).await;
    let mut config = ImporterConfig::for_folder(source.path());
    config.template = parse_template_string("{subject}:{session}");

    let outcome = BulkImport::new(ctx.clone(), config).workers(2).run().await.unwrap();
    assert_eq!(outcome.stage, IngestStage::Complete);
    assert!(outcome.is_success());
    assert!(outcome.progress.is_complete());

    let db = &ctx.db;
    let items = db.items().list_for_ingest(outcome.ingest_id).await.unwrap();
    assert_eq!(items.len(), 2);
    for item in &items {
        assert_eq!(item.item_type, ItemType::File);
        assert_eq!(item.context.target.as_ref().unwrap().id, "subject1/session1");
    }

    let audit = db.audit_logs().list_for_ingest(outcome.ingest_id).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert!(audit.iter().all(|entry| !entry.failed));
    let mut destinations: Vec<&str> = audit.iter().filter_map(|e| e.fw_path.as_deref()).collect();
    destinations.sort();
    assert_eq!(
        destinations,
        vec!["subject1/session1/a.dat", "subject1/session1/b.dat"]
    );

    assert!(db
        .queue(QueueKind::Work)
        .is_complete_for_ingest(outcome.ingest_id)
        .await
        .unwrap());
    let uploaded = work.path().join("uploads/subject1/session1");
    assert_eq!(fs::read_to_string(uploaded.join("a.dat")).unwrap(), "alpha");
    assert!(uploaded.join("b.dat.meta.json").is_file());

    let ingest = db.ingests().get(outcome.ingest_id).await.unwrap();
    assert!(ingest.processing_start.is_some());
    assert!(ingest.processing_end.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_declined_review_uploads_nothing() {
    let source = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_tree(source.path(), &[("s1/ses1/a.dat", "a"), ("s1/ses1/b.dat", "b")]);

    let ctx = context(work.path()).await;
    let mut config = ImporterConfig::for_folder(source.path());
    config.template = parse_template_string("{subject}:{session}");

    let outcome = BulkImport::new(ctx.clone(), config)
        .workers(2)
        .confirm_with(Arc::new(|summary: &ReviewSummary| {
            assert_eq!(summary.queued, 2);
            false
        }))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.stage, IngestStage::Aborted);
    assert_eq!(outcome.progress.work.total(), 0);
    assert!(!work.path().join("uploads").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_before_discovery_finishes() {
    let source = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_tree(source.path(), &[("s1/ses1/a.dat", "a")]);

    let ctx = context(work.path()).await;
    let import = BulkImport::new(ctx.clone(), ImporterConfig::for_folder(source.path())).workers(1);
    import.abort_handle().abort();

    let outcome = import.run().await.unwrap();
    assert_eq!(outcome.stage, IngestStage::Aborted);
    assert!(outcome.review.is_none());
    assert!(!work.path().join("uploads").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_import_from_zip_with_packfiles() {
    let source = tempdir().unwrap();
    let work = tempdir().unwrap();
    let archive = source.path().join("export.zip");
    let mut writer = ZipWriter::new(File::create(&archive).unwrap());
    for (name, body) in [
        ("s1/ses1/scans/1.raw", "one"),
        ("s1/ses1/scans/nested/2.raw", "two"),
        ("s1/ses1/notes.txt", "notes"),
    ] {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap();

    let ctx = context(work.path()).await;
    let mut scans = TemplateNodeConfig::pattern("scans");
    scans.packfile_type = Some("raw".to_string());
    let mut config = ImporterConfig::for_folder(&archive);
    config.project = Some("Study".to_string());
    config.template = vec![TemplateNodeConfig::pattern("{subject}")
        .with_child(TemplateNodeConfig::pattern("{session}").with_child(scans))];
    config.audit_log_path = Some(work.path().join("audit.csv"));

    let outcome = BulkImport::new(ctx.clone(), config).workers(2).run().await.unwrap();
    assert!(outcome.is_success());

    let session = work.path().join("uploads/Study/s1/ses1");
    assert_eq!(fs::read_to_string(session.join("notes.txt")).unwrap(), "notes");

    let packfile = File::open(session.join("ses1.raw.zip")).unwrap();
    let mut packed = ZipArchive::new(packfile).unwrap();
    let mut names: Vec<String> = packed.file_names().map(str::to_string).collect();
    names.sort();
    assert_eq!(names, vec!["1.raw", "nested/2.raw"]);
    let mut body = String::new();
    packed.by_name("nested/2.raw").unwrap().read_to_string(&mut body).unwrap();
    assert_eq!(body, "two");

    let audit = fs::read_to_string(work.path().join("audit.csv")).unwrap();
    assert!(audit.starts_with("Source Path,Destination Path,Failed,Message\n"));
    assert_eq!(audit.lines().count(), 3);
    // The audit log is also uploaded to the project.
    let uploaded_audit = work
        .path()
        .join(format!("uploads/Study/bulk-import-audit-{}.csv", outcome.ingest_id));
    assert_eq!(fs::read_to_string(uploaded_audit).unwrap(), audit);
}

fn header(name: &str, patient: &str) -> String {
    format!(
        "PatientName: {name}\nPatientID: {patient}\nStudyInstanceUID: 1.2\n\
         SeriesInstanceUID: 1.2.3\nStudyDescription: Brain\nSeriesDescription: T1\n\nPIXELS"
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scan_with_subject_mapping_and_deid_log() {
    let source = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_tree(
        source.path(),
        &[
            ("site-a/raw/1.hdr", &header("Doe^Jane", "P1")),
            ("site-a/raw/2.hdr", &header("Doe^Jane", "P1")),
        ],
    );

    let ctx = context(work.path()).await;
    let mut raw = TemplateNodeConfig::pattern("raw");
    raw.scan = Some("header".to_string());

    let subject_map: PathBuf = work.path().join("subjects.csv");
    let deid_log: PathBuf = work.path().join("deid.csv");
    let mut profile = DeidProfileConfig::new("study");
    profile.header = Some(HeaderDeidConfig {
        remove: vec!["PatientName".to_string()],
        ..HeaderDeidConfig::default()
    });
    profile.subjects_mapping = Some(SubjectsMappingConfig {
        fields: vec!["PatientID".to_string()],
        format: "ex{SubjectCode:03d}".to_string(),
        load_from: None,
        save_to: Some(subject_map.clone()),
    });
    profile.deid_log = Some(deid_log.clone());

    let mut config = ImporterConfig::for_folder(source.path());
    config.template = vec![TemplateNodeConfig::pattern("{subject}").with_child(raw)];
    config.deid_profile = Some("study".to_string());
    config.deid_profiles = vec![profile];

    let outcome = BulkImport::new(ctx.clone(), config).workers(2).run().await.unwrap();
    assert!(outcome.is_success());

    let db = &ctx.db;
    let items = db.items().list_for_ingest(outcome.ingest_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_type, ItemType::Packfile);
    assert_eq!(items[0].context.metadata.subject.as_deref(), Some("ex001"));

    let packfile = work.path().join("uploads/ex001/Brain/T1/T1.header.zip");
    let mut packed = ZipArchive::new(File::open(packfile).unwrap()).unwrap();
    let mut member = String::new();
    packed.by_name("1.hdr").unwrap().read_to_string(&mut member).unwrap();
    assert!(!member.contains("PatientName"));
    assert!(member.contains("PatientID: P1"));

    let logs = db.deid_logs().list_for_ingest(outcome.ingest_id).await.unwrap();
    assert_eq!(logs.len(), 4);
    assert_eq!(logs.iter().filter(|l| l.log_type == "before").count(), 2);

    let mappings = fs::read_to_string(subject_map).unwrap();
    assert_eq!(mappings, "SubjectId,SubjectCode,PatientID\n1,ex001,P1\n");
    assert!(fs::read_to_string(deid_log).unwrap().starts_with("path,type,"));
}
