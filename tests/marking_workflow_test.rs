use etma_handler::adapters::LocalStorage;
use etma_handler::core::fhi::FhiDocument;
use etma_handler::core::importer::{import_directory, repair_corrupted, verify_directory};
use etma_handler::core::returns::{ReturnEngine, ReturnsPipeline, MARKS_CSV};
use etma_handler::core::save_protocol::SaveState;
use etma_handler::utils::encoding::{decode_latin1, encode_latin1, TextEncoding};
use etma_handler::utils::error::{ErrorSeverity, EtmaError};
use etma_handler::{FormalSaveProtocol, IntegrityStore, SafeFileService};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const SCRIPT: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<student_submission>
  <student_details>
    <personal_id>A1234567</personal_id>
    <forenames>Zoë</forenames>
    <surname>Brontë</surname>
  </student_details>
  <submission_details>
    <course_code>E225</course_code>
    <pres_code>25J</pres_code>
    <assgnmt_suffix>01</assgnmt_suffix>
    <overall_grade_score/>
    <tutor_comments/>
    <max_assgnmt_score>100</max_assgnmt_score>
  </submission_details>
</student_submission>"#;

struct Workspace {
    _dir: TempDir,
    etmas: PathBuf,
    store_root: PathBuf,
    returns: PathBuf,
}

fn workspace() -> Workspace {
    let dir = TempDir::new().unwrap();
    let etmas = dir.path().join("etmas").join("E225");
    std::fs::create_dir_all(&etmas).unwrap();
    std::fs::write(
        etmas.join("A1234567.fhi"),
        encode_latin1(SCRIPT).unwrap(),
    )
    .unwrap();
    Workspace {
        store_root: dir.path().join("store"),
        returns: dir.path().join("returns"),
        etmas: dir.path().join("etmas"),
        _dir: dir,
    }
}

fn mark(path: &Path, protocol: &mut FormalSaveProtocol, score: u32, feedback: &str) {
    let bytes = std::fs::read(path).unwrap();
    let mut document = FhiDocument::parse(&decode_latin1(&bytes)).unwrap();
    let mut submission = document.to_submission(Some(path));
    if submission.status.is_complete() {
        submission.reopen().unwrap();
    } else {
        submission.start_marking().unwrap();
    }
    submission
        .complete_mark(score, document.max_score(), feedback)
        .unwrap();
    document.apply_marking(submission.status.marking().unwrap());

    protocol
        .execute_save(path, &document.to_xml().unwrap(), TextEncoding::Latin1)
        .unwrap();
}

#[tokio::test]
async fn test_import_mark_verify_and_package() {
    let ws = workspace();
    let script = ws.etmas.join("E225").join("A1234567.fhi");

    let mut store = IntegrityStore::open(&ws.store_root).unwrap();
    let imported = import_directory(&ws.etmas, &mut store).unwrap();
    assert_eq!(imported.imported.len(), 1);

    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    let mut protocol = FormalSaveProtocol::new(SafeFileService::new(None), store)
        .with_listener(move |ctx| seen.lock().unwrap().push(ctx.state()));

    mark(&script, &mut protocol, 68, "Clear structure; cite more sources.");

    assert_eq!(
        states.lock().unwrap().last().copied(),
        Some(SaveState::Complete)
    );
    let saved = std::fs::read(&script).unwrap();
    assert!(saved.contains(&0xEB), "Latin-1 ë must survive the save");
    assert!(script.with_file_name("A1234567.fhi.bak").exists());

    let store = protocol.into_store();
    let report = verify_directory(&ws.etmas, &store).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.valid.len(), 1);

    let history = store.history(&script).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|v| v.operation == "COMMIT"));
    assert_eq!(Some(history[0].hash.as_str()), store.expected_hash(&script));

    let storage = LocalStorage::new(&ws.returns);
    let pipeline = ReturnsPipeline::new(storage, &ws.etmas, "batch.zip");
    let location = ReturnEngine::new(pipeline).run().await.unwrap();
    assert_eq!(location, "batch.zip");

    let zip_file = std::fs::File::open(ws.returns.join("batch.zip")).unwrap();
    let mut archive = zip::ZipArchive::new(zip_file).unwrap();
    let mut summary = String::new();
    archive
        .by_name(MARKS_CSV)
        .unwrap()
        .read_to_string(&mut summary)
        .unwrap();
    let mut reader = csv::Reader::from_reader(summary.as_bytes());
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][0], "A1234567");
    assert_eq!(&rows[0][4], "68");
    assert_eq!(&rows[0][7], "Pass 3");
    assert!(archive.by_name("E225/A1234567.fhi").is_ok());
}

#[test]
fn test_remarking_replaces_score() {
    let ws = workspace();
    let script = ws.etmas.join("E225").join("A1234567.fhi");
    let store = IntegrityStore::open(&ws.store_root).unwrap();
    let mut protocol = FormalSaveProtocol::new(SafeFileService::new(None), store);

    mark(&script, &mut protocol, 40, "First pass");
    mark(&script, &mut protocol, 55, "Second look");

    let document = FhiDocument::parse(&decode_latin1(&std::fs::read(&script).unwrap())).unwrap();
    let marking = document.marking().unwrap();
    assert_eq!(marking.score, 55);
    assert_eq!(marking.feedback, "Second look");
    assert_eq!(protocol.store().history(&script).unwrap().len(), 2);
}

#[test]
fn test_tampering_is_detected_and_restored() {
    let ws = workspace();
    let script = ws.etmas.join("E225").join("A1234567.fhi");
    let mut store = IntegrityStore::open(&ws.store_root).unwrap();
    import_directory(&ws.etmas, &mut store).unwrap();
    let tracked = std::fs::read(&script).unwrap();

    std::fs::write(&script, SCRIPT.replace("A1234567", "Z9999999")).unwrap();

    let report = verify_directory(&ws.etmas, &store).unwrap();
    assert_eq!(report.corrupted.len(), 1);

    let repairs =
        repair_corrupted(&report.corrupted, &mut store, &SafeFileService::new(None)).unwrap();
    assert_eq!(repairs.restored, vec![script.clone()]);
    assert_eq!(std::fs::read(&script).unwrap(), tracked);
    assert!(verify_directory(&ws.etmas, &store).unwrap().is_clean());

    let aside = std::fs::read_dir(script.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().ends_with(".corrupted.bak"));
    assert!(aside);
}

#[test]
fn test_deleted_script_is_restored() {
    let ws = workspace();
    let script = ws.etmas.join("E225").join("A1234567.fhi");
    let mut store = IntegrityStore::open(&ws.store_root).unwrap();
    import_directory(&ws.etmas, &mut store).unwrap();

    std::fs::remove_file(&script).unwrap();

    let report = verify_directory(&ws.etmas, &store).unwrap();
    assert_eq!(report.corrupted.len(), 1);
    let repairs =
        repair_corrupted(&report.corrupted, &mut store, &SafeFileService::new(None)).unwrap();
    assert_eq!(repairs.restored.len(), 1);
    assert!(script.exists());
}

#[test]
fn test_failed_save_leaves_nothing_behind() {
    let ws = workspace();
    let store = IntegrityStore::open(&ws.store_root).unwrap();
    let mut protocol = FormalSaveProtocol::new(SafeFileService::new(None), store);
    let target = ws.etmas.join("no-such-folder").join("new.fhi");

    let err = protocol
        .execute_save(&target, SCRIPT, TextEncoding::Latin1)
        .unwrap_err();

    assert!(matches!(err, EtmaError::SaveError { .. }));
    assert_eq!(err.severity(), ErrorSeverity::Critical);
    assert!(!target.exists());
    assert!(protocol.store().expected_hash(&target).is_none());

    let history = protocol.store().history(&target).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation, "ROLLBACK");
}

#[test]
fn test_store_survives_reopen() {
    let ws = workspace();
    let script = ws.etmas.join("E225").join("A1234567.fhi");
    {
        let mut store = IntegrityStore::open(&ws.store_root).unwrap();
        import_directory(&ws.etmas, &mut store).unwrap();
    }

    let mut store = IntegrityStore::open(&ws.store_root).unwrap();
    assert_eq!(store.tracked_count(), 1);
    assert!(store.verify(&script).is_valid());
    let again = import_directory(&ws.etmas, &mut store).unwrap();
    assert_eq!(again.skipped.len(), 1);
    assert!(again.imported.is_empty());
}
