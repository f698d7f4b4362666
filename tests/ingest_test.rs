use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use meeting_pool::config::AccountConfig;
use meeting_pool::db::{create_test_db, Db};
use meeting_pool::ingest::{load_recording, IngestPipeline, RecordingStatus};
use meeting_pool::pool::AccountPool;
use meeting_pool::provider::{MeetingInfo, MeetingProvider, ProviderError, RecordingPart};
use meeting_pool::queries::lessons;
use meeting_pool::storage::{StorageClient, StorageError, StorageRef};

/// Provider stub serving canned part payloads, with switchable failures
#[derive(Default)]
struct StubProvider {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    download_error: Mutex<Option<ProviderError>>,
    download_calls: AtomicUsize,
    deleted_recordings: AtomicUsize,
    saw_secret: Mutex<Option<String>>,
}

impl StubProvider {
    fn set_payload(&self, part_id: &str, payload: Vec<u8>) {
        self.payloads
            .lock()
            .unwrap()
            .insert(part_id.to_string(), payload);
    }

    fn set_download_error(&self, error: Option<ProviderError>) {
        *self.download_error.lock().unwrap() = error;
    }
}

impl MeetingProvider for StubProvider {
    fn create_meeting(
        &self,
        _topic: &str,
        _start_ms: i64,
        _duration_mins: i64,
    ) -> Result<MeetingInfo, ProviderError> {
        Err(ProviderError::Permanent("not used here".to_string()))
    }

    fn delete_meeting(&self, _meeting_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn list_recording_parts(
        &self,
        _meeting_id: &str,
        _from_ms: i64,
        _to_ms: i64,
    ) -> Result<Vec<RecordingPart>, ProviderError> {
        Ok(Vec::new())
    }

    fn download_part(
        &self,
        part: &RecordingPart,
        access_secret: Option<&str>,
    ) -> Result<Vec<u8>, ProviderError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.download_error.lock().unwrap().as_ref() {
            return Err(error.clone());
        }
        *self.saw_secret.lock().unwrap() = access_secret.map(|s| s.to_string());
        self.payloads
            .lock()
            .unwrap()
            .get(&part.id)
            .cloned()
            .ok_or_else(|| ProviderError::Permanent(format!("unknown part {}", part.id)))
    }

    fn delete_recording(&self, _meeting_id: &str) -> Result<(), ProviderError> {
        self.deleted_recordings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory storage with switchable existence-check failure
#[derive(Default)]
struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: AtomicUsize,
    fail_exists: AtomicBool,
}

impl MemoryStorage {
    fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

impl StorageClient for MemoryStorage {
    fn upload(
        &self,
        reader: &mut dyn Read,
        name: &str,
        folder: &str,
        size: u64,
    ) -> Result<StorageRef, StorageError> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        assert_eq!(data.len() as u64, size);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}/{}", folder, name);
        self.objects.lock().unwrap().insert(key.clone(), data);
        Ok(StorageRef(key))
    }

    fn exists(&self, storage_ref: &StorageRef) -> Result<Option<u64>, StorageError> {
        if self.fail_exists.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&storage_ref.0)
            .map(|data| data.len() as u64))
    }

    fn delete(&self, storage_ref: &StorageRef) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(&storage_ref.0);
        Ok(())
    }
}

struct Fixture {
    db: Arc<Db>,
    provider: Arc<StubProvider>,
    storage: Arc<MemoryStorage>,
    pipeline: IngestPipeline,
    _guard: tempfile::TempDir,
}

/// Database with one live lesson "l1" on meeting "m1"
fn setup(max_attempts: u32) -> Fixture {
    let (db, guard) = create_test_db().unwrap();
    let db = Arc::new(db);

    let pool = AccountPool::new(db.clone());
    pool.import_accounts(&[AccountConfig {
        id: "acc-a".to_string(),
        max_concurrent: 5,
        active: None,
    }])
    .unwrap();

    let now = chrono::Utc::now().timestamp_millis();
    db.execute(&lessons::insert_or_ignore("l1", now - 3_600_000, now))
        .unwrap();
    db.execute(&lessons::mark_live(
        "l1",
        "m1",
        "https://meet.example.com/j/m1",
        "https://meet.example.com/s/m1",
        Some("pwd123"),
    ))
    .unwrap();

    let provider = Arc::new(StubProvider::default());
    let storage = Arc::new(MemoryStorage::default());
    let pipeline = IngestPipeline::new(
        db.clone(),
        provider.clone(),
        storage.clone(),
        max_attempts,
    );

    Fixture {
        db,
        provider,
        storage,
        pipeline,
        _guard: guard,
    }
}

fn part(id: &str, start_ms: i64, byte_size: u64) -> RecordingPart {
    RecordingPart {
        id: id.to_string(),
        start_timestamp_ms: start_ms,
        end_timestamp_ms: start_ms + 600_000,
        byte_size,
        download_url: format!("https://media.example.com/parts/{}", id),
    }
}

fn payload(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}

/// Bring a parked recording's retry time into the past
fn make_due(db: &Db, recording_id: &str) {
    db.execute(&format!(
        "UPDATE recordings SET next_attempt_at_ms = 0 WHERE id = '{}'",
        recording_id
    ))
    .unwrap();
}

/// Step until the recording parks: terminal state, or no forward progress
fn drive(pipeline: &IngestPipeline, recording_id: &str) -> RecordingStatus {
    let mut previous = None;
    loop {
        let status = pipeline.step(recording_id).unwrap();
        if status.is_terminal() || previous == Some(status) {
            return status;
        }
        previous = Some(status);
    }
}

#[test]
fn test_parts_merge_in_timestamp_order_regardless_of_arrival() {
    let f = setup(5);
    f.provider.set_payload("p1", payload(b'a', 2048));
    f.provider.set_payload("p2", payload(b'b', 2048));
    f.provider.set_payload("p3", payload(b'c', 2048));

    // Webhook reports parts out of order
    let recording_id = f
        .pipeline
        .register_finished_recording(
            "m1",
            &[part("p2", 2_000, 2048), part("p3", 3_000, 2048), part("p1", 1_000, 2048)],
        )
        .unwrap()
        .unwrap();

    let status = drive(&f.pipeline, &recording_id);
    assert_eq!(status, RecordingStatus::Ready);

    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    let object = f.storage.object(recording.storage_ref.as_deref().unwrap()).unwrap();

    let mut expected = payload(b'a', 2048);
    expected.extend(payload(b'b', 2048));
    expected.extend(payload(b'c', 2048));
    assert_eq!(object, expected, "artifact must follow start timestamps");
    assert_eq!(recording.total_bytes, 3 * 2048);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&expected);
    assert_eq!(recording.crc32, Some(hasher.finalize() as i64));

    // Provider copy removed exactly once, download blobs cleared
    assert_eq!(f.provider.deleted_recordings.load(Ordering::SeqCst), 1);
    assert_eq!(
        f.provider.saw_secret.lock().unwrap().as_deref(),
        Some("pwd123")
    );
}

#[test]
fn test_no_provider_delete_without_existence_confirmation() {
    let f = setup(5);
    f.provider.set_payload("p1", payload(b'x', 4096));
    f.storage.fail_exists.store(true, Ordering::SeqCst);

    let recording_id = f
        .pipeline
        .register_finished_recording("m1", &[part("p1", 1_000, 4096)])
        .unwrap()
        .unwrap();

    let status = drive(&f.pipeline, &recording_id);
    // Upload itself succeeded, but the confirmation failed
    assert_eq!(status, RecordingStatus::Uploading);
    assert_eq!(f.storage.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(f.provider.deleted_recordings.load(Ordering::SeqCst), 0);

    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    assert!(recording.attempts > 0, "failed confirmation must count as an attempt");

    // Once confirmation works the retry finishes without re-uploading
    f.storage.fail_exists.store(false, Ordering::SeqCst);
    make_due(&f.db, &recording_id);
    let status = drive(&f.pipeline, &recording_id);
    assert_eq!(status, RecordingStatus::Ready);
    assert_eq!(f.storage.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(f.provider.deleted_recordings.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transient_failures_exhaust_attempt_budget() {
    let f = setup(3);
    f.provider
        .set_download_error(Some(ProviderError::transient("provider melting")));

    let recording_id = f
        .pipeline
        .register_finished_recording("m1", &[part("p1", 1_000, 2048)])
        .unwrap()
        .unwrap();

    let mut status = f.pipeline.step(&recording_id).unwrap();
    assert_eq!(status, RecordingStatus::Downloading);
    for _ in 0..3 {
        if status == RecordingStatus::Failed {
            break;
        }
        make_due(&f.db, &recording_id);
        status = f.pipeline.step(&recording_id).unwrap();
    }
    assert_eq!(status, RecordingStatus::Failed);

    // Nothing was deleted or uploaded on the failure path
    assert_eq!(f.provider.deleted_recordings.load(Ordering::SeqCst), 0);
    assert_eq!(f.storage.uploads.load(Ordering::SeqCst), 0);

    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    assert_eq!(recording.status, RecordingStatus::Failed);
}

#[test]
fn test_step_before_retry_time_does_no_work() {
    let f = setup(5);
    f.provider
        .set_download_error(Some(ProviderError::transient("provider melting")));

    let recording_id = f
        .pipeline
        .register_finished_recording("m1", &[part("p1", 1_000, 2048)])
        .unwrap()
        .unwrap();

    assert_eq!(
        f.pipeline.step(&recording_id).unwrap(),
        RecordingStatus::Downloading
    );
    // First download attempt fails and schedules the retry
    assert_eq!(
        f.pipeline.step(&recording_id).unwrap(),
        RecordingStatus::Downloading
    );
    assert_eq!(f.provider.download_calls.load(Ordering::SeqCst), 1);
    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    assert_eq!(recording.attempts, 1);
    assert!(recording.next_attempt_at_ms > chrono::Utc::now().timestamp_millis());

    // Stepping again before the retry time must neither hit the provider
    // nor burn another attempt
    assert_eq!(
        f.pipeline.step(&recording_id).unwrap(),
        RecordingStatus::Downloading
    );
    assert_eq!(f.provider.download_calls.load(Ordering::SeqCst), 1);
    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    assert_eq!(recording.attempts, 1);

    // Once due, the retry goes back out
    make_due(&f.db, &recording_id);
    f.pipeline.step(&recording_id).unwrap();
    assert_eq!(f.provider.download_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_permanent_error_fails_without_retry() {
    let f = setup(5);
    f.provider.set_download_error(Some(ProviderError::Permanent(
        "part expired".to_string(),
    )));

    let recording_id = f
        .pipeline
        .register_finished_recording("m1", &[part("p1", 1_000, 2048)])
        .unwrap()
        .unwrap();

    let status = drive(&f.pipeline, &recording_id);
    assert_eq!(status, RecordingStatus::Failed);

    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    assert_eq!(recording.attempts, 0, "permanent errors skip the retry budget");
    assert_eq!(f.provider.deleted_recordings.load(Ordering::SeqCst), 0);
}

#[test]
fn test_truncated_part_is_transient() {
    let f = setup(5);
    // Provider reports 4096 bytes but serves less
    f.provider.set_payload("p1", payload(b'x', 1500));

    let recording_id = f
        .pipeline
        .register_finished_recording("m1", &[part("p1", 1_000, 4096)])
        .unwrap()
        .unwrap();

    let status = drive(&f.pipeline, &recording_id);
    assert_eq!(status, RecordingStatus::Downloading);
    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    assert!(recording.attempts > 0);

    // The full part arriving later lets the retry complete
    f.provider.set_payload("p1", payload(b'x', 4096));
    make_due(&f.db, &recording_id);
    let status = drive(&f.pipeline, &recording_id);
    assert_eq!(status, RecordingStatus::Ready);
}

#[test]
fn test_reprocess_requeues_failed_recording() {
    let f = setup(2);
    f.provider
        .set_download_error(Some(ProviderError::transient("provider down")));

    let recording_id = f
        .pipeline
        .register_finished_recording("m1", &[part("p1", 1_000, 2048)])
        .unwrap()
        .unwrap();
    let mut status = f.pipeline.step(&recording_id).unwrap();
    for _ in 0..4 {
        if status == RecordingStatus::Failed {
            break;
        }
        make_due(&f.db, &recording_id);
        status = f.pipeline.step(&recording_id).unwrap();
    }
    assert_eq!(status, RecordingStatus::Failed);

    // Reprocess only applies to failed recordings
    assert!(f.pipeline.reprocess(&recording_id).unwrap());
    assert!(!f.pipeline.reprocess(&recording_id).unwrap());

    let recording = load_recording(&f.db, &recording_id).unwrap().unwrap();
    assert_eq!(recording.status, RecordingStatus::Pending);
    assert_eq!(recording.attempts, 0);

    f.provider.set_download_error(None);
    f.provider.set_payload("p1", payload(b'x', 2048));
    let status = drive(&f.pipeline, &recording_id);
    assert_eq!(status, RecordingStatus::Ready);
}

#[test]
fn test_duplicate_webhook_deliveries_collapse() {
    let f = setup(5);
    f.provider.set_payload("p1", payload(b'x', 2048));

    let parts = [part("p1", 1_000, 2048)];
    let first = f
        .pipeline
        .register_finished_recording("m1", &parts)
        .unwrap()
        .unwrap();
    let second = f
        .pipeline
        .register_finished_recording("m1", &parts)
        .unwrap()
        .unwrap();
    assert_eq!(first, second);

    let count: i64 = f
        .db
        .query_one_optional("SELECT COUNT(*) FROM recording_parts")
        .unwrap()
        .unwrap();
    assert_eq!(count, 1, "redelivered parts must not duplicate");

    assert_eq!(drive(&f.pipeline, &first), RecordingStatus::Ready);
}

#[test]
fn test_unknown_meeting_webhook_ignored() {
    let f = setup(5);
    let result = f
        .pipeline
        .register_finished_recording("no-such-meeting", &[part("p1", 1_000, 2048)])
        .unwrap();
    assert!(result.is_none());
}
