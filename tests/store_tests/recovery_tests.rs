//! Recovery tests for the Store
//!
//! These tests verify:
//! - Flushed data survives a restart, unflushed data does not
//! - Deleted records stay deleted across restarts
//! - Power loss during a flush falls back to the previous generation
//! - Corrupt slots are skipped
//! - Image files on disk work end to end

use nvkv::device::{FailingDevice, FailurePolicy, FileFlash, Geometry, RamFlash};
use nvkv::journal::{JournalError, SequentialJournal};
use nvkv::{Access, Config, KeyDesc, NvkvError, Progress, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn geometry() -> Geometry {
    Geometry::new(64 * 1024, 8, 1024)
}

fn open_store<D: nvkv::device::BlockDevice>(device: D) -> Store<SequentialJournal<D>> {
    let store = Store::open_device(Config::default(), device).unwrap();
    assert_eq!(store.initialize().unwrap(), Progress::Done);
    store
}

/// Throw away all in-memory state and come back up on the same device
fn restart(store: Store<SequentialJournal<RamFlash>>) -> Store<SequentialJournal<RamFlash>> {
    open_store(store.into_journal().into_device())
}

fn put<J: nvkv::journal::Journal>(store: &Store<J>, key: &str, value: &[u8]) {
    let handle = match store.create(key, value.len(), Some(&KeyDesc::default())) {
        Err(NvkvError::PreexistingKey) => store.create(key, value.len(), None).unwrap(),
        other => other.unwrap(),
    };
    store.write(&handle, value).unwrap();
    store.close(handle).unwrap();
}

fn get<J: nvkv::journal::Journal>(store: &Store<J>, key: &str) -> nvkv::Result<Vec<u8>> {
    let handle = store.open(key, Access::READ)?;
    let mut value = vec![0u8; store.value_len(&handle)?];
    store.read(&handle, &mut value)?;
    store.close(handle)?;
    Ok(value)
}

fn delete<J: nvkv::journal::Journal>(store: &Store<J>, key: &str) {
    let handle = store.open(key, Access::READ_WRITE).unwrap();
    store.delete(&handle).unwrap();
    store.close(handle).unwrap();
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_flush_survives_restart() {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "a", b"X");
    store.flush().unwrap();

    let store = restart(store);
    assert_eq!(get(&store, "a").unwrap(), b"X".to_vec());
    store.verify_integrity().unwrap();
}

#[test]
fn test_delete_survives_restart() {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "a", b"X");
    store.flush().unwrap();

    let store = restart(store);
    delete(&store, "a");
    store.flush().unwrap();

    let store = restart(store);
    assert_eq!(get(&store, "a").unwrap_err(), NvkvError::KeyNotFound);
    assert_eq!(store.find("*", None).unwrap_err(), NvkvError::KeyNotFound);
}

#[test]
fn test_unflushed_changes_lost() {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "kept", b"1");
    store.flush().unwrap();
    put(&store, "lost", b"2");

    let store = restart(store);
    assert_eq!(get(&store, "kept").unwrap(), b"1".to_vec());
    assert_eq!(get(&store, "lost").unwrap_err(), NvkvError::KeyNotFound);
}

#[test]
fn test_deleting_record_dropped_on_load() {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "doomed", b"bye");
    put(&store, "other", b"stay");

    // Flushed while still pinned by an open handle
    let pin = store.open("doomed", Access::READ_WRITE).unwrap();
    store.delete(&pin).unwrap();
    store.flush().unwrap();
    store.close(pin).unwrap();
    assert_eq!(store.status().records, 1);

    let store = restart(store);
    assert_eq!(store.status().records, 1);
    assert_eq!(get(&store, "doomed").unwrap_err(), NvkvError::KeyNotFound);
    assert_eq!(get(&store, "other").unwrap(), b"stay".to_vec());
}

#[test]
fn test_many_generations_rotate() {
    let store = open_store(RamFlash::new(geometry()));
    for round in 0..10u32 {
        put(&store, "counter", &round.to_le_bytes());
        put(&store, &format!("round.{round}"), b"r");
        store.flush().unwrap();
    }

    let store = restart(store);
    assert_eq!(get(&store, "counter").unwrap(), 9u32.to_le_bytes().to_vec());
    assert_eq!(store.status().records, 11);
}

#[test]
fn test_clean_flush_writes_nothing() {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "a", b"1");
    store.flush().unwrap();

    let before = store.into_journal();
    let programs = before.device().program_count();
    let store = open_store(before.into_device());
    store.flush().unwrap();
    assert_eq!(store.into_journal().device().program_count(), programs);
}

#[test]
fn test_oversized_image_rejected() {
    let small = RamFlash::new(Geometry::new(8 * 1024, 8, 1024));
    let store = open_store(small);
    put(&store, "huge", &vec![1u8; 4000]);

    let err = store.flush().unwrap_err();
    assert!(matches!(
        err,
        NvkvError::Storage(JournalError::BlobTooLarge { .. })
    ));
    assert!(store.status().dirty);
}

#[test]
fn test_reset_persists() {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "a", b"1");
    store.flush().unwrap();
    store.reset().unwrap();

    let store = restart(store);
    assert_eq!(store.status().records, 0);
}

// =============================================================================
// Power Loss Tests
// =============================================================================

/// One committed generation holding a="X"
fn committed_device() -> RamFlash {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "a", b"X");
    store.flush().unwrap();
    store.into_journal().into_device()
}

fn flush_with_failure(policy: FailurePolicy) -> RamFlash {
    let store = open_store(FailingDevice::new(committed_device(), policy));
    put(&store, "a", b"Y");
    put(&store, "b", b"new");

    let err = store.flush().unwrap_err();
    assert!(matches!(err, NvkvError::Storage(JournalError::Device(_))));
    assert!(store.status().dirty);

    store.into_journal().into_device().into_inner()
}

#[test]
fn test_power_loss_before_commit() {
    // Slot head and body land, the tail never does
    let device = flush_with_failure(FailurePolicy::PowerLossAfterPrograms(2));

    let store = open_store(device);
    assert_eq!(get(&store, "a").unwrap(), b"X".to_vec());
    assert_eq!(get(&store, "b").unwrap_err(), NvkvError::KeyNotFound);
}

#[test]
fn test_torn_commit() {
    let device = flush_with_failure(FailurePolicy::TornProgramAfter(2));

    let store = open_store(device);
    assert_eq!(get(&store, "a").unwrap(), b"X".to_vec());
}

#[test]
fn test_power_loss_opening_slot() {
    let device = flush_with_failure(FailurePolicy::PowerLossAfterPrograms(0));

    let store = open_store(device);
    assert_eq!(get(&store, "a").unwrap(), b"X".to_vec());
}

#[test]
fn test_recovered_store_keeps_committing() {
    let device = flush_with_failure(FailurePolicy::PowerLossAfterPrograms(2));

    let store = open_store(device);
    put(&store, "a", b"Z");
    store.flush().unwrap();

    let store = restart(store);
    assert_eq!(get(&store, "a").unwrap(), b"Z".to_vec());
}

#[test]
fn test_corrupt_newest_slot_skipped() {
    let store = open_store(RamFlash::new(geometry()));
    put(&store, "v", b"1");
    store.flush().unwrap();
    put(&store, "v", b"2");
    store.flush().unwrap();

    let journal = store.into_journal();
    let body = journal.layout().unwrap().body_addr(1) as usize;
    let mut device = journal.into_device();
    device.contents_mut()[body + 9] ^= 0xFF;

    let store = open_store(device);
    assert_eq!(get(&store, "v").unwrap(), b"1".to_vec());
}

// =============================================================================
// Image File Tests
// =============================================================================

#[test]
fn test_file_image_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.img");

    {
        let store = open_store(FileFlash::create(&path, geometry()).unwrap());
        put(&store, "file.key", b"on disk");
        store.flush().unwrap();
    }

    let store = open_store(FileFlash::open(&path).unwrap());
    assert_eq!(get(&store, "file.key").unwrap(), b"on disk".to_vec());
}

#[test]
fn test_blank_device_without_auto_format() {
    let config = Config::builder().auto_format(false).build();
    let store = Store::open_device(config, RamFlash::new(geometry())).unwrap();
    assert_eq!(store.initialize().unwrap_err(), NvkvError::NotFormatted);
    assert_eq!(
        store.open("a", Access::READ).unwrap_err(),
        NvkvError::NotInitialized
    );
}
