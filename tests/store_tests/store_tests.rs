//! Tests for the Store
//!
//! These tests verify:
//! - Create/open/read/write/close on records
//! - Grow and shrink of a value through a second create
//! - Deferred removal of deleted records
//! - Wildcard find with permission filtering
//! - Handle validity after records move
//! - Lifecycle errors (not initialized, handles open)
//! - Arena integrity under random operation sequences

use nvkv::acl::NamespaceOwner;
use nvkv::device::{Geometry, RamFlash};
use nvkv::journal::SequentialJournal;
use nvkv::{
    Access, Config, FlushState, Handle, KeyDesc, NvkvError, Permissions, Progress, Store,
};
use proptest::prelude::*;

// =============================================================================
// Helper Functions
// =============================================================================

type RamStore = Store<SequentialJournal<RamFlash>>;

fn flash() -> RamFlash {
    RamFlash::new(Geometry::new(64 * 1024, 8, 1024))
}

fn setup_store() -> RamStore {
    setup_store_with(Config::default())
}

fn setup_store_with(config: Config) -> RamStore {
    let store = Store::open_device(config, flash()).unwrap();
    assert_eq!(store.initialize().unwrap(), Progress::Done);
    store
}

fn put(store: &RamStore, key: &str, value: &[u8]) {
    let handle = store
        .create(key, value.len(), Some(&KeyDesc::default()))
        .unwrap();
    assert_eq!(store.write(&handle, value).unwrap(), value.len());
    store.close(handle).unwrap();
}

fn read_all(store: &RamStore, handle: &Handle) -> Vec<u8> {
    let mut buf = vec![0u8; store.value_len(handle).unwrap()];
    let n = store.read(handle, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

fn get(store: &RamStore, key: &str) -> Vec<u8> {
    let handle = store.open(key, Access::READ).unwrap();
    let value = read_all(store, &handle);
    store.close(handle).unwrap();
    value
}

fn find_all(store: &RamStore, query: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut previous = None;
    loop {
        match store.find(query, previous) {
            Ok(handle) => {
                names.push(store.key_name(&handle).unwrap());
                previous = Some(handle);
            }
            Err(NvkvError::KeyNotFound) => return names,
            Err(e) => panic!("find failed: {e}"),
        }
    }
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_create_write_read() {
    let store = setup_store();
    put(&store, "app.greeting", b"hello");

    assert_eq!(get(&store, "app.greeting"), b"hello".to_vec());
    assert_eq!(store.status().records, 1);
    store.verify_integrity().unwrap();
}

#[test]
fn test_new_value_is_zero_filled() {
    let store = setup_store();
    let handle = store.create("zeros", 4, Some(&KeyDesc::default())).unwrap();
    assert_eq!(read_all(&store, &handle), vec![0u8; 4]);
    store.close(handle).unwrap();
}

#[test]
fn test_duplicate_create_rejected() {
    let store = setup_store();
    put(&store, "dup", b"1");

    let err = store.create("dup", 1, Some(&KeyDesc::default())).unwrap_err();
    assert_eq!(err, NvkvError::PreexistingKey);
}

#[test]
fn test_open_missing_key() {
    let store = setup_store();
    assert_eq!(
        store.open("missing", Access::READ).unwrap_err(),
        NvkvError::KeyNotFound
    );
}

#[test]
fn test_invalid_key_names() {
    let store = setup_store();
    for key in ["", ".leading", "sp ace", "star*", "a{b{c}}"] {
        let err = store.create(key, 1, Some(&KeyDesc::default())).unwrap_err();
        assert!(
            matches!(err, NvkvError::InvalidKeyName(_)),
            "{key:?} gave {err:?}"
        );
    }
}

#[test]
fn test_value_too_large() {
    let config = Config::builder().max_value_len(16).build();
    let store = setup_store_with(config);
    assert_eq!(
        store.create("big", 17, Some(&KeyDesc::default())).unwrap_err(),
        NvkvError::ValueTooLarge { len: 17, max: 16 }
    );
}

#[test]
fn test_arena_limit_reports_out_of_memory() {
    let config = Config::builder().arena_limit(64).build();
    let store = setup_store_with(config);
    put(&store, "a", &[1u8; 20]);

    let err = store.create("b", 40, Some(&KeyDesc::default())).unwrap_err();
    assert!(matches!(err, NvkvError::OutOfMemory { .. }));
    assert_eq!(store.status().records, 1);
}

// =============================================================================
// Cursor Tests
// =============================================================================

#[test]
fn test_partial_reads_advance_cursor() {
    let store = setup_store();
    put(&store, "stream", b"abcdef");

    let handle = store.open("stream", Access::READ).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(store.read(&handle, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    assert_eq!(store.read(&handle, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"ef");
    assert_eq!(store.read(&handle, &mut buf).unwrap(), 0);

    store.rseek(&handle, 1).unwrap();
    assert_eq!(store.read(&handle, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"bcde");

    assert_eq!(
        store.rseek(&handle, 7).unwrap_err(),
        NvkvError::InvalidSeek { offset: 7, len: 6 }
    );
    store.close(handle).unwrap();
}

#[test]
fn test_write_truncates_at_value_end() {
    let store = setup_store();
    let handle = store.create("short", 3, Some(&KeyDesc::default())).unwrap();
    assert_eq!(store.write(&handle, b"abcdef").unwrap(), 3);
    assert_eq!(store.write(&handle, b"x").unwrap(), 0);
    store.close(handle).unwrap();

    assert_eq!(get(&store, "short"), b"abc".to_vec());
}

#[test]
fn test_access_mode_enforced() {
    let store = setup_store();
    put(&store, "ro", b"data");

    let handle = store.open("ro", Access::READ).unwrap();
    assert_eq!(
        store.write(&handle, b"x").unwrap_err(),
        NvkvError::PermissionDenied(Access::WRITE)
    );
    assert_eq!(
        store.delete(&handle).unwrap_err(),
        NvkvError::PermissionDenied(Access::WRITE)
    );
    store.close(handle).unwrap();

    let wo = store.open("ro", Access::WRITE).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(
        store.read(&wo, &mut buf).unwrap_err(),
        NvkvError::PermissionDenied(Access::READ)
    );
    store.close(wo).unwrap();
}

// =============================================================================
// Grow / Shrink Tests
// =============================================================================

#[test]
fn test_create_without_desc_resizes() {
    let store = setup_store();
    put(&store, "a", b"data");

    let handle = store.create("a", 2, None).unwrap();
    assert_eq!(store.write(&handle, b"ok").unwrap(), 2);
    store.close(handle).unwrap();

    let handle = store.open("a", Access::READ).unwrap();
    assert_eq!(store.value_len(&handle).unwrap(), 2);
    assert_eq!(read_all(&store, &handle), b"ok".to_vec());
    store.close(handle).unwrap();
}

#[test]
fn test_resize_missing_key() {
    let store = setup_store();
    assert_eq!(store.create("nope", 4, None).unwrap_err(), NvkvError::KeyNotFound);
}

#[test]
fn test_grow_keeps_following_handles_valid() {
    let store = setup_store();
    put(&store, "first", b"1234");
    put(&store, "second", b"tail");

    let second = store.open("second", Access::READ).unwrap();
    let first = store.open("first", Access::READ_WRITE).unwrap();

    let grown = store.create("first", 12, None).unwrap();
    store.verify_integrity().unwrap();
    assert_eq!(read_all(&store, &second), b"tail".to_vec());
    assert_eq!(store.key_name(&second).unwrap(), "second");

    let shrunk = store.create("first", 2, None).unwrap();
    store.verify_integrity().unwrap();
    assert_eq!(read_all(&store, &first), b"12".to_vec());
    assert_eq!(store.value_len(&grown).unwrap(), 2);

    for handle in [first, second, grown, shrunk] {
        store.close(handle).unwrap();
    }
    store.verify_integrity().unwrap();
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_waits_for_last_close() {
    let store = setup_store();
    put(&store, "a", b"X");

    let h1 = store.open("a", Access::READ_WRITE).unwrap();
    let h2 = store.open("a", Access::READ).unwrap();

    store.delete(&h1).unwrap();
    store.close(h1).unwrap();

    // Still physically present while h2 is open, but hidden from lookups
    assert_eq!(store.status().records, 1);
    assert_eq!(read_all(&store, &h2), b"X".to_vec());
    assert_eq!(store.open("a", Access::READ).unwrap_err(), NvkvError::KeyNotFound);
    assert_eq!(
        store.create("a", 1, Some(&KeyDesc::default())).unwrap_err(),
        NvkvError::PreexistingKeyDeleting
    );

    store.close(h2).unwrap();
    assert_eq!(store.status().records, 0);
    assert_eq!(store.status().arena_len, 0);

    // The name is free again
    put(&store, "a", b"Y");
    assert_eq!(get(&store, "a"), b"Y".to_vec());
}

#[test]
fn test_delete_middle_record_rebases_handles() {
    let store = setup_store();
    put(&store, "one", b"1");
    put(&store, "two", b"22");
    put(&store, "three", b"333");

    let three = store.open("three", Access::READ).unwrap();
    let two = store.open("two", Access::READ_WRITE).unwrap();
    store.delete(&two).unwrap();
    store.close(two).unwrap();

    store.verify_integrity().unwrap();
    assert_eq!(store.key_name(&three).unwrap(), "three");
    assert_eq!(read_all(&store, &three), b"333".to_vec());
    store.close(three).unwrap();
}

#[test]
fn test_closed_handle_is_invalid() {
    let store = setup_store();
    put(&store, "k", b"v");

    let handle = store.open("k", Access::READ).unwrap();
    let other = store.open("k", Access::READ).unwrap();
    store.close(other).unwrap();

    assert_eq!(store.value_len(&handle).unwrap(), 1);
    store.close(handle).unwrap();
    assert_eq!(store.status().open_handles, 0);
}

// =============================================================================
// Find Tests
// =============================================================================

#[test]
fn test_find_iterates_matches_in_order() {
    let store = setup_store();
    for key in ["net.ip", "net.mask", "sys.name", "net.gw"] {
        put(&store, key, b"v");
    }

    assert_eq!(find_all(&store, "net.*"), vec!["net.ip", "net.mask", "net.gw"]);
    assert_eq!(find_all(&store, "*.name"), vec!["sys.name"]);
    assert_eq!(find_all(&store, "*").len(), 4);
    assert!(find_all(&store, "usr.*").is_empty());
    assert_eq!(store.status().open_handles, 0);
}

#[test]
fn test_find_skips_deleting_records() {
    let store = setup_store();
    put(&store, "k.a", b"1");
    put(&store, "k.b", b"2");

    let pin = store.open("k.a", Access::READ_WRITE).unwrap();
    store.delete(&pin).unwrap();
    assert_eq!(find_all(&store, "k.*"), vec!["k.b"]);
    store.close(pin).unwrap();
}

#[test]
fn test_find_survives_removal_of_previous() {
    let store = setup_store();
    put(&store, "q.1", b"1");
    put(&store, "q.2", b"2");
    put(&store, "q.3", b"3");

    let writer = store.open("q.2", Access::READ_WRITE).unwrap();
    let h = store.find("q.*", None).unwrap();
    let h = store.find("q.*", Some(h)).unwrap();
    assert_eq!(store.key_name(&h).unwrap(), "q.2");

    // Closing the last handle of a deleting record inside find removes it
    store.delete(&writer).unwrap();
    store.close(writer).unwrap();
    let h = store.find("q.*", Some(h)).unwrap();
    assert_eq!(store.key_name(&h).unwrap(), "q.3");
    assert_eq!(store.status().records, 2);

    assert_eq!(store.find("q.*", Some(h)).unwrap_err(), NvkvError::KeyNotFound);
    assert_eq!(store.status().open_handles, 0);
}

#[test]
fn test_find_respects_permissions() {
    let config = Config::default();
    let store = Store::open_device(config, flash())
        .unwrap()
        .with_authorizer(NamespaceOwner::new(["mine"]));
    store.initialize().unwrap();

    let private = KeyDesc::new(Permissions::OWNER_RW);
    let public = KeyDesc::new(Permissions::new(Access::READ_WRITE, Access::READ));
    for (key, desc) in [
        ("mine.a", &private),
        ("theirs.secret", &private),
        ("theirs.shared", &public),
    ] {
        let handle = store.create(key, 1, Some(desc)).unwrap();
        store.close(handle).unwrap();
    }

    let mut visible = Vec::new();
    let mut previous = None;
    while let Ok(handle) = store.find("*", previous) {
        visible.push(store.key_name(&handle).unwrap());
        previous = Some(handle);
    }
    assert_eq!(visible, vec!["mine.a", "theirs.shared"]);

    assert_eq!(
        store.open("theirs.secret", Access::READ).unwrap_err(),
        NvkvError::PermissionDenied(Access::READ)
    );
    assert_eq!(
        store.open("theirs.shared", Access::READ_WRITE).unwrap_err(),
        NvkvError::PermissionDenied(Access::WRITE)
    );
    assert_eq!(
        store.create("theirs.shared", 4, None).unwrap_err(),
        NvkvError::PermissionDenied(Access::WRITE)
    );
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_operations_before_initialize() {
    let store: RamStore = Store::open_device(Config::default(), flash()).unwrap();
    assert_eq!(store.status().state, FlushState::Stopped);
    assert_eq!(
        store.create("a", 1, Some(&KeyDesc::default())).unwrap_err(),
        NvkvError::NotInitialized
    );
    assert_eq!(store.open("a", Access::READ).unwrap_err(), NvkvError::NotInitialized);
    assert_eq!(store.flush().unwrap_err(), NvkvError::NotInitialized);
}

#[test]
fn test_initialize_is_idempotent() {
    let store = setup_store();
    put(&store, "keep", b"me");
    assert_eq!(store.initialize().unwrap(), Progress::Done);
    assert_eq!(get(&store, "keep"), b"me".to_vec());
}

#[test]
fn test_uninitialize_requires_closed_handles() {
    let store = setup_store();
    put(&store, "k", b"v");
    let handle = store.open("k", Access::READ).unwrap();

    assert_eq!(store.uninitialize().unwrap_err(), NvkvError::HandlesOpen(1));
    store.close(handle).unwrap();

    store.uninitialize().unwrap();
    assert_eq!(store.status().state, FlushState::Stopped);
    assert_eq!(store.status().arena_len, 0);
}

#[test]
fn test_reset_empties_store() {
    let store = setup_store();
    put(&store, "k", b"v");
    store.flush().unwrap();

    let handle = store.open("k", Access::READ).unwrap();
    assert_eq!(store.reset().unwrap_err(), NvkvError::HandlesOpen(1));
    store.close(handle).unwrap();

    assert_eq!(store.reset().unwrap(), Progress::Done);
    assert_eq!(store.status().records, 0);
    assert!(!store.status().dirty);
}

#[test]
fn test_flush_clears_dirty() {
    let store = setup_store();
    assert!(!store.status().dirty);
    put(&store, "k", b"v");
    assert!(store.status().dirty);

    assert_eq!(store.flush().unwrap(), Progress::Done);
    assert!(!store.status().dirty);

    let caps = store.capabilities();
    assert!(!caps.asynchronous);
    assert_eq!(caps.program_unit, 8);
    assert!(caps.max_image_size > 0);
}

// =============================================================================
// Property Tests
// =============================================================================

#[derive(Debug, Clone)]
enum Action {
    Create(u8, u16),
    Resize(u8, u16),
    Open(u8),
    Delete(usize),
    Close(usize),
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u8..6, 0u16..48).prop_map(|(k, n)| Action::Create(k, n)),
        (0u8..6, 0u16..48).prop_map(|(k, n)| Action::Resize(k, n)),
        (0u8..6).prop_map(Action::Open),
        any::<usize>().prop_map(Action::Delete),
        any::<usize>().prop_map(Action::Close),
    ]
}

proptest! {
    #[test]
    fn prop_arena_stays_consistent(actions in prop::collection::vec(action_strategy(), 1..60)) {
        let store = setup_store();
        let mut open: Vec<Handle> = Vec::new();

        for action in actions {
            match action {
                Action::Create(k, n) => {
                    let key = format!("key.{k}");
                    if let Ok(handle) = store.create(&key, n as usize, Some(&KeyDesc::default())) {
                        open.push(handle);
                    }
                }
                Action::Resize(k, n) => {
                    let key = format!("key.{k}");
                    if let Ok(handle) = store.create(&key, n as usize, None) {
                        open.push(handle);
                    }
                }
                Action::Open(k) => {
                    let key = format!("key.{k}");
                    if let Ok(handle) = store.open(&key, Access::READ_WRITE) {
                        open.push(handle);
                    }
                }
                Action::Delete(i) if !open.is_empty() => {
                    let handle = &open[i % open.len()];
                    prop_assert!(store.delete(handle).is_ok());
                }
                Action::Close(i) if !open.is_empty() => {
                    let handle = open.swap_remove(i % open.len());
                    prop_assert!(store.close(handle).is_ok());
                }
                _ => {}
            }
            prop_assert_eq!(store.verify_integrity(), Ok(()));
        }

        prop_assert_eq!(store.status().open_handles, open.len());
        for handle in open {
            prop_assert!(store.close(handle).is_ok());
        }
        prop_assert_eq!(store.verify_integrity(), Ok(()));
    }
}
