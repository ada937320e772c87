//! # comprehensive storage tests
//!
//! why: verify that everything a node needs after a crash comes back intact
//! relations: tests mokka-storage against mokka-core types and Node::restore
//! what: hard state, log tails, crash recovery, atomic writes, corrupt files, trait polymorphism

use ed25519_dalek::SigningKey;
use mokka_core::vote::VoteRecord;
use mokka_core::{HardState, Lifecycle, LogEntry, MokkaConfig, Node, PublicKey};
use mokka_storage::{FileStorage, InMemoryStorage, Storage};
use std::fs;
use tempfile::tempdir;

fn entry(term: u64, index: u64) -> LogEntry {
    LogEntry::new(term, index, format!("task-{index}").into_bytes())
}

fn voted_state(term: u64, commit_index: u64) -> HardState {
    let key = SigningKey::from_bytes(&[9; 32]);
    HardState {
        term,
        voted: Some(VoteRecord {
            term,
            candidate: PublicKey::from_signing_key(&key),
        }),
        commit_index,
    }
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let storage = InMemoryStorage::new();

        assert_eq!(storage.load_hard_state().unwrap(), HardState::default());
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn overwrite_hard_state() {
        let mut storage = InMemoryStorage::new();

        storage.save_hard_state(&voted_state(1, 0)).unwrap();
        storage.save_hard_state(&voted_state(4, 2)).unwrap();

        assert_eq!(storage.load_hard_state().unwrap(), voted_state(4, 2));
    }

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();

        storage.append_entries(&[entry(1, 1)]).unwrap();
        storage.append_entries(&[entry(1, 2), entry(1, 3)]).unwrap();
        storage.append_entries(&[]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].payload, b"task-3".to_vec());
    }

    #[test]
    fn truncate_empty_log() {
        let mut storage = InMemoryStorage::new();

        storage.truncate_log_from(1).unwrap();
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn clear_resets_all_state() {
        let mut storage = InMemoryStorage::new();
        storage.save_hard_state(&voted_state(3, 1)).unwrap();
        storage.append_entries(&[entry(3, 1)]).unwrap();

        storage.clear().unwrap();

        assert_eq!(storage.load_hard_state().unwrap(), HardState::default());
        assert!(storage.load_log().unwrap().is_empty());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("node-a").join("state");

        let storage = FileStorage::new(&nested).unwrap();

        assert!(nested.is_dir());
        assert_eq!(storage.dir(), nested.as_path());
    }

    #[test]
    fn new_storage_has_default_values() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.load_hard_state().unwrap(), HardState::default());
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn hard_state_round_trips_with_vote() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_hard_state(&voted_state(7, 3)).unwrap();

        assert_eq!(storage.load_hard_state().unwrap(), voted_state(7, 3));
    }

    #[test]
    fn persist_tail_replaces_conflicting_suffix() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage
            .append_entries(&[entry(1, 1), entry(1, 2), entry(1, 3)])
            .unwrap();

        storage.persist_tail(2, &[entry(2, 2)]).unwrap();

        let log = storage.load_log().unwrap();
        let terms: Vec<_> = log.iter().map(|e| (e.index, e.term)).collect();
        assert_eq!(terms, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn truncate_past_the_end_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&[entry(1, 1)]).unwrap();

        storage.truncate_log_from(5).unwrap();

        assert_eq!(storage.load_log().unwrap().len(), 1);
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    fn single_node() -> (SigningKey, Node) {
        let key = SigningKey::from_bytes(&[1; 32]);
        let mut node = Node::new(key.clone(), &[], MokkaConfig::default()).unwrap();
        node.start(1_000);
        node.tick(1_000 + node.config().election_max);
        assert!(node.is_leader());
        (key, node)
    }

    fn persist(node: &mut Node, storage: &mut impl Storage) {
        if let Some((from, tail)) = node.take_unpersisted() {
            storage.persist_tail(from, &tail).unwrap();
        }
        storage.save_hard_state(&node.hard_state()).unwrap();
    }

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_hard_state(&voted_state(10, 1)).unwrap();
            storage.append_entries(&[entry(10, 1)]).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_hard_state().unwrap(), voted_state(10, 1));
        assert_eq!(storage.load_log().unwrap(), vec![entry(10, 1)]);
    }

    #[test]
    fn restored_node_reports_same_last_info() {
        let dir = tempdir().unwrap();
        let (key, mut node) = single_node();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        for i in 0..3u8 {
            node.propose_task(vec![i]).unwrap();
        }
        node.reserve_task(2).unwrap();
        persist(&mut node, &mut storage);
        let before = node.last_info();

        let reopened = FileStorage::new(dir.path()).unwrap();
        let restored = Node::restore(
            key,
            &[],
            MokkaConfig::default(),
            reopened.load_hard_state().unwrap(),
            reopened.load_log().unwrap(),
        )
        .unwrap();

        assert_eq!(restored.last_info(), before);
        assert_eq!(restored.term(), node.term());
        assert_eq!(restored.voted(), node.voted());
        assert_eq!(restored.log().get(2).unwrap().lifecycle, Lifecycle::Reserved);
        assert!(!restored.is_leader());
    }

    #[test]
    fn repeated_persists_write_only_changes() {
        let mut storage = InMemoryStorage::new();
        let (_, mut node) = single_node();

        node.propose_task(b"a".to_vec()).unwrap();
        persist(&mut node, &mut storage);
        node.propose_task(b"b".to_vec()).unwrap();
        persist(&mut node, &mut storage);
        persist(&mut node, &mut storage);

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].payload, b"b".to_vec());
    }

    #[test]
    fn load_after_clear_returns_defaults() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_hard_state(&voted_state(2, 0)).unwrap();
        storage.append_entries(&[entry(2, 1)]).unwrap();

        storage.clear().unwrap();
        storage.clear().unwrap();

        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.load_hard_state().unwrap(), HardState::default());
        assert!(reopened.load_log().unwrap().is_empty());
    }
}

// =============================================================================
// SECTION 4: ATOMIC WRITES AND CORRUPT FILES
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn files_are_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_hard_state(&voted_state(1, 0)).unwrap();
        storage.append_entries(&[entry(1, 1)]).unwrap();

        for name in ["meta.json", "log.json"] {
            let contents = fs::read_to_string(dir.path().join(name)).unwrap();
            serde_json::from_str::<serde_json::Value>(&contents).unwrap();
        }
    }

    #[test]
    fn corrupt_meta_is_invalid_data() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(dir.path().join("meta.json"), b"{ not json").unwrap();

        let error = storage.load_hard_state().unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn leftover_temp_file_does_not_shadow_log() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&[entry(1, 1)]).unwrap();
        // a crash between write and rename leaves this behind
        fs::write(dir.path().join("log.tmp"), b"[garbage").unwrap();

        assert_eq!(storage.load_log().unwrap(), vec![entry(1, 1)]);
        storage.append_entries(&[entry(1, 2)]).unwrap();
        assert_eq!(storage.load_log().unwrap().len(), 2);
    }
}

// =============================================================================
// SECTION 5: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn exercise<S: Storage>(storage: &mut S) {
        storage.save_hard_state(&voted_state(3, 2)).unwrap();
        storage
            .append_entries(&[entry(1, 1), entry(2, 2), entry(2, 3)])
            .unwrap();
        storage.persist_tail(3, &[entry(3, 3), entry(3, 4)]).unwrap();

        assert_eq!(storage.load_hard_state().unwrap(), voted_state(3, 2));
        let indexes: Vec<_> = storage.load_log().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
        assert_eq!(storage.load_log().unwrap()[2].term, 3);
    }

    #[test]
    fn in_memory_implements_trait() {
        exercise(&mut InMemoryStorage::new());
    }

    #[test]
    fn file_storage_implements_trait() {
        let dir = tempdir().unwrap();
        exercise(&mut FileStorage::new(dir.path()).unwrap());
    }
}
