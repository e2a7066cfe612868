//! Property-based tests for the testable properties in spec §8: format
//! round-trip (§8.1), batch coherence (§8.2), and shard-hash determinism
//! (§8.4). `proptest` test bodies are synchronous, so each one drives its
//! `async` assertions through a fresh single-threaded Tokio runtime.

use des_store::{consistent_hash, ContainerWriter, LocalReader, WriteOptions};
use proptest::prelude::*;
use serde_json::json;

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

/// Valid, unique-within-a-sequence file names: ASCII alphanumerics plus a
/// few safe separators, 1-40 bytes, no leading/trailing whitespace and no
/// `..` — the same constraints `format::index_entry::validate_name` checks.
fn valid_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9_.-]{0,39}".prop_filter("no path traversal", |s| !s.contains(".."))
}

proptest! {
    /// §8.1 — for any finite sequence of unique `(name, bytes)` pairs,
    /// writing then reading back yields each file's bytes exactly, `list()`
    /// preserves insertion order, and `stats.file_count` matches.
    #[test]
    fn format_round_trip(
        files in prop::collection::vec((valid_name(), prop::collection::vec(any::<u8>(), 0..2048)), 1..12)
    ) {
        // Dedup names, preserving first occurrence, so the sequence satisfies
        // the property's "names are unique" precondition.
        let mut seen = std::collections::HashSet::new();
        let files: Vec<_> = files.into_iter().filter(|(name, _)| seen.insert(name.clone())).collect();
        prop_assume!(!files.is_empty());

        rt().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("prop.des");

            {
                let mut w = ContainerWriter::open(&path, "ctr-prop".into(), WriteOptions::default(), None).unwrap();
                for (name, bytes) in &files {
                    w.add(name, bytes, &json!({"len": bytes.len()})).await.unwrap();
                }
                let stats = w.finalize().unwrap();
                prop_assert_eq!(stats.file_count as usize, files.len());
                Ok(())
            }?;

            let reader = LocalReader::open(&path, None, None).await.unwrap();
            let expected_names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
            prop_assert_eq!(reader.list(), expected_names);

            for (name, bytes) in &files {
                let got = reader.get(name).await.unwrap();
                prop_assert_eq!(&got[..], &bytes[..]);
            }
            Ok(())
        })?;
    }

    /// §8.2 — `get_many` returns values equal to the corresponding `get`
    /// call for every present name, and preserves the caller's name order
    /// regardless of how the reader internally reorders by offset to batch.
    #[test]
    fn batch_matches_individual_gets_and_preserves_order(
        files in prop::collection::vec((valid_name(), prop::collection::vec(any::<u8>(), 1..512)), 2..10),
        max_gap in 0u64..4096,
    ) {
        let mut seen = std::collections::HashSet::new();
        let files: Vec<_> = files.into_iter().filter(|(name, _)| seen.insert(name.clone())).collect();
        prop_assume!(files.len() >= 2);

        rt().block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("batch.des");

            {
                let mut w = ContainerWriter::open(&path, "ctr-batch".into(), WriteOptions::default(), None).unwrap();
                for (name, bytes) in &files {
                    w.add(name, bytes, &json!({})).await.unwrap();
                }
                w.finalize().unwrap();
            }

            let reader = LocalReader::open(&path, None, None).await.unwrap();

            // Request in reverse order to also exercise that get_many
            // doesn't leak its internal offset-sorted processing order.
            let names: Vec<String> = files.iter().rev().map(|(n, _)| n.clone()).collect();
            let batch = reader.get_many(&names, max_gap).await;

            prop_assert_eq!(batch.len(), names.len());
            for (i, (name, result)) in batch.iter().enumerate() {
                prop_assert_eq!(name, &names[i]);
                let individual = reader.get(name).await.unwrap();
                prop_assert_eq!(&result.as_ref().unwrap()[..], &individual[..]);
            }
            Ok(())
        })?;
    }

    /// §8.4 — `consistent_hash` is a pure function of its inputs: same
    /// bytes and bit width always produce the same shard id, and the id
    /// always fits within `n_bits`.
    #[test]
    fn shard_hash_is_deterministic_and_in_range(
        bytes in prop::collection::vec(any::<u8>(), 0..64),
        n_bits in 1u32..32,
    ) {
        let a = consistent_hash(&bytes, n_bits);
        let b = consistent_hash(&bytes, n_bits);
        prop_assert_eq!(a, b);
        prop_assert!((a as u64) < (1u64 << n_bits));
    }
}
