//! Property-based checks of the store's ref-count accounting and on-disk
//! size bookkeeping (spec.md §8): for any interleaving of writes and
//! removes across a small id space, a read must agree with a plain
//! in-memory reference-count oracle, and every file's valid size must
//! never exceed its on-disk size.

use std::collections::HashMap;

use bytes::Bytes;
use proptest::prelude::*;

use qstore::acknowledgements::Confirmer;
use qstore::config::StoreConfig;
use qstore::ids::{ClientRef, MessageId};

#[derive(Clone, Copy, Debug)]
enum Op {
    Write(u8),
    Remove(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6).prop_map(Op::Write),
        (0u8..6).prop_map(Op::Remove),
    ]
}

fn mk_id(n: u8) -> MessageId {
    MessageId::from_bytes([n; 16])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn reads_agree_with_a_refcount_oracle(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            // Small enough that writes/removes routinely roll and delete
            // files, exercising the bookkeeping under test rather than
            // leaving everything in one never-rolled file.
            let config = StoreConfig::from_path(dir.path())
                .file_size_limit(256)
                .build();
            let store = qstore::store::open(config, Confirmer::noop()).await.unwrap();
            let client = ClientRef::new();

            let mut oracle: HashMap<u8, i64> = HashMap::new();

            for op in &ops {
                match *op {
                    Op::Write(n) => {
                        store.write(client, mk_id(n), Bytes::from_static(b"payload-bytes")).await.unwrap();
                        *oracle.entry(n).or_insert(0) += 1;
                    }
                    Op::Remove(n) => {
                        let count = oracle.entry(n).or_insert(0);
                        if *count > 0 {
                            store.remove(client, vec![mk_id(n)]).await.unwrap();
                            *count -= 1;
                        }
                    }
                }
            }
            store.sync(vec![]).await.unwrap();

            for n in 0u8..6 {
                let expected_present = oracle.get(&n).copied().unwrap_or(0) > 0;
                let actual = store.read(mk_id(n)).await.unwrap();
                prop_assert_eq!(actual.is_some(), expected_present, "id {} disagreement", n);
            }

            let summaries = store.file_summaries();
            for (file_no, valid, size, _locked) in summaries.snapshot() {
                prop_assert!(valid <= size, "file {} has valid {} > size {}", file_no, valid, size);
            }

            store.shutdown().await.unwrap();
            Ok(())
        })?;
    }
}
