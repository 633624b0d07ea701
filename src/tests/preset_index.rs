use std::sync::Arc;

use super::{fake_index, fast_policy, hashed, in_memory_index, preset, FakeProvider};
use crate::preset::embeddings::HashedTokenEmbedder;
use crate::preset::{PresetIndexError, PresetQueryIndex, VectorStorage, STORAGE_FILE};

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn open_persistent(dir: &std::path::Path) -> PresetQueryIndex {
    let storage = VectorStorage::new(dir.join(STORAGE_FILE));
    PresetQueryIndex::open(hashed(), fast_policy(), storage).unwrap()
}

#[test]
fn test_add_then_get_returns_texts_in_request_order() {
    let index = in_memory_index();

    let report = index
        .add(vec![
            preset("p1", "show total sales"),
            preset("p2", "show total revenue"),
        ])
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.applied, ids(&["p1", "p2"]));

    let records = index.get_by_ids(&ids(&["p2", "missing", "p1"])).unwrap();
    let texts: Vec<Option<&str>> = records
        .iter()
        .map(|r| r.as_ref().map(|r| r.text.as_str()))
        .collect();

    assert_eq!(
        texts,
        vec![Some("show total revenue"), None, Some("show total sales")]
    );
    assert_eq!(index.size().unwrap(), 2);
}

#[test]
fn test_add_existing_id_fails_and_changes_nothing() {
    let index = in_memory_index();
    index.add(vec![preset("p1", "show total sales")]).unwrap();

    let err = index
        .add(vec![preset("p3", "count orders"), preset("p1", "other text")])
        .unwrap_err();

    assert!(matches!(err, PresetIndexError::DuplicateId(ref dup) if dup == &ids(&["p1"])));
    assert_eq!(index.size().unwrap(), 1);
    assert!(index.get_by_ids(&ids(&["p3"])).unwrap()[0].is_none());
    assert_eq!(
        index.get_by_ids(&ids(&["p1"])).unwrap()[0]
            .as_ref()
            .map(|r| r.text.as_str()),
        Some("show total sales")
    );
}

#[test]
fn test_invalid_batches_rejected_before_embedding() {
    let provider = FakeProvider::new();
    let index = fake_index(provider.clone());

    let cases = vec![
        vec![preset("", "text")],
        vec![preset("p1", "   ")],
        vec![preset("p1", "first"), preset("p1", "second")],
    ];

    for batch in cases {
        let err = index.add(batch.clone()).unwrap_err();
        assert!(matches!(err, PresetIndexError::InvalidArgument(_)), "{err}");

        let err = index.update(batch).unwrap_err();
        assert!(matches!(err, PresetIndexError::InvalidArgument(_)), "{err}");
    }

    assert_eq!(provider.calls(), 0);
    assert_eq!(index.size().unwrap(), 0);
}

#[test]
fn test_update_replaces_text_and_keeps_identity() {
    let index = in_memory_index();
    index
        .add(vec![
            preset("p1", "show total sales"),
            preset("p2", "count orders by region"),
        ])
        .unwrap();
    let before = index.get_by_ids(&ids(&["p1"])).unwrap()[0].clone().unwrap();

    let report = index.update(vec![preset("p1", "average order value")]).unwrap();
    assert_eq!(report.applied, ids(&["p1"]));

    let after = index.get_by_ids(&ids(&["p1"])).unwrap()[0].clone().unwrap();
    assert_eq!(after.text, "average order value");
    assert_eq!(after.seq, before.seq);
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at >= before.updated_at);

    // the new embedding is what retrieval sees
    let results = index.retrieve(&ids(&["average order value"]), 1).unwrap();
    assert_eq!(results[0].hits[0].id, "p1");
    assert!((results[0].hits[0].score - 1.0).abs() < 1e-5);
}

#[test]
fn test_update_missing_id_fails_and_changes_nothing() {
    let index = in_memory_index();
    index.add(vec![preset("p1", "show total sales")]).unwrap();

    let err = index
        .update(vec![preset("p1", "new text"), preset("p9", "unknown")])
        .unwrap_err();

    assert!(matches!(err, PresetIndexError::NotFound(ref missing) if missing == &ids(&["p9"])));
    assert_eq!(
        index.get_by_ids(&ids(&["p1"])).unwrap()[0]
            .as_ref()
            .map(|r| r.text.as_str()),
        Some("show total sales")
    );
    assert!(index.get_by_ids(&ids(&["p9"])).unwrap()[0].is_none());
}

#[test]
fn test_delete_is_idempotent() {
    let index = in_memory_index();
    index
        .add(vec![preset("p1", "show total sales"), preset("p2", "count orders")])
        .unwrap();

    assert_eq!(index.delete_by_ids(&ids(&["p1", "absent"])).unwrap(), 1);
    assert_eq!(index.size().unwrap(), 1);

    assert_eq!(index.delete_by_ids(&ids(&["p1", "absent"])).unwrap(), 0);
    assert_eq!(index.size().unwrap(), 1);
    assert!(index.get_by_ids(&ids(&["p1"])).unwrap()[0].is_none());

    // a deleted id can be added again
    index.add(vec![preset("p1", "show total sales")]).unwrap();
    assert_eq!(index.size().unwrap(), 2);
}

#[test]
fn test_empty_clears_everything() {
    let provider = FakeProvider::new();
    let index = fake_index(provider.clone());
    index
        .add(vec![preset("p1", "show total sales"), preset("p2", "count orders")])
        .unwrap();
    let calls_after_add = provider.calls();

    index.empty().unwrap();

    assert_eq!(index.size().unwrap(), 0);
    let results = index.retrieve(&ids(&["total sales"]), 5).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].hits.is_empty());
    // empty collection answers without embedding the query
    assert_eq!(provider.calls(), calls_after_add);
}

#[test]
fn test_retrieve_ranks_closest_preset_first() {
    let index = in_memory_index();
    index
        .add(vec![
            preset("p1", "show total sales"),
            preset("p2", "show total revenue"),
        ])
        .unwrap();

    let results = index.retrieve(&ids(&["total sales"]), 1).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].query, "total sales");
    assert_eq!(results[0].hits.len(), 1);
    assert_eq!(results[0].hits[0].id, "p1");
    assert_eq!(results[0].hits[0].text, "show total sales");
}

#[test]
fn test_retrieve_respects_n_results_and_order() {
    let index = in_memory_index();
    index
        .add(vec![
            preset("p1", "show total sales"),
            preset("p2", "show total revenue"),
            preset("p3", "count orders by region"),
            preset("p4", "list top customers"),
        ])
        .unwrap();

    let queries = ids(&["total sales", "customers", "orders per region"]);
    let results = index.retrieve(&queries, 2).unwrap();

    assert_eq!(results.len(), 3);
    for (result, query) in results.iter().zip(&queries) {
        assert_eq!(&result.query, query);
        assert_eq!(result.hits.len(), 2);
        assert!(result.hits[0].score >= result.hits[1].score);
    }

    // fewer records than requested returns all of them
    let results = index.retrieve(&ids(&["total sales"]), 10).unwrap();
    assert_eq!(results[0].hits.len(), 4);
    let scores: Vec<f32> = results[0].hits.iter().map(|h| h.score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{scores:?}");
}

#[test]
fn test_retrieve_edge_cases() {
    let index = in_memory_index();
    index.add(vec![preset("p1", "show total sales")]).unwrap();

    assert!(index.retrieve(&[], 5).unwrap().is_empty());

    let results = index.retrieve(&ids(&["total sales"]), 0).unwrap();
    assert!(results[0].hits.is_empty());

    let err = index.retrieve(&ids(&["total sales", "  "]), 5).unwrap_err();
    assert!(matches!(err, PresetIndexError::InvalidArgument(_)));
}

#[test]
fn test_equal_scores_ordered_by_insertion() {
    let index = in_memory_index();
    index.add(vec![preset("b", "monthly active users")]).unwrap();
    index.add(vec![preset("a", "monthly active users")]).unwrap();
    index.add(vec![preset("c", "monthly active users")]).unwrap();

    let results = index.retrieve(&ids(&["monthly active users"]), 3).unwrap();
    let order: Vec<&str> = results[0].hits.iter().map(|h| h.id.as_str()).collect();

    assert_eq!(order, vec!["b", "a", "c"]);
}

#[test]
fn test_embedding_failures_are_isolated_per_record() {
    let provider = FakeProvider::new();
    let index = fake_index(provider.clone());

    let report = index
        .add(vec![
            preset("ok1", "show total sales"),
            preset("bad", "broken preset"),
            preset("dims", "wrong dimensions"),
            preset("ok2", "count orders"),
        ])
        .unwrap();

    assert_eq!(report.applied, ids(&["ok1", "ok2"]));
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.failed[0].id, "bad");
    assert!(matches!(
        report.failed[0].error,
        PresetIndexError::EmbeddingProvider(_)
    ));
    assert_eq!(report.failed[1].id, "dims");
    assert_eq!(index.size().unwrap(), 2);

    // ok1 + broken twice (retry) + wrong once + ok2
    assert_eq!(provider.calls(), 5);
}

#[test]
fn test_non_finite_embeddings_rejected_per_record() {
    let provider = FakeProvider::new();
    let index = fake_index(provider.clone());

    let report = index
        .add(vec![
            preset("ok1", "show total sales"),
            preset("nan", "nan preset"),
            preset("ok2", "show total revenue"),
        ])
        .unwrap();

    assert_eq!(report.applied, ids(&["ok1", "ok2"]));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, "nan");
    assert!(matches!(
        report.failed[0].error,
        PresetIndexError::EmbeddingProvider(_)
    ));
    assert!(index.get_by_ids(&ids(&["nan"])).unwrap()[0].is_none());

    let results = index.retrieve(&ids(&["total sales"]), 5).unwrap();
    let hits = &results[0].hits;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "ok1");
    assert!(hits.iter().all(|hit| hit.score.is_finite()));
    assert!(hits[0].score >= hits[1].score);

    let err = index.retrieve(&ids(&["nan query"]), 5).unwrap_err();
    assert!(matches!(err, PresetIndexError::EmbeddingProvider(_)));
}

#[test]
fn test_embedding_timeout_reported() {
    let provider = FakeProvider::new();
    let index = fake_index(provider.clone());

    let report = index.add(vec![preset("p1", "slow preset")]).unwrap();

    assert!(report.applied.is_empty());
    assert!(matches!(
        report.failed[0].error,
        PresetIndexError::EmbeddingTimeout(_)
    ));
    assert_eq!(index.size().unwrap(), 0);

    index.add(vec![preset("p2", "count orders")]).unwrap();
    let err = index.retrieve(&ids(&["broken query"]), 5).unwrap_err();
    assert!(matches!(err, PresetIndexError::EmbeddingProvider(_)));
}

#[test]
fn test_concurrent_disjoint_adds_all_land() {
    let index = in_memory_index();

    std::thread::scope(|s| {
        for worker in 0..4 {
            let index = &index;
            s.spawn(move || {
                let batch = (0..25)
                    .map(|i| preset(&format!("w{worker}-{i}"), &format!("preset {worker} number {i}")))
                    .collect();
                index.add(batch).unwrap();
            });
        }
    });

    assert_eq!(index.size().unwrap(), 100);

    let records = index.get_by_ids(&ids(&["w0-0", "w3-24"])).unwrap();
    assert!(records.iter().all(Option::is_some));
}

#[test]
fn test_concurrent_adds_of_same_id_admit_one() {
    let index = in_memory_index();

    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let index = &index;
                s.spawn(move || index.add(vec![preset("shared", &format!("text {worker}"))]))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    let duplicates = outcomes
        .iter()
        .filter(|r| matches!(r, Err(PresetIndexError::DuplicateId(_))))
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(duplicates, 3);
    assert_eq!(index.size().unwrap(), 1);
}

#[test]
fn test_persisted_collection_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();

    {
        let index = open_persistent(tmp.path());
        index
            .add(vec![
                preset("p1", "show total sales"),
                preset("p2", "show total revenue"),
                preset("p3", "count orders"),
            ])
            .unwrap();
        index.delete_by_ids(&ids(&["p3"])).unwrap();
        index.update(vec![preset("p2", "show net revenue")]).unwrap();
    }

    let index = open_persistent(tmp.path());
    assert_eq!(index.size().unwrap(), 2);

    let records = index.get_by_ids(&ids(&["p1", "p2", "p3"])).unwrap();
    assert_eq!(records[0].as_ref().map(|r| r.text.as_str()), Some("show total sales"));
    assert_eq!(records[1].as_ref().map(|r| r.text.as_str()), Some("show net revenue"));
    assert!(records[2].is_none());

    // sequence numbers keep counting after reopen
    index.add(vec![preset("p4", "list customers")]).unwrap();
    let p4 = index.get_by_ids(&ids(&["p4"])).unwrap()[0].clone().unwrap();
    assert_eq!(p4.seq, 3);

    let results = index.retrieve(&ids(&["total sales"]), 1).unwrap();
    assert_eq!(results[0].hits[0].id, "p1");
}

#[test]
fn test_failed_persist_rolls_back() {
    let tmp = tempfile::tempdir().unwrap();
    let index = open_persistent(tmp.path());
    index.add(vec![preset("p1", "show total sales")]).unwrap();

    // a directory where the temp file goes makes every save fail
    let blocker = tmp.path().join(STORAGE_FILE).with_extension("tmp");
    std::fs::create_dir(&blocker).unwrap();

    let err = index.add(vec![preset("p2", "count orders")]).unwrap_err();
    assert!(matches!(err, PresetIndexError::Storage(_)));
    assert_eq!(index.size().unwrap(), 1);
    assert!(index.get_by_ids(&ids(&["p2"])).unwrap()[0].is_none());

    let err = index.update(vec![preset("p1", "changed")]).unwrap_err();
    assert!(matches!(err, PresetIndexError::Storage(_)));
    assert_eq!(
        index.get_by_ids(&ids(&["p1"])).unwrap()[0]
            .as_ref()
            .map(|r| r.text.as_str()),
        Some("show total sales")
    );

    assert!(index.delete_by_ids(&ids(&["p1"])).is_err());
    assert!(index.empty().is_err());
    assert_eq!(index.size().unwrap(), 1);

    std::fs::remove_dir(&blocker).unwrap();
    index.add(vec![preset("p2", "count orders")]).unwrap();
    assert_eq!(index.size().unwrap(), 2);

    let reopened = open_persistent(tmp.path());
    assert_eq!(reopened.size().unwrap(), 2);
}

#[test]
fn test_reopen_with_other_dimensions_starts_empty() {
    let tmp = tempfile::tempdir().unwrap();
    open_persistent(tmp.path())
        .add(vec![preset("p1", "show total sales")])
        .unwrap();

    let storage = VectorStorage::new(tmp.path().join(STORAGE_FILE));
    let index = PresetQueryIndex::open(
        Arc::new(HashedTokenEmbedder::new(64).unwrap()),
        fast_policy(),
        storage,
    )
    .unwrap();

    assert_eq!(index.size().unwrap(), 0);
    assert_eq!(index.dimensions(), 64);
}

#[test]
fn test_invalid_stored_embedding_fails_open() {
    let dims = super::TEST_DIMENSIONS;
    let cases: [(&str, Vec<u8>); 2] = [
        ("nan", f32::NAN.to_le_bytes().to_vec()),
        ("zero", vec![0u8; dims * 4]),
    ];

    for (name, tail) in cases {
        let tmp = tempfile::tempdir().unwrap();
        open_persistent(tmp.path())
            .add(vec![preset("p1", "show total sales")])
            .unwrap();

        // the single entry's embedding ends the file
        let path = tmp.path().join(STORAGE_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let start = bytes.len() - tail.len();
        bytes[start..].copy_from_slice(&tail);
        std::fs::write(&path, bytes).unwrap();

        let storage = VectorStorage::new(path);
        let result = PresetQueryIndex::open(hashed(), fast_policy(), storage);
        assert!(
            matches!(result, Err(PresetIndexError::Storage(_))),
            "{name} embedding was loaded"
        );
    }
}

#[test]
fn test_corrupt_storage_fails_open() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(STORAGE_FILE), vec![1u8; 80]).unwrap();

    let storage = VectorStorage::new(tmp.path().join(STORAGE_FILE));
    let result = PresetQueryIndex::open(hashed(), fast_policy(), storage);

    assert!(matches!(result, Err(PresetIndexError::Storage(_))));
}
