//! End-to-end engine scenarios: the public API driven the way an
//! application would, including persistence, crash atomicity, and
//! concurrent writers.

use mainydb_core::{
    doc, Config, Document, EngineError, FindOptions, IndexOptions, MainyDb, Value, WriteOp,
};
use std::time::Duration;
use tempfile::tempdir;

fn names(docs: &[Document]) -> Vec<String> {
    docs.iter()
        .filter_map(|d| d.get("name")?.as_str().map(ToString::to_string))
        .collect()
}

#[test]
fn insert_and_equality_find() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("people");

    coll.insert_one(doc! { "name": "John", "age": 30i64 }).unwrap();
    coll.insert_one(doc! { "name": "Jane", "age": 25i64 }).unwrap();

    let found = coll
        .find(&doc! { "age": doc! { "$gt": 27i64 } })
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(names(&found), vec!["John"]);
}

#[test]
fn index_range_scan_with_sort_pushdown() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("numbers");

    let docs: Vec<Document> = (0..100).map(|i| doc! { "n": i as i64 }).collect();
    let result = coll.insert_many(docs).unwrap();
    assert_eq!(result.inserted_ids.len(), 100);
    assert!(result.errors.is_empty());

    coll.create_index(&doc! { "n": 1i64 }, IndexOptions::default())
        .unwrap();

    let filter = doc! { "n": doc! { "$gte": 10i64, "$lt": 15i64 } };
    let options = FindOptions::new().sort("n", 1);

    // The planner trace confirms the index is used and the sort is
    // satisfied by index order: no full scan, no in-memory sort.
    let plan = coll.explain_with_options(&filter, &options).unwrap();
    assert_eq!(plan.get("access"), Some(&Value::Text("index".into())));
    assert_eq!(plan.get("index"), Some(&Value::Text("n_1".into())));
    assert_eq!(plan.get("sorted_by_index"), Some(&Value::Bool(true)));

    let found = coll
        .find_with_options(&filter, options)
        .unwrap()
        .to_vec()
        .unwrap();
    let ns: Vec<i64> = found.iter().filter_map(|d| d.get("n")?.as_i64()).collect();
    assert_eq!(ns, vec![10, 11, 12, 13, 14]);
}

#[test]
fn combined_update_operators() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("docs");

    coll.insert_one(doc! { "a": 1i64, "b": vec![1i64, 2, 3], "c": doc! { "x": 0i64 } })
        .unwrap();

    let update = doc! {
        "$inc": doc! { "a": 2i64 },
        "$push": doc! { "b": 4i64 },
        "$set": doc! { "c.y": 9i64 },
        "$unset": doc! { "c.x": "" },
    };
    let result = coll.update_one(&doc! {}, &update).unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(result.modified, 1);

    let updated = coll.find_one(&doc! {}).unwrap().unwrap();
    assert_eq!(updated.get("a"), Some(&Value::Int(3)));
    assert_eq!(updated.get("b"), Some(&Value::from(vec![1i64, 2, 3, 4])));
    assert_eq!(updated.get("c"), Some(&Value::Doc(doc! { "y": 9i64 })));
}

#[test]
fn aggregation_group_and_sort() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("events");

    coll.insert_many(vec![
        doc! { "cat": "A", "v": 1i64 },
        doc! { "cat": "A", "v": 3i64 },
        doc! { "cat": "B", "v": 2i64 },
    ])
    .unwrap();

    let out = coll
        .aggregate(&[
            Value::Doc(doc! { "$group": doc! {
                "_id": "$cat",
                "s": doc! { "$sum": "$v" },
                "n": doc! { "$sum": 1i64 },
            } }),
            Value::Doc(doc! { "$sort": doc! { "_id": 1i64 } }),
        ])
        .unwrap()
        .to_vec()
        .unwrap();

    assert_eq!(out.len(), 2);
    assert_eq!(out[0], doc! { "_id": "A", "s": 4i64, "n": 2i64 });
    assert_eq!(out[1], doc! { "_id": "B", "s": 2i64, "n": 1i64 });
}

#[test]
fn unique_index_rejects_duplicates() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("accounts");

    coll.create_index(
        &doc! { "email": 1i64 },
        IndexOptions {
            unique: true,
            ..IndexOptions::default()
        },
    )
    .unwrap();

    coll.insert_one(doc! { "email": "a@x" }).unwrap();
    let err = coll.insert_one(doc! { "email": "a@x" }).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateKey { .. }));
    assert_eq!(coll.count_documents(&doc! {}).unwrap(), 1);
}

#[test]
fn upsert_inserts_seed_plus_update() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("users");

    let result = coll
        .update_one_with_options(&doc! { "name": "Z" }, &doc! { "$set": doc! { "age": 1i64 } }, true)
        .unwrap();
    assert_eq!(result.matched, 0);
    assert_eq!(result.modified, 0);
    let upserted_id = result.upserted_id.expect("an id was inserted");

    let inserted = coll.find_one(&doc! { "name": "Z" }).unwrap().unwrap();
    assert_eq!(inserted.get("_id"), Some(&upserted_id));
    assert_eq!(inserted.get("age"), Some(&Value::Int(1)));
}

#[test]
fn crash_atomicity_through_truncation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.mdb");

    {
        let store = MainyDb::open(&path).unwrap();
        let coll = store.db("test").collection("bulk");
        let docs: Vec<Document> = (0..500).map(|i| doc! { "i": i as i64 }).collect();
        let result = coll.insert_many(docs).unwrap();
        assert_eq!(result.inserted_ids.len(), 500);
        store.close().unwrap();
    }

    // Keep the good checkpoint, then simulate a torn write.
    let good = std::fs::read(&path).unwrap();
    std::fs::write(&path, &good[..16]).unwrap();

    let err = MainyDb::open(&path).unwrap_err();
    assert!(matches!(err, EngineError::CorruptFile { .. }));

    // Restoring the pre-truncation file recovers all 500 documents.
    std::fs::write(&path, &good).unwrap();
    let store = MainyDb::open(&path).unwrap();
    let count = store
        .db("test")
        .collection("bulk")
        .count_documents(&doc! {})
        .unwrap();
    assert_eq!(count, 500);
}

#[test]
fn persistence_across_reopen_preserves_tags_and_indexes() {
    let dir = tempdir().unwrap();

    {
        let store = MainyDb::open(dir.path()).unwrap();
        let coll = store.db("shop").collection("items");
        coll.insert_one(doc! { "name": "kettle", "price": 24.5, "stock": 3i64 })
            .unwrap();
        coll.create_index(&doc! { "price": 1i64 }, IndexOptions::default())
            .unwrap();
        store.close().unwrap();
        assert!(dir.path().join("mainydb.mdb").is_file());
    }

    {
        let store = MainyDb::open(dir.path()).unwrap();
        let coll = store.db("shop").collection("items");

        let item = coll.find_one(&doc! { "name": "kettle" }).unwrap().unwrap();
        // Int vs float tags survive the round-trip.
        assert_eq!(item.get("price"), Some(&Value::Float(24.5)));
        assert_eq!(item.get("stock"), Some(&Value::Int(3)));

        // The index definition came back and is used again.
        let plan = coll
            .explain(&doc! { "price": doc! { "$lt": 100.0 } })
            .unwrap();
        assert_eq!(plan.get("access"), Some(&Value::Text("index".into())));
        store.close().unwrap();
    }
}

#[test]
fn noop_update_reports_matched_but_unmodified() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("docs");
    coll.insert_one(doc! { "name": "a", "v": 1i64 }).unwrap();

    let before = coll.find_one(&doc! {}).unwrap().unwrap();
    let result = coll
        .update_one(&doc! { "name": "a" }, &doc! { "$set": doc! { "v": 1i64 } })
        .unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(result.modified, 0);

    let after = coll.find_one(&doc! {}).unwrap().unwrap();
    assert_eq!(before, after);
}

#[test]
fn cursor_snapshot_semantics() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("stream");

    for i in 0..3 {
        coll.insert_one(doc! { "i": i as i64 }).unwrap();
    }

    let cursor = coll.find(&doc! {}).unwrap();

    // Documents inserted after cursor creation are not observed.
    coll.insert_one(doc! { "i": 99i64 }).unwrap();
    // Documents deleted after cursor creation are skipped silently.
    coll.delete_one(&doc! { "i": 1i64 }).unwrap();
    // Contents of surviving documents are live at yield time.
    coll.update_one(&doc! { "i": 2i64 }, &doc! { "$set": doc! { "seen": true } })
        .unwrap();

    let docs = cursor.to_vec().unwrap();
    let is_: Vec<i64> = docs.iter().filter_map(|d| d.get("i")?.as_i64()).collect();
    assert_eq!(is_, vec![0, 2]);
    assert_eq!(docs[1].get("seen"), Some(&Value::Bool(true)));
}

#[test]
fn concurrent_increments_are_atomic() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 100;

    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("counters");
    coll.insert_one(doc! { "_id": "c", "v": 0i64 }).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let coll = coll.clone();
            scope.spawn(move || {
                for _ in 0..PER_THREAD {
                    coll.update_one(&doc! { "_id": "c" }, &doc! { "$inc": doc! { "v": 1i64 } })
                        .unwrap();
                }
            });
        }
    });

    let counter = coll.find_one(&doc! { "_id": "c" }).unwrap().unwrap();
    assert_eq!(
        counter.get("v"),
        Some(&Value::Int((THREADS * PER_THREAD) as i64))
    );
}

#[test]
fn distinct_and_projection() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("tagged");

    coll.insert_many(vec![
        doc! { "category": "A", "x": 1i64, "tags": vec!["red", "blue"] },
        doc! { "category": "B", "x": 2i64, "tags": vec!["red"] },
        doc! { "category": "A", "x": 3i64 },
    ])
    .unwrap();

    let categories = coll.distinct("category", &doc! {}).unwrap();
    assert_eq!(categories, vec![Value::from("A"), Value::from("B")]);

    // Arrays contribute their elements, first-seen order.
    let tags = coll.distinct("tags", &doc! {}).unwrap();
    assert_eq!(tags, vec![Value::from("red"), Value::from("blue")]);

    let projected = coll
        .find_with_options(
            &doc! {},
            FindOptions::new().projection(doc! { "category": 1i64, "_id": 0i64 }),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    assert!(projected
        .iter()
        .all(|d| d.contains_key("category") && !d.contains_key("_id") && !d.contains_key("x")));
}

#[test]
fn sort_skip_limit() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("values");

    // Insert out of order so the sort has real work.
    for i in [5i64, 1, 4, 0, 3, 2, 7, 6, 9, 8] {
        coll.insert_one(doc! { "value": i }).unwrap();
    }

    let docs = coll
        .find_with_options(
            &doc! {},
            FindOptions::new().sort("value", 1).skip(2).limit(3),
        )
        .unwrap()
        .to_vec()
        .unwrap();
    let values: Vec<i64> = docs.iter().filter_map(|d| d.get("value")?.as_i64()).collect();
    assert_eq!(values, vec![2, 3, 4]);
}

#[test]
fn replace_one_keeps_id() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("docs");

    coll.insert_one(doc! { "name": "alpha", "age": 30i64 }).unwrap();
    let original = coll.find_one(&doc! { "name": "alpha" }).unwrap().unwrap();
    let id = original.get("_id").cloned().unwrap();

    let result = coll
        .replace_one(&doc! { "name": "alpha" }, &doc! { "name": "beta", "age": 40i64 })
        .unwrap();
    assert_eq!(result.matched, 1);
    assert_eq!(result.modified, 1);

    let replaced = coll.find_one(&doc! { "name": "beta" }).unwrap().unwrap();
    assert_eq!(replaced.get("_id"), Some(&id));
    assert!(coll.find_one(&doc! { "name": "alpha" }).unwrap().is_none());
}

#[test]
fn bulk_write_ordered_stops_at_first_error() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("bulk");
    coll.create_index(
        &doc! { "k": 1i64 },
        IndexOptions {
            unique: true,
            ..IndexOptions::default()
        },
    )
    .unwrap();

    let ops = vec![
        WriteOp::InsertOne(doc! { "k": 1i64 }),
        WriteOp::InsertOne(doc! { "k": 1i64 }), // duplicate
        WriteOp::InsertOne(doc! { "k": 2i64 }),
    ];
    let result = coll.bulk_write(ops.clone(), true).unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].0, 1);
    assert_eq!(coll.count_documents(&doc! {}).unwrap(), 1);

    // Unordered continues past the failure.
    coll.drop().unwrap();
    let coll = store.db("test").collection("bulk");
    coll.create_index(
        &doc! { "k": 1i64 },
        IndexOptions {
            unique: true,
            ..IndexOptions::default()
        },
    )
    .unwrap();
    let result = coll.bulk_write(ops, false).unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn lookup_left_outer_join() {
    let store = MainyDb::open_in_memory();
    let db = store.db("test");

    let users = db.collection("users");
    users
        .insert_many(vec![
            doc! { "_id": "u1", "name": "Ada" },
            doc! { "_id": "u2", "name": "Bob" },
        ])
        .unwrap();

    let orders = db.collection("orders");
    orders
        .insert_many(vec![
            doc! { "user": "u1", "total": 10i64 },
            doc! { "user": "u1", "total": 20i64 },
        ])
        .unwrap();

    let out = users
        .aggregate(&[
            Value::Doc(doc! { "$lookup": doc! {
                "from": "orders",
                "localField": "_id",
                "foreignField": "user",
                "as": "orders",
            } }),
            Value::Doc(doc! { "$sort": doc! { "_id": 1i64 } }),
        ])
        .unwrap()
        .to_vec()
        .unwrap();

    let ada_orders = out[0].get("orders").and_then(Value::as_array).unwrap();
    assert_eq!(ada_orders.len(), 2);
    // Left join: unmatched users still appear, with an empty array.
    let bob_orders = out[1].get("orders").and_then(Value::as_array).unwrap();
    assert!(bob_orders.is_empty());
}

#[test]
fn unwind_then_count() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("posts");
    coll.insert_many(vec![
        doc! { "tags": vec!["a", "b"] },
        doc! { "tags": vec!["a"] },
        doc! { "no_tags": true },
    ])
    .unwrap();

    let out = coll
        .aggregate(&[
            Value::Doc(doc! { "$unwind": "$tags" }),
            Value::Doc(doc! { "$count": "tag_rows" }),
        ])
        .unwrap()
        .to_vec()
        .unwrap();
    assert_eq!(out, vec![doc! { "tag_rows": 3i64 }]);
}

#[test]
fn checkpoint_policy_by_op_count() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("auto.mdb");
    let config = Config::new()
        .checkpoint_ops(5)
        .checkpoint_interval(Duration::ZERO);

    let store = MainyDb::open_with_config(&path, config).unwrap();
    let coll = store.db("test").collection("docs");

    for i in 0..4 {
        coll.insert_one(doc! { "i": i as i64 }).unwrap();
    }
    // Below the threshold: nothing flushed yet.
    assert!(!path.exists());

    coll.insert_one(doc! { "i": 4i64 }).unwrap();
    // The fifth op crossed the threshold.
    assert!(path.exists());

    // A reader of the flushed file sees all five documents.
    let other = MainyDb::open(&path).unwrap();
    assert_eq!(
        other.db("test").collection("docs").count_documents(&doc! {}).unwrap(),
        5
    );
}

#[test]
fn encrypted_fields_roundtrip_through_collection() {
    use mainydb_core::{EncryptionConfig, EncryptionKey, FieldCrypto};

    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("secrets");
    let crypto = FieldCrypto::new(
        EncryptionConfig::new()
            .sha256_field("password")
            .aes256_field("email"),
        Some(EncryptionKey::from_bytes([3u8; 32])),
    )
    .unwrap();
    coll.set_encryption(crypto).unwrap();

    coll.insert_one(doc! { "name": "ada", "password": "pw", "email": "a@x" })
        .unwrap();

    // Reads decrypt cipher fields; hash fields stay structured records.
    let read = coll.find_one(&doc! { "name": "ada" }).unwrap().unwrap();
    assert_eq!(read.get("email"), Some(&Value::Text("a@x".into())));
    let password = read.get("password").unwrap().as_doc().unwrap();
    assert_eq!(
        password.get("algorithm"),
        Some(&Value::Text("sha256".into()))
    );
}

#[test]
fn media_eager_and_deferred() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("files");

    coll.insert_one(doc! { "_id": "f1", "payload": Value::Bytes(vec![9, 8, 7]) })
        .unwrap();

    let eager = coll.media(&Value::from("f1"), "payload").unwrap();
    assert_eq!(coll.fetch_media(&eager).unwrap(), vec![9, 8, 7]);

    let deferred = coll.media_deferred(&Value::from("f1"), "payload");
    assert_eq!(coll.fetch_media(&deferred).unwrap(), vec![9, 8, 7]);
    // Second fetch is served from the process-wide cache.
    assert_eq!(coll.fetch_media(&deferred).unwrap(), vec![9, 8, 7]);
}

#[test]
fn rename_and_stats() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("old_name");
    coll.insert_one(doc! { "x": 1i64 }).unwrap();

    coll.rename("new_name").unwrap();
    let renamed = store.db("test").collection("new_name");
    assert_eq!(renamed.count_documents(&doc! {}).unwrap(), 1);

    let stats = renamed.stats();
    assert_eq!(stats.get("count"), Some(&Value::Int(1)));
    assert_eq!(stats.get("collection"), Some(&Value::Text("new_name".into())));
}

#[test]
fn cancelled_cursor_stops() {
    let store = MainyDb::open_in_memory();
    let coll = store.db("test").collection("many");
    for i in 0..10 {
        coll.insert_one(doc! { "i": i as i64 }).unwrap();
    }

    let mut cursor = coll.find(&doc! {}).unwrap();
    let token = cursor.cancel_token();
    assert!(cursor.next().unwrap().is_ok());

    token.cancel();
    assert!(matches!(cursor.next(), Some(Err(EngineError::Cancelled))));
}
