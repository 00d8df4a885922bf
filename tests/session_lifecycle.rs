mod common;

use common::{Call, Product, recording_db, seed_products};
use std::panic::{AssertUnwindSafe, catch_unwind};
use structdb::{Database, DatabaseConfig, SessionStatus, StructureId};

#[test]
fn first_error_fails_the_session_and_later_calls_never_reach_the_store() {
    common::init_tracing();
    let (db, engine) = recording_db(DatabaseConfig::default());
    let ids = seed_products(&db, 3);

    let mut session = db.begin_session().expect("session");
    session
        .insert(&mut Product::new("pending", 1))
        .expect("insert");

    let mut ghost = Product::new("ghost", 5);
    ghost.id = 999;
    let err = session.update(&mut ghost).expect_err("missing row");
    assert_eq!(err.code_str(), "not_found_for_update");
    assert!(err.is_caller_recoverable());
    assert_eq!(session.status(), SessionStatus::Failed);

    let calls_before = engine.calls().len();
    let err = session
        .get_by_id::<Product>(ids[0])
        .expect_err("failed session");
    assert_eq!(err.code_str(), "session_already_failed");
    let err = session
        .insert(&mut Product::new("late", 2))
        .expect_err("failed session");
    assert_eq!(err.code_str(), "session_already_failed");
    assert_eq!(engine.calls().len(), calls_before);

    assert_eq!(
        session.dispose().expect("dispose"),
        SessionStatus::DisposedWithFailure
    );
    assert_eq!(engine.calls().last(), Some(&Call::Rollback));

    let count = db
        .use_session(|session| session.count::<Product>())
        .expect("count");
    assert_eq!(count, 3);
}

#[test]
fn disposing_twice_is_an_error_and_disposed_sessions_refuse_work() {
    let db = Database::in_memory().expect("db");
    let mut session = db.begin_session().expect("session");
    session
        .insert(&mut Product::new("kept", 10))
        .expect("insert");
    assert_eq!(session.dispose().expect("dispose"), SessionStatus::Disposed);

    let err = session.dispose().expect_err("second dispose");
    assert_eq!(err.code_str(), "session_already_disposed");

    let err = session.count::<Product>().expect_err("disposed");
    assert_eq!(err.code_str(), "session_disposed");
    assert_eq!(session.status(), SessionStatus::Disposed);

    let stored = db
        .use_session(|session| session.get_all::<Product>())
        .expect("read");
    assert_eq!(stored.len(), 1);
}

#[test]
fn aborted_session_turns_operations_into_no_ops_and_rolls_back() {
    let db = Database::in_memory().expect("db");
    seed_products(&db, 2);

    let mut session = db.begin_session().expect("session");
    session
        .insert(&mut Product::new("before abort", 1))
        .expect("insert");
    session.abort();
    assert!(session.is_aborted());

    session
        .insert(&mut Product::new("after abort", 2))
        .expect("no-op insert");
    assert_eq!(session.count::<Product>().expect("no-op count"), 0);
    assert_eq!(session.get_by_id::<Product>(1_i64).expect("no-op read"), None);
    assert_eq!(session.status(), SessionStatus::Active);

    assert_eq!(session.dispose().expect("dispose"), SessionStatus::Disposed);
    let count = db
        .use_session(|session| session.count::<Product>())
        .expect("count");
    assert_eq!(count, 2);
}

#[test]
fn panicking_modifier_fails_the_session() {
    let db = Database::in_memory().expect("db");
    let ids = seed_products(&db, 1);

    let mut session = db.begin_session().expect("session");
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        session.update_by_id::<Product, _>(ids[0], |_| panic!("modifier blew up"))
    }));
    assert!(outcome.is_err());
    assert_eq!(session.status(), SessionStatus::Failed);
    assert_eq!(
        session.dispose().expect("dispose"),
        SessionStatus::DisposedWithFailure
    );

    let stored = db
        .use_session(|session| session.get_by_id::<Product>(ids[0]))
        .expect("read")
        .expect("still stored");
    assert_eq!(stored.name, "product-0");
}

#[test]
fn writes_are_visible_to_their_session_and_hidden_from_others_until_commit() {
    let db = Database::in_memory().expect("db");
    let ids = seed_products(&db, 1);

    let mut writer = db.begin_session().expect("writer");
    writer
        .update_by_id::<Product, _>(ids[0], |p| p.price_cents = 4_200)
        .expect("update");
    let own = writer
        .get_by_id::<Product>(ids[0])
        .expect("read")
        .expect("present");
    assert_eq!(own.price_cents, 4_200);

    let mut reader = db.begin_session().expect("reader");
    let other = reader
        .get_by_id::<Product>(ids[0])
        .expect("read")
        .expect("present");
    assert_eq!(other.price_cents, 0);
    reader.dispose().expect("dispose reader");

    writer.dispose().expect("dispose writer");
    let committed = db
        .use_session(|session| session.get_by_id::<Product>(ids[0]))
        .expect("read")
        .expect("present");
    assert_eq!(committed.price_cents, 4_200);
}

#[test]
fn reads_cover_ids_intervals_queries_and_existence() {
    let db = Database::in_memory().expect("db");
    let ids = seed_products(&db, 6);

    db.use_session(|session| {
        let picked = session.get_by_ids::<Product>(&[
            StructureId::from(ids[4]),
            StructureId::from(404_i64),
            StructureId::from(ids[1]),
        ])?;
        let names: Vec<_> = picked.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["product-4", "product-1"]);

        let range = session.get_by_id_interval::<Product>(ids[1], ids[3])?;
        assert_eq!(range.len(), 3);

        let pricey = session.query::<Product, _>(|p| p.price_cents >= 300)?;
        assert_eq!(pricey.len(), 3);
        let first = session.query_first::<Product, _>(|p| p.price_cents >= 300)?;
        assert_eq!(first.map(|p| p.id), Some(ids[3]));

        assert!(session.exists::<Product>(ids[5])?);
        assert!(!session.exists::<Product>(404_i64)?);
        Ok(())
    })
    .expect("reads");
}

#[test]
fn deletes_by_query_interval_and_clear() {
    let db = Database::in_memory().expect("db");
    let ids = seed_products(&db, 10);

    let deleted = db
        .use_session(|session| session.delete_by_query::<Product, _>(|p| p.price_cents < 300))
        .expect("delete by query");
    assert_eq!(deleted, 3);

    db.use_session(|session| session.delete_by_id_interval::<Product>(ids[3], ids[5]))
        .expect("delete interval");
    let left: Vec<i64> = db
        .use_session(|session| session.get_all::<Product>())
        .expect("read")
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(left, ids[6..].to_vec());

    db.use_session(|session| session.clear::<Product>())
        .expect("clear");
    assert_eq!(
        db.use_session(|session| session.count::<Product>())
            .expect("count"),
        0
    );
}

#[test]
fn interval_reads_on_guid_ids_are_unsupported() {
    let db = Database::in_memory().expect("db");
    let mut session = db.begin_session().expect("session");
    let err = session
        .get_by_id_interval::<common::Customer>(1, 10)
        .expect_err("guid ids");
    assert_eq!(err.code_str(), "unsupported_by_store");
    assert_eq!(session.status(), SessionStatus::Failed);
}

#[test]
fn unique_members_reject_duplicates() {
    let db = Database::in_memory().expect("db");
    db.use_session(|session| session.insert(&mut common::Customer::new("a@x.io", "Ann")))
        .expect("first");
    let err = db
        .use_session(|session| session.insert(&mut common::Customer::new("a@x.io", "Other")))
        .expect_err("duplicate email");
    assert_eq!(err.code_str(), "unique_violation");
}
