mod common;

use common::recording_db;
use serde::{Deserialize, Serialize};
use structdb::{
    Database, DatabaseConfig, Document, IdType, MigrationOutcome, MigrationReport,
    MigrationStatus, StructureSchema,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Score {
    id: i64,
    points: i32,
}

impl Document for Score {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Score")
            .id("id", IdType::Identity)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GradedScore {
    id: i64,
    points: i32,
    #[serde(default)]
    grade: String,
}

impl Document for GradedScore {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("GradedScore")
            .id("id", IdType::Identity)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GuidScore {
    id: Option<Uuid>,
    points: i32,
}

impl Document for GuidScore {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("GuidScore")
            .id("id", IdType::Guid)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ticket {
    id: Option<Uuid>,
    seat: u32,
}

impl Document for Ticket {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Ticket")
            .id("id", IdType::Guid)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SeatedTicket {
    id: Option<Uuid>,
    seat: u32,
    #[serde(default)]
    row: String,
}

impl Document for SeatedTicket {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("SeatedTicket")
            .id("id", IdType::Guid)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersonV1 {
    id: String,
    name: String,
}

impl Document for PersonV1 {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Person")
            .id("id", IdType::Text)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersonV2 {
    id: String,
    name: String,
    #[serde(default)]
    initials: String,
}

impl Document for PersonV2 {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Person")
            .id("id", IdType::Text)
            .build()
    }
}

fn seed_scores(db: &Database, count: i32) {
    db.use_session(|session| {
        let mut scores: Vec<Score> = (0..count).map(|points| Score { id: 0, points }).collect();
        session.insert_many(&mut scores)
    })
    .expect("seed scores");
}

fn grade(points: i32) -> String {
    if points >= 900 { "A" } else { "B" }.to_string()
}

#[test]
fn moves_kept_items_and_drops_the_old_set() {
    common::init_tracing();
    let (db, engine) = recording_db(DatabaseConfig::default().with_migration_batch_size(500));
    seed_scores(&db, 1_000);
    engine.reset();

    let outcome = db
        .migrator()
        .migrate::<Score, GradedScore, _>(|old, new| {
            if old.points < 500 {
                return MigrationStatus::Trash;
            }
            new.grade = grade(old.points);
            MigrationStatus::Keep
        })
        .expect("migrate");
    assert_eq!(
        outcome,
        MigrationOutcome::Completed(MigrationReport {
            visited: 1_000,
            kept: 500,
            trashed: 500,
            batches: 2,
        })
    );
    assert_eq!(engine.interval_deletes(), vec![(1, 500), (501, 1_000)]);
    assert_eq!(engine.inserts(), vec![500]);
    assert!(!db.schemas().contains("Score"));

    let migrated = db
        .use_session(|session| session.get_all::<GradedScore>())
        .expect("read");
    assert_eq!(migrated.len(), 500);
    assert!(migrated.iter().all(|s| s.points >= 500));
    assert_eq!(migrated.iter().filter(|s| s.grade == "A").count(), 100);
    assert_eq!(migrated[0].id, 501);
    assert!(!db.structure_set_exists::<Score>().expect("exists"));
}

#[test]
fn abort_rolls_back_the_whole_migration() {
    common::init_tracing();
    let db = Database::builder()
        .config(DatabaseConfig::default().with_migration_batch_size(500))
        .build()
        .expect("db");
    seed_scores(&db, 1_000);

    let mut visited = 0;
    let outcome = db
        .migrator()
        .migrate::<Score, GradedScore, _>(|_, _| {
            visited += 1;
            if visited == 750 {
                MigrationStatus::Abort
            } else {
                MigrationStatus::Keep
            }
        })
        .expect("migrate");
    assert!(!outcome.is_completed());
    assert_eq!(outcome.report().visited, 750);
    assert_eq!(outcome.report().batches, 1);

    assert!(!db.schemas().contains("GradedScore"));
    assert!(!db.structure_set_exists::<GradedScore>().expect("exists"));
    let old = db
        .use_session(|session| session.count::<Score>())
        .expect("count");
    assert_eq!(old, 1_000);
}

#[test]
fn migrating_a_type_to_itself_is_rejected() {
    let db = Database::in_memory().expect("db");
    seed_scores(&db, 3);
    let err = db
        .migrator()
        .migrate::<Score, Score, _>(|_, _| MigrationStatus::Keep)
        .expect_err("same type");
    assert_eq!(err.code_str(), "validation");
}

#[test]
fn mismatched_id_types_are_rejected() {
    let db = Database::in_memory().expect("db");
    seed_scores(&db, 3);
    let err = db
        .migrator()
        .migrate::<Score, GuidScore, _>(|_, _| MigrationStatus::Keep)
        .expect_err("identity to guid");
    assert_eq!(err.code_str(), "validation");
    assert!(!db.schemas().contains("GuidScore"));
    assert_eq!(
        db.use_session(|session| session.count::<Score>())
            .expect("count"),
        3
    );
}

#[test]
fn changing_the_id_in_the_transform_fails_and_leaves_the_old_set() {
    let db = Database::in_memory().expect("db");
    seed_scores(&db, 10);
    let err = db
        .migrator()
        .migrate::<Score, GradedScore, _>(|old, new| {
            if old.points == 4 {
                new.id += 100;
            }
            MigrationStatus::Keep
        })
        .expect_err("id changed");
    assert_eq!(err.code_str(), "identity_mismatch");
    assert!(!db.structure_set_exists::<GradedScore>().expect("exists"));
    assert_eq!(
        db.use_session(|session| session.count::<Score>())
            .expect("count"),
        10
    );
}

#[test]
fn same_named_types_reshape_the_set_in_place() {
    let db = Database::in_memory().expect("db");
    db.use_session(|session| {
        let mut people = vec![
            PersonV1 {
                id: "ada".into(),
                name: "Ada Lovelace".into(),
            },
            PersonV1 {
                id: "alan".into(),
                name: "Alan Turing".into(),
            },
            PersonV1 {
                id: "grace".into(),
                name: "Grace Hopper".into(),
            },
        ];
        session.insert_many(&mut people)
    })
    .expect("seed people");

    let outcome = db
        .migrator()
        .migrate::<PersonV1, PersonV2, _>(|old, new| {
            new.initials = old
                .name
                .split_whitespace()
                .filter_map(|part| part.chars().next())
                .collect();
            MigrationStatus::Keep
        })
        .expect("migrate");
    assert_eq!(outcome.report().kept, 3);
    assert!(db.schemas().contains("Person"));

    let people = db
        .use_session(|session| session.get_all::<PersonV2>())
        .expect("read");
    let initials: Vec<_> = people.iter().map(|p| p.initials.as_str()).collect();
    assert_eq!(initials, vec!["AL", "AT", "GH"]);
}

#[test]
fn guid_ids_are_deleted_as_id_lists_per_batch() {
    let (db, engine) = recording_db(DatabaseConfig::default());
    db.use_session(|session| {
        let mut tickets: Vec<Ticket> = (1..=5).map(|seat| Ticket { id: None, seat }).collect();
        session.insert_many(&mut tickets)
    })
    .expect("seed tickets");
    engine.reset();

    let outcome = db
        .migrator()
        .with_batch_size(2)
        .migrate::<Ticket, SeatedTicket, _>(|old, new| {
            new.row = if old.seat <= 2 { "front" } else { "back" }.to_string();
            MigrationStatus::Keep
        })
        .expect("migrate");
    assert_eq!(outcome.report().batches, 3);
    assert_eq!(engine.deletes(), vec![2, 2, 1]);
    assert!(engine.interval_deletes().is_empty());

    let front = db
        .use_session(|session| session.query::<SeatedTicket, _>(|t| t.row == "front"))
        .expect("query");
    assert_eq!(front.len(), 2);
}

#[test]
fn failed_commit_cleans_up_like_any_other_failure() {
    let (db, engine) = recording_db(DatabaseConfig::default());
    seed_scores(&db, 10);
    engine.fail_next_commit();

    let err = db
        .migrator()
        .migrate::<Score, GradedScore, _>(|_, _| MigrationStatus::Keep)
        .expect_err("commit fails");
    assert_eq!(err.code_str(), "transaction");
    assert!(!db.schemas().contains("GradedScore"));
    assert!(db.schemas().contains("Score"));
    assert_eq!(engine.memory().held_row_locks(), 0);

    assert!(!db.structure_set_exists::<GradedScore>().expect("exists"));
    assert_eq!(
        db.use_session(|session| session.count::<Score>())
            .expect("count"),
        10
    );
}
