use super::{Database, DatabaseConfig, SessionEvent, SessionHook, SessionStatus, StoreError};
use crate::structure::{Document, IdType, StructureSchema};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: i64,
    text: String,
}

impl Document for Note {
    fn describe_schema() -> StructureSchema {
        StructureSchema::builder("Note")
            .id("id", IdType::Identity)
            .build()
    }
}

fn note(text: &str) -> Note {
    Note {
        id: 0,
        text: text.to_string(),
    }
}

#[derive(Default)]
struct RecordingHook {
    committed: Mutex<Vec<SessionEvent>>,
    rolled_back: Mutex<Vec<SessionEvent>>,
}

impl SessionHook for RecordingHook {
    fn on_committed(&self, event: &SessionEvent) {
        self.committed
            .lock()
            .expect("recording hook mutex poisoned")
            .push(event.clone());
    }

    fn on_rolled_back(&self, event: &SessionEvent) {
        self.rolled_back
            .lock()
            .expect("recording hook mutex poisoned")
            .push(event.clone());
    }
}

struct PanickingHook;

impl SessionHook for PanickingHook {
    fn on_committed(&self, _event: &SessionEvent) {
        panic!("hook failure");
    }
}

#[test]
fn builder_rejects_invalid_config() {
    let err = Database::builder()
        .config(DatabaseConfig::default().with_read_page_size(0))
        .build()
        .err()
        .expect("invalid config");
    assert_eq!(err.code_str(), "invalid_config");
}

#[test]
fn use_session_commits_on_ok() {
    let db = Database::in_memory().expect("db");
    let id = db
        .use_session(|session| {
            let mut item = note("first");
            session.insert(&mut item)?;
            Ok(item.id)
        })
        .expect("commit");
    assert_eq!(id, 1);

    let stored = db
        .use_session(|session| session.get_by_id::<Note>(id))
        .expect("read");
    assert_eq!(stored.map(|n| n.text), Some("first".to_string()));
    assert!(db.structure_set_exists::<Note>().expect("exists"));
}

#[test]
fn use_session_rolls_back_on_err() {
    let db = Database::in_memory().expect("db");
    let err = db
        .use_session(|session| -> Result<(), StoreError> {
            session.insert(&mut note("lost"))?;
            Err(StoreError::Validation("caller bailed out".into()))
        })
        .expect_err("work failed");
    assert_eq!(err.code_str(), "validation");
    assert!(!db.structure_set_exists::<Note>().expect("exists"));
}

#[test]
fn use_session_reports_failure_marked_without_error() {
    let db = Database::in_memory().expect("db");
    let err = db
        .use_session(|session| {
            session.insert(&mut note("half done"))?;
            session.mark_as_failed();
            Ok(())
        })
        .expect_err("disposed with failure");
    assert_eq!(err.code_str(), "transaction");
    assert_eq!(
        db.use_session(|session| session.count::<Note>())
            .expect("count"),
        0
    );
}

#[test]
fn hooks_see_commit_and_rollback_and_survive_panics() {
    let db = Database::in_memory().expect("db");
    let recorder = Arc::new(RecordingHook::default());
    let recorder_hook: Arc<dyn SessionHook> = recorder.clone();
    db.add_session_hook(Arc::new(PanickingHook));
    db.add_session_hook(Arc::clone(&recorder_hook));

    db.use_session(|session| session.insert(&mut note("a")))
        .expect("commit");
    let mut session = db.begin_session().expect("session");
    session.insert(&mut note("b")).expect("insert");
    session.abort();
    assert_eq!(session.dispose().expect("dispose"), SessionStatus::Disposed);

    {
        let committed = recorder.committed.lock().expect("lock");
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].structure_sets, vec!["Note".to_string()]);
        assert_eq!(recorder.rolled_back.lock().expect("lock").len(), 1);
    }

    db.remove_session_hook(&recorder_hook);
    db.use_session(|session| session.insert(&mut note("c")))
        .expect("commit");
    assert_eq!(recorder.committed.lock().expect("lock").len(), 1);
}

#[test]
fn dropping_a_structure_set_forgets_its_schema() {
    let db = Database::in_memory().expect("db");
    db.upsert_structure_set::<Note>().expect("upsert");
    assert!(db.schemas().contains("Note"));
    db.drop_structure_set::<Note>().expect("drop");
    assert!(!db.schemas().contains("Note"));
    assert!(!db.structure_set_exists::<Note>().expect("exists"));
}

#[test]
fn undisposed_session_rolls_back_on_drop() {
    let db = Database::in_memory().expect("db");
    {
        let mut session = db.begin_session().expect("session");
        session.insert(&mut note("dropped")).expect("insert");
    }
    assert!(!db.structure_set_exists::<Note>().expect("exists"));
}
