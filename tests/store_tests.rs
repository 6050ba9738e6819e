//! Behavioural suite shared by every `ExperimentStore` implementation.
//! Each test runs once per backend.

use std::sync::Arc;

use ab_engine::engine::model::{Completion, ResultEvent};
use ab_engine::ExperimentStatus::{Active, Cancelled, Completed, Paused};
use ab_engine::{
    Arm, EngineError, Experiment, ExperimentFilter, ExperimentStatus, ExperimentStore,
    InMemoryStore, SqliteStore, TrafficSplit,
};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
    SqliteFile,
}

impl Backend {
    /// The `TempDir`, when present, must outlive the store.
    fn open(self) -> (Arc<dyn ExperimentStore>, Option<TempDir>) {
        match self {
            Backend::Memory => (Arc::new(InMemoryStore::new()), None),
            Backend::Sqlite => (Arc::new(SqliteStore::memory().unwrap()), None),
            Backend::SqliteFile => {
                let dir = tempfile::tempdir().unwrap();
                let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
                (Arc::new(store), Some(dir))
            }
        }
    }
}

fn experiment(id: &str, site: &str, kind: &str, start: u64) -> Experiment {
    Experiment {
        id: id.into(),
        site_id: site.into(),
        name: format!("experiment {id}"),
        kind: kind.into(),
        control_content: json!({"headline": "Build your site", "cta": ["Start", 1]}),
        variant_content: json!("Launch in minutes"),
        traffic_split: TrafficSplit::new(70, 30),
        start_date: start,
        end_date: None,
        status: Active,
        winner: None,
        confidence_level: None,
        statistical_significance: None,
        improvement_percentage: None,
        control_visitors: 0,
        variant_visitors: 0,
        control_conversions: 0,
        variant_conversions: 0,
    }
}

fn event(id: &str, visitor: &str, arm: Arm, converted: bool) -> ResultEvent {
    ResultEvent {
        experiment_id: id.into(),
        visitor_id: visitor.into(),
        session_id: "sess".into(),
        arm,
        converted,
        conversion_value: 12.5,
        recorded_at: 1_700_000_000_000,
    }
}

const OPEN: &[ExperimentStatus] = &[Active, Paused];

fn completion() -> Completion {
    Completion {
        winner: Arm::Variant,
        confidence_level: 97.5,
        statistical_significance: 0.025,
        improvement_percentage: 31.0,
        end_date: 1_700_000_500_000,
    }
}

#[rstest]
fn test_roundtrip_preserves_fields(
    #[values(Backend::Memory, Backend::Sqlite, Backend::SqliteFile)] backend: Backend,
) {
    let (store, _dir) = backend.open();
    let e = experiment("e1", "s1", "headline", 42);
    store.insert_experiment(&e).unwrap();
    assert_eq!(store.get_experiment("e1").unwrap(), Some(e));
    assert_eq!(store.get_experiment("nope").unwrap(), None);
}

#[rstest]
fn test_duplicate_insert_fails(#[values(Backend::Memory, Backend::Sqlite)] backend: Backend) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();
    let err = store.insert_experiment(&experiment("e1", "s2", "general", 2)).unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
}

#[rstest]
fn test_list_order_and_filters(#[values(Backend::Memory, Backend::Sqlite)] backend: Backend) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("old", "s1", "headline", 10)).unwrap();
    store.insert_experiment(&experiment("tie-a", "s1", "cta", 20)).unwrap();
    store.insert_experiment(&experiment("tie-b", "s1", "headline", 20)).unwrap();
    store.insert_experiment(&experiment("other", "s2", "headline", 30)).unwrap();
    store.update_status("old", Active, Paused, None).unwrap();

    let ids = |filter: ExperimentFilter| -> Vec<String> {
        store.list_experiments(&filter).unwrap().into_iter().map(|e| e.id).collect()
    };
    assert_eq!(ids(ExperimentFilter::default()), vec!["other", "tie-b", "tie-a", "old"]);
    assert_eq!(ids(ExperimentFilter::site("s1")), vec!["tie-b", "tie-a", "old"]);
    assert_eq!(
        ids(ExperimentFilter::site("s1").with_status(Active)),
        vec!["tie-b", "tie-a"]
    );
    assert_eq!(
        ids(ExperimentFilter::site("s1").with_kind(Some("headline".into()))),
        vec!["tie-b", "old"]
    );
    assert!(ids(ExperimentFilter::site("s3")).is_empty());
}

#[rstest]
fn test_update_status_compare_and_swap(
    #[values(Backend::Memory, Backend::Sqlite)] backend: Backend,
) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();

    assert!(store.update_status("e1", Active, Paused, None).unwrap());
    assert!(!store.update_status("e1", Active, Cancelled, Some(5)).unwrap());
    assert!(store.update_status("e1", Paused, Cancelled, Some(5)).unwrap());

    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!(e.status, Cancelled);
    assert_eq!(e.end_date, Some(5));

    let err = store.update_status("nope", Active, Paused, None).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[rstest]
fn test_complete_is_conditional(#[values(Backend::Memory, Backend::Sqlite)] backend: Backend) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("done", "s1", "general", 1)).unwrap();
    store.insert_experiment(&experiment("gone", "s1", "general", 1)).unwrap();
    store.update_status("gone", Active, Cancelled, Some(3)).unwrap();

    assert!(store.complete_experiment("done", OPEN, &completion()).unwrap());
    assert!(!store.complete_experiment("done", OPEN, &completion()).unwrap());
    assert!(!store.complete_experiment("gone", OPEN, &completion()).unwrap());

    let done = store.get_experiment("done").unwrap().unwrap();
    assert_eq!(done.status, Completed);
    assert_eq!(done.winner, Some(Arm::Variant));
    assert_eq!(done.confidence_level, Some(97.5));
    assert_eq!(done.statistical_significance, Some(0.025));
    assert_eq!(done.improvement_percentage, Some(31.0));
    assert_eq!(done.end_date, Some(1_700_000_500_000));

    let gone = store.get_experiment("gone").unwrap().unwrap();
    assert_eq!(gone.status, Cancelled);
    assert_eq!(gone.winner, None);
}

#[rstest]
fn test_complete_respects_allowed_statuses(
    #[values(Backend::Memory, Backend::Sqlite)] backend: Backend,
) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();
    store.update_status("e1", Active, Paused, None).unwrap();

    assert!(!store.complete_experiment("e1", &[Active], &completion()).unwrap());
    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!(e.status, Paused);
    assert_eq!((e.winner, e.end_date), (None, None));

    assert!(store.complete_experiment("e1", OPEN, &completion()).unwrap());
    assert_eq!(store.get_experiment("e1").unwrap().unwrap().status, Completed);

    let err = store.complete_experiment("nope", OPEN, &completion()).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[rstest]
fn test_assign_if_absent(#[values(Backend::Memory, Backend::Sqlite)] backend: Backend) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();

    let first = store.assign_if_absent("e1", "visitor-😀", Arm::Control, 100).unwrap().unwrap();
    assert!(first.created);
    let again = store.assign_if_absent("e1", "visitor-😀", Arm::Variant, 200).unwrap().unwrap();
    assert!(!again.created);
    assert_eq!(again.assignment, first.assignment);
    assert_eq!(store.get_assignment("e1", "visitor-😀").unwrap(), Some(first.assignment));
    assert_eq!(store.get_assignment("e1", "stranger").unwrap(), None);

    store.assign_if_absent("e1", "other", Arm::Variant, 300).unwrap();
    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!((e.control_visitors, e.variant_visitors), (1, 1));

    let err = store.assign_if_absent("nope", "v", Arm::Control, 0).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[rstest]
fn test_assign_requires_active_for_new_visitors(
    #[values(Backend::Memory, Backend::Sqlite)] backend: Backend,
) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();
    store.assign_if_absent("e1", "returning", Arm::Variant, 1).unwrap();
    store.update_status("e1", Active, Paused, None).unwrap();

    assert!(store.assign_if_absent("e1", "newcomer", Arm::Control, 2).unwrap().is_none());
    let returning = store.assign_if_absent("e1", "returning", Arm::Control, 2).unwrap().unwrap();
    assert_eq!(returning.assignment.arm, Arm::Variant);

    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!(e.control_visitors + e.variant_visitors, 1);
}

#[rstest]
fn test_concurrent_assign_counts_once(
    #[values(Backend::Memory, Backend::Sqlite, Backend::SqliteFile)] backend: Backend,
) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();

    let created: usize = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                (0..20)
                    .filter_map(|_| store.assign_if_absent("e1", "same", Arm::Control, 1).unwrap())
                    .filter(|outcome| outcome.created)
                    .count()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .sum();

    assert_eq!(created, 1);
    assert_eq!(store.get_experiment("e1").unwrap().unwrap().control_visitors, 1);
}

#[rstest]
fn test_record_result_caps_and_freezes(
    #[values(Backend::Memory, Backend::Sqlite)] backend: Backend,
) {
    let (store, _dir) = backend.open();
    store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();

    // No visitors yet: appended, not counted.
    assert!(!store.record_result(&event("e1", "a", Arm::Control, true)).unwrap().counted);
    store.assign_if_absent("e1", "a", Arm::Control, 1).unwrap();
    assert!(store.record_result(&event("e1", "a", Arm::Control, true)).unwrap().counted);
    assert!(!store.record_result(&event("e1", "a", Arm::Control, true)).unwrap().counted);
    assert!(!store.record_result(&event("e1", "a", Arm::Control, false)).unwrap().counted);

    store.assign_if_absent("e1", "b", Arm::Variant, 1).unwrap();
    store.complete_experiment("e1", OPEN, &completion()).unwrap();
    assert!(!store.record_result(&event("e1", "b", Arm::Variant, true)).unwrap().counted);

    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!((e.control_conversions, e.variant_conversions), (1, 0));

    let events = store.results_for("e1").unwrap();
    assert_eq!(events.len(), 5);
    assert_eq!(events[0], event("e1", "a", Arm::Control, true));
    assert!(!events[3].converted);
    assert_eq!(events[4].arm, Arm::Variant);
    assert!(store.results_for("unknown").unwrap().is_empty());

    let err = store.record_result(&event("nope", "a", Arm::Control, true)).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[test]
fn test_sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ab.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_experiment(&experiment("e1", "s1", "general", 1)).unwrap();
        store.assign_if_absent("e1", "v", Arm::Variant, 9).unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!(e.variant_visitors, 1);
    assert_eq!(store.get_assignment("e1", "v").unwrap().unwrap().assigned_at, 9);
}
