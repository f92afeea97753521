use chrono::{FixedOffset, NaiveTime, TimeZone};
use healthsync_core::{
    ConflictFinding, ConflictSeverity, Doctor, FetchOptions, FixedMemoryProbe, ManualClock,
    Medication, MutationService, Record, RecordBody, RecordKey, RecordKind, ScheduleSlot,
    SharedStoreAccessor, SlotCompletion, StoreConfig, StoreError, StoreHandle, SyncState,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    mutations: MutationService,
    accessor: SharedStoreAccessor,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::for_container(dir.path());
    let store = Arc::new(StoreHandle::new(&config));
    store.initialize().await;

    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let mutations = MutationService::new(Arc::clone(&store)).with_clock(clock.clone());
    let accessor = SharedStoreAccessor::new(store, Arc::new(FixedMemoryProbe::new(0)), &config);
    Fixture {
        _dir: dir,
        clock,
        mutations,
        accessor,
    }
}

fn slot(hour: u32, minute: u32) -> ScheduleSlot {
    ScheduleSlot::at(hour, minute).unwrap()
}

fn medication(owner: &str, id: &str, slots: Vec<ScheduleSlot>) -> Record {
    Record::with_id(
        id,
        owner,
        RecordBody::Medication(Medication {
            name: "Lisinopril".to_string(),
            dosage: "10mg".to_string(),
            instructions: None,
            slots,
        }),
    )
}

fn body_slots(record: &Record) -> Vec<ScheduleSlot> {
    record.body.slots().unwrap().to_vec()
}

#[tokio::test]
async fn save_stamps_record_and_marks_it_pending() {
    let fx = fixture().await;

    let saved = fx
        .mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap();

    assert_eq!(saved.last_modified_ms, 1_700_000_000_000);
    assert_eq!(saved.sync_state, SyncState::PendingPush);

    let loaded = fx
        .accessor
        .fetch_one(RecordKey::new(RecordKind::Medication, "m1"), "u1", false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*loaded, saved);
}

#[tokio::test]
async fn repeated_saves_within_one_millisecond_still_advance_the_stamp() {
    let fx = fixture().await;

    let first = fx
        .mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap();
    let second = fx
        .mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap();

    assert!(second.last_modified_ms > first.last_modified_ms);
}

#[tokio::test]
async fn completing_at_0807_marks_the_0805_slot() {
    let fx = fixture().await;
    let mut done = slot(8, 0);
    done.complete(1);
    fx.mutations
        .save(medication("u1", "m1", vec![done, slot(8, 5), slot(20, 0)]))
        .await
        .unwrap();
    fx.clock.advance(60_000);

    let at = FixedOffset::east_opt(2 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 5, 1, 8, 7, 0)
        .unwrap();
    let completion = fx
        .mutations
        .mark_slot_completed(RecordKind::Medication, "u1", "m1", at)
        .await
        .unwrap();

    let SlotCompletion::Completed { slot: marked, record } = completion else {
        panic!("expected a completed slot");
    };
    assert_eq!(marked.time, NaiveTime::from_hms_opt(8, 5, 0).unwrap());
    assert_eq!(marked.completed_at_ms, Some(at.timestamp_millis()));
    assert!(record.is_pending());

    let stored = fx
        .accessor
        .fetch_one(RecordKey::new(RecordKind::Medication, "m1"), "u1", false)
        .await
        .unwrap()
        .unwrap();
    let slots = body_slots(&stored);
    assert!(slots[0].completed);
    assert!(slots[1].completed);
    assert!(!slots[2].completed);
}

#[tokio::test]
async fn completing_when_every_slot_is_done_is_a_no_op() {
    let fx = fixture().await;
    let mut only = slot(9, 0);
    only.complete(1);
    let saved = fx
        .mutations
        .save(medication("u1", "m1", vec![only]))
        .await
        .unwrap();
    fx.clock.advance(1_000);

    let at = FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2024, 5, 1, 9, 0, 0)
        .unwrap();
    let completion = fx
        .mutations
        .mark_slot_completed(RecordKind::Medication, "u1", "m1", at)
        .await
        .unwrap();
    assert_eq!(completion, SlotCompletion::NoIncompleteSlot);

    let stored = fx
        .accessor
        .fetch_one(RecordKey::new(RecordKind::Medication, "m1"), "u1", false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_modified_ms, saved.last_modified_ms);
}

#[tokio::test]
async fn slot_completion_requires_a_scheduled_kind() {
    let fx = fixture().await;
    let at = FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2024, 5, 1, 9, 0, 0)
        .unwrap();

    let err = fx
        .mutations
        .mark_slot_completed(RecordKind::Doctor, "u1", "d1", at)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ValidationFailed(_)));
}

#[tokio::test]
async fn soft_delete_keeps_row_visible_to_include_deleted_reads() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap();
    fx.clock.advance(10);

    fx.mutations
        .soft_delete(RecordKind::Medication, "u1", "m1")
        .await
        .unwrap();

    let active = fx
        .accessor
        .fetch_active(RecordKind::Medication, "u1", None)
        .await
        .unwrap();
    assert!(active.is_empty());

    let all = fx
        .accessor
        .fetch_all(
            RecordKind::Medication,
            "u1",
            FetchOptions {
                include_deleted: true,
                limit: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_deleted);
    assert!(all[0].is_pending());
}

#[tokio::test]
async fn deleted_record_is_not_written_back_to_life() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", vec![slot(8, 0)]))
        .await
        .unwrap();
    fx.clock.advance(10);
    fx.mutations
        .soft_delete(RecordKind::Medication, "u1", "m1")
        .await
        .unwrap();

    let updated = fx
        .mutations
        .update(medication("u1", "m1", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(updated, StoreError::RecordNotFound(_)));

    let saved = fx
        .mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(saved, StoreError::RecordNotFound(_)));

    let at = FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2026, 1, 5, 8, 0, 0)
        .unwrap();
    let completed = fx
        .mutations
        .mark_slot_completed(RecordKind::Medication, "u1", "m1", at)
        .await
        .unwrap_err();
    assert!(matches!(completed, StoreError::RecordNotFound(_)));

    let tombstone = fx
        .accessor
        .fetch_one(RecordKey::new(RecordKind::Medication, "m1"), "u1", true)
        .await
        .unwrap()
        .unwrap();
    assert!(tombstone.is_deleted);
}

#[tokio::test]
async fn soft_delete_of_unknown_or_foreign_record_is_not_found() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap();

    let missing = fx
        .mutations
        .soft_delete(RecordKind::Medication, "u1", "nope")
        .await
        .unwrap_err();
    assert!(matches!(missing, StoreError::RecordNotFound(_)));

    let foreign = fx
        .mutations
        .soft_delete(RecordKind::Medication, "u2", "m1")
        .await
        .unwrap_err();
    assert!(matches!(foreign, StoreError::RecordNotFound(_)));
}

#[tokio::test]
async fn owner_of_existing_record_cannot_change() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap();

    let err = fx
        .mutations
        .save(medication("u2", "m1", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ValidationFailed(_)));

    let still_u1 = fx
        .accessor
        .fetch_one(RecordKey::new(RecordKind::Medication, "m1"), "u1", false)
        .await
        .unwrap();
    assert!(still_u1.is_some());
}

#[tokio::test]
async fn update_requires_existing_record() {
    let fx = fixture().await;

    let err = fx
        .mutations
        .update(medication("u1", "m1", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RecordNotFound(_)));

    fx.mutations
        .save(medication("u1", "m1", vec![]))
        .await
        .unwrap();
    let mut changed = medication("u1", "m1", vec![slot(7, 30)]);
    changed.body = RecordBody::Medication(Medication {
        name: "Lisinopril".to_string(),
        dosage: "20mg".to_string(),
        instructions: Some("morning".to_string()),
        slots: vec![slot(7, 30)],
    });
    let updated = fx.mutations.update(changed).await.unwrap();
    let RecordBody::Medication(body) = &updated.body else {
        panic!("expected medication body");
    };
    assert_eq!(body.dosage, "20mg");
}

#[tokio::test]
async fn invalid_records_are_rejected_before_io() {
    let fx = fixture().await;

    let blank_name = Record::with_id(
        "d1",
        "u1",
        RecordBody::Doctor(Doctor {
            name: "  ".to_string(),
            specialty: None,
            phone: None,
            email: None,
        }),
    );
    assert!(matches!(
        fx.mutations.save(blank_name).await,
        Err(StoreError::ValidationFailed(_))
    ));

    let blank_owner = medication(" ", "m1", vec![]);
    assert!(matches!(
        fx.mutations.save(blank_owner).await,
        Err(StoreError::ValidationFailed(_))
    ));
}

#[tokio::test]
async fn conflict_findings_are_persisted_with_generated_ids() {
    let fx = fixture().await;

    let saved = fx
        .mutations
        .record_conflict_finding(
            "u1",
            ConflictFinding {
                items: vec!["Warfarin".to_string(), "Ginkgo".to_string()],
                severity: ConflictSeverity::High,
                findings: vec!["bleeding risk".to_string()],
                recommendations: vec!["ask your doctor".to_string()],
                confidence: 0.9,
            },
        )
        .await
        .unwrap();
    assert!(!saved.id.is_empty());

    let out_of_range = fx
        .mutations
        .record_conflict_finding(
            "u1",
            ConflictFinding {
                items: vec!["A".to_string()],
                severity: ConflictSeverity::Low,
                findings: vec![],
                recommendations: vec![],
                confidence: 1.5,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(out_of_range, StoreError::ValidationFailed(_)));

    let stored = fx
        .accessor
        .fetch_active(RecordKind::ConflictFinding, "u1", None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}
