use async_trait::async_trait;
use healthsync_core::sync::remote::RemoteResult;
use healthsync_core::{
    Doctor, FileSharedContext, FixedMemoryProbe, InMemoryRemote, ManualClock, Medication,
    MutationService, PushAck, ReconciliationEngine, Record, RecordBody, RecordKey, RecordKind,
    RemoteRecord, RemoteStore, SharedContext, SharedStoreAccessor, StoreConfig, StoreHandle,
    SyncState,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const START_MS: i64 = 1_700_000_000_000;

struct Fixture {
    dir: TempDir,
    config: StoreConfig,
    store: Arc<StoreHandle>,
    clock: Arc<ManualClock>,
    remote: Arc<InMemoryRemote>,
    mutations: MutationService,
    accessor: SharedStoreAccessor,
}

impl Fixture {
    fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(Arc::clone(&self.store), self.remote.clone(), &self.config)
            .with_clock(self.clock.clone())
    }

    async fn local(&self, kind: RecordKind, owner: &str, id: &str) -> Option<Record> {
        self.accessor
            .fetch_one(RecordKey::new(kind, id), owner, true)
            .await
            .unwrap()
            .map(|snapshot| snapshot.into_inner())
    }
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::for_container(dir.path());
    let store = Arc::new(StoreHandle::new(&config));
    store.initialize().await;

    let clock = Arc::new(ManualClock::new(START_MS));
    Fixture {
        mutations: MutationService::new(Arc::clone(&store)).with_clock(clock.clone()),
        accessor: SharedStoreAccessor::new(
            Arc::clone(&store),
            Arc::new(FixedMemoryProbe::new(0)),
            &config,
        ),
        remote: Arc::new(InMemoryRemote::new()),
        dir,
        config,
        store,
        clock,
    }
}

fn medication(owner: &str, id: &str, name: &str) -> Record {
    Record::with_id(
        id,
        owner,
        RecordBody::Medication(Medication {
            name: name.to_string(),
            dosage: "5mg".to_string(),
            instructions: None,
            slots: vec![],
        }),
    )
}

fn remote_doctor(owner: &str, id: &str, name: &str, stamp: i64, deleted: bool) -> RemoteRecord {
    RemoteRecord {
        id: id.to_string(),
        owner_id: owner.to_string(),
        body: RecordBody::Doctor(Doctor {
            name: name.to_string(),
            specialty: None,
            phone: None,
            email: None,
        }),
        last_modified_ms: stamp,
        is_deleted: deleted,
        change_seq: 0,
    }
}

#[tokio::test]
async fn pending_record_is_pushed_and_next_pass_scans_nothing() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", "Metformin"))
        .await
        .unwrap();
    assert!(fx
        .local(RecordKind::Medication, "u1", "m1")
        .await
        .unwrap()
        .is_pending());

    let report = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.pushed, 1);
    assert!(report.is_clean());
    assert!(report.first_error().is_none());

    let local = fx.local(RecordKind::Medication, "u1", "m1").await.unwrap();
    assert_eq!(local.sync_state, SyncState::Synced);
    assert!(fx.remote.get(RecordKind::Medication, "u1", "m1").is_some());

    let again = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(again.scanned, 0);
    assert_eq!(fx.remote.upsert_calls(), 1);
}

#[tokio::test]
async fn pushing_the_same_record_twice_keeps_one_remote_copy() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", "Metformin"))
        .await
        .unwrap();
    fx.engine().reconcile("u1").await.unwrap();

    // Acknowledgment lost: the row is pending again with the same version.
    fx.store
        .run("lose_ack", |conn| {
            conn.execute(
                "UPDATE records SET sync_state = 'pending_push' WHERE id = 'm1';",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let report = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(fx.remote.upsert_calls(), 2);
    assert_eq!(fx.remote.len(), 1);
}

#[tokio::test]
async fn one_failure_does_not_abort_the_batch() {
    let fx = fixture().await;
    for id in ["m1", "m2", "m3"] {
        fx.mutations
            .save(medication("u1", id, "Statin"))
            .await
            .unwrap();
    }
    fx.remote.fail_id("m2");

    let report = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.pushed, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        report.failures[0].key,
        RecordKey::new(RecordKind::Medication, "m2")
    );
    assert!(report.first_error().is_some());
    assert!(fx
        .local(RecordKind::Medication, "u1", "m2")
        .await
        .unwrap()
        .is_pending());

    fx.remote.clear_failures();
    let retry = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(retry.scanned, 1);
    assert_eq!(retry.pushed, 1);
}

#[tokio::test]
async fn acknowledged_tombstone_is_purged_locally() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", "Metformin"))
        .await
        .unwrap();
    fx.engine().reconcile("u1").await.unwrap();

    fx.clock.advance(1_000);
    fx.mutations
        .soft_delete(RecordKind::Medication, "u1", "m1")
        .await
        .unwrap();
    let tombstone = fx.local(RecordKind::Medication, "u1", "m1").await.unwrap();
    assert!(tombstone.is_deleted);

    let report = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(fx.local(RecordKind::Medication, "u1", "m1").await.is_none());
    assert!(
        fx.remote
            .get(RecordKind::Medication, "u1", "m1")
            .unwrap()
            .is_deleted
    );
}

#[tokio::test]
async fn slow_remote_times_out_per_record() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", "Metformin"))
        .await
        .unwrap();
    fx.remote.set_latency(Some(Duration::from_millis(300)));

    let report = fx
        .engine()
        .with_push_timeout(Duration::from_millis(20))
        .reconcile("u1")
        .await
        .unwrap();

    assert_eq!(report.pushed, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].reason.contains("timed out"));
    assert!(fx
        .local(RecordKind::Medication, "u1", "m1")
        .await
        .unwrap()
        .is_pending());
}

/// Remote that lets the user edit the record while its push is in flight.
struct EditDuringPush {
    inner: InMemoryRemote,
    mutations: MutationService,
}

#[async_trait]
impl RemoteStore for EditDuringPush {
    async fn upsert(&self, record: RemoteRecord) -> RemoteResult<PushAck> {
        let mut edited = record.clone().into_synced_record();
        edited.sync_state = SyncState::PendingPush;
        self.mutations.save(edited).await.unwrap();
        self.inner.upsert(record).await
    }

    async fn delete(
        &self,
        kind: RecordKind,
        owner_id: &str,
        id: &str,
        deleted_at_ms: i64,
    ) -> RemoteResult<PushAck> {
        self.inner.delete(kind, owner_id, id, deleted_at_ms).await
    }

    async fn changes_since(
        &self,
        kind: RecordKind,
        owner_id: &str,
        since_seq: i64,
    ) -> RemoteResult<Vec<RemoteRecord>> {
        self.inner.changes_since(kind, owner_id, since_seq).await
    }
}

#[tokio::test]
async fn stale_acknowledgment_keeps_newer_local_edit_pending() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", "Metformin"))
        .await
        .unwrap();

    let remote = Arc::new(EditDuringPush {
        inner: InMemoryRemote::new(),
        mutations: MutationService::new(Arc::clone(&fx.store)).with_clock(fx.clock.clone()),
    });
    let engine = ReconciliationEngine::new(Arc::clone(&fx.store), remote, &fx.config);

    let report = engine.reconcile("u1").await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.skipped_stale, 1);
    assert!(fx
        .local(RecordKind::Medication, "u1", "m1")
        .await
        .unwrap()
        .is_pending());
}

#[tokio::test]
async fn superseded_push_is_acknowledged_and_reported() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", "Local name"))
        .await
        .unwrap();
    let mut newer = RemoteRecord::from(&medication("u1", "m1", "Remote name"));
    newer.last_modified_ms = START_MS + 60_000;
    fx.remote.seed(newer);

    let report = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(
        report.superseded,
        vec![RecordKey::new(RecordKind::Medication, "m1")]
    );
    assert_eq!(report.pushed, 0);

    let pulled = fx.engine().pull("u1").await.unwrap();
    assert_eq!(pulled.applied, 1);
    let local = fx.local(RecordKind::Medication, "u1", "m1").await.unwrap();
    assert_eq!(local.body.display_name(), "Remote name");
    assert_eq!(local.sync_state, SyncState::Synced);
}

#[tokio::test]
async fn pull_applies_remote_changes_last_writer_wins() {
    let fx = fixture().await;

    // Local d2 is newer than the remote copy; local d3 is older.
    let saved_d2 = fx
        .mutations
        .save(Record::with_id(
            "d2",
            "u1",
            RecordBody::Doctor(Doctor {
                name: "Local newer".to_string(),
                specialty: None,
                phone: None,
                email: None,
            }),
        ))
        .await
        .unwrap();
    fx.mutations
        .save(Record::with_id(
            "d3",
            "u1",
            RecordBody::Doctor(Doctor {
                name: "Local older".to_string(),
                specialty: None,
                phone: None,
                email: None,
            }),
        ))
        .await
        .unwrap();
    fx.mutations
        .save(Record::with_id(
            "d4",
            "u1",
            RecordBody::Doctor(Doctor {
                name: "Deleted elsewhere".to_string(),
                specialty: None,
                phone: None,
                email: None,
            }),
        ))
        .await
        .unwrap();

    fx.remote
        .seed(remote_doctor("u1", "d1", "Remote only", START_MS - 10, false));
    fx.remote.seed(remote_doctor(
        "u1",
        "d2",
        "Remote older",
        saved_d2.last_modified_ms - 1,
        false,
    ));
    fx.remote
        .seed(remote_doctor("u1", "d3", "Remote newer", START_MS + 5_000, false));
    fx.remote
        .seed(remote_doctor("u1", "d4", "Deleted elsewhere", START_MS + 5_000, true));
    fx.remote
        .seed(remote_doctor("u2", "d9", "Other owner", START_MS, false));

    let report = fx.engine().pull("u1").await.unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(report.applied, 2);
    assert_eq!(report.purged, 0);
    assert_eq!(report.kept_local, 1);
    assert_eq!(
        report.deleted_remotely,
        vec![RecordKey::new(RecordKind::Doctor, "d4")]
    );
    assert!(report.failures.is_empty());

    let d1 = fx.local(RecordKind::Doctor, "u1", "d1").await.unwrap();
    assert_eq!(d1.sync_state, SyncState::Synced);
    let d2 = fx.local(RecordKind::Doctor, "u1", "d2").await.unwrap();
    assert_eq!(d2.body.display_name(), "Local newer");
    assert!(d2.is_pending());
    let d3 = fx.local(RecordKind::Doctor, "u1", "d3").await.unwrap();
    assert_eq!(d3.body.display_name(), "Remote newer");
    assert!(fx.local(RecordKind::Doctor, "u2", "d9").await.is_none());

    // d4 was never pushed, so it stays as a pending tombstone.
    let d4 = fx.local(RecordKind::Doctor, "u1", "d4").await.unwrap();
    assert!(d4.is_deleted);
    assert!(d4.is_pending());
    assert_eq!(d4.last_modified_ms, START_MS + 5_000);

    let second = fx.engine().pull("u1").await.unwrap();
    assert_eq!(second.fetched, 0);

    let pushed = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(pushed.deleted, 1);
    assert_eq!(pushed.pushed, 1);
    assert!(fx.local(RecordKind::Doctor, "u1", "d4").await.is_none());
}

#[tokio::test]
async fn remote_deletion_purges_synced_row() {
    let fx = fixture().await;
    let saved = fx
        .mutations
        .save(Record::with_id(
            "d5",
            "u1",
            RecordBody::Doctor(Doctor {
                name: "Synced".to_string(),
                specialty: None,
                phone: None,
                email: None,
            }),
        ))
        .await
        .unwrap();
    fx.engine().reconcile("u1").await.unwrap();

    fx.remote
        .delete(RecordKind::Doctor, "u1", "d5", saved.last_modified_ms + 1)
        .await
        .unwrap();

    let report = fx.engine().pull("u1").await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(report.deleted_remotely.is_empty());
    assert!(fx.local(RecordKind::Doctor, "u1", "d5").await.is_none());
}

#[tokio::test]
async fn late_change_with_older_stamp_is_still_pulled() {
    let fx = fixture().await;
    fx.remote
        .seed(remote_doctor("u1", "d1", "Fast clock", START_MS + 300, false));
    let first = fx.engine().pull("u1").await.unwrap();
    assert_eq!(first.applied, 1);

    // Written after the first pull by a device whose clock lags behind.
    fx.remote
        .seed(remote_doctor("u1", "d2", "Slow clock", START_MS + 250, false));
    let second = fx.engine().pull("u1").await.unwrap();
    assert_eq!(second.fetched, 1);
    assert_eq!(second.applied, 1);

    let d2 = fx.local(RecordKind::Doctor, "u1", "d2").await.unwrap();
    assert_eq!(d2.body.display_name(), "Slow clock");
    assert_eq!(d2.sync_state, SyncState::Synced);
}

#[tokio::test]
async fn undecodable_pending_row_is_reported_as_failure() {
    let fx = fixture().await;
    fx.mutations
        .save(medication("u1", "m1", "Fine"))
        .await
        .unwrap();
    fx.store
        .run("insert_broken", |conn| {
            conn.execute(
                "INSERT INTO records
                    (kind, id, owner_id, payload, payload_version, search_text, last_modified_ms, sync_state, is_deleted)
                 VALUES ('medication', 'bad', 'u1', 'not json', 1, 'bad', 5, 'pending_push', 0);",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let report = fx.engine().reconcile("u1").await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key.id, "bad");
}

#[tokio::test]
async fn passes_publish_last_sync_time_to_shared_context() {
    let fx = fixture().await;
    let context = Arc::new(FileSharedContext::new(fx.config.context_path()));
    context
        .update(&mut |ctx| ctx.owner_id = Some("u1".to_string()))
        .unwrap();
    assert!(fx.dir.path().join("healthsync-context.json").is_file());

    fx.clock.set(START_MS + 42);
    fx.engine()
        .with_context(context.clone())
        .reconcile("u1")
        .await
        .unwrap();

    let published = context.load().unwrap();
    assert_eq!(published.last_sync_ms, Some(START_MS + 42));
    assert_eq!(published.owner_id.as_deref(), Some("u1"));
}
