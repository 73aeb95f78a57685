use std::sync::Arc;
use std::time::Duration;
use whisper_core::{
    open_outbox, DrainReport, InMemoryGraphIndex, InMemoryPrimaryStore, IndexOutcome, NewWhisper,
    OutboxStatus, ProjectionWorker, WhisperConfig, WhisperError, WhisperPatch, WhisperService,
};

type MemoryService = WhisperService<InMemoryPrimaryStore, InMemoryGraphIndex>;

fn service_with(config: &WhisperConfig) -> MemoryService {
    WhisperService::new(
        InMemoryPrimaryStore::new(),
        InMemoryGraphIndex::new(),
        open_outbox(config).unwrap(),
        config,
    )
}

fn service() -> MemoryService {
    service_with(&WhisperConfig::default())
}

#[tokio::test]
async fn graph_outage_defers_create_and_drain_catches_up() {
    let service = service();
    service.index().set_available(false);

    let report = service
        .create(NewWhisper::new("offline").with_tags(["x", "y"]))
        .await
        .unwrap();
    assert!(report.is_partial());
    assert!(matches!(report.index, IndexOutcome::Deferred { .. }));
    let created = report.into_value();
    assert_eq!(service.get(&created.id).await.unwrap(), Some(created.clone()));
    assert_eq!(service.outbox_counts().unwrap().pending, 1);

    let report = service.drain(10).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 0);

    service.index().set_available(true);
    let report = service.drain(10).await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            applied: 1,
            ..DrainReport::default()
        }
    );
    assert_eq!(service.index_tags(&created.id).await.unwrap(), created.tags);
    assert_eq!(service.outbox_counts().unwrap().pending, 0);
}

#[tokio::test]
async fn later_projections_queue_behind_pending_ones() {
    let service = service();
    service.index().set_available(false);
    let created = service
        .create(NewWhisper::new("ordered").with_tags(["old"]))
        .await
        .unwrap()
        .into_value();
    service.index().set_available(true);

    let report = service
        .update(&created.id, WhisperPatch::default().tags(["new"]))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(report.index, IndexOutcome::Deferred { .. }));
    assert_eq!(service.index().write_count(), 0);
    assert_eq!(service.outbox_counts().unwrap().pending, 2);

    let report = service.drain(10).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["new"]);

    let report = service
        .update(&created.id, WhisperPatch::default().tags(["newest"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.index, IndexOutcome::Synced);
}

#[tokio::test]
async fn failure_holds_back_later_jobs_for_the_same_whisper() {
    let service = service();
    service.index().set_available(false);
    let first = service
        .create(NewWhisper::new("first"))
        .await
        .unwrap()
        .into_value();
    service
        .update(&first.id, WhisperPatch::default().tags(["t"]))
        .await
        .unwrap();
    service.create(NewWhisper::new("second")).await.unwrap();

    let report = service.drain(10).await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            applied: 0,
            failed: 2,
            dead: 0,
            skipped: 1,
        }
    );
}

#[tokio::test]
async fn jobs_become_dead_after_max_attempts() {
    let config = WhisperConfig {
        outbox_max_attempts: 2,
        ..WhisperConfig::default()
    };
    let service = service_with(&config);
    service.index().set_available(false);
    let created = service
        .create(NewWhisper::new("doomed"))
        .await
        .unwrap()
        .into_value();

    assert_eq!(service.drain(10).await.unwrap().failed, 1);
    assert_eq!(service.drain(10).await.unwrap().dead, 1);

    let counts = service.outbox_counts().unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.dead, 1);

    let dead = service.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].whisper_id, created.id);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].status, OutboxStatus::Dead);
    assert!(dead[0].last_error.as_deref().unwrap().contains("unavailable"));

    service.index().set_available(true);
    assert_eq!(service.drain(10).await.unwrap(), DrainReport::default());
    assert!(service.index().node(&created.id).await.is_none());
}

#[tokio::test]
async fn graph_outage_never_masks_a_primary_delete() {
    let service = service();
    let created = service
        .create(NewWhisper::new("gone").with_tags(["g"]))
        .await
        .unwrap()
        .into_value();
    service.index().set_available(false);

    let report = service.delete(&created.id).await.unwrap();
    assert!(report.value);
    assert!(report.is_partial());
    assert_eq!(service.get(&created.id).await.unwrap(), None);

    service.index().set_available(true);
    assert!(service.index().node(&created.id).await.is_some());
    assert_eq!(service.drain(10).await.unwrap().applied, 1);
    assert!(service.index().node(&created.id).await.is_none());
}

#[tokio::test]
async fn deferred_jobs_survive_reopening_the_outbox() {
    let dir = tempfile::tempdir().unwrap();
    let config = WhisperConfig {
        outbox_path: Some(dir.path().join("outbox.db")),
        ..WhisperConfig::default()
    };

    let first = service_with(&config);
    first.index().set_available(false);
    let created = first
        .create(NewWhisper::new("durable").with_tags(["kept"]))
        .await
        .unwrap()
        .into_value();
    first.shutdown().await.unwrap();
    drop(first);

    let second = service_with(&config);
    assert_eq!(second.outbox_counts().unwrap().pending, 1);
    assert_eq!(second.drain(10).await.unwrap().applied, 1);
    assert_eq!(second.index_tags(&created.id).await.unwrap(), vec!["kept"]);
}

#[tokio::test]
async fn projection_worker_replays_until_cancelled() {
    let service = Arc::new(service());
    service.index().set_available(false);
    let created = service
        .create(NewWhisper::new("background").with_tags(["bg"]))
        .await
        .unwrap()
        .into_value();
    service.index().set_available(true);

    let worker = Arc::new(ProjectionWorker::new(
        Arc::clone(&service),
        Duration::from_millis(10),
        50,
    ));
    let token = worker.shutdown_token();
    let handle = Arc::clone(&worker).start();

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        while service.outbox_counts().unwrap().pending > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(synced.is_ok());
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["bg"]);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn projection_worker_stops_after_service_shutdown() {
    let service = Arc::new(service());
    let worker = Arc::new(ProjectionWorker::new(
        Arc::clone(&service),
        Duration::from_millis(10),
        50,
    ));
    let handle = worker.start();

    service.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn committed_tag_change_is_projected_when_read_back_fails() {
    let service = service();
    let created = service
        .create(NewWhisper::new("read-back").with_tags(["a", "b"]))
        .await
        .unwrap()
        .into_value();
    service.primary().set_reads_available(false);

    let err = service
        .update(&created.id, WhisperPatch::default().tags(["a"]))
        .await
        .unwrap_err();
    assert!(err.is_store_unavailable());
    let stored = service.primary().record(&created.id).await.unwrap();
    assert_eq!(stored.tags, vec!["a"]);
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["a"]);

    service.index().set_available(false);
    service
        .update(&created.id, WhisperPatch::default().tags(["c"]))
        .await
        .unwrap_err();
    assert_eq!(service.outbox_counts().unwrap().pending, 1);

    service.index().set_available(true);
    assert_eq!(service.drain(10).await.unwrap().applied, 1);
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["c"]);
}

#[tokio::test]
async fn tag_update_recreates_node_lost_to_dead_projection() {
    let config = WhisperConfig {
        outbox_max_attempts: 1,
        ..WhisperConfig::default()
    };
    let service = service_with(&config);
    service.index().set_available(false);
    let created = service
        .create(NewWhisper::new("orphaned").with_tags(["a"]))
        .await
        .unwrap()
        .into_value();
    assert_eq!(service.drain(10).await.unwrap().dead, 1);
    service.index().set_available(true);
    assert!(service.index().node(&created.id).await.is_none());

    let report = service
        .update(&created.id, WhisperPatch::default().tags(["b"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.index, IndexOutcome::Synced);
    let node = service.index().node(&created.id).await.unwrap();
    assert_eq!(node.raw_text, "orphaned");
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn inline_tag_update_is_deferred_during_graph_outage() {
    let service = service();
    let created = service
        .create(NewWhisper::new("inline").with_tags(["a"]))
        .await
        .unwrap()
        .into_value();
    assert_eq!(service.outbox_counts().unwrap().pending, 0);
    service.index().set_available(false);

    let report = service
        .update(&created.id, WhisperPatch::default().tags(["b"]))
        .await
        .unwrap()
        .unwrap();
    match &report.index {
        IndexOutcome::Deferred { error, .. } => assert!(error.contains("unavailable")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.value.tags, vec!["b"]);
    assert_eq!(service.outbox_counts().unwrap().pending, 1);
    assert_eq!(service.index().tag_nodes().await, vec!["a"]);

    service.index().set_available(true);
    assert_eq!(service.drain(10).await.unwrap().applied, 1);
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn projection_is_failed_when_outbox_cannot_record_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");
    let config = WhisperConfig {
        outbox_path: Some(path.clone()),
        ..WhisperConfig::default()
    };
    let service = service_with(&config);
    service.index().set_available(false);

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("DROP TABLE index_outbox;").unwrap();
    drop(conn);

    let report = service
        .create(NewWhisper::new("unqueued").with_tags(["t"]))
        .await
        .unwrap();
    match &report.index {
        IndexOutcome::Failed { error } => assert!(error.contains("not queued")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let created = report.into_value();
    assert_eq!(service.get(&created.id).await.unwrap(), Some(created));
    assert!(matches!(
        service.outbox_counts(),
        Err(WhisperError::Outbox(_))
    ));
}
