use whisper_core::{
    open_outbox, InMemoryGraphIndex, InMemoryPrimaryStore, IndexOutcome, NewWhisper,
    ValidationError, WhisperConfig, WhisperError, WhisperPatch, WhisperService,
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
async fn create_then_get_returns_the_input() {
    let service = service();
    let input = NewWhisper::new("first whisper")
        .with_source_url("file:///notes/first.md")
        .with_tags(["beta", "alpha"])
        .with_embeddings(vec![0.1, 0.2]);

    let report = service.create(input).await.unwrap();
    assert_eq!(report.index, IndexOutcome::Synced);
    let created = report.into_value();
    assert_eq!(created.id.len(), 24);
    assert!(created.created_at > 0);

    let loaded = service.get(&created.id).await.unwrap().unwrap();
    assert_eq!(loaded, created);
    assert_eq!(loaded.raw_text, "first whisper");
    assert_eq!(loaded.source_url.as_deref(), Some("file:///notes/first.md"));
    assert_eq!(loaded.embeddings, Some(vec![0.1, 0.2]));
    assert_eq!(loaded.tags, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn create_projects_node_and_edges() {
    let service = service();
    let created = service
        .create(NewWhisper::new("Hello").with_tags(["greeting", " greeting "]))
        .await
        .unwrap()
        .into_value();

    let node = service.index().node(&created.id).await.unwrap();
    assert_eq!(node.raw_text, "Hello");
    assert_eq!(node.created_at, created.created_at);
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["greeting"]);
}

#[tokio::test]
async fn delete_of_nonexistent_id_returns_false() {
    let service = service();
    let report = service.delete("64b7f0c2a1b2c3d4e5f60718").await.unwrap();
    assert!(!report.value);
}

#[tokio::test]
async fn malformed_ids_read_as_not_found() {
    let service = service();
    assert_eq!(service.get("not-an-object-id").await.unwrap(), None);
    assert_eq!(service.get("").await.unwrap(), None);
    assert!(service
        .update("xyz", WhisperPatch::default().raw_text("x"))
        .await
        .unwrap()
        .is_none());

    let report = service.delete("xyz").await.unwrap();
    assert!(!report.value);
    assert_eq!(report.index, IndexOutcome::Untouched);
    assert_eq!(service.index().write_count(), 0);
}

#[tokio::test]
async fn empty_patch_changes_nothing_and_skips_index() {
    let service = service();
    let created = service
        .create(NewWhisper::new("steady").with_tags(["a"]))
        .await
        .unwrap()
        .into_value();
    let writes_before = service.index().write_count();

    let report = service
        .update(&created.id, WhisperPatch::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.value, created);
    assert_eq!(report.index, IndexOutcome::Untouched);
    assert_eq!(service.index().write_count(), writes_before);
}

#[tokio::test]
async fn updating_tags_replaces_the_edge_set() {
    let service = service();
    let created = service
        .create(NewWhisper::new("tagged").with_tags(["a", "b"]))
        .await
        .unwrap()
        .into_value();

    let report = service
        .update(&created.id, WhisperPatch::default().tags(["a"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.index, IndexOutcome::Synced);
    assert_eq!(report.value.tags, vec!["a"]);
    assert_eq!(service.index_tags(&created.id).await.unwrap(), vec!["a"]);
    // Tag nodes outlive their last edge.
    assert_eq!(service.index().tag_nodes().await, vec!["a", "b"]);
}

#[tokio::test]
async fn updating_text_only_leaves_index_untouched() {
    let service = service();
    let created = service
        .create(NewWhisper::new("old text").with_tags(["t"]))
        .await
        .unwrap()
        .into_value();
    let writes_before = service.index().write_count();

    let report = service
        .update(&created.id, WhisperPatch::default().raw_text("new text"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.index, IndexOutcome::Untouched);
    assert_eq!(report.value.raw_text, "new text");
    assert_eq!(report.value.tags, vec!["t"]);

    let loaded = service.get(&created.id).await.unwrap().unwrap();
    assert_eq!(loaded.raw_text, "new text");
    assert_eq!(service.index().write_count(), writes_before);
    assert_eq!(
        service.index().node(&created.id).await.unwrap().raw_text,
        "old text"
    );
}

#[tokio::test]
async fn patch_can_clear_nullable_fields() {
    let service = service();
    let created = service
        .create(
            NewWhisper::new("with extras")
                .with_source_url("https://example.org")
                .with_embeddings(vec![1.0]),
        )
        .await
        .unwrap()
        .into_value();

    let updated = service
        .update(
            &created.id,
            WhisperPatch::default().source_url(None).embeddings(None),
        )
        .await
        .unwrap()
        .unwrap()
        .into_value();
    assert_eq!(updated.source_url, None);
    assert_eq!(updated.embeddings, None);
    assert_eq!(updated.raw_text, "with extras");
}

#[tokio::test]
async fn update_of_unknown_id_returns_none() {
    let service = service();
    let result = service
        .update(
            "64b7f0c2a1b2c3d4e5f60718",
            WhisperPatch::default().tags(["x"]),
        )
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(service.index().write_count(), 0);
}

#[tokio::test]
async fn create_delete_get_lifecycle() {
    let service = service();
    let created = service
        .create(NewWhisper::new("Hello").with_tags(["greeting"]))
        .await
        .unwrap()
        .into_value();

    let report = service.delete(&created.id).await.unwrap();
    assert!(report.value);
    assert_eq!(report.index, IndexOutcome::Synced);
    assert_eq!(service.get(&created.id).await.unwrap(), None);
    assert!(service.index().node(&created.id).await.is_none());
    assert!(service.index_tags(&created.id).await.unwrap().is_empty());
    assert_eq!(service.index().tag_nodes().await, vec!["greeting"]);
}

#[tokio::test]
async fn shutdown_twice_is_a_noop_and_later_calls_fail() {
    let service = service();
    service.shutdown().await.unwrap();
    service.shutdown().await.unwrap();
    assert!(service.is_closed());

    let err = service.create(NewWhisper::new("late")).await.unwrap_err();
    assert!(matches!(err, WhisperError::Closed));
    let err = service.get("64b7f0c2a1b2c3d4e5f60718").await.unwrap_err();
    assert!(matches!(err, WhisperError::Closed));
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_write() {
    let config = WhisperConfig {
        embedding_dim: Some(3),
        ..WhisperConfig::default()
    };
    let service = service_with(&config);

    let err = service.create(NewWhisper::new("   ")).await.unwrap_err();
    assert!(matches!(
        err,
        WhisperError::Validation(ValidationError::BlankText)
    ));

    let err = service
        .create(NewWhisper::new("text").with_tags(["ok", "  "]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WhisperError::Validation(ValidationError::BlankTag(_))
    ));

    let err = service
        .create(NewWhisper::new("text").with_embeddings(vec![1.0, 2.0]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WhisperError::Validation(ValidationError::EmbeddingDimension {
            expected: 3,
            actual: 2
        })
    ));

    assert!(service.primary().is_empty().await);
    assert_eq!(service.index().write_count(), 0);
}

#[tokio::test]
async fn primary_failure_is_an_error_and_skips_index() {
    let service = service();
    service.primary().set_available(false);

    let err = service.create(NewWhisper::new("lost")).await.unwrap_err();
    assert!(matches!(err, WhisperError::Primary(_)));
    assert!(err.is_store_unavailable());
    assert_eq!(service.index().write_count(), 0);
    assert_eq!(service.outbox_counts().unwrap().pending, 0);
}

#[tokio::test]
async fn primary_failure_aborts_delete() {
    let service = service();
    let created = service
        .create(NewWhisper::new("keep"))
        .await
        .unwrap()
        .into_value();
    let writes_before = service.index().write_count();
    service.primary().set_available(false);

    let err = service.delete(&created.id).await.unwrap_err();
    assert!(err.is_store_unavailable());
    assert_eq!(service.index().write_count(), writes_before);
    assert!(service.index().node(&created.id).await.is_some());
}

#[tokio::test]
async fn primary_indexes_are_ensured_once() {
    let service = service();
    let created = service
        .create(NewWhisper::new("one"))
        .await
        .unwrap()
        .into_value();
    service.get(&created.id).await.unwrap();
    service.create(NewWhisper::new("two")).await.unwrap();
    service.delete(&created.id).await.unwrap();

    assert_eq!(service.primary().index_bootstraps(), 1);
}
