//! MongoDB primary store adapter.
//!
//! # Responsibility
//! - Map whispers to `whispers` collection documents and back.
//! - Validate ObjectId format before any dispatch.
//!
//! # Invariants
//! - `created_at` is persisted as a BSON datetime.
//! - Only fields named by a patch appear in its `$set` document.

use super::{PrimaryStore, StoreError, StoreResult};
use crate::model::whisper::{NewWhisper, Whisper, WhisperId, WhisperPatch};
use async_trait::async_trait;
use log::{debug, info};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::error::ErrorKind;
use mongodb::{Client, Collection, IndexModel};
use tokio::sync::RwLock;

const STORE: &str = "mongodb";
const COLLECTION: &str = "whispers";

struct MongoHandle {
    client: Client,
    collection: Collection<Document>,
}

/// Primary store backed by a MongoDB collection.
pub struct MongoPrimaryStore {
    handle: RwLock<Option<MongoHandle>>,
}

impl MongoPrimaryStore {
    /// Builds a client for `uri` and binds the `whispers` collection.
    ///
    /// The driver connects lazily; an unreachable server surfaces on first use.
    pub async fn connect(uri: &str, database: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(map_mongo_error)?;
        let collection = client.database(database).collection(COLLECTION);
        info!("event=store_connect module=store store={STORE} status=ok database={database}");
        Ok(Self {
            handle: RwLock::new(Some(MongoHandle { client, collection })),
        })
    }

    async fn collection(&self) -> StoreResult<Collection<Document>> {
        self.handle
            .read()
            .await
            .as_ref()
            .map(|handle| handle.collection.clone())
            .ok_or(StoreError::Closed(STORE))
    }
}

#[async_trait]
impl PrimaryStore for MongoPrimaryStore {
    fn canonical_id(&self, id: &str) -> StoreResult<WhisperId> {
        parse_object_id(id).map(|oid| oid.to_hex())
    }

    async fn ensure_indexes(&self) -> StoreResult<()> {
        let collection = self.collection().await?;
        let indexes = [
            IndexModel::builder().keys(doc! { "created_at": 1 }).build(),
            IndexModel::builder().keys(doc! { "tags": 1 }).build(),
        ];
        collection
            .create_indexes(indexes)
            .await
            .map_err(map_mongo_error)?;
        Ok(())
    }

    async fn insert_one(&self, input: &NewWhisper, created_at: i64) -> StoreResult<WhisperId> {
        let collection = self.collection().await?;
        let result = collection
            .insert_one(new_whisper_to_document(input, created_at))
            .await
            .map_err(map_mongo_error)?;
        result
            .inserted_id
            .as_object_id()
            .map(|oid| oid.to_hex())
            .ok_or_else(|| StoreError::InvalidData("inserted _id is not an ObjectId".to_string()))
    }

    async fn find_one(&self, id: &str) -> StoreResult<Option<Whisper>> {
        let oid = parse_object_id(id)?;
        let collection = self.collection().await?;
        let found = collection
            .find_one(doc! { "_id": oid })
            .await
            .map_err(map_mongo_error)?;
        found.map(document_to_whisper).transpose()
    }

    async fn update_one(&self, id: &str, patch: &WhisperPatch) -> StoreResult<u64> {
        let oid = parse_object_id(id)?;
        let collection = self.collection().await?;
        let set = patch_to_set_document(patch);
        if set.is_empty() {
            let count = collection
                .count_documents(doc! { "_id": oid })
                .await
                .map_err(map_mongo_error)?;
            return Ok(count);
        }

        let result = collection
            .update_one(doc! { "_id": oid }, doc! { "$set": set })
            .await
            .map_err(map_mongo_error)?;
        Ok(result.matched_count)
    }

    async fn delete_one(&self, id: &str) -> StoreResult<u64> {
        let oid = parse_object_id(id)?;
        let collection = self.collection().await?;
        let result = collection
            .delete_one(doc! { "_id": oid })
            .await
            .map_err(map_mongo_error)?;
        Ok(result.deleted_count)
    }

    async fn close(&self) -> StoreResult<()> {
        let Some(handle) = self.handle.write().await.take() else {
            debug!("event=store_close module=store store={STORE} status=skipped");
            return Ok(());
        };
        drop(handle.collection);
        handle.client.shutdown().immediate(true).await;
        info!("event=store_close module=store store={STORE} status=ok");
        Ok(())
    }
}

fn parse_object_id(id: &str) -> StoreResult<ObjectId> {
    ObjectId::parse_str(id.trim()).map_err(|_| StoreError::InvalidId(id.to_string()))
}

fn map_mongo_error(err: mongodb::error::Error) -> StoreError {
    let message = err.to_string();
    match *err.kind {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => StoreError::Unavailable {
            store: STORE,
            message,
        },
        _ => StoreError::Rejected {
            store: STORE,
            message,
        },
    }
}

fn new_whisper_to_document(input: &NewWhisper, created_at: i64) -> Document {
    doc! {
        "raw_text": input.raw_text.as_str(),
        "source_url": input.source_url.clone(),
        "embeddings": embeddings_to_bson(input.embeddings.as_deref()),
        "tags": input.tags.clone(),
        "created_at": DateTime::from_millis(created_at),
    }
}

fn patch_to_set_document(patch: &WhisperPatch) -> Document {
    let mut set = Document::new();
    if let Some(text) = patch.raw_text.as_ref() {
        set.insert("raw_text", text.as_str());
    }
    if let Some(source_url) = patch.source_url.as_ref() {
        set.insert("source_url", source_url.clone());
    }
    if let Some(embeddings) = patch.embeddings.as_ref() {
        set.insert("embeddings", embeddings_to_bson(embeddings.as_deref()));
    }
    if let Some(tags) = patch.tags.as_ref() {
        set.insert("tags", tags.clone());
    }
    set
}

fn embeddings_to_bson(embeddings: Option<&[f32]>) -> Bson {
    match embeddings {
        Some(values) => Bson::Array(
            values
                .iter()
                .map(|value| Bson::Double(f64::from(*value)))
                .collect(),
        ),
        None => Bson::Null,
    }
}

fn embeddings_from_bson(value: Option<&Bson>) -> StoreResult<Option<Vec<f32>>> {
    let values = match value {
        None | Some(Bson::Null) => return Ok(None),
        Some(Bson::Array(values)) => values,
        Some(other) => {
            return Err(StoreError::InvalidData(format!(
                "whispers.embeddings: expected array, got {:?}",
                other.element_type()
            )))
        }
    };
    values
        .iter()
        .enumerate()
        .map(|(index, value)| match value {
            Bson::Double(number) => Ok(*number as f32),
            Bson::Int32(number) => Ok(*number as f32),
            Bson::Int64(number) => Ok(*number as f32),
            other => Err(StoreError::InvalidData(format!(
                "whispers.embeddings[{index}]: expected number, got {:?}",
                other.element_type()
            ))),
        })
        .collect::<StoreResult<Vec<f32>>>()
        .map(Some)
}

fn document_to_whisper(doc: Document) -> StoreResult<Whisper> {
    let id = doc
        .get_object_id("_id")
        .map_err(|err| StoreError::InvalidData(format!("whispers._id: {err}")))?;
    let raw_text = doc
        .get_str("raw_text")
        .map_err(|err| StoreError::InvalidData(format!("whispers.raw_text: {err}")))?
        .to_string();
    let created_at = doc
        .get_datetime("created_at")
        .map_err(|err| StoreError::InvalidData(format!("whispers.created_at: {err}")))?
        .timestamp_millis();
    let source_url = doc.get_str("source_url").ok().map(str::to_string);
    let embeddings = embeddings_from_bson(doc.get("embeddings"))?;
    let tags = doc
        .get_array("tags")
        .map(|values| {
            values
                .iter()
                .filter_map(Bson::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Whisper {
        id: id.to_hex(),
        raw_text,
        source_url,
        embeddings,
        tags,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        document_to_whisper, new_whisper_to_document, parse_object_id, patch_to_set_document,
    };
    use crate::model::whisper::{NewWhisper, WhisperPatch};
    use crate::store::StoreError;
    use mongodb::bson::oid::ObjectId;
    use mongodb::bson::{doc, Bson};

    #[test]
    fn new_whisper_document_round_trips_through_mapping() {
        let input = NewWhisper::new("Hello")
            .with_source_url("notes/hello.md")
            .with_tags(["greeting"])
            .with_embeddings(vec![0.5, 0.25]);
        let mut doc = new_whisper_to_document(&input, 1_700_000_000_000);
        let oid = ObjectId::new();
        doc.insert("_id", oid);

        let whisper = document_to_whisper(doc).unwrap();
        assert_eq!(whisper.id, oid.to_hex());
        assert_eq!(whisper.raw_text, "Hello");
        assert_eq!(whisper.source_url.as_deref(), Some("notes/hello.md"));
        assert_eq!(whisper.tags, vec!["greeting"]);
        assert_eq!(whisper.embeddings, Some(vec![0.5, 0.25]));
        assert_eq!(whisper.created_at, 1_700_000_000_000);
    }

    #[test]
    fn null_optional_fields_map_to_none() {
        let mut doc = new_whisper_to_document(&NewWhisper::new("plain"), 1);
        doc.insert("_id", ObjectId::new());
        let whisper = document_to_whisper(doc).unwrap();
        assert_eq!(whisper.source_url, None);
        assert_eq!(whisper.embeddings, None);
        assert!(whisper.tags.is_empty());
    }

    #[test]
    fn patch_set_document_names_only_supplied_fields() {
        let patch = WhisperPatch::default().raw_text("X").source_url(None);
        let set = patch_to_set_document(&patch);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get_str("raw_text").unwrap(), "X");
        assert!(set.get("source_url").unwrap().as_null().is_some());
        assert!(!set.contains_key("tags"));
    }

    #[test]
    fn malformed_object_id_is_invalid_id() {
        let err = parse_object_id("not-an-object-id").unwrap_err();
        assert_eq!(err, StoreError::InvalidId("not-an-object-id".to_string()));
        assert!(parse_object_id(&ObjectId::new().to_hex()).is_ok());
    }

    #[test]
    fn integer_embeddings_are_widened_and_non_numbers_rejected() {
        let mut doc = new_whisper_to_document(&NewWhisper::new("ints"), 1);
        doc.insert("_id", ObjectId::new());
        doc.insert(
            "embeddings",
            vec![Bson::Int32(1), Bson::Int64(2), Bson::Double(0.5)],
        );
        let whisper = document_to_whisper(doc.clone()).unwrap();
        assert_eq!(whisper.embeddings, Some(vec![1.0, 2.0, 0.5]));

        doc.insert("embeddings", vec![Bson::Double(1.0), Bson::String("x".into())]);
        let err = document_to_whisper(doc.clone()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(message) if message.contains("embeddings[1]")));

        doc.insert("embeddings", doc! { "nested": 1 });
        assert!(matches!(
            document_to_whisper(doc).unwrap_err(),
            StoreError::InvalidData(_)
        ));
    }
}
