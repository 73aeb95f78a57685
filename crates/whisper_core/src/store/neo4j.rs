//! Neo4j graph index adapter.
//!
//! # Responsibility
//! - Project whispers into `(:Whisper {whisper_id})-[:TAGGED]->(:Tag {value})`.
//! - Run every multi-statement write inside one transaction.
//!
//! # Invariants
//! - Whisper and tag nodes are merged by key, never duplicated.
//! - Edge replacement deletes then recreates inside the same transaction.

use super::{GraphIndex, StoreError, StoreResult, WhisperNode};
use async_trait::async_trait;
use log::{debug, info};
use neo4rs::{query, Graph, Query};
use tokio::sync::RwLock;

const STORE: &str = "neo4j";

const UPSERT_NODE_CYPHER: &str = "MERGE (w:Whisper {whisper_id: $id})
SET w.raw_text = $raw_text,
    w.source_url = CASE WHEN $has_source THEN $source_url ELSE null END,
    w.created_at = $created_at";

const DETACH_TAGS_CYPHER: &str = "MATCH (:Whisper {whisper_id: $id})-[r:TAGGED]->(:Tag)
DELETE r";

const LINK_TAGS_CYPHER: &str = "MATCH (w:Whisper {whisper_id: $id})
UNWIND $tags AS tag
MERGE (t:Tag {value: tag})
MERGE (w)-[:TAGGED]->(t)";

const REMOVE_NODE_CYPHER: &str = "MATCH (w:Whisper {whisper_id: $id})
DETACH DELETE w";

const TAGS_OF_CYPHER: &str = "MATCH (:Whisper {whisper_id: $id})-[:TAGGED]->(t:Tag)
RETURN t.value AS value
ORDER BY value";

/// Graph index backed by a Neo4j database over Bolt.
pub struct Neo4jGraphIndex {
    graph: RwLock<Option<Graph>>,
}

impl Neo4jGraphIndex {
    pub async fn connect(uri: &str, user: &str, password: &str) -> StoreResult<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(map_neo4j_error)?;
        info!("event=store_connect module=store store={STORE} status=ok");
        Ok(Self {
            graph: RwLock::new(Some(graph)),
        })
    }

    async fn graph(&self) -> StoreResult<Graph> {
        self.graph
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(StoreError::Closed(STORE))
    }

    async fn run_in_txn(&self, statements: Vec<Query>) -> StoreResult<()> {
        let graph = self.graph().await?;
        let mut txn = graph.start_txn().await.map_err(map_neo4j_error)?;
        for statement in statements {
            txn.run(statement).await.map_err(map_neo4j_error)?;
        }
        txn.commit().await.map_err(map_neo4j_error)
    }
}

fn upsert_node_query(node: &WhisperNode) -> Query {
    query(UPSERT_NODE_CYPHER)
        .param("id", node.id.as_str())
        .param("raw_text", node.raw_text.as_str())
        .param("has_source", node.source_url.is_some())
        .param("source_url", node.source_url.clone().unwrap_or_default())
        .param("created_at", node.created_at)
}

fn detach_tags_query(id: &str) -> Query {
    query(DETACH_TAGS_CYPHER).param("id", id)
}

fn link_tags_query(id: &str, tags: &[String]) -> Query {
    query(LINK_TAGS_CYPHER)
        .param("id", id)
        .param("tags", tags.to_vec())
}

fn map_neo4j_error(err: neo4rs::Error) -> StoreError {
    let message = err.to_string();
    match err {
        neo4rs::Error::IOError { .. }
        | neo4rs::Error::ConnectionError
        | neo4rs::Error::InvalidDnsName(_) => StoreError::Unavailable {
            store: STORE,
            message,
        },
        _ => StoreError::Rejected {
            store: STORE,
            message,
        },
    }
}

#[async_trait]
impl GraphIndex for Neo4jGraphIndex {
    async fn upsert_whisper(&self, node: &WhisperNode, tags: &[String]) -> StoreResult<()> {
        self.run_in_txn(vec![
            upsert_node_query(node),
            detach_tags_query(&node.id),
            link_tags_query(&node.id, tags),
        ])
        .await
    }

    async fn replace_tags(&self, id: &str, tags: &[String]) -> StoreResult<()> {
        self.run_in_txn(vec![detach_tags_query(id), link_tags_query(id, tags)])
            .await
    }

    async fn remove_whisper(&self, id: &str) -> StoreResult<()> {
        let graph = self.graph().await?;
        graph
            .run(query(REMOVE_NODE_CYPHER).param("id", id))
            .await
            .map_err(map_neo4j_error)
    }

    async fn tags_of(&self, id: &str) -> StoreResult<Vec<String>> {
        let graph = self.graph().await?;
        let mut rows = graph
            .execute(query(TAGS_OF_CYPHER).param("id", id))
            .await
            .map_err(map_neo4j_error)?;
        let mut tags = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_neo4j_error)? {
            let value: String = row
                .get("value")
                .map_err(|err| StoreError::InvalidData(format!("Tag.value: {err}")))?;
            tags.push(value);
        }
        Ok(tags)
    }

    async fn close(&self) -> StoreResult<()> {
        // Dropping the last `Graph` clone releases the connection pool.
        if self.graph.write().await.take().is_none() {
            debug!("event=store_close module=store store={STORE} status=skipped");
            return Ok(());
        }
        info!("event=store_close module=store store={STORE} status=ok");
        Ok(())
    }
}
