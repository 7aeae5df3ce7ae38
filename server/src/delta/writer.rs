//! The delta writer: the bridge between a freshly serialized object and what
//! actually gets cached and broadcast (spec.md §4.3).
//!
//! For each incoming document: upsert it into the persistent cache,
//! compare against whatever was stored there before, and emit either the
//! full document (first time seen, or a delete) or the minimal diff.
//! Oversized documents spill into GridFS via [`DocumentCache::put_large`]
//! rather than failing the write.

use crate::cache::{DocumentCache, MAX_INLINE_DOCUMENT_BYTES};
use crate::error::Result;
use std::sync::Arc;
use sync_core::{minimal_delta, ChannelName, FlatDocument};

pub struct DeltaWriter {
    cache: Arc<dyn DocumentCache>,
}

impl DeltaWriter {
    pub fn new(cache: Arc<dyn DocumentCache>) -> Self {
        Self { cache }
    }

    /// Write one document, returning the delta to broadcast, or `None` when
    /// nothing changed and the write is a no-op from a client's
    /// perspective.
    pub async fn write(
        &self,
        channel: &ChannelName,
        doc: FlatDocument,
    ) -> Result<Option<FlatDocument>> {
        if doc.is_deleted() || doc.operation() == Some("delete") {
            self.cache.replace_returning_prior(channel, &doc).await?;
            return Ok(Some(doc));
        }

        let prior = self.cache.put_large(channel, &doc).await?;

        // A document that tripped the GridFS spillover threshold is
        // broadcast as a full reference record, never a minimal diff
        // against whatever used to be there — the receiving end needs the
        // `_grid_ref` pointer itself, not a partial patch toward it.
        let spilled = serde_json::to_vec(&doc.clone().into_value())
            .map(|body| body.len() > MAX_INLINE_DOCUMENT_BYTES)
            .unwrap_or(false);

        match prior {
            None => Ok(Some(doc)),
            Some(_) if spilled => Ok(Some(doc)),
            Some(prior) if prior.is_deleted() != doc.is_deleted() => Ok(Some(doc)),
            Some(prior) => Ok(minimal_delta(&prior, &doc)),
        }
    }

    /// Write a whole batch (used by the snapshot loader's build path),
    /// returning every non-empty delta in input order.
    pub async fn write_batch(
        &self,
        channel: &ChannelName,
        docs: Vec<FlatDocument>,
    ) -> Result<Vec<FlatDocument>> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            if let Some(delta) = self.write(channel, doc).await? {
                out.push(delta);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use sync_core::{AnchorId, Operation, Tstamp};

    /// An in-memory stand-in for [`DocumentCache`], keyed exactly as the
    /// unique composite index spec.md §4.2 requires. No spillover — large
    /// documents just get stored inline, since `put_large`'s own threshold
    /// check happens in the writer before it ever calls through.
    #[derive(Default)]
    struct FakeCache {
        docs: Mutex<HashMap<(String, String, String), FlatDocument>>,
    }

    fn key(channel: &str, doc: &FlatDocument) -> (String, String, String) {
        (
            channel.to_string(),
            doc.instance_type().unwrap_or_default().to_string(),
            doc.id().unwrap_or_default().to_string(),
        )
    }

    #[async_trait]
    impl DocumentCache for FakeCache {
        async fn find(
            &self,
            _channel: &ChannelName,
            _anchor: &AnchorId,
            _instance_type: &str,
            _user: Option<&str>,
        ) -> Result<Vec<FlatDocument>> {
            Ok(Vec::new())
        }

        async fn find_all(&self, _channel: &ChannelName, _anchor: &AnchorId) -> Result<Vec<FlatDocument>> {
            Ok(self.docs.lock().unwrap().values().cloned().collect())
        }

        async fn replace_returning_prior(
            &self,
            channel: &ChannelName,
            doc: &FlatDocument,
        ) -> Result<Option<FlatDocument>> {
            let mut docs = self.docs.lock().unwrap();
            Ok(docs.insert(key(channel, doc), doc.clone()))
        }

        async fn delete_all(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<()> {
            self.docs
                .lock()
                .unwrap()
                .retain(|(k_channel, _, _), d| k_channel != channel || d.anchor_id() != Some(anchor.as_str()));
            Ok(())
        }

        async fn find_since(
            &self,
            channel: &ChannelName,
            anchor: &AnchorId,
            since: Tstamp,
            _user: Option<&str>,
        ) -> Result<Vec<FlatDocument>> {
            let mut docs: Vec<FlatDocument> = self
                .docs
                .lock()
                .unwrap()
                .iter()
                .filter(|((k_channel, _, _), d)| {
                    k_channel == channel
                        && d.anchor_id() == Some(anchor.as_str())
                        && d.get("_tstamp").and_then(serde_json::Value::as_f64).unwrap_or(0.0) >= since.as_f64()
                })
                .map(|(_, d)| d.clone())
                .collect();
            docs.sort_by(|a, b| {
                let ta = a.get("_tstamp").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
                let tb = b.get("_tstamp").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
                ta.partial_cmp(&tb).unwrap_or(std::cmp::Ordering::Equal)
            });
            Ok(docs)
        }

        async fn put_large(&self, channel: &ChannelName, doc: &FlatDocument) -> Result<Option<FlatDocument>> {
            self.replace_returning_prior(channel, doc).await
        }

        async fn init_channel(&self, _channel: &ChannelName) -> Result<()> {
            Ok(())
        }
    }

    fn doc(id: &str, anchor: &str, fields: &[(&str, serde_json::Value)]) -> FlatDocument {
        let mut d = FlatDocument::new("Room", id, anchor, Tstamp::new(1, 0), Operation::Create);
        for (k, v) in fields {
            d.set((*k).to_string(), v.clone());
        }
        d
    }

    #[tokio::test]
    async fn first_write_broadcasts_the_full_document() {
        let cache = Arc::new(FakeCache::default());
        let writer = DeltaWriter::new(cache);
        let channel = "rooms".to_string();

        let delta = writer.write(&channel, doc("r1", "r1", &[("name", serde_json::json!("lobby"))])).await.unwrap();
        assert!(delta.is_some());
        assert_eq!(delta.unwrap().get("name"), Some(&serde_json::json!("lobby")));
    }

    #[tokio::test]
    async fn second_write_with_one_changed_field_is_a_minimal_delta() {
        let cache = Arc::new(FakeCache::default());
        let writer = DeltaWriter::new(cache);
        let channel = "rooms".to_string();

        writer
            .write(&channel, doc("r1", "r1", &[("name", serde_json::json!("lobby")), ("capacity", serde_json::json!(10))]))
            .await
            .unwrap();

        let delta = writer
            .write(&channel, doc("r1", "r1", &[("name", serde_json::json!("lobby")), ("capacity", serde_json::json!(20))]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delta.get("capacity"), Some(&serde_json::json!(20)));
        assert_eq!(delta.get("name"), None);
    }

    #[tokio::test]
    async fn second_write_with_no_changes_emits_nothing() {
        let cache = Arc::new(FakeCache::default());
        let writer = DeltaWriter::new(cache);
        let channel = "rooms".to_string();
        let d = doc("r1", "r1", &[("name", serde_json::json!("lobby"))]);

        writer.write(&channel, d.clone()).await.unwrap();
        let second = writer.write(&channel, d).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn delete_always_broadcasts_in_full() {
        let cache = Arc::new(FakeCache::default());
        let writer = DeltaWriter::new(cache);
        let channel = "rooms".to_string();

        writer
            .write(&channel, doc("r1", "r1", &[("name", serde_json::json!("lobby"))]))
            .await
            .unwrap();

        let mut delete_doc = doc("r1", "r1", &[]);
        delete_doc.set("_deleted", serde_json::json!(true));
        delete_doc.set("_operation", serde_json::json!("delete"));

        let delta = writer.write(&channel, delete_doc).await.unwrap().unwrap();
        assert!(delta.is_deleted());
    }

    #[tokio::test]
    async fn batch_write_drops_unchanged_entries() {
        let cache = Arc::new(FakeCache::default());
        let writer = DeltaWriter::new(cache);
        let channel = "rooms".to_string();

        let first_pass = vec![
            doc("r1", "r1", &[("name", serde_json::json!("lobby"))]),
            doc("r2", "r1", &[("name", serde_json::json!("annex"))]),
        ];
        let deltas = writer.write_batch(&channel, first_pass.clone()).await.unwrap();
        assert_eq!(deltas.len(), 2);

        // Re-writing the identical batch should produce zero deltas.
        let deltas = writer.write_batch(&channel, first_pass).await.unwrap();
        assert!(deltas.is_empty());
    }
}
