//! The snapshot loader (spec.md §4.4): builds or follows an anchor's
//! initial state depending on which of the four cache states `start_session`
//! found it in, then hands control to live delta delivery.
//!
//! Grounded on `original_source/rxdjango/state_loader.py`'s `StateLoader`:
//! the `__aenter__`/`__aexit__` pair that always calls `redis.end()` becomes
//! the `load`/`load_inner` split below, and the three-way `router` list
//! (`_list_instances_cold` / `_heating` / `_hot`) becomes `build` / `follow`
//! / `serve_hot`. Every exit path — success, the anchor build failing
//! partway, or the caller's connection dropping mid-stream — calls
//! `end_session` exactly once.

use crate::cache::DocumentCache;
use crate::coordination::StateMachine;
use crate::delta::DeltaWriter;
use crate::error::{AppError, Result};
use std::sync::Arc;
use sync_core::{AnchorId, CacheState, ChannelName, FlatDocument, GraphNode, Tstamp};
use tokio::sync::mpsc;

/// How many documents the loader batches together before yielding to the
/// connection handler — keeps a single huge anchor from blocking behind one
/// giant frame.
const BATCH_SIZE: usize = 64;

pub struct SnapshotLoader {
    pub state_machine: Arc<StateMachine>,
    pub cache: Arc<dyn DocumentCache>,
    pub writer: Arc<DeltaWriter>,
}

impl SnapshotLoader {
    pub fn new(state_machine: Arc<StateMachine>, cache: Arc<dyn DocumentCache>, writer: Arc<DeltaWriter>) -> Self {
        Self {
            state_machine,
            cache,
            writer,
        }
    }

    /// Entry point the connection handler calls on connect/reconnect. A
    /// client supplying `since` (spec.md §5's `last_update`) rides the
    /// `reconnection_index` straight out of the document cache instead of
    /// replaying the full snapshot — but only once the anchor is HOT, since
    /// a COLD/HEATING/COOLING cache may be mid-rebuild and not reflect the
    /// range being asked for. Anything else falls through to [`Self::load`].
    pub async fn load_or_catch_up(
        &self,
        channel: &ChannelName,
        channel_def: &crate::channel::Channel,
        anchor_id: &AnchorId,
        user: Option<&str>,
        since: Option<Tstamp>,
        out: mpsc::Sender<Vec<FlatDocument>>,
        cancelled: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        if let Some(since) = since {
            if self.anchor_is_hot(channel, anchor_id).await? {
                return self.catch_up(channel, anchor_id, user, since, &out).await;
            }
        }
        self.load(channel, channel_def, anchor_id, user, out, cancelled).await
    }

    /// Ride the `(_anchor_id, _tstamp desc)` index directly: every document
    /// touched since `since`, ascending, followed by the usual sentinel.
    /// Bypasses `start_session`/`end_session` entirely — there's no build to
    /// coordinate, just a read against a cache already known to be complete.
    async fn catch_up(
        &self,
        channel: &ChannelName,
        anchor_id: &AnchorId,
        user: Option<&str>,
        since: Tstamp,
        out: &mpsc::Sender<Vec<FlatDocument>>,
    ) -> Result<()> {
        let docs = self.cache.find_since(channel, anchor_id, since, user).await?;
        if !docs.is_empty() {
            out.send(docs)
                .await
                .map_err(|_| AppError::InternalInvariant("connection dropped mid-catch-up".into()))?;
        }

        let now = self.state_machine.client().now().await?;
        out.send(vec![FlatDocument::end_initial_state(now)])
            .await
            .map_err(|_| AppError::InternalInvariant("connection dropped before sentinel".into()))
    }

    /// Build or follow the anchor's initial state for `user`, sending
    /// `_user_key`-filtered batches (and finally the end-of-stream
    /// sentinel) on `out`. Always calls `end_session` before returning, on
    /// every exit path, mirroring `StateLoader.__aexit__`.
    ///
    /// `cancelled` lets the caller interrupt an in-flight load (a dropped
    /// connection, spec.md §5 Cancellation) without skipping `end_session`:
    /// the load races against the watch firing, and whichever wins decides
    /// `success`.
    pub async fn load(
        &self,
        channel: &ChannelName,
        channel_def: &crate::channel::Channel,
        anchor_id: &AnchorId,
        user: Option<&str>,
        out: mpsc::Sender<Vec<FlatDocument>>,
        mut cancelled: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let prior = self.state_machine.start_session(channel, anchor_id).await?;
        let result = tokio::select! {
            r = self.load_inner(channel, channel_def, anchor_id, user, prior, &out) => r,
            _ = cancelled.changed() => Err(AppError::Transient("connection closed during load".into())),
        };
        self.state_machine
            .end_session(channel, anchor_id, prior, result.is_ok())
            .await?;
        result
    }

    async fn load_inner(
        &self,
        channel: &ChannelName,
        channel_def: &crate::channel::Channel,
        anchor_id: &AnchorId,
        user: Option<&str>,
        prior: CacheState,
        out: &mpsc::Sender<Vec<FlatDocument>>,
    ) -> Result<()> {
        match prior {
            CacheState::Cold => self.build(channel, channel_def, anchor_id, user, out).await,
            CacheState::Heating => self.follow(channel, anchor_id, user, out).await,
            CacheState::Hot => self.serve_hot(channel, channel_def, anchor_id, user, out).await,
            CacheState::Cooling => Err(AppError::InternalInvariant(
                "start_session never hands back Cooling as a prior state".into(),
            )),
        }
    }

    /// This session is responsible for the build: clear any stale documents
    /// left behind by an interrupted prior cycle, walk the declared graph
    /// from the authoritative store, and write + broadcast batches as they
    /// come off the wire. Corresponds to `_list_instances_cold`.
    async fn build(
        &self,
        channel: &ChannelName,
        channel_def: &crate::channel::Channel,
        anchor_id: &AnchorId,
        user: Option<&str>,
        out: &mpsc::Sender<Vec<FlatDocument>>,
    ) -> Result<()> {
        self.cache.delete_all(channel, anchor_id).await?;

        let anchor_root = channel_def
            .store
            .fetch_anchor(anchor_id)
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?
            .ok_or_else(|| AppError::AnchorNotFound(anchor_id.clone()))?;

        let tstamp = self.state_machine.client().now().await?;
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        self.walk_graph(
            channel_def,
            channel,
            anchor_id,
            user,
            channel_def.graph.root(),
            &anchor_root,
            tstamp,
            &mut batch,
            out,
        )
        .await?;
        if !batch.is_empty() {
            self.flush_batch(channel, anchor_id, user, &mut batch, out).await?;
        }

        self.state_machine.end_write(channel, anchor_id).await?;

        let sentinel = FlatDocument::end_initial_state(tstamp);
        out.send(vec![sentinel])
            .await
            .map_err(|_| AppError::InternalInvariant("connection dropped before sentinel".into()))
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_graph<'a>(
        &'a self,
        channel_def: &'a crate::channel::Channel,
        channel: &'a ChannelName,
        anchor_id: &'a AnchorId,
        user: Option<&'a str>,
        node: &'a GraphNode,
        object: &'a serde_json::Value,
        tstamp: sync_core::Tstamp,
        batch: &'a mut Vec<FlatDocument>,
        out: &'a mpsc::Sender<Vec<FlatDocument>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(serializer) = channel_def.serializer_for(&node.instance_type) {
                let doc = serializer
                    .serialize(object, tstamp, sync_core::Operation::InitialState)
                    .map_err(AppError::Core)?;
                batch.push(doc);
                if batch.len() >= BATCH_SIZE {
                    self.flush_batch(channel, anchor_id, user, batch, out).await?;
                }
            }

            for edge in &node.children {
                let children = channel_def
                    .store
                    .fetch_children(object, edge)
                    .await
                    .map_err(|e| AppError::Transient(e.to_string()))?;
                for child in &children {
                    self.walk_graph(channel_def, channel, anchor_id, user, &edge.child, child, tstamp, batch, out)
                        .await?;
                }
            }
            Ok(())
        })
    }

    async fn flush_batch(
        &self,
        channel: &ChannelName,
        anchor_id: &AnchorId,
        user: Option<&str>,
        batch: &mut Vec<FlatDocument>,
        out: &mpsc::Sender<Vec<FlatDocument>>,
    ) -> Result<()> {
        let docs = std::mem::take(batch);
        self.append_and_send(channel, anchor_id, user, docs, out).await
    }

    /// Persist a batch to both the document cache and the anchor's instance
    /// list concurrently, wake any followers, then hand the user-filtered
    /// batch to the connection handler. Both writes complete before the
    /// batch is handed off — a follower never sees an `instances` entry
    /// whose cache write hasn't landed yet.
    async fn append_and_send(
        &self,
        channel: &ChannelName,
        anchor_id: &AnchorId,
        user: Option<&str>,
        docs: Vec<FlatDocument>,
        out: &mpsc::Sender<Vec<FlatDocument>>,
    ) -> Result<()> {
        let encoded: Vec<String> = docs.iter().map(|d| serde_json::to_string(d).unwrap_or_default()).collect();

        let cache_write = self.writer.write_batch(channel, docs.clone());
        let list_write = self.state_machine.write_instances(channel, anchor_id, &encoded);
        let (cache_result, list_result) = tokio::join!(cache_write, list_write);
        cache_result?;
        list_result?;

        let visible: Vec<FlatDocument> = docs.into_iter().filter(|d| user_visible(d, user)).collect();
        if visible.is_empty() {
            return Ok(());
        }
        out.send(visible)
            .await
            .map_err(|_| AppError::InternalInvariant("connection dropped mid-build".into()))
    }

    /// Another session is already building; tail the `instances` list from
    /// the coordination store until the negative-length sentinel arrives.
    /// Corresponds to `RedisStateSession.list_instances` /
    /// `_list_instances_heating`.
    async fn follow(
        &self,
        channel: &ChannelName,
        anchor_id: &AnchorId,
        user: Option<&str>,
        out: &mpsc::Sender<Vec<FlatDocument>>,
    ) -> Result<()> {
        let keys = crate::coordination::AnchorKeys::new(channel, anchor_id);
        let subscriber = self.state_machine.client().subscribe(&keys.instances_trigger()).await?;
        let mut messages = subscriber.message_rx();

        let mut cursor: i64 = 0;
        let mut instances_length = self.state_machine.client().list_len(&keys.instances()).await?;
        let mut last_length: i64 = 0;

        loop {
            if cursor < instances_length {
                let raw_entries = self
                    .state_machine
                    .client()
                    .list_range_from(&keys.instances(), cursor)
                    .await?;
                cursor = instances_length;

                let docs: Vec<FlatDocument> = raw_entries
                    .iter()
                    .filter_map(|raw| serde_json::from_str(raw).ok())
                    .filter(|d: &FlatDocument| user_visible(d, user))
                    .collect();
                if !docs.is_empty() {
                    out.send(docs)
                        .await
                        .map_err(|_| AppError::InternalInvariant("connection dropped mid-follow".into()))?;
                }
            }

            if last_length < 0 {
                return self.send_heating_sentinel(out).await;
            }

            tokio::select! {
                msg = messages.recv() => {
                    if let Ok(message) = msg {
                        if let Some(n) = crate::coordination::CoordinationClient::parse_trigger_payload(&message) {
                            last_length = n;
                            instances_length = n.abs();
                        }
                    }
                }
                // `list_instances`' belt-and-suspenders poll: absent a
                // pub/sub wakeup within 5 seconds, check the list length
                // and the anchor state directly rather than suspending
                // forever — covers a missed `PUBLISH`.
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                    let current = self.state_machine.client().list_len(&keys.instances()).await?;
                    if current == instances_length {
                        if self.anchor_is_hot(channel, anchor_id).await? {
                            return self.send_heating_sentinel(out).await;
                        }
                    } else {
                        instances_length = current;
                    }
                }
            }
        }
    }

    /// Every variant's stream ends with the `end_initial_state` sentinel
    /// (spec.md §4.7) — the COLD builder emits its own once it has read the
    /// coordination clock for the build; a HEATING follower reads it fresh
    /// here once its tail of `instances` has drained.
    async fn send_heating_sentinel(&self, out: &mpsc::Sender<Vec<FlatDocument>>) -> Result<()> {
        let now = self.state_machine.client().now().await?;
        out.send(vec![FlatDocument::end_initial_state(now)])
            .await
            .map_err(|_| AppError::InternalInvariant("connection dropped before sentinel".into()))
    }

    async fn anchor_is_hot(&self, channel: &ChannelName, anchor_id: &AnchorId) -> Result<bool> {
        let keys = crate::coordination::AnchorKeys::new(channel, anchor_id);
        let raw = self.state_machine.client().get_state(&keys.state()).await?;
        Ok(raw == Some(2))
    }

    /// The anchor is HOT: read straight out of the persistent document
    /// cache, one batch per declared type in declaration order, filtered by
    /// user. Corresponds to `_list_instances_hot` / `MongoStateSession.list_instances`.
    async fn serve_hot(
        &self,
        channel: &ChannelName,
        channel_def: &crate::channel::Channel,
        anchor_id: &AnchorId,
        user: Option<&str>,
        out: &mpsc::Sender<Vec<FlatDocument>>,
    ) -> Result<()> {
        for node in channel_def.graph.nodes_in_declaration_order() {
            let docs = self.cache.find(channel, anchor_id, &node.instance_type, user).await?;
            if !docs.is_empty() {
                out.send(docs)
                    .await
                    .map_err(|_| AppError::InternalInvariant("connection dropped mid-hot-serve".into()))?;
            }
        }

        let now = self.state_machine.client().now().await?;
        out.send(vec![FlatDocument::end_initial_state(now)])
            .await
            .map_err(|_| AppError::InternalInvariant("connection dropped before sentinel".into()))
    }
}

/// `_user_filter`: a document with no `_user_key` is visible to everyone;
/// one with a `_user_key` is visible only to that user.
fn user_visible(doc: &FlatDocument, user: Option<&str>) -> bool {
    match doc.user_key() {
        None => true,
        Some(owner) => Some(owner) == user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{Operation as CoreOperation, Tstamp};

    fn doc_with_user(user_key: Option<&str>) -> FlatDocument {
        let mut d = FlatDocument::new("Room", "r1", "r1", Tstamp::new(1, 0), CoreOperation::Create);
        if let Some(u) = user_key {
            d.set("_user_key", serde_json::Value::String(u.to_string()));
        }
        d
    }

    #[test]
    fn document_without_user_key_is_visible_to_everyone() {
        let doc = doc_with_user(None);
        assert!(user_visible(&doc, Some("alice")));
        assert!(user_visible(&doc, None));
    }

    #[test]
    fn document_with_user_key_is_visible_only_to_its_owner() {
        let doc = doc_with_user(Some("alice"));
        assert!(user_visible(&doc, Some("alice")));
        assert!(!user_visible(&doc, Some("bob")));
        assert!(!user_visible(&doc, None));
    }
}
