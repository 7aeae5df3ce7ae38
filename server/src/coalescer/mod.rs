//! Transaction-scoped broadcast coalescing (spec.md §4.5).
//!
//! Mutations against the authoritative store happen inside a
//! [`Transaction`]; each one is enqueued rather than serialized immediately.
//! At commit time every pending entry is flushed with a single shared
//! timestamp, deduplicated by `(channel, instance_type, id)` with
//! last-write-wins; a rollback discards the pending set untouched. Delete
//! pre-images must be captured by the caller *before* the delete actually
//! happens (the object won't exist in the authoritative store by commit
//! time) — `enqueue_delete` exists precisely for that.
//!
//! The original system hooks this off its ORM's commit signal via
//! thread-local state; without an ORM to hook, this system makes the
//! transaction boundary an explicit guard over a `tokio::task_local!`.

use crate::delta::DeltaWriter;
use crate::error::Result;
use crate::router::SubscriptionRouter;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use sync_core::{AnchorId, ChannelName, FlatDocument, Tstamp};

#[derive(Clone)]
struct PendingKey {
    channel: ChannelName,
    instance_type: String,
    id: String,
}

impl PendingKey {
    fn of(channel: &ChannelName, doc: &FlatDocument) -> Self {
        Self {
            channel: channel.clone(),
            instance_type: doc.instance_type().unwrap_or_default().to_string(),
            id: doc.id().unwrap_or_default().to_string(),
        }
    }

    fn as_tuple(&self) -> (String, String, String) {
        (self.channel.clone(), self.instance_type.clone(), self.id.clone())
    }
}

struct PendingBroadcast {
    channel: ChannelName,
    anchors: Vec<AnchorId>,
    document: FlatDocument,
}

tokio::task_local! {
    static PENDING: RefCell<HashMap<(String, String, String), PendingBroadcast>>;
}

pub struct Coalescer {
    writer: Arc<DeltaWriter>,
    router: Arc<SubscriptionRouter>,
}

impl Coalescer {
    pub fn new(writer: Arc<DeltaWriter>, router: Arc<SubscriptionRouter>) -> Self {
        Self { writer, router }
    }

    /// Run `body` inside a fresh transaction scope. Callers enqueue
    /// broadcasts via [`Transaction::enqueue`] / [`Transaction::enqueue_delete`]
    /// from within `body`, then call [`Transaction::commit`] (or let it
    /// drop for an implicit rollback) before `body` returns.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Transaction<'_>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pending = RefCell::new(HashMap::new());
        PENDING
            .scope(pending, async {
                let tx = Transaction { coalescer: self };
                body(tx).await
            })
            .await
    }

    /// Expand every pending object over its own anchor list, writing and
    /// broadcasting once per anchor — a multi-anchor object (spec.md §4.3,
    /// §8 scenario 4) must reach every group it belongs to, not just the
    /// first.
    async fn flush(&self, now: Tstamp) -> Result<()> {
        let entries: Vec<PendingBroadcast> = PENDING.with(|p| p.borrow_mut().drain().map(|(_, v)| v).collect());

        for entry in entries {
            for anchor in &entry.anchors {
                let mut doc = entry.document.clone();
                doc.set("_tstamp", serde_json::Value::from(now.as_f64()));
                doc.set("_anchor_id", serde_json::Value::String(anchor.clone()));
                if let Some(delta) = self.writer.write(&entry.channel, doc).await? {
                    self.router.broadcast(&entry.channel, &delta).await?;
                }
            }
        }
        Ok(())
    }

    fn rollback(&self) {
        PENDING.with(|p| p.borrow_mut().clear());
    }
}

/// A handle into the current transaction scope, valid only inside the
/// closure passed to [`Coalescer::run`].
pub struct Transaction<'a> {
    coalescer: &'a Coalescer,
}

impl<'a> Transaction<'a> {
    /// Enqueue a created/updated object for broadcast at commit time, once
    /// per anchor in `anchors` (see `Serializer::anchors_for`). Last write
    /// for the same `(channel, instance_type, id)` within this transaction
    /// wins, anchor list included.
    pub fn enqueue(&self, channel: &ChannelName, anchors: &[AnchorId], document: FlatDocument) {
        let key = PendingKey::of(channel, &document);
        PENDING.with(|p| {
            p.borrow_mut().insert(
                key.as_tuple(),
                PendingBroadcast {
                    channel: channel.clone(),
                    anchors: anchors.to_vec(),
                    document,
                },
            );
        });
    }

    /// Enqueue a delete. `pre_image` must be captured by the caller before
    /// the authoritative delete executes, and `anchors` must come from the
    /// same pre-image — once deleted, the object's own fields can no longer
    /// answer `anchors_for`.
    pub fn enqueue_delete(&self, channel: &ChannelName, anchors: &[AnchorId], mut pre_image: FlatDocument) {
        pre_image.set("_deleted", serde_json::Value::Bool(true));
        self.enqueue(channel, anchors, pre_image);
    }

    /// Flush every enqueued broadcast with one shared timestamp, then clear
    /// the transaction scope.
    pub async fn commit(self, now: Tstamp) -> Result<()> {
        self.coalescer.flush(now).await
    }

    /// Discard every enqueued broadcast without sending anything.
    pub fn rollback(self) {
        self.coalescer.rollback();
    }
}
