//! Persistent document cache, backed by one MongoDB collection per channel
//! plus a GridFS bucket for documents too large to store inline.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::io::AsyncReadExt;
use futures::stream::TryStreamExt;
use mongodb::{
    gridfs::GridFsBucket,
    options::IndexOptions,
    Client, Collection, Database, IndexModel,
};
use sync_core::{AnchorId, ChannelName, FlatDocument, Tstamp};

/// MongoDB's single-document BSON ceiling; above this, the document body is
/// spilled into GridFS and the cache record keeps only a pointer. Exposed so
/// the delta writer can recognize a spillover write and broadcast the full
/// reference record instead of attempting a minimal diff against it.
pub const MAX_INLINE_DOCUMENT_BYTES: usize = 16 * 1024 * 1024 - 4096;

#[async_trait]
pub trait DocumentCache: Send + Sync {
    /// `find(anchor, type, user_filter)` (spec.md §4.2): every
    /// non-deleted document of `instance_type` under `anchor` visible to
    /// `user` — either `_user_key` absent, or equal to `user`. This is what
    /// the HOT loader variant streams straight to a client, one call per
    /// declared type in declaration order.
    async fn find(
        &self,
        channel: &ChannelName,
        anchor: &AnchorId,
        instance_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<FlatDocument>>;

    /// Every cached document for an anchor, across all instance types and
    /// users, deleted documents included — used by the COOLING operator to
    /// migrate documents back into the in-memory instance list, and by the
    /// sweeper's dry-run diagnostic.
    async fn find_all(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<Vec<FlatDocument>>;

    /// Upsert a document by its composite key, returning whatever was
    /// stored there before (used by the delta writer to compute the
    /// minimal diff).
    async fn replace_returning_prior(
        &self,
        channel: &ChannelName,
        doc: &FlatDocument,
    ) -> Result<Option<FlatDocument>>;

    /// Remove every cached document for an anchor (COLD rebuild, cooling
    /// clear).
    async fn delete_all(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<()>;

    /// Every document for an anchor with `_tstamp >= since`, ascending by
    /// `_tstamp`, visible to `user`, deletions included — the reconnect
    /// catch-up query (spec.md §5) a client supplying `last_update` rides
    /// instead of replaying the full snapshot. Runs against the
    /// `reconnection_index` built in [`DocumentCache::init_channel`].
    async fn find_since(
        &self,
        channel: &ChannelName,
        anchor: &AnchorId,
        since: Tstamp,
        user: Option<&str>,
    ) -> Result<Vec<FlatDocument>>;

    /// Upsert a document, spilling its body into GridFS first when it
    /// exceeds the inline size threshold and leaving a pointer record
    /// behind. Returns whatever was stored there before, same as
    /// [`DocumentCache::replace_returning_prior`].
    async fn put_large(&self, channel: &ChannelName, doc: &FlatDocument) -> Result<Option<FlatDocument>>;

    /// Ensure the unique composite index and the reconnection index exist
    /// for a channel's collection. Called once at channel registration.
    async fn init_channel(&self, channel: &ChannelName) -> Result<()>;
}

pub struct MongoDocumentCache {
    db: Database,
}

impl MongoDocumentCache {
    pub async fn connect(url: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(url)
            .await
            .map_err(|e| AppError::Transient(format!("mongo connect failed: {e}")))?;
        Ok(Self {
            db: client.database(db_name),
        })
    }

    fn collection(&self, channel: &ChannelName) -> Collection<Document> {
        self.db.collection(channel)
    }

    fn bucket(&self, channel: &ChannelName) -> GridFsBucket {
        self.db.gridfs_bucket(
            mongodb::options::GridFsBucketOptions::builder()
                .bucket_name(Some(format!("{channel}_blobs")))
                .build(),
        )
    }

    fn to_bson_document(doc: &FlatDocument) -> Result<Document> {
        bson::to_document(doc.as_map())
            .map_err(|e| AppError::InternalInvariant(format!("document not bson-representable: {e}")))
    }

    fn from_bson_document(doc: Document) -> Result<FlatDocument> {
        let value: serde_json::Value = bson::from_document(doc)
            .map_err(|e| AppError::InternalInvariant(format!("cached document not json-representable: {e}")))?;
        FlatDocument::from_object(value).map_err(AppError::Core)
    }

    /// Transparently resolve a `_grid_ref` pointer record back into the full
    /// document it stands in for. A document without one is returned
    /// untouched, so every read path can run every result through this
    /// unconditionally.
    async fn dereference(&self, channel: &ChannelName, doc: FlatDocument) -> Result<FlatDocument> {
        let Some(grid_ref) = doc.grid_ref().map(str::to_string) else {
            return Ok(doc);
        };

        let file_id = bson::oid::ObjectId::parse_str(&grid_ref)
            .map_err(|e| AppError::InternalInvariant(format!("malformed grid ref: {e}")))?;
        let mut stream = self
            .bucket(channel)
            .open_download_stream(Bson::ObjectId(file_id))
            .await
            .map_err(|e| AppError::Transient(format!("gridfs download failed: {e}")))?;

        let mut body = Vec::new();
        stream
            .read_to_end(&mut body)
            .await
            .map_err(|e| AppError::Transient(format!("gridfs read failed: {e}")))?;

        let value: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| AppError::InternalInvariant(format!("spilled document not json: {e}")))?;
        FlatDocument::from_object(value).map_err(AppError::Core)
    }
}

#[async_trait]
impl DocumentCache for MongoDocumentCache {
    async fn find(
        &self,
        channel: &ChannelName,
        anchor: &AnchorId,
        instance_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<FlatDocument>> {
        let collection = self.collection(channel);
        let user_filter = match user {
            Some(user) => doc! { "$in": [Bson::Null, user] },
            None => doc! { "$eq": Bson::Null },
        };
        let filter = doc! {
            "_anchor_id": anchor,
            "_instance_type": instance_type,
            "_user_key": user_filter,
            "_deleted": doc! { "$ne": true },
        };
        let mut cursor = collection
            .find(filter)
            .await
            .map_err(|e| AppError::Transient(format!("document cache find failed: {e}")))?;

        let mut out = Vec::new();
        while let Some(raw) = cursor
            .try_next()
            .await
            .map_err(|e| AppError::Transient(format!("document cache cursor failed: {e}")))?
        {
            let doc = Self::from_bson_document(raw)?;
            out.push(self.dereference(channel, doc).await?);
        }
        Ok(out)
    }

    async fn find_all(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<Vec<FlatDocument>> {
        let collection = self.collection(channel);
        let mut cursor = collection
            .find(doc! { "_anchor_id": anchor })
            .await
            .map_err(|e| AppError::Transient(format!("document cache find failed: {e}")))?;

        let mut out = Vec::new();
        while let Some(raw) = cursor
            .try_next()
            .await
            .map_err(|e| AppError::Transient(format!("document cache cursor failed: {e}")))?
        {
            let doc = Self::from_bson_document(raw)?;
            out.push(self.dereference(channel, doc).await?);
        }
        Ok(out)
    }

    async fn find_since(
        &self,
        channel: &ChannelName,
        anchor: &AnchorId,
        since: Tstamp,
        user: Option<&str>,
    ) -> Result<Vec<FlatDocument>> {
        let collection = self.collection(channel);
        let user_filter = match user {
            Some(user) => doc! { "$in": [Bson::Null, user] },
            None => doc! { "$eq": Bson::Null },
        };
        let filter = doc! {
            "_anchor_id": anchor,
            "_tstamp": doc! { "$gte": since.as_f64() },
            "_user_key": user_filter,
        };
        let mut cursor = collection
            .find(filter)
            .sort(doc! { "_tstamp": 1 })
            .await
            .map_err(|e| AppError::Transient(format!("document cache find failed: {e}")))?;

        let mut out = Vec::new();
        while let Some(raw) = cursor
            .try_next()
            .await
            .map_err(|e| AppError::Transient(format!("document cache cursor failed: {e}")))?
        {
            let doc = Self::from_bson_document(raw)?;
            out.push(self.dereference(channel, doc).await?);
        }
        Ok(out)
    }

    async fn replace_returning_prior(
        &self,
        channel: &ChannelName,
        new_doc: &FlatDocument,
    ) -> Result<Option<FlatDocument>> {
        let collection = self.collection(channel);
        let user_key_bson = match new_doc.user_key() {
            Some(user) => Bson::String(user.to_string()),
            None => Bson::Null,
        };
        let filter = doc! {
            "_anchor_id": new_doc.anchor_id().unwrap_or_default(),
            "_user_key": user_key_bson,
            "_instance_type": new_doc.instance_type().unwrap_or_default(),
            "id": new_doc.id().unwrap_or_default(),
        };
        let bson_doc = Self::to_bson_document(new_doc)?;

        let prior = collection
            .find_one_and_replace(filter.clone(), bson_doc)
            .with_options(
                mongodb::options::FindOneAndReplaceOptions::builder()
                    .upsert(true)
                    .return_document(mongodb::options::ReturnDocument::Before)
                    .build(),
            )
            .await
            .map_err(|e| AppError::Transient(format!("document cache replace failed: {e}")))?;

        prior.map(Self::from_bson_document).transpose()
    }

    async fn delete_all(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<()> {
        let collection = self.collection(channel);
        collection
            .delete_many(doc! { "_anchor_id": anchor })
            .await
            .map_err(|e| AppError::Transient(format!("document cache clear failed: {e}")))?;
        Ok(())
    }

    async fn put_large(&self, channel: &ChannelName, doc: &FlatDocument) -> Result<Option<FlatDocument>> {
        let body = serde_json::to_vec(&doc.clone().into_value())
            .map_err(|e| AppError::InternalInvariant(format!("document not serializable: {e}")))?;

        if body.len() <= MAX_INLINE_DOCUMENT_BYTES {
            return self.replace_returning_prior(channel, doc).await;
        }

        let bucket = self.bucket(channel);
        let filename = format!(
            "{}-{}",
            doc.instance_type().unwrap_or_default(),
            doc.id().unwrap_or_default()
        );
        let file_id = bucket
            .upload_from_stream(&filename, body.as_slice(), None)
            .await
            .map_err(|e| AppError::Transient(format!("gridfs upload failed: {e}")))?;

        // The pointer record itself must stay well under the ceiling, so it
        // carries only meta fields plus the reference — never the original
        // (oversized) payload.
        let mut pointer = doc.clone();
        pointer.retain_meta_only();
        pointer.set("_grid_ref", serde_json::Value::String(file_id.to_hex()));
        self.replace_returning_prior(channel, &pointer).await
    }

    async fn init_channel(&self, channel: &ChannelName) -> Result<()> {
        let collection = self.collection(channel);

        let pkey = IndexModel::builder()
            .keys(doc! {
                "_anchor_id": 1, "_user_key": 1, "_instance_type": 1, "id": 1,
            })
            .options(
                IndexOptions::builder()
                    .name(Some("instance_pkey".to_string()))
                    .unique(true)
                    .build(),
            )
            .build();

        let reconnection = IndexModel::builder()
            .keys(doc! { "_anchor_id": 1, "_tstamp": -1 })
            .options(
                IndexOptions::builder()
                    .name(Some("reconnection_index".to_string()))
                    .build(),
            )
            .build();

        collection
            .create_index(pkey)
            .await
            .map_err(|e| AppError::Transient(format!("index creation failed: {e}")))?;
        collection
            .create_index(reconnection)
            .await
            .map_err(|e| AppError::Transient(format!("index creation failed: {e}")))?;
        Ok(())
    }
}
