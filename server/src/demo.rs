//! A minimal "rooms" channel: Room anchors containing Messages and
//! Participants, backed by an in-memory authoritative store. Exercises every
//! piece a real channel declaration needs — graph, serializers, an
//! authorizer, one RPC action — and is what spec.md §8 scenario 1's "cold
//! first connect against anchor 42" walks through end to end.
//!
//! Not meant to be a template for a real deployment's data model; it exists
//! so the server has at least one channel registered at startup.

use crate::cache::DocumentCache;
use crate::channel::{Action, AllowAll, Channel, GroupEventHandler};
use crate::coalescer::Transaction;
use crate::error::{AppError, Result};
use crate::router::SubscriptionRouter;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use sync_core::{
    AnchorId, AuthoritativeStore, FlatDocument, GraphEdge, GraphNode, Operation, SchemaGraph,
    Serializer, StoreError, StoreResult, Tstamp,
};

#[derive(Debug, Clone)]
struct RoomRecord {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct MessageRecord {
    id: String,
    room_id: String,
    author: String,
    text: String,
    /// A message cross-posted into a second room — the fixture this demo
    /// uses to exercise a genuinely multi-anchor object (spec.md §4.3, §8
    /// scenario 4): one `Message` visible from, and deleted out of, two
    /// anchors at once.
    also_room_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ParticipantRecord {
    id: String,
    room_id: String,
    user: String,
}

#[derive(Default)]
struct RoomsState {
    rooms: HashMap<String, RoomRecord>,
    messages: HashMap<String, MessageRecord>,
    participants: HashMap<String, ParticipantRecord>,
    next_message_id: u64,
}

/// The authoritative store backing the "rooms" channel. A real deployment
/// would read this from a relational database; here it's a fixture seeded
/// at startup with one room (anchor `"42"`) so the channel has something to
/// serve.
pub struct RoomsStore {
    state: RwLock<RoomsState>,
}

impl RoomsStore {
    pub fn new() -> Self {
        let mut state = RoomsState::default();
        state.rooms.insert(
            "42".to_string(),
            RoomRecord {
                id: "42".to_string(),
                name: "lobby".to_string(),
            },
        );
        state.participants.insert(
            "p1".to_string(),
            ParticipantRecord {
                id: "p1".to_string(),
                room_id: "42".to_string(),
                user: "alice".to_string(),
            },
        );
        Self {
            state: RwLock::new(state),
        }
    }

    fn insert_message(&self, room_id: &str, author: &str, text: &str, also_room_id: Option<String>) -> MessageRecord {
        let mut state = self.state.write().expect("rooms store lock poisoned");
        state.next_message_id += 1;
        let record = MessageRecord {
            id: state.next_message_id.to_string(),
            room_id: room_id.to_string(),
            author: author.to_string(),
            text: text.to_string(),
            also_room_id,
        };
        state.messages.insert(record.id.clone(), record.clone());
        record
    }

    fn delete_message(&self, id: &str) -> Option<MessageRecord> {
        let mut state = self.state.write().expect("rooms store lock poisoned");
        state.messages.remove(id)
    }
}

impl Default for RoomsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthoritativeStore for RoomsStore {
    async fn fetch_anchor(&self, anchor_id: &AnchorId) -> StoreResult<Option<Value>> {
        let state = self.state.read().map_err(|e| StoreError(e.to_string()))?;
        Ok(state.rooms.get(anchor_id).map(|r| json!({"id": r.id, "name": r.name})))
    }

    async fn fetch_children(&self, parent: &Value, edge: &GraphEdge) -> StoreResult<Vec<Value>> {
        let state = self.state.read().map_err(|e| StoreError(e.to_string()))?;
        let room_id = parent["id"].as_str().unwrap_or_default();
        let children = match edge.child.instance_type.as_str() {
            "Message" => state
                .messages
                .values()
                .filter(|m| m.room_id == room_id || m.also_room_id.as_deref() == Some(room_id))
                .map(|m| {
                    json!({
                        "id": m.id,
                        "room_id": m.room_id,
                        "author": m.author,
                        "text": m.text,
                        "also_room_id": m.also_room_id,
                    })
                })
                .collect(),
            "Participant" => state
                .participants
                .values()
                .filter(|p| p.room_id == room_id)
                .map(|p| json!({"id": p.id, "room_id": p.room_id, "user": p.user}))
                .collect(),
            _ => Vec::new(),
        };
        Ok(children)
    }
}

struct RoomSerializer;

impl Serializer for RoomSerializer {
    fn instance_type(&self) -> String {
        "Room".into()
    }

    fn serialize(&self, object: &Value, tstamp: Tstamp, operation: Operation) -> sync_core::error::Result<FlatDocument> {
        let id = object["id"].as_str().unwrap_or_default();
        let mut doc = FlatDocument::new("Room", id, id, tstamp, operation);
        doc.set("name", object["name"].clone());
        Ok(doc)
    }

    fn anchors_for(&self, object: &Value) -> Vec<AnchorId> {
        vec![object["id"].as_str().unwrap_or_default().to_string()]
    }
}

struct MessageSerializer;

impl Serializer for MessageSerializer {
    fn instance_type(&self) -> String {
        "Message".into()
    }

    fn serialize(&self, object: &Value, tstamp: Tstamp, operation: Operation) -> sync_core::error::Result<FlatDocument> {
        let id = object["id"].as_str().unwrap_or_default();
        let room_id = object["room_id"].as_str().unwrap_or_default();
        let mut doc = FlatDocument::new("Message", id, room_id, tstamp, operation);
        doc.set("room_id", object["room_id"].clone());
        doc.set("author", object["author"].clone());
        doc.set("text", object["text"].clone());
        if let Some(also) = object["also_room_id"].as_str() {
            doc.set("also_room_id", Value::String(also.to_string()));
        }
        Ok(doc)
    }

    /// A message belongs to its `room_id`, plus `also_room_id` when it was
    /// cross-posted — the one object in this demo visible from, and
    /// deletable out of, more than one anchor at a time.
    fn anchors_for(&self, object: &Value) -> Vec<AnchorId> {
        let mut anchors = vec![object["room_id"].as_str().unwrap_or_default().to_string()];
        if let Some(also) = object["also_room_id"].as_str() {
            anchors.push(also.to_string());
        }
        anchors
    }
}

struct ParticipantSerializer;

impl Serializer for ParticipantSerializer {
    fn instance_type(&self) -> String {
        "Participant".into()
    }

    fn serialize(&self, object: &Value, tstamp: Tstamp, operation: Operation) -> sync_core::error::Result<FlatDocument> {
        let id = object["id"].as_str().unwrap_or_default();
        let room_id = object["room_id"].as_str().unwrap_or_default();
        let mut doc = FlatDocument::new("Participant", id, room_id, tstamp, operation);
        doc.set("room_id", object["room_id"].clone());
        doc.set("user", object["user"].clone());
        Ok(doc)
    }

    fn anchors_for(&self, object: &Value) -> Vec<AnchorId> {
        vec![object["room_id"].as_str().unwrap_or_default().to_string()]
    }
}

/// `sendMessage({text})`: appends a message to the room the caller invoked
/// it against and enqueues its broadcast for commit. The authoritative
/// write happens directly against `RoomsStore` since this demo has no
/// separate write-side repository layer.
struct SendMessage {
    store: Arc<RoomsStore>,
}

#[async_trait]
impl Action for SendMessage {
    async fn call(&self, tx: &Transaction<'_>, anchor_id: &str, user: &str, params: Value) -> Result<Value> {
        let text = params["text"]
            .as_str()
            .ok_or_else(|| AppError::BadRequest("sendMessage requires a \"text\" field".into()))?;
        let also_room_id = params["alsoRoomId"].as_str().map(str::to_string);

        let record = self.store.insert_message(anchor_id, user, text, also_room_id);
        let object = json!({
            "id": record.id,
            "room_id": record.room_id,
            "author": record.author,
            "text": record.text,
            "also_room_id": record.also_room_id,
        });

        let serializer = MessageSerializer;
        let now = Tstamp::new(0, 0); // overwritten with the shared commit tstamp on flush
        let doc = serializer
            .serialize(&object, now, Operation::Create)
            .map_err(AppError::Core)?;
        let anchors = serializer.anchors_for(&object);
        tx.enqueue(&"rooms".to_string(), &anchors, doc);

        Ok(json!({"id": record.id}))
    }
}

/// `deleteMessage({id})`: removes a message and broadcasts its delete to
/// every anchor it was visible from, including a cross-posted
/// `also_room_id` — the delete half of the multi-anchor scenario
/// `SendMessage`'s `alsoRoomId` sets up.
struct DeleteMessage {
    store: Arc<RoomsStore>,
}

#[async_trait]
impl Action for DeleteMessage {
    async fn call(&self, tx: &Transaction<'_>, _anchor_id: &str, _user: &str, params: Value) -> Result<Value> {
        let id = params["id"]
            .as_str()
            .ok_or_else(|| AppError::BadRequest("deleteMessage requires an \"id\" field".into()))?;

        let record = self
            .store
            .delete_message(id)
            .ok_or_else(|| AppError::BadRequest(format!("no such message: {id}")))?;
        let object = json!({
            "id": record.id,
            "room_id": record.room_id,
            "author": record.author,
            "text": record.text,
            "also_room_id": record.also_room_id,
        });

        let serializer = MessageSerializer;
        let now = Tstamp::new(0, 0);
        let pre_image = serializer.serialize_delete(&object, now).map_err(AppError::Core)?;
        let anchors = serializer.anchors_for(&object);
        tx.enqueue_delete(&"rooms".to_string(), &anchors, pre_image);

        Ok(json!({"id": record.id}))
    }
}

/// `invite({roomId})`: notifies the room's members of a second room worth
/// following, via a group event rather than a document delta (spec.md
/// §4.7's "Server -> client other" frames). Exercises the group-event
/// dispatch path end to end: `RoomInviteHandler` below turns the
/// `"roomInvite"` event this action publishes into a `{prependAnchor}`
/// frame for every connection following the anchor.
struct InviteToRoom {
    router: Arc<SubscriptionRouter>,
}

#[async_trait]
impl Action for InviteToRoom {
    async fn call(&self, _tx: &Transaction<'_>, anchor_id: &str, _user: &str, params: Value) -> Result<Value> {
        let room_id = params["roomId"]
            .as_str()
            .ok_or_else(|| AppError::BadRequest("invite requires a \"roomId\" field".into()))?;

        self.router
            .broadcast_group_event(&"rooms".to_string(), &anchor_id.to_string(), "roomInvite", json!({"roomId": room_id}))
            .await?;

        Ok(json!({"invited": room_id}))
    }
}

/// Turns a `"roomInvite"` group event into the `{prependAnchor}` frame that
/// tells a connection to start following the invited room, without it
/// reconnecting.
struct RoomInviteHandler;

#[async_trait]
impl GroupEventHandler for RoomInviteHandler {
    async fn handle(&self, _anchor_id: &str, payload: Value) -> Result<Option<Value>> {
        let room_id = payload["roomId"]
            .as_str()
            .ok_or_else(|| AppError::InternalInvariant("roomInvite payload missing roomId".into()))?;
        Ok(Some(crate::handlers::connection::prepend_anchor_frame(room_id)))
    }
}

/// Register the "rooms" channel and seed its document-cache indexes. Called
/// once at startup.
pub async fn register(cache: Arc<dyn DocumentCache>, router: Arc<SubscriptionRouter>) -> Result<()> {
    let store: Arc<RoomsStore> = Arc::new(RoomsStore::new());

    let graph = SchemaGraph::new(
        GraphNode::leaf("Room")
            .with_child("room_id", GraphNode::leaf("Message"))
            .with_child("room_id", GraphNode::leaf("Participant")),
    )
    .map_err(AppError::Core)?;

    let mut serializers: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
    serializers.insert("Room".into(), Arc::new(RoomSerializer));
    serializers.insert("Message".into(), Arc::new(MessageSerializer));
    serializers.insert("Participant".into(), Arc::new(ParticipantSerializer));

    let mut actions: HashMap<String, Arc<dyn Action>> = HashMap::new();
    actions.insert("sendMessage".into(), Arc::new(SendMessage { store: store.clone() }));
    actions.insert("deleteMessage".into(), Arc::new(DeleteMessage { store: store.clone() }));
    actions.insert("invite".into(), Arc::new(InviteToRoom { router }));

    let mut group_events: HashMap<String, Arc<dyn GroupEventHandler>> = HashMap::new();
    group_events.insert("roomInvite".into(), Arc::new(RoomInviteHandler));

    let channel = Channel {
        name: "rooms".to_string(),
        graph,
        store,
        serializers,
        actions,
        group_events,
        authorizer: Arc::new(AllowAll),
    };

    cache.init_channel(&channel.name).await?;
    crate::channel_registry::ChannelRegistry::register(channel);
    Ok(())
}
