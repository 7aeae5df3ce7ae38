//! The per-connection state machine (spec.md §4.7): handshake, stream the
//! initial snapshot, then relay live deltas and RPC calls until disconnect.
//!
//! Grounded on `original_source/rxdjango/consumers.py`'s `StateConsumer`
//! (authenticate -> subscribe -> load -> dispatch) and the removed
//! `handlers/websocket.rs`'s outgoing mpsc/send-task split, which this keeps:
//! one task drains an `mpsc::UnboundedSender<Value>` into the socket while
//! the connection's own task owns reading and dispatch.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{FlatDocument, Tstamp};
use tokio::sync::{mpsc, watch};

use crate::channel::Channel;
use crate::channel_registry::ChannelRegistry;
use crate::error::Result;
use crate::handlers::auth::{authenticate, authorize, AuthUser};
use crate::router::SubscriptionRouter;
use crate::websocket::protocol::{
    ActionCall, ActionErrorFrame, ActionResult, AnchorSubscriptionRequest, AuthMessage,
    ClientFrame, InitialAnchorsFrame, PrependAnchorFrame, StatusFrame,
};
use crate::AppServices;

pub async fn upgrade(
    State(services): State<Arc<AppServices>>,
    Path((channel_name, anchor_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run(socket, services, channel_name, anchor_id))
}

async fn run(socket: WebSocket, services: Arc<AppServices>, channel_name: String, anchor_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let send_task = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            match serde_json::to_string(&value) {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::error!(%err, "failed to encode outgoing frame"),
            }
        }
    });

    let channel_def = match ChannelRegistry::get(&channel_name) {
        Some(c) => c,
        None => {
            send(&out_tx, StatusFrame { status_code: 404 });
            send_task.abort();
            return;
        }
    };

    let auth_msg = match next_auth_frame(&mut ws_rx).await {
        Some(msg) => msg,
        None => {
            send_task.abort();
            return;
        }
    };

    let user = match authenticate(&services.config, &auth_msg.token) {
        Ok(user) => user,
        Err(err) => {
            send(&out_tx, StatusFrame { status_code: err.status_code() });
            send_task.abort();
            return;
        }
    };

    if let Err(err) = authorize(&channel_def, &user, &anchor_id).await {
        send(&out_tx, StatusFrame { status_code: err.status_code() });
        send_task.abort();
        return;
    }

    send(&out_tx, StatusFrame { status_code: 200 });
    send(
        &out_tx,
        InitialAnchorsFrame {
            initial_anchors: vec![anchor_id.clone()],
        },
    );

    let conn_id = services.connections.register(Some(user.id.clone()), out_tx.clone());

    let system_sub = match services.coordination.subscribe(crate::router::SYSTEM_CHANNEL).await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, "failed to subscribe to system channel");
            services.connections.unregister(&conn_id);
            send_task.abort();
            return;
        }
    };
    let mut system_msgs = system_sub.message_rx();

    let mut anchors: HashMap<String, watch::Sender<bool>> = HashMap::new();
    spawn_anchor_stream(
        &services,
        &out_tx,
        &channel_def,
        &channel_name,
        &anchor_id,
        &user,
        &conn_id,
        &mut anchors,
        auth_msg.last_update,
    );

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&services, &out_tx, &channel_def, &channel_name, &anchor_id, &user, &conn_id, &mut anchors, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(%err, "websocket receive error");
                        break;
                    }
                }
            }
            msg = system_msgs.recv() => {
                if let Ok(message) = msg {
                    if let Some(text) = message.value.as_str() {
                        match dispatch_group_message(&channel_def, &anchor_id, text).await {
                            Some(frame) => { let _ = out_tx.send(frame); }
                            None => {
                                // Not a delta or a recognized group event —
                                // a plain administrative message, forwarded
                                // verbatim (anchor-list changes, status).
                                if let Ok(value) = serde_json::from_str::<Value>(text) {
                                    let _ = out_tx.send(value);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    for (_, cancel_tx) in anchors.drain() {
        let _ = cancel_tx.send(true);
    }
    services.connections.unregister(&conn_id);
    send_task.abort();
}

async fn next_auth_frame(ws_rx: &mut futures::stream::SplitStream<WebSocket>) -> Option<AuthMessage> {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

fn send(out_tx: &mpsc::UnboundedSender<Value>, frame: impl serde::Serialize) {
    if let Ok(value) = serde_json::to_value(frame) {
        let _ = out_tx.send(value);
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_frame(
    services: &Arc<AppServices>,
    out_tx: &mpsc::UnboundedSender<Value>,
    channel_def: &Arc<Channel>,
    channel_name: &str,
    primary_anchor_id: &str,
    user: &AuthUser,
    conn_id: &str,
    anchors: &mut HashMap<String, watch::Sender<bool>>,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(%err, raw = %text, "unparseable client frame, ignoring");
            return;
        }
    };

    match frame {
        ClientFrame::Action(call) => run_action(services, out_tx, channel_def, primary_anchor_id, user, call).await,
        ClientFrame::AnchorSubscription(AnchorSubscriptionRequest::Follow { anchor_id }) => {
            if anchors.contains_key(&anchor_id) {
                return;
            }
            if authorize(channel_def, user, &anchor_id).await.is_err() {
                return;
            }
            spawn_anchor_stream(services, out_tx, channel_def, channel_name, &anchor_id, user, conn_id, anchors, None);
        }
        ClientFrame::AnchorSubscription(AnchorSubscriptionRequest::Unfollow { anchor_id }) => {
            if let Some(cancel_tx) = anchors.remove(&anchor_id) {
                let _ = cancel_tx.send(true);
            }
        }
    }
}

async fn run_action(
    services: &Arc<AppServices>,
    out_tx: &mpsc::UnboundedSender<Value>,
    channel_def: &Arc<Channel>,
    anchor_id: &str,
    user: &AuthUser,
    call: ActionCall,
) {
    let Some(action) = channel_def.action(&call.action).cloned() else {
        send(
            out_tx,
            ActionErrorFrame {
                call_id: call.call_id,
                error: format!("unknown action: {}", call.action),
            },
        );
        return;
    };

    let anchor_id = anchor_id.to_string();
    let user_id = user.id.clone();
    let state_machine = services.state_machine.clone();
    let call_id = call.call_id;
    let params = call.params;

    let result: Result<Value> = services
        .coalescer
        .run(move |tx| async move {
            match action.call(&tx, &anchor_id, &user_id, params).await {
                Ok(value) => {
                    let now = state_machine.client().now().await?;
                    tx.commit(now).await?;
                    Ok(value)
                }
                Err(err) => {
                    tx.rollback();
                    Err(err)
                }
            }
        })
        .await;

    match result {
        Ok(value) => send(out_tx, ActionResult { call_id, result: value }),
        Err(err) => send(
            out_tx,
            ActionErrorFrame {
                call_id,
                error: err.to_string(),
            },
        ),
    }
}

/// Run the snapshot loader for `anchor_id`, then stay subscribed to its
/// delivery groups until cancelled. Spawned once per anchor a connection
/// follows (the URL's primary anchor at connect time, and any later
/// `{op: "follow"}` request); tracked in `anchors` by its cancellation
/// handle so `{op: "unfollow"}` and connection teardown can stop it.
#[allow(clippy::too_many_arguments)]
fn spawn_anchor_stream(
    services: &Arc<AppServices>,
    out_tx: &mpsc::UnboundedSender<Value>,
    channel_def: &Arc<Channel>,
    channel_name: &str,
    anchor_id: &str,
    user: &AuthUser,
    conn_id: &str,
    anchors: &mut HashMap<String, watch::Sender<bool>>,
    last_update: Option<f64>,
) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    anchors.insert(anchor_id.to_string(), cancel_tx);

    let services = services.clone();
    let out_tx = out_tx.clone();
    let channel_def = channel_def.clone();
    let channel_name = channel_name.to_string();
    let anchor_id = anchor_id.to_string();
    let user_id = user.id.clone();
    let conn_id = conn_id.to_string();

    tokio::spawn(async move {
        stream_anchor(services, out_tx, channel_def, channel_name, anchor_id, user_id, conn_id, cancel_rx, last_update).await;
    });
}

#[allow(clippy::too_many_arguments)]
async fn stream_anchor(
    services: Arc<AppServices>,
    out_tx: mpsc::UnboundedSender<Value>,
    channel_def: Arc<Channel>,
    channel_name: String,
    anchor_id: String,
    user_id: String,
    conn_id: String,
    mut cancel_rx: watch::Receiver<bool>,
    last_update: Option<f64>,
) {
    services.connections.join_anchor(&conn_id, &channel_name, &anchor_id);
    if let Err(err) = services.state_machine.session_connect(&channel_name, &anchor_id).await {
        tracing::warn!(%err, %channel_name, %anchor_id, "session_connect failed");
    }

    let since = last_update.map(Tstamp::from_f64);
    let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<FlatDocument>>(8);
    let load_fut = services.loader.load_or_catch_up(
        &channel_name,
        &channel_def,
        &anchor_id,
        Some(&user_id),
        since,
        batch_tx,
        cancel_rx.clone(),
    );
    tokio::pin!(load_fut);

    let mut load_done = false;
    let mut batch_closed = false;
    let mut load_result: Result<()> = Ok(());

    while !(load_done && batch_closed) {
        tokio::select! {
            result = &mut load_fut, if !load_done => {
                load_result = result;
                load_done = true;
            }
            maybe_batch = batch_rx.recv(), if !batch_closed => {
                match maybe_batch {
                    Some(docs) => {
                        let frame = serde_json::to_value(&docs).unwrap_or_else(|_| json!([]));
                        let _ = out_tx.send(frame);
                    }
                    None => batch_closed = true,
                }
            }
        }
    }

    if let Err(err) = load_result {
        tracing::warn!(%channel_name, %anchor_id, %err, "snapshot load did not complete");
        send(&out_tx, StatusFrame { status_code: err.status_code() });
        services.connections.leave_anchor(&conn_id, &channel_name, &anchor_id);
        let _ = services.state_machine.session_disconnect(&channel_name, &anchor_id).await;
        return;
    }

    let anchor_group = SubscriptionRouter::anchor_group(&channel_name, &anchor_id);
    let user_group = SubscriptionRouter::user_group(&channel_name, &anchor_id, &user_id);

    let anchor_sub = match services.coordination.subscribe(&anchor_group).await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, %anchor_group, "anchor group subscribe failed");
            services.connections.leave_anchor(&conn_id, &channel_name, &anchor_id);
            let _ = services.state_machine.session_disconnect(&channel_name, &anchor_id).await;
            return;
        }
    };
    let user_sub = match services.coordination.subscribe(&user_group).await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, %user_group, "user group subscribe failed");
            services.connections.leave_anchor(&conn_id, &channel_name, &anchor_id);
            let _ = services.state_machine.session_disconnect(&channel_name, &anchor_id).await;
            return;
        }
    };
    let mut anchor_msgs = anchor_sub.message_rx();
    let mut user_msgs = user_sub.message_rx();

    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            msg = anchor_msgs.recv() => {
                if let Ok(message) = msg {
                    forward_group_message(&channel_def, &anchor_id, &out_tx, &message).await;
                }
            }
            msg = user_msgs.recv() => {
                if let Ok(message) = msg {
                    forward_group_message(&channel_def, &anchor_id, &out_tx, &message).await;
                }
            }
        }
    }

    services.connections.leave_anchor(&conn_id, &channel_name, &anchor_id);
    let _ = services.state_machine.session_disconnect(&channel_name, &anchor_id).await;
}

/// A group-delivered message is either a `FlatDocument` delta (forwarded as
/// a one-element batch, same shape as a snapshot/catch-up batch) or a named
/// group event — `{event, payload}` — dispatched through the channel's
/// `group_events` handler table (spec.md §4.7's "Server -> client other":
/// `{runtimeVar}` / `{prependAnchor}`). Anything that's neither is dropped.
async fn forward_group_message(
    channel_def: &Channel,
    anchor_id: &str,
    out_tx: &mpsc::UnboundedSender<Value>,
    message: &fred::types::Message,
) {
    let Some(payload) = message.value.as_str() else {
        return;
    };
    if let Some(frame) = dispatch_group_message(channel_def, anchor_id, payload).await {
        let _ = out_tx.send(frame);
    }
}

/// A raw group payload is a delta when it carries both `_instance_type` and
/// `_operation` (every `FlatDocument` this system constructs does); anything
/// else is interpreted as a `{event, payload}` group event and looked up in
/// `channel_def.group_events` by name.
async fn dispatch_group_message(channel_def: &Channel, anchor_id: &str, raw: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(raw).ok()?;

    let is_delta = value.get("_instance_type").and_then(Value::as_str).is_some()
        && value.get("_operation").and_then(Value::as_str).is_some();
    if is_delta {
        let doc = FlatDocument::from_object(value).ok()?;
        return serde_json::to_value(vec![doc]).ok();
    }

    let event = value.get("event").and_then(Value::as_str)?;
    let handler = channel_def.group_event(event)?;
    let payload = value.get("payload").cloned().unwrap_or(Value::Null);
    match handler.handle(anchor_id, payload).await {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(%err, event, "group event handler failed");
            None
        }
    }
}

/// Construct the `{prependAnchor}` frame a channel's group-event handler
/// asks to be pushed to a connection mid-stream (spec.md §4.7's "Server ->
/// client other" frames). Exposed for channel implementations that want to
/// push it through `ConnectionManager` rather than the system channel.
pub fn prepend_anchor_frame(anchor_id: &str) -> Value {
    serde_json::to_value(PrependAnchorFrame {
        prepend_anchor: anchor_id.to_string(),
    })
    .unwrap_or(json!({}))
}
