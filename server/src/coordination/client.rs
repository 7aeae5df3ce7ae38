//! Thin wrapper over the coordination store connection.
//!
//! Every timestamp this system hands out comes from here (`TIME`), never
//! from a process's own clock — see [`sync_core::Tstamp`]'s documentation
//! for why that matters.

use crate::error::{AppError, Result};
use fred::prelude::*;
use futures::StreamExt;
use sync_core::Tstamp;

#[derive(Clone)]
pub struct CoordinationClient {
    client: RedisClient,
}

impl CoordinationClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let config = RedisConfig::from_url(redis_url)
            .map_err(|e| AppError::Transient(format!("invalid coordination store url: {e}")))?;
        let client = RedisClient::new(config, None, None, None);
        client
            .connect();
        client
            .wait_for_connect()
            .await
            .map_err(|e| AppError::Transient(format!("coordination store connect failed: {e}")))?;
        Ok(Self { client })
    }

    /// The coordination store's own clock. Every `Tstamp` in this system is
    /// minted from a call to this, never `SystemTime::now()`.
    pub async fn now(&self) -> Result<Tstamp> {
        let (secs, micros): (i64, i64) = self
            .client
            .time()
            .await
            .map_err(|e| AppError::Transient(format!("coordination store TIME failed: {e}")))?;
        Ok(Tstamp::new(secs, micros))
    }

    pub fn inner(&self) -> &RedisClient {
        &self.client
    }

    /// Run a Lua script with the given keys and arguments, returning a raw
    /// integer reply — every state-machine primitive in this system follows
    /// this convention (see `state_machine.rs`).
    pub async fn eval_int(&self, script: &str, keys: Vec<String>, args: Vec<String>) -> Result<i64> {
        self.client
            .eval(script, keys, args)
            .await
            .map_err(|e| AppError::Transient(format!("coordination script failed: {e}")))
    }

    /// Enumerate every key matching `pattern` without blocking the store
    /// (used by the expiry sweeper instead of `KEYS`).
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stream = self.client.scan(pattern, Some(200), None);
        while let Some(page) = stream.next().await {
            let page = page.map_err(|e| AppError::Transient(format!("scan failed: {e}")))?;
            if let Some(keys) = page.results() {
                out.extend(keys.iter().filter_map(|k| k.as_str().map(str::to_string)));
            }
        }
        Ok(out)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.client
            .publish(channel, payload)
            .await
            .map_err(|e| AppError::Transient(format!("publish failed: {e}")))
    }

    /// Subscribe to a pub/sub channel, returning a stream of raw payloads.
    /// Used both for `instances_trigger` wake-ups and subscription group
    /// delivery.
    pub async fn subscribe(&self, channel: &str) -> Result<RedisClient> {
        let subscriber = self.client.clone_new();
        subscriber
            .connect();
        subscriber
            .wait_for_connect()
            .await
            .map_err(|e| AppError::Transient(format!("subscriber connect failed: {e}")))?;
        subscriber
            .subscribe(channel)
            .await
            .map_err(|e| AppError::Transient(format!("subscribe failed: {e}")))?;
        Ok(subscriber)
    }

    /// Append a serialized document to an anchor's `instances` list.
    pub async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .rpush(key, value)
            .await
            .map_err(|e| AppError::Transient(format!("list push failed: {e}")))
    }

    /// Read every entry of an anchor's `instances` list from `start` to the
    /// end — how a HEATING follower catches up on everything written since
    /// it last checked.
    pub async fn list_range_from(&self, key: &str, start: i64) -> Result<Vec<String>> {
        self.client
            .lrange(key, start, -1)
            .await
            .map_err(|e| AppError::Transient(format!("list range failed: {e}")))
    }

    pub async fn list_len(&self, key: &str) -> Result<i64> {
        self.client
            .llen(key)
            .await
            .map_err(|e| AppError::Transient(format!("list length failed: {e}")))
    }

    /// Read an integer-valued key (e.g. `{anchor}:state`), treating an
    /// absent key as `None` rather than an error — mirrors the `GET ... or
    /// 0` idiom every Lua script above uses, for callers that need to
    /// inspect state outside of an atomic script (the HEATING follower's
    /// belt-and-suspenders poll).
    pub async fn get_state(&self, key: &str) -> Result<Option<i64>> {
        let raw: Option<i64> = self
            .client
            .get(key)
            .await
            .map_err(|e| AppError::Transient(format!("get failed: {e}")))?;
        Ok(raw)
    }

    /// Best-effort extraction of the integer payload a `PUBLISH` to
    /// `instances_trigger` carries (see `write_instances` / `end_write`).
    pub fn parse_trigger_payload(message: &fred::types::Message) -> Option<i64> {
        message
            .value
            .as_i64()
            .or_else(|| message.value.as_str().and_then(|s| s.parse::<i64>().ok()))
    }
}
