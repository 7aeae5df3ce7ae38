//! The anchor cache state machine.
//!
//! This is the hard part of the whole system: guaranteeing exactly one
//! builder runs per anchor while every other concurrent subscriber gets a
//! consistent view, entirely through atomic operations over the
//! coordination store. Every primitive below is one Lua script so the
//! read-check-write it performs is indivisible even under concurrent
//! connections hammering the same anchor. Each primitive here is a
//! line-for-line port of `RedisStateSession`'s scripts (see
//! `original_source/rxdjango/redis.py`), generalized from the pinned
//! key-index convention to named keys.
//!
//! State transitions (see [`sync_core::CacheState`]):
//!
//! ```text
//! COLD --start_session--> HEATING --end_session(success)--> HOT
//! HEATING --end_session(failure)--> rollback_to_cold --> COLD
//! HOT --start_cooling(_if_stale)--> COOLING --finish_cooling--> COLD
//! COOLING --start_session--> HEATING   (fused: a new reader arrives mid-cool)
//! COOLING --finish_cooling, readers > 0--> HEATING   (reheat)
//! ```
//!
//! `readers` counts clients currently consuming the in-memory `instances`
//! list for their initial snapshot (HEATING/COOLING-fused followers); it is
//! entirely distinct from `sessions`, which counts every connected client
//! regardless of which variant of the loader serves them, and which the
//! expiry sweeper reads via `last_disconnect` to decide staleness.

use crate::coordination::client::CoordinationClient;
use crate::coordination::keys::AnchorKeys;
use crate::error::{AppError, Result};
use sync_core::{AnchorId, CacheState, ChannelName};

/// `start_session`: the single entry point every loader variant starts
/// from. Returns the state the anchor was in *before* this call so the
/// caller knows which loader variant to run (`load_inner` in
/// `loader/mod.rs` switches on it directly).
const START_SESSION: &str = r#"
local state_key = KEYS[1]
local access_key = KEYS[2]
local instances_key = KEYS[3]
local readers_key = KEYS[4]
local now = ARGV[1]

local state = tonumber(redis.call('GET', state_key)) or 0

if state == 0 then
  redis.call('SET', state_key, 1)
  redis.call('DEL', instances_key)
  redis.call('SET', readers_key, 0)
elseif state == 1 then
  redis.call('INCR', readers_key)
elseif state == 3 then
  redis.call('SET', state_key, 1)
  redis.call('SET', readers_key, 1)
  redis.call('SET', access_key, now)
  return 1
end

redis.call('SET', access_key, now)
return state
"#;

/// `end_session`: the caller passes back the state `start_session`
/// returned it (`initial_state`), since which branch runs depends on it,
/// not on whatever the anchor's state happens to be *now*.
const END_COLD_SESSION_SUCCESS: &str = r#"
local state_key = KEYS[1]
local instances_key = KEYS[2]
local readers_key = KEYS[3]

local readers = tonumber(redis.call('GET', readers_key)) or 0
if readers == 0 then
  redis.call('DEL', instances_key)
end
redis.call('SET', state_key, 2)
return readers
"#;

const END_HEATING_SESSION: &str = r#"
local instances_key = KEYS[1]
local readers_key = KEYS[2]

local readers = tonumber(redis.call('DECR', readers_key)) or 0
if readers <= 0 then
  redis.call('SET', readers_key, 0)
  redis.call('DEL', instances_key)
end
return readers
"#;

/// `rollback_to_cold`: used both for `end_session(COLD, success=false)` and
/// a HEATING session's own failure path — a reader mid-build that fails
/// pushes the poison marker for everyone else following along.
const ROLLBACK_TO_COLD: &str = r#"
local state_key = KEYS[1]
local instances_key = KEYS[2]
local readers_key = KEYS[3]
local trigger_key = KEYS[4]

local readers = tonumber(redis.call('GET', readers_key)) or 0
if readers > 0 then
  redis.call('RPUSH', instances_key, 'error')
  local size = redis.call('LLEN', instances_key)
  redis.call('PUBLISH', trigger_key, size)
end

redis.call('SET', state_key, 0)
return readers
"#;

/// `start_cooling`: HOT -> COOLING, unconditionally (manual cache clear).
const START_COOLING: &str = r#"
local state_key = KEYS[1]
local instances_key = KEYS[2]
local readers_key = KEYS[3]

local state = tonumber(redis.call('GET', state_key)) or 0
if state ~= 2 then
  return 0
end

redis.call('SET', state_key, 3)
redis.call('DEL', instances_key)
redis.call('SET', readers_key, 0)
return 1
"#;

/// `start_cooling_if_stale`: the expiry path — succeeds only if the anchor
/// is HOT, has no connected sessions, and has been idle past `ttl` since
/// its last disconnect.
const START_COOLING_IF_STALE: &str = r#"
local state_key = KEYS[1]
local instances_key = KEYS[2]
local readers_key = KEYS[3]
local sessions_key = KEYS[4]
local last_disconnect_key = KEYS[5]
local now = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local state = tonumber(redis.call('GET', state_key)) or 0
if state ~= 2 then
  return 0
end

local sessions = tonumber(redis.call('GET', sessions_key)) or 0
if sessions > 0 then
  return 0
end

local last_disconnect = tonumber(redis.call('GET', last_disconnect_key))
if not last_disconnect then
  return 0
end

if (now - last_disconnect) < ttl then
  return 0
end

redis.call('SET', state_key, 3)
redis.call('DEL', instances_key)
redis.call('SET', readers_key, 0)
return 1
"#;

/// `finish_cooling`: terminates the COOLING operator. Returns 1 when a
/// client fused COOLING -> HEATING while the operator was migrating
/// documents (the operator must reheat the document cache rather than
/// finalize to COLD), 0 otherwise.
const FINISH_COOLING: &str = r#"
local state_key = KEYS[1]
local instances_key = KEYS[2]
local trigger_key = KEYS[3]

local state = tonumber(redis.call('GET', state_key)) or 0

if state == 3 then
  local len = tonumber(redis.call('LLEN', instances_key)) or 0
  if len > 0 then
    redis.call('PUBLISH', trigger_key, -len)
  end
  redis.call('SET', state_key, 0)
  redis.call('DEL', instances_key)
  return 0
elseif state == 1 then
  local len = tonumber(redis.call('LLEN', instances_key)) or 0
  if len > 0 then
    redis.call('PUBLISH', trigger_key, -len)
  end
  return 1
end

return -1
"#;

/// `write_instances`: append serialized documents to the anchor's
/// in-memory list and wake any followers with the new length. Called only
/// by the COLD-path builder (and the COOLING operator migrating documents
/// back out of the document cache).
const WRITE_INSTANCES: &str = r#"
local instances_key = KEYS[1]
local trigger_key = KEYS[2]
local n = #ARGV

for i = 1, n do
  redis.call('RPUSH', instances_key, ARGV[i])
end

local size = redis.call('LLEN', instances_key)
redis.call('PUBLISH', trigger_key, size)
return size
"#;

/// `end_write`: signal that no more documents will be written. Publishes
/// the negative length so followers still draining the list know to stop
/// after this batch; deletes the list outright if nobody is reading it.
const END_WRITE: &str = r#"
local instances_key = KEYS[1]
local readers_key = KEYS[2]
local trigger_key = KEYS[3]

local readers = tonumber(redis.call('GET', readers_key)) or 0
local size = redis.call('LLEN', instances_key)

if readers == 0 then
  redis.call('DEL', instances_key)
  return 0
end

redis.call('PUBLISH', trigger_key, -size)
return -size
"#;

/// `session_connect` / `session_disconnect`: track the total number of
/// connected clients to an anchor, independent of which loader variant is
/// serving each one — this is what `start_cooling_if_stale` reads, not
/// `readers`.
const SESSION_CONNECT: &str = r#"
local sessions_key = KEYS[1]
local last_disconnect_key = KEYS[2]

redis.call('INCR', sessions_key)
redis.call('DEL', last_disconnect_key)
return 1
"#;

const SESSION_DISCONNECT: &str = r#"
local sessions_key = KEYS[1]
local last_disconnect_key = KEYS[2]
local now = ARGV[1]

local remaining = redis.call('DECR', sessions_key)
if remaining <= 0 then
  redis.call('SET', sessions_key, 0)
  redis.call('SET', last_disconnect_key, now)
end
return remaining
"#;

pub struct StateMachine {
    client: CoordinationClient,
}

impl StateMachine {
    pub fn new(client: CoordinationClient) -> Self {
        Self { client }
    }

    fn keys(channel: &ChannelName, anchor: &AnchorId) -> AnchorKeys {
        AnchorKeys::new(channel, anchor)
    }

    fn state_from_code(code: i64) -> Result<CacheState> {
        CacheState::from_code(code).ok_or_else(|| {
            AppError::InternalInvariant(format!("coordination store returned unknown state code {code}"))
        })
    }

    pub async fn start_session(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<CacheState> {
        let keys = Self::keys(channel, anchor);
        let now = self.client.now().await?;
        let code = self
            .client
            .eval_int(
                START_SESSION,
                vec![keys.state(), keys.access_time(), keys.instances(), keys.readers()],
                vec![now.as_f64().to_string()],
            )
            .await?;
        Self::state_from_code(code)
    }

    /// `end_session`: dispatches on the state `start_session` originally
    /// returned, exactly mirroring `RedisStateSession._end_session_methods`.
    pub async fn end_session(
        &self,
        channel: &ChannelName,
        anchor: &AnchorId,
        initial_state: CacheState,
        success: bool,
    ) -> Result<()> {
        let keys = Self::keys(channel, anchor);
        match initial_state {
            CacheState::Cold => {
                if success {
                    self.client
                        .eval_int(
                            END_COLD_SESSION_SUCCESS,
                            vec![keys.state(), keys.instances(), keys.readers()],
                            vec![],
                        )
                        .await?;
                } else {
                    self.rollback_to_cold(channel, anchor).await?;
                }
            }
            CacheState::Heating => {
                self.client
                    .eval_int(END_HEATING_SESSION, vec![keys.instances(), keys.readers()], vec![])
                    .await?;
            }
            CacheState::Hot => {
                // no-op: a HOT session never touched the coordination
                // list, so ending it changes nothing.
            }
            CacheState::Cooling => {
                return Err(AppError::InternalInvariant(
                    "start_session never returns Cooling as an initial state".into(),
                ));
            }
        }
        Ok(())
    }

    pub async fn rollback_to_cold(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<i64> {
        let keys = Self::keys(channel, anchor);
        self.client
            .eval_int(
                ROLLBACK_TO_COLD,
                vec![keys.state(), keys.instances(), keys.readers(), keys.instances_trigger()],
                vec![],
            )
            .await
    }

    pub async fn start_cooling(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<bool> {
        let keys = Self::keys(channel, anchor);
        let code = self
            .client
            .eval_int(
                START_COOLING,
                vec![keys.state(), keys.instances(), keys.readers()],
                vec![],
            )
            .await?;
        Ok(code == 1)
    }

    pub async fn start_cooling_if_stale(
        &self,
        channel: &ChannelName,
        anchor: &AnchorId,
        ttl_secs: u64,
    ) -> Result<bool> {
        let keys = Self::keys(channel, anchor);
        let now = self.client.now().await?;
        let code = self
            .client
            .eval_int(
                START_COOLING_IF_STALE,
                vec![
                    keys.state(),
                    keys.instances(),
                    keys.readers(),
                    keys.sessions(),
                    keys.last_disconnect(),
                ],
                vec![now.secs().to_string(), ttl_secs.to_string()],
            )
            .await?;
        Ok(code == 1)
    }

    /// Returns `true` when the anchor reheated (callers must resume
    /// building / migrate documents back rather than treating the anchor
    /// as cold).
    pub async fn finish_cooling(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<bool> {
        let keys = Self::keys(channel, anchor);
        let code = self
            .client
            .eval_int(
                FINISH_COOLING,
                vec![keys.state(), keys.instances(), keys.instances_trigger()],
                vec![],
            )
            .await?;
        if code < 0 {
            return Err(AppError::InternalInvariant(format!(
                "finish_cooling observed state outside {{HEATING, COOLING}}: code {code}"
            )));
        }
        Ok(code == 1)
    }

    /// Append already-serialized documents to the anchor's instance list
    /// and wake followers. Returns the list's new length.
    pub async fn write_instances(&self, channel: &ChannelName, anchor: &AnchorId, entries: &[String]) -> Result<i64> {
        if entries.is_empty() {
            return self.client.list_len(&Self::keys(channel, anchor).instances()).await;
        }
        let keys = Self::keys(channel, anchor);
        self.client
            .eval_int(
                WRITE_INSTANCES,
                vec![keys.instances(), keys.instances_trigger()],
                entries.to_vec(),
            )
            .await
    }

    pub async fn end_write(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<()> {
        let keys = Self::keys(channel, anchor);
        self.client
            .eval_int(
                END_WRITE,
                vec![keys.instances(), keys.readers(), keys.instances_trigger()],
                vec![],
            )
            .await?;
        Ok(())
    }

    pub async fn session_connect(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<()> {
        let keys = Self::keys(channel, anchor);
        self.client
            .eval_int(SESSION_CONNECT, vec![keys.sessions(), keys.last_disconnect()], vec![])
            .await?;
        Ok(())
    }

    pub async fn session_disconnect(&self, channel: &ChannelName, anchor: &AnchorId) -> Result<i64> {
        let keys = Self::keys(channel, anchor);
        let now = self.client.now().await?;
        self.client
            .eval_int(
                SESSION_DISCONNECT,
                vec![keys.sessions(), keys.last_disconnect()],
                vec![now.as_f64().to_string()],
            )
            .await
    }

    pub fn client(&self) -> &CoordinationClient {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    // The Lua scripts above can only be exercised against a live (or
    // embedded) Redis-protocol server, so they aren't unit-tested here. The
    // part of the system that doesn't need one — user-key filtering, delta
    // computation, document cache spillover — is exercised against an
    // in-memory fake `DocumentCache` in `crate::delta::writer`'s own test
    // module.
}
