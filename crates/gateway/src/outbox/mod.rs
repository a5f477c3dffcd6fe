// Outbox: per-user queues of undelivered lifecycle events.
//
// Entries flow through a small state machine:
//   queued → delivered            (flushed to a live connection)
//   queued → queued               (send failed, attempt counter bumped)
//   queued → dropped              (attempt ceiling reached; logged as data loss)
//
// While a user has queued entries, the emitter routes every new event here
// instead of delivering live, so a reconnecting client always sees the
// backlog in order before fresh traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parley_common::protocol::ws::WsMessage;
use sqlx::PgPool;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::db;
use crate::metrics;
use crate::registry::{shard_index, ConnectionHandle, SHARD_COUNT};

/// A queued, not-yet-delivered event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Per-user enqueue ordinal; also the durable-store key.
    pub entry_id: i64,
    pub event: WsMessage,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct UserOutbox {
    next_entry_id: i64,
    entries: VecDeque<OutboxEntry>,
}

/// Result of flushing one user's queue into a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
    pub remaining: usize,
}

/// Durable append/remove capability for outbox entries, keyed by user id.
///
/// The storage engine behind the Postgres variant is otherwise out of scope;
/// the Memory variant backs tests and single-node deployments.
#[derive(Clone)]
pub enum OutboxStore {
    Postgres(PgPool),
    Memory(std::sync::Arc<Mutex<HashMap<Uuid, Vec<(i64, WsMessage)>>>>),
}

impl OutboxStore {
    pub fn memory() -> Self {
        Self::Memory(std::sync::Arc::new(Mutex::new(HashMap::new())))
    }

    /// Postgres-backed store when `PARLEY_GATEWAY_DATABASE_URL` is set,
    /// in-memory otherwise.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        match &config.database_url {
            Some(database_url) => {
                let pool = db::create_pg_pool(database_url, db::PoolConfig::from_env())
                    .await
                    .context("failed to initialize gateway PostgreSQL pool for the outbox")?;
                db::check_pool_health(&pool)
                    .await
                    .context("gateway PostgreSQL health check failed for the outbox")?;
                Ok(Self::Postgres(pool))
            }
            None => Ok(Self::memory()),
        }
    }

    pub async fn append(&self, user_id: Uuid, entry_id: i64, event: &WsMessage) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                let payload = serde_json::to_value(event)
                    .context("failed to encode outbox event payload")?;
                sqlx::query(
                    "INSERT INTO gateway_outbox (user_id, entry_id, event, enqueued_at) \
                     VALUES ($1, $2, $3, NOW()) \
                     ON CONFLICT (user_id, entry_id) DO NOTHING",
                )
                .bind(user_id)
                .bind(entry_id)
                .bind(payload)
                .execute(pool)
                .await
                .context("failed to append outbox entry")?;
                Ok(())
            }
            Self::Memory(map) => {
                map.lock()
                    .expect("outbox store lock poisoned")
                    .entry(user_id)
                    .or_default()
                    .push((entry_id, event.clone()));
                Ok(())
            }
        }
    }

    pub async fn remove_many(&self, user_id: Uuid, entry_ids: &[i64]) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    "DELETE FROM gateway_outbox WHERE user_id = $1 AND entry_id = ANY($2)",
                )
                .bind(user_id)
                .bind(entry_ids)
                .execute(pool)
                .await
                .context("failed to remove delivered outbox entries")?;
                Ok(())
            }
            Self::Memory(map) => {
                let mut guard = map.lock().expect("outbox store lock poisoned");
                if let Some(entries) = guard.get_mut(&user_id) {
                    entries.retain(|(entry_id, _)| !entry_ids.contains(entry_id));
                    if entries.is_empty() {
                        guard.remove(&user_id);
                    }
                }
                Ok(())
            }
        }
    }

    /// All durable entries for a user, oldest first.
    pub async fn load_for_user(&self, user_id: Uuid) -> Result<Vec<(i64, WsMessage)>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, (i64, serde_json::Value)>(
                    "SELECT entry_id, event FROM gateway_outbox \
                     WHERE user_id = $1 ORDER BY entry_id ASC",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to load outbox entries")?;

                let mut entries = Vec::with_capacity(rows.len());
                for (entry_id, payload) in rows {
                    let event = serde_json::from_value(payload)
                        .context("failed to decode stored outbox event")?;
                    entries.push((entry_id, event));
                }
                Ok(entries)
            }
            Self::Memory(map) => {
                let mut entries = map
                    .lock()
                    .expect("outbox store lock poisoned")
                    .get(&user_id)
                    .cloned()
                    .unwrap_or_default();
                entries.sort_by_key(|(entry_id, _)| *entry_id);
                Ok(entries)
            }
        }
    }
}

/// Buffers undelivered events across dropped connections and replays them,
/// in order, on reconnect.
pub struct OutboxManager {
    shards: Vec<Mutex<HashMap<Uuid, UserOutbox>>>,
    max_delivery_attempts: u32,
    store: OutboxStore,
}

impl OutboxManager {
    pub fn new(store: OutboxStore, max_delivery_attempts: u32) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            max_delivery_attempts,
            store,
        }
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }

    /// True when the user has queued entries awaiting delivery.
    pub fn has_pending(&self, user_id: Uuid) -> bool {
        self.depth(user_id) > 0
    }

    pub fn depth(&self, user_id: Uuid) -> usize {
        self.shards[shard_index(&user_id)]
            .lock()
            .expect("outbox shard lock poisoned")
            .get(&user_id)
            .map(|outbox| outbox.entries.len())
            .unwrap_or(0)
    }

    /// Appends an event to the user's queue, preserving enqueue order.
    /// Returns the entry id for the durable mirror.
    pub fn enqueue(&self, user_id: Uuid, event: WsMessage) -> i64 {
        let depth;
        let entry_id;
        {
            let mut shard =
                self.shards[shard_index(&user_id)].lock().expect("outbox shard lock poisoned");
            let outbox = shard.entry(user_id).or_default();
            outbox.next_entry_id += 1;
            entry_id = outbox.next_entry_id;
            outbox.entries.push_back(OutboxEntry {
                entry_id,
                event,
                attempts: 0,
                enqueued_at: Utc::now(),
            });
            depth = outbox.entries.len();
        }
        metrics::set_outbox_depth_for_user(user_id, depth as i64);
        entry_id
    }

    /// Puts frames back at the head of the queue, preserving their order.
    ///
    /// Used when a socket dies with frames still in its channel: those
    /// frames precede anything that raced into the queue through the
    /// emitter, so they re-enter in front. Returns the assigned entry ids
    /// for the durable mirror.
    pub fn requeue_front(
        &self,
        user_id: Uuid,
        frames: Vec<WsMessage>,
    ) -> Vec<(i64, WsMessage)> {
        if frames.is_empty() {
            return Vec::new();
        }

        let mut assigned = Vec::with_capacity(frames.len());
        let depth;
        {
            let mut shard =
                self.shards[shard_index(&user_id)].lock().expect("outbox shard lock poisoned");
            let outbox = shard.entry(user_id).or_default();
            let base = outbox
                .entries
                .front()
                .map(|entry| entry.entry_id)
                .unwrap_or(outbox.next_entry_id + 1);
            let count = frames.len() as i64;
            for (offset, event) in frames.into_iter().enumerate() {
                assigned.push((base - count + offset as i64, event));
            }
            for (entry_id, event) in assigned.iter().rev() {
                outbox.next_entry_id = outbox.next_entry_id.max(*entry_id);
                outbox.entries.push_front(OutboxEntry {
                    entry_id: *entry_id,
                    event: event.clone(),
                    attempts: 0,
                    enqueued_at: Utc::now(),
                });
            }
            depth = outbox.entries.len();
        }
        metrics::set_outbox_depth_for_user(user_id, depth as i64);
        assigned
    }

    /// Mirrors an enqueued entry into the durable store. Failures are logged
    /// and do not affect the in-memory queue.
    pub async fn persist(&self, user_id: Uuid, entry_id: i64, event: &WsMessage) {
        if let Err(error) = self.store.append(user_id, entry_id, event).await {
            error!(error = ?error, user_id = %user_id, entry_id, "failed to persist outbox entry");
        }
    }

    /// Repopulates a user's in-memory queue from the durable store.
    ///
    /// Only runs when the in-memory queue is empty (fresh process); attempt
    /// counters restart at zero because they are not persisted.
    pub async fn recover(&self, user_id: Uuid) {
        if self.has_pending(user_id) {
            return;
        }

        let stored = match self.store.load_for_user(user_id).await {
            Ok(stored) => stored,
            Err(error) => {
                error!(error = ?error, user_id = %user_id, "failed to load durable outbox entries");
                return;
            }
        };
        if stored.is_empty() {
            return;
        }

        let mut shard =
            self.shards[shard_index(&user_id)].lock().expect("outbox shard lock poisoned");
        let outbox = shard.entry(user_id).or_default();
        if !outbox.entries.is_empty() {
            return;
        }
        for (entry_id, event) in stored {
            outbox.next_entry_id = outbox.next_entry_id.max(entry_id);
            outbox.entries.push_back(OutboxEntry {
                entry_id,
                event,
                attempts: 0,
                enqueued_at: Utc::now(),
            });
        }
    }

    /// Drains the user's queue into a fresh connection, oldest first.
    ///
    /// Stops at the first failed send (the connection is gone again); the
    /// failed entry's attempt counter is bumped and, once it reaches the
    /// ceiling, the entry is dropped and the loss logged exactly once.
    pub async fn flush(&self, user_id: Uuid, handle: &ConnectionHandle) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut removed_entry_ids = Vec::new();

        {
            let mut shard =
                self.shards[shard_index(&user_id)].lock().expect("outbox shard lock poisoned");
            let Some(outbox) = shard.get_mut(&user_id) else {
                return report;
            };

            while let Some(mut entry) = outbox.entries.pop_front() {
                match handle.send(entry.event.clone()) {
                    Ok(()) => {
                        report.delivered += 1;
                        removed_entry_ids.push(entry.entry_id);
                    }
                    Err(_closed) => {
                        entry.attempts += 1;
                        if entry.attempts >= self.max_delivery_attempts {
                            warn!(
                                user_id = %user_id,
                                entry_id = entry.entry_id,
                                attempts = entry.attempts,
                                message_type = entry.event.message_type(),
                                "dropping undelivered event after exhausting delivery attempts; data loss"
                            );
                            metrics::increment_dropped_events();
                            report.dropped += 1;
                            removed_entry_ids.push(entry.entry_id);
                        } else {
                            outbox.entries.push_front(entry);
                        }
                        break;
                    }
                }
            }

            report.remaining = outbox.entries.len();
            if outbox.entries.is_empty() {
                shard.remove(&user_id);
            }
        }

        metrics::set_outbox_depth_for_user(user_id, report.remaining as i64);

        if let Err(error) = self.store.remove_many(user_id, &removed_entry_ids).await {
            error!(error = ?error, user_id = %user_id, "failed to remove flushed outbox entries");
        }

        report
    }
}
