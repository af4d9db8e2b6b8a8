//! Shared claim store for per-identity admission state.
//!
//! Claims live in Redis so that multiple front ends can see each other's
//! in-flight jobs. Every claim carries a TTL so a crashed process cannot
//! lock its identity out forever. An in-memory backend covers single-process
//! runs (and tests) where no Redis is available.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::config::StoreConfig;

pub const CLAIM_KEY_PREFIX: &str = "user:status:";
pub const STATUS_PROCESSING: &str = "processing";

const FIELD_STATUS: &str = "status";
const FIELD_TASK_ID: &str = "task_id";
const FIELD_START_TIME: &str = "start_time";

/// One identity's in-flight job, as stored in the claim hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub status: String,
    pub task_id: String,
    pub start_time: String,
}

impl ClaimRecord {
    pub fn processing(task_id: &str) -> Self {
        Self {
            status: STATUS_PROCESSING.to_string(),
            task_id: task_id.to_string(),
            start_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.status == STATUS_PROCESSING
    }

    fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            status: fields.get(FIELD_STATUS).cloned().unwrap_or_default(),
            task_id: fields.get(FIELD_TASK_ID).cloned().unwrap_or_default(),
            start_time: fields.get(FIELD_START_TIME).cloned().unwrap_or_default(),
        }
    }
}

pub fn claim_key(token: &str) -> String {
    format!("{CLAIM_KEY_PREFIX}{token}")
}

/// Client over the shared claim store.
///
/// `read_claim` and `write_claim` surface backend failures so admission can
/// apply its availability policy; `clear_claim` and `ping` never raise.
pub struct ClaimStore {
    backend: StoreBackend,
    claim_ttl: Duration,
}

enum StoreBackend {
    Redis(RedisBackend),
    Memory(MemoryBackend),
}

impl ClaimStore {
    /// Open a Redis-backed store. The connection itself is established
    /// lazily, so this succeeds even while Redis is down.
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url())
            .with_context(|| format!("invalid claim store URL: {}", config.redis_url()))?;

        Ok(Self {
            backend: StoreBackend::Redis(RedisBackend {
                client,
                manager: tokio::sync::Mutex::new(None),
            }),
            claim_ttl: config.claim_ttl(),
        })
    }

    /// Process-local store with the same TTL semantics. Used by one-shot
    /// runs that have no Redis to coordinate with.
    pub fn in_memory(claim_ttl: Duration) -> Self {
        Self {
            backend: StoreBackend::Memory(MemoryBackend::default()),
            claim_ttl,
        }
    }

    pub fn claim_ttl(&self) -> Duration {
        self.claim_ttl
    }

    pub async fn read_claim(&self, token: &str) -> Result<Option<ClaimRecord>> {
        let key = claim_key(token);
        let result = match &self.backend {
            StoreBackend::Redis(backend) => backend.read(&key).await,
            StoreBackend::Memory(backend) => Ok(backend.read(&key)),
        };

        if let Err(err) = &result {
            warn!(error = %err, "claim store read failed");
        }
        result
    }

    pub async fn write_claim(&self, token: &str, record: &ClaimRecord) -> Result<()> {
        let key = claim_key(token);
        let result = match &self.backend {
            StoreBackend::Redis(backend) => backend.write(&key, record, self.claim_ttl).await,
            StoreBackend::Memory(backend) => {
                backend.write(&key, record, self.claim_ttl);
                Ok(())
            }
        };

        if let Err(err) = &result {
            warn!(error = %err, "claim store write failed");
        }
        result
    }

    /// Delete the claim for `token`. Returns false on backend failure
    /// instead of raising, so release paths cannot themselves fail.
    pub async fn clear_claim(&self, token: &str) -> bool {
        let key = claim_key(token);
        match &self.backend {
            StoreBackend::Redis(backend) => match backend.delete(&key).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "claim store delete failed");
                    false
                }
            },
            StoreBackend::Memory(backend) => {
                backend.delete(&key);
                true
            }
        }
    }

    /// Liveness probe against the backend. Never raises.
    pub async fn ping(&self) -> bool {
        match &self.backend {
            StoreBackend::Redis(backend) => match backend.ping().await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "claim store ping failed");
                    false
                }
            },
            StoreBackend::Memory(_) => true,
        }
    }
}

struct RedisBackend {
    client: redis::Client,
    manager: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl RedisBackend {
    /// Hand out the shared connection manager, establishing it on first use.
    /// The manager reconnects on its own after transient failures.
    async fn manager(&self) -> Result<ConnectionManager> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        let manager = ConnectionManager::new(self.client.clone())
            .await
            .context("failed to connect to claim store")?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    async fn read(&self, key: &str) -> Result<Option<ClaimRecord>> {
        let mut conn = self.manager().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("claim store HGETALL failed")?;

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(ClaimRecord::from_fields(&fields)))
    }

    async fn write(&self, key: &str, record: &ClaimRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.manager().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(key)
            .arg(FIELD_STATUS)
            .arg(&record.status)
            .arg(FIELD_TASK_ID)
            .arg(&record.task_id)
            .arg(FIELD_START_TIME)
            .arg(&record.start_time)
            .ignore();
        pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).ignore();

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("claim store HSET/EXPIRE failed")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager().await?;
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("claim store DEL failed")?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("claim store PING failed")?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    record: ClaimRecord,
    expires_at: Instant,
}

impl MemoryBackend {
    fn read(&self, key: &str) -> Option<ClaimRecord> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.record.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn write(&self, key: &str, record: &ClaimRecord, ttl: Duration) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        entries.insert(
            key.to_string(),
            MemoryEntry {
                record: record.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(key);
    }
}
