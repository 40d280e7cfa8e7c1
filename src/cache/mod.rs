//! Redis cache for preprocessed IOC collections.
//!
//! The cache is advisory: every reader falls back to correlating on demand
//! when a key is missing, stale, or unreadable. Envelopes carry their own
//! metadata so consumers can report cache age.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::models::CorrelatedIndicator;

/// Fully correlated and enriched collection, written by the batch driver.
pub const PREPROCESSED_KEY: &str = "preprocessed_iocs";

/// Subset with fused confidence >= 80.
pub const HIGH_CONFIDENCE_KEY: &str = "high_confidence_iocs";

/// Batch results are rewritten every pass; keep them for ten minutes.
pub const DEFAULT_TTL_SECS: usize = 600;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEnvelope {
    iocs: Vec<CorrelatedIndicator>,
    cached_at: DateTime<Utc>,
    count: usize,
}

/// Cache metadata for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cached_at: DateTime<Utc>,
    pub count: usize,
    pub ttl_secs: i64,
}

/// Async Redis-backed IOC cache.
#[derive(Clone)]
pub struct IocCache {
    conn: MultiplexedConnection,
}

impl IocCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .context("Failed to connect to Redis")?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("Redis ping failed")?;

        tracing::info!("Redis connection established");
        Ok(Self { conn })
    }

    /// Store a correlated collection under a key with a TTL.
    pub async fn set_iocs(
        &self,
        key: &str,
        iocs: &[CorrelatedIndicator],
        ttl_secs: usize,
    ) -> Result<()> {
        let envelope = CacheEnvelope {
            iocs: iocs.to_vec(),
            cached_at: Utc::now(),
            count: iocs.len(),
        };
        let payload = serde_json::to_string(&envelope).context("Failed to encode IOC cache")?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl_secs as u64)
            .await
            .context("Failed to write IOC cache")?;

        tracing::info!(key, count = iocs.len(), ttl_secs, "cached IOC collection");
        Ok(())
    }

    /// Read a correlated collection. Unreadable payloads count as a miss.
    pub async fn get_iocs(&self, key: &str) -> Result<Option<Vec<CorrelatedIndicator>>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(key)
            .await
            .context("Failed to read IOC cache")?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<CacheEnvelope>(&payload) {
            Ok(envelope) => {
                tracing::debug!(key, count = envelope.count, "IOC cache hit");
                Ok(Some(envelope.iocs))
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable IOC cache entry");
                Ok(None)
            }
        }
    }

    /// Metadata about a cached collection, if present.
    pub async fn cache_info(&self, key: &str) -> Result<Option<CacheInfo>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await.context("Failed to read IOC cache")?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let Ok(envelope) = serde_json::from_str::<CacheEnvelope>(&payload) else {
            return Ok(None);
        };

        let ttl_secs: i64 = conn.ttl(key).await.context("Failed to read cache TTL")?;

        Ok(Some(CacheInfo {
            cached_at: envelope.cached_at,
            count: envelope.count,
            ttl_secs,
        }))
    }

}
