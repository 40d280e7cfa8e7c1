//! Background batch driver.
//!
//! Each pass pulls every local observation plus the external blacklist,
//! correlates them, enriches with geolocation, and writes the results into
//! Redis so the TAXII and export endpoints answer from cache. Passes are
//! serialized by a try-lock: an overrunning pass makes the next tick skip
//! instead of stacking up.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::cache::{IocCache, HIGH_CONFIDENCE_KEY, PREPROCESSED_KEY};
use crate::correlation::CorrelationEngine;
use crate::enrichment::abuseipdb::{AbuseIpDbClient, BlacklistEntry};
use crate::enrichment::GeolocationService;
use crate::models::{
    ExternalObservation, LocalObservation, DEFAULT_BLACKLIST_TOTAL_REPORTS,
};
use crate::storage::IocRepo;

/// Confidence floor when pulling the external blacklist.
const BLACKLIST_CONFIDENCE_MINIMUM: i32 = 50;
/// Upper bound on blacklist entries fetched per pass.
const BLACKLIST_FETCH_LIMIT: usize = 10_000;
/// Fused confidence threshold for the high-confidence collection.
const HIGH_CONFIDENCE_THRESHOLD: i32 = 80;
/// Cache TTL for batch results, seconds.
const RESULT_TTL_SECS: usize = 600;
/// Progress-log granularity.
const PROCESS_BATCH_SIZE: usize = 100;

/// Periodic IOC processor.
pub struct IocProcessor {
    repo: IocRepo,
    cache: Option<IocCache>,
    abuse: Option<Arc<AbuseIpDbClient>>,
    geo: Arc<GeolocationService>,
    engine: CorrelationEngine,
    pass_lock: Mutex<()>,
}

impl IocProcessor {
    pub fn new(
        repo: IocRepo,
        cache: Option<IocCache>,
        abuse: Option<Arc<AbuseIpDbClient>>,
        geo: Arc<GeolocationService>,
        engine: CorrelationEngine,
    ) -> Self {
        Self {
            repo,
            cache,
            abuse,
            geo,
            engine,
            pass_lock: Mutex::new(()),
        }
    }

    /// Run one full correlation pass. Skips immediately if a pass is
    /// already in flight.
    pub async fn run_pass(&self) -> Result<()> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            tracing::warn!("IOC processing already in progress, skipping this cycle");
            return Ok(());
        };

        let Some(cache) = &self.cache else {
            tracing::warn!("Redis cache not configured, skipping IOC processing");
            return Ok(());
        };

        let started = Instant::now();
        tracing::info!("starting IOC processing cycle");

        let mut observations = self.repo.all_local_observations().await?;
        tracing::info!(count = observations.len(), "loaded local observations");

        let blacklist = self.fetch_blacklist_observations().await?;
        tracing::info!(count = blacklist.len(), "loaded blacklist observations");
        observations.extend(blacklist);

        let ip_addresses: Vec<String> = observations
            .iter()
            .map(|obs| obs.ip_address.clone())
            .collect();
        let mut external = self.repo.cached_enrichments_for(&ip_addresses).await?;

        // Blacklist-only entries carry their own score even without a cache
        // row; synthesize the external record so fusion sees both sides.
        for obs in observations.iter().filter(|o| o.source == "abuseipdb") {
            external
                .entry(obs.ip_address.clone())
                .or_insert_with(|| synthetic_blacklist_external(obs));
        }

        let correlated = self.engine.bulk_correlate(&observations, &external);

        let mut enriched = Vec::with_capacity(correlated.len());
        for (index, ioc) in correlated.into_iter().enumerate() {
            if index % PROCESS_BATCH_SIZE == 0 && index > 0 {
                tracing::info!(processed = index, "geolocation enrichment progress");
            }
            enriched.push(self.engine.enrich_with_geolocation(&self.geo, ioc).await);
        }

        cache
            .set_iocs(PREPROCESSED_KEY, &enriched, RESULT_TTL_SECS)
            .await?;

        let high_confidence: Vec<_> = enriched
            .iter()
            .filter(|ioc| ioc.confidence >= HIGH_CONFIDENCE_THRESHOLD)
            .cloned()
            .collect();
        cache
            .set_iocs(HIGH_CONFIDENCE_KEY, &high_confidence, RESULT_TTL_SECS)
            .await?;

        metrics::counter!("ioc_passes_total").increment(1);
        metrics::gauge!("iocs_processed").set(enriched.len() as f64);
        metrics::gauge!("iocs_high_confidence").set(high_confidence.len() as f64);

        tracing::info!(
            total = enriched.len(),
            high_confidence = high_confidence.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "IOC processing cycle complete"
        );

        Ok(())
    }

    /// Pull the external blacklist and shape entries not already reported
    /// locally into local-observation form.
    async fn fetch_blacklist_observations(&self) -> Result<Vec<LocalObservation>> {
        let Some(abuse) = &self.abuse else {
            return Ok(Vec::new());
        };

        let entries = match abuse
            .get_blacklist(BLACKLIST_CONFIDENCE_MINIMUM, BLACKLIST_FETCH_LIMIT)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch AbuseIPDB blacklist");
                return Ok(Vec::new());
            }
        };

        let local_ips = self.repo.local_ip_addresses().await?;

        Ok(entries
            .into_iter()
            .filter(|entry| !local_ips.contains(&entry.ip_address))
            .map(blacklist_observation)
            .collect())
    }
}

/// Shape one blacklist feed entry as a local-style observation.
fn blacklist_observation(entry: BlacklistEntry) -> LocalObservation {
    let now = Utc::now();
    LocalObservation {
        ip_address: entry.ip_address,
        confidence: entry.abuse_confidence_score,
        reported_at: entry.last_reported_at.unwrap_or(now),
        report_id: Some(format!("ABUSEIPDB-{}", entry.abuse_confidence_score)),
        categories: vec![crate::models::Category::Text("abuseipdb-blacklist".to_string())],
        created_at: now,
        source: "abuseipdb".to_string(),
    }
}

/// External record for a blacklist entry with no cache row. The feed only
/// proves one listing, hence the documented single-report default.
fn synthetic_blacklist_external(obs: &LocalObservation) -> ExternalObservation {
    ExternalObservation {
        abuse_confidence_score: obs.confidence,
        country_code: None,
        isp: None,
        usage_type: None,
        domain: None,
        total_reports: Some(DEFAULT_BLACKLIST_TOTAL_REPORTS),
        last_reported_at: Some(obs.reported_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    #[test]
    fn blacklist_entries_become_tagged_observations() {
        let entry = BlacklistEntry {
            ip_address: "198.51.100.77".to_string(),
            abuse_confidence_score: 92,
            country_code: Some("RU".to_string()),
            last_reported_at: None,
        };

        let obs = blacklist_observation(entry);
        assert_eq!(obs.ip_address, "198.51.100.77");
        assert_eq!(obs.confidence, 92);
        assert_eq!(obs.report_id.as_deref(), Some("ABUSEIPDB-92"));
        assert_eq!(obs.source, "abuseipdb");
        assert_eq!(
            obs.categories,
            vec![Category::Text("abuseipdb-blacklist".to_string())]
        );
    }

    #[test]
    fn synthetic_external_defaults_to_one_report() {
        let entry = BlacklistEntry {
            ip_address: "198.51.100.77".to_string(),
            abuse_confidence_score: 92,
            country_code: None,
            last_reported_at: None,
        };
        let obs = blacklist_observation(entry);
        let external = synthetic_blacklist_external(&obs);

        assert_eq!(external.abuse_confidence_score, 92);
        assert_eq!(external.total_reports, Some(DEFAULT_BLACKLIST_TOTAL_REPORTS));
        assert_eq!(external.last_reported_at, Some(obs.reported_at));
        assert!(external.country_code.is_none());
    }
}
