//! AbuseIPDB API v2 client.
//!
//! Three independent guards keep us inside the free tier: a semaphore caps
//! in-flight requests, a per-second quota smooths bursts, and the daily
//! budget is tracked in the `api_usage_tracking` table so it survives
//! restarts. A fresh cache row short-circuits the API entirely.

use std::collections::HashMap;
use std::num::NonZeroU32;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Duration;
use url::Url;

use crate::models::ExternalObservation;
use crate::storage::IocRepo;

const ABUSEIPDB_API_URL: &str = "https://api.abuseipdb.com/api/v2/";

/// Cache rows older than this are refreshed from the API.
pub const CACHE_TTL_HOURS: i64 = 24;

/// How far back reports count toward the confidence score.
pub const DEFAULT_MAX_AGE_DAYS: u32 = 90;

const MAX_CONCURRENT_REQUESTS: usize = 5;
const REQUESTS_PER_SECOND: u32 = 5;

/// One `/check` response record.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckedIp {
    pub ip_address: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub ip_version: i32,
    pub is_whitelisted: Option<bool>,
    pub abuse_confidence_score: i32,
    pub country_code: Option<String>,
    pub usage_type: Option<String>,
    pub isp: Option<String>,
    pub domain: Option<String>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub total_reports: i32,
    #[serde(default)]
    pub num_distinct_users: i32,
    pub last_reported_at: Option<DateTime<Utc>>,
}

impl CheckedIp {
    pub fn into_external(self) -> ExternalObservation {
        ExternalObservation {
            abuse_confidence_score: self.abuse_confidence_score,
            country_code: self.country_code,
            isp: self.isp,
            usage_type: self.usage_type,
            domain: self.domain,
            total_reports: Some(self.total_reports),
            last_reported_at: self.last_reported_at,
        }
    }
}

/// One `/blacklist` feed entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    pub ip_address: String,
    pub abuse_confidence_score: i32,
    pub country_code: Option<String>,
    pub last_reported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CheckEnvelope {
    data: CheckedIp,
}

#[derive(Debug, Deserialize)]
struct BlacklistEnvelope {
    data: Vec<BlacklistEntry>,
}

/// Async AbuseIPDB client with rate limiting.
pub struct AbuseIpDbClient {
    client: Client,
    base_url: Url,
    api_key: String,
    daily_limit: i64,
    semaphore: Semaphore,
    burst: DefaultDirectRateLimiter,
}

impl AbuseIpDbClient {
    pub fn new(api_key: String, daily_limit: i64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self::with_base_url(client, Url::parse(ABUSEIPDB_API_URL).expect("static url"), api_key, daily_limit)
    }

    pub fn with_base_url(client: Client, base_url: Url, api_key: String, daily_limit: i64) -> Self {
        let per_second = NonZeroU32::new(REQUESTS_PER_SECOND).expect("nonzero quota");
        Self {
            client,
            base_url,
            api_key,
            daily_limit,
            semaphore: Semaphore::new(MAX_CONCURRENT_REQUESTS),
            burst: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }

    /// Check one IP against `/check`.
    pub async fn check_ip(&self, ip: &str, max_age_days: u32) -> Result<CheckedIp> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("request semaphore closed")?;
        self.burst.until_ready().await;

        let url = self.base_url.join("check").context("invalid base URL")?;
        let max_age = max_age_days.min(365).to_string();

        let response = self
            .client
            .get(url)
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("ipAddress", ip), ("maxAgeInDays", &max_age), ("verbose", "true")])
            .send()
            .await
            .context("Failed to send request to AbuseIPDB")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("AbuseIPDB API error: {} - {}", status, body);
        }

        let envelope: CheckEnvelope = response
            .json()
            .await
            .context("Failed to parse AbuseIPDB response")?;

        Ok(envelope.data)
    }

    /// Fetch the bulk blacklist at or above a confidence floor.
    pub async fn get_blacklist(
        &self,
        confidence_minimum: i32,
        limit: usize,
    ) -> Result<Vec<BlacklistEntry>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("request semaphore closed")?;
        self.burst.until_ready().await;

        let url = self.base_url.join("blacklist").context("invalid base URL")?;

        let response = self
            .client
            .get(url)
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("confidenceMinimum", confidence_minimum.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .context("Failed to fetch AbuseIPDB blacklist")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("AbuseIPDB blacklist error: {} - {}", status, body);
        }

        let envelope: BlacklistEnvelope = response
            .json()
            .await
            .context("Failed to parse AbuseIPDB blacklist")?;

        Ok(envelope.data)
    }

    /// Cache-aware check: a fresh cache row wins, otherwise call the API if
    /// the daily budget allows. Returns `None` when the budget is exhausted
    /// or the API call fails; both are normal states for callers.
    pub async fn check_ip_with_cache(
        &self,
        repo: &IocRepo,
        ip: &str,
        force_refresh: bool,
    ) -> Result<Option<ExternalObservation>> {
        if !force_refresh {
            if let Some(cached) = repo.cached_enrichment(ip, CACHE_TTL_HOURS).await? {
                tracing::info!(ip, "using cached AbuseIPDB data");
                return Ok(Some(cached));
            }
        }

        let used = repo.daily_api_usage().await?;
        if used >= self.daily_limit {
            tracing::warn!(used, limit = self.daily_limit, "AbuseIPDB daily rate limit reached");
            return Ok(None);
        }

        tracing::info!(ip, "fetching fresh AbuseIPDB data");
        match self.check_ip(ip, DEFAULT_MAX_AGE_DAYS).await {
            Ok(data) => {
                repo.increment_api_usage(true).await?;
                repo.upsert_abuse_cache(&data).await?;
                metrics::counter!("abuseipdb_requests_total", "outcome" => "success").increment(1);
                Ok(Some(data.into_external()))
            }
            Err(e) => {
                tracing::error!(ip, error = %e, "AbuseIPDB check failed");
                if let Err(track_err) = repo.increment_api_usage(false).await {
                    tracing::warn!(error = %track_err, "failed to record API usage");
                }
                metrics::counter!("abuseipdb_requests_total", "outcome" => "failure").increment(1);
                Ok(None)
            }
        }
    }

    /// Check many IPs in small concurrent batches, stopping early when the
    /// daily budget runs out.
    pub async fn bulk_check_ips(
        &self,
        repo: &IocRepo,
        ip_addresses: &[String],
        batch_size: usize,
    ) -> Result<HashMap<String, Option<ExternalObservation>>> {
        let mut results = HashMap::with_capacity(ip_addresses.len());

        for batch in ip_addresses.chunks(batch_size.max(1)) {
            let used = repo.daily_api_usage().await?;
            if used >= self.daily_limit {
                tracing::warn!("rate limit reached during bulk check");
                break;
            }

            let checks = batch
                .iter()
                .map(|ip| self.check_ip_with_cache(repo, ip, false));
            let batch_results = futures::future::join_all(checks).await;

            for (ip, result) in batch.iter().zip(batch_results) {
                match result {
                    Ok(observation) => {
                        results.insert(ip.clone(), observation);
                    }
                    Err(e) => {
                        tracing::error!(ip, error = %e, "bulk check failed for IP");
                        results.insert(ip.clone(), None);
                    }
                }
            }

            // Breathe between batches so bursts stay off the wire.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Ok(results)
    }
}
