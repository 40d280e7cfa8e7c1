//! Postgres storage layer.
//!
//! `reported_ips` is owned by the upstream detection pipeline and treated as
//! read-only here. The cache and usage-tracking tables belong to this
//! service and are created by the embedded migrations.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::enrichment::abuseipdb::CheckedIp;
use crate::models::{Category, ExternalObservation, LocalObservation, DEFAULT_LOCAL_CONFIDENCE};

/// Local observations younger than this count as "fresh" in list queries.
const FRESH_WINDOW_DAYS: i64 = 7;

#[derive(Debug, FromRow)]
struct ReportedIpRow {
    ip_address: String,
    reported_at: DateTime<Utc>,
    report_id: Option<String>,
    categories: Option<Json<Vec<Category>>>,
    confidence: Option<i32>,
    created_at: DateTime<Utc>,
}

impl From<ReportedIpRow> for LocalObservation {
    fn from(row: ReportedIpRow) -> Self {
        LocalObservation {
            ip_address: row.ip_address,
            confidence: row.confidence.unwrap_or(DEFAULT_LOCAL_CONFIDENCE),
            reported_at: row.reported_at,
            report_id: row.report_id,
            categories: row.categories.map(|c| c.0).unwrap_or_default(),
            created_at: row.created_at,
            source: "local".to_string(),
        }
    }
}

#[derive(Debug, FromRow)]
struct AbuseCacheRow {
    ip_address: String,
    abuse_confidence_score: i32,
    country_code: Option<String>,
    usage_type: Option<String>,
    isp: Option<String>,
    domain: Option<String>,
    total_reports: Option<i32>,
    last_reported_at: Option<DateTime<Utc>>,
}

impl From<AbuseCacheRow> for ExternalObservation {
    fn from(row: AbuseCacheRow) -> Self {
        ExternalObservation {
            abuse_confidence_score: row.abuse_confidence_score,
            country_code: row.country_code,
            isp: row.isp,
            usage_type: row.usage_type,
            domain: row.domain,
            total_reports: row.total_reports,
            last_reported_at: row.last_reported_at,
        }
    }
}

/// Aggregated API usage over a window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UsageSummary {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
}

/// Database repository for observations, enrichment cache, and API usage.
#[derive(Clone)]
pub struct IocRepo {
    pool: PgPool,
}

impl IocRepo {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }

    // ==================== Local observations ====================

    /// Page through local observations, most recent first.
    pub async fn list_local_observations(
        &self,
        min_confidence: Option<i32>,
        fresh_only: bool,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<LocalObservation>> {
        let cutoff = fresh_cutoff(fresh_only);

        let rows = sqlx::query_as::<_, ReportedIpRow>(
            r#"
            SELECT ip_address, reported_at, report_id, categories, confidence, created_at
            FROM reported_ips
            WHERE confidence >= $1 AND reported_at >= $2
            ORDER BY reported_at DESC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(min_confidence.unwrap_or(0))
        .bind(cutoff)
        .bind(skip.max(0))
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list local observations")?;

        Ok(rows.into_iter().map(LocalObservation::from).collect())
    }

    pub async fn count_local_observations(
        &self,
        min_confidence: Option<i32>,
        fresh_only: bool,
    ) -> Result<i64> {
        let cutoff = fresh_cutoff(fresh_only);

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM reported_ips WHERE confidence >= $1 AND reported_at >= $2",
        )
        .bind(min_confidence.unwrap_or(0))
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count local observations")?;

        Ok(count.0)
    }

    /// Full scan for batch passes.
    pub async fn all_local_observations(&self) -> Result<Vec<LocalObservation>> {
        let rows = sqlx::query_as::<_, ReportedIpRow>(
            r#"
            SELECT ip_address, reported_at, report_id, categories, confidence, created_at
            FROM reported_ips
            ORDER BY reported_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch local observations")?;

        Ok(rows.into_iter().map(LocalObservation::from).collect())
    }

    /// IP set used to dedup the blacklist feed against local detections.
    pub async fn local_ip_addresses(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT ip_address FROM reported_ips")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch local IP addresses")?;

        Ok(rows.into_iter().map(|(ip,)| ip).collect())
    }

    // ==================== Enrichment cache ====================

    /// Fetch a cache row if it is still fresh.
    pub async fn cached_enrichment(
        &self,
        ip_address: &str,
        ttl_hours: i64,
    ) -> Result<Option<ExternalObservation>> {
        let cutoff = Utc::now() - Duration::hours(ttl_hours);

        let row = sqlx::query_as::<_, AbuseCacheRow>(
            r#"
            SELECT ip_address, abuse_confidence_score, country_code, usage_type,
                   isp, domain, total_reports, last_reported_at
            FROM abuseipdb_cache
            WHERE ip_address = $1 AND last_checked >= $2
            "#,
        )
        .bind(ip_address)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch cached enrichment")?;

        Ok(row.map(ExternalObservation::from))
    }

    /// Batch-fetch cache rows for a set of IPs, regardless of age. Batch
    /// passes prefer stale external data over none; refresh is the API
    /// client's concern.
    pub async fn cached_enrichments_for(
        &self,
        ip_addresses: &[String],
    ) -> Result<HashMap<String, ExternalObservation>> {
        if ip_addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, AbuseCacheRow>(
            r#"
            SELECT ip_address, abuse_confidence_score, country_code, usage_type,
                   isp, domain, total_reports, last_reported_at
            FROM abuseipdb_cache
            WHERE ip_address = ANY($1)
            "#,
        )
        .bind(ip_addresses)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch cached enrichments")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.ip_address.clone(), ExternalObservation::from(row)))
            .collect())
    }

    /// Insert or refresh a cache row from a `/check` response.
    pub async fn upsert_abuse_cache(&self, data: &CheckedIp) -> Result<()> {
        let extra = serde_json::to_value(data).context("Failed to serialize cache payload")?;

        sqlx::query(
            r#"
            INSERT INTO abuseipdb_cache (
                ip_address, abuse_confidence_score, country_code, usage_type, isp,
                domain, total_reports, num_distinct_users, last_reported_at,
                extra_data, last_checked
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (ip_address) DO UPDATE SET
                abuse_confidence_score = EXCLUDED.abuse_confidence_score,
                country_code = EXCLUDED.country_code,
                usage_type = EXCLUDED.usage_type,
                isp = EXCLUDED.isp,
                domain = EXCLUDED.domain,
                total_reports = EXCLUDED.total_reports,
                num_distinct_users = EXCLUDED.num_distinct_users,
                last_reported_at = EXCLUDED.last_reported_at,
                extra_data = EXCLUDED.extra_data,
                last_checked = EXCLUDED.last_checked,
                updated_at = NOW()
            "#,
        )
        .bind(&data.ip_address)
        .bind(data.abuse_confidence_score)
        .bind(&data.country_code)
        .bind(&data.usage_type)
        .bind(&data.isp)
        .bind(&data.domain)
        .bind(data.total_reports)
        .bind(data.num_distinct_users)
        .bind(data.last_reported_at)
        .bind(extra)
        .execute(&self.pool)
        .await
        .context("Failed to upsert cache entry")?;

        Ok(())
    }

    pub async fn count_cache_entries(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM abuseipdb_cache")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count cache entries")?;
        Ok(count.0)
    }

    // ==================== API usage tracking ====================

    /// Requests made against the external API today (UTC).
    pub async fn daily_api_usage(&self) -> Result<i64> {
        let today = Utc::now().date_naive();

        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT requests_count FROM api_usage_tracking WHERE date = $1",
        )
        .bind(today)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read API usage")?;

        Ok(row.map(|(count,)| count as i64).unwrap_or(0))
    }

    /// Bump today's counters, creating the row on first use.
    pub async fn increment_api_usage(&self, success: bool) -> Result<()> {
        let today = Utc::now().date_naive();
        let (ok, failed) = if success { (1, 0) } else { (0, 1) };

        sqlx::query(
            r#"
            INSERT INTO api_usage_tracking (date, requests_count, successful_requests, failed_requests)
            VALUES ($1, 1, $2, $3)
            ON CONFLICT (date) DO UPDATE SET
                requests_count = api_usage_tracking.requests_count + 1,
                successful_requests = api_usage_tracking.successful_requests + $2,
                failed_requests = api_usage_tracking.failed_requests + $3,
                updated_at = NOW()
            "#,
        )
        .bind(today)
        .bind(ok)
        .bind(failed)
        .execute(&self.pool)
        .await
        .context("Failed to increment API usage")?;

        Ok(())
    }

    /// Usage counters summed over the last seven days.
    pub async fn usage_last_7_days(&self) -> Result<UsageSummary> {
        let cutoff = Utc::now().date_naive() - Duration::days(7);

        let row: (Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT SUM(requests_count), SUM(successful_requests), SUM(failed_requests)
            FROM api_usage_tracking
            WHERE date >= $1
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("Failed to aggregate API usage")?;

        Ok(UsageSummary {
            total_requests: row.0.unwrap_or(0),
            successful_requests: row.1.unwrap_or(0),
            failed_requests: row.2.unwrap_or(0),
        })
    }
}

fn fresh_cutoff(fresh_only: bool) -> DateTime<Utc> {
    if fresh_only {
        Utc::now() - Duration::days(FRESH_WINDOW_DAYS)
    } else {
        DateTime::<Utc>::UNIX_EPOCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_ip_row_defaults_confidence_and_categories() {
        let row = ReportedIpRow {
            ip_address: "203.0.113.9".to_string(),
            reported_at: Utc::now(),
            report_id: None,
            categories: None,
            confidence: None,
            created_at: Utc::now(),
        };

        let obs = LocalObservation::from(row);
        assert_eq!(obs.confidence, DEFAULT_LOCAL_CONFIDENCE);
        assert!(obs.categories.is_empty());
        assert_eq!(obs.source, "local");
    }

    #[test]
    fn fresh_cutoff_spans_seven_days() {
        let cutoff = fresh_cutoff(true);
        let age = Utc::now() - cutoff;
        assert_eq!(age.num_days(), FRESH_WINDOW_DAYS);
        assert_eq!(fresh_cutoff(false), DateTime::<Utc>::UNIX_EPOCH);
    }
}
