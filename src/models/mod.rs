//! Core data models for correlated threat intelligence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

pub mod category;

pub use category::Category;

/// Default confidence assigned to local detections that carry no score.
pub const DEFAULT_LOCAL_CONFIDENCE: i32 = 75;

/// Indicators expire this many days after their local report time.
pub const IOC_VALIDITY_DAYS: i64 = 30;

/// `total_reports` assumed for blacklist feed entries that have no cache hit.
/// The feed only tells us the IP is listed, so we record a single report.
pub const DEFAULT_BLACKLIST_TOTAL_REPORTS: i32 = 1;

/// A locally observed indicator from the `reported_ips` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalObservation {
    pub ip_address: String,
    pub confidence: i32,
    pub reported_at: DateTime<Utc>,
    pub report_id: Option<String>,
    #[serde(default)]
    pub categories: Vec<Category>,
    pub created_at: DateTime<Utc>,
    /// Where this observation came from: "local" or "abuseipdb".
    #[serde(default = "LocalObservation::default_source")]
    pub source: String,
}

impl LocalObservation {
    fn default_source() -> String {
        "local".to_string()
    }
}

/// External reputation data for one IP, from the cache table or the
/// blacklist feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalObservation {
    pub abuse_confidence_score: i32,
    pub country_code: Option<String>,
    pub isp: Option<String>,
    pub usage_type: Option<String>,
    pub domain: Option<String>,
    pub total_reports: Option<i32>,
    pub last_reported_at: Option<DateTime<Utc>>,
}

/// Attribution record for one intelligence provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    pub source: String,
    pub confidence: i32,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
}

/// Geolocation attached to an indicator for display.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GeolocationData {
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub continent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_level: Option<String>,
}

/// Enrichment block of a correlated indicator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnrichmentData {
    pub isp: Option<String>,
    pub has_external_validation: bool,
    pub geolocation: Option<GeolocationData>,
    pub providers: Vec<ProviderRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abuse_confidence_score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_reports: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reported_at: Option<DateTime<Utc>>,
}

/// One fused indicator record: local observation merged with external
/// reputation, scored and classified. Built fresh on every correlation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatedIndicator {
    pub ip_address: String,
    pub confidence: i32,
    pub local_confidence: i32,
    pub external_confidence: Option<i32>,
    pub freshness_score: f64,
    pub reported_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub categories: Vec<Category>,
    pub labels: Vec<String>,
    pub threat_types: Vec<String>,
    pub kill_chain_phases: Vec<String>,
    pub source_priority: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    pub enrichment: EnrichmentData,
}

/// Paginated IOC list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocListResponse {
    pub total: i64,
    pub items: Vec<CorrelatedIndicator>,
    pub page: i64,
    pub page_size: i64,
}

/// Query parameters for the IOC list endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IocListParams {
    #[serde(default)]
    pub skip: i64,
    pub limit: Option<i64>,
    pub min_confidence: Option<i32>,
    #[serde(default = "IocListParams::default_include_enrichment")]
    pub include_enrichment: bool,
    #[serde(default)]
    pub fresh_only: bool,
}

impl IocListParams {
    fn default_include_enrichment() -> bool {
        true
    }
}

/// Request body for bulk IP reputation checks.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BulkCheckRequest {
    #[validate(length(min = 1, max = 100), custom = "validate_ip_list")]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

fn validate_ip_list(ips: &Vec<String>) -> Result<(), ValidationError> {
    for ip in ips {
        if ip.parse::<std::net::IpAddr>().is_err() {
            let mut err = ValidationError::new("invalid_ip");
            err.message = Some(format!("invalid IP address: {ip}").into());
            return Err(err);
        }
    }
    Ok(())
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    pub status: String,
    pub database: bool,
    pub abuseipdb: bool,
    pub timestamp: DateTime<Utc>,
    pub daily_requests_used: i64,
    pub daily_requests_limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn bulk_check_rejects_malformed_ips() {
        let req = BulkCheckRequest {
            ip_addresses: vec!["203.0.113.7".into(), "not-an-ip".into()],
            force_refresh: false,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn bulk_check_accepts_v4_and_v6() {
        let req = BulkCheckRequest {
            ip_addresses: vec!["203.0.113.7".into(), "2001:db8::1".into()],
            force_refresh: true,
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn bulk_check_rejects_empty_list() {
        let req = BulkCheckRequest {
            ip_addresses: vec![],
            force_refresh: false,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn external_only_enrichment_fields_are_omitted_when_absent() {
        let enrichment = EnrichmentData::default();
        let value = serde_json::to_value(&enrichment).unwrap();
        assert!(value.get("usage_type").is_none());
        assert!(value.get("total_reports").is_none());
        assert!(value.get("geolocation").is_some());
    }
}
