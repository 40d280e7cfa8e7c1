//! Intelligence fusion engine.
//!
//! Merges one local observation with at most one external reputation record
//! into a single confidence-scored, classified indicator. Local detections
//! are the primary signal; external data corroborates but never suppresses a
//! high-confidence local hit.
//!
//! The engine is stateless apart from its immutable scoring configuration,
//! so it can be shared freely across tasks. Only
//! [`CorrelationEngine::enrich_with_geolocation`] performs I/O.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::enrichment::GeolocationService;
use crate::models::category::{self, codes, Category};
use crate::models::{
    CorrelatedIndicator, EnrichmentData, ExternalObservation, LocalObservation, ProviderRecord,
    IOC_VALIDITY_DAYS,
};

/// Local confidence at or above this value marks a high-confidence detection.
pub const HIGH_LOCAL_CONFIDENCE: i32 = 75;

/// Tolerance when validating that the scoring weights sum to 1.0.
pub const WEIGHT_EPSILON: f64 = 0.001;

/// Scoring configuration, validated once at engine construction.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Weight of the local detection confidence (0.0-1.0).
    pub local_weight: f64,
    /// Weight of the external reputation confidence (0.0-1.0).
    pub external_weight: f64,
    /// Confidence floor applied when the local score is high.
    pub local_boost: i32,
    /// Default threshold for [`CorrelationEngine::filter_by_confidence`].
    pub confidence_minimum: i32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            local_weight: 0.8,
            external_weight: 0.2,
            local_boost: 85,
            confidence_minimum: 75,
        }
    }
}

/// Errors raised by engine construction.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("local and external weights must sum to 1.0 (got {local} + {external})")]
    InvalidWeights { local: f64, external: f64 },
}

/// Correlation engine for fusing local and external intelligence.
#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    local_weight: f64,
    external_weight: f64,
    local_boost: i32,
    confidence_minimum: i32,
}

impl CorrelationEngine {
    /// Build an engine from a validated scoring configuration.
    pub fn new(config: ScoringConfig) -> Result<Self, CorrelationError> {
        if (config.local_weight + config.external_weight - 1.0).abs() > WEIGHT_EPSILON {
            return Err(CorrelationError::InvalidWeights {
                local: config.local_weight,
                external: config.external_weight,
            });
        }

        Ok(Self {
            local_weight: config.local_weight,
            external_weight: config.external_weight,
            local_boost: config.local_boost,
            confidence_minimum: config.confidence_minimum,
        })
    }

    /// Fuse local and external confidence into one 0-100 score.
    ///
    /// Without external data a high local score is floored at `local_boost`
    /// so unvalidated local detections are not penalized. With external data
    /// the weighted sum applies, and the same floor kicks in whenever the
    /// local score is high: a weak external score never suppresses a strong
    /// local detection.
    pub fn fuse_confidence(&self, local_confidence: i32, external_confidence: Option<i32>) -> i32 {
        let local = local_confidence.clamp(0, 100);

        let Some(external) = external_confidence else {
            if local >= HIGH_LOCAL_CONFIDENCE {
                return local.max(self.local_boost);
            }
            return local;
        };

        let external = external.clamp(0, 100) as f64;
        let mut weighted = local as f64 * self.local_weight + external * self.external_weight;

        if local >= HIGH_LOCAL_CONFIDENCE {
            weighted = weighted.max(self.local_boost as f64);
        }

        weighted.clamp(0.0, 100.0) as i32
    }

    /// Freshness of a detection as a step-decayed weight in [0.0, 1.0].
    ///
    /// The curve is intentionally a step function so that freshness buckets
    /// stay stable and explainable. `reference_time` defaults to now; both
    /// sides are UTC so the subtraction is unambiguous.
    pub fn freshness_score(
        &self,
        reported_at: DateTime<Utc>,
        reference_time: Option<DateTime<Utc>>,
    ) -> f64 {
        let reference = reference_time.unwrap_or_else(Utc::now);
        let age_days = (reference - reported_at).num_days();

        match age_days {
            ..=1 => 1.0,
            2..=7 => 0.9,
            8..=30 => 0.7,
            31..=90 => 0.5,
            91..=180 => 0.3,
            _ => 0.1,
        }
    }

    /// Map category entries to STIX 2.1 threat labels.
    ///
    /// Unresolvable entries are skipped; an empty result defaults to
    /// `malicious-activity`. Sorted for determinism.
    pub fn map_categories_to_stix(&self, categories: &[Category]) -> Vec<String> {
        self.labels_for_codes(&category::resolve_codes(categories))
    }

    /// Map category entries to short threat-type tags.
    pub fn map_categories_to_threat_types(&self, categories: &[Category]) -> Vec<String> {
        self.threat_types_for_codes(&category::resolve_codes(categories))
    }

    /// Map category entries to MITRE ATT&CK-style kill-chain phase names.
    pub fn map_categories_to_kill_chain(&self, categories: &[Category]) -> Vec<String> {
        self.kill_chain_for_codes(&category::resolve_codes(categories))
    }

    fn labels_for_codes(&self, codes: &[u32]) -> Vec<String> {
        let mut labels: BTreeSet<&'static str> =
            codes.iter().filter_map(|&code| stix_label(code)).collect();

        if labels.is_empty() {
            labels.insert("malicious-activity");
        }

        labels.into_iter().map(str::to_string).collect()
    }

    fn threat_types_for_codes(&self, codes: &[u32]) -> Vec<String> {
        let tags: BTreeSet<&'static str> =
            codes.iter().filter_map(|&code| threat_type(code)).collect();
        tags.into_iter().map(str::to_string).collect()
    }

    fn kill_chain_for_codes(&self, codes: &[u32]) -> Vec<String> {
        let phases: BTreeSet<&'static str> = codes
            .iter()
            .filter_map(|&code| kill_chain_phase(code))
            .collect();
        phases.into_iter().map(str::to_string).collect()
    }

    /// Correlate one local observation with optional external reputation.
    ///
    /// Pure function of its inputs and the engine configuration: no I/O, no
    /// mutation of the inputs, never fails on per-indicator data issues.
    pub fn correlate(
        &self,
        local: &LocalObservation,
        external: Option<&ExternalObservation>,
    ) -> CorrelatedIndicator {
        let resolved = category::resolve_codes(&local.categories);
        let local_confidence = local.confidence.clamp(0, 100);
        let external_confidence = external.map(|e| e.abuse_confidence_score.clamp(0, 100));

        let confidence = self.fuse_confidence(local_confidence, external_confidence);
        let freshness_score = self.freshness_score(local.reported_at, None);
        let valid_until = local.reported_at + Duration::days(IOC_VALIDITY_DAYS);

        let mut providers = Vec::with_capacity(2);
        if let Some(ext) = external {
            providers.push(ProviderRecord {
                name: "AbuseIPDB".to_string(),
                source: "blacklist-api".to_string(),
                confidence: ext.abuse_confidence_score.clamp(0, 100),
                first_seen: ext.last_reported_at,
                last_seen: ext.last_reported_at,
                reference_url: Some(format!(
                    "https://www.abuseipdb.com/check/{}",
                    local.ip_address
                )),
            });
        }
        providers.push(ProviderRecord {
            name: "Local Detection".to_string(),
            source: "reported_ips".to_string(),
            confidence: local_confidence,
            first_seen: Some(local.reported_at),
            last_seen: Some(local.reported_at),
            reference_url: None,
        });

        let enrichment = EnrichmentData {
            isp: external.and_then(|e| e.isp.clone()),
            has_external_validation: external.is_some(),
            geolocation: None,
            providers,
            usage_type: external.and_then(|e| e.usage_type.clone()),
            domain: external.and_then(|e| e.domain.clone()),
            abuse_confidence_score: external_confidence,
            total_reports: external.and_then(|e| e.total_reports),
            last_reported_at: external.and_then(|e| e.last_reported_at),
        };

        CorrelatedIndicator {
            ip_address: local.ip_address.clone(),
            confidence,
            local_confidence,
            external_confidence,
            freshness_score,
            reported_at: local.reported_at,
            valid_from: local.reported_at,
            valid_until,
            categories: local.categories.clone(),
            labels: self.labels_for_codes(&resolved),
            threat_types: self.threat_types_for_codes(&resolved),
            kill_chain_phases: self.kill_chain_for_codes(&resolved),
            source_priority: "local_primary".to_string(),
            provider: if external.is_some() {
                "AbuseIPDB".to_string()
            } else {
                "Local Detection".to_string()
            },
            report_id: local.report_id.clone(),
            enrichment,
        }
    }

    /// Correlate a batch of local observations against a map of external
    /// data keyed by IP, sorted by confidence then freshness (descending)
    /// so confident, recent indicators surface first.
    pub fn bulk_correlate(
        &self,
        locals: &[LocalObservation],
        external_by_ip: &HashMap<String, ExternalObservation>,
    ) -> Vec<CorrelatedIndicator> {
        let mut correlated: Vec<CorrelatedIndicator> = locals
            .iter()
            .map(|local| self.correlate(local, external_by_ip.get(&local.ip_address)))
            .collect();

        correlated.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then_with(|| b.freshness_score.total_cmp(&a.freshness_score))
        });

        correlated
    }

    /// Keep only indicators at or above the confidence threshold. The
    /// threshold defaults to the configured minimum when unspecified.
    pub fn filter_by_confidence(
        &self,
        indicators: Vec<CorrelatedIndicator>,
        min_confidence: Option<i32>,
    ) -> Vec<CorrelatedIndicator> {
        let threshold = min_confidence.unwrap_or(self.confidence_minimum);
        indicators
            .into_iter()
            .filter(|ioc| ioc.confidence >= threshold)
            .collect()
    }

    /// Highest-priority subset: drop stale indicators, rank the rest by
    /// `confidence * freshness_score`, and return the top `limit`.
    pub fn priority_subset(
        &self,
        indicators: Vec<CorrelatedIndicator>,
        limit: usize,
        min_freshness: f64,
    ) -> Vec<CorrelatedIndicator> {
        let mut fresh: Vec<CorrelatedIndicator> = indicators
            .into_iter()
            .filter(|ioc| ioc.freshness_score >= min_freshness)
            .collect();

        fresh.sort_by(|a, b| {
            let pa = a.confidence as f64 * a.freshness_score;
            let pb = b.confidence as f64 * b.freshness_score;
            pb.total_cmp(&pa)
        });

        fresh.truncate(limit);
        fresh
    }

    /// Attach geolocation to an indicator, best effort.
    ///
    /// Resolver failures and empty results leave the indicator untouched;
    /// the service logs them. A successful lookup also backfills the ISP
    /// when the external feed did not supply one.
    pub async fn enrich_with_geolocation(
        &self,
        geo: &GeolocationService,
        mut indicator: CorrelatedIndicator,
    ) -> CorrelatedIndicator {
        if let Some(lookup) = geo.lookup(&indicator.ip_address).await {
            if indicator.enrichment.isp.is_none() {
                indicator.enrichment.isp = lookup.isp.clone();
            }
            indicator.enrichment.geolocation = Some(lookup.into_geolocation());
        }
        indicator
    }
}

fn stix_label(code: u32) -> Option<&'static str> {
    Some(match code {
        codes::FRAUD_ORDERS | codes::FTP_BRUTE_FORCE | codes::OPEN_PROXY | codes::VPN_IP => {
            "anonymization"
        }
        codes::PHISHING => "phishing",
        codes::FRAUD_VOIP => "fraud",
        codes::DNS_COMPROMISE
        | codes::DNS_POISONING
        | codes::DDOS_ATTACK
        | codes::PING_OF_DEATH
        | codes::WEB_SPAM
        | codes::EMAIL_SPAM
        | codes::BLOG_SPAM
        | codes::PORT_SCAN
        | codes::HACKING
        | codes::SQL_INJECTION
        | codes::SPOOFING
        | codes::BRUTE_FORCE
        | codes::BAD_WEB_BOT
        | codes::EXPLOITED_HOST
        | codes::WEB_APP_ATTACK
        | codes::SSH
        | codes::IOT_TARGETED => "malicious-activity",
        _ => return None,
    })
}

fn threat_type(code: u32) -> Option<&'static str> {
    Some(match code {
        codes::DDOS_ATTACK => "ddos",
        codes::FTP_BRUTE_FORCE => "brute-force",
        codes::PORT_SCAN => "reconnaissance",
        codes::HACKING => "exploit",
        codes::SQL_INJECTION => "data-collection",
        codes::BRUTE_FORCE => "credential-access",
        codes::WEB_APP_ATTACK => "web-attack",
        codes::SSH => "remote-access",
        _ => return None,
    })
}

fn kill_chain_phase(code: u32) -> Option<&'static str> {
    Some(match code {
        codes::PORT_SCAN => "reconnaissance",
        codes::HACKING | codes::WEB_APP_ATTACK => "initial-access",
        codes::FTP_BRUTE_FORCE | codes::BRUTE_FORCE => "credential-access",
        codes::SQL_INJECTION => "collection",
        codes::DDOS_ATTACK => "impact",
        codes::SSH => "persistence",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::{GeoResolveError, GeolocationService, MockGeoResolver};
    use chrono::Duration;

    fn engine() -> CorrelationEngine {
        CorrelationEngine::new(ScoringConfig::default()).unwrap()
    }

    fn local(ip: &str, confidence: i32, age_days: i64, categories: Vec<Category>) -> LocalObservation {
        let reported_at = Utc::now() - Duration::days(age_days);
        LocalObservation {
            ip_address: ip.to_string(),
            confidence,
            reported_at,
            report_id: None,
            categories,
            created_at: reported_at,
            source: "local".to_string(),
        }
    }

    fn external(score: i32) -> ExternalObservation {
        ExternalObservation {
            abuse_confidence_score: score,
            country_code: Some("US".to_string()),
            isp: Some("Test ISP".to_string()),
            usage_type: None,
            domain: None,
            total_reports: Some(12),
            last_reported_at: Some(Utc::now()),
        }
    }

    #[test]
    fn construction_rejects_invalid_weights() {
        let result = CorrelationEngine::new(ScoringConfig {
            local_weight: 0.7,
            external_weight: 0.2,
            ..ScoringConfig::default()
        });
        assert!(matches!(
            result,
            Err(CorrelationError::InvalidWeights { .. })
        ));
    }

    #[test]
    fn construction_tolerates_rounding_within_epsilon() {
        let result = CorrelationEngine::new(ScoringConfig {
            local_weight: 0.6,
            external_weight: 0.4000001,
            ..ScoringConfig::default()
        });
        assert!(result.is_ok());
    }

    #[test]
    fn fusion_without_external_floors_high_local_scores() {
        let engine = engine();
        for local in 0..=100 {
            let fused = engine.fuse_confidence(local, None);
            if local >= 75 {
                assert_eq!(fused, local.max(85));
            } else {
                assert_eq!(fused, local);
            }
        }
    }

    #[test]
    fn fusion_weights_local_and_external() {
        let engine = engine();
        // 50*0.8 + 90*0.2 = 58, below the boost threshold
        assert_eq!(engine.fuse_confidence(50, Some(90)), 58);
        // 30*0.8 + 10*0.2 = 26
        assert_eq!(engine.fuse_confidence(30, Some(10)), 26);
    }

    #[test]
    fn fusion_floor_applies_whenever_local_is_high() {
        let engine = engine();
        // 80*0.8 + 60*0.2 = 76, raised to the floor because local >= 75
        assert_eq!(engine.fuse_confidence(80, Some(60)), 85);
        // 75*0.8 + 50*0.2 = 70, same floor
        assert_eq!(engine.fuse_confidence(75, Some(50)), 85);
        // 95*0.8 + 100*0.2 = 96, already above the floor
        assert_eq!(engine.fuse_confidence(95, Some(100)), 96);
    }

    #[test]
    fn fusion_never_exceeds_one_hundred() {
        let engine = engine();
        assert_eq!(engine.fuse_confidence(100, Some(100)), 100);
        assert_eq!(engine.fuse_confidence(100, None), 100);
        assert_eq!(engine.fuse_confidence(250, Some(300)), 100);
    }

    #[test]
    fn freshness_follows_the_step_curve() {
        let engine = engine();
        let now = Utc::now();
        let cases = [
            (0, 1.0),
            (1, 1.0),
            (3, 0.9),
            (7, 0.9),
            (15, 0.7),
            (30, 0.7),
            (31, 0.5),
            (90, 0.5),
            (91, 0.3),
            (180, 0.3),
            (181, 0.1),
            (365, 0.1),
        ];
        for (age, expected) in cases {
            let reported = now - Duration::days(age);
            assert_eq!(
                engine.freshness_score(reported, Some(now)),
                expected,
                "age {age} days"
            );
        }
    }

    #[test]
    fn freshness_is_non_increasing_with_age() {
        let engine = engine();
        let now = Utc::now();
        let mut previous = f64::INFINITY;
        for age in 0..400 {
            let score = engine.freshness_score(now - Duration::days(age), Some(now));
            assert!(score <= previous, "freshness rose at age {age}");
            assert!((0.0..=1.0).contains(&score));
            previous = score;
        }
    }

    #[test]
    fn empty_categories_default_to_malicious_activity() {
        let engine = engine();
        assert_eq!(
            engine.map_categories_to_stix(&[]),
            vec!["malicious-activity".to_string()]
        );
    }

    #[test]
    fn unresolvable_categories_default_to_malicious_activity() {
        let engine = engine();
        let categories = vec![Category::Text("abuseipdb-blacklist".to_string())];
        assert_eq!(
            engine.map_categories_to_stix(&categories),
            vec!["malicious-activity".to_string()]
        );
    }

    #[test]
    fn network_attack_categories_map_to_malicious_activity() {
        let engine = engine();
        let categories: Vec<Category> = [4u32, 14, 22].map(Category::from).to_vec();
        let labels = engine.map_categories_to_stix(&categories);
        assert!(labels.contains(&"malicious-activity".to_string()));
    }

    #[test]
    fn specific_categories_map_to_specific_labels() {
        let engine = engine();
        let categories = vec![
            Category::Object(crate::models::category::CategoryRef {
                id: Some(7),
                category_id: None,
            }),
            Category::Code(13),
        ];
        let labels = engine.map_categories_to_stix(&categories);
        assert!(labels.contains(&"phishing".to_string()));
        assert!(labels.contains(&"anonymization".to_string()));
    }

    #[test]
    fn labels_are_sorted_and_deduplicated() {
        let engine = engine();
        let categories: Vec<Category> = [13u32, 7, 4, 9, 14].map(Category::from).to_vec();
        let labels = engine.map_categories_to_stix(&categories);
        let mut sorted = labels.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(labels, sorted);
    }

    #[test]
    fn threat_types_and_kill_chain_skip_unknown_codes() {
        let engine = engine();
        let categories: Vec<Category> = [4u32, 14, 999].map(Category::from).to_vec();

        let threat_types = engine.map_categories_to_threat_types(&categories);
        assert!(threat_types.contains(&"ddos".to_string()));
        assert!(threat_types.contains(&"reconnaissance".to_string()));
        assert_eq!(threat_types.len(), 2);

        let phases = engine.map_categories_to_kill_chain(&categories);
        assert!(phases.contains(&"impact".to_string()));
        assert!(phases.contains(&"reconnaissance".to_string()));
        assert_eq!(phases.len(), 2);
    }

    #[test]
    fn correlate_without_external_data() {
        let engine = engine();
        let obs = local("198.51.100.9", 70, 0, vec![Category::Code(14)]);
        let ioc = engine.correlate(&obs, None);

        assert_eq!(ioc.confidence, 70);
        assert_eq!(ioc.external_confidence, None);
        assert_eq!(ioc.provider, "Local Detection");
        assert!(!ioc.enrichment.has_external_validation);
        assert_eq!(ioc.enrichment.providers.len(), 1);
        assert_eq!(ioc.enrichment.providers[0].name, "Local Detection");
        assert_eq!(ioc.valid_until, ioc.reported_at + Duration::days(30));
    }

    #[test]
    fn correlate_with_external_data() {
        let engine = engine();
        let mut obs = local("192.168.1.1", 80, 0, vec![Category::Code(4), Category::Code(14)]);
        obs.report_id = Some("test-123".to_string());
        let ext = external(70);
        let ioc = engine.correlate(&obs, Some(&ext));

        assert_eq!(ioc.ip_address, "192.168.1.1");
        assert_eq!(ioc.confidence, 85);
        assert_eq!(ioc.local_confidence, 80);
        assert_eq!(ioc.external_confidence, Some(70));
        assert_eq!(ioc.source_priority, "local_primary");
        assert_eq!(ioc.provider, "AbuseIPDB");
        assert!(ioc.labels.contains(&"malicious-activity".to_string()));
        assert_eq!(ioc.report_id.as_deref(), Some("test-123"));

        let providers = &ioc.enrichment.providers;
        assert_eq!(providers[0].name, "AbuseIPDB");
        assert_eq!(providers[1].name, "Local Detection");
        assert!(ioc.enrichment.has_external_validation);
        assert_eq!(ioc.enrichment.isp.as_deref(), Some("Test ISP"));
        assert_eq!(ioc.enrichment.total_reports, Some(12));
    }

    #[test]
    fn bulk_correlate_sorts_by_confidence_then_freshness() {
        let engine = engine();
        let locals = vec![
            local("203.0.113.1", 40, 0, vec![]),
            local("203.0.113.2", 90, 100, vec![]),
            local("203.0.113.3", 90, 0, vec![]),
            local("203.0.113.4", 60, 10, vec![]),
        ];
        let iocs = engine.bulk_correlate(&locals, &HashMap::new());

        for pair in iocs.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(
                a.confidence > b.confidence
                    || (a.confidence == b.confidence && a.freshness_score >= b.freshness_score)
            );
        }
        assert_eq!(iocs[0].ip_address, "203.0.113.3");
        assert_eq!(iocs[1].ip_address, "203.0.113.2");
    }

    #[test]
    fn bulk_correlate_joins_external_data_by_ip() {
        let engine = engine();
        let locals = vec![
            local("203.0.113.1", 50, 0, vec![]),
            local("203.0.113.2", 50, 0, vec![]),
        ];
        let mut external_by_ip = HashMap::new();
        external_by_ip.insert("203.0.113.2".to_string(), external(90));

        let iocs = engine.bulk_correlate(&locals, &external_by_ip);
        let with_ext = iocs
            .iter()
            .find(|i| i.ip_address == "203.0.113.2")
            .unwrap();
        let without_ext = iocs
            .iter()
            .find(|i| i.ip_address == "203.0.113.1")
            .unwrap();

        assert_eq!(with_ext.external_confidence, Some(90));
        assert_eq!(without_ext.external_confidence, None);
    }

    #[test]
    fn filter_by_confidence_uses_configured_default() {
        let engine = engine();
        let locals = vec![
            local("203.0.113.1", 90, 0, vec![]),
            local("203.0.113.2", 50, 0, vec![]),
        ];
        let iocs = engine.bulk_correlate(&locals, &HashMap::new());

        let filtered = engine.filter_by_confidence(iocs.clone(), None);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].ip_address, "203.0.113.1");

        let filtered = engine.filter_by_confidence(iocs, Some(40));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn priority_subset_ranks_by_confidence_times_freshness() {
        let engine = engine();
        let locals = vec![
            // 90 * 0.5 = 45
            local("203.0.113.1", 90, 60, vec![]),
            // 70 * 1.0 = 70
            local("203.0.113.2", 70, 0, vec![]),
            // stale, filtered out by min_freshness
            local("203.0.113.3", 100, 365, vec![]),
        ];
        let iocs = engine.bulk_correlate(&locals, &HashMap::new());
        let priority = engine.priority_subset(iocs, 10, 0.5);

        assert_eq!(priority.len(), 2);
        assert_eq!(priority[0].ip_address, "203.0.113.2");
        assert_eq!(priority[1].ip_address, "203.0.113.1");
    }

    #[test]
    fn priority_subset_honors_limit() {
        let engine = engine();
        let locals: Vec<LocalObservation> = (0..20)
            .map(|i| local(&format!("203.0.113.{i}"), 50 + i, 0, vec![]))
            .collect();
        let iocs = engine.bulk_correlate(&locals, &HashMap::new());
        assert_eq!(engine.priority_subset(iocs, 5, 0.0).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn geolocation_failure_leaves_indicator_unchanged() {
        let engine = engine();
        let mut resolver = MockGeoResolver::new();
        resolver.expect_name().return_const("mock");
        resolver
            .expect_resolve()
            .returning(|_| Err(GeoResolveError::Unavailable("boom".to_string())));

        let geo = GeolocationService::with_resolvers(vec![Box::new(resolver)]);
        let obs = local("8.8.8.8", 80, 0, vec![]);
        let before = engine.correlate(&obs, None);

        let after = engine.enrich_with_geolocation(&geo, before.clone()).await;
        assert!(after.enrichment.geolocation.is_none());
        assert_eq!(after.confidence, before.confidence);
        assert_eq!(after.enrichment.isp, before.enrichment.isp);
    }

    #[tokio::test(start_paused = true)]
    async fn geolocation_success_attaches_data_and_backfills_isp() {
        use crate::enrichment::GeoLookup;

        let engine = engine();
        let mut resolver = MockGeoResolver::new();
        resolver.expect_name().return_const("mock");
        resolver.expect_resolve().returning(|_| {
            Ok(Some(GeoLookup {
                country_code: Some("NL".to_string()),
                country_name: Some("Netherlands".to_string()),
                region: Some("North Holland".to_string()),
                city: Some("Amsterdam".to_string()),
                latitude: Some(52.37),
                longitude: Some(4.89),
                continent: Some("Europe".to_string()),
                isp: Some("Example Hosting".to_string()),
                org: None,
                timezone: None,
                source: "mock",
            }))
        });

        let geo = GeolocationService::with_resolvers(vec![Box::new(resolver)]);
        let obs = local("1.1.1.1", 60, 0, vec![]);
        let ioc = engine.correlate(&obs, None);

        let enriched = engine.enrich_with_geolocation(&geo, ioc).await;
        let geodata = enriched.enrichment.geolocation.expect("geolocation attached");
        assert_eq!(geodata.country_code.as_deref(), Some("NL"));
        assert_eq!(geodata.threat_level.as_deref(), Some("low"));
        assert_eq!(enriched.enrichment.isp.as_deref(), Some("Example Hosting"));
    }
}
