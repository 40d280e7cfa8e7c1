//! STIX 2.1 export.
//!
//! Indicators are plain JSON objects in the fixed STIX 2.1 shape. Indicator
//! ids are derived from a hash of the IP so the same indicator keeps the
//! same id across batch passes, which keeps TAXII manifests stable.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Category, CorrelatedIndicator};

/// Deterministic STIX id for an IP indicator.
pub fn indicator_id(ip_address: &str) -> String {
    let digest = Sha256::digest(ip_address.as_bytes());
    let hex = hex::encode(&digest[..16]);
    format!(
        "indicator--{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// STIX comparison pattern for an IP, v4 or v6.
pub fn ip_pattern(ip_address: &str) -> String {
    match ip_address.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V6(_)) => format!("[ipv6-addr:value = '{ip_address}']"),
        _ => format!("[ipv4-addr:value = '{ip_address}']"),
    }
}

/// Build one STIX 2.1 Indicator object from a correlated IOC.
pub fn create_indicator(ioc: &CorrelatedIndicator) -> Value {
    let mut indicator = json!({
        "type": "indicator",
        "spec_version": "2.1",
        "id": indicator_id(&ioc.ip_address),
        "created": ioc.reported_at,
        "modified": chrono::Utc::now(),
        "pattern": ip_pattern(&ioc.ip_address),
        "pattern_type": "stix",
        "valid_from": ioc.valid_from,
        "valid_until": ioc.valid_until,
        "labels": ioc.labels.clone(),
        "confidence": ioc.confidence,
        "x_local_detection": true,
        "x_local_confidence": ioc.local_confidence,
        "x_source_priority": ioc.source_priority.clone(),
        "x_freshness_score": ioc.freshness_score,
    });

    let fields = indicator
        .as_object_mut()
        .expect("indicator is always a JSON object");

    if let Some(name) = attack_pattern_name(&ioc.categories) {
        fields.insert("name".to_string(), json!(name));
    }

    if !ioc.kill_chain_phases.is_empty() {
        let phases: Vec<Value> = ioc
            .kill_chain_phases
            .iter()
            .map(|phase| {
                json!({
                    "kill_chain_name": "mitre-attack",
                    "phase_name": phase,
                })
            })
            .collect();
        fields.insert("kill_chain_phases".to_string(), Value::Array(phases));
    }

    if let Some(report_id) = &ioc.report_id {
        fields.insert("x_report_id".to_string(), json!(report_id));
    }
    if let Some(external) = ioc.external_confidence {
        fields.insert("x_abuseipdb_confidence".to_string(), json!(external));
    }
    if let Some(geo) = &ioc.enrichment.geolocation {
        if let Some(country) = &geo.country_code {
            fields.insert("x_country_code".to_string(), json!(country));
        }
    }
    if let Some(isp) = &ioc.enrichment.isp {
        fields.insert("x_isp".to_string(), json!(isp));
    }

    indicator
}

/// Build a STIX Bundle wrapping one indicator per IOC.
pub fn create_bundle(iocs: &[CorrelatedIndicator]) -> Value {
    let objects: Vec<Value> = iocs.iter().map(create_indicator).collect();

    json!({
        "type": "bundle",
        "id": format!("bundle--{}", Uuid::new_v4()),
        "objects": objects,
    })
}

/// Attack-pattern display names for a category set, if any map.
pub fn attack_pattern_name(categories: &[Category]) -> Option<String> {
    let mut names: Vec<&'static str> = crate::models::category::resolve_codes(categories)
        .into_iter()
        .filter_map(|code| match code {
            4 => Some("DDoS"),
            5 | 18 => Some("Brute Force"),
            14 => Some("Port Scanning"),
            15 => Some("Exploitation"),
            16 => Some("SQL Injection"),
            21 => Some("Web Application Attack"),
            22 => Some("SSH Attack"),
            _ => None,
        })
        .collect();

    names.sort_unstable();
    names.dedup();

    if names.is_empty() {
        None
    } else {
        Some(names.join(" / "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{CorrelationEngine, ScoringConfig};
    use crate::models::{Category, LocalObservation};
    use chrono::Utc;

    fn sample_ioc(ip: &str) -> CorrelatedIndicator {
        let engine = CorrelationEngine::new(ScoringConfig::default()).unwrap();
        let obs = LocalObservation {
            ip_address: ip.to_string(),
            confidence: 80,
            reported_at: Utc::now(),
            report_id: Some("rpt-9".to_string()),
            categories: vec![Category::Code(4), Category::Code(22)],
            created_at: Utc::now(),
            source: "local".to_string(),
        };
        engine.correlate(&obs, None)
    }

    #[test]
    fn indicator_ids_are_deterministic_and_distinct() {
        let a = indicator_id("203.0.113.7");
        let b = indicator_id("203.0.113.7");
        let c = indicator_id("203.0.113.8");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("indicator--"));
        assert_eq!(a.len(), "indicator--".len() + 36);
    }

    #[test]
    fn patterns_distinguish_v4_and_v6() {
        assert_eq!(ip_pattern("203.0.113.7"), "[ipv4-addr:value = '203.0.113.7']");
        assert_eq!(ip_pattern("2001:db8::1"), "[ipv6-addr:value = '2001:db8::1']");
    }

    #[test]
    fn indicator_carries_labels_confidence_and_custom_properties() {
        let ioc = sample_ioc("203.0.113.7");
        let indicator = create_indicator(&ioc);

        assert_eq!(indicator["type"], "indicator");
        assert_eq!(indicator["spec_version"], "2.1");
        assert_eq!(indicator["pattern_type"], "stix");
        assert_eq!(indicator["confidence"], ioc.confidence);
        assert_eq!(indicator["x_local_confidence"], 80);
        assert_eq!(indicator["x_report_id"], "rpt-9");
        assert!(indicator["labels"]
            .as_array()
            .unwrap()
            .iter()
            .any(|l| l == "malicious-activity"));

        let phases = indicator["kill_chain_phases"].as_array().unwrap();
        assert!(phases
            .iter()
            .any(|p| p["phase_name"] == "impact" && p["kill_chain_name"] == "mitre-attack"));
    }

    #[test]
    fn bundle_wraps_all_indicators() {
        let iocs = vec![sample_ioc("203.0.113.7"), sample_ioc("2001:db8::1")];
        let bundle = create_bundle(&iocs);

        assert_eq!(bundle["type"], "bundle");
        assert!(bundle["id"].as_str().unwrap().starts_with("bundle--"));
        assert_eq!(bundle["objects"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn attack_pattern_names_are_joined_and_deduplicated() {
        let categories: Vec<Category> = [4u32, 5, 18, 22].map(Category::from).to_vec();
        let name = attack_pattern_name(&categories).unwrap();
        assert!(name.contains("DDoS"));
        assert!(name.contains("Brute Force"));
        assert_eq!(name.matches("Brute Force").count(), 1);

        assert!(attack_pattern_name(&[Category::Code(99)]).is_none());
    }
}
