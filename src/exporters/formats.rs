//! Plain-format exporters: JSON, CSV, text, and Elasticsearch bulk NDJSON.

use anyhow::{Context, Result};
use serde_json::json;

use crate::models::{Category, CorrelatedIndicator};

/// JSON envelope with a total count, optionally pretty-printed.
pub fn to_json(iocs: &[CorrelatedIndicator], pretty: bool) -> Result<String> {
    let envelope = json!({
        "total": iocs.len(),
        "indicators": iocs,
    });

    if pretty {
        serde_json::to_string_pretty(&envelope).context("Failed to encode JSON export")
    } else {
        serde_json::to_string(&envelope).context("Failed to encode JSON export")
    }
}

const CSV_HEADER: &str =
    "ip_address,confidence,local_confidence,external_confidence,reported_at,country_code,isp,labels,categories";

/// CSV with a fixed column set.
pub fn to_csv(iocs: &[CorrelatedIndicator]) -> String {
    if iocs.is_empty() {
        return String::new();
    }

    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for ioc in iocs {
        let country_code = ioc
            .enrichment
            .geolocation
            .as_ref()
            .and_then(|geo| geo.country_code.as_deref())
            .unwrap_or("");
        let row = [
            csv_field(&ioc.ip_address),
            ioc.confidence.to_string(),
            ioc.local_confidence.to_string(),
            ioc.external_confidence
                .map(|c| c.to_string())
                .unwrap_or_default(),
            ioc.reported_at.to_rfc3339(),
            csv_field(country_code),
            csv_field(ioc.enrichment.isp.as_deref().unwrap_or("")),
            csv_field(&ioc.labels.join("|")),
            csv_field(&join_categories(&ioc.categories)),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }

    out
}

/// One IP per line; with metadata each line gets a trailing comment.
pub fn to_txt(iocs: &[CorrelatedIndicator], include_metadata: bool) -> String {
    let lines: Vec<String> = iocs
        .iter()
        .map(|ioc| {
            if include_metadata {
                let mut line = format!("{} # Confidence: {}%", ioc.ip_address, ioc.confidence);
                if let Some(country) = ioc
                    .enrichment
                    .geolocation
                    .as_ref()
                    .and_then(|geo| geo.country_code.as_deref())
                {
                    line.push_str(&format!(" Country: {country}"));
                }
                line
            } else {
                ioc.ip_address.clone()
            }
        })
        .collect();

    lines.join("\n")
}

/// Elasticsearch `_bulk` NDJSON, one action line and one document per IOC.
pub fn to_elastic_bulk(iocs: &[CorrelatedIndicator], index_name: &str) -> Result<String> {
    let mut lines = Vec::with_capacity(iocs.len() * 2);

    for ioc in iocs {
        let meta = json!({
            "index": {"_index": index_name, "_id": ioc.ip_address.clone()}
        });
        let doc = json!({
            "@timestamp": ioc.reported_at,
            "ip": ioc.ip_address.clone(),
            "confidence": ioc.confidence,
            "local_confidence": ioc.local_confidence,
            "external_confidence": ioc.external_confidence,
            "tags": ioc.labels.clone(),
            "geo": {
                "country_iso_code": ioc.enrichment.geolocation.as_ref().and_then(|g| g.country_code.as_deref()),
            },
            "network": {"name": ioc.enrichment.isp.clone()},
            "threat": {
                "indicator": {
                    "ip": ioc.ip_address.clone(),
                    "confidence": ioc.confidence,
                    "type": if ioc.ip_address.contains(':') { "ipv6-addr" } else { "ipv4-addr" },
                }
            },
        });

        lines.push(serde_json::to_string(&meta).context("Failed to encode bulk action")?);
        lines.push(serde_json::to_string(&doc).context("Failed to encode bulk document")?);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

fn join_categories(categories: &[Category]) -> String {
    categories
        .iter()
        .map(|cat| match cat {
            Category::Code(code) => code.to_string(),
            Category::Text(text) => text.clone(),
            Category::Object(obj) => obj
                .id
                .or(obj.category_id)
                .map(|id| id.to_string())
                .unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
