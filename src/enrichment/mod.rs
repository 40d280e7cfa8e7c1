//! External enrichment: IP reputation and geolocation.

pub mod abuseipdb;
pub mod http_geo;
pub mod maxmind;

use std::net::IpAddr;
use std::sync::LazyLock;

use async_trait::async_trait;
use ipnetwork::Ipv6Network;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::models::GeolocationData;

/// Base delay between geolocation requests, in seconds.
const BASE_DELAY_SECS: f64 = 1.0;
/// Ceiling for the adaptive delay, in seconds.
const MAX_DELAY_SECS: f64 = 30.0;
/// Consecutive failures before the delay starts growing.
const ERROR_BACKOFF_THRESHOLD: u32 = 3;

/// IPv6 ranges that no public resolver can locate.
static NON_ROUTABLE_V6: LazyLock<[Ipv6Network; 3]> = LazyLock::new(|| {
    ["fc00::/7", "fe80::/10", "2001:db8::/32"]
        .map(|net| net.parse().expect("static network literal"))
});

/// Result of a successful geolocation lookup.
#[derive(Debug, Clone, Default)]
pub struct GeoLookup {
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub continent: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    pub timezone: Option<String>,
    pub source: &'static str,
}

impl GeoLookup {
    /// Convert into the indicator-facing geolocation record, tagging the
    /// country with a coarse threat level.
    pub fn into_geolocation(self) -> GeolocationData {
        let threat_level = self
            .country_code
            .as_deref()
            .map(|code| country_threat_level(code).to_string());

        GeolocationData {
            country_code: self.country_code,
            country_name: self.country_name,
            region: self.region,
            city: self.city,
            latitude: self.latitude,
            longitude: self.longitude,
            continent: self.continent,
            threat_level,
        }
    }
}

/// Errors a single resolver attempt can produce.
#[derive(Debug, Error)]
pub enum GeoResolveError {
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Unavailable(String),
}

/// A single geolocation source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Look up one IP. `Ok(None)` means the source has no data for it.
    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoLookup>, GeoResolveError>;
}

struct BackoffState {
    current_delay: f64,
    consecutive_errors: u32,
}

/// Geolocation service: an ordered chain of resolvers tried in sequence,
/// sharing one adaptive-delay state.
///
/// The delay shrinks on success and grows on repeated failures or rate
/// limits, so a throttled provider slows the whole chain down instead of
/// hammering the next one.
pub struct GeolocationService {
    resolvers: Vec<Box<dyn GeoResolver>>,
    backoff: Mutex<BackoffState>,
}

impl GeolocationService {
    pub fn with_resolvers(resolvers: Vec<Box<dyn GeoResolver>>) -> Self {
        Self {
            resolvers,
            backoff: Mutex::new(BackoffState {
                current_delay: BASE_DELAY_SECS,
                consecutive_errors: 0,
            }),
        }
    }

    /// Resolve geolocation for an IP, trying each resolver in order.
    ///
    /// Returns `None` for unparseable or non-routable addresses, and when
    /// every resolver fails or has no data. Never returns an error: callers
    /// treat a missing location as a normal result.
    pub async fn lookup(&self, ip_address: &str) -> Option<GeoLookup> {
        let ip: IpAddr = match ip_address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::warn!(ip = ip_address, "invalid IP address for geolocation");
                return None;
            }
        };

        if !is_routable(ip) {
            tracing::debug!(ip = ip_address, "skipping geolocation for non-routable IP");
            return None;
        }

        for resolver in &self.resolvers {
            let delay = self.backoff.lock().await.current_delay;
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;

            match resolver.resolve(ip).await {
                Ok(Some(lookup)) => {
                    tracing::info!(ip = ip_address, source = resolver.name(), "geolocation found");
                    self.record_success().await;
                    return Some(lookup);
                }
                Ok(None) => continue,
                Err(GeoResolveError::RateLimited) => {
                    let delay = self.record_rate_limit().await;
                    tracing::warn!(
                        source = resolver.name(),
                        delay_secs = delay,
                        "geolocation rate limit hit"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Err(e) => {
                    self.record_error().await;
                    tracing::warn!(source = resolver.name(), error = %e, "geolocation resolver failed");
                }
            }
        }

        tracing::warn!(ip = ip_address, "no geolocation data found");
        None
    }

    async fn record_success(&self) {
        let mut state = self.backoff.lock().await;
        state.consecutive_errors = 0;
        state.current_delay = (state.current_delay * 0.9).max(BASE_DELAY_SECS);
    }

    async fn record_error(&self) {
        let mut state = self.backoff.lock().await;
        state.consecutive_errors += 1;
        if state.consecutive_errors >= ERROR_BACKOFF_THRESHOLD {
            state.current_delay = (state.current_delay * 1.5).min(MAX_DELAY_SECS);
        }
    }

    async fn record_rate_limit(&self) -> f64 {
        let mut state = self.backoff.lock().await;
        state.consecutive_errors += 1;
        state.current_delay = (state.current_delay * 2.0).min(MAX_DELAY_SECS);
        state.current_delay
    }
}

/// Coarse per-country threat level used for display.
pub fn country_threat_level(country_code: &str) -> &'static str {
    const HIGH_RISK: [&str; 8] = ["CN", "RU", "KP", "IR", "PK", "BD", "VN", "ID"];
    const MEDIUM_RISK: [&str; 8] = ["BR", "IN", "TR", "EG", "MX", "TH", "PH", "MY"];

    if HIGH_RISK.contains(&country_code) {
        "high"
    } else if MEDIUM_RISK.contains(&country_code) {
        "medium"
    } else {
        "low"
    }
}

/// Whether a public geolocation provider could know anything about this IP.
fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || NON_ROUTABLE_V6.iter().any(|net| net.contains(v6)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_reserved_addresses_are_not_routable() {
        for ip in ["192.168.1.1", "10.0.0.1", "127.0.0.1", "203.0.113.5", "224.0.0.1", "fe80::1", "fc00::1", "::1"] {
            assert!(!is_routable(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn public_addresses_are_routable() {
        for ip in ["8.8.8.8", "1.1.1.1", "2606:4700:4700::1111"] {
            assert!(is_routable(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn country_threat_levels() {
        assert_eq!(country_threat_level("RU"), "high");
        assert_eq!(country_threat_level("BR"), "medium");
        assert_eq!(country_threat_level("NL"), "low");
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_skips_non_routable_without_touching_resolvers() {
        let mut resolver = MockGeoResolver::new();
        resolver.expect_resolve().never();
        let service = GeolocationService::with_resolvers(vec![Box::new(resolver)]);
        assert!(service.lookup("192.168.1.1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_falls_through_to_next_resolver_on_failure() {
        let mut failing = MockGeoResolver::new();
        failing.expect_name().return_const("failing");
        failing
            .expect_resolve()
            .times(1)
            .returning(|_| Err(GeoResolveError::Unavailable("down".to_string())));

        let mut working = MockGeoResolver::new();
        working.expect_name().return_const("working");
        working.expect_resolve().times(1).returning(|_| {
            Ok(Some(GeoLookup {
                country_code: Some("DE".to_string()),
                source: "working",
                ..GeoLookup::default()
            }))
        });

        let service = GeolocationService::with_resolvers(vec![Box::new(failing), Box::new(working)]);
        let lookup = service.lookup("8.8.8.8").await.expect("second resolver answers");
        assert_eq!(lookup.country_code.as_deref(), Some("DE"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_rate_limits_grow_the_delay() {
        let mut limited = MockGeoResolver::new();
        limited.expect_name().return_const("limited");
        limited
            .expect_resolve()
            .returning(|_| Err(GeoResolveError::RateLimited));

        let service = GeolocationService::with_resolvers(vec![Box::new(limited)]);
        assert!(service.lookup("8.8.8.8").await.is_none());

        let delay = service.backoff.lock().await.current_delay;
        assert!(delay > BASE_DELAY_SECS);
    }
}
