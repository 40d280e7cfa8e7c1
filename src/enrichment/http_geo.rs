//! Free HTTP geolocation providers, tried after the local database.
//!
//! All three are keyless services; the chain relies on the service-level
//! adaptive delay to stay inside their informal rate limits.

use std::net::IpAddr;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::enrichment::{GeoLookup, GeoResolveError, GeoResolver};

const IP_API_URL: &str = "http://ip-api.com/json/";
const IPWHOIS_URL: &str = "http://ipwhois.app/json/";
const GEOJS_URL: &str = "https://get.geojs.io/v1/ip/geo/";

const IP_API_FIELDS: &str =
    "status,message,continent,continentCode,country,countryCode,region,regionName,city,lat,lon,timezone,isp,org";

fn status_error(status: StatusCode) -> GeoResolveError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        GeoResolveError::RateLimited
    } else {
        GeoResolveError::Unavailable(format!("unexpected status {status}"))
    }
}

/// ip-api.com resolver.
pub struct IpApiResolver {
    client: Client,
    base: Url,
}

impl IpApiResolver {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, Url::parse(IP_API_URL).expect("static url"))
    }

    pub fn with_base_url(client: Client, base: Url) -> Self {
        Self { client, base }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    continent: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    timezone: Option<String>,
    isp: Option<String>,
    org: Option<String>,
}

#[async_trait]
impl GeoResolver for IpApiResolver {
    fn name(&self) -> &'static str {
        "ip-api.com"
    }

    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoLookup>, GeoResolveError> {
        let url = self
            .base
            .join(&ip.to_string())
            .map_err(|e| GeoResolveError::Unavailable(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .query(&[("fields", IP_API_FIELDS)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let data: IpApiResponse = response.json().await?;
        if data.status != "success" {
            tracing::debug!(ip = %ip, message = ?data.message, "ip-api returned no data");
            return Ok(None);
        }

        Ok(Some(GeoLookup {
            country_code: data.country_code,
            country_name: data.country,
            region: data.region_name,
            city: data.city,
            latitude: data.lat,
            longitude: data.lon,
            continent: data.continent,
            isp: data.isp,
            org: data.org,
            timezone: data.timezone,
            source: "ip-api.com",
        }))
    }
}

/// ipwhois.app resolver.
pub struct IpWhoisResolver {
    client: Client,
    base: Url,
}

impl IpWhoisResolver {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, Url::parse(IPWHOIS_URL).expect("static url"))
    }

    pub fn with_base_url(client: Client, base: Url) -> Self {
        Self { client, base }
    }
}

#[derive(Debug, Deserialize)]
struct IpWhoisResponse {
    #[serde(default)]
    success: bool,
    country: Option<String>,
    country_code: Option<String>,
    region: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    continent: Option<String>,
    isp: Option<String>,
    org: Option<String>,
    timezone: Option<String>,
}

#[async_trait]
impl GeoResolver for IpWhoisResolver {
    fn name(&self) -> &'static str {
        "ipwhois.app"
    }

    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoLookup>, GeoResolveError> {
        let url = self
            .base
            .join(&ip.to_string())
            .map_err(|e| GeoResolveError::Unavailable(e.to_string()))?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let data: IpWhoisResponse = response.json().await?;
        if !data.success {
            return Ok(None);
        }

        Ok(Some(GeoLookup {
            country_code: data.country_code,
            country_name: data.country,
            region: data.region,
            city: data.city,
            latitude: data.latitude,
            longitude: data.longitude,
            continent: data.continent,
            isp: data.isp,
            org: data.org,
            timezone: data.timezone,
            source: "ipwhois.app",
        }))
    }
}

/// geojs.io resolver. Coordinates come back as strings.
pub struct GeoJsResolver {
    client: Client,
    base: Url,
}

impl GeoJsResolver {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, Url::parse(GEOJS_URL).expect("static url"))
    }

    pub fn with_base_url(client: Client, base: Url) -> Self {
        Self { client, base }
    }
}

#[derive(Debug, Deserialize)]
struct GeoJsResponse {
    country_code: Option<String>,
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    continent_code: Option<String>,
    timezone: Option<String>,
}

#[async_trait]
impl GeoResolver for GeoJsResolver {
    fn name(&self) -> &'static str {
        "geojs.io"
    }

    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoLookup>, GeoResolveError> {
        let url = self
            .base
            .join(&format!("{ip}.json"))
            .map_err(|e| GeoResolveError::Unavailable(e.to_string()))?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let data: GeoJsResponse = response.json().await?;
        if data.country_code.is_none() {
            return Ok(None);
        }

        Ok(Some(GeoLookup {
            country_code: data.country_code,
            country_name: data.country,
            region: data.region,
            city: data.city,
            latitude: data.latitude.and_then(|v| v.parse().ok()),
            longitude: data.longitude.and_then(|v| v.parse().ok()),
            continent: data.continent_code,
            isp: None,
            org: None,
            timezone: data.timezone,
            source: "geojs.io",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_resolver_base(server: &MockServer) -> Url {
        Url::parse(&format!("{}/", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn ip_api_parses_success_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/8.8.8.8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "continent": "North America",
                "country": "United States",
                "countryCode": "US",
                "regionName": "California",
                "city": "Mountain View",
                "lat": 37.4,
                "lon": -122.07,
                "timezone": "America/Los_Angeles",
                "isp": "Google LLC",
                "org": "Google Public DNS"
            })))
            .mount(&server)
            .await;

        let resolver = IpApiResolver::with_base_url(Client::new(), test_resolver_base(&server));
        let lookup = resolver
            .resolve("8.8.8.8".parse().unwrap())
            .await
            .unwrap()
            .expect("data");

        assert_eq!(lookup.country_code.as_deref(), Some("US"));
        assert_eq!(lookup.city.as_deref(), Some("Mountain View"));
        assert_eq!(lookup.isp.as_deref(), Some("Google LLC"));
        assert_eq!(lookup.latitude, Some(37.4));
    }

    #[tokio::test]
    async fn ip_api_failure_status_is_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "fail",
                "message": "reserved range"
            })))
            .mount(&server)
            .await;

        let resolver = IpApiResolver::with_base_url(Client::new(), test_resolver_base(&server));
        let lookup = resolver.resolve("8.8.8.8".parse().unwrap()).await.unwrap();
        assert!(lookup.is_none());
    }

    #[tokio::test]
    async fn http_429_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let resolver = IpWhoisResolver::with_base_url(Client::new(), test_resolver_base(&server));
        let err = resolver
            .resolve("8.8.8.8".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GeoResolveError::RateLimited));
    }

    #[tokio::test]
    async fn geojs_parses_string_coordinates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.1.1.1.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "country_code": "AU",
                "country": "Australia",
                "latitude": "-33.8591",
                "longitude": "151.2002",
                "continent_code": "OC",
                "timezone": "Australia/Sydney"
            })))
            .mount(&server)
            .await;

        let resolver = GeoJsResolver::with_base_url(Client::new(), test_resolver_base(&server));
        let lookup = resolver
            .resolve("1.1.1.1".parse().unwrap())
            .await
            .unwrap()
            .expect("data");

        assert_eq!(lookup.latitude, Some(-33.8591));
        assert_eq!(lookup.continent.as_deref(), Some("OC"));
    }
}
