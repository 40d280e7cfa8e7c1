//! Local MaxMind database resolver, first in the geolocation chain.
//!
//! A local database answers without network round trips or rate limits, so
//! it always runs before the free HTTP providers.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use maxminddb::{geoip2, MaxMindDBError, Reader};

use crate::enrichment::{GeoLookup, GeoResolveError, GeoResolver};

/// GeoIP resolver backed by a MaxMind city database.
pub struct MaxMindResolver {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MaxMindResolver {
    pub fn new(city_db_path: &Path) -> Result<Self> {
        let reader = Reader::open_readfile(city_db_path)
            .context("Failed to open GeoIP city database")?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }
}

#[async_trait]
impl GeoResolver for MaxMindResolver {
    fn name(&self) -> &'static str {
        "maxmind"
    }

    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoLookup>, GeoResolveError> {
        let city = match self.reader.lookup::<geoip2::City>(ip) {
            Ok(city) => city,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return Ok(None),
            Err(e) => return Err(GeoResolveError::Unavailable(e.to_string())),
        };

        let mut lookup = GeoLookup {
            source: "maxmind",
            ..GeoLookup::default()
        };

        if let Some(country) = city.country {
            lookup.country_code = country.iso_code.map(str::to_string);
            lookup.country_name = country
                .names
                .and_then(|n| n.get("en").map(|s| s.to_string()));
        }

        if let Some(city_data) = city.city {
            lookup.city = city_data
                .names
                .and_then(|n| n.get("en").map(|s| s.to_string()));
        }

        if let Some(subdivisions) = city.subdivisions {
            if let Some(region) = subdivisions.first() {
                lookup.region = region
                    .names
                    .as_ref()
                    .and_then(|n| n.get("en").map(|s| s.to_string()));
            }
        }

        if let Some(continent) = city.continent {
            lookup.continent = continent
                .names
                .and_then(|n| n.get("en").map(|s| s.to_string()))
                .or_else(|| continent.code.map(str::to_string));
        }

        if let Some(location) = city.location {
            lookup.latitude = location.latitude;
            lookup.longitude = location.longitude;
            lookup.timezone = location.time_zone.map(str::to_string);
        }

        // City databases carry no ISP data; a later resolver may fill it in.
        if lookup.country_code.is_none() && lookup.city.is_none() {
            return Ok(None);
        }

        Ok(Some(lookup))
    }
}
