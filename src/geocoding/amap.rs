use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{CityScope, Geocoder};
use crate::errors::AppError;
use crate::models::Coordinate;

pub const DEFAULT_AMAP_BASE_URL: &str = "https://restapi.amap.com";

/// City parameter AMap understands as "search the whole country".
const NATIONWIDE: &str = "全国";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct PlaceTextResponse {
    status: String,
    #[serde(default)]
    info: String,
    #[serde(default)]
    pois: Vec<Located>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    info: String,
    #[serde(default)]
    geocodes: Vec<Located>,
}

/// AMap sends `location` as `"lng,lat"`, or `[]` when it has none.
#[derive(Debug, Deserialize)]
struct Located {
    #[serde(default)]
    location: Value,
}

impl Located {
    fn coordinate(&self) -> Option<Coordinate> {
        parse_location(self.location.as_str()?)
    }
}

fn parse_location(raw: &str) -> Option<Coordinate> {
    let (lng, lat) = raw.split_once(',')?;
    let lng: f64 = lng.trim().parse().ok()?;
    let lat: f64 = lat.trim().parse().ok()?;
    Some(Coordinate::new(lat, lng))
}

/// Maps an AMap envelope to "first hit" semantics; a non-OK envelope is an error.
fn first_hit(status: &str, info: &str, hits: &[Located]) -> Result<Option<Coordinate>, AppError> {
    if status != "1" || info != "OK" {
        return Err(AppError::GeocodingRejected { info: info.to_string() });
    }
    Ok(hits.first().and_then(Located::coordinate))
}

/// AMap web-service client (place text search + geocoding).
#[derive(Clone)]
pub struct AmapGeocoder {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AmapGeocoder {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, AppError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    fn key(&self) -> Result<&str, AppError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| AppError::GeocodingRejected { info: "AMAP_API_KEY is not configured".into() })
    }
}

#[async_trait]
impl Geocoder for AmapGeocoder {
    async fn is_ready(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search_by_keyword(
        &self,
        keyword: &str,
        scope: &CityScope,
    ) -> Result<Option<Coordinate>, AppError> {
        let city = match scope {
            CityScope::City(c) => c.as_str(),
            CityScope::Nationwide => NATIONWIDE,
        };
        let url = format!("{}/v3/place/text", self.base_url);
        let body: PlaceTextResponse = self
            .client
            .get(&url)
            .query(&[
                ("key", self.key()?),
                ("keywords", keyword),
                ("city", city),
                ("offset", "1"),
                ("page", "1"),
                ("extensions", "base"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("AMap place search '{keyword}' in {city}: status={} hits={}", body.status, body.pois.len());
        first_hit(&body.status, &body.info, &body.pois)
    }

    async fn search_by_address(&self, address: &str) -> Result<Option<Coordinate>, AppError> {
        let url = format!("{}/v3/geocode/geo", self.base_url);
        let body: GeocodeResponse = self
            .client
            .get(&url)
            .query(&[("key", self.key()?), ("address", address)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("AMap geocode '{address}': status={} hits={}", body.status, body.geocodes.len());
        first_hit(&body.status, &body.info, &body.geocodes)
    }
}
