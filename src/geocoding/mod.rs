pub mod amap;
pub mod enricher;

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::Coordinate;

/// Where a keyword search is allowed to look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CityScope {
    City(String),
    Nationwide,
}

impl CityScope {
    pub fn from_optional(city: Option<&str>) -> Self {
        match city.map(str::trim) {
            Some(c) if !c.is_empty() => CityScope::City(c.to_string()),
            _ => CityScope::Nationwide,
        }
    }
}

/// Place-resolution backend. Both lookups count against the vendor's rate
/// limit, so callers must not issue them concurrently.
///
/// `Ok(None)` means the service answered but found nothing.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn is_ready(&self) -> bool;

    async fn search_by_keyword(
        &self,
        keyword: &str,
        scope: &CityScope,
    ) -> Result<Option<Coordinate>, AppError>;

    async fn search_by_address(&self, address: &str) -> Result<Option<Coordinate>, AppError>;
}
