use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::agent::DEFAULT_MODEL;
use crate::geocoding::amap::DEFAULT_AMAP_BASE_URL;
use crate::geocoding::enricher::EnrichmentPolicy;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_PORT: u16 = 8080;

/// Settings read from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub amap_api_key: Option<String>,
    pub amap_base_url: String,
    pub enrichment: EnrichmentPolicy,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL")
            .ok_or_else(|| anyhow!("DATABASE_URL must be set (copy .env.example to .env)"))?;

        let defaults = EnrichmentPolicy::default();
        let enrichment = EnrichmentPolicy {
            lookup_delay: parse_or(&var, "GEOCODE_LOOKUP_DELAY_MS", defaults.lookup_delay.as_millis() as u64)
                .map(Duration::from_millis)?,
            readiness_wait: parse_or(&var, "GEOCODE_READY_WAIT_MS", defaults.readiness_wait.as_millis() as u64)
                .map(Duration::from_millis)?,
            jitter_degrees: parse_or(&var, "GEOCODE_JITTER_DEG", defaults.jitter_degrees)?,
        };
        if !enrichment.jitter_degrees.is_finite() || enrichment.jitter_degrees < 0.0 {
            return Err(anyhow!("GEOCODE_JITTER_DEG must be a non-negative number"));
        }

        Ok(Self {
            database_url,
            ollama_base_url: var("OLLAMA_API_BASE_URL").unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            ollama_model: var("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            amap_api_key: var("AMAP_API_KEY"),
            amap_base_url: var("AMAP_BASE_URL").unwrap_or_else(|| DEFAULT_AMAP_BASE_URL.to_string()),
            enrichment,
            port: parse_or(&var, "PORT", DEFAULT_PORT)?,
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid value for {key}: '{raw}'")),
        None => Ok(default),
    }
}
