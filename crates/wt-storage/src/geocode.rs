//! Affiliation geocoding: memoized per normalized key, single-flight, and rate limited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};
use wt_core::Coordinates;

use crate::{FetchError, HttpFetcher, MinIntervalGate, RequestSpec};

/// Shorter keys are noise ("UK", "-") and never reach the geocoder.
pub const MIN_AFFILIATION_LEN: usize = 3;

/// Acceptable-use spacing for the public geocoder.
pub const DEFAULT_GEOCODE_INTERVAL: Duration = Duration::from_millis(1100);

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("no geocoding result for {0:?}")]
    Miss(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Coordinates, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// Forward geocoder speaking the Nominatim search API.
///
/// The client identifier comes from the fetcher's configured user agent.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Coordinates, GeocodeError> {
        let request = RequestSpec::get(format!("{}/search", self.base_url.trim_end_matches('/')))
            .query("q", query)
            .query("format", "json")
            .query("limit", 1);
        let places: Vec<NominatimPlace> = self.http.fetch_json("geocoder", &request).await?;
        places
            .into_iter()
            .next()
            .and_then(|place| {
                let lat = place.lat.trim().parse().ok()?;
                let lng = place.lon.trim().parse().ok()?;
                Coordinates::new(lat, lng)
            })
            .ok_or_else(|| GeocodeError::Miss(query.to_string()))
    }
}

pub fn normalize_affiliation(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

type Slot = Arc<OnceCell<Option<Coordinates>>>;

/// Memoizing resolver shared by every adapter for the life of the process.
///
/// Each key is resolved at most once; negative results are cached too.
pub struct GeocodeCache {
    geocoder: Arc<dyn Geocoder>,
    gate: MinIntervalGate,
    entries: Mutex<HashMap<String, Slot>>,
    lookups: AtomicUsize,
}

impl GeocodeCache {
    pub fn new(geocoder: Arc<dyn Geocoder>, min_interval: Duration) -> Self {
        Self {
            geocoder,
            gate: MinIntervalGate::new(min_interval),
            entries: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub async fn resolve(&self, affiliation: &str) -> Option<Coordinates> {
        let key = normalize_affiliation(affiliation);
        if key.chars().count() < MIN_AFFILIATION_LEN {
            debug!(affiliation, "affiliation too short to geocode");
            return None;
        }

        // The map lock only guards slot lookup; waiting happens on the slot.
        let slot = {
            let mut entries = self.entries.lock().await;
            entries.entry(key.clone()).or_default().clone()
        };
        *slot.get_or_init(|| self.lookup(&key)).await
    }

    /// Number of keys with a settled (positive or negative) result.
    pub async fn len(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Outbound geocoder requests issued so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    async fn lookup(&self, key: &str) -> Option<Coordinates> {
        self.gate.wait().await;
        self.lookups.fetch_add(1, Ordering::Relaxed);
        match self.geocoder.geocode(key).await {
            Ok(coords) => {
                debug!(affiliation = key, lat = coords.lat(), lng = coords.lng(), "geocoded affiliation");
                Some(coords)
            }
            Err(GeocodeError::Miss(_)) => {
                debug!(affiliation = key, "no geocoding result");
                None
            }
            Err(err) => {
                warn!(affiliation = key, error = %err, "geocoding failed; caching negative result");
                None
            }
        }
    }
}
