use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GeocodingConfig;
use crate::error::{Result, ResultExt as _};
use crate::metadata::Coordinates;
use crate::util::with_retry;

/// Reverse geocoding against a Nominatim-compatible endpoint.
///
/// Results are cached by rounded coordinates so photos taken at the same spot
/// only cost one external call. Failures are never cached and never escalate:
/// the caller just gets no address.
pub struct ReverseGeocoder {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    precision: usize,
    cache: Mutex<AddressCache>,
}

/// Insertion-ordered map holding at most `capacity` addresses.
struct AddressCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl AddressCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, entries: HashMap::new(), order: VecDeque::new() }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, address: String) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key.clone(), address).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Deserialize)]
struct NominatimReply {
    display_name: Option<String>,
}

impl ReverseGeocoder {
    pub fn new(cfg: &GeocodingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .ctx_config("build geocoding client")?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            precision: cfg.cache_precision,
            cache: Mutex::new(AddressCache::new(cfg.cache_capacity)),
        })
    }

    pub fn cache_key(&self, c: Coordinates) -> String {
        format!("{:.*},{:.*}", self.precision, c.latitude, self.precision, c.longitude)
    }

    pub async fn reverse(&self, c: Coordinates) -> Option<String> {
        let key = self.cache_key(c);
        if let Some(hit) = self.cached(&key) {
            debug!(%key, "geocode cache hit");
            return Some(hit);
        }

        let (lat, lon) = (c.latitude.to_string(), c.longitude.to_string());
        let (lat, lon) = (lat.as_str(), lon.as_str());
        let (client, endpoint) = (&self.client, self.endpoint.as_str());
        let res = with_retry("geocode", self.timeout, 0, || async move {
            let reply: NominatimReply = client
                .get(endpoint)
                .query(&[("format", "json"), ("lat", lat), ("lon", lon)])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<_, reqwest::Error>(reply.display_name)
        })
        .await;

        match res {
            Ok(Some(address)) => {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(key, address.clone());
                }
                Some(address)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "reverse geocoding unavailable");
                None
            }
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.lock().ok()?.get(key)
    }
}
