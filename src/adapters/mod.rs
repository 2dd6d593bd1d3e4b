// 🛰️ Source Adapters - one per upstream API
//
// Every adapter implements SourceAdapter: fetch at most `quota` normalized
// records for a source-specific context. Errors stay typed inside the adapter;
// fetch_at_boundary turns them into an empty result so one failing source
// never aborts the run.

pub mod crime;
pub mod geocode;
pub mod transit;
pub mod weather;

pub use crime::{CrimeAdapter, CrimeQuery};
pub use geocode::GeocodeAdapter;
pub use transit::{TransitAdapter, TransitVariant, TRANSIT_VARIANTS};
pub use weather::{WeatherAdapter, WeatherSlot};

use crate::config::{AdapterStatus, Config, HttpSettings};
use crate::error::FetchError;
use crate::http::{Fetcher, ReqwestClient};
use crate::rate_limit::IntervalGate;
use serde::{Deserialize, Serialize};

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Crime,
    Geocode,
    Weather,
    Transit,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Crime => "crime",
            SourceKind::Geocode => "geocode",
            SourceKind::Weather => "weather",
            SourceKind::Transit => "transit",
        }
    }
}

/// Contract shared by all upstream sources
pub trait SourceAdapter {
    /// What the caller supplies: area + month, pending crimes, weather slots...
    type Context;

    /// Normalized output, ready for insert-if-absent
    type Record;

    fn source(&self) -> SourceKind;

    /// Fetch at most `quota` records. May return fewer (or none).
    fn fetch(&mut self, quota: usize, context: &Self::Context) -> Result<Vec<Self::Record>, FetchError>;
}

/// Run an adapter with the boundary rules applied:
/// quota 0 makes no call, output is truncated to quota, errors become empty.
pub fn fetch_at_boundary<A: SourceAdapter>(adapter: &mut A, quota: usize, context: &A::Context) -> Vec<A::Record> {
    if quota == 0 {
        return Vec::new();
    }

    match adapter.fetch(quota, context) {
        Ok(mut records) => {
            records.truncate(quota);
            records
        }
        Err(e) => {
            log::warn!("⚠️  {} source failed, no records this run: {}", adapter.source().name(), e);
            Vec::new()
        }
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Adapters for one run. Credential-gated sources are None when disabled.
pub struct AdapterSet {
    pub crime: CrimeAdapter,
    pub geocode: Option<GeocodeAdapter>,
    pub weather: WeatherAdapter,
    pub transit: Option<TransitAdapter>,
}

impl AdapterSet {
    /// Production adapters over reqwest, one rate gate per source
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let crime = CrimeAdapter::new(production_fetcher(&config.http)?, &config.api_bases.police);
        let weather = WeatherAdapter::new(production_fetcher(&config.http)?, &config.api_bases.open_meteo);

        let geocode = match (config.geocode_status(), &config.positionstack_key) {
            (AdapterStatus::Enabled, Some(key)) => Some(GeocodeAdapter::new(
                production_fetcher(&config.http)?,
                &config.api_bases.positionstack,
                key.clone(),
            )),
            (status, _) => {
                log_disabled(SourceKind::Geocode, &status);
                None
            }
        };

        let transit = match (config.transit_status(), &config.tfl_app_key) {
            (AdapterStatus::Enabled, Some(key)) => Some(TransitAdapter::new(
                production_fetcher(&config.http)?,
                &config.api_bases.tfl,
                config.tfl_app_id.clone(),
                key.clone(),
            )),
            (status, _) => {
                log_disabled(SourceKind::Transit, &status);
                None
            }
        };

        Ok(AdapterSet {
            crime,
            geocode,
            weather,
            transit,
        })
    }
}

fn production_fetcher(http: &HttpSettings) -> Result<Fetcher, FetchError> {
    Ok(Fetcher::new(
        Box::new(ReqwestClient::new(http.timeout)?),
        IntervalGate::new(http.min_interval),
        http.retry_wait,
    ))
}

fn log_disabled(source: SourceKind, status: &AdapterStatus) {
    if let AdapterStatus::Disabled { reason } = status {
        log::warn!("⚠️  {} adapter disabled: {}", source.name(), reason);
    }
}
