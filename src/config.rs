// ⚙️ Run configuration - validated once at startup
//
// Every setting comes from the environment (a .env file is loaded by the
// binaries). Missing credentials do not fail the load: they switch the
// dependent adapter to AdapterStatus::Disabled so the rest of the run proceeds.

use crate::error::ConfigError;
use chrono::NaiveDate;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_DB_PATH: &str = "crime_weather.db";
pub const DEFAULT_TARGET_MONTH: &str = "2023-09";
pub const DEFAULT_BUDGET: usize = 25;
pub const DEFAULT_TARGET: usize = 100;

pub const POLICE_API_BASE: &str = "https://data.police.uk/api";
pub const POSITIONSTACK_BASE: &str = "http://api.positionstack.com/v1";
pub const OPEN_METEO_BASE: &str = "https://archive-api.open-meteo.com/v1";
pub const TFL_API_BASE: &str = "https://api.tfl.gov.uk";

// ============================================================================
// CREDENTIALS
// ============================================================================

/// API secret; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Credential(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Whether a source adapter may run this invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    Enabled,
    Disabled { reason: String },
}

impl AdapterStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, AdapterStatus::Enabled)
    }

    fn requires(setting: &Option<Credential>, key: &str) -> Self {
        match setting {
            Some(_) => AdapterStatus::Enabled,
            None => AdapterStatus::Disabled {
                reason: format!("{} is not set", key),
            },
        }
    }
}

// ============================================================================
// CRIME AREA
// ============================================================================

/// Area queried on the street-level crime feed
#[derive(Debug, Clone, PartialEq)]
pub enum CrimeArea {
    /// Closed polygon of (lat, lon) vertices
    Polygon(Vec<(f64, f64)>),

    /// Single point (the feed applies its own 1 mile radius)
    Point { lat: f64, lon: f64 },
}

impl CrimeArea {
    /// Mean of the vertices; used to place the default location
    pub fn centre(&self) -> (f64, f64) {
        match self {
            CrimeArea::Point { lat, lon } => (*lat, *lon),
            CrimeArea::Polygon(points) => {
                let n = points.len().max(1) as f64;
                let lat = points.iter().map(|p| p.0).sum::<f64>() / n;
                let lon = points.iter().map(|p| p.1).sum::<f64>() / n;
                (lat, lon)
            }
        }
    }

    /// Query parameters understood by the crime feed
    pub fn query_params(&self) -> Vec<(String, String)> {
        match self {
            CrimeArea::Point { lat, lon } => vec![
                ("lat".to_string(), lat.to_string()),
                ("lng".to_string(), lon.to_string()),
            ],
            CrimeArea::Polygon(points) => {
                let poly = points
                    .iter()
                    .map(|(lat, lon)| format!("{},{}", lat, lon))
                    .collect::<Vec<_>>()
                    .join(":");
                vec![("poly".to_string(), poly)]
            }
        }
    }
}

impl FromStr for CrimeArea {
    type Err = ConfigError;

    /// "lat,lon" for a point, "lat,lon:lat,lon:..." (3+ vertices) for a polygon
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut points = Vec::new();
        for pair in s.split(':').map(str::trim).filter(|p| !p.is_empty()) {
            let (lat, lon) = pair
                .split_once(',')
                .ok_or_else(|| ConfigError::invalid("CRIME_POLYGON", s, "expected lat,lon pairs"))?;
            let lat: f64 = lat
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("CRIME_POLYGON", s, "latitude is not a number"))?;
            let lon: f64 = lon
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("CRIME_POLYGON", s, "longitude is not a number"))?;
            points.push((lat, lon));
        }

        match points.len() {
            0 => Err(ConfigError::invalid("CRIME_POLYGON", s, "no coordinates")),
            1 => Ok(CrimeArea::Point {
                lat: points[0].0,
                lon: points[0].1,
            }),
            2 => Err(ConfigError::invalid("CRIME_POLYGON", s, "a polygon needs at least 3 vertices")),
            _ => Ok(CrimeArea::Polygon(points)),
        }
    }
}

// ============================================================================
// TARGETS + HTTP SETTINGS
// ============================================================================

/// Minimum row counts the accumulation converges toward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableTargets {
    pub crimes: usize,
    pub locations: usize,
    pub weather: usize,
    pub transit_stops: usize,
}

impl Default for TableTargets {
    fn default() -> Self {
        TableTargets {
            crimes: DEFAULT_TARGET,
            locations: DEFAULT_TARGET,
            weather: DEFAULT_TARGET,
            transit_stops: DEFAULT_TARGET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    /// Per-call timeout
    pub timeout: Duration,
    /// Minimum spacing between two calls to the same source
    pub min_interval: Duration,
    /// Wait before the single retry after HTTP 429
    pub retry_wait: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            timeout: Duration::from_secs(30),
            min_interval: Duration::from_millis(1000),
            retry_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBases {
    pub police: String,
    pub positionstack: String,
    pub open_meteo: String,
    pub tfl: String,
}

impl Default for ApiBases {
    fn default() -> Self {
        ApiBases {
            police: POLICE_API_BASE.to_string(),
            positionstack: POSITIONSTACK_BASE.to_string(),
            open_meteo: OPEN_METEO_BASE.to_string(),
            tfl: TFL_API_BASE.to_string(),
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,

    /// Month queried on the crime feed ("YYYY-MM")
    pub target_month: String,

    /// Global per-run item budget, applied per source
    pub budget: usize,
    pub targets: TableTargets,

    /// Items requested from a source whose target is already met (0 = skip)
    pub refresh_batch: usize,

    /// Upper bound on crimes moved off the default location per run
    pub release_limit: usize,

    pub crime_area: CrimeArea,
    pub positionstack_key: Option<Credential>,
    pub tfl_app_id: Option<String>,
    pub tfl_app_key: Option<Credential>,
    pub http: HttpSettings,
    pub api_bases: ApiBases,

    /// Top up locations/stops with deterministic synthetic rows
    pub seed_synthetic: bool,

    /// Write analysis result sets as CSV into this directory
    pub export_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            target_month: DEFAULT_TARGET_MONTH.to_string(),
            budget: DEFAULT_BUDGET,
            targets: TableTargets::default(),
            refresh_batch: 0,
            release_limit: DEFAULT_BUDGET,
            // Central London (Westminster / Waterloo / Soho)
            crime_area: CrimeArea::Polygon(vec![
                (51.520, -0.155),
                (51.510, -0.155),
                (51.500, -0.135),
                (51.495, -0.115),
                (51.500, -0.095),
                (51.510, -0.095),
                (51.520, -0.115),
            ]),
            positionstack_key: None,
            tfl_app_id: None,
            tfl_app_key: None,
            http: HttpSettings::default(),
            api_bases: ApiBases::default(),
            seed_synthetic: false,
            export_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CRIME_DB_PATH` (default: crime_weather.db)
    /// - `TARGET_MONTH` (default: 2023-09)
    /// - `MAX_ITEMS_PER_RUN` (default: 25)
    /// - `TARGET_CRIMES` / `TARGET_LOCATIONS` / `TARGET_WEATHER` / `TARGET_TRANSIT_STOPS` (default: 100)
    /// - `REFRESH_BATCH` (default: 0 = skip sources whose target is met)
    /// - `RELEASE_LIMIT` (default: MAX_ITEMS_PER_RUN)
    /// - `POSITIONSTACK_KEY`, `TFL_APP_KEY`, `TFL_APP_ID`
    /// - `HTTP_TIMEOUT_SECS` (30), `HTTP_MIN_INTERVAL_MS` (1000), `HTTP_RETRY_WAIT_SECS` (5)
    /// - `CRIME_POLYGON` (default: central London)
    /// - `SEED_SYNTHETIC` (default: false)
    /// - `ANALYSIS_EXPORT_DIR` (default: unset)
    /// - `POLICE_API_BASE`, `POSITIONSTACK_BASE`, `OPEN_METEO_BASE`, `TFL_API_BASE`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Config::default();

        let target_month = get("TARGET_MONTH").unwrap_or(defaults.target_month);
        validate_month(&target_month)?;

        let budget = parse_or("MAX_ITEMS_PER_RUN", get("MAX_ITEMS_PER_RUN"), defaults.budget)?;
        if budget == 0 {
            return Err(ConfigError::invalid("MAX_ITEMS_PER_RUN", "0", "budget must be positive"));
        }

        let targets = TableTargets {
            crimes: parse_or("TARGET_CRIMES", get("TARGET_CRIMES"), DEFAULT_TARGET)?,
            locations: parse_or("TARGET_LOCATIONS", get("TARGET_LOCATIONS"), DEFAULT_TARGET)?,
            weather: parse_or("TARGET_WEATHER", get("TARGET_WEATHER"), DEFAULT_TARGET)?,
            transit_stops: parse_or("TARGET_TRANSIT_STOPS", get("TARGET_TRANSIT_STOPS"), DEFAULT_TARGET)?,
        };

        let crime_area = match get("CRIME_POLYGON") {
            Some(raw) => raw.parse()?,
            None => defaults.crime_area,
        };

        let http = HttpSettings {
            timeout: Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", get("HTTP_TIMEOUT_SECS"), 30)?),
            min_interval: Duration::from_millis(parse_or(
                "HTTP_MIN_INTERVAL_MS",
                get("HTTP_MIN_INTERVAL_MS"),
                1000,
            )?),
            retry_wait: Duration::from_secs(parse_or("HTTP_RETRY_WAIT_SECS", get("HTTP_RETRY_WAIT_SECS"), 5)?),
        };
        if http.timeout.is_zero() {
            return Err(ConfigError::invalid("HTTP_TIMEOUT_SECS", "0", "timeout must be positive"));
        }

        let api_bases = ApiBases {
            police: get("POLICE_API_BASE").unwrap_or(defaults.api_bases.police),
            positionstack: get("POSITIONSTACK_BASE").unwrap_or(defaults.api_bases.positionstack),
            open_meteo: get("OPEN_METEO_BASE").unwrap_or(defaults.api_bases.open_meteo),
            tfl: get("TFL_API_BASE").unwrap_or(defaults.api_bases.tfl),
        };

        Ok(Config {
            db_path: get("CRIME_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            target_month,
            budget,
            targets,
            refresh_batch: parse_or("REFRESH_BATCH", get("REFRESH_BATCH"), 0)?,
            release_limit: parse_or("RELEASE_LIMIT", get("RELEASE_LIMIT"), budget)?,
            crime_area,
            positionstack_key: get("POSITIONSTACK_KEY").map(Credential::new),
            tfl_app_id: get("TFL_APP_ID"),
            tfl_app_key: get("TFL_APP_KEY").map(Credential::new),
            http,
            api_bases,
            seed_synthetic: parse_bool("SEED_SYNTHETIC", get("SEED_SYNTHETIC"))?,
            export_dir: get("ANALYSIS_EXPORT_DIR").map(PathBuf::from),
        })
    }

    pub fn geocode_status(&self) -> AdapterStatus {
        AdapterStatus::requires(&self.positionstack_key, "POSITIONSTACK_KEY")
    }

    pub fn transit_status(&self) -> AdapterStatus {
        AdapterStatus::requires(&self.tfl_app_key, "TFL_APP_KEY")
    }

    /// Every day of the target month; the weather date range
    pub fn month_days(&self) -> Vec<NaiveDate> {
        month_days(&self.target_month).unwrap_or_default()
    }
}

// ============================================================================
// PARSING HELPERS
// ============================================================================

fn parse_or<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::invalid(key, value, "not a non-negative integer")),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_lowercase).as_deref() {
        None => Ok(false),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(ConfigError::invalid(key, other, "expected true/false")),
    }
}

fn validate_month(month: &str) -> Result<(), ConfigError> {
    crate::linkage::parse_month(month)
        .map(|_| ())
        .map_err(|_| ConfigError::invalid("TARGET_MONTH", month, "expected YYYY-MM"))
}

/// All calendar days of a "YYYY-MM" month
pub fn month_days(month: &str) -> Option<Vec<NaiveDate>> {
    let (year, m) = crate::linkage::parse_month(month).ok()?;
    let days = crate::linkage::days_in_month(year, m)?;
    (1..=days)
        .map(|d| NaiveDate::from_ymd_opt(year, m, d))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
