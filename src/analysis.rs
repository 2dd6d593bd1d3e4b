// 📊 Analysis Layer - read-only result sets over the accumulated tables
//
// Crimes join weather on (location_ref, derived_date = date). Grouped outputs
// carry one row per entry of their static vocabulary, zero-filled when the
// data has none.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::adapters::transit::{stop_modes, TRANSIT_MODES, UNKNOWN_MODE};
use crate::adapters::weather::weather_vocabulary;

/// Half-width of the crime ↔ stop proximity box, in degrees
pub const PROXIMITY_DEGREES: f64 = 0.01;

pub const DEFAULT_HOTSPOT_LIMIT: usize = 10;

// ============================================================================
// RESULT ROWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherCrimeRow {
    pub weather_category: String,
    pub total_crimes: i64,
    pub days_observed: i64,
    pub avg_crimes_per_day: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryDistributionRow {
    pub weather_category: String,
    /// None on zero-fill rows
    pub crime_category: Option<String>,
    pub crime_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindBucket {
    /// Wind speed rounded to 0.1, as an integer number of tenths
    pub tenths: i64,
    pub wind_speed: f64,
    pub crime_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PrecipBand {
    Dry,
    Light,
    Heavy,
}

impl PrecipBand {
    pub const ALL: [PrecipBand; 3] = [PrecipBand::Dry, PrecipBand::Light, PrecipBand::Heavy];

    pub fn label(&self) -> &'static str {
        match self {
            PrecipBand::Dry => "Dry",
            PrecipBand::Light => "Light Rain",
            PrecipBand::Heavy => "Heavy Rain",
        }
    }

    /// dry ≤ 0 mm < light ≤ 2 mm < heavy
    pub fn classify(precip_mm: f64) -> Self {
        if precip_mm <= 0.0 {
            PrecipBand::Dry
        } else if precip_mm <= 2.0 {
            PrecipBand::Light
        } else {
            PrecipBand::Heavy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecipRow {
    pub band: String,
    pub crime_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperaturePoint {
    pub location_ref: i64,
    pub date: String,
    pub temp_c: f64,
    pub crime_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopCrimeCount {
    pub external_stop_id: String,
    pub name: Option<String>,
    pub stop_type: Option<String>,
    /// Resolved modes, comma separated
    pub modes: String,
    pub crime_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeCrimeRow {
    pub mode: String,
    /// Nearby crimes, split evenly across each stop's modes
    pub crime_count: f64,
    pub stop_count: i64,
    pub avg_crimes_per_stop: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub crimes_by_weather: Vec<WeatherCrimeRow>,
    pub category_distribution: Vec<CategoryDistributionRow>,
    pub wind: Vec<WindBucket>,
    pub precipitation: Vec<PrecipRow>,
    pub temperature: Vec<TemperaturePoint>,
    pub transit_modes: Vec<ModeCrimeRow>,
    pub hotspots: Vec<StopCrimeCount>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// CRIME × WEATHER
// ============================================================================

/// Crimes per weather category, normalized by the number of distinct days
/// that category was observed.
pub fn crimes_by_weather(conn: &Connection) -> Result<Vec<WeatherCrimeRow>> {
    let mut stmt = conn.prepare(
        "SELECT W.weather_category, COUNT(C.id), COUNT(DISTINCT W.date)
         FROM WeatherData W
         LEFT JOIN CrimeData C ON C.location_ref = W.location_ref AND C.derived_date = W.date
         GROUP BY W.weather_category",
    )?;

    let observed: HashMap<String, (i64, i64)> = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?))))?
        .collect::<Result<HashMap<_, _>, _>>()?;

    let mut categories: Vec<String> = weather_vocabulary().into_iter().map(str::to_string).collect();
    let mut extra: Vec<String> = observed.keys().filter(|k| !categories.contains(*k)).cloned().collect();
    extra.sort();
    categories.extend(extra);

    let mut rows: Vec<WeatherCrimeRow> = categories
        .into_iter()
        .map(|category| {
            let (total, days) = observed.get(&category).copied().unwrap_or((0, 0));
            WeatherCrimeRow {
                avg_crimes_per_day: if days == 0 { 0.0 } else { total as f64 / days as f64 },
                weather_category: category,
                total_crimes: total,
                days_observed: days,
            }
        })
        .collect();

    // Stable: ties keep vocabulary order
    rows.sort_by(|a, b| b.avg_crimes_per_day.total_cmp(&a.avg_crimes_per_day));
    Ok(rows)
}

/// Crime categories under each weather category
pub fn category_distribution(conn: &Connection) -> Result<Vec<CategoryDistributionRow>> {
    let mut stmt = conn.prepare(
        "SELECT W.weather_category, C.category, COUNT(C.id) AS crime_count
         FROM CrimeData C
         JOIN WeatherData W ON C.location_ref = W.location_ref AND C.derived_date = W.date
         GROUP BY W.weather_category, C.category
         ORDER BY W.weather_category, crime_count DESC, C.category",
    )?;

    let mut rows = stmt
        .query_map([], |row| {
            Ok(CategoryDistributionRow {
                weather_category: row.get(0)?,
                crime_category: row.get(1)?,
                crime_count: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for category in weather_vocabulary() {
        if !rows.iter().any(|r| r.weather_category == category) {
            rows.push(CategoryDistributionRow {
                weather_category: category.to_string(),
                crime_category: None,
                crime_count: 0,
            });
        }
    }

    Ok(rows)
}

/// Crimes by matched wind speed rounded to 0.1. Null wind is excluded.
pub fn wind_buckets(conn: &Connection) -> Result<Vec<WindBucket>> {
    let mut stmt = conn.prepare(
        "SELECT CAST(ROUND(W.wind_speed * 10) AS INTEGER) AS tenths, COUNT(C.id)
         FROM CrimeData C
         JOIN WeatherData W ON C.location_ref = W.location_ref AND C.derived_date = W.date
         WHERE W.wind_speed IS NOT NULL
         GROUP BY tenths
         ORDER BY tenths",
    )?;

    let buckets = stmt
        .query_map([], |row| {
            let tenths: i64 = row.get(0)?;
            Ok(WindBucket {
                tenths,
                wind_speed: tenths as f64 / 10.0,
                crime_count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(buckets)
}

/// Crimes per precipitation band; always three rows (Dry, Light, Heavy)
pub fn precipitation_bands(conn: &Connection) -> Result<Vec<PrecipRow>> {
    let mut stmt = conn.prepare(
        "SELECT W.precip_mm
         FROM CrimeData C
         JOIN WeatherData W ON C.location_ref = W.location_ref AND C.derived_date = W.date
         WHERE W.precip_mm IS NOT NULL",
    )?;

    let mut counts: HashMap<PrecipBand, i64> = HashMap::new();
    for precip in stmt.query_map([], |row| row.get::<_, f64>(0))? {
        *counts.entry(PrecipBand::classify(precip?)).or_insert(0) += 1;
    }

    Ok(PrecipBand::ALL
        .iter()
        .map(|band| PrecipRow {
            band: band.label().to_string(),
            crime_count: counts.get(band).copied().unwrap_or(0),
        })
        .collect())
}

/// One point per weather row with a temperature, with the crimes on that day
pub fn temperature_series(conn: &Connection) -> Result<Vec<TemperaturePoint>> {
    let mut stmt = conn.prepare(
        "SELECT W.location_ref, W.date, W.temp_c, COUNT(C.id)
         FROM WeatherData W
         LEFT JOIN CrimeData C ON C.location_ref = W.location_ref AND C.derived_date = W.date
         WHERE W.temp_c IS NOT NULL
         GROUP BY W.location_ref, W.date, W.temp_c
         ORDER BY W.date, W.location_ref",
    )?;

    let points = stmt
        .query_map([], |row| {
            Ok(TemperaturePoint {
                location_ref: row.get(0)?,
                date: row.get(1)?,
                temp_c: row.get(2)?,
                crime_count: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(points)
}

// ============================================================================
// CRIME × TRANSIT
// ============================================================================

/// Nearby-crime count for every stop (bounding box, ±PROXIMITY_DEGREES)
pub fn stop_crime_counts(conn: &Connection) -> Result<Vec<StopCrimeCount>> {
    let mut stmt = conn.prepare(
        "SELECT T.external_stop_id, T.name, T.stop_type, T.modes, COUNT(C.id) AS crime_count
         FROM TransitStops T
         LEFT JOIN CrimeData C
           ON C.lat IS NOT NULL AND C.lon IS NOT NULL
          AND ABS(C.lat - T.lat) <= ?1
          AND ABS(C.lon - T.lon) <= ?1
         GROUP BY T.id
         ORDER BY crime_count DESC, T.name IS NULL, T.name, T.external_stop_id",
    )?;

    let stops = stmt
        .query_map([PROXIMITY_DEGREES], |row| {
            let modes: Option<String> = row.get(3)?;
            let stop_type: Option<String> = row.get(2)?;
            Ok(StopCrimeCount {
                external_stop_id: row.get(0)?,
                name: row.get(1)?,
                modes: stop_modes(modes.as_deref(), stop_type.as_deref()).join(","),
                stop_type,
                crime_count: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stops)
}

/// Nearby crimes per transit mode. A stop serving n modes adds count/n to
/// each, so multi-mode stops are not double counted.
pub fn crimes_near_transit(conn: &Connection) -> Result<Vec<ModeCrimeRow>> {
    let mut totals: HashMap<String, (f64, i64)> = TRANSIT_MODES
        .iter()
        .map(|mode| (mode.to_string(), (0.0, 0)))
        .collect();

    for stop in stop_crime_counts(conn)? {
        let modes: Vec<&str> = stop.modes.split(',').collect();
        let share = stop.crime_count as f64 / modes.len() as f64;
        for mode in modes {
            let entry = totals.entry(mode.to_string()).or_insert((0.0, 0));
            entry.0 += share;
            entry.1 += 1;
        }
    }

    let mut rows: Vec<ModeCrimeRow> = totals
        .into_iter()
        .filter(|(mode, (_, stops))| mode != UNKNOWN_MODE || *stops > 0)
        .map(|(mode, (crimes, stops))| ModeCrimeRow {
            mode,
            crime_count: round2(crimes),
            stop_count: stops,
            avg_crimes_per_stop: if stops == 0 { 0.0 } else { round2(crimes / stops as f64) },
        })
        .collect();

    rows.sort_by(|a, b| {
        b.crime_count
            .total_cmp(&a.crime_count)
            .then_with(|| a.mode.cmp(&b.mode))
    });
    Ok(rows)
}

/// Top `limit` stops by nearby crimes, ties by name
pub fn transit_hotspots(conn: &Connection, limit: usize) -> Result<Vec<StopCrimeCount>> {
    let mut stops = stop_crime_counts(conn)?;
    stops.truncate(limit);
    Ok(stops)
}

// ============================================================================
// FULL REPORT + EXPORT
// ============================================================================

pub fn run_analysis(conn: &Connection) -> Result<AnalysisReport> {
    let report = AnalysisReport {
        crimes_by_weather: crimes_by_weather(conn).context("crimes by weather")?,
        category_distribution: category_distribution(conn).context("category distribution")?,
        wind: wind_buckets(conn).context("wind buckets")?,
        precipitation: precipitation_bands(conn).context("precipitation bands")?,
        temperature: temperature_series(conn).context("temperature series")?,
        transit_modes: crimes_near_transit(conn).context("crimes near transit")?,
        hotspots: transit_hotspots(conn, DEFAULT_HOTSPOT_LIMIT).context("transit hotspots")?,
    };

    log::info!(
        "📊 Analysis: {} weather categories, {} wind buckets, {} temperature points, {} transit modes",
        report.crimes_by_weather.len(),
        report.wind.len(),
        report.temperature.len(),
        report.transit_modes.len()
    );

    Ok(report)
}

fn write_csv<T: Serialize>(dir: &Path, name: &str, rows: &[T]) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut writer = csv::Writer::from_path(&path).with_context(|| format!("Failed to create {}", path.display()))?;

    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(path)
}

/// Write every result set as `<name>.csv` into `dir`. Returns the files written.
pub fn export_csv(report: &AnalysisReport, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let files = vec![
        write_csv(dir, "crimes_by_weather.csv", &report.crimes_by_weather)?,
        write_csv(dir, "category_distribution.csv", &report.category_distribution)?,
        write_csv(dir, "wind_buckets.csv", &report.wind)?,
        write_csv(dir, "precipitation_bands.csv", &report.precipitation)?,
        write_csv(dir, "temperature_series.csv", &report.temperature)?,
        write_csv(dir, "crimes_near_transit.csv", &report.transit_modes)?,
        write_csv(dir, "transit_hotspots.csv", &report.hotspots)?,
    ];

    log::info!("💾 Exported {} CSV files to {}", files.len(), dir.display());
    Ok(files)
}
