// 🌦️ Weather Adapter - historical daily summaries
//
// GET {base}/archive?latitude&longitude&start_date=D&end_date=D&daily=..&timezone=UTC
//
// One call per (location, date) slot. The engine plans the slots; the adapter
// only fetches and normalizes them.

use super::{SourceAdapter, SourceKind};
use crate::db::{location_points, WeatherRecord};
use crate::error::FetchError;
use crate::http::{Fetcher, HttpRequest};
use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashSet;

const DAILY_FIELDS: &str = "temperature_2m_max,temperature_2m_min,windspeed_10m_max,precipitation_sum,weathercode,relative_humidity_2m_mean";

pub const UNKNOWN_WEATHER: &str = "Unknown";

// ============================================================================
// WEATHER CODE TABLE (WMO)
// ============================================================================

pub const WEATHER_CODES: &[(i64, &str)] = &[
    (0, "Clear"),
    (1, "Mainly Clear"),
    (2, "Partly Cloudy"),
    (3, "Overcast"),
    (45, "Fog"),
    (48, "Fog"),
    (51, "Light Drizzle"),
    (53, "Drizzle"),
    (55, "Heavy Drizzle"),
    (56, "Freezing Drizzle"),
    (57, "Freezing Drizzle"),
    (61, "Light Rain"),
    (63, "Rain"),
    (65, "Heavy Rain"),
    (66, "Freezing Rain"),
    (67, "Freezing Rain"),
    (71, "Light Snow"),
    (73, "Snow"),
    (75, "Heavy Snow"),
    (77, "Snow Grains"),
    (80, "Rain Showers"),
    (81, "Rain Showers"),
    (82, "Heavy Rain Showers"),
    (85, "Snow Showers"),
    (86, "Heavy Snow Showers"),
    (95, "Thunderstorm"),
    (96, "Thunderstorm"),
    (99, "Thunderstorm"),
];

pub fn weather_category(code: Option<i64>) -> &'static str {
    code.and_then(|c| WEATHER_CODES.iter().find(|(k, _)| *k == c))
        .map(|(_, name)| *name)
        .unwrap_or(UNKNOWN_WEATHER)
}

/// Every category the table can produce, plus Unknown, in table order
pub fn weather_vocabulary() -> Vec<&'static str> {
    let mut vocab: Vec<&'static str> = Vec::new();
    for (_, name) in WEATHER_CODES {
        if !vocab.contains(name) {
            vocab.push(*name);
        }
    }
    vocab.push(UNKNOWN_WEATHER);
    vocab
}

// ============================================================================
// SLOT PLANNING
// ============================================================================

/// Cursor holding the last planned slot as "location_ref|date"
pub const WEATHER_CURSOR: &str = "weather";

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherSlot {
    pub location_ref: i64,
    pub lat: f64,
    pub lon: f64,
    pub date: NaiveDate,
}

impl WeatherSlot {
    fn key(&self) -> (i64, NaiveDate) {
        (self.location_ref, self.date)
    }

    pub fn cursor_value(&self) -> String {
        format!("{}|{}", self.location_ref, self.date.format("%Y-%m-%d"))
    }
}

fn parse_cursor(value: &str) -> Option<(i64, NaiveDate)> {
    let (location_ref, date) = value.split_once('|')?;
    let location_ref = location_ref.parse().ok()?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some((location_ref, date))
}

/// Up to `limit` (location, date) pairs with no weather row yet.
///
/// Candidate order: pairs that crimes already point at, then every known
/// location across `days`, location by location. Planning starts right after
/// the `after` cursor and wraps around, so slots the archive never answers
/// rotate out of the head instead of taking the whole quota every run.
pub fn plan_weather_slots(
    conn: &Connection,
    days: &[NaiveDate],
    limit: usize,
    after: Option<&str>,
) -> Result<Vec<WeatherSlot>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let candidates = weather_candidates(conn, days)?;
    if candidates.is_empty() {
        return Ok(candidates);
    }

    // A cursor whose slot got filled resumes at the next larger key
    let start = match after.and_then(parse_cursor) {
        Some(key) => candidates
            .iter()
            .position(|s| s.key() == key)
            .map(|i| i + 1)
            .or_else(|| candidates.iter().position(|s| s.key() > key))
            .unwrap_or(0),
        None => 0,
    };

    let take = limit.min(candidates.len());
    Ok(candidates
        .iter()
        .cycle()
        .skip(start % candidates.len())
        .take(take)
        .cloned()
        .collect())
}

fn weather_candidates(conn: &Connection, days: &[NaiveDate]) -> Result<Vec<WeatherSlot>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.location_ref, l.lat, l.lon, c.derived_date
         FROM CrimeData c
         JOIN LocationData l ON l.id = c.location_ref
         LEFT JOIN WeatherData w ON w.location_ref = c.location_ref AND w.date = c.derived_date
         WHERE w.id IS NULL
           AND c.derived_date IS NOT NULL
           AND l.lat IS NOT NULL AND l.lon IS NOT NULL
         ORDER BY c.location_ref, c.derived_date",
    )?;

    let referenced = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut slots = Vec::new();
    let mut planned: HashSet<(i64, NaiveDate)> = HashSet::new();

    for (location_ref, lat, lon, date) in referenced {
        match NaiveDate::parse_from_str(&date, "%Y-%m-%d") {
            Ok(date) => {
                planned.insert((location_ref, date));
                slots.push(WeatherSlot { location_ref, lat, lon, date });
            }
            Err(_) => log::debug!("skipping unparsable derived_date '{}'", date),
        }
    }

    let existing = existing_weather_keys(conn)?;

    for point in location_points(conn)? {
        for &date in days {
            let key = (point.id, date);
            if planned.contains(&key) || existing.contains(&key) {
                continue;
            }
            planned.insert(key);
            slots.push(WeatherSlot {
                location_ref: point.id,
                lat: point.lat,
                lon: point.lon,
                date,
            });
        }
    }

    Ok(slots)
}

fn existing_weather_keys(conn: &Connection) -> Result<HashSet<(i64, NaiveDate)>> {
    let mut stmt = conn.prepare("SELECT location_ref, date FROM WeatherData")?;
    let keys = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter_map(|(id, date)| {
            NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .ok()
                .map(|d| (id, d))
        })
        .collect();

    Ok(keys)
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct WeatherAdapter {
    fetcher: Fetcher,
    base_url: String,
}

impl WeatherAdapter {
    pub fn new(fetcher: Fetcher, base_url: &str) -> Self {
        WeatherAdapter {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, slot: &WeatherSlot) -> HttpRequest {
        let date = slot.date.format("%Y-%m-%d").to_string();
        HttpRequest::get(format!("{}/archive", self.base_url))
            .param("latitude", slot.lat)
            .param("longitude", slot.lon)
            .param("start_date", &date)
            .param("end_date", &date)
            .param("daily", DAILY_FIELDS)
            .param("timezone", "UTC")
    }
}

impl SourceAdapter for WeatherAdapter {
    type Context = Vec<WeatherSlot>;
    type Record = WeatherRecord;

    fn source(&self) -> SourceKind {
        SourceKind::Weather
    }

    fn fetch(&mut self, quota: usize, slots: &Vec<WeatherSlot>) -> Result<Vec<WeatherRecord>, FetchError> {
        let mut records = Vec::new();

        for slot in slots.iter().take(quota) {
            match self.fetcher.get_json(&self.request(slot)) {
                Ok(payload) => match normalize_daily(&payload, slot) {
                    Some(record) => records.push(record),
                    None => log::debug!("no daily data for location {} on {}", slot.location_ref, slot.date),
                },
                Err(e) if e.is_transient() => {
                    log::warn!("⚠️  Weather fetch stopped after {} rows: {}", records.len(), e);
                    break;
                }
                Err(e) => log::debug!("weather slot {} {} rejected: {}", slot.location_ref, slot.date, e),
            }
        }

        log::info!("🌦️  Fetched {} daily weather rows", records.len());
        Ok(records)
    }
}

fn first_daily(daily: &Value, key: &str) -> Option<f64> {
    daily.get(key)?.as_array()?.first()?.as_f64()
}

/// `daily.{field}[0]` → WeatherRecord. None when the payload has no daily block.
pub fn normalize_daily(payload: &Value, slot: &WeatherSlot) -> Option<WeatherRecord> {
    let daily = payload.get("daily").filter(|d| d.is_object())?;

    let temp_max = first_daily(daily, "temperature_2m_max");
    let temp_min = first_daily(daily, "temperature_2m_min");
    let temp_c = match (temp_max, temp_min) {
        (Some(max), Some(min)) => Some((max + min) / 2.0),
        (max, min) => max.or(min),
    };
    let code = first_daily(daily, "weathercode").map(|c| c.round() as i64);

    Some(WeatherRecord {
        location_ref: slot.location_ref,
        date: slot.date.format("%Y-%m-%d").to_string(),
        temp_c,
        temp_min_c: temp_min,
        temp_max_c: temp_max,
        precip_mm: first_daily(daily, "precipitation_sum"),
        wind_speed: first_daily(daily, "windspeed_10m_max"),
        humidity: first_daily(daily, "relative_humidity_2m_mean"),
        weather_category: weather_category(code).to_string(),
    })
}
