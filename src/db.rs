use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::linkage::{date_seed, derive_date};

// ============================================================================
// TABLES
// ============================================================================

/// Every persisted table; table names never come from free-form strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Table {
    Crimes,
    Locations,
    Streets,
    Weather,
    TransitStops,
    Cursors,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Crimes => "CrimeData",
            Table::Locations => "LocationData",
            Table::Streets => "StreetData",
            Table::Weather => "WeatherData",
            Table::TransitStops => "TransitStops",
            Table::Cursors => "Cursors",
        }
    }
}

// ============================================================================
// NORMALIZED RECORDS
// ============================================================================

/// Crime as normalized by the crime adapter.
/// derived_date and location_ref are filled in storage, not by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrimeRecord {
    /// Upstream id - natural unique key
    pub external_id: String,
    pub persistent_id: Option<String>,
    /// "YYYY-MM"
    pub month: String,
    pub category: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub street_id: Option<i64>,
    pub street_name: Option<String>,
    pub outcome_category: Option<String>,
    pub outcome_date: Option<String>,
}

/// Location as produced by geocoding, the default fallback or seeding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Natural unique key
    pub label: String,
    pub city: Option<String>,
    pub county: Option<String>,
    pub region: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Daily weather summary for one (location, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub location_ref: i64,
    /// "YYYY-MM-DD"
    pub date: String,
    pub temp_c: Option<f64>,
    pub temp_min_c: Option<f64>,
    pub temp_max_c: Option<f64>,
    pub precip_mm: Option<f64>,
    pub wind_speed: Option<f64>,
    pub humidity: Option<f64>,
    pub weather_category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitStop {
    /// Natural unique key (NaPTAN id)
    pub external_stop_id: String,
    pub name: Option<String>,
    pub stop_type: Option<String>,
    pub modes: Vec<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl TransitStop {
    /// Modes as stored ("tube,bus")
    pub fn modes_csv(&self) -> String {
        self.modes.join(",")
    }
}

/// Location coordinates, enough to query weather for it
#[derive(Debug, Clone, PartialEq)]
pub struct LocationPoint {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

// ============================================================================
// SCHEMA MANAGER
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS LocationData (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            city TEXT,
            county TEXT,
            region TEXT,
            lat REAL,
            lon REAL,
            label TEXT UNIQUE NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS StreetData (
            street_id INTEGER PRIMARY KEY,
            street_name TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS CrimeData (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT UNIQUE NOT NULL,
            persistent_id TEXT,
            month TEXT NOT NULL,
            category TEXT,
            lat REAL,
            lon REAL,
            street_id INTEGER,
            outcome_category TEXT,
            outcome_date TEXT,
            derived_date TEXT,
            location_ref INTEGER REFERENCES LocationData(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS WeatherData (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            location_ref INTEGER NOT NULL REFERENCES LocationData(id),
            date TEXT NOT NULL,
            temp_c REAL,
            temp_min_c REAL,
            temp_max_c REAL,
            precip_mm REAL,
            wind_speed REAL,
            humidity REAL,
            weather_category TEXT NOT NULL,
            UNIQUE(location_ref, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS TransitStops (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_stop_id TEXT UNIQUE NOT NULL,
            name TEXT,
            stop_type TEXT,
            modes TEXT,
            lat REAL,
            lon REAL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS Cursors (
            source_name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Additive migrations (databases created before these columns existed)
    // ==========================================================================
    for (column, decl) in [
        ("persistent_id", "TEXT"),
        ("outcome_category", "TEXT"),
        ("outcome_date", "TEXT"),
        ("derived_date", "TEXT"),
        ("location_ref", "INTEGER REFERENCES LocationData(id)"),
    ] {
        if ensure_column(conn, Table::Crimes, column, decl)? {
            log::info!("🔧 Added column CrimeData.{}", column);
        }
    }

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_crime_location_date ON CrimeData(location_ref, derived_date)",
        [],
    )?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_crime_month ON CrimeData(month)", [])?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_crime_coords ON CrimeData(lat, lon)", [])?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_transit_coords ON TransitStops(lat, lon)", [])?;

    Ok(())
}

/// Add a nullable column when it is missing. Returns true if it was added.
pub fn ensure_column(conn: &Connection, table: Table, column: &str, decl: &str) -> Result<bool> {
    if has_column(conn, table, column)? {
        return Ok(false);
    }

    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table.name(), column, decl),
        [],
    )
    .with_context(|| format!("Failed to add column {}.{}", table.name(), column))?;

    Ok(true)
}

pub fn has_column(conn: &Connection, table: Table, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table.name()))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(names.iter().any(|name| name == column))
}

// ============================================================================
// INSERT-IF-ABSENT
// ============================================================================

/// Insert crimes keyed on external_id. Duplicates (within the batch or
/// already stored) are skipped silently. Returns rows actually inserted.
pub fn insert_crimes(conn: &Connection, crimes: &[CrimeRecord]) -> Result<usize> {
    let mut inserted = 0;

    for crime in crimes {
        if let (Some(street_id), Some(street_name)) = (crime.street_id, crime.street_name.as_deref()) {
            conn.execute(
                "INSERT OR IGNORE INTO StreetData (street_id, street_name) VALUES (?1, ?2)",
                params![street_id, street_name],
            )?;
        }

        let seed = date_seed(
            Some(crime.external_id.as_str()),
            &crime.month,
            crime.persistent_id.as_deref().unwrap_or(""),
        );
        let derived_date = match derive_date(&crime.month, &seed) {
            Ok(date) => Some(date.format("%Y-%m-%d").to_string()),
            Err(e) => {
                log::debug!("crime {}: no derived date ({})", crime.external_id, e);
                None
            }
        };

        inserted += conn.execute(
            "INSERT OR IGNORE INTO CrimeData (
                external_id, persistent_id, month, category, lat, lon,
                street_id, outcome_category, outcome_date, derived_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                crime.external_id,
                crime.persistent_id,
                crime.month,
                crime.category,
                crime.lat,
                crime.lon,
                crime.street_id,
                crime.outcome_category,
                crime.outcome_date,
                derived_date,
            ],
        )?;
    }

    Ok(inserted)
}

/// Get-or-create keyed on label; always returns the stable id
pub fn get_or_create_location(conn: &Connection, location: &LocationRecord) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO LocationData (city, county, region, lat, lon, label)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            location.city,
            location.county,
            location.region,
            location.lat,
            location.lon,
            location.label,
        ],
    )?;

    let id = conn
        .query_row(
            "SELECT id FROM LocationData WHERE label = ?1",
            [&location.label],
            |row| row.get(0),
        )
        .with_context(|| format!("Location '{}' missing after insert", location.label))?;

    Ok(id)
}

pub fn find_location_by_label(conn: &Connection, label: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row("SELECT id FROM LocationData WHERE label = ?1", [label], |row| row.get(0))
        .optional()?;
    Ok(id)
}

/// Insert weather keyed on (location_ref, date)
pub fn insert_weather(conn: &Connection, rows: &[WeatherRecord]) -> Result<usize> {
    let mut inserted = 0;

    for w in rows {
        inserted += conn.execute(
            "INSERT OR IGNORE INTO WeatherData (
                location_ref, date, temp_c, temp_min_c, temp_max_c,
                precip_mm, wind_speed, humidity, weather_category
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                w.location_ref,
                w.date,
                w.temp_c,
                w.temp_min_c,
                w.temp_max_c,
                w.precip_mm,
                w.wind_speed,
                w.humidity,
                w.weather_category,
            ],
        )?;
    }

    Ok(inserted)
}

/// Insert transit stops keyed on external_stop_id
pub fn insert_transit_stops(conn: &Connection, stops: &[TransitStop]) -> Result<usize> {
    let mut inserted = 0;

    for stop in stops {
        inserted += conn.execute(
            "INSERT OR IGNORE INTO TransitStops (external_stop_id, name, stop_type, modes, lat, lon)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stop.external_stop_id,
                stop.name,
                stop.stop_type,
                stop.modes_csv(),
                stop.lat,
                stop.lon,
            ],
        )?;
    }

    Ok(inserted)
}

// ============================================================================
// READS
// ============================================================================

pub fn count_rows(conn: &Connection, table: Table) -> Result<usize> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", table.name()),
        [],
        |row| row.get(0),
    )?;

    Ok(count as usize)
}

/// Row counts of the accumulated tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub crimes: usize,
    pub locations: usize,
    pub weather: usize,
    pub transit_stops: usize,
    pub streets: usize,
}

impl TableCounts {
    pub fn read(conn: &Connection) -> Result<Self> {
        Ok(TableCounts {
            crimes: count_rows(conn, Table::Crimes)?,
            locations: count_rows(conn, Table::Locations)?,
            weather: count_rows(conn, Table::Weather)?,
            transit_stops: count_rows(conn, Table::TransitStops)?,
            streets: count_rows(conn, Table::Streets)?,
        })
    }
}

/// External ids already stored for a month
pub fn known_crime_ids(conn: &Connection, month: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT external_id FROM CrimeData WHERE month = ?1")?;
    let ids = stmt
        .query_map([month], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;

    Ok(ids)
}

/// Locations with coordinates, oldest first
pub fn location_points(conn: &Connection) -> Result<Vec<LocationPoint>> {
    let mut stmt = conn.prepare(
        "SELECT id, lat, lon FROM LocationData
         WHERE lat IS NOT NULL AND lon IS NOT NULL
         ORDER BY id",
    )?;

    let points = stmt
        .query_map([], |row| {
            Ok(LocationPoint {
                id: row.get(0)?,
                lat: row.get(1)?,
                lon: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(points)
}

// ============================================================================
// CURSOR STORE
// ============================================================================

pub fn get_cursor(conn: &Connection, source_name: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM Cursors WHERE source_name = ?1",
            [source_name],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value)
}

pub fn set_cursor(conn: &Connection, source_name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO Cursors (source_name, value) VALUES (?1, ?2)
         ON CONFLICT(source_name) DO UPDATE SET value = excluded.value",
        params![source_name, value],
    )?;

    Ok(())
}
