// 🌱 Synthetic seeding - opt-in top-up when upstream data runs short
//
// Deterministic London grid points and transit stops. Labels and stop ids
// continue from the current row count, so seeded rows never collide with each
// other across runs. Bounded by the per-run budget like any other source.

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;

use crate::db::{count_rows, get_or_create_location, insert_transit_stops, LocationRecord, Table, TransitStop};

const LOCATION_BASE: (f64, f64) = (51.48, -0.15);
const STOP_BASE: (f64, f64) = (51.49, -0.12);

const STOP_CYCLE: &[(&str, &str)] = &[
    ("tube", "NaptanMetroStation"),
    ("dlr", "NaptanMetroStation"),
    ("bus", "NaptanBusCoachStation"),
    ("rail", "NaptanRailStation"),
    ("tram", "NaptanTramStation"),
    ("river-bus", "NaptanFerryPort"),
    ("cable-car", "NaptanAirAccessArea"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub locations: usize,
    pub transit_stops: usize,
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Add up to `limit` synthetic locations. Returns rows created.
pub fn seed_locations(conn: &Connection, limit: usize) -> Result<usize> {
    let existing = count_rows(conn, Table::Locations)?;

    for idx in 0..limit {
        let (col, row) = ((idx % 10) as f64, (idx / 10) as f64);
        let location = LocationRecord {
            label: format!("SYNTH_LOC_{}", existing + idx + 1),
            city: Some("London".to_string()),
            county: Some("Synthetic Borough".to_string()),
            region: Some("Greater London".to_string()),
            lat: Some(round6(LOCATION_BASE.0 + row * 0.004 + col * 0.0015)),
            lon: Some(round6(LOCATION_BASE.1 + col * 0.004 + row * 0.0015)),
        };
        get_or_create_location(conn, &location)?;
    }

    Ok(count_rows(conn, Table::Locations)? - existing)
}

/// Add up to `limit` synthetic stops cycling through STOP_CYCLE. Returns rows created.
pub fn seed_transit_stops(conn: &Connection, limit: usize) -> Result<usize> {
    let existing = count_rows(conn, Table::TransitStops)?;

    let stops: Vec<TransitStop> = (0..limit)
        .map(|idx| {
            let n = existing + idx + 1;
            let (mode, stop_type) = STOP_CYCLE[idx % STOP_CYCLE.len()];
            TransitStop {
                external_stop_id: format!("SYNTH_{:04}", n),
                name: Some(format!("Synthetic Stop {}", n)),
                stop_type: Some(stop_type.to_string()),
                modes: vec![mode.to_string()],
                lat: Some(round6(STOP_BASE.0 + (idx % 15) as f64 * 0.0012)),
                lon: Some(round6(STOP_BASE.1 + (idx / 15) as f64 * 0.0018)),
            }
        })
        .collect();

    insert_transit_stops(conn, &stops)
}
