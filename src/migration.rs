// 🔧 Backfill pass - runs once per process, right after setup_database
//
// 1. Crimes stored before date derivation existed get their derived_date.
// 2. Databases that kept street_name on CrimeData get it moved into StreetData
//    and the duplicated value nulled on the crime row.
//
// Both steps only touch rows that still need it, so a clean database is a no-op.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::{has_column, Table};
use crate::linkage::{date_seed, derive_date};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub dates_derived: usize,
    pub dates_failed: usize,
    pub streets_normalized: usize,
}

impl BackfillReport {
    pub fn is_noop(&self) -> bool {
        *self == BackfillReport::default()
    }
}

pub fn run_backfill(conn: &Connection) -> Result<BackfillReport> {
    let mut report = BackfillReport::default();

    let (derived, failed) = backfill_derived_dates(conn).context("Failed to backfill derived dates")?;
    report.dates_derived = derived;
    report.dates_failed = failed;

    report.streets_normalized = normalize_legacy_streets(conn).context("Failed to normalize street names")?;

    if report.is_noop() {
        log::debug!("Backfill: nothing to do");
    } else {
        log::info!(
            "🔧 Backfill: {} dates derived ({} unparsable months), {} street names normalized",
            report.dates_derived,
            report.dates_failed,
            report.streets_normalized
        );
    }

    Ok(report)
}

/// Returns (derived, skipped). Rows whose month cannot be parsed stay null.
fn backfill_derived_dates(conn: &Connection) -> Result<(usize, usize)> {
    let mut stmt = conn.prepare(
        "SELECT id, external_id, month, persistent_id FROM CrimeData WHERE derived_date IS NULL",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut derived = 0;
    let mut failed = 0;

    for (id, external_id, month, persistent_id) in rows {
        let marker = persistent_id.unwrap_or_else(|| id.to_string());
        let seed = date_seed(external_id.as_deref(), &month, &marker);

        match derive_date(&month, &seed) {
            Ok(date) => {
                derived += conn.execute(
                    "UPDATE CrimeData SET derived_date = ?1 WHERE id = ?2",
                    params![date.format("%Y-%m-%d").to_string(), id],
                )?;
            }
            Err(e) => {
                log::warn!("⚠️  Crime {}: cannot derive date from month '{}': {}", id, month, e);
                failed += 1;
            }
        }
    }

    Ok((derived, failed))
}

fn normalize_legacy_streets(conn: &Connection) -> Result<usize> {
    if !has_column(conn, Table::Crimes, "street_name")? {
        return Ok(0);
    }

    conn.execute(
        "INSERT OR IGNORE INTO StreetData (street_id, street_name)
         SELECT street_id, MAX(street_name) FROM CrimeData
         WHERE street_id IS NOT NULL AND street_name IS NOT NULL
         GROUP BY street_id",
        [],
    )?;

    let nulled = conn.execute(
        "UPDATE CrimeData SET street_name = NULL
         WHERE street_name IS NOT NULL AND street_id IS NOT NULL",
        [],
    )?;

    Ok(nulled)
}
