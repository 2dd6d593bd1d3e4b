// 🔗 Linkage Resolver
//
// Two jobs:
// 1. Give every crime a concrete calendar day (the feed only has a month) so it
//    can join daily weather on (location_ref, date).
// 2. Give every crime a location: a geocoded one, or the shared default.
//
// The derived day is a pure function of (month, seed): re-running never moves
// a crime to another day.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use crate::db::{get_cursor, get_or_create_location, set_cursor, LocationRecord};

pub const DEFAULT_LOCATION_LABEL: &str = "Default Location (unresolved)";

/// Cursor holding the id of the last crime released from the default location
pub const RELEASE_CURSOR: &str = "geocode_release";

// ============================================================================
// DATE DERIVATION
// ============================================================================

/// "YYYY-MM" → (year, month)
pub fn parse_month(month: &str) -> Result<(i32, u32)> {
    let (year, m) = month
        .trim()
        .split_once('-')
        .ok_or_else(|| anyhow!("month '{}' is not YYYY-MM", month))?;

    if year.len() != 4 || m.len() != 2 {
        return Err(anyhow!("month '{}' is not YYYY-MM", month));
    }

    let year: i32 = year.parse().with_context(|| format!("bad year in '{}'", month))?;
    let m: u32 = m.parse().with_context(|| format!("bad month in '{}'", month))?;

    if !(1..=12).contains(&m) {
        return Err(anyhow!("month '{}' out of range", month));
    }

    Ok((year, m))
}

pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };

    Some((next - first).num_days() as u32)
}

/// Seed for date derivation: the external id, or "{month}#{marker}" when the
/// record has no usable id.
pub fn date_seed(external_id: Option<&str>, month: &str, marker: &str) -> String {
    match external_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("{}#{}", month, marker),
    }
}

/// Day-of-month = SHA-256(seed)[0..8] as big-endian u64, mod days_in_month, + 1
pub fn derive_date(month: &str, seed: &str) -> Result<NaiveDate> {
    let (year, m) = parse_month(month)?;
    let days = days_in_month(year, m).ok_or_else(|| anyhow!("invalid month '{}'", month))?;

    let digest = Sha256::digest(seed.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let day = (u64::from_be_bytes(prefix) % days as u64) as u32 + 1;

    NaiveDate::from_ymd_opt(year, m, day).ok_or_else(|| anyhow!("day {} out of range for {}", day, month))
}

// ============================================================================
// LOCATION LINKING
// ============================================================================

/// Crime waiting for reverse geocoding
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCrime {
    pub crime_id: i64,
    pub lat: f64,
    pub lon: f64,
}

/// Resolved location for one pending crime
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeMatch {
    pub crime_id: i64,
    pub location: LocationRecord,
}

/// Up to `limit` unlinked crimes that have coordinates, oldest first.
/// Crimes without coordinates can only ever get the default location.
pub fn crimes_pending_geocode(conn: &Connection, limit: usize) -> Result<Vec<PendingCrime>> {
    let mut stmt = conn.prepare(
        "SELECT id, lat, lon FROM CrimeData
         WHERE location_ref IS NULL AND lat IS NOT NULL AND lon IS NOT NULL
         ORDER BY id
         LIMIT ?1",
    )?;

    let pending = stmt
        .query_map([limit as i64], |row| {
            Ok(PendingCrime {
                crime_id: row.get(0)?,
                lat: row.get(1)?,
                lon: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(pending)
}

/// Create/fetch each matched location and attach it to its crime.
/// Only unlinked crimes are touched. Returns crimes linked.
pub fn link_matches(conn: &Connection, matches: &[GeocodeMatch]) -> Result<usize> {
    let mut linked = 0;

    for m in matches {
        let location_id = get_or_create_location(conn, &m.location)?;
        linked += conn.execute(
            "UPDATE CrimeData SET location_ref = ?1 WHERE id = ?2 AND location_ref IS NULL",
            params![location_id, m.crime_id],
        )?;
    }

    Ok(linked)
}

/// The shared fallback location, placed at the crime-area centre so weather
/// can be fetched for it like any other location.
pub fn default_location(centre: (f64, f64)) -> LocationRecord {
    LocationRecord {
        label: DEFAULT_LOCATION_LABEL.to_string(),
        city: Some("London".to_string()),
        county: None,
        region: Some("Greater London".to_string()),
        lat: Some(centre.0),
        lon: Some(centre.1),
    }
}

/// Link every still-unlinked crime to the default location.
/// After this no crime has a null location_ref.
pub fn assign_default_location(conn: &Connection, centre: (f64, f64)) -> Result<usize> {
    let unlinked: i64 = conn.query_row(
        "SELECT COUNT(*) FROM CrimeData WHERE location_ref IS NULL",
        [],
        |row| row.get(0),
    )?;
    if unlinked == 0 {
        return Ok(0);
    }

    let default_id = get_or_create_location(conn, &default_location(centre))?;
    let assigned = conn.execute(
        "UPDATE CrimeData SET location_ref = ?1 WHERE location_ref IS NULL",
        [default_id],
    )?;

    Ok(assigned)
}

/// Move up to `limit` crimes off the default location so geocoding can retry
/// them. Only crimes with coordinates are released.
///
/// The window rotates: each call resumes after the last crime it released
/// (kept in the `geocode_release` cursor) and wraps to the lowest ids, so a
/// crime the geocoder never resolves cannot hold the window forever.
pub fn release_default_locations(conn: &Connection, limit: usize) -> Result<usize> {
    if limit == 0 {
        return Ok(0);
    }

    let after = get_cursor(conn, RELEASE_CURSOR)?
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);

    let mut ids = defaulted_crime_ids(conn, ReleaseWindow::After(after), limit)?;
    if ids.len() < limit {
        ids.extend(defaulted_crime_ids(conn, ReleaseWindow::UpTo(after), limit - ids.len())?);
    }

    let last = match ids.last() {
        Some(id) => *id,
        None => return Ok(0),
    };

    let mut released = 0;
    for id in &ids {
        released += conn.execute("UPDATE CrimeData SET location_ref = NULL WHERE id = ?1", [id])?;
    }
    set_cursor(conn, RELEASE_CURSOR, &last.to_string())?;

    Ok(released)
}

enum ReleaseWindow {
    After(i64),
    UpTo(i64),
}

fn defaulted_crime_ids(conn: &Connection, window: ReleaseWindow, limit: usize) -> Result<Vec<i64>> {
    let (bound, id) = match window {
        ReleaseWindow::After(id) => ("c.id > ?2", id),
        ReleaseWindow::UpTo(id) => ("c.id <= ?2", id),
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT c.id FROM CrimeData c
         JOIN LocationData l ON l.id = c.location_ref
         WHERE l.label = ?1 AND c.lat IS NOT NULL AND c.lon IS NOT NULL AND {}
         ORDER BY c.id
         LIMIT ?3",
        bound
    ))?;

    let ids = stmt
        .query_map(params![DEFAULT_LOCATION_LABEL, id, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;

    Ok(ids)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::insert_crimes;
    use crate::testutil::{memory_db, sample_crime, sample_location};
    use chrono::Datelike;

    const CENTRE: (f64, f64) = (51.509865, -0.118092);

    fn unlinked_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM CrimeData WHERE location_ref IS NULL",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2023, 2), Some(28));
        assert_eq!(days_in_month(2024, 2), Some(29));
        assert_eq!(days_in_month(2023, 9), Some(30));
        assert_eq!(days_in_month(2023, 12), Some(31));
        assert_eq!(days_in_month(2023, 13), None);
    }

    #[test]
    fn test_parse_month() {
        assert_eq!(parse_month("2023-09").unwrap(), (2023, 9));
        assert!(parse_month("2023-9").is_err());
        assert!(parse_month("2023-00").is_err());
        assert!(parse_month("23-09").is_err());
        assert!(parse_month("").is_err());
    }

    #[test]
    fn test_derive_date_february() {
        let date = derive_date("2023-02", "X").unwrap();
        let lo = NaiveDate::from_ymd_opt(2023, 2, 1).unwrap();
        let hi = NaiveDate::from_ymd_opt(2023, 2, 28).unwrap();
        assert!(date >= lo && date <= hi, "{} outside February 2023", date);
    }

    #[test]
    fn test_derive_date_is_stable() {
        for seed in ["112233", "abc", "2023-09#17", ""] {
            let first = derive_date("2023-09", seed).unwrap();
            for _ in 0..3 {
                assert_eq!(derive_date("2023-09", seed).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_derive_date_always_in_month() {
        for month in ["2023-01", "2023-02", "2024-02", "2023-04", "2023-12"] {
            let (year, m) = parse_month(month).unwrap();
            let days = days_in_month(year, m).unwrap();
            for i in 0..200 {
                let date = derive_date(month, &format!("crime-{}", i)).unwrap();
                assert_eq!(date.year(), year);
                assert_eq!(date.month(), m);
                assert!(date.day() >= 1 && date.day() <= days);
            }
        }
    }

    #[test]
    fn test_derive_date_spreads_across_days() {
        let days: std::collections::HashSet<u32> = (0..300)
            .map(|i| derive_date("2023-09", &i.to_string()).unwrap().day())
            .collect();
        assert!(days.len() > 20, "only {} distinct days", days.len());
    }

    #[test]
    fn test_derive_date_rejects_bad_month() {
        assert!(derive_date("2023-13", "X").is_err());
        assert!(derive_date("not-a-month", "X").is_err());
    }

    #[test]
    fn test_date_seed_fallback() {
        assert_eq!(date_seed(Some("998"), "2023-09", "p1"), "998");
        assert_eq!(date_seed(Some("  "), "2023-09", "p1"), "2023-09#p1");
        assert_eq!(date_seed(None, "2023-09", "42"), "2023-09#42");
    }

    #[test]
    fn test_link_matches_and_default_coverage() {
        let conn = memory_db();
        let mut no_coords = sample_crime("3", "2023-09");
        no_coords.lat = None;
        no_coords.lon = None;
        insert_crimes(&conn, &[sample_crime("1", "2023-09"), sample_crime("2", "2023-09"), no_coords]).unwrap();

        let pending = crimes_pending_geocode(&conn, 10).unwrap();
        assert_eq!(pending.len(), 2, "crime without coordinates is not geocodable");

        let linked = link_matches(
            &conn,
            &[GeocodeMatch {
                crime_id: pending[0].crime_id,
                location: sample_location("Strand, London", 51.51, -0.12),
            }],
        )
        .unwrap();
        assert_eq!(linked, 1);
        assert_eq!(unlinked_count(&conn), 2);

        let assigned = assign_default_location(&conn, CENTRE).unwrap();
        assert_eq!(assigned, 2);
        assert_eq!(unlinked_count(&conn), 0);

        // Second pass is a no-op
        assert_eq!(assign_default_location(&conn, CENTRE).unwrap(), 0);
    }

    #[test]
    fn test_default_location_is_shared() {
        let conn = memory_db();
        insert_crimes(&conn, &[sample_crime("1", "2023-09")]).unwrap();
        assign_default_location(&conn, CENTRE).unwrap();
        insert_crimes(&conn, &[sample_crime("2", "2023-09")]).unwrap();
        assign_default_location(&conn, CENTRE).unwrap();

        let distinct: i64 = conn
            .query_row("SELECT COUNT(DISTINCT location_ref) FROM CrimeData", [], |row| row.get(0))
            .unwrap();
        assert_eq!(distinct, 1);
        assert_eq!(crate::db::count_rows(&conn, crate::db::Table::Locations).unwrap(), 1);
    }

    #[test]
    fn test_release_is_bounded_and_skips_real_locations() {
        let conn = memory_db();
        let crimes: Vec<_> = (0..5).map(|i| sample_crime(&i.to_string(), "2023-09")).collect();
        insert_crimes(&conn, &crimes).unwrap();

        let pending = crimes_pending_geocode(&conn, 1).unwrap();
        link_matches(
            &conn,
            &[GeocodeMatch {
                crime_id: pending[0].crime_id,
                location: sample_location("Strand, London", 51.51, -0.12),
            }],
        )
        .unwrap();
        assign_default_location(&conn, CENTRE).unwrap();

        assert_eq!(release_default_locations(&conn, 3).unwrap(), 3);
        assert_eq!(unlinked_count(&conn), 3);
        assert_eq!(release_default_locations(&conn, 0).unwrap(), 0);

        // Only one crime is still on the default; the geocoded one is never released
        assert_eq!(release_default_locations(&conn, 10).unwrap(), 1);
        assert_eq!(unlinked_count(&conn), 4);
    }

    #[test]
    fn test_release_window_rotates_and_wraps() {
        let conn = memory_db();
        let crimes: Vec<_> = (0..3).map(|i| sample_crime(&i.to_string(), "2023-09")).collect();
        insert_crimes(&conn, &crimes).unwrap();
        assign_default_location(&conn, CENTRE).unwrap();

        let mut released = Vec::new();
        for _ in 0..4 {
            assert_eq!(release_default_locations(&conn, 1).unwrap(), 1);
            released.push(crimes_pending_geocode(&conn, 10).unwrap()[0].crime_id);
            assign_default_location(&conn, CENTRE).unwrap();
        }

        assert_eq!(released, vec![1, 2, 3, 1], "wraps back to the lowest id");
        assert_eq!(get_cursor(&conn, RELEASE_CURSOR).unwrap().as_deref(), Some("1"));

        // A window running past the end continues from the start
        assert_eq!(release_default_locations(&conn, 3).unwrap(), 3);
        assert_eq!(get_cursor(&conn, RELEASE_CURSOR).unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_link_does_not_overwrite_existing_link() {
        let conn = memory_db();
        insert_crimes(&conn, &[sample_crime("1", "2023-09")]).unwrap();
        let crime_id = crimes_pending_geocode(&conn, 1).unwrap()[0].crime_id;

        let first = GeocodeMatch {
            crime_id,
            location: sample_location("Strand, London", 51.51, -0.12),
        };
        let second = GeocodeMatch {
            crime_id,
            location: sample_location("Soho, London", 51.51, -0.13),
        };

        assert_eq!(link_matches(&conn, &[first]).unwrap(), 1);
        assert_eq!(link_matches(&conn, &[second]).unwrap(), 0);
    }
}
