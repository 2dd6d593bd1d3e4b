// 🚓 Crime Adapter - street-level incident feed
//
// GET {base}/crimes-street/all-crime?poly=..&date=YYYY-MM  (or lat/lng)
//
// The feed returns the whole month for the area in one array. Ids already
// stored are skipped before truncating to quota, so each run advances through
// the list instead of re-reading its head.

use super::{SourceAdapter, SourceKind};
use crate::config::CrimeArea;
use crate::db::CrimeRecord;
use crate::error::FetchError;
use crate::http::{json_f64, json_i64, json_str, Fetcher, HttpRequest};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct CrimeQuery {
    pub area: CrimeArea,
    /// "YYYY-MM"
    pub month: String,
    /// External ids already stored for this month
    pub skip_ids: HashSet<String>,
}

pub struct CrimeAdapter {
    fetcher: Fetcher,
    base_url: String,
}

impl CrimeAdapter {
    pub fn new(fetcher: Fetcher, base_url: &str) -> Self {
        CrimeAdapter {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, query: &CrimeQuery) -> HttpRequest {
        HttpRequest::get(format!("{}/crimes-street/all-crime", self.base_url))
            .params(query.area.query_params())
            .param("date", &query.month)
    }
}

impl SourceAdapter for CrimeAdapter {
    type Context = CrimeQuery;
    type Record = CrimeRecord;

    fn source(&self) -> SourceKind {
        SourceKind::Crime
    }

    fn fetch(&mut self, quota: usize, query: &CrimeQuery) -> Result<Vec<CrimeRecord>, FetchError> {
        let payload = self.fetcher.get_json(&self.request(query))?;

        let raw = match payload {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(FetchError::Decode(format!(
                    "expected an array of crimes, got {}",
                    json_kind(&other)
                )))
            }
        };
        let total = raw.len();

        let crimes: Vec<CrimeRecord> = raw
            .iter()
            .filter_map(|item| normalize_crime(item, &query.month))
            .filter(|crime| !query.skip_ids.contains(&crime.external_id))
            .take(quota)
            .collect();

        log::info!(
            "🚓 Crime feed {}: {} upstream, {} new taken (quota {})",
            query.month,
            total,
            crimes.len(),
            quota
        );

        Ok(crimes)
    }
}

/// Flatten one feed item. Returns None only when the item has no usable id.
pub fn normalize_crime(raw: &Value, fallback_month: &str) -> Option<CrimeRecord> {
    let persistent_id = json_str(raw, "persistent_id");
    let external_id = match json_str(raw, "id").or_else(|| persistent_id.clone()) {
        Some(id) => id,
        None => {
            log::debug!("dropping crime without id or persistent_id");
            return None;
        }
    };

    let location = raw.get("location").filter(|v| v.is_object());
    let street = location.and_then(|l| l.get("street")).filter(|v| v.is_object());
    let outcome = raw.get("outcome_status").filter(|v| v.is_object());

    Some(CrimeRecord {
        external_id,
        persistent_id,
        month: json_str(raw, "month").unwrap_or_else(|| fallback_month.to_string()),
        category: json_str(raw, "category"),
        lat: location.and_then(|l| json_f64(l, "latitude")),
        lon: location.and_then(|l| json_f64(l, "longitude")),
        street_id: street.and_then(|s| json_i64(s, "id")),
        street_name: street.and_then(|s| json_str(s, "name")),
        outcome_category: outcome.and_then(|o| json_str(o, "category")),
        outcome_date: outcome.and_then(|o| json_str(o, "date")),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fetch_at_boundary;
    use crate::db::{count_rows, insert_crimes, known_crime_ids, Table};
    use crate::testutil::{memory_db, FakeHttp, ManualClock};
    use serde_json::json;

    fn feed_item(id: u64) -> Value {
        json!({
            "category": "anti-social-behaviour",
            "persistent_id": format!("pers-{}", id),
            "id": id,
            "month": "2023-09",
            "location": {
                "latitude": "51.512",
                "longitude": "-0.131",
                "street": {"id": 1_673_000 + id, "name": "On or near Dean Street"}
            },
            "outcome_status": {"category": "Under investigation", "date": "2023-09"}
        })
    }

    fn query(skip: &[&str]) -> CrimeQuery {
        CrimeQuery {
            area: CrimeArea::Point { lat: 51.5, lon: -0.12 },
            month: "2023-09".to_string(),
            skip_ids: skip.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn adapter(http: &FakeHttp) -> CrimeAdapter {
        CrimeAdapter::new(http.fetcher(&ManualClock::new()), "http://police.test/api/")
    }

    #[test]
    fn test_normalize_full_item() {
        let crime = normalize_crime(&feed_item(42), "2023-01").unwrap();

        assert_eq!(crime.external_id, "42");
        assert_eq!(crime.persistent_id.as_deref(), Some("pers-42"));
        assert_eq!(crime.month, "2023-09");
        assert_eq!(crime.lat, Some(51.512));
        assert_eq!(crime.lon, Some(-0.131));
        assert_eq!(crime.street_id, Some(1_673_042));
        assert_eq!(crime.street_name.as_deref(), Some("On or near Dean Street"));
        assert_eq!(crime.outcome_category.as_deref(), Some("Under investigation"));
    }

    #[test]
    fn test_normalize_tolerates_missing_fields() {
        let crime = normalize_crime(
            &json!({"id": 7, "category": "drugs", "location": null, "outcome_status": null}),
            "2023-09",
        )
        .unwrap();

        assert_eq!(crime.month, "2023-09", "missing month falls back to query month");
        assert_eq!(crime.lat, None);
        assert_eq!(crime.street_id, None);
        assert_eq!(crime.outcome_date, None);
    }

    #[test]
    fn test_normalize_id_fallback() {
        let crime = normalize_crime(&json!({"persistent_id": "abc", "month": "2023-09"}), "2023-09").unwrap();
        assert_eq!(crime.external_id, "abc");

        assert!(normalize_crime(&json!({"month": "2023-09"}), "2023-09").is_none());
    }

    #[test]
    fn test_request_shape() {
        let http = FakeHttp::new();
        http.push_json(json!([]));
        let mut adapter = adapter(&http);

        adapter.fetch(5, &query(&[])).unwrap();

        let req = &http.requests()[0];
        assert_eq!(req.url, "http://police.test/api/crimes-street/all-crime");
        assert_eq!(req.query_value("date"), Some("2023-09"));
        assert_eq!(req.query_value("lat"), Some("51.5"));
        assert_eq!(req.query_value("lng"), Some("-0.12"));
    }

    #[test]
    fn test_skips_known_ids_then_truncates() {
        let http = FakeHttp::new();
        http.push_json(json!([feed_item(1), feed_item(2), feed_item(3), feed_item(4)]));
        let mut adapter = adapter(&http);

        let crimes = adapter.fetch(2, &query(&["1"])).unwrap();
        let ids: Vec<_> = crimes.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn test_duplicate_in_batch_stores_two_rows() {
        let http = FakeHttp::new();
        http.push_json(json!([feed_item(10), feed_item(11), feed_item(10)]));
        let mut adapter = adapter(&http);
        let conn = memory_db();

        let crimes = fetch_at_boundary(&mut adapter, 25, &query(&[]));
        assert_eq!(crimes.len(), 3);
        assert_eq!(insert_crimes(&conn, &crimes).unwrap(), 2);
        assert_eq!(count_rows(&conn, Table::Crimes).unwrap(), 2);
    }

    #[test]
    fn test_identical_payload_twice_is_idempotent() {
        let http = FakeHttp::new();
        let payload = json!([feed_item(1), feed_item(2)]);
        http.push_json(payload.clone()).push_json(payload);
        let mut adapter = adapter(&http);
        let conn = memory_db();

        let first = fetch_at_boundary(&mut adapter, 25, &query(&[]));
        insert_crimes(&conn, &first).unwrap();
        let once = count_rows(&conn, Table::Crimes).unwrap();

        let second = fetch_at_boundary(&mut adapter, 25, &query(&[]));
        insert_crimes(&conn, &second).unwrap();

        assert_eq!(count_rows(&conn, Table::Crimes).unwrap(), once);
        assert_eq!(known_crime_ids(&conn, "2023-09").unwrap().len(), 2);
    }

    #[test]
    fn test_server_error_becomes_empty() {
        let http = FakeHttp::new();
        http.push_status(503, "");
        let mut adapter = adapter(&http);

        assert!(fetch_at_boundary(&mut adapter, 25, &query(&[])).is_empty());
    }

    #[test]
    fn test_unexpected_shape_is_decode_error() {
        let http = FakeHttp::new();
        http.push_json(json!({"error": "too many"}));
        let mut adapter = adapter(&http);

        let err = adapter.fetch(25, &query(&[])).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }
}
