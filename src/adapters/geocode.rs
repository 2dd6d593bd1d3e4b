// 📍 Geocode Resolver Adapter - reverse geocoding of crime coordinates
//
// GET {base}/reverse?access_key=..&query=lat,lon&limit=1
//
// One call per pending crime. An empty `data` array leaves that crime
// unresolved (the default-location step picks it up). A transient failure stops
// the batch but keeps the matches made so far.

use super::{SourceAdapter, SourceKind};
use crate::config::Credential;
use crate::db::LocationRecord;
use crate::error::FetchError;
use crate::http::{json_f64, json_str, Fetcher, HttpRequest};
use crate::linkage::{GeocodeMatch, PendingCrime};
use serde_json::Value;

pub struct GeocodeAdapter {
    fetcher: Fetcher,
    base_url: String,
    access_key: Credential,
}

impl GeocodeAdapter {
    pub fn new(fetcher: Fetcher, base_url: &str, access_key: Credential) -> Self {
        GeocodeAdapter {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_key,
        }
    }

    fn request(&self, crime: &PendingCrime) -> HttpRequest {
        HttpRequest::get(format!("{}/reverse", self.base_url))
            .param("access_key", self.access_key.expose())
            .param("query", format!("{},{}", crime.lat, crime.lon))
            .param("limit", 1)
    }

    fn resolve(&mut self, crime: &PendingCrime) -> Result<Option<LocationRecord>, FetchError> {
        let payload = self.fetcher.get_json(&self.request(crime))?;
        Ok(payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.first())
            .and_then(normalize_place))
    }
}

impl SourceAdapter for GeocodeAdapter {
    type Context = Vec<PendingCrime>;
    type Record = GeocodeMatch;

    fn source(&self) -> SourceKind {
        SourceKind::Geocode
    }

    fn fetch(&mut self, quota: usize, pending: &Vec<PendingCrime>) -> Result<Vec<GeocodeMatch>, FetchError> {
        let mut matches = Vec::new();
        let mut unresolved = 0;

        for crime in pending.iter().take(quota) {
            match self.resolve(crime) {
                Ok(Some(location)) => matches.push(GeocodeMatch {
                    crime_id: crime.crime_id,
                    location,
                }),
                Ok(None) => unresolved += 1,
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "⚠️  Geocoding stopped after {} matches: {}",
                        matches.len(),
                        e
                    );
                    break;
                }
                Err(e) => {
                    log::debug!("crime {}: geocode failed: {}", crime.crime_id, e);
                    unresolved += 1;
                }
            }
        }

        log::info!("📍 Geocoded {} crimes ({} unresolved)", matches.len(), unresolved);
        Ok(matches)
    }
}

/// First `data` entry → location. The label is the natural key, so an entry
/// without one gets "locality, region"; with neither it is unresolved.
pub fn normalize_place(place: &Value) -> Option<LocationRecord> {
    let city = json_str(place, "locality");
    let county = json_str(place, "county");
    let region = json_str(place, "region");

    let label = json_str(place, "label").or_else(|| match (&city, &region) {
        (Some(c), Some(r)) => Some(format!("{}, {}", c, r)),
        (Some(c), None) => Some(c.clone()),
        (None, Some(r)) => Some(r.clone()),
        (None, None) => None,
    })?;

    Some(LocationRecord {
        label,
        city,
        county,
        region,
        lat: json_f64(place, "latitude"),
        lon: json_f64(place, "longitude"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeHttp, ManualClock};
    use serde_json::json;

    fn pending(ids: &[i64]) -> Vec<PendingCrime> {
        ids.iter()
            .map(|&id| PendingCrime {
                crime_id: id,
                lat: 51.51,
                lon: -0.12,
            })
            .collect()
    }

    fn place(label: &str) -> Value {
        json!({"data": [{
            "latitude": 51.5101,
            "longitude": -0.1201,
            "label": label,
            "locality": "London",
            "county": "Westminster",
            "region": "Greater London"
        }]})
    }

    fn adapter(http: &FakeHttp) -> GeocodeAdapter {
        GeocodeAdapter::new(
            http.fetcher(&ManualClock::new()),
            "http://geo.test/v1",
            Credential::new("k3y"),
        )
    }

    #[test]
    fn test_request_shape() {
        let http = FakeHttp::new();
        http.push_json(place("Strand, London, England"));
        let mut adapter = adapter(&http);

        adapter.fetch(1, &pending(&[1])).unwrap();

        let req = &http.requests()[0];
        assert_eq!(req.url, "http://geo.test/v1/reverse");
        assert_eq!(req.query_value("access_key"), Some("k3y"));
        assert_eq!(req.query_value("query"), Some("51.51,-0.12"));
    }

    #[test]
    fn test_matches_respect_quota() {
        let http = FakeHttp::new();
        http.push_json(place("A")).push_json(place("B")).push_json(place("C"));
        let mut adapter = adapter(&http);

        let matches = adapter.fetch(2, &pending(&[1, 2, 3])).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[1].crime_id, 2);
        assert_eq!(matches[1].location.label, "B");
        assert_eq!(matches[1].location.county.as_deref(), Some("Westminster"));
        assert_eq!(http.request_count(), 2);
    }

    #[test]
    fn test_empty_data_leaves_crime_unresolved() {
        let http = FakeHttp::new();
        http.push_json(json!({"data": []})).push_json(place("B"));
        let mut adapter = adapter(&http);

        let matches = adapter.fetch(5, &pending(&[1, 2])).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].crime_id, 2);
    }

    #[test]
    fn test_transient_error_keeps_partial_batch() {
        let http = FakeHttp::new();
        http.push_json(place("A"))
            .push_error(FetchError::Timeout)
            .push_json(place("C"));
        let mut adapter = adapter(&http);

        let matches = adapter.fetch(5, &pending(&[1, 2, 3])).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(http.request_count(), 2, "batch stops at the timeout");
    }

    #[test]
    fn test_permanent_error_skips_one_crime() {
        let http = FakeHttp::new();
        http.push_status(422, "").push_json(place("B"));
        let mut adapter = adapter(&http);

        let matches = adapter.fetch(5, &pending(&[1, 2])).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].crime_id, 2);
    }

    #[test]
    fn test_label_fallback() {
        let record = normalize_place(&json!({"locality": "Camden", "region": "Greater London"})).unwrap();
        assert_eq!(record.label, "Camden, Greater London");
        assert_eq!(record.lat, None);

        assert!(normalize_place(&json!({"latitude": 51.5})).is_none());
    }
}
