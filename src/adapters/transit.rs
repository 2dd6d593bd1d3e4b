// 🚇 Transit Adapter - stop points near a coordinate
//
// GET {base}/StopPoint?lat&lon&radius&stopTypes&modes&app_id&app_key
//
// Each run queries one entry of TRANSIT_VARIANTS. The rotation cursor stores
// the tag of the next variant to query, so entries can be added or reordered
// without invalidating stored progress.

use super::{SourceAdapter, SourceKind};
use crate::config::Credential;
use crate::db::TransitStop;
use crate::error::FetchError;
use crate::http::{json_f64, json_str, Fetcher, HttpRequest};
use serde_json::Value;

/// Cursor key for the rotation
pub const ROTATION_CURSOR: &str = "transit";

pub const UNKNOWN_MODE: &str = "unknown";

// ============================================================================
// ROTATION VARIANTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TransitVariant {
    pub tag: &'static str,
    pub lat: f64,
    pub lon: f64,
    pub radius_m: u32,
    pub stop_types: &'static [&'static str],
    pub modes: &'static [&'static str],
}

pub const TRANSIT_VARIANTS: &[TransitVariant] = &[
    TransitVariant {
        tag: "charing-cross-tube",
        lat: 51.509865,
        lon: -0.118092,
        radius_m: 1500,
        stop_types: &["NaptanMetroStation"],
        modes: &["tube"],
    },
    TransitVariant {
        tag: "westminster-bus",
        lat: 51.4995,
        lon: -0.1248,
        radius_m: 800,
        stop_types: &["NaptanPublicBusCoachTram", "NaptanBusCoachStation"],
        modes: &["bus"],
    },
    TransitVariant {
        tag: "waterloo-rail",
        lat: 51.5031,
        lon: -0.1132,
        radius_m: 1500,
        stop_types: &["NaptanRailStation"],
        modes: &["national-rail", "overground"],
    },
    TransitVariant {
        tag: "city-dlr",
        lat: 51.5107,
        lon: -0.0743,
        radius_m: 1500,
        stop_types: &["NaptanMetroStation"],
        modes: &["dlr"],
    },
    TransitVariant {
        tag: "embankment-river",
        lat: 51.5072,
        lon: -0.1227,
        radius_m: 2000,
        stop_types: &["NaptanFerryPort"],
        modes: &["river-bus", "river-tour"],
    },
    TransitVariant {
        tag: "soho-mixed",
        lat: 51.5136,
        lon: -0.1365,
        radius_m: 1000,
        stop_types: &["NaptanMetroStation", "NaptanRailStation", "NaptanBusCoachStation"],
        modes: &["tube", "dlr", "overground", "bus"],
    },
];

/// Variant for a stored tag. Missing or unknown tags restart the rotation.
pub fn current_variant(tag: Option<&str>) -> &'static TransitVariant {
    tag.and_then(|t| TRANSIT_VARIANTS.iter().find(|v| v.tag == t))
        .unwrap_or(&TRANSIT_VARIANTS[0])
}

/// Tag of the variant after `variant`, wrapping around
pub fn next_tag(variant: &TransitVariant) -> &'static str {
    let idx = TRANSIT_VARIANTS
        .iter()
        .position(|v| v.tag == variant.tag)
        .unwrap_or(0);
    TRANSIT_VARIANTS[(idx + 1) % TRANSIT_VARIANTS.len()].tag
}

// ============================================================================
// MODE VOCABULARY
// ============================================================================

pub const TRANSIT_MODES: &[&str] = &[
    "air",
    "bus",
    "cable-car",
    "coach",
    "dlr",
    "national-rail",
    "overground",
    "rail",
    "river",
    "river-bus",
    "river-tour",
    "tram",
    "tube",
];

const STOP_TYPE_MODES: &[(&str, &str)] = &[
    ("NaptanMetroStation", "tube"),
    ("NaptanRailStation", "rail"),
    ("NaptanBusCoachStation", "bus"),
    ("NaptanPublicBusCoachTram", "bus"),
    ("NaptanTramStation", "tram"),
    ("NaptanFerryPort", "river"),
    ("NaptanAirAccessArea", "air"),
];

pub fn stop_type_mode(stop_type: &str) -> Option<&'static str> {
    STOP_TYPE_MODES
        .iter()
        .find(|(t, _)| *t == stop_type)
        .map(|(_, mode)| *mode)
}

/// Modes a stored stop counts under: its own list, else its stop type's mode,
/// else "unknown". Never empty, no duplicates.
pub fn stop_modes(modes_csv: Option<&str>, stop_type: Option<&str>) -> Vec<String> {
    let mut modes: Vec<String> = Vec::new();
    for mode in modes_csv
        .unwrap_or("")
        .split(',')
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty())
    {
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }

    if modes.is_empty() {
        let fallback = stop_type.and_then(stop_type_mode).unwrap_or(UNKNOWN_MODE);
        modes.push(fallback.to_string());
    }

    modes
}

// ============================================================================
// ADAPTER
// ============================================================================

pub struct TransitAdapter {
    fetcher: Fetcher,
    base_url: String,
    app_id: Option<String>,
    app_key: Credential,
}

impl TransitAdapter {
    pub fn new(fetcher: Fetcher, base_url: &str, app_id: Option<String>, app_key: Credential) -> Self {
        TransitAdapter {
            fetcher,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id,
            app_key,
        }
    }

    fn request(&self, variant: &TransitVariant) -> HttpRequest {
        let mut request = HttpRequest::get(format!("{}/StopPoint", self.base_url))
            .param("lat", variant.lat)
            .param("lon", variant.lon)
            .param("radius", variant.radius_m)
            .param("stopTypes", variant.stop_types.join(","))
            .param("modes", variant.modes.join(","));

        if let Some(app_id) = &self.app_id {
            request = request.param("app_id", app_id);
        }
        request.param("app_key", self.app_key.expose())
    }
}

impl SourceAdapter for TransitAdapter {
    type Context = TransitVariant;
    type Record = TransitStop;

    fn source(&self) -> SourceKind {
        SourceKind::Transit
    }

    fn fetch(&mut self, quota: usize, variant: &TransitVariant) -> Result<Vec<TransitStop>, FetchError> {
        let payload = self.fetcher.get_json(&self.request(variant))?;

        let stops: Vec<TransitStop> = payload
            .get("stopPoints")
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(normalize_stop).take(quota).collect())
            .unwrap_or_default();

        log::info!("🚇 Transit [{}]: {} stops", variant.tag, stops.len());
        Ok(stops)
    }
}

/// One `stopPoints` entry. Entries without a NaPTAN id are dropped.
pub fn normalize_stop(raw: &Value) -> Option<TransitStop> {
    let external_stop_id = json_str(raw, "naptanId")?;

    let modes = raw
        .get("modes")
        .and_then(Value::as_array)
        .map(|modes| {
            modes
                .iter()
                .filter_map(Value::as_str)
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(TransitStop {
        external_stop_id,
        name: json_str(raw, "commonName"),
        stop_type: json_str(raw, "stopType"),
        modes,
        lat: json_f64(raw, "lat"),
        lon: json_f64(raw, "lon"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeHttp, ManualClock};
    use serde_json::json;
    use std::collections::HashSet;

    fn adapter(http: &FakeHttp, app_id: Option<&str>) -> TransitAdapter {
        TransitAdapter::new(
            http.fetcher(&ManualClock::new()),
            "http://tfl.test",
            app_id.map(str::to_string),
            Credential::new("tfl-key"),
        )
    }

    fn stop_point(id: &str, modes: &[&str]) -> Value {
        json!({
            "naptanId": id,
            "commonName": format!("Stop {}", id),
            "stopType": "NaptanMetroStation",
            "modes": modes,
            "lat": 51.5,
            "lon": -0.12
        })
    }

    #[test]
    fn test_variant_tags_are_unique() {
        let tags: HashSet<_> = TRANSIT_VARIANTS.iter().map(|v| v.tag).collect();
        assert_eq!(tags.len(), TRANSIT_VARIANTS.len());
    }

    #[test]
    fn test_variant_modes_are_in_vocabulary() {
        for variant in TRANSIT_VARIANTS {
            for mode in variant.modes {
                assert!(TRANSIT_MODES.contains(mode), "{} not in vocabulary", mode);
            }
        }
    }

    #[test]
    fn test_rotation_cycles_through_all_variants() {
        let mut tag: Option<String> = None;
        let mut seen = Vec::new();

        for _ in 0..TRANSIT_VARIANTS.len() + 1 {
            let variant = current_variant(tag.as_deref());
            seen.push(variant.tag);
            tag = Some(next_tag(variant).to_string());
        }

        assert_eq!(seen[0], TRANSIT_VARIANTS[0].tag);
        assert_eq!(seen[TRANSIT_VARIANTS.len()], TRANSIT_VARIANTS[0].tag, "wraps around");
        let distinct: HashSet<_> = seen.iter().collect();
        assert_eq!(distinct.len(), TRANSIT_VARIANTS.len());
    }

    #[test]
    fn test_unknown_tag_restarts_rotation() {
        assert_eq!(current_variant(Some("retired-variant")).tag, TRANSIT_VARIANTS[0].tag);
        assert_eq!(current_variant(None).tag, TRANSIT_VARIANTS[0].tag);
    }

    #[test]
    fn test_stop_type_mode_table() {
        assert_eq!(stop_type_mode("NaptanMetroStation"), Some("tube"));
        assert_eq!(stop_type_mode("NaptanRailStation"), Some("rail"));
        assert_eq!(stop_type_mode("NaptanBusCoachStation"), Some("bus"));
        assert_eq!(stop_type_mode("NaptanPublicBusCoachTram"), Some("bus"));
        assert_eq!(stop_type_mode("NaptanTramStation"), Some("tram"));
        assert_eq!(stop_type_mode("NaptanFerryPort"), Some("river"));
        assert_eq!(stop_type_mode("NaptanAirAccessArea"), Some("air"));
        assert_eq!(stop_type_mode("NaptanOnstreetBusCoachStopPair"), None);

        for (_, mode) in STOP_TYPE_MODES {
            assert!(TRANSIT_MODES.contains(mode));
        }
    }

    #[test]
    fn test_stop_modes_fallbacks() {
        assert_eq!(stop_modes(Some("tube,bus"), None), vec!["tube", "bus"]);
        assert_eq!(stop_modes(Some(" Tube , tube,"), None), vec!["tube"]);
        assert_eq!(stop_modes(Some(""), Some("NaptanFerryPort")), vec!["river"]);
        assert_eq!(stop_modes(None, Some("Mystery")), vec!["unknown"]);
        assert_eq!(stop_modes(None, None), vec!["unknown"]);
    }

    #[test]
    fn test_request_shape() {
        let http = FakeHttp::new();
        http.push_json(json!({"stopPoints": []}));
        let mut adapter = adapter(&http, Some("app-1"));

        adapter.fetch(10, &TRANSIT_VARIANTS[5]).unwrap();

        let req = &http.requests()[0];
        assert_eq!(req.url, "http://tfl.test/StopPoint");
        assert_eq!(req.query_value("modes"), Some("tube,dlr,overground,bus"));
        assert_eq!(req.query_value("radius"), Some("1000"));
        assert_eq!(req.query_value("app_id"), Some("app-1"));
        assert_eq!(req.query_value("app_key"), Some("tfl-key"));
    }

    #[test]
    fn test_app_id_is_optional() {
        let http = FakeHttp::new();
        http.push_json(json!({"stopPoints": []}));
        let mut adapter = adapter(&http, None);

        adapter.fetch(10, &TRANSIT_VARIANTS[0]).unwrap();
        assert_eq!(http.requests()[0].query_value("app_id"), None);
    }

    #[test]
    fn test_fetch_normalizes_and_truncates() {
        let http = FakeHttp::new();
        http.push_json(json!({"stopPoints": [
            stop_point("940GZZLUCHX", &["tube", "bus"]),
            {"commonName": "No id"},
            stop_point("940GZZLUEMB", &["tube"]),
            stop_point("940GZZLUWSM", &["tube"])
        ]}));
        let mut adapter = adapter(&http, None);

        let stops = adapter.fetch(2, &TRANSIT_VARIANTS[0]).unwrap();
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[0].modes, vec!["tube", "bus"]);
        assert_eq!(stops[0].name.as_deref(), Some("Stop 940GZZLUCHX"));
        assert_eq!(stops[1].external_stop_id, "940GZZLUEMB");
    }

    #[test]
    fn test_missing_stop_points_is_empty() {
        let http = FakeHttp::new();
        http.push_json(json!({"$type": "Tfl.Api.Presentation.Entities.StopPointsResponse"}));
        let mut adapter = adapter(&http, None);

        assert!(adapter.fetch(10, &TRANSIT_VARIANTS[0]).unwrap().is_empty());
    }
}
