//! Serde models for upstream OpenAQ v3 payloads.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::OnceLock;

/// A paged response envelope.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub meta: Meta,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub found: Option<Found>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub page: Option<u64>,
}

/// The `meta.found` count, which upstream reports either as an integer or an
/// open-ended string such as `">1000"` or `"greater than 1000"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Found {
    Count(u64),
    Text(String),
}

impl Found {
    /// The leading integer of the reported count, interpreted as a lower
    /// bound. Unparseable text yields 0.
    pub fn lower_bound(&self) -> u64 {
        match self {
            Found::Count(n) => *n,
            Found::Text(s) => {
                static DIGITS: OnceLock<regex::Regex> = OnceLock::new();
                let re = DIGITS.get_or_init(|| regex::Regex::new(r"\d+").unwrap());
                re.find(s)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationData {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub locality: Option<String>,
    pub country: CountryRef,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(rename = "isMobile", default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub sensors: Vec<SensorData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountryRef {
    pub code: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorData {
    pub id: i64,
    pub parameter: ParameterData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterData {
    pub name: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    pub units: String,
}

/// A raw reading from either the `/latest` endpoint (nested `datetime`) or
/// the historical `/measurements` endpoint (nested `date`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawMeasurement {
    #[serde(rename = "sensorsId", default)]
    pub sensors_id: Option<i64>,
    /// Upstream reports null for sensors that are registered but have not
    /// reported yet.
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub date: Option<Stamp>,
    #[serde(default)]
    pub datetime: Option<Stamp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stamp {
    pub utc: String,
}

impl RawMeasurement {
    /// The UTC timestamp of the reading, from whichever of the two supported
    /// payload shapes is present. `None` when neither shape matches, which
    /// callers treat as a skippable record.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let stamp = self.date.as_ref().or(self.datetime.as_ref())?;
        DateTime::parse_from_rfc3339(&stamp.utc)
            .ok()
            .map(|dt| dt.to_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn found_integer_passes_through() {
        let found: Found = serde_json::from_str("4877").unwrap();
        assert_eq!(found.lower_bound(), 4877);
    }

    #[test]
    fn found_open_ended_string_parses_as_lower_bound() {
        let found: Found = serde_json::from_str(r#"">1000""#).unwrap();
        assert_eq!(found.lower_bound(), 1000);

        let found: Found = serde_json::from_str(r#""greater than 500""#).unwrap();
        assert_eq!(found.lower_bound(), 500);
    }

    #[test]
    fn found_garbage_is_zero() {
        let found: Found = serde_json::from_str(r#""unknown""#).unwrap();
        assert_eq!(found.lower_bound(), 0);
    }

    #[test]
    fn timestamp_from_measurement_shape() {
        let raw: RawMeasurement = serde_json::from_str(
            r#"{"value": 7.5, "date": {"utc": "2026-08-01T12:00:00Z"}}"#,
        )
        .unwrap();
        let ts = raw.timestamp().unwrap();
        assert_eq!(ts.hour(), 12);
    }

    #[test]
    fn timestamp_from_latest_shape() {
        let raw: RawMeasurement = serde_json::from_str(
            r#"{"sensorsId": 9, "value": 0.3, "datetime": {"utc": "2026-08-01T06:30:00+00:00"}}"#,
        )
        .unwrap();
        assert!(raw.timestamp().is_some());
        assert_eq!(raw.sensors_id, Some(9));
    }

    #[test]
    fn null_value_does_not_poison_sibling_readings() {
        let page: Page<RawMeasurement> = serde_json::from_str(
            r#"{"results": [
                {"sensorsId": 1, "value": 4.2, "datetime": {"utc": "2026-08-01T12:00:00Z"}},
                {"sensorsId": 2, "value": null, "datetime": {"utc": "2026-08-01T12:00:00Z"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].value, Some(4.2));
        assert!(page.results[1].value.is_none());
    }

    #[test]
    fn timestamp_missing_from_both_shapes() {
        let raw: RawMeasurement = serde_json::from_str(r#"{"value": 1.0}"#).unwrap();
        assert!(raw.timestamp().is_none());
    }

    #[test]
    fn location_payload_parses() {
        let loc: LocationData = serde_json::from_str(
            r#"{
                "id": 2178,
                "name": "Del Norte",
                "locality": "Albuquerque",
                "country": {"code": "US"},
                "coordinates": {"latitude": 35.1353, "longitude": -106.5847},
                "isMobile": false,
                "sensors": [
                    {"id": 3917, "parameter": {"name": "pm25", "displayName": "PM2.5", "units": "µg/m³"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(loc.country.code, "US");
        assert_eq!(loc.sensors[0].parameter.name, "pm25");
        assert!(!loc.is_mobile);
    }
}
