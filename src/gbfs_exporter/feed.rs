// gbfs_exporter - Prometheus metrics exporter for GBFS station status feeds
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Decoding of GBFS `station_status` feeds.
//!
//! The feed is parsed into a set of wire types that mirror the JSON as published and
//! then normalized into `StationStatusResponse`. Boolean-like fields are published as
//! integers by most feeds, so normalization maps them with `flag()`.

use serde::Deserialize;
use std::error;
use std::fmt;

#[derive(Debug)]
pub enum DecodeError {
    Schema(serde_json::Error),
    TooManyStations { count: usize, max: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema(e) => write!(f, "{}", e),
            Self::TooManyStations { count, max } => {
                write!(f, "feed contains {} stations, more than the maximum of {}", count, max)
            }
        }
    }
}

impl error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Schema(e) => Some(e),
            _ => None,
        }
    }
}

/// Metadata included with every GBFS feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedEnvelope {
    pub last_updated: i64,
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationStatus {
    pub id: String,
    pub bikes_available: i64,
    pub bikes_disabled: i64,
    pub docks_available: i64,
    pub docks_disabled: i64,
    pub installed: bool,
    pub renting: bool,
    pub returning: bool,
    pub last_reported: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationStatusResponse {
    pub envelope: FeedEnvelope,
    pub stations: Vec<StationStatus>,
}

impl StationStatusResponse {
    /// Parse a `station_status` body.
    ///
    /// Fails with `DecodeError::Schema` if the body isn't JSON or doesn't contain
    /// a `data.stations` array of station entries.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireResponse = serde_json::from_slice(body).map_err(DecodeError::Schema)?;
        Ok(wire.normalize())
    }

    /// Reject the response if it has more than `max` stations, if a maximum is set.
    pub fn ensure_within(&self, max: Option<usize>) -> Result<(), DecodeError> {
        match max {
            Some(max) if self.stations.len() > max => Err(DecodeError::TooManyStations {
                count: self.stations.len(),
                max,
            }),
            _ => Ok(()),
        }
    }
}

/// Map a boolean published as an integer: zero is false, anything else is true.
pub fn flag(v: i64) -> bool {
    v != 0
}

#[derive(Deserialize, Debug)]
struct WireResponse {
    #[serde(default)]
    last_updated: i64,
    #[serde(default)]
    ttl: i64,
    data: WireData,
}

#[derive(Deserialize, Debug)]
struct WireData {
    stations: Vec<WireStation>,
}

#[derive(Deserialize, Debug)]
struct WireStation {
    station_id: WireId,
    num_bikes_available: i64,
    #[serde(default)]
    num_bikes_disabled: Option<i64>,
    num_docks_available: i64,
    #[serde(default)]
    num_docks_disabled: Option<i64>,
    is_installed: WireFlag,
    is_renting: WireFlag,
    is_returning: WireFlag,
    last_reported: i64,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(untagged)]
enum WireFlag {
    Int(i64),
    Bool(bool),
}

impl WireResponse {
    fn normalize(self) -> StationStatusResponse {
        StationStatusResponse {
            envelope: FeedEnvelope {
                last_updated: self.last_updated,
                ttl: self.ttl,
            },
            stations: self.data.stations.into_iter().map(WireStation::normalize).collect(),
        }
    }
}

impl WireStation {
    fn normalize(self) -> StationStatus {
        StationStatus {
            id: self.station_id.normalize(),
            bikes_available: self.num_bikes_available,
            bikes_disabled: self.num_bikes_disabled.unwrap_or(0),
            docks_available: self.num_docks_available,
            docks_disabled: self.num_docks_disabled.unwrap_or(0),
            installed: self.is_installed.normalize(),
            renting: self.is_renting.normalize(),
            returning: self.is_returning.normalize(),
            last_reported: self.last_reported,
        }
    }
}

impl WireId {
    fn normalize(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

impl WireFlag {
    fn normalize(self) -> bool {
        match self {
            Self::Int(v) => flag(v),
            Self::Bool(b) => b,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{flag, DecodeError, FeedEnvelope, StationStatusResponse};

    const SINGLE_STATION: &str = r#"{
        "last_updated": 1600000100,
        "ttl": 30,
        "data": {
            "stations": [{
                "station_id": "7001",
                "num_bikes_available": 4,
                "num_docks_available": 11,
                "is_installed": 1,
                "is_renting": 1,
                "is_returning": 0,
                "last_reported": 1600000000
            }]
        }
    }"#;

    fn station_with_flags(installed: &str, renting: &str, returning: &str) -> String {
        format!(
            r#"{{"data": {{"stations": [{{
                "station_id": "1",
                "num_bikes_available": 0,
                "num_docks_available": 0,
                "is_installed": {},
                "is_renting": {},
                "is_returning": {},
                "last_reported": 0
            }}]}}}}"#,
            installed, renting, returning
        )
    }

    #[test]
    fn test_flag() {
        assert!(!flag(0));
        assert!(flag(1));
        assert!(flag(2));
        assert!(flag(-1));
        assert!(flag(i64::MAX));
    }

    #[test]
    fn test_decode_single_station() {
        let res = StationStatusResponse::decode(SINGLE_STATION.as_bytes()).unwrap();

        assert_eq!(
            FeedEnvelope {
                last_updated: 1600000100,
                ttl: 30
            },
            res.envelope
        );
        assert_eq!(1, res.stations.len());

        let station = &res.stations[0];
        assert_eq!("7001", station.id);
        assert_eq!(4, station.bikes_available);
        assert_eq!(11, station.docks_available);
        assert!(station.installed);
        assert!(station.renting);
        assert!(!station.returning);
        assert_eq!(1600000000, station.last_reported);
    }

    #[test]
    fn test_decode_missing_disabled_defaults_to_zero() {
        let res = StationStatusResponse::decode(SINGLE_STATION.as_bytes()).unwrap();
        assert_eq!(0, res.stations[0].bikes_disabled);
        assert_eq!(0, res.stations[0].docks_disabled);
    }

    #[test]
    fn test_decode_disabled_present() {
        let body = r#"{"data": {"stations": [{
            "station_id": "abc",
            "num_bikes_available": 3,
            "num_bikes_disabled": 2,
            "num_docks_available": 5,
            "num_docks_disabled": 1,
            "is_installed": 1,
            "is_renting": 1,
            "is_returning": 1,
            "last_reported": 1
        }]}}"#;

        let res = StationStatusResponse::decode(body.as_bytes()).unwrap();
        assert_eq!(2, res.stations[0].bikes_disabled);
        assert_eq!(1, res.stations[0].docks_disabled);
    }

    #[test]
    fn test_decode_null_disabled_defaults_to_zero() {
        let body = r#"{"data": {"stations": [{
            "station_id": "abc",
            "num_bikes_available": 3,
            "num_bikes_disabled": null,
            "num_docks_available": 5,
            "num_docks_disabled": null,
            "is_installed": 1,
            "is_renting": 1,
            "is_returning": 1,
            "last_reported": 1
        }]}}"#;

        let res = StationStatusResponse::decode(body.as_bytes()).unwrap();
        assert_eq!(0, res.stations[0].bikes_disabled);
        assert_eq!(0, res.stations[0].docks_disabled);
    }

    #[test]
    fn test_decode_nonzero_integers_are_true() {
        let body = station_with_flags("2", "-1", "0");
        let res = StationStatusResponse::decode(body.as_bytes()).unwrap();

        assert!(res.stations[0].installed);
        assert!(res.stations[0].renting);
        assert!(!res.stations[0].returning);
    }

    #[test]
    fn test_decode_json_booleans() {
        let body = station_with_flags("true", "false", "true");
        let res = StationStatusResponse::decode(body.as_bytes()).unwrap();

        assert!(res.stations[0].installed);
        assert!(!res.stations[0].renting);
        assert!(res.stations[0].returning);
    }

    #[test]
    fn test_decode_numeric_station_id() {
        let body = r#"{"data": {"stations": [{
            "station_id": 72,
            "num_bikes_available": 1,
            "num_docks_available": 1,
            "is_installed": 1,
            "is_renting": 1,
            "is_returning": 1,
            "last_reported": 1
        }]}}"#;

        let res = StationStatusResponse::decode(body.as_bytes()).unwrap();
        assert_eq!("72", res.stations[0].id);
    }

    #[test]
    fn test_decode_missing_envelope_defaults() {
        let body = r#"{"data": {"stations": []}}"#;
        let res = StationStatusResponse::decode(body.as_bytes()).unwrap();

        assert_eq!(FeedEnvelope::default(), res.envelope);
        assert!(res.stations.is_empty());
    }

    #[test]
    fn test_decode_not_json() {
        let res = StationStatusResponse::decode(b"<html>nope</html>");
        assert!(matches!(res, Err(DecodeError::Schema(_))));
    }

    #[test]
    fn test_decode_not_an_object() {
        let res = StationStatusResponse::decode(b"[1, 2, 3]");
        assert!(matches!(res, Err(DecodeError::Schema(_))));
    }

    #[test]
    fn test_decode_missing_data() {
        let res = StationStatusResponse::decode(br#"{"last_updated": 1, "ttl": 2}"#);
        assert!(matches!(res, Err(DecodeError::Schema(_))));
    }

    #[test]
    fn test_decode_stations_not_array() {
        let res = StationStatusResponse::decode(br#"{"data": {"stations": {"a": 1}}}"#);
        assert!(matches!(res, Err(DecodeError::Schema(_))));
    }

    #[test]
    fn test_decode_missing_station_id() {
        let body = r#"{"data": {"stations": [{
            "num_bikes_available": 1,
            "num_docks_available": 1,
            "is_installed": 1,
            "is_renting": 1,
            "is_returning": 1,
            "last_reported": 1
        }]}}"#;

        let res = StationStatusResponse::decode(body.as_bytes());
        assert!(matches!(res, Err(DecodeError::Schema(_))));
    }

    #[test]
    fn test_ensure_within() {
        let res = StationStatusResponse::decode(SINGLE_STATION.as_bytes()).unwrap();

        assert!(res.ensure_within(None).is_ok());
        assert!(res.ensure_within(Some(1)).is_ok());
        assert!(matches!(
            res.ensure_within(Some(0)),
            Err(DecodeError::TooManyStations { count: 1, max: 0 })
        ));
    }
}
