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

use crate::feed::{FeedEnvelope, StationStatus, StationStatusResponse};
use prometheus_client::encoding::text;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::{Registry, Unit};
use std::fmt;
use std::str::FromStr;

pub const NAMESPACE: &str = "gbfs";
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Encode every metric in the registry using the OpenMetrics text format.
pub fn render(reg: &Registry) -> Result<String, fmt::Error> {
    let mut buf = String::new();
    text::encode(&mut buf, reg)?;
    Ok(buf)
}

/// Which station fields are exported, picked once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldSet {
    /// Bikes available, bikes disabled, and docks available only.
    Minimal,
    #[default]
    Full,
}

impl FieldSet {
    pub fn fields(&self) -> &'static [Field] {
        match self {
            Self::Minimal => &[Field::BikesAvailable, Field::BikesDisabled, Field::DocksAvailable],
            Self::Full => &[
                Field::BikesAvailable,
                Field::BikesDisabled,
                Field::DocksAvailable,
                Field::DocksDisabled,
                Field::Installed,
                Field::Renting,
                Field::Returning,
                Field::LastReported,
            ],
        }
    }
}

impl FromStr for FieldSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "full" => Ok(Self::Full),
            _ => Err(format!("invalid metric set '{}', expected 'minimal' or 'full'", s)),
        }
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimal => write!(f, "minimal"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// A single per-station value that can be exported as a gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    BikesAvailable,
    BikesDisabled,
    DocksAvailable,
    DocksDisabled,
    Installed,
    Renting,
    Returning,
    LastReported,
}

impl Field {
    fn name(&self) -> &'static str {
        match self {
            Self::BikesAvailable => "bikes_available",
            Self::BikesDisabled => "bikes_disabled",
            Self::DocksAvailable => "docks_available",
            Self::DocksDisabled => "docks_disabled",
            Self::Installed => "installed",
            Self::Renting => "renting",
            Self::Returning => "returning",
            Self::LastReported => "last_reported_timestamp",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Self::BikesAvailable => "The number of bikes available for rental",
            Self::BikesDisabled => "The number of disabled bikes",
            Self::DocksAvailable => "The number of docks accepting bike returns",
            Self::DocksDisabled => "The number of empty but disabled dock points",
            Self::Installed => "Indicates if the station is installed on the street (0 or 1)",
            Self::Renting => "Indicates if the station is currently renting bikes (0 or 1)",
            Self::Returning => "Indicates if the station is currently accepting bike returns (0 or 1)",
            Self::LastReported => "Last time this station reported its status to the feed, in unixtime",
        }
    }

    fn unit(&self) -> Option<Unit> {
        match self {
            Self::LastReported => Some(Unit::Seconds),
            _ => None,
        }
    }

    /// Value of this field for a station, booleans as 1 or 0.
    pub fn value(&self, status: &StationStatus) -> i64 {
        match self {
            Self::BikesAvailable => status.bikes_available,
            Self::BikesDisabled => status.bikes_disabled,
            Self::DocksAvailable => status.docks_available,
            Self::DocksDisabled => status.docks_disabled,
            Self::Installed => i64::from(status.installed),
            Self::Renting => i64::from(status.renting),
            Self::Returning => i64::from(status.returning),
            Self::LastReported => status.last_reported,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StationLabels {
    pub station_id: String,
}

impl StationLabels {
    fn new(station_id: &str) -> Self {
        StationLabels {
            station_id: station_id.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FeedGauges {
    last_updated: Gauge,
    ttl: Gauge,
}

/// Holder for gauges that can be set from a `StationStatusResponse`.
///
/// All gauges are created and registered upon call to `StationMetrics::new()`. Each
/// per-station gauge has a "station_id" label. Gauges may be shared between a writer
/// and concurrent readers (rendering the registry) since each value is updated atomically.
#[derive(Debug, Clone)]
pub struct StationMetrics {
    gauges: Vec<(Field, Family<StationLabels, Gauge>)>,
    feed: Option<FeedGauges>,
}

impl StationMetrics {
    /// Create a new `StationMetrics` and register each gauge for the field set with the
    /// provided `Registry`. The full field set also registers feed level gauges.
    pub fn new(reg: &mut Registry, fields: FieldSet) -> Self {
        let mut gauges = Vec::with_capacity(fields.fields().len());
        for field in fields.fields() {
            let family = Family::<StationLabels, Gauge>::default();
            match field.unit() {
                Some(unit) => reg.register_with_unit(field.name(), field.help(), unit, family.clone()),
                None => reg.register(field.name(), field.help(), family.clone()),
            }

            gauges.push((*field, family));
        }

        let feed = if fields == FieldSet::Full {
            let feed = FeedGauges::default();
            reg.register_with_unit(
                "feed_last_updated_timestamp",
                "Last time the feed was updated by the publisher, in unixtime",
                Unit::Seconds,
                feed.last_updated.clone(),
            );
            reg.register_with_unit(
                "feed_ttl",
                "Number of seconds before the feed should be fetched again",
                Unit::Seconds,
                feed.ttl.clone(),
            );
            Some(feed)
        } else {
            None
        };

        Self { gauges, feed }
    }

    /// Set a single field for a station. Fields not part of the registered set are ignored.
    pub fn observe(&self, station_id: &str, field: Field, value: i64) {
        if let Some((_, family)) = self.gauges.iter().find(|(f, _)| *f == field) {
            family.get_or_create(&StationLabels::new(station_id)).set(value);
        }
    }

    /// Set every registered field from the provided station.
    pub fn station(&self, status: &StationStatus) {
        let labels = StationLabels::new(&status.id);
        for (field, family) in self.gauges.iter() {
            family.get_or_create(&labels).set(field.value(status));
        }
    }

    pub fn envelope(&self, envelope: &FeedEnvelope) {
        if let Some(feed) = &self.feed {
            feed.last_updated.set(envelope.last_updated);
            feed.ttl.set(envelope.ttl);
        }
    }

    /// Set all gauges from a decoded feed.
    pub fn response(&self, res: &StationStatusResponse) {
        self.envelope(&res.envelope);
        for status in res.stations.iter() {
            self.station(status);
        }
    }

    /// Remove every gauge for a station that is no longer part of the feed.
    pub fn forget(&self, station_id: &str) {
        let labels = StationLabels::new(station_id);
        for (_, family) in self.gauges.iter() {
            family.remove(&labels);
        }
    }
}

/// A registry and set of station gauges that belong to a single probe.
///
/// Nothing is shared with any other `MetricSet` or with the process wide registry,
/// so concurrent probes of different feeds cannot observe each other's stations.
#[derive(Debug)]
pub struct MetricSet {
    registry: Registry,
    stations: StationMetrics,
}

impl MetricSet {
    pub fn new(fields: FieldSet) -> Self {
        let mut registry = Registry::with_prefix(NAMESPACE);
        let stations = StationMetrics::new(&mut registry, fields);
        Self { registry, stations }
    }

    pub fn stations(&self) -> &StationMetrics {
        &self.stations
    }

    pub fn render(&self) -> Result<String, fmt::Error> {
        render(&self.registry)
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

impl ResultLabels {
    fn new(result: &str) -> Self {
        ResultLabels {
            result: result.to_owned(),
        }
    }
}

/// Self-instrumentation for probe mode.
#[derive(Debug, Clone)]
pub struct ProbeMetrics {
    probes: Family<ResultLabels, Counter>,
    duration: Histogram,
}

impl ProbeMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let probes = Family::<ResultLabels, Counter>::default();
        let duration = Histogram::new(exponential_buckets(0.01, 2.0, 12));

        let sub = reg.sub_registry_with_prefix("exporter");
        sub.register("probes", "Number of probes by result", probes.clone());
        sub.register_with_unit(
            "probe_duration",
            "Time taken to fetch and decode a feed for a probe",
            Unit::Seconds,
            duration.clone(),
        );

        Self { probes, duration }
    }

    pub fn observe(&self, result: &str, seconds: f64) {
        self.probes.get_or_create(&ResultLabels::new(result)).inc();
        self.duration.observe(seconds);
    }
}

/// Self-instrumentation for poll mode.
#[derive(Debug, Clone)]
pub struct PollMetrics {
    polls: Family<ResultLabels, Counter>,
}

impl PollMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let polls = Family::<ResultLabels, Counter>::default();
        let sub = reg.sub_registry_with_prefix("exporter");
        sub.register("polls", "Number of feed polls by result", polls.clone());

        Self { polls }
    }

    pub fn observe(&self, result: &str) {
        self.polls.get_or_create(&ResultLabels::new(result)).inc();
    }
}
