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

//! Prometheus metrics exporter for GBFS bike share feeds
//!
//! ## Features
//!
//! `gbfs_exporter` fetches the [GBFS] `station_status` feed of a bike share system and emits
//! the status of each station as Prometheus metrics. It runs in one of two modes:
//!
//! * **Probe mode** (default): the feed to fetch is supplied by Prometheus on each scrape
//!   of `/probe?target=$FEED_URL`, in the same manner as the blackbox exporter. Each probe
//!   uses its own set of metrics so concurrent probes of different feeds never mix.
//! * **Poll mode** (`--poll-url $FEED_URL`): a single feed is fetched in the background,
//!   at an interval derived from the `ttl` the feed declares, and exposed at `/metrics`.
//!
//! The following metrics are emitted, each with a `station_id` label. Only the first
//! three are emitted when running with `--metric-set minimal`.
//!
//! * `gbfs_bikes_available` - Number of bikes available for rental.
//! * `gbfs_bikes_disabled` - Number of disabled bikes.
//! * `gbfs_docks_available` - Number of docks accepting bike returns.
//! * `gbfs_docks_disabled` - Number of empty but disabled docks.
//! * `gbfs_installed` - 1 if the station is installed, 0 otherwise.
//! * `gbfs_renting` - 1 if the station is renting bikes, 0 otherwise.
//! * `gbfs_returning` - 1 if the station is accepting returns, 0 otherwise.
//! * `gbfs_last_reported_timestamp_seconds` - Last time the station reported, in unixtime.
//!
//! The full metric set also includes `gbfs_feed_last_updated_timestamp_seconds` and
//! `gbfs_feed_ttl_seconds` for the feed itself.
//!
//! [GBFS]: https://github.com/MobilityData/gbfs
//!
//! ## Build
//!
//! `gbfs_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Picking a feed
//!
//! Every GBFS system publishes a `gbfs.json` discovery file that lists its feeds. The
//! `station_status` entry in it is the URL that `gbfs_exporter` needs.
//!
//! ```text
//! curl -sS 'https://gbfs.example.com/gbfs.json' | jq '.data.en.feeds'
//! ```
//!
//! ### Run
//!
//! ```text
//! ./gbfs_exporter
//! ./gbfs_exporter --poll-url https://gbfs.example.com/station_status.json
//! ```
//!
//! ### Prometheus
//!
//! Metrics are exposed on port `9607`. In probe mode, configure Prometheus to pass the
//! feed URL as the `target` parameter, as described by the example below.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: gbfs
//!   metrics_path: /probe
//!   static_configs:
//!   - targets: ['https://gbfs.example.com/station_status.json']
//!   relabel_configs:
//!   - source_labels: [__address__]
//!     target_label: __param_target
//!   - source_labels: [__param_target]
//!     target_label: instance
//!   - target_label: __address__
//!     replacement: 'example:9607'
//! ```
//!

pub mod client;
pub mod feed;
pub mod http;
pub mod metrics;
pub mod poll;
