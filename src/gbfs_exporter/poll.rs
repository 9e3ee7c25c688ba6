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

use crate::client::{ClientError, FeedClient};
use crate::feed::{DecodeError, StationStatusResponse};
use crate::metrics::{PollMetrics, StationMetrics};
use reqwest::Url;
use std::collections::HashSet;
use std::error;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Instrument, Level};

pub const MINIMUM_POLL_SLEEP: Duration = Duration::from_secs(10);

/// How long to wait before fetching a feed again: one second past its TTL, but never
/// less than `minimum`.
pub fn poll_pace(ttl: i64, minimum: Duration) -> Duration {
    let ttl_pace = u64::try_from(ttl.saturating_add(1))
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);

    ttl_pace.max(minimum)
}

/// What the poll loop does when a feed can't be fetched or decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the error, keep the previous (stale) values, and try again after the minimum sleep.
    #[default]
    Retry,
    /// Stop polling and return the error.
    Exit,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "exit" => Ok(Self::Exit),
            _ => Err(format!("invalid failure policy '{}', expected 'retry' or 'exit'", s)),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Exit => write!(f, "exit"),
        }
    }
}

#[derive(Debug)]
pub enum PollError {
    Fetch(ClientError),
    Decode(DecodeError),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "unable to fetch feed: {}", e),
            Self::Decode(e) => write!(f, "unable to decode feed: {}", e),
        }
    }
}

impl error::Error for PollError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Fetch(e) => Some(e),
            Self::Decode(e) => Some(e),
        }
    }
}

/// Periodically fetches a single feed and updates shared station gauges.
#[derive(Debug)]
pub struct Poller {
    client: FeedClient,
    url: Url,
    stations: StationMetrics,
    metrics: PollMetrics,
    policy: FailurePolicy,
    max_stations: Option<usize>,
    minimum: Duration,
    seen: HashSet<String>,
}

impl Poller {
    pub fn new(client: FeedClient, url: Url, stations: StationMetrics, metrics: PollMetrics) -> Self {
        Poller {
            client,
            url,
            stations,
            metrics,
            policy: FailurePolicy::default(),
            max_stations: None,
            minimum: MINIMUM_POLL_SLEEP,
            seen: HashSet::new(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_stations(mut self, max_stations: Option<usize>) -> Self {
        self.max_stations = max_stations;
        self
    }

    pub fn with_minimum_sleep(mut self, minimum: Duration) -> Self {
        self.minimum = minimum;
        self
    }

    /// Fetch and decode the feed once, updating station gauges on success.
    ///
    /// Gauges for stations that were present in the previous successful poll but
    /// not this one are removed. Returns how long to wait before polling again.
    pub async fn poll(&mut self) -> Result<Duration, PollError> {
        let res = self.client.fetch(&self.url).await.map_err(PollError::Fetch)?;
        let body = res.into_success().map_err(PollError::Fetch)?;
        let decoded = StationStatusResponse::decode(&body).map_err(PollError::Decode)?;
        decoded.ensure_within(self.max_stations).map_err(PollError::Decode)?;

        self.stations.response(&decoded);

        let current: HashSet<String> = decoded.stations.iter().map(|s| s.id.clone()).collect();
        for id in self.seen.difference(&current) {
            tracing::debug!(message = "removing station no longer in feed", station_id = %id);
            self.stations.forget(id);
        }
        self.seen = current;

        Ok(poll_pace(decoded.envelope.ttl, self.minimum))
    }

    /// Poll until the shutdown channel changes or is closed.
    ///
    /// Returns an error only when the failure policy is `FailurePolicy::Exit`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PollError> {
        tracing::info!(message = "feed polling started", url = %self.url, failure_policy = %self.policy);

        loop {
            let pace = match self.poll().instrument(tracing::span!(Level::DEBUG, "gbfs_poll")).await {
                Ok(pace) => {
                    self.metrics.observe("success");
                    tracing::info!(
                        message = "fetched station status",
                        url = %self.url,
                        num_stations = self.seen.len(),
                        next_poll_secs = pace.as_secs(),
                    );
                    pace
                }
                Err(e) => {
                    self.metrics.observe("error");
                    if self.policy == FailurePolicy::Exit {
                        tracing::error!(message = "failed to poll feed", url = %self.url, error = %e);
                        return Err(e);
                    }

                    tracing::warn!(
                        message = "failed to poll feed, keeping previous values",
                        url = %self.url,
                        error = %e,
                        next_poll_secs = self.minimum.as_secs(),
                    );
                    self.minimum
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pace) => {}
                _ = shutdown.changed() => {
                    tracing::info!(message = "feed polling stopped", url = %self.url);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{poll_pace, FailurePolicy, PollError, Poller, MINIMUM_POLL_SLEEP};
    use crate::client::{ClientError, FeedClient};
    use crate::feed::DecodeError;
    use crate::metrics::{render, FieldSet, PollMetrics, StationMetrics, NAMESPACE};
    use axum::extract::State;
    use axum::routing::get;
    use axum::Router;
    use prometheus_client::registry::Registry;
    use reqwest::{Client, Url};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;

    fn feed(ttl: i64, ids: &[&str]) -> String {
        let stations: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"station_id": "{}", "num_bikes_available": 3, "num_docks_available": 7,
                        "is_installed": 1, "is_renting": 1, "is_returning": 1, "last_reported": 1600000000}}"#,
                    id
                )
            })
            .collect();

        format!(
            r#"{{"last_updated": 1600000000, "ttl": {}, "data": {{"stations": [{}]}}}}"#,
            ttl,
            stations.join(",")
        )
    }

    async fn serve_feed(body: Arc<Mutex<String>>) -> Url {
        async fn handler(State(body): State<Arc<Mutex<String>>>) -> String {
            body.lock().unwrap().clone()
        }

        let app = Router::new().route("/station_status.json", get(handler)).with_state(body);
        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);

        Url::parse(&format!("http://{}/station_status.json", addr)).unwrap()
    }

    fn poller(url: Url) -> (Registry, Poller) {
        let mut reg = Registry::with_prefix(NAMESPACE);
        let stations = StationMetrics::new(&mut reg, FieldSet::Full);
        let metrics = PollMetrics::new(&mut reg);
        let poller = Poller::new(FeedClient::new(Client::new()), url, stations, metrics);
        (reg, poller)
    }

    #[test]
    fn test_poll_pace_uses_minimum() {
        assert_eq!(Duration::from_secs(10), poll_pace(5, MINIMUM_POLL_SLEEP));
        assert_eq!(Duration::from_secs(10), poll_pace(9, MINIMUM_POLL_SLEEP));
    }

    #[test]
    fn test_poll_pace_uses_ttl() {
        assert_eq!(Duration::from_secs(31), poll_pace(30, MINIMUM_POLL_SLEEP));
        assert_eq!(Duration::from_secs(11), poll_pace(10, MINIMUM_POLL_SLEEP));
    }

    #[test]
    fn test_poll_pace_zero_or_negative_ttl() {
        assert_eq!(Duration::from_secs(10), poll_pace(0, MINIMUM_POLL_SLEEP));
        assert_eq!(Duration::from_secs(10), poll_pace(-5, MINIMUM_POLL_SLEEP));
        assert_eq!(Duration::from_secs(10), poll_pace(i64::MIN, MINIMUM_POLL_SLEEP));
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!(FailurePolicy::Retry, "retry".parse().unwrap());
        assert_eq!(FailurePolicy::Exit, "Exit".parse().unwrap());
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[tokio::test]
    async fn test_poll_updates_and_removes_stations() {
        let body = Arc::new(Mutex::new(feed(60, &["1", "2"])));
        let url = serve_feed(body.clone()).await;
        let (reg, mut poller) = poller(url);

        let pace = poller.poll().await.unwrap();
        assert_eq!(Duration::from_secs(61), pace);

        let out = render(&reg).unwrap();
        assert!(out.contains(r#"gbfs_bikes_available{station_id="1"} 3"#));
        assert!(out.contains(r#"gbfs_bikes_available{station_id="2"} 3"#));

        *body.lock().unwrap() = feed(5, &["2"]);
        let pace = poller.poll().await.unwrap();
        assert_eq!(MINIMUM_POLL_SLEEP, pace);

        let out = render(&reg).unwrap();
        assert!(!out.contains(r#"station_id="1""#));
        assert!(out.contains(r#"gbfs_bikes_available{station_id="2"} 3"#));
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_previous_values() {
        let body = Arc::new(Mutex::new(feed(60, &["1"])));
        let url = serve_feed(body.clone()).await;
        let (reg, mut poller) = poller(url);

        poller.poll().await.unwrap();

        *body.lock().unwrap() = "<html>down for maintenance</html>".to_owned();
        let res = poller.poll().await;
        assert!(matches!(res, Err(PollError::Decode(DecodeError::Schema(_)))));

        let out = render(&reg).unwrap();
        assert!(out.contains(r#"gbfs_bikes_available{station_id="1"} 3"#));
    }

    #[tokio::test]
    async fn test_poll_too_many_stations() {
        let body = Arc::new(Mutex::new(feed(60, &["1", "2", "3"])));
        let url = serve_feed(body).await;
        let (reg, poller) = poller(url);
        let mut poller = poller.with_max_stations(Some(2));

        let res = poller.poll().await;
        assert!(matches!(
            res,
            Err(PollError::Decode(DecodeError::TooManyStations { count: 3, max: 2 }))
        ));

        let out = render(&reg).unwrap();
        assert!(!out.contains("station_id="));
    }

    #[tokio::test]
    async fn test_poll_unexpected_status() {
        let body = Arc::new(Mutex::new(feed(60, &["1"])));
        let url = serve_feed(body).await;
        let missing = url.join("/missing.json").unwrap();
        let (_reg, mut poller) = poller(missing);

        let res = poller.poll().await;
        assert!(matches!(res, Err(PollError::Fetch(ClientError::Status(_, _)))));
    }

    #[tokio::test]
    async fn test_run_exit_policy_returns_error() {
        let url = Url::parse("http://127.0.0.1:1/station_status.json").unwrap();
        let (_reg, poller) = poller(url);
        let (_tx, rx) = watch::channel(false);

        let res = poller.with_policy(FailurePolicy::Exit).run(rx).await;
        assert!(matches!(res, Err(PollError::Fetch(ClientError::Network(_)))));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let body = Arc::new(Mutex::new(feed(0, &["1"])));
        let url = serve_feed(body).await;
        let (reg, poller) = poller(url);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(poller.with_minimum_sleep(Duration::from_secs(60)).run(rx));

        let mut polled = false;
        for _ in 0..100 {
            if render(&reg).unwrap().contains(r#"gbfs_exporter_polls_total{result="success"} 1"#) {
                polled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(polled);
        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
