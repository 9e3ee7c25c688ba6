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
use crate::metrics::{self, FieldSet, MetricSet, ProbeMetrics};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::registry::Registry;
use reqwest::Url;
use std::error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Level};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Registry rendered by the `/metrics` endpoint.
#[derive(Debug)]
pub struct RequestContext {
    registry: Registry,
}

impl RequestContext {
    pub fn new(registry: Registry) -> Self {
        RequestContext { registry }
    }
}

#[derive(Debug)]
pub enum ProbeError {
    MissingTarget,
    InvalidTarget(String, String),
    Fetch(String, ClientError),
    BodyRead(String, ClientError),
    Schema(String, DecodeError),
    Render(fmt::Error),
}

impl ProbeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BodyRead(_, _) | Self::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn result(&self) -> &'static str {
        if self.status().is_server_error() {
            "error"
        } else {
            "bad_request"
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTarget => write!(f, "Target parameter missing"),
            Self::InvalidTarget(target, e) => write!(f, "Invalid target '{}': {}", target, e),
            Self::Fetch(_, e) => write!(f, "HTTP error: {}", e),
            Self::BodyRead(target, e) => write!(f, "Failed to read HTTP body of target '{}': {}", target, e),
            Self::Schema(target, e) => write!(
                f,
                "Could not unmarshal target JSON, target '{}' does not have the expected schema: {}",
                target, e
            ),
            Self::Render(e) => write!(f, "Failed to encode metrics: {}", e),
        }
    }
}

impl error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Fetch(_, e) => Some(e),
            Self::BodyRead(_, e) => Some(e),
            Self::Schema(_, e) => Some(e),
            Self::Render(e) => Some(e),
            _ => None,
        }
    }
}

impl IntoResponse for ProbeError {
    fn into_response(self) -> Response {
        (self.status(), [(CONTENT_TYPE, TEXT_PLAIN)], format!("{}\n", self)).into_response()
    }
}

/// Configuration shared by every probe, read-only once the server is started.
#[derive(Debug)]
pub struct ProbeContext {
    client: FeedClient,
    fields: FieldSet,
    max_stations: Option<usize>,
    metrics: ProbeMetrics,
}

impl ProbeContext {
    pub fn new(client: FeedClient, fields: FieldSet, max_stations: Option<usize>, metrics: ProbeMetrics) -> Self {
        ProbeContext {
            client,
            fields,
            max_stations,
            metrics,
        }
    }

    /// Fetch and decode the target feed and render it using a new `MetricSet`.
    ///
    /// Nothing is written to any metrics unless the feed was fetched and decoded.
    pub async fn probe(&self, target: Option<&str>) -> Result<String, ProbeError> {
        let target = match target.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(ProbeError::MissingTarget),
        };

        let url = Url::parse(target).map_err(|e| ProbeError::InvalidTarget(target.to_owned(), e.to_string()))?;
        let res = self.client.fetch(&url).await.map_err(|e| match e {
            ClientError::BodyRead(_) => ProbeError::BodyRead(target.to_owned(), e),
            _ => ProbeError::Fetch(target.to_owned(), e),
        })?;

        if !res.status.is_success() {
            tracing::warn!(message = "unexpected status from target, decoding anyway", url = %url, status = %res.status);
        }

        let decoded = StationStatusResponse::decode(&res.body)
            .and_then(|r| r.ensure_within(self.max_stations).map(|_| r))
            .map_err(|e| ProbeError::Schema(target.to_owned(), e))?;

        let set = MetricSet::new(self.fields);
        set.stations().response(&decoded);

        tracing::debug!(
            message = "decoded station status",
            url = %url,
            num_stations = decoded.stations.len(),
            ttl = decoded.envelope.ttl,
        );

        set.render().map_err(ProbeError::Render)
    }
}

/// Router for probe mode: `/probe` for feeds and `/metrics` for the exporter itself.
pub fn probe_router(context: Arc<RequestContext>, probe: Arc<ProbeContext>) -> Router {
    Router::new()
        .route("/probe", get(probe_handler))
        .with_state(probe)
        .merge(metrics_routes(context))
        .layer(TraceLayer::new_for_http())
}

/// Router for poll mode: only `/metrics`, rendering the shared registry.
pub fn metrics_router(context: Arc<RequestContext>) -> Router {
    metrics_routes(context).layer(TraceLayer::new_for_http())
}

fn metrics_routes(context: Arc<RequestContext>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(context)
}

async fn probe_handler(
    State(probe): State<Arc<ProbeContext>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ProbeError> {
    let start = Instant::now();
    // Repeated parameters are allowed, the first target wins
    let requested = first_param(&params, "target");
    let target = requested.unwrap_or("");
    let res = probe
        .probe(requested)
        .instrument(tracing::span!(Level::DEBUG, "gbfs_probe", feed = %target))
        .await;

    let elapsed = start.elapsed().as_secs_f64();
    match &res {
        Ok(body) => {
            probe.metrics.observe("success", elapsed);
            tracing::debug!(message = "probe succeeded", feed = %target, num_bytes = body.len());
        }
        Err(e) => {
            probe.metrics.observe(e.result(), elapsed);
            tracing::warn!(message = "probe failed", feed = %target, error = %e);
        }
    }

    res.map(metrics_response)
}

fn first_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

async fn metrics_handler(State(context): State<Arc<RequestContext>>) -> Response {
    match metrics::render(&context.registry) {
        Ok(body) => {
            tracing::debug!(message = "encoded metrics to text format", num_bytes = body.len());
            metrics_response(body)
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn metrics_response(body: String) -> Response {
    (StatusCode::OK, [(CONTENT_TYPE, metrics::CONTENT_TYPE)], body).into_response()
}
