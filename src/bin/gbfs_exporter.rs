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

use axum::Router;
use clap::Parser;
use gbfs_exporter::client::FeedClient;
use gbfs_exporter::http::{self, ProbeContext, RequestContext};
use gbfs_exporter::metrics::{FieldSet, PollMetrics, ProbeMetrics, StationMetrics, NAMESPACE};
use gbfs_exporter::poll::{FailurePolicy, Poller};
use prometheus_client::registry::Registry;
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::watch;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9607);
const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;

#[derive(Debug, Parser)]
#[clap(name = "gbfs_exporter", version = clap::crate_version!())]
struct GbfsExporterApplication {
    /// Poll this GBFS station_status feed in the background and expose it at /metrics
    /// instead of serving probes of arbitrary feeds at /probe.
    #[clap(long)]
    poll_url: Option<Url>,

    /// Set of station metrics to export. Allowed values are 'minimal' (bikes available,
    /// bikes disabled, docks available) and 'full'.
    #[clap(long, default_value_t = FieldSet::Full)]
    metric_set: FieldSet,

    /// Reject feeds with more than this many stations. By default, there is no limit.
    #[clap(long)]
    max_stations: Option<usize>,

    /// What to do when the feed cannot be fetched in poll mode. Allowed values are 'retry'
    /// (keep the previous values and try again later) and 'exit'.
    #[clap(long, default_value_t = FailurePolicy::Retry)]
    poll_failure: FailurePolicy,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Timeout for fetching feeds, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Address to bind to. By default, gbfs_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = GbfsExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let client = FeedClient::new(http_client);
    let mut registry = Registry::with_prefix(NAMESPACE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let router: Router = match opts.poll_url.clone() {
        Some(url) => {
            let stations = StationMetrics::new(&mut registry, opts.metric_set);
            let metrics = PollMetrics::new(&mut registry);
            let poller = Poller::new(client, url, stations, metrics)
                .with_policy(opts.poll_failure)
                .with_max_stations(opts.max_stations);

            tokio::spawn(async move {
                if let Err(e) = poller.run(shutdown_rx).await {
                    tracing::error!(message = "feed polling failed, exiting", error = %e);
                    process::exit(1)
                }
            });

            http::metrics_router(Arc::new(RequestContext::new(registry)))
        }
        None => {
            let metrics = ProbeMetrics::new(&mut registry);
            let probe = ProbeContext::new(client, opts.metric_set, opts.max_stations, metrics);
            http::probe_router(Arc::new(RequestContext::new(registry)), Arc::new(probe))
        }
    };

    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(router.into_make_service());

    let mode = if opts.poll_url.is_some() { "poll" } else { "probe" };
    tracing::info!(
        message = "server started",
        address = %server.local_addr(),
        mode = mode,
        metric_set = %opts.metric_set,
    );

    server
        .with_graceful_shutdown(async move {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }

            let _ = shutdown_tx.send(true);
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
