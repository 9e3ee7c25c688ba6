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

use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use std::error;
use std::fmt;

#[derive(Debug)]
pub enum ClientError {
    /// The feed could not be reached: DNS, connection, or timeout.
    Network(reqwest::Error),
    /// The feed answered but the body could not be read in full.
    BodyRead(reqwest::Error),
    Status(StatusCode, Url),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(e) => write!(f, "{}", e),
            Self::BodyRead(e) => write!(f, "unable to read body: {}", e),
            Self::Status(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Network(e) => Some(e),
            Self::BodyRead(e) => Some(e),
            _ => None,
        }
    }
}

/// Raw result of fetching a feed.
///
/// Non-success statuses still carry the body so that callers can decide
/// whether it is worth decoding.
#[derive(Debug)]
pub struct FeedResponse {
    pub url: Url,
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl FeedResponse {
    /// Return the body if the status was a success, `ClientError::Status` otherwise.
    pub fn into_success(self) -> Result<Vec<u8>, ClientError> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(ClientError::Status(self.status, self.url))
        }
    }
}

/// Fetches GBFS feeds over HTTP. No retries are made here.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: Client,
}

impl FeedClient {
    const USER_AGENT: &'static str = concat!("gbfs_exporter/", env!("CARGO_PKG_VERSION"));
    const JSON_RESPONSE: &'static str = "application/json";

    /// Create a new client. Any timeout should be configured on the provided `Client`.
    pub fn new(client: Client) -> Self {
        FeedClient { client }
    }

    pub async fn fetch(&self, url: &Url) -> Result<FeedResponse, ClientError> {
        tracing::debug!(message = "making feed request", url = %url);

        let res = self
            .client
            .get(url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(ClientError::Network)?;

        let status = res.status();
        // The client timeout covers reading the body too, and a timeout is a network failure
        let body = res.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Network(e)
            } else {
                ClientError::BodyRead(e)
            }
        })?;

        Ok(FeedResponse {
            url: url.clone(),
            status,
            body: body.to_vec(),
        })
    }
}
