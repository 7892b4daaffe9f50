use std::{
    task::{Context, Poll},
    time::Duration,
};

use bon::Builder;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response};
use serde::Deserialize;
use snafu::ResultExt;
use tower::Service;

use super::http::{BuildClientSnafu, TransportError};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Settings of the `reqwest` client behind [`ReqwestService`].
#[derive(Clone, Debug, PartialEq, Eq, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Whole-request timeout, body included.
    #[builder(default = default_timeout_secs())]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[builder(default = default_connect_timeout_secs())]
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[builder(into, default = default_user_agent())]
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

const fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// A `tower::Service` over `reqwest::Client`.
///
/// Takes `http::Request<Option<Bytes>>` and answers with the buffered response.
/// Every status is a successful response here; only failures to get one are errors.
#[derive(Clone, Debug)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self { client })
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestService {
    /// A plain `reqwest::Client`, without the configured timeouts.
    fn default() -> Self {
        Self::new_with_client(reqwest::Client::new())
    }
}

impl Service<Request<Option<Bytes>>> for ReqwestService {
    type Response = Response<Bytes>;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Option<Bytes>>) -> Self::Future {
        let (parts, body) = request.into_parts();

        let url = match reqwest::Url::parse(&parts.uri.to_string()) {
            Ok(url) => url,
            Err(error) => {
                let error = TransportError::InvalidRequest {
                    details: format!("invalid URL '{}': {error}", parts.uri),
                };
                return Box::pin(async move { Err(error) });
            }
        };

        let mut builder = self
            .client
            .request(parts.method, url)
            .version(parts.version)
            .headers(parts.headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let send = builder.send();
        Box::pin(async move {
            let response = send.await.map_err(TransportError::from_send)?;

            let mut buffered = Response::builder()
                .status(response.status())
                .version(response.version());
            if let Some(headers) = buffered.headers_mut() {
                headers.extend(response.headers().clone());
            }
            let body = response.bytes().await.map_err(|source| {
                if source.is_timeout() {
                    TransportError::Timeout { source }
                } else {
                    TransportError::Body { source }
                }
            })?;

            buffered
                .body(body)
                .map_err(|error| TransportError::InvalidRequest {
                    details: format!("malformed response: {error}"),
                })
        })
    }
}
