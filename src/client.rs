//! A small JSON API client on top of the adaptive dispatcher.
//!
//! [`Client`] owns a host, a set of default headers and a [`Dispatcher`]. It builds
//! JSON requests, sends them through the rate limiter with 429 retries, and decodes
//! the response body into a success or an error type depending on the status.

use std::sync::Arc;

use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
    header::{self, HeaderName, InvalidHeaderValue},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    Error, Path,
    adaptive_rate::{
        AdaptiveRateLimiter, DispatchError, Dispatcher, DispatcherSettings,
        MAX_ALLOWED_CALLS_PER_SECOND, RequestLogger, TracingLogger, TransportResponse,
        http::TransportError,
        reqwest_integration::{ReqwestService, TransportConfig},
    },
};

pub const HEADER_REQUEST_ID: &str = "x-request-id";

const APPLICATION_JSON: &str = "application/json";

/// Bytes of an undecodable body kept in [`ClientError::Decode`].
const DECODE_SNIPPET_LIMIT: usize = 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("Request invalid: {source}"))]
    InvalidRequest { source: Error },

    #[snafu(display("Failed to encode request body: {source}"))]
    EncodeBody { source: serde_json::Error },

    #[snafu(display("Failed to build request: {source}"))]
    BuildRequest { source: http::Error },

    #[snafu(display("Invalid value for header {name}: {source}"))]
    InvalidHeader {
        name: &'static str,
        source: InvalidHeaderValue,
    },

    #[snafu(display("{source}"))]
    Dispatch { source: DispatchError },

    #[snafu(display("Failed to decode {status} response body: {source}; body: {body:?}"))]
    Decode {
        status: StatusCode,
        body: String,
        source: serde_json::Error,
    },
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Dispatch { source } if source.is_cancelled())
    }
}

/// A decoded response: `T` for statuses below 400, `E` otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded<T, E> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Result<T, E>,
}

impl<T, E> Decoded<T, E> {
    /// Drops the status and headers.
    pub fn into_result(self) -> Result<T, E> {
        self.body
    }
}

/// An API call that knows its own path and headers. The value itself is the JSON body.
pub trait ApiRequest: Serialize {
    /// Path relative to the client host, e.g. `Path::new("/property/:id").with_param("id", "42")`.
    fn path(&self) -> Path;

    fn headers(&self) -> HeaderMap {
        HeaderMap::new()
    }

    /// Sent as `X-Request-ID` when present.
    fn request_id(&self) -> Option<&str> {
        None
    }

    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Joins `uri` onto `base` with exactly one `/` between them.
///
/// `uri` is returned untouched when `base` is empty or `uri` already starts with it.
pub fn uri_with_base(uri: &str, base: &str) -> String {
    if base.is_empty() || uri.starts_with(base) {
        return uri.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        uri.trim_start_matches('/')
    )
}

#[derive(Clone, Debug)]
pub struct Client<T = ReqwestService> {
    host: String,
    headers: HeaderMap,
    dispatcher: Dispatcher<T>,
}

impl Client {
    /// A client over `reqwest` with the default transport settings.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_config(&TransportConfig::default())
    }

    pub fn with_config(config: &TransportConfig) -> Result<Self, TransportError> {
        ReqwestService::new(config).map(Client::from_transport)
    }
}

impl<T> Client<T> {
    /// A client over any transport. The limiter starts at
    /// [`MAX_ALLOWED_CALLS_PER_SECOND`] so 429 feedback has a rate to reduce.
    pub fn from_transport(transport: T) -> Self {
        Self {
            host: String::new(),
            headers: HeaderMap::new(),
            dispatcher: Dispatcher::with_settings(
                transport,
                AdaptiveRateLimiter::with_rate(MAX_ALLOWED_CALLS_PER_SECOND),
                DispatcherSettings::default(),
                Arc::new(TracingLogger),
            ),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn rate_limiter(&self) -> &AdaptiveRateLimiter {
        self.dispatcher.limiter()
    }

    pub fn retries_on_429(&self) -> usize {
        self.dispatcher.max_retries()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Adds a default header, keeping existing values for the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets a default header, replacing existing values for the same name.
    pub fn with_set_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: AdaptiveRateLimiter) -> Self {
        self.dispatcher = self.dispatcher.with_limiter(limiter);
        self
    }

    pub fn with_429_retry(mut self, retries: usize) -> Self {
        self.dispatcher = self.dispatcher.with_max_retries(retries);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.dispatcher = self.dispatcher.with_logger(logger);
        self
    }

    pub fn with_transport<U>(self, transport: U) -> Client<U> {
        Client {
            host: self.host,
            headers: self.headers,
            dispatcher: self.dispatcher.with_transport(transport),
        }
    }

    /// Builds a request against the client host.
    ///
    /// A body is encoded as JSON and marks the request `Content-Type: application/json`.
    pub fn request<B>(
        &self,
        method: Method,
        uri: &str,
        headers: HeaderMap,
        body: Option<&B>,
    ) -> Result<Request<Option<Bytes>>, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let body = body
            .map(|body| serde_json::to_vec(body).map(Bytes::from))
            .transpose()
            .context(EncodeBodySnafu)?;
        let has_body = body.is_some();

        let mut request = Request::builder()
            .method(method)
            .uri(uri_with_base(uri, &self.host))
            .body(body)
            .context(BuildRequestSnafu)?;

        let request_headers = request.headers_mut();
        request_headers.extend(headers);
        if has_body {
            request_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(APPLICATION_JSON),
            );
        }
        Ok(request)
    }

    /// Sends `request` through the limiter, retrying 429s.
    ///
    /// Client default headers are added for every name the request does not set itself.
    pub async fn send(
        &self,
        mut request: Request<Option<Bytes>>,
        cancel: &CancellationToken,
    ) -> Result<T::Response, ClientError>
    where
        T: Service<Request<Option<Bytes>>> + Clone,
        T::Response: TransportResponse,
        T::Error: Into<Error>,
    {
        let request_headers = request.headers_mut();
        for name in self.headers.keys() {
            if !request_headers.contains_key(name) {
                for value in self.headers.get_all(name) {
                    request_headers.append(name.clone(), value.clone());
                }
            }
        }

        self.dispatcher
            .dispatch(request, cancel)
            .await
            .context(DispatchSnafu)
    }

    /// Sends `request` and decodes the body as `R` below 400 or as `E` from 400 on.
    pub async fn send_and_decode<R, E>(
        &self,
        request: Request<Option<Bytes>>,
        cancel: &CancellationToken,
    ) -> Result<Decoded<R, E>, ClientError>
    where
        T: Service<Request<Option<Bytes>>, Response = Response<Bytes>> + Clone,
        T::Error: Into<Error>,
        R: DeserializeOwned,
        E: DeserializeOwned,
    {
        let response = self.send(request, cancel).await?;
        decode(response)
    }

    /// Validates, builds, sends and decodes an [`ApiRequest`].
    pub async fn execute<Q, R, E>(
        &self,
        method: Method,
        request: &Q,
        cancel: &CancellationToken,
    ) -> Result<Decoded<R, E>, ClientError>
    where
        Q: ApiRequest + ?Sized,
        T: Service<Request<Option<Bytes>>, Response = Response<Bytes>> + Clone,
        T::Error: Into<Error>,
        R: DeserializeOwned,
        E: DeserializeOwned,
    {
        request.validate().context(InvalidRequestSnafu)?;

        let mut headers = request.headers();
        if let Some(id) = request.request_id() {
            let value = HeaderValue::from_str(id).context(InvalidHeaderSnafu {
                name: HEADER_REQUEST_ID,
            })?;
            headers.append(HEADER_REQUEST_ID, value);
        }

        let uri = request.path().with_base_url(&self.host).to_string();
        let http_request = self.request(method, &uri, headers, Some(request))?;
        self.send_and_decode(http_request, cancel).await
    }
}

fn decode<R, E>(response: Response<Bytes>) -> Result<Decoded<R, E>, ClientError>
where
    R: DeserializeOwned,
    E: DeserializeOwned,
{
    let (parts, bytes) = response.into_parts();
    let status = parts.status;

    let body = if status.as_u16() >= 400 {
        serde_json::from_slice::<E>(&bytes).map(Err)
    } else {
        serde_json::from_slice::<R>(&bytes).map(Ok)
    };

    match body {
        Ok(body) => Ok(Decoded {
            status,
            headers: parts.headers,
            body,
        }),
        Err(source) => {
            let snippet = &bytes[..bytes.len().min(DECODE_SNIPPET_LIMIT)];
            Err(ClientError::Decode {
                status,
                body: String::from_utf8_lossy(snippet).into_owned(),
                source,
            })
        }
    }
}
