//! Client for the RPM property API, built on [`adaptive_rate_client::Client`].

use std::{fmt, sync::Arc};

use adaptive_rate_client::{
    AdaptiveRateLimiter, ApiRequest, Client, ClientError, Error as CrateError, Path,
    adaptive_rate::{
        RequestLogger,
        reqwest_integration::{ReqwestService, TransportConfig},
    },
};
use bytes::Bytes;
use http::{
    HeaderValue, Method, Request, Response, StatusCode,
    header::{HeaderName, InvalidHeaderValue},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::debug;

const HEADER_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const HEADER_API_SECRET: HeaderName = HeaderName::from_static("x-api-secret");

const PATH_PROPERTY: &str = "/property/:property_id";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RpmError {
    #[snafu(display("Failed to create HTTP transport: {source}"))]
    Transport {
        source: adaptive_rate_client::adaptive_rate::http::TransportError,
    },

    #[snafu(display("Invalid credentials: {source}"))]
    InvalidCredentials { source: InvalidHeaderValue },

    #[snafu(display("{source}"))]
    Client { source: ClientError },

    /// The API answered with a status of 400 or above.
    #[snafu(display("{error} (HTTP {status})"))]
    Api { status: StatusCode, error: ApiError },
}

/// Request validation failures.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ValidationError {
    #[snafu(display("missing {field}"))]
    MissingField { field: &'static str },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

/// `POST /property/:property_id` with the address as body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorePropertyRequest {
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub request_id: Option<String>,
    pub property: Address,
}

impl StorePropertyRequest {
    pub fn new(property: Property) -> Self {
        Self {
            id: property.id,
            request_id: None,
            property: Address {
                street: property.street,
                city: property.city,
                state: property.state,
                zip: property.zip,
            },
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn check(&self) -> Result<(), ValidationError> {
        let address = &self.property;
        for (field, value) in [
            ("street", &address.street),
            ("city", &address.city),
            ("state", &address.state),
            ("zip", &address.zip),
        ] {
            if value.is_empty() {
                return MissingFieldSnafu { field }.fail();
            }
        }
        Ok(())
    }
}

impl ApiRequest for StorePropertyRequest {
    fn path(&self) -> Path {
        Path::new(PATH_PROPERTY).with_param("property_id", &self.id)
    }

    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    fn validate(&self) -> Result<(), CrateError> {
        self.check().map_err(Into::into)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StorePropertyResponse {
    pub property: Property,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error: ApiError,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApiError {
    pub code: i64,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPM error: {} ({}) {}", self.kind, self.code, self.message)
    }
}

#[derive(Clone, Debug)]
pub struct RpmClient<T = ReqwestService> {
    client: Client<T>,
}

impl RpmClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RpmError> {
        let client = Client::with_config(&TransportConfig::default()).context(TransportSnafu)?;
        Ok(Self::from_client(client.with_host(base_url)))
    }
}

impl<T> RpmClient<T> {
    pub fn from_client(client: Client<T>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client<T> {
        &self.client
    }

    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        Self::from_client(self.client.with_host(base_url))
    }

    pub fn with_429_retry(self, retries: usize) -> Self {
        Self::from_client(self.client.with_429_retry(retries))
    }

    pub fn with_rate_limiter(self, limiter: AdaptiveRateLimiter) -> Self {
        Self::from_client(self.client.with_rate_limiter(limiter))
    }

    pub fn with_logger(self, logger: Arc<dyn RequestLogger>) -> Self {
        Self::from_client(self.client.with_logger(logger))
    }

    pub fn with_credentials(self, key: &str, secret: &str) -> Result<Self, RpmError> {
        let key = HeaderValue::from_str(key).context(InvalidCredentialsSnafu)?;
        let secret = HeaderValue::from_str(secret).context(InvalidCredentialsSnafu)?;
        Ok(Self::from_client(
            self.client
                .with_set_header(HEADER_API_KEY, key)
                .with_set_header(HEADER_API_SECRET, secret),
        ))
    }

    /// Stores a property. A status of 400 or above is returned as [`RpmError::Api`].
    pub async fn store_property(
        &self,
        request: &StorePropertyRequest,
        cancel: &CancellationToken,
    ) -> Result<Property, RpmError>
    where
        T: Service<Request<Option<Bytes>>, Response = Response<Bytes>> + Clone,
        T::Error: Into<CrateError>,
    {
        let decoded = self
            .client
            .execute::<_, StorePropertyResponse, ErrorResponse>(Method::POST, request, cancel)
            .await
            .context(ClientSnafu)?;

        match decoded.body {
            Ok(response) => {
                debug!(message = "Property stored.", id = %response.property.id);
                Ok(response.property)
            }
            Err(response) => ApiSnafu {
                status: decoded.status,
                error: response.error,
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use tower::service_fn;

    use super::*;

    type Sent = Arc<Mutex<Vec<Request<Option<Bytes>>>>>;

    fn transport(
        responses: Vec<(StatusCode, &'static str)>,
        sent: Sent,
    ) -> impl Service<
        Request<Option<Bytes>>,
        Response = Response<Bytes>,
        Error = Infallible,
        Future = impl Future<Output = Result<Response<Bytes>, Infallible>> + Send,
    > + Clone {
        let responses = Arc::new(responses);
        let calls = Arc::new(AtomicUsize::new(0));
        service_fn(move |request: Request<Option<Bytes>>| {
            sent.lock().unwrap().push(request);
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let (status, body) = responses[n.min(responses.len() - 1)];
            let mut response = Response::new(Bytes::from_static(body.as_bytes()));
            *response.status_mut() = status;
            async move { Ok::<_, Infallible>(response) }
        })
    }

    fn property() -> Property {
        Property {
            id: "42".to_string(),
            street: "1 Main St".to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            zip: "62701".to_string(),
        }
    }

    fn rpm<S>(transport: S) -> RpmClient<S> {
        RpmClient::from_client(Client::from_transport(transport))
            .with_base_url("https://rpm.example.com")
            .with_credentials("key", "secret")
            .unwrap()
    }

    #[test]
    fn validation_names_the_missing_field() {
        let mut request = StorePropertyRequest::new(property());
        assert_eq!(request.check(), Ok(()));

        request.property.city.clear();
        assert_eq!(
            request.check(),
            Err(ValidationError::MissingField { field: "city" })
        );
        assert_eq!(request.validate().unwrap_err().to_string(), "missing city");
    }

    #[test]
    fn request_body_omits_path_fields() {
        let request = StorePropertyRequest::new(property()).with_request_id("r-1");
        assert_eq!(request.path().to_string(), "/property/42");
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "property": {
                    "street": "1 Main St",
                    "city": "Springfield",
                    "state": "IL",
                    "zip": "62701"
                }
            })
        );
    }

    #[tokio::test]
    async fn store_property_posts_with_credentials() {
        let sent = Sent::default();
        let client = rpm(transport(
            vec![(
                StatusCode::OK,
                r#"{"property":{"id":"42","street":"1 Main St","city":"Springfield","state":"IL","zip":"62701"}}"#,
            )],
            Arc::clone(&sent),
        ));

        let request = StorePropertyRequest::new(property()).with_request_id("r-1");
        let stored = client
            .store_property(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stored, property());

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method(), Method::POST);
        assert_eq!(sent[0].uri(), "https://rpm.example.com/property/42");
        assert_eq!(sent[0].headers()["x-api-key"], "key");
        assert_eq!(sent[0].headers()["x-api-secret"], "secret");
        assert_eq!(sent[0].headers()["x-request-id"], "r-1");
    }

    #[tokio::test]
    async fn property_id_stays_in_its_segment() {
        let sent = Sent::default();
        let client = rpm(transport(
            vec![(
                StatusCode::OK,
                r#"{"property":{"id":"42?admin=1#x","street":"1 Main St","city":"Springfield","state":"IL","zip":"62701"}}"#,
            )],
            Arc::clone(&sent),
        ));

        let request = StorePropertyRequest::new(Property {
            id: "42?admin=1#x".to_string(),
            ..property()
        });
        client
            .store_property(&request, &CancellationToken::new())
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        let uri = sent[0].uri();
        assert_eq!(uri.path(), "/property/42%3Fadmin%3D1%23x");
        assert_eq!(uri.query(), None);
    }

    #[tokio::test]
    async fn api_errors_are_mapped() {
        let client = rpm(transport(
            vec![(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"error":{"code":1001,"message":"zip is invalid","type":"validation"}}"#,
            )],
            Sent::default(),
        ));

        let error = client
            .store_property(
                &StorePropertyRequest::new(property()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match &error {
            RpmError::Api { status, error } => {
                assert_eq!(*status, StatusCode::UNPROCESSABLE_ENTITY);
                assert_eq!(error.code, 1001);
                assert_eq!(error.kind, "validation");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            error.to_string(),
            "RPM error: validation (1001) zip is invalid (HTTP 422 Unprocessable Entity)"
        );
    }

    #[tokio::test]
    async fn invalid_request_is_not_sent() {
        let sent = Sent::default();
        let client = rpm(transport(vec![(StatusCode::OK, "{}")], Arc::clone(&sent)));

        let mut request = StorePropertyRequest::new(property());
        request.property.street.clear();
        let error = client
            .store_property(&request, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            RpmError::Client {
                source: ClientError::InvalidRequest { .. }
            }
        ));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn credentials_must_be_valid_header_values() {
        let result = RpmClient::from_client(Client::from_transport(()))
            .with_credentials("bad\nkey", "secret");
        assert!(matches!(result, Err(RpmError::InvalidCredentials { .. })));
    }
}
