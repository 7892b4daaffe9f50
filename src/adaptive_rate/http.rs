use snafu::Snafu;

/// Failures of the HTTP transport itself. A response with any status, 429
/// included, is not an error at this level.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("Invalid request: {details}"))]
    InvalidRequest { details: String },

    #[snafu(display("Failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("Request timed out: {source}"))]
    Timeout { source: reqwest::Error },

    #[snafu(display("Failed to connect: {source}"))]
    Connect { source: reqwest::Error },

    #[snafu(display("Failed to read response body: {source}"))]
    Body { source: reqwest::Error },

    #[snafu(display("HTTP request failed: {source}"))]
    Request { source: reqwest::Error },
}

impl TransportError {
    /// Classifies a `reqwest` failure from sending a request.
    pub(crate) fn from_send(source: reqwest::Error) -> Self {
        if source.is_timeout() {
            TransportError::Timeout { source }
        } else if source.is_connect() {
            TransportError::Connect { source }
        } else {
            TransportError::Request { source }
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}
