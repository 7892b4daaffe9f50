//! Request/response logging for dispatched calls.
//!
//! The dispatcher hands one [`ExchangeRecord`] to a [`RequestLogger`] after every
//! transport attempt and when a call is cancelled while throttled.

use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use tracing::Level;

const REDACTED: &str = "[redacted]";

/// Bytes of a response body kept in an [`ExchangeRecord`].
pub const BODY_SNIPPET_LIMIT: usize = 1024;

const SENSITIVE_HEADERS: [&str; 5] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "x-api-key",
    "x-api-secret",
];

/// Receives one record per terminal attempt.
pub trait RequestLogger: Send + Sync + 'static {
    fn record(&self, level: Level, message: &str, record: &ExchangeRecord);
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExchangeOutcome {
    /// The transport produced a response, whatever its status. `body` holds the
    /// start of a buffered body.
    Response {
        status: StatusCode,
        headers: HeaderMap,
        body: Option<String>,
    },
    /// The transport failed to produce a response.
    Error { message: String },
    /// The call was cancelled before it was sent.
    Cancelled,
}

/// What was sent and what came back for one attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeRecord {
    pub method: Method,
    pub uri: Uri,
    /// Request headers with credentials redacted.
    pub request_headers: HeaderMap,
    /// 1-based transport attempt; 0 when cancelled before the first send.
    pub attempt: usize,
    pub outcome: ExchangeOutcome,
}

impl ExchangeRecord {
    pub fn new(
        method: Method,
        uri: Uri,
        request_headers: &HeaderMap,
        attempt: usize,
        outcome: ExchangeOutcome,
    ) -> Self {
        Self {
            method,
            uri,
            request_headers: redact(request_headers),
            attempt,
            outcome,
        }
    }

    /// Info below 400, warn below 500, error from 500 and for transport failures.
    /// A 429 is an expected, handled condition and stays at info.
    pub fn level(&self) -> Level {
        match &self.outcome {
            ExchangeOutcome::Response { status, .. } => level_for_status(*status),
            ExchangeOutcome::Error { .. } => Level::ERROR,
            ExchangeOutcome::Cancelled => Level::WARN,
        }
    }

    /// `[RQ/RS] POST /path 200 OK`
    pub fn message(&self) -> String {
        let prefix = format!("[RQ/RS] {} {}", self.method, self.uri.path());
        match &self.outcome {
            ExchangeOutcome::Response { status, .. } => format!("{prefix} {status}"),
            ExchangeOutcome::Error { .. } => format!("{prefix} failed"),
            ExchangeOutcome::Cancelled => format!("{prefix} cancelled"),
        }
    }
}

/// Lossy UTF-8 of at most [`BODY_SNIPPET_LIMIT`] bytes; `None` for an empty body.
pub fn body_snippet(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let snippet = &body[..body.len().min(BODY_SNIPPET_LIMIT)];
    Some(String::from_utf8_lossy(snippet).into_owned())
}

pub fn level_for_status(status: StatusCode) -> Level {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() < 400 {
        Level::INFO
    } else if status.as_u16() < 500 {
        Level::WARN
    } else {
        Level::ERROR
    }
}

fn redact(headers: &HeaderMap) -> HeaderMap {
    let mut redacted = headers.clone();
    for name in SENSITIVE_HEADERS {
        if let header::Entry::Occupied(mut entry) = redacted.entry(name) {
            entry.insert(HeaderValue::from_static(REDACTED));
        }
    }
    redacted
}

/// Writes exchanges as `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl RequestLogger for TracingLogger {
    fn record(&self, level: Level, message: &str, record: &ExchangeRecord) {
        macro_rules! exchange_event {
            ($level:expr) => {
                match &record.outcome {
                    ExchangeOutcome::Response {
                        status,
                        headers,
                        body,
                    } => event!(
                        target: "adaptive_rate::exchange",
                        $level,
                        method = %record.method,
                        uri = %record.uri,
                        attempt = record.attempt,
                        status = status.as_u16(),
                        request_headers = ?record.request_headers,
                        response_headers = ?headers,
                        response_body = body.as_deref(),
                        "{message}"
                    ),
                    ExchangeOutcome::Error { message: error } => event!(
                        target: "adaptive_rate::exchange",
                        $level,
                        method = %record.method,
                        uri = %record.uri,
                        attempt = record.attempt,
                        request_headers = ?record.request_headers,
                        %error,
                        "{message}"
                    ),
                    ExchangeOutcome::Cancelled => event!(
                        target: "adaptive_rate::exchange",
                        $level,
                        method = %record.method,
                        uri = %record.uri,
                        attempt = record.attempt,
                        request_headers = ?record.request_headers,
                        "{message}"
                    ),
                }
            };
        }

        if level == Level::ERROR {
            exchange_event!(Level::ERROR);
        } else if level == Level::WARN {
            exchange_event!(Level::WARN);
        } else if level == Level::INFO {
            exchange_event!(Level::INFO);
        } else if level == Level::DEBUG {
            exchange_event!(Level::DEBUG);
        } else {
            exchange_event!(Level::TRACE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: StatusCode) -> ExchangeOutcome {
        ExchangeOutcome::Response {
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    fn record(outcome: ExchangeOutcome) -> ExchangeRecord {
        ExchangeRecord::new(
            Method::POST,
            Uri::from_static("https://api.example.com/foo/bar?x=1"),
            &HeaderMap::new(),
            1,
            outcome,
        )
    }

    #[test]
    fn level_is_graded_by_status() {
        assert_eq!(record(response(StatusCode::OK)).level(), Level::INFO);
        assert_eq!(record(response(StatusCode::FOUND)).level(), Level::INFO);
        assert_eq!(record(response(StatusCode::NOT_FOUND)).level(), Level::WARN);
        assert_eq!(
            record(response(StatusCode::TOO_MANY_REQUESTS)).level(),
            Level::INFO
        );
        assert_eq!(
            record(response(StatusCode::BAD_GATEWAY)).level(),
            Level::ERROR
        );
        assert_eq!(
            record(ExchangeOutcome::Error {
                message: "connection reset".into()
            })
            .level(),
            Level::ERROR
        );
        assert_eq!(record(ExchangeOutcome::Cancelled).level(), Level::WARN);
    }

    #[test]
    fn message_names_method_path_and_status() {
        assert_eq!(
            record(response(StatusCode::TOO_MANY_REQUESTS)).message(),
            "[RQ/RS] POST /foo/bar 429 Too Many Requests"
        );
        assert_eq!(
            record(ExchangeOutcome::Cancelled).message(),
            "[RQ/RS] POST /foo/bar cancelled"
        );
    }

    #[test]
    fn credentials_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert("x-api-key", HeaderValue::from_static("key"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));

        let record = ExchangeRecord::new(
            Method::GET,
            Uri::from_static("/"),
            &headers,
            1,
            response(StatusCode::OK),
        );
        assert_eq!(record.request_headers[header::AUTHORIZATION], REDACTED);
        assert_eq!(record.request_headers["x-api-key"], REDACTED);
        assert_eq!(record.request_headers["x-trace"], "abc");
    }

    #[test]
    fn body_snippet_is_bounded() {
        assert_eq!(body_snippet(b""), None);
        assert_eq!(
            body_snippet(br#"{"error":"bad zip"}"#).as_deref(),
            Some(r#"{"error":"bad zip"}"#)
        );

        let long = "y".repeat(3 * BODY_SNIPPET_LIMIT);
        assert_eq!(
            body_snippet(long.as_bytes()).map(|snippet| snippet.len()),
            Some(BODY_SNIPPET_LIMIT)
        );
    }

    #[test]
    fn tracing_logger_accepts_every_level() {
        let logger = TracingLogger;
        for outcome in [
            response(StatusCode::OK),
            response(StatusCode::BAD_REQUEST),
            response(StatusCode::SERVICE_UNAVAILABLE),
            ExchangeOutcome::Response {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                headers: HeaderMap::new(),
                body: Some("zip is invalid".into()),
            },
            ExchangeOutcome::Error {
                message: "timed out".into(),
            },
            ExchangeOutcome::Cancelled,
        ] {
            let record = record(outcome);
            logger.record(record.level(), &record.message(), &record);
        }
        logger.record(Level::DEBUG, "debug", &record(response(StatusCode::OK)));
        logger.record(Level::TRACE, "trace", &record(response(StatusCode::OK)));
    }
}
