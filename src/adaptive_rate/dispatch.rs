use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response, StatusCode};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service, ServiceExt};

use super::{
    AdaptiveRateLimiter, DispatcherSettings, LimiterError,
    internal_event::{InternalEvent, OverloadReceived},
    logging::{ExchangeOutcome, ExchangeRecord, RequestLogger, TracingLogger, body_snippet},
};
use crate::Error;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DispatchError {
    #[snafu(display("Dispatch cancelled: {source}"))]
    Cancelled { source: LimiterError },

    /// The transport failed; never retried by the dispatcher.
    #[snafu(display("Transport failed: {source}"))]
    Transport { source: Error },
}

impl DispatchError {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled { .. })
    }
}

/// A transport response the dispatcher can classify and log.
pub trait TransportResponse {
    fn status(&self) -> StatusCode;
    fn headers(&self) -> &HeaderMap;

    /// The buffered body, if the response holds one.
    fn body(&self) -> Option<&[u8]> {
        None
    }
}

impl<B: AsRef<[u8]>> TransportResponse for Response<B> {
    fn status(&self) -> StatusCode {
        Response::status(self)
    }

    fn headers(&self) -> &HeaderMap {
        Response::headers(self)
    }

    fn body(&self) -> Option<&[u8]> {
        Some(AsRef::<[u8]>::as_ref(Response::body(self)))
    }
}

/// 429 is the only status that triggers retry and rate feedback.
pub fn is_overload(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Start,
    /// Waiting on the rate limiter.
    Throttled,
    /// Handed to the transport.
    Sent,
    /// The transport answered 429.
    Overloaded,
    Done,
    Cancelled,
}

impl DispatchState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, DispatchState::Done | DispatchState::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Ask the limiter for capacity: the first attempt, or a retry after a 429.
    Acquire,
    /// The limiter admitted the call.
    Admitted,
    /// The caller cancelled while the call was throttled.
    WaitCancelled,
    /// The transport returned a response with this status.
    Responded(StatusCode),
    /// The transport returned an error.
    TransportFailed,
}

/// Retry bookkeeping for one logical call.
///
/// ```text
/// Start --Acquire--> Throttled --Admitted--> Sent --Responded(429)--> Overloaded
///                        |                     |                         |
///                  WaitCancelled      Responded(other)             Acquire: retries left?
///                        v            TransportFailed               yes -> Throttled
///                    Cancelled                 v                    no  -> Done
///                                            Done
/// ```
///
/// Events that do not apply to the current state leave it unchanged, so terminal
/// states absorb everything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchAttempt {
    state: DispatchState,
    attempt_count: usize,
    max_retries: usize,
}

impl DispatchAttempt {
    pub const fn new(max_retries: usize) -> Self {
        Self {
            state: DispatchState::Start,
            attempt_count: 0,
            max_retries,
        }
    }

    pub const fn state(&self) -> DispatchState {
        self.state
    }

    /// Transport calls made so far.
    pub const fn attempt_count(&self) -> usize {
        self.attempt_count
    }

    pub const fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn advance(&mut self, event: DispatchEvent) -> DispatchState {
        use DispatchEvent::*;
        use DispatchState::*;

        let next = match (self.state, event) {
            (Start, Acquire) => Throttled,
            (Overloaded, Acquire) if self.attempt_count <= self.max_retries => Throttled,
            (Overloaded, Acquire) => Done,
            (Throttled, Admitted) => {
                self.attempt_count += 1;
                Sent
            }
            (Throttled, WaitCancelled) => Cancelled,
            (Sent, Responded(status)) if is_overload(status) => Overloaded,
            (Sent, Responded(_)) | (Sent, TransportFailed) => Done,
            (state, event) => {
                trace!(message = "Ignoring dispatch event.", ?state, ?event);
                state
            }
        };
        self.state = next;
        next
    }
}

/// Sends requests through a transport behind an [`AdaptiveRateLimiter`].
///
/// Every attempt waits on the limiter first. A 429 slows the limiter down and, while
/// retries remain, goes back through the limiter; the backoff comes from the reduced
/// rate rather than from a separate delay schedule. After the last retry the 429
/// response itself is returned.
#[derive(Clone)]
pub struct Dispatcher<S> {
    transport: S,
    limiter: AdaptiveRateLimiter,
    max_retries: usize,
    logger: Arc<dyn RequestLogger>,
}

impl<S: fmt::Debug> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &self.transport)
            .field("limiter", &self.limiter)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<S> Dispatcher<S> {
    /// A dispatcher with the default retry count and a [`TracingLogger`].
    pub fn new(transport: S, limiter: AdaptiveRateLimiter) -> Self {
        Self::with_settings(
            transport,
            limiter,
            DispatcherSettings::default(),
            Arc::new(TracingLogger),
        )
    }

    pub fn with_settings(
        transport: S,
        limiter: AdaptiveRateLimiter,
        settings: DispatcherSettings,
        logger: Arc<dyn RequestLogger>,
    ) -> Self {
        Self {
            transport,
            limiter,
            max_retries: settings.retries_on_429,
            logger,
        }
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn transport(&self) -> &S {
        &self.transport
    }

    pub fn with_limiter(mut self, limiter: AdaptiveRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_transport<T>(self, transport: T) -> Dispatcher<T> {
        Dispatcher {
            transport,
            limiter: self.limiter,
            max_retries: self.max_retries,
            logger: self.logger,
        }
    }

    fn log_exchange<B>(&self, request: &Request<B>, attempt: usize, outcome: ExchangeOutcome) {
        let record = ExchangeRecord::new(
            request.method().clone(),
            request.uri().clone(),
            request.headers(),
            attempt,
            outcome,
        );
        self.logger.record(record.level(), &record.message(), &record);
    }
}

impl<S> Dispatcher<S> {
    /// Runs one logical call to completion.
    ///
    /// Returns the first non-429 response, or the last 429 once retries are used
    /// up. Transport errors are returned immediately. `cancel` only interrupts
    /// waiting on the limiter; a request already handed to the transport runs to
    /// completion.
    pub async fn dispatch<B>(
        &self,
        request: Request<B>,
        cancel: &CancellationToken,
    ) -> Result<S::Response, DispatchError>
    where
        S: Service<Request<B>> + Clone,
        S::Response: TransportResponse,
        S::Error: Into<Error>,
        B: Clone,
    {
        let mut attempt = DispatchAttempt::new(self.max_retries);
        let mut transport = self.transport.clone();
        attempt.advance(DispatchEvent::Acquire);

        loop {
            debug_assert_eq!(attempt.state(), DispatchState::Throttled);
            if let Err(source) = self.limiter.wait(cancel).await {
                attempt.advance(DispatchEvent::WaitCancelled);
                self.log_exchange(&request, attempt.attempt_count(), ExchangeOutcome::Cancelled);
                return Err(DispatchError::Cancelled { source });
            }
            attempt.advance(DispatchEvent::Admitted);

            let response = match call(&mut transport, duplicate(&request)).await {
                Ok(response) => response,
                Err(source) => {
                    attempt.advance(DispatchEvent::TransportFailed);
                    self.log_exchange(
                        &request,
                        attempt.attempt_count(),
                        ExchangeOutcome::Error {
                            message: source.to_string(),
                        },
                    );
                    return Err(DispatchError::Transport { source });
                }
            };

            let status = response.status();
            self.log_exchange(
                &request,
                attempt.attempt_count(),
                ExchangeOutcome::Response {
                    status,
                    headers: response.headers().clone(),
                    body: response.body().and_then(body_snippet),
                },
            );

            if attempt.advance(DispatchEvent::Responded(status)) != DispatchState::Overloaded {
                return Ok(response);
            }

            OverloadReceived {
                attempt: attempt.attempt_count(),
                max_retries: attempt.max_retries(),
            }
            .emit();
            self.limiter.slow_down();

            if attempt.advance(DispatchEvent::Acquire) == DispatchState::Done {
                debug!(
                    message = "Retries on 429 exhausted; returning the overload response.",
                    attempts = attempt.attempt_count(),
                );
                return Ok(response);
            }
        }
    }
}

async fn call<S, B>(transport: &mut S, request: Request<B>) -> Result<S::Response, Error>
where
    S: Service<Request<B>>,
    S::Error: Into<Error>,
{
    let ready = transport.ready().await.map_err(Into::into)?;
    ready.call(request).await.map_err(Into::into)
}

/// Copies everything but the extensions, which are not `Clone`.
fn duplicate<B: Clone>(request: &Request<B>) -> Request<B> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

impl<S, B> Service<Request<B>> for Dispatcher<S>
where
    S: Service<Request<B>> + Clone + Send + Sync + 'static,
    S::Response: TransportResponse + Send + 'static,
    S::Error: Into<Error>,
    S::Future: Send,
    B: Clone + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    // Capacity is acquired inside the call, so the dispatcher is always ready.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move {
            let cancel = CancellationToken::new();
            dispatcher.dispatch(request, &cancel).await
        })
    }
}

/// Wraps a transport in a [`Dispatcher`] sharing one limiter.
#[derive(Clone)]
pub struct DispatchLayer {
    limiter: AdaptiveRateLimiter,
    settings: DispatcherSettings,
    logger: Arc<dyn RequestLogger>,
}

impl DispatchLayer {
    pub fn new(limiter: AdaptiveRateLimiter, settings: DispatcherSettings) -> Self {
        Self {
            limiter,
            settings,
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.logger = logger;
        self
    }
}

impl<S> Layer<S> for DispatchLayer {
    type Service = Dispatcher<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Dispatcher::with_settings(
            inner,
            self.limiter.clone(),
            self.settings,
            Arc::clone(&self.logger),
        )
    }
}
