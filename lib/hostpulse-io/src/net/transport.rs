use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use snafu::{ResultExt as _, Snafu};
use tower::Service;

/// A transport error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TransportError {
    /// The HTTP client could not be built.
    #[snafu(display("Failed to build HTTP client: {}", source))]
    Client {
        /// Underlying error.
        source: reqwest::Error,
    },

    /// The request could not be converted for sending.
    #[snafu(display("Invalid request: {}", source))]
    InvalidRequest {
        /// Underlying error.
        source: reqwest::Error,
    },

    /// The request timed out.
    #[snafu(display("request timed out"))]
    Timeout,

    /// The server could not be reached.
    #[snafu(display("connection failed: {}", reason))]
    Connect {
        /// Description of the failure.
        reason: String,
    },

    /// Any other failure while sending the request.
    #[snafu(display("{}", reason))]
    Other {
        /// Description of the failure.
        reason: String,
    },
}

impl TransportError {
    fn from_send_error(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect {
                reason: innermost_cause(&e),
            }
        } else {
            Self::Other {
                reason: innermost_cause(&e),
            }
        }
    }
}

fn innermost_cause(error: &(dyn std::error::Error + 'static)) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

/// Sends HTTP requests and reports the response status.
///
/// Response bodies are not needed by any destination, so they are discarded.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request, returning the response status code.
    ///
    /// # Errors
    ///
    /// If no response was received, an error is returned.
    async fn send(&self, request: http::Request<Bytes>) -> Result<StatusCode, TransportError>;
}

/// Adapts a shared [`Transport`] into a [`Service`], so that it can be wrapped in `tower` middleware.
#[derive(Clone)]
pub struct TransportService {
    transport: Arc<dyn Transport>,
}

impl TransportService {
    /// Creates a new `TransportService` over the given transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Service<http::Request<Bytes>> for TransportService {
    type Response = StatusCode;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Bytes>) -> Self::Future {
        let transport = Arc::clone(&self.transport);
        Box::pin(async move { transport.send(request).await })
    }
}

/// A [`Transport`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a new `ReqwestTransport` whose requests time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// If the underlying client cannot be built, an error is returned.
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("hostpulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(Client)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: http::Request<Bytes>) -> Result<StatusCode, TransportError> {
        let request = reqwest::Request::try_from(request).context(InvalidRequest)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(TransportError::from_send_error)?;

        Ok(response.status())
    }
}
