use std::{fmt, time::Duration};

use http::StatusCode;
use tracing::{debug, error, warn};

/// Hooks invoked as a delivery attempt moves through retries.
pub trait RetryLifecycle<Req, Res, Error> {
    /// Called before sleeping ahead of retry number `error_count`.
    fn before_retry(&self, req: &Req, res: &Result<Res, Error>, retry_backoff: Duration, error_count: u32);

    /// Called when an attempt succeeds.
    fn after_success(&self, req: &Req, res: &Result<Res, Error>);

    /// Called when a retryable failure was seen on the last allowed attempt.
    fn after_exhausted(&self, req: &Req, res: &Result<Res, Error>, attempts: u32);

    /// Called when a failure is not retryable.
    fn after_drop(&self, req: &Req, res: &Result<Res, Error>);

    /// Called when the receiver first asks us to stop sending.
    fn after_disable(&self, req: &Req, res: &Result<Res, Error>);
}

/// A retry lifecycle that emits minimal debug logs.
#[derive(Clone, Debug, Default)]
pub struct DefaultDebugRetryLifecycle;

impl<Req, Res, Error> RetryLifecycle<Req, Res, Error> for DefaultDebugRetryLifecycle {
    fn before_retry(&self, _: &Req, _: &Result<Res, Error>, retry_backoff: Duration, error_count: u32) {
        debug!(error_count, "Retrying request after {:?}.", retry_backoff);
    }

    fn after_success(&self, _: &Req, _: &Result<Res, Error>) {
        debug!("Request succeeded.");
    }

    fn after_exhausted(&self, _: &Req, _: &Result<Res, Error>, attempts: u32) {
        debug!(attempts, "Request failed after exhausting all attempts.");
    }

    fn after_drop(&self, _: &Req, _: &Result<Res, Error>) {
        debug!("Request failed and will not be retried.");
    }

    fn after_disable(&self, _: &Req, _: &Result<Res, Error>) {
        debug!("Receiver asked for sending to stop.");
    }
}

/// A retry lifecycle for HTTP deliveries that logs the request URI and the reason for each failure.
#[derive(Clone, Debug, Default)]
pub struct StandardHttpRetryLifecycle;

impl<B, E> RetryLifecycle<http::Request<B>, StatusCode, E> for StandardHttpRetryLifecycle
where
    E: fmt::Display,
{
    fn before_retry(&self, req: &http::Request<B>, res: &Result<StatusCode, E>, retry_backoff: Duration, error_count: u32) {
        let request_uri = SanitizedRequestUri(req.uri());
        warn!(
            attempt = error_count + 1,
            %request_uri,
            "{} Retrying after {:?}.",
            Outcome(res),
            retry_backoff
        );
    }

    fn after_success(&self, req: &http::Request<B>, _: &Result<StatusCode, E>) {
        let request_uri = SanitizedRequestUri(req.uri());
        debug!(%request_uri, "Request succeeded.");
    }

    fn after_exhausted(&self, req: &http::Request<B>, res: &Result<StatusCode, E>, attempts: u32) {
        let request_uri = SanitizedRequestUri(req.uri());
        error!(attempts, %request_uri, "{} Giving up after {} attempts. Payload dropped.", Outcome(res), attempts);
    }

    fn after_drop(&self, req: &http::Request<B>, res: &Result<StatusCode, E>) {
        let request_uri = SanitizedRequestUri(req.uri());
        error!(%request_uri, "{} Payload dropped.", Outcome(res));
    }

    fn after_disable(&self, req: &http::Request<B>, _: &Result<StatusCode, E>) {
        let request_uri = SanitizedRequestUri(req.uri());
        error!(
            %request_uri,
            "Endpoint responded with 410 Gone. No further payloads will be sent until reconfigured."
        );
    }
}

struct Outcome<'a, E>(&'a Result<StatusCode, E>);

impl<E: fmt::Display> fmt::Display for Outcome<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Ok(status) => write!(f, "Server responded with status code {}.", status.as_str()),
            Err(e) => write!(f, "Request failed: {}.", e),
        }
    }
}

/// Displays a URI without its query string or credentials.
pub struct SanitizedRequestUri<'a>(pub &'a http::Uri);

impl fmt::Display for SanitizedRequestUri<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(scheme), Some(host)) = (self.0.scheme_str(), self.0.host()) {
            write!(f, "{}://{}", scheme, host)?;
            if let Some(port) = self.0.port_u16() {
                write!(f, ":{}", port)?;
            }
        }

        write!(f, "{}", self.0.path())
    }
}
