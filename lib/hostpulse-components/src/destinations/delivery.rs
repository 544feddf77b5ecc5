use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hostpulse_io::net::{
    retry::{
        BoundedExponentialBackoffRetryPolicy, ExponentialBackoff, IngestHttpClassifier, RetryClassifier as _,
        RetryDecision, RetryLifecycle, StandardHttpRetryLifecycle,
    },
    Transport, TransportError, TransportService,
};
use http::StatusCode;
use tower::{retry::Retry, ServiceExt as _};

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Result of delivering a single payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    /// The payload was accepted.
    Delivered,

    /// The payload was dropped after a non-retryable failure, or after exhausting all attempts.
    Dropped,

    /// Nothing was sent, because the endpoint has told us to stop sending.
    Disabled,
}

/// Delivers payloads to an HTTP endpoint with retries.
///
/// Server errors are retried with exponential backoff, starting at 500ms and doubling for every consecutive failure,
/// up to `max_attempts` attempts in total. Any other failure drops the payload immediately. A `410 Gone` response
/// disables the batcher: every later delivery returns [`DeliveryOutcome::Disabled`] without touching the network
/// until [`reset`][Self::reset] is called.
pub struct DeliveryBatcher<L = StandardHttpRetryLifecycle> {
    transport: Arc<dyn Transport>,
    policy: BoundedExponentialBackoffRetryPolicy<IngestHttpClassifier, L>,
}

impl DeliveryBatcher {
    /// Creates a new `DeliveryBatcher`.
    ///
    /// `max_attempts` is raised to 1 if it is zero.
    pub fn new(transport: Arc<dyn Transport>, max_attempts: u32) -> Self {
        let backoff = ExponentialBackoff::new(MIN_BACKOFF, MAX_BACKOFF);
        let policy = BoundedExponentialBackoffRetryPolicy::new(IngestHttpClassifier, backoff, max_attempts)
            .with_retry_lifecycle(StandardHttpRetryLifecycle);

        Self { transport, policy }
    }
}

impl<L> DeliveryBatcher<L>
where
    L: RetryLifecycle<http::Request<Bytes>, StatusCode, TransportError> + Clone + Send,
{
    /// Replaces the retry lifecycle.
    pub fn with_lifecycle<L2>(self, lifecycle: L2) -> DeliveryBatcher<L2> {
        DeliveryBatcher {
            transport: self.transport,
            policy: self.policy.with_retry_lifecycle(lifecycle),
        }
    }

    /// Returns `true` if delivery has been disabled by the endpoint.
    pub fn is_disabled(&self) -> bool {
        self.policy.is_disabled()
    }

    /// Re-enables delivery after it was disabled.
    pub fn reset(&self) {
        self.policy.reset();
    }

    /// Delivers `request`, retrying as needed.
    pub async fn deliver(&self, request: http::Request<Bytes>) -> DeliveryOutcome {
        if self.is_disabled() {
            return DeliveryOutcome::Disabled;
        }

        let service = Retry::new(self.policy.clone(), TransportService::new(Arc::clone(&self.transport)));
        let result = service.oneshot(request).await;

        match IngestHttpClassifier.classify(&result) {
            RetryDecision::Success => DeliveryOutcome::Delivered,
            _ if self.is_disabled() => DeliveryOutcome::Disabled,
            _ => DeliveryOutcome::Dropped,
        }
    }
}

/// Builds a JSON `POST` request.
pub(crate) fn json_request(uri: &http::Uri, body: Vec<u8>) -> Result<http::Request<Bytes>, http::Error> {
    http::Request::post(uri.clone())
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))
}
