use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::time::{sleep, Sleep};
use tower::retry::Policy;

use super::{
    classifier::{RetryClassifier, RetryDecision},
    lifecycle::{DefaultDebugRetryLifecycle, RetryLifecycle},
    ExponentialBackoff,
};

/// An exponential backoff retry policy with a bounded number of attempts.
///
/// Every request starts with an error count of zero. Each response classified as [`RetryDecision::Retry`] increments
/// it, and the request is retried after the backoff for that count until `max_attempts` attempts have been made.
///
/// Responses classified as [`RetryDecision::Disable`] trip a disabled flag that is shared by every clone of the policy.
/// The flag stays set until [`reset`][Self::reset] is called, and no further retries are scheduled while it is set.
#[derive(Clone)]
pub struct BoundedExponentialBackoffRetryPolicy<C, L = DefaultDebugRetryLifecycle> {
    classifier: C,
    retry_lifecycle: L,
    backoff: ExponentialBackoff,
    max_attempts: u32,
    error_count: u32,
    disabled: Arc<AtomicBool>,
}

impl<C> BoundedExponentialBackoffRetryPolicy<C> {
    /// Creates a new `BoundedExponentialBackoffRetryPolicy`.
    ///
    /// `max_attempts` counts the initial attempt, and is raised to 1 if it is zero.
    pub fn new(classifier: C, backoff: ExponentialBackoff, max_attempts: u32) -> Self {
        Self {
            classifier,
            retry_lifecycle: DefaultDebugRetryLifecycle,
            backoff,
            max_attempts: max_attempts.max(1),
            error_count: 0,
            disabled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<C, L> BoundedExponentialBackoffRetryPolicy<C, L> {
    /// Sets the retry lifecycle for this policy.
    pub fn with_retry_lifecycle<L2>(self, retry_lifecycle: L2) -> BoundedExponentialBackoffRetryPolicy<C, L2> {
        BoundedExponentialBackoffRetryPolicy {
            classifier: self.classifier,
            retry_lifecycle,
            backoff: self.backoff,
            max_attempts: self.max_attempts,
            error_count: self.error_count,
            disabled: self.disabled,
        }
    }

    /// Returns `true` if a response has disabled further sending.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Clears the disabled flag.
    pub fn reset(&self) {
        self.disabled.store(false, Ordering::Release);
    }
}

impl<C, L, B, Res, Error> Policy<http::Request<B>, Res, Error> for BoundedExponentialBackoffRetryPolicy<C, L>
where
    C: RetryClassifier<Res, Error>,
    L: RetryLifecycle<http::Request<B>, Res, Error>,
    B: Clone,
{
    type Future = Sleep;

    fn retry(&mut self, request: &mut http::Request<B>, response: &mut Result<Res, Error>) -> Option<Self::Future> {
        match self.classifier.classify(response) {
            RetryDecision::Success => {
                self.retry_lifecycle.after_success(request, response);
                None
            }
            RetryDecision::Drop => {
                self.retry_lifecycle.after_drop(request, response);
                None
            }
            RetryDecision::Disable => {
                if !self.disabled.swap(true, Ordering::AcqRel) {
                    self.retry_lifecycle.after_disable(request, response);
                }
                None
            }
            RetryDecision::Retry => {
                self.error_count += 1;
                if self.error_count >= self.max_attempts {
                    self.retry_lifecycle
                        .after_exhausted(request, response, self.error_count);
                    return None;
                }
                if self.is_disabled() {
                    return None;
                }

                let backoff = self.backoff.get_backoff_duration(self.error_count);
                self.retry_lifecycle
                    .before_retry(request, response, backoff, self.error_count);
                Some(sleep(backoff))
            }
        }
    }

    fn clone_request(&mut self, request: &http::Request<B>) -> Option<http::Request<B>> {
        let mut cloned = http::Request::new(request.body().clone());
        *cloned.method_mut() = request.method().clone();
        *cloned.uri_mut() = request.uri().clone();
        *cloned.version_mut() = request.version();
        *cloned.headers_mut() = request.headers().clone();
        Some(cloned)
    }
}
