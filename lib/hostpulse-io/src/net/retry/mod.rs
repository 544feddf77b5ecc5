//! Retry primitives.

mod backoff;
pub use self::backoff::ExponentialBackoff;

mod classifier;
pub use self::classifier::{IngestHttpClassifier, RetryClassifier, RetryDecision};

mod lifecycle;
pub use self::lifecycle::{DefaultDebugRetryLifecycle, RetryLifecycle, SanitizedRequestUri, StandardHttpRetryLifecycle};

mod policy;
pub use self::policy::BoundedExponentialBackoffRetryPolicy;
