use http::StatusCode;

/// What to do with a delivery attempt's outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// The attempt succeeded.
    Success,

    /// The attempt failed, but may succeed if retried.
    Retry,

    /// The attempt failed, and retrying will not help.
    Drop,

    /// The receiver asked us to stop sending altogether.
    Disable,
}

/// Classifies the outcome of a delivery attempt.
pub trait RetryClassifier<Res, Error> {
    /// Returns what to do with the given outcome.
    fn classify(&self, response: &Result<Res, Error>) -> RetryDecision;
}

/// Classifies HTTP status codes for ingest-style endpoints.
///
/// - 2xx: success
/// - 410 Gone: disable
/// - 5xx: retry
/// - anything else, including transport errors: drop
#[derive(Clone, Debug, Default)]
pub struct IngestHttpClassifier;

impl<Error> RetryClassifier<StatusCode, Error> for IngestHttpClassifier {
    fn classify(&self, response: &Result<StatusCode, Error>) -> RetryDecision {
        match response {
            Ok(status) if status.is_success() => RetryDecision::Success,
            Ok(status) if *status == StatusCode::GONE => RetryDecision::Disable,
            Ok(status) if status.is_server_error() => RetryDecision::Retry,
            Ok(_) | Err(_) => RetryDecision::Drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16) -> RetryDecision {
        let status = StatusCode::from_u16(status).unwrap();
        IngestHttpClassifier.classify(&Ok::<_, ()>(status))
    }

    #[test]
    fn status_codes() {
        assert_eq!(classify(200), RetryDecision::Success);
        assert_eq!(classify(202), RetryDecision::Success);
        assert_eq!(classify(410), RetryDecision::Disable);
        assert_eq!(classify(500), RetryDecision::Retry);
        assert_eq!(classify(503), RetryDecision::Retry);
        assert_eq!(classify(400), RetryDecision::Drop);
        assert_eq!(classify(404), RetryDecision::Drop);
        assert_eq!(classify(302), RetryDecision::Drop);
    }

    #[test]
    fn transport_errors_are_dropped() {
        let outcome: Result<StatusCode, &str> = Err("connection refused");
        assert_eq!(IngestHttpClassifier.classify(&outcome), RetryDecision::Drop);
    }
}
