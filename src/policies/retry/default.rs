use tracing::trace;

use crate::errors::{DbError, RequestError};
use crate::policies::retry::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// The retry policy used when a profile does not set one.
///
/// Retries only when the failed attempt has a real chance of going
/// differently — another coordinator, or a second try on the same one — and
/// never re-applies a request that may already have taken effect.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new())
    }
}

struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl DefaultRetrySession {
    fn new() -> Self {
        DefaultRetrySession {
            was_unavailable_retry: false,
            was_read_timeout_retry: false,
            was_write_timeout_retry: false,
        }
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo<'_>) -> RetryDecision {
        match request_info.error {
            // The connection broke with the request possibly in flight; only
            // idempotent requests can be safely sent again, on another host.
            RequestError::Broken(_) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The coordinator had not even started processing - trying
            // another host is free.
            RequestError::Db(DbError::Unavailable) => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            RequestError::Db(DbError::IsBootstrapping) | RequestError::Db(DbError::Overloaded) => {
                RetryDecision::RetryNextHost(None)
            }
            // Enough replicas responded but data was missing - the
            // coordinator may simply have picked a bad set, retry there once.
            RequestError::Db(DbError::ReadTimeout {
                received,
                required,
                data_present,
            }) => {
                if !self.was_read_timeout_retry && received >= required && !*data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            RequestError::Db(DbError::WriteTimeout { .. }) => {
                if !self.was_write_timeout_retry && request_info.is_idempotent {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameHost(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            error => {
                trace!("Not retrying: {}", error);
                RetryDecision::DontRetry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConnectionError;
    use crate::statement::Consistency;

    fn info(error: &RequestError, is_idempotent: bool) -> RequestInfo<'_> {
        RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::LocalQuorum,
        }
    }

    #[test]
    fn broken_connection_retries_only_idempotent() {
        let policy = DefaultRetryPolicy::new();
        let error = RequestError::Broken(ConnectionError::Closed);

        let mut session = policy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, true)),
            RetryDecision::RetryNextHost(None)
        );

        let mut session = policy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn unavailable_retries_next_host_once() {
        let policy = DefaultRetryPolicy::new();
        let error = RequestError::Db(DbError::Unavailable);

        let mut session = policy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::RetryNextHost(None)
        );
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn bootstrapping_always_goes_to_next_host() {
        let policy = DefaultRetryPolicy::new();
        let error = RequestError::Db(DbError::IsBootstrapping);

        let mut session = policy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::RetryNextHost(None)
        );
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::RetryNextHost(None)
        );
    }

    #[test]
    fn read_timeout_retries_same_host_when_data_missing() {
        let policy = DefaultRetryPolicy::new();
        let retryable = RequestError::Db(DbError::ReadTimeout {
            received: 2,
            required: 2,
            data_present: false,
        });
        let not_retryable = RequestError::Db(DbError::ReadTimeout {
            received: 2,
            required: 2,
            data_present: true,
        });

        let mut session = policy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&retryable, false)),
            RetryDecision::RetrySameHost(None)
        );
        assert_eq!(
            session.decide_should_retry(info(&retryable, false)),
            RetryDecision::DontRetry
        );

        let mut session = policy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&not_retryable, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn invalid_request_is_never_retried() {
        let policy = DefaultRetryPolicy::new();
        let error = RequestError::Db(DbError::Invalid("syntax".into()));
        let mut session = policy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, true)),
            RetryDecision::DontRetry
        );
    }
}
