//! Admission decisions and the fail-open / fail-close policy.

use crate::error::BackendUnavailable;
use crate::storage::StorageResult;

/// The outcome of one rate limit check.
///
/// `allowed` always answers "may this request proceed". When a backend
/// failure forced the answer, `error` carries it so callers can tell a
/// policy decision from a quota decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    allowed: bool,
    error: Option<BackendUnavailable>,
}

impl Decision {
    /// Admitted within quota.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            error: None,
        }
    }

    /// Refused because the quota is exhausted.
    pub fn deny() -> Self {
        Self {
            allowed: false,
            error: None,
        }
    }

    /// Decided by the fail policy after a backend failure.
    pub fn degraded(allowed: bool, error: BackendUnavailable) -> Self {
        Self {
            allowed,
            error: Some(error),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn error(&self) -> Option<&BackendUnavailable> {
        self.error.as_ref()
    }

    /// Whether the backend failed and the policy decided.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_parts(self) -> (bool, Option<BackendUnavailable>) {
        (self.allowed, self.error)
    }
}

/// What to answer when the backend cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailPolicy {
    /// Let traffic through
    Open,
    /// Refuse traffic
    #[default]
    Closed,
}

impl FailPolicy {
    pub fn from_fail_open(fail_open: bool) -> Self {
        if fail_open {
            FailPolicy::Open
        } else {
            FailPolicy::Closed
        }
    }

    /// Turn an algorithm outcome into a decision.
    ///
    /// Backend errors are converted immediately. Nothing is retried.
    pub fn resolve(&self, outcome: StorageResult<bool>) -> Decision {
        match outcome {
            Ok(true) => Decision::allow(),
            Ok(false) => Decision::deny(),
            Err(err) => Decision::degraded(*self == FailPolicy::Open, err),
        }
    }
}
