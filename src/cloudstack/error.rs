//! Error types for the CloudStack backend.

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;

/// How a provider failure should be treated by callers that can recover.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// The chosen network has no free addresses; another network may work.
    InsufficientCapacity,
    /// Anything else.
    Other,
}

/// Failure raised by the transport for a single API call.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("HTTP {status}: {message}")]
pub struct ProviderError {
    /// HTTP status code returned by the endpoint.
    pub status: u16,
    /// Recoverability tag assigned at the transport boundary.
    pub kind: ProviderErrorKind,
    /// Message reported by the endpoint.
    pub message: String,
}

impl ProviderError {
    /// Builds an error from a status and message, tagging capacity failures.
    #[must_use]
    pub fn classify(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if message
            .to_ascii_lowercase()
            .contains("sufficient address capacity")
        {
            ProviderErrorKind::InsufficientCapacity
        } else {
            ProviderErrorKind::Other
        };
        Self {
            status,
            kind,
            message,
        }
    }

    /// Returns true when the endpoint refused the caller's credentials or
    /// account rather than the request itself.
    #[must_use]
    pub const fn is_unsubscribed(&self) -> bool {
        matches!(self.status, 401 | 403 | 531)
    }
}

/// Errors raised by the CloudStack backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudStackError {
    /// Raised when the provider context or region is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid launch request: {0}")]
    Validation(String),
    /// Raised when the directory lists no regions to launch into.
    #[error("no region is available for launch")]
    NoRegionAvailable,
    /// Raised when every network candidate ran out of addresses.
    #[error("unable to identify a network into which a VM can be launched (tried {tried})")]
    NoViableNetwork {
        /// Number of candidates attempted.
        tried: usize,
    },
    /// Raised when the create response names no instance.
    #[error("launch was accepted but no instance id was returned")]
    LaunchRejected,
    /// Raised when an instance is still invisible after provisioning.
    #[error("instance {instance_id} not found after provisioning")]
    InstanceNotFound {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Raised when an instance reports a state outside the known table.
    #[error("unexpected instance state: {state}")]
    UnexpectedState {
        /// Raw state value.
        state: String,
    },
    /// Raised when a response cannot be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// Raised for operations the provider cannot perform.
    #[error("operation not supported: {0}")]
    Unsupported(String),
    /// Raised when the caller cancels a wait.
    #[error("cancelled while waiting for {action}")]
    Cancelled {
        /// Action being waited on.
        action: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl From<BackendError> for CloudStackError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for CloudStackError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        "Insufficient address capacity in network 204",
        ProviderErrorKind::InsufficientCapacity
    )]
    #[case(
        "Unable to deploy: no sufficient address capacity",
        ProviderErrorKind::InsufficientCapacity
    )]
    #[case("Unable to find template", ProviderErrorKind::Other)]
    fn classifies_capacity_failures(#[case] message: &str, #[case] expected: ProviderErrorKind) {
        assert_eq!(ProviderError::classify(530, message).kind, expected);
    }

    #[rstest]
    #[case(401, true)]
    #[case(403, true)]
    #[case(531, true)]
    #[case(500, false)]
    #[case(432, false)]
    fn recognises_unsubscribed_statuses(#[case] status: u16, #[case] expected: bool) {
        assert_eq!(
            ProviderError::classify(status, "denied").is_unsubscribed(),
            expected
        );
    }

    #[test]
    fn no_viable_network_names_the_failure() {
        let error = CloudStackError::NoViableNetwork { tried: 3 };
        assert!(
            error
                .to_string()
                .starts_with("unable to identify a network into which a VM can be launched"),
            "unexpected message: {error}"
        );
    }
}
