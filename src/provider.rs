//! Error classification shared by the cloud providers.
//!
//! Providers report most failure kinds only in prose, so classification works
//! on the rendered error message.

use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The resource type or action does not exist in the queried scope.
    RegionUnsupported,
    AccessDenied,
    NotFound,
    Throttled,
    Other,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::RegionUnsupported => "unsupported in scope",
            ProviderErrorKind::AccessDenied => "access denied",
            ProviderErrorKind::NotFound => "not found",
            ProviderErrorKind::Throttled => "throttled",
            ProviderErrorKind::Other => "provider error",
        };
        f.write_str(s)
    }
}

const UNSUPPORTED_MARKERS: &[&str] = &[
    "TypeNotFoundException",
    "UnsupportedActionException",
    "is not supported in this region",
    "not available in this region",
    "NoRegisteredProviderFound",
    "InvalidResourceType",
];

const ACCESS_DENIED_MARKERS: &[&str] = &[
    "AccessDenied",
    "UnauthorizedOperation",
    "not authorized to perform",
    "AuthorizationFailed",
    "InvalidAuthenticationToken",
    "ExpiredToken",
    "InvalidClientTokenId",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "NotFound",
    "NoSuchBucketPolicy",
    "NoSuchBucket",
    "ResourceNotFoundException",
    "does not exist",
];

const THROTTLED_MARKERS: &[&str] =
    &["Throttling", "ThrottlingException", "TooManyRequests", "Rate exceeded", "RequestLimitExceeded"];

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Builds an error from provider prose, classifying it by known markers.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self { kind: classify(&message), message }
    }

    /// Auth, not-found and unsupported-scope failures are expected during recon.
    pub fn is_benign(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RegionUnsupported
                | ProviderErrorKind::AccessDenied
                | ProviderErrorKind::NotFound
        )
    }
}

pub fn classify(message: &str) -> ProviderErrorKind {
    let has = |markers: &[&str]| markers.iter().any(|m| message.contains(m));
    if has(UNSUPPORTED_MARKERS) {
        ProviderErrorKind::RegionUnsupported
    } else if has(ACCESS_DENIED_MARKERS) {
        ProviderErrorKind::AccessDenied
    } else if has(THROTTLED_MARKERS) {
        ProviderErrorKind::Throttled
    } else if has(NOT_FOUND_MARKERS) {
        ProviderErrorKind::NotFound
    } else {
        ProviderErrorKind::Other
    }
}
