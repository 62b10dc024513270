//! AWS error classification and handling
//!
//! Provides typed errors for AWS SDK operations using the `.code()` method
//! instead of string matching on Debug format. Fallible SDK calls go
//! through [`ClassifyAwsResult::classify_aws`], which reads the error code
//! at the boundary and keeps the classification in the anyhow chain so
//! callers can recover it with [`classify_anyhow_error`].

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// AWS error categories for skip/retry decisions
#[derive(Debug, Clone, Error)]
pub enum AwsError {
    /// Resource was not found (benign for event-driven loads: the resource
    /// vanished between the event and processing)
    #[error("Resource not found")]
    NotFound,

    /// Access denied (missing permission or untrusted role)
    #[error("Access denied")]
    AccessDenied,

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    Throttled,

    /// Generic AWS SDK error with code and message
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound)
    }

    /// Check if this is an access/credential error
    pub fn is_access_denied(&self) -> bool {
        matches!(self, AwsError::AccessDenied)
    }

    /// The raw service error code, for codes outside the category tables.
    pub fn code(&self) -> Option<&str> {
        match self {
            AwsError::Sdk { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Known AWS error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidVolume.NotFound",
    "InvalidSnapshot.NotFound",
    "InvalidGroup.NotFound",
    "InvalidAllocationID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidVpcID.NotFound",
    "NoSuchBucket",
    "NoSuchKey",
    "NoSuchTagSet",
    "NoSuchEntity",
    "NotFoundException",
];

/// Known AWS error codes for access/credential failures
const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "ExpiredToken",
    "ExpiredTokenException",
];

/// Known AWS error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

/// Classify an AWS error code.
pub fn classify_code(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound,
        Some(c) if ACCESS_DENIED_CODES.contains(&c) => AwsError::AccessDenied,
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled,
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify SDK results at the boundary.
///
/// Reads the error code through `ProvideErrorMetadata` and layers the
/// resulting [`AwsError`] into the anyhow chain, on top of the original
/// SDK error. Downstream `.context()` calls stack on top as usual.
pub trait ClassifyAwsResult<T> {
    fn classify_aws(self) -> anyhow::Result<T>;
}

impl<T, E, R> ClassifyAwsResult<T> for Result<T, SdkError<E, R>>
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    fn classify_aws(self) -> anyhow::Result<T> {
        self.map_err(|e| {
            let classified = classify_code(e.code(), e.message());
            anyhow::Error::new(e).context(classified)
        })
    }
}

/// Classify an `anyhow::Error` wrapping an AWS SDK error.
///
/// Errors that crossed the [`ClassifyAwsResult`] boundary carry a typed
/// [`AwsError`] in the chain and are recovered by downcast. For errors that
/// never did, the fallback extracts the code from the `code: Some("...")`
/// field of the chain's Debug rendering; unlike a free-text scan it cannot
/// be fooled by a code string appearing in a message or resource name.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    if let Some(classified) = error.downcast_ref::<AwsError>() {
        return classified.clone();
    }

    let rendered = format!("{:?}", error);
    if let Some(code) = extract_error_code(&rendered) {
        return classify_code(Some(&code), Some(&rendered));
    }

    AwsError::Sdk {
        code: None,
        message: error.to_string(),
    }
}

/// Extract the code from a `code: Some("...")` field in a Debug rendering.
fn extract_error_code(rendered: &str) -> Option<String> {
    let start = rendered.find("code: Some(\"")?;
    let rest = &rendered[start + 12..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
