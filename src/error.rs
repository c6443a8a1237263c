use std::fmt;

/// Classifies a proxy-level failure so the codec can pick an appropriate
/// wire representation for the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    RouteNotFound,
    ClusterNotFound,
    ClusterMaintenance,
    NoHealthyUpstream,
    BadResponse,
    OverLimit,
    CodecError,
    Unspecified,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::RouteNotFound => "route_not_found",
            ErrorType::ClusterNotFound => "cluster_not_found",
            ErrorType::ClusterMaintenance => "cluster_maintenance",
            ErrorType::NoHealthyUpstream => "no_healthy_upstream",
            ErrorType::BadResponse => "bad_response",
            ErrorType::OverLimit => "over_limit",
            ErrorType::CodecError => "codec_error",
            ErrorType::Unspecified => "unspecified",
        }
    }
}

/// A proxy-level error surfaced to the downstream client as a direct
/// response.
#[derive(Debug, Clone)]
pub struct Error {
    pub error_type: ErrorType,
    pub message: String,
}

impl Error {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type.as_str(), self.message)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorType::ClusterNotFound, "unknown cluster 'c1'");
        assert_eq!(err.to_string(), "cluster_not_found: unknown cluster 'c1'");
    }

    #[test]
    fn test_error_type_strings_are_stable() {
        assert_eq!(ErrorType::RouteNotFound.as_str(), "route_not_found");
        assert_eq!(ErrorType::OverLimit.as_str(), "over_limit");
        assert_eq!(ErrorType::Unspecified.as_str(), "unspecified");
    }
}
