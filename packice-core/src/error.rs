use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, PackError>;

/// All errors a peer operation can surface.
///
/// Every variant carries a stable wire `kind` so remote transports can
/// reconstruct the same error on the client side.
#[derive(Error, Debug)]
pub enum PackError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    Exists(String),

    #[error("object is still creating: {0}")]
    NotReady(String),

    #[error("object is gone: {0}")]
    Gone(String),

    #[error("invalid or expired lease: {0}")]
    InvalidLease(String),

    #[error("operation not permitted: {0}")]
    Forbidden(String),

    #[error("write to sealed blob: {0}")]
    SealViolation(String),

    #[error("capacity exhausted: {0}")]
    Full(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PackError {
    /// Stable kind string used in wire error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Exists(_) => "Exists",
            Self::NotReady(_) => "NotReady",
            Self::Gone(_) => "Gone",
            Self::InvalidLease(_) => "InvalidLease",
            Self::Forbidden(_) => "Forbidden",
            Self::SealViolation(_) => "SealViolation",
            Self::Full(_) => "Full",
            Self::Transport(_) => "TransportError",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status the wire adapters derive from the kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Exists(_) | Self::SealViolation(_) => 409,
            Self::NotReady(_) => 423,
            Self::Gone(_) => 410,
            Self::InvalidLease(_) | Self::InvalidRequest(_) => 400,
            Self::Forbidden(_) => 403,
            Self::Full(_) => 507,
            Self::Transport(_) => 502,
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => 500,
        }
    }

    /// Rebuild an error from a wire `{kind, message}` pair.
    pub fn from_wire(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "NotFound" => Self::NotFound(message),
            "Exists" => Self::Exists(message),
            "NotReady" => Self::NotReady(message),
            "Gone" => Self::Gone(message),
            "InvalidLease" => Self::InvalidLease(message),
            "Forbidden" => Self::Forbidden(message),
            "SealViolation" => Self::SealViolation(message),
            "Full" => Self::Full(message),
            "TransportError" => Self::Transport(message),
            "InvalidRequest" => Self::InvalidRequest(message),
            _ => Self::Internal(message),
        }
    }
}

impl From<redis::RedisError> for PackError {
    fn from(err: redis::RedisError) -> Self {
        Self::Internal(format!("redis: {}", err))
    }
}

impl From<reqwest::Error> for PackError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let err = PackError::NotReady("k1".to_string());
        let back = PackError::from_wire(err.kind(), "k1");
        assert!(matches!(back, PackError::NotReady(_)));
        assert_eq!(back.http_status(), 423);
    }

    #[test]
    fn test_internal_kinds_collapse() {
        let err = PackError::Config("bad".to_string());
        assert_eq!(err.kind(), "Internal");
        assert_eq!(err.http_status(), 500);
    }
}
