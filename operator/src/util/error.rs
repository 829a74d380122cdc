/// Why a cluster-access attempt failed (spec'd secret → client resolution).
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("credential secret '{namespace}/{name}' not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("invalid credential in secret '{namespace}/{name}': {reason}")]
    InvalidCredential {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("cluster '{cluster}' unreachable: {reason}")]
    Unreachable { cluster: String, reason: String },
}

/// Failure modes of a single PVC data-replication attempt.
#[derive(Debug, thiserror::Error)]
pub enum PvcSyncError {
    #[error("no usable mount for PVC '{0}' in the source cluster")]
    SourceMountNotFound(String),

    #[error("destination PVC '{0}' did not reach Bound in time")]
    DestinationBindingTimeout(String),

    #[error("failed to propagate sync keys: {0}")]
    KeyPropagationFailed(String),

    #[error("rsync failed (transient): {0}")]
    RsyncTransient(String),

    #[error("rsync failed (fatal): {0}")]
    RsyncFatal(String),

    #[error("cleanup after sync failed: {0}")]
    CleanupFailed(String),
}

impl PvcSyncError {
    /// Only transient rsync failures are retried; everything else surfaces.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PvcSyncError::RsyncTransient(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            PvcSyncError::SourceMountNotFound(_) => "SourceMountNotFound",
            PvcSyncError::DestinationBindingTimeout(_) => "DestinationBindingTimeout",
            PvcSyncError::KeyPropagationFailed(_) => "KeyPropagationFailed",
            PvcSyncError::RsyncTransient(_) => "RsyncTransient",
            PvcSyncError::RsyncFatal(_) => "RsyncFatal",
            PvcSyncError::CleanupFailed(_) => "CleanupFailed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Invalid cron expression: {source}")]
    Cron {
        #[from]
        source: cron::error::Error,
    },

    #[error("SSH key error: {source}")]
    SshKey {
        #[from]
        source: ssh_key::Error,
    },

    #[error("Cluster access failed: {source}")]
    Access {
        #[from]
        source: AccessError,
    },

    #[error("PVC data sync failed: {source}")]
    PvcSync {
        #[from]
        source: PvcSyncError,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification used for status.errorCategories and the
/// retry decision: config errors wait for a spec change, transient
/// errors back off and retry, cancellation is neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Transient,
    ImmutableConflict,
    StatusConflict,
    PvcSync,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "Config",
            ErrorCategory::Transient => "Transient",
            ErrorCategory::ImmutableConflict => "ImmutableConflict",
            ErrorCategory::StatusConflict => "StatusConflict",
            ErrorCategory::PvcSync => "PvcSync",
            ErrorCategory::Cancelled => "Cancelled",
        }
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Kube { source } if is_conflict(source) => ErrorCategory::StatusConflict,
            Error::Kube { source } if is_immutable_field_error(source) => {
                ErrorCategory::ImmutableConflict
            }
            Error::Kube { source } if is_transient(source) => ErrorCategory::Transient,
            Error::Kube { .. } => ErrorCategory::Transient,
            Error::UserInput(_) | Error::Cron { .. } | Error::ParseDuration { .. } => {
                ErrorCategory::Config
            }
            Error::Json { .. } | Error::SshKey { .. } => ErrorCategory::Config,
            Error::Access { source } => match source {
                AccessError::Unreachable { .. } => ErrorCategory::Transient,
                _ => ErrorCategory::Config,
            },
            Error::PvcSync { .. } => ErrorCategory::PvcSync,
            Error::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether retrying without a spec change can possibly help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::PvcSync { source } => source.is_retryable(),
            _ => self.category() == ErrorCategory::Transient,
        }
    }
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// API-server rejections that indicate an attempt to change an
/// immutable field in place (422 Invalid / field-is-immutable messages).
pub fn is_immutable_field_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => {
            ae.code == 422
                && (ae.message.contains("field is immutable")
                    || ae.message.contains("immutable")
                    || ae.message.contains("may not change"))
        }
        _ => false,
    }
}

/// Throttling, timeouts and 5xx responses retry with backoff.
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => matches!(ae.code, 408 | 429 | 500 | 502 | 503 | 504),
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn immutable_rejections_are_detected() {
        assert!(is_immutable_field_error(&api_error(
            422,
            "PersistentVolumeClaim \"db\" is invalid: spec: Forbidden: spec is immutable after creation"
        )));
        assert!(!is_immutable_field_error(&api_error(404, "not found")));
    }

    #[test]
    fn throttling_is_transient() {
        assert!(is_transient(&api_error(429, "Too Many Requests")));
        assert!(is_transient(&api_error(503, "Service Unavailable")));
        assert!(!is_transient(&api_error(403, "Forbidden")));
    }

    #[test]
    fn categories_drive_retry() {
        let e = Error::from(api_error(429, "throttled"));
        assert_eq!(e.category(), ErrorCategory::Transient);
        assert!(e.is_retryable());

        let e = Error::UserInput("bad".into());
        assert_eq!(e.category(), ErrorCategory::Config);
        assert!(!e.is_retryable());

        let e = Error::from(PvcSyncError::RsyncFatal("auth".into()));
        assert!(!e.is_retryable());
        let e = Error::from(PvcSyncError::RsyncTransient("reset".into()));
        assert!(e.is_retryable());
    }
}
