use std::net::IpAddr;

use rosterd_trace::error::TraceableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Ipam Error: {0}")]
    Ipam(#[from] rosterd_ipam::error::Error),

    #[error("Config Error: {0}")]
    Config(#[from] ConfigError),

    #[error("datastore update retries exhausted after {retries} attempts: {last}")]
    DatastoreRetriesExceeded { retries: usize, last: Box<Error> },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("address {0} is owned by another attachment")]
    OverlapConflict(IpAddr),

    #[error("invalid cron expression: {0}")]
    InvalidCronExpression(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load: {0}")]
    FailedToLoad(#[source] std::io::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(#[source] serde_json::Error),

    #[error("no IP ranges configured")]
    MissingRange,
}

impl Error {
    fn api_error(&self) -> Option<&kube::core::ErrorResponse> {
        match self {
            Error::Kube(kube::Error::Api(e)) => Some(e),
            _ => None,
        }
    }

    /// An optimistic update lost the race; re-read and retry.
    pub fn is_conflict(&self) -> bool {
        self.api_error()
            .map(|e| e.code == 409 && e.reason == "Conflict")
            .unwrap_or(false)
    }

    /// A create raced with another writer's create.
    pub fn is_already_exists(&self) -> bool {
        self.api_error()
            .map(|e| e.code == 409 && e.reason == "AlreadyExists")
            .unwrap_or(false)
    }

    pub fn is_not_found(&self) -> bool {
        self.api_error().map(|e| e.code == 404).unwrap_or(false)
    }

    /// Timeouts and server-side hiccups worth retrying within the deadline.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 408 || e.code == 429 || e.code >= 500,
            Error::Kube(kube::Error::HyperError(_)) => true,
            Error::Kube(kube::Error::Service(_)) => true,
            _ => false,
        }
    }
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

impl TraceableError for &Error {
    fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}
