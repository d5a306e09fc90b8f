//! Error types for fleet cluster ownership
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants that concern a single cluster carry the cluster name so that
//! a combined batch error still says which cluster failed and why.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The cluster no longer exists in the store
    #[error("cluster {cluster} not found")]
    NotFound {
        /// Name of the missing cluster
        cluster: String,
    },

    /// Optimistic-concurrency conflict while writing a cluster
    ///
    /// The caller is expected to requeue; the next attempt re-reads the object.
    #[error("conflict updating cluster {cluster}: object was modified")]
    Conflict {
        /// Name of the cluster whose write was rejected
        cluster: String,
    },

    /// The controller-lifecycle collaborator failed for a cluster
    #[error("controllers for cluster {cluster}: {message}")]
    Controller {
        /// Name of the cluster whose controller set failed
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Several independent failures collected from one batch
    #[error("{} errors: [{}]", .errors.len(), join_messages(.errors))]
    Aggregate {
        /// Every error collected during the batch, in encounter order
        errors: Vec<Error>,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "peer-listener", "event-loop")
        context: String,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Classify a kube error raised while operating on a named cluster
    ///
    /// 404 becomes [`Error::NotFound`], 409 becomes [`Error::Conflict`], and
    /// everything else is kept as [`Error::Kube`].
    pub fn from_kube_for(cluster: impl Into<String>, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                cluster: cluster.into(),
            },
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                cluster: cluster.into(),
            },
            _ => Self::Kube { source },
        }
    }

    /// Create a controller-lifecycle error for a cluster
    pub fn controller(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Controller {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Combine the errors of a batch into a single result
    ///
    /// No errors yields `Ok(())`, a single error is returned as-is, and
    /// several are wrapped in [`Error::Aggregate`].
    pub fn aggregate(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate { errors }),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration errors need an operator to fix them. Conflicts and
    /// collaborator failures are expected to clear on the next pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429
            ),
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::Controller { .. } => true,
            Error::Aggregate { errors } => errors.iter().any(Error::is_retryable),
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::NotFound { cluster }
            | Error::Conflict { cluster }
            | Error::Controller { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Check if this error means the cluster is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }
}
