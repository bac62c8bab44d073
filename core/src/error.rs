//! Error types for the kateway store layer

/// Main error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum KatewayError {
    /// The cluster currently has no brokers; no connection was attempted
    #[error("Cluster '{cluster}' has an empty broker list")]
    EmptyBrokerList { cluster: String },

    /// A pool factory failed to open a backend connection
    #[error("Resource acquisition failed: {message}")]
    ResourceAcquisitionFailed { message: String },

    /// Admission control refused a new consumer group member
    #[error("Too many consumers for topic '{topic}' group '{group}'")]
    TooManyConsumers { topic: String, group: String },

    /// Every group join attempt failed
    #[error("Joining group '{group}' failed after {attempts} attempts: {source}")]
    GroupJoinFailed {
        group: String,
        attempts: usize,
        #[source]
        source: Box<KatewayError>,
    },

    /// The caller canceled or timed out while waiting for a pooled resource
    #[error("Resource acquisition canceled")]
    AcquisitionCanceled,

    /// The pool was closed and cannot hand out resources any more
    #[error("Pool '{pool}' is closed")]
    PoolClosed { pool: String },

    /// No producer pool is registered for the cluster
    #[error("Unknown cluster '{cluster}'")]
    UnknownCluster { cluster: String },

    /// The store has been shut down
    #[error("Store is shut down")]
    StoreShutDown,

    /// Errors reported by the message log client or coordination service
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl KatewayError {
    /// Create a new acquisition error from a factory failure
    pub fn acquisition<S: Into<String>>(message: S) -> Self {
        Self::ResourceAcquisitionFailed {
            message: message.into(),
        }
    }

    /// Create a new backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn empty_broker_list<S: Into<String>>(cluster: S) -> Self {
        Self::EmptyBrokerList {
            cluster: cluster.into(),
        }
    }

    pub fn too_many_consumers(topic: &str, group: &str) -> Self {
        Self::TooManyConsumers {
            topic: topic.to_string(),
            group: group.to_string(),
        }
    }

    /// Check if the caller may reasonably retry the operation
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceAcquisitionFailed { .. } => true,
            Self::AcquisitionCanceled => true,
            Self::PoolClosed { .. } => true,
            Self::Backend { .. } => true,
            _ => false,
        }
    }

    /// Check if this error was caused by admission control
    pub fn is_admission_refusal(&self) -> bool {
        matches!(self, Self::TooManyConsumers { .. })
    }
}
