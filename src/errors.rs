use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-eras-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-eras-config-2 Invalid numeric value for {var_name}: {value}")]
    InvalidNumber { var_name: String, value: String },

    #[error("error-eras-config-3 Invalid port number: {port}")]
    InvalidPortNumber { port: String },

    #[error("error-eras-config-4 Invalid URL for {var_name}: {value}")]
    InvalidUrl { var_name: String, value: String },

    #[error(
        "error-eras-config-5 Email channel not configured: EMAIL_API_URL and EMAIL_API_KEY are required unless ERAS_DRY_RUN=true"
    )]
    EmailChannelRequired,

    #[error("error-eras-config-6 Invalid threshold: {details}")]
    InvalidThreshold { details: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error-eras-storage-1 Store unavailable: {operation}: {details}")]
    Unavailable { operation: String, details: String },

    #[error("error-eras-storage-2 Store operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("error-eras-storage-3 Value serialization failed: {data_type}: {source}")]
    Serialization {
        data_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error-eras-storage-4 Value deserialization failed: {data_type} at {key}: {source}")]
    Deserialization {
        data_type: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error-eras-storage-5 Connection pool error: {details}")]
    Pool { details: String },
}

impl StorageError {
    /// Transient infrastructure failures: the store may recover on the
    /// next cycle, so callers skip rather than mutate task state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. }
                | StorageError::Timeout { .. }
                | StorageError::Pool { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("error-eras-lock-1 Lock store operation failed: {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("error-eras-lock-2 Lock acquisition timed out: {key}")]
    AcquireTimeout { key: String },
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("error-eras-delivery-1 No valid recipients resolved for capsule {capsule_id}")]
    NoRecipients { capsule_id: String },

    #[error("error-eras-delivery-2 Email dispatch failed: {to}: {details}")]
    EmailDispatch { to: String, details: String },

    #[error("error-eras-delivery-3 Media URL signing failed: {media_id}: {details}")]
    MediaResolve { media_id: String, details: String },

    #[error("error-eras-delivery-4 Idempotency marker operation failed: {source}")]
    Marker {
        #[source]
        source: StorageError,
    },
}

impl DeliveryError {
    /// Transient store failures around the idempotency markers: the
    /// delivery attempt must be skipped without mutating task state,
    /// never recorded as a delivery failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Marker { source } if source.is_transient())
    }
}

#[derive(Error, Debug)]
pub enum OutcomeError {
    #[error(
        "error-eras-outcome-1 Media reference count mismatch on draft conversion: capsule {capsule_id}: before={before} after={after}"
    )]
    MediaCountMismatch {
        capsule_id: String,
        before: usize,
        after: usize,
    },

    #[error("error-eras-outcome-2 Capsule store update failed: {capsule_id}: {source}")]
    Store {
        capsule_id: String,
        #[source]
        source: StorageError,
    },
}
