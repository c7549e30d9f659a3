use thiserror::Error;

/// Errors returned when handing work to a sink fails *before* delivery begins.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The delivery engine has been shut down.
    #[error("delivery engine is shut down")]
    Shutdown,

    /// Loading candidate subscriptions failed.
    #[error("subscription store error: {0}")]
    Store(#[from] StoreError),

    /// Enqueueing work items on the durable queue failed.
    #[error("durable queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors building an engine or dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("invalid header name '{0}'")]
    HeaderName(String),
}

/// Why a single delivery attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("subscriber returned status {0}")]
    Status(u16),

    #[error("could not build request: {0}")]
    Request(String),
}

/// Registration-time validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("secret must be between 32 and 64 characters, got {actual}")]
    SecretLength { actual: usize },

    #[error("invalid callback URI: {0}")]
    InvalidUri(String),

    #[error("callback URI scheme must be http or https, got '{0}'")]
    UnsupportedScheme(String),

    #[error("echo request failed: {0}")]
    Transport(String),

    #[error("echo request returned status {0}")]
    Status(u16),

    #[error("echo response had no body")]
    EmptyBody,

    #[error("echo response did not match the challenge")]
    EchoMismatch,
}

/// Failures when creating or replacing a subscription.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("subscription id '{0}' was rejected")]
    InvalidId(String),

    #[error("store rejected the subscription: {0:?}")]
    Store(StoreResult),
}

/// Result of a subscription store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Success,
    /// A record with the same key already exists.
    Conflict,
    NotFound,
    /// The backend rejected the operation.
    OperationError,
    /// Unexpected failure, e.g. serialization.
    InternalError,
}

impl StoreResult {
    pub fn is_success(self) -> bool {
        matches!(self, StoreResult::Success)
    }
}

/// Failure of a subscription store read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store operation failed: {0}")]
    Operation(String),
}

/// Durable queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("could not encode work item: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by the redelivery loop itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedeliveryError {
    #[error("redelivery loop already started")]
    AlreadyStarted,
}
