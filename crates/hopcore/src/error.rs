use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Step '{step}' failed: {message}")]
    User { step: String, message: String },

    #[error("Retry: {0}")]
    Retry(String),

    #[error("Node not inited on any live host: {0}")]
    NotInited(String),

    #[error("Flow terminated")]
    Terminated,

    #[error("Subflow finished")]
    SubflowFinished,
}

impl FlowError {
    /// Retryable errors mean the message transport should redeliver
    /// instead of the trace recording a failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Retry(_) | FlowError::NotInited(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum BuildError {
    #[error("Flow already inited: {0}")]
    AlreadyInited(String),

    #[error("Flow node needs an explicit id (strict mode): {0}")]
    MissingId(String),

    #[error("Id can only be set once: {0}")]
    IdAlreadySet(String),

    #[error("Step id '{0}' already registered with a different shape")]
    IdReused(String),

    #[error("Call type '{call_type}' already claimed by entry '{owner}'")]
    CallTypeReused { call_type: String, owner: String },

    #[error("Call type '{0}' is reserved for engine transfers")]
    ReservedCallType(String),

    #[error("Entry '{0}' registered twice in one pipeline")]
    EntryCollision(String),

    #[error("Invalid omit pattern: {0}")]
    InvalidPattern(String),

    #[error("Fan-out arity mismatch: expected {expected}, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Stored state unreadable: {0}")]
    Format(#[from] serde_json::Error),
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;
