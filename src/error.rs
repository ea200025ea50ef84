use thiserror::Error;

/// Failure raised by a backing store primitive.
///
/// Anything in here is a transport-class failure from the caller's point of view.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("item encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transaction cancelled: condition failed on {table} key {key}")]
    ConditionFailed { table: String, key: String },

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("malformed item in {table}: {reason}")]
    InvalidItem { table: String, reason: String },

    #[error("record does not encode to an attribute map: {0}")]
    NotAnItem(String),

    #[error("store handle is closed")]
    Closed,

    #[error("{0}")]
    Unavailable(String),
}

/// Why a request was rejected before touching the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("too many programs: {count} exceeds the limit of {limit}")]
    TooManyPrograms { count: usize, limit: usize },

    #[error("entry #{index} has an empty pid")]
    EmptyPid { index: usize },

    #[error("update for {pid} has status {status:?}; expected one of Success, Error, Already")]
    DisallowedStatus { pid: String, status: String },

    #[error("pid {pid} appears more than once in the same request")]
    DuplicatePid { pid: String },
}

/// Error returned by the public repository operations.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("program {pid} not found")]
    NotFound { pid: String },

    #[error("store failure: {0}")]
    Transport(#[from] StoreError),
}

impl ProgramError {
    /// HTTP-style status the API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ProgramError::Validation(_) => 400,
            ProgramError::NotFound { .. } => 404,
            ProgramError::Transport(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramError::Validation(_) => "validation",
            ProgramError::NotFound { .. } => "not_found",
            ProgramError::Transport(_) => "transport",
        }
    }
}

pub type Result<T, E = ProgramError> = std::result::Result<T, E>;
