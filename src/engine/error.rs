use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or ordering-violating input.
    Validation(&'static str),
    /// The proposed span overlaps this booking.
    Conflict(Ulid),
    NotFound(Ulid),
    /// Wrong owner, missing role, or a self/last-admin rule.
    Forbidden(&'static str),
    /// Bad credentials, or no principal on a session that needs one.
    Unauthorized,
    AlreadyExists(String),
    LimitExceeded(&'static str),
    /// Storage unavailable. Not user-correctable.
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Conflict(id) => write!(f, "overlapping booking exists: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Unauthorized => write!(f, "invalid credentials"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
