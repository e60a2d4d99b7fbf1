// Error types shared across the board service.

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone)]
pub enum BoardError {
    /// Unknown stop identifier - surfaces to the caller as a 404.
    NotFound(String),
    /// Network failure, timeout, or non-2xx response while fetching.
    NetworkError(String),
    /// Malformed feed payload or archive contents.
    ParseError(String),
    /// Static data file missing or unreadable.
    FileError(String),
}

impl std::fmt::Display for BoardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoardError::NotFound(e) => write!(f, "Not found: {}", e),
            BoardError::NetworkError(e) => write!(f, "Network error: {}", e),
            BoardError::ParseError(e) => write!(f, "Parse error: {}", e),
            BoardError::FileError(e) => write!(f, "File error: {}", e),
        }
    }
}

impl std::error::Error for BoardError {}

pub type Result<T> = std::result::Result<T, BoardError>;
