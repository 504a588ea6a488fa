use thiserror::Error;

/// Errors produced while obtaining a single tile.
///
/// Every variant is scoped to one tile. The bulk fetch path logs these and
/// skips the tile; only [`TileError::InvalidRequest`] is ever returned to a
/// bulk caller, and only from the entry point.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TileError {
    /// Network or connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// The fetch did not finish within the per-tile timeout
    #[error("Fetch timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// Bytes were received but are not a decodable image
    #[error("Failed to decode tile: {message}")]
    Decode { message: String },

    /// Response body ended before the declared length
    #[error("Truncated body: expected {expected} bytes, got {actual}")]
    TruncatedBody { expected: u64, actual: u64 },

    /// Malformed input rejected at the boundary
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The caller computing this tile went away without a result
    #[error("In-flight computation was abandoned")]
    Abandoned,

    /// The bulk request computing this tile was cancelled before its fetch
    /// started
    #[error("Cancelled")]
    Cancelled,
}

impl TileError {
    /// Whether this error belongs to the transport family
    /// (connection, status, timeout, framing).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TileError::Transport(_)
                | TileError::HttpStatus { .. }
                | TileError::Timeout { .. }
                | TileError::TruncatedBody { .. }
        )
    }

    /// Whether the caller computing this tile gave up without a result,
    /// so a waiter may compute it instead.
    pub fn is_leader_gone(&self) -> bool {
        matches!(self, TileError::Abandoned | TileError::Cancelled)
    }
}

/// Errors raised while constructing a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// HTTP client could not be built
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),

    /// A configured header name or value is not valid HTTP
    #[error("Invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },

    /// URL template does not produce a valid URL
    #[error("Invalid URL template: {0}")]
    InvalidTemplate(String),
}

impl From<TransportError> for TileError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidTemplate(msg) => TileError::InvalidRequest(msg),
            other => TileError::Transport(other.to_string()),
        }
    }
}
