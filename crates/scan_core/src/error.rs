//! Error taxonomy for the scanning pipeline.
//!
//! Only [`ConfigurationError`] (and the [`ScanError`] wrapping it) ever reaches
//! the caller of a scan. Login, transport, status and decoding failures are
//! contained inside the worker pool and show up as counters and log lines.

use thiserror::Error;

/// Invalid tiling input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("sampling radius must be a positive number of metres, got {0}")]
    InvalidRadius(f64),

    #[error("error margin must lie in [0, 1), got {0}")]
    InvalidErrorMargin(f64),

    #[error("rectangle corner is not a finite coordinate")]
    NonFiniteCoordinate,

    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),

    #[error("longitude span of {0:.3} degrees crosses the antimeridian, which is not supported")]
    AntimeridianSpan(f64),

    #[error("average latitude {0} is too close to a pole to step in longitude")]
    PolarRectangle(f64),
}

/// Fatal startup problem; the run aborts before any session exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("invalid auth service '{0}' (expected 'ptc' or 'google')")]
    InvalidAuthProvider(String),

    #[error("configuration lists no users")]
    NoUsers,

    #[error("configuration lists no work rectangles")]
    NoWork,

    #[error("user #{0} has an empty username")]
    EmptyUsername(usize),

    #[error("work rectangle #{index} has a zero latitude or longitude span")]
    DegenerateRectangle { index: usize },

    #[error("work rectangle #{index}: {source}")]
    Rectangle {
        index: usize,
        #[source]
        source: GeometryError,
    },

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("invalid scan setting: {0}")]
    InvalidSetting(String),

    #[error(
        "a single pass is estimated at {estimated_secs:.0}s but passes start every {interval_secs}s; \
         scan a smaller area or add users"
    )]
    PassTooLong { estimated_secs: f64, interval_secs: u64 },
}

/// Login failure for one credential.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("login rejected for {username}: {reason}")]
    Rejected { username: String, reason: String },

    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// Network level failure of a single query.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("connection closed by peer")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// A response that does not have the expected structure.
#[derive(Debug, Error)]
pub enum MalformedResponse {
    #[error("response is missing {0}")]
    Missing(&'static str),

    #[error("response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Tagged failure of one query attempt, consumed by the scheduler's retry logic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("service answered with status code {0}")]
    Status(i32),
}

/// Errors that end a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("could not log in {username} after {attempts} attempts: {source}")]
    Login {
        username: String,
        attempts: u32,
        #[source]
        source: AuthError,
    },

    #[error("scan cancelled")]
    Cancelled,
}

pub type GeometryResult<T> = Result<T, GeometryError>;
pub type ConfigResult<T> = Result<T, ConfigurationError>;
pub type QueryResult<T> = Result<T, QueryFailure>;
pub type ScanResult<T> = Result<T, ScanError>;
