//! The remote game service as seen by the scanner.
//!
//! Authentication and the RPC transport are external; the scanner only needs
//! to log a credential in once and then issue map queries on the resulting
//! session. [`ServiceConnector`] and [`ServiceSession`] are that seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cells::QueryCellSet;
use crate::error::{AuthError, ConfigurationError, QueryFailure, QueryResult, TransportError};
use crate::geometry::SamplePoint;

/// Status code of a successful map query.
pub const STATUS_OK: i32 = 1;
/// Stands in for a status field that is present but not a 32-bit integer.
pub const STATUS_UNREADABLE: i32 = i32::MIN;

/// Account provider a credential authenticates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuthProvider {
    Ptc,
    Google,
}

impl AuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProvider::Ptc => "ptc",
            AuthProvider::Google => "google",
        }
    }
}

impl fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthProvider {
    type Err = ConfigurationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ptc" => Ok(AuthProvider::Ptc),
            "google" => Ok(AuthProvider::Google),
            other => Err(ConfigurationError::InvalidAuthProvider(other.to_string())),
        }
    }
}

impl TryFrom<String> for AuthProvider {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AuthProvider> for String {
    fn from(provider: AuthProvider) -> Self {
        provider.as_str().to_string()
    }
}

/// One worker identity.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Overrides the configuration-wide provider for this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_service: Option<AuthProvider>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_service", &self.auth_service)
            .finish()
    }
}

/// A single map-objects request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapQuery {
    pub position: SamplePoint,
    pub cell_ids: QueryCellSet,
    pub since_timestamp_ms: i64,
}

/// Undecoded answer to a [`MapQuery`].
///
/// The body is kept as JSON; the merger decides whether it has the expected
/// shape so a single odd response never takes a worker down.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status_code: i32,
    pub body: serde_json::Value,
}

impl RawResponse {
    pub fn new(status_code: i32, body: serde_json::Value) -> Self {
        Self { status_code, body }
    }

    /// Reads the status from the body's `status_code` field, assuming success
    /// when the service omits it. A status that is not a 32-bit integer is
    /// never a success.
    pub fn from_body(body: serde_json::Value) -> Self {
        let status_code = match body.get("status_code") {
            None | Some(serde_json::Value::Null) => STATUS_OK,
            Some(code) => code
                .as_i64()
                .and_then(|code| i32::try_from(code).ok())
                .unwrap_or(STATUS_UNREADABLE),
        };
        Self { status_code, body }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }
}

/// Establishes authenticated sessions.
#[async_trait]
pub trait ServiceConnector: Send + Sync + 'static {
    async fn login(
        &self,
        provider: AuthProvider,
        credentials: &Credentials,
    ) -> Result<Box<dyn ServiceSession>, AuthError>;
}

/// One authenticated connection. Queries take `&mut self`, so a session can
/// never have more than one request in flight.
#[async_trait]
pub trait ServiceSession: Send {
    async fn query(&mut self, query: &MapQuery) -> Result<RawResponse, TransportError>;

    /// Releases the underlying connection.
    async fn close(&mut self) {}
}

/// Runs one query and folds non-success status codes into the failure side.
pub async fn execute(session: &mut dyn ServiceSession, query: &MapQuery) -> QueryResult<RawResponse> {
    let response = session.query(query).await?;
    if response.is_success() {
        Ok(response)
    } else {
        Err(QueryFailure::Status(response.status_code))
    }
}
