//! WebSocket map gateway client
//!
//! Implements the scanner's service capability against a gateway that speaks
//! JSON over WebSocket. Every session owns at most one connection at a time.
//!
//! Replies carry no request id, so a connection whose request failed or timed
//! out may still deliver that stale reply. Such a connection is dropped and
//! the next query opens and logs in a fresh one.
//!
//! ## Protocol
//!
//! * login: `{"type":"login","provider","username","password"}` answered by
//!   `{"type":"login_result","success","message"}`
//! * query: `{"type":"get_map_objects","latitude","longitude","altitude",
//!   "cell_ids","since_timestamp_ms"}` answered by the raw map response,
//!   `{"status_code", "map_cells": [...]}`

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use scan_core::{
    AuthError, AuthProvider, Credentials, MapQuery, RawResponse, ServiceConnector, ServiceSession, TransportError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage<'a> {
    Login {
        provider: &'a str,
        username: &'a str,
        password: &'a str,
    },
    GetMapObjects {
        latitude: f64,
        longitude: f64,
        altitude: f64,
        cell_ids: &'a [u64],
        since_timestamp_ms: Vec<i64>,
    },
}

#[derive(Debug, Deserialize)]
struct LoginResult {
    success: bool,
    #[serde(default)]
    message: String,
}

/// Opens one gateway connection per login.
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    endpoint: String,
    request_timeout: Duration,
}

impl GatewayConnector {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout,
        }
    }
}

/// One worker identity on the gateway. `socket` is `None` after a failed
/// request until the next query reconnects.
pub struct GatewaySession {
    connector: GatewayConnector,
    provider: AuthProvider,
    credentials: Credentials,
    socket: Option<Socket>,
}

async fn send_json(socket: &mut Socket, message: &ClientMessage<'_>) -> Result<(), TransportError> {
    let json = serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))
}

/// Reads frames until a text frame arrives and decodes it.
async fn next_json(socket: &mut Socket) -> Result<serde_json::Value, TransportError> {
    while let Some(frame) = socket.next().await {
        match frame.map_err(|e| TransportError::Connection(e.to_string()))? {
            Message::Text(text) => {
                return serde_json::from_str(&text).map_err(|e| TransportError::Protocol(e.to_string()));
            }
            Message::Close(_) => return Err(TransportError::Closed),
            other => debug!("Ignoring non-text frame: {:?}", other),
        }
    }
    Err(TransportError::Closed)
}

/// Sends `message` and waits for the reply, bounded by `limit`.
async fn round_trip(
    socket: &mut Socket,
    message: &ClientMessage<'_>,
    limit: Duration,
) -> Result<serde_json::Value, TransportError> {
    timeout(limit, async {
        send_json(socket, message).await?;
        next_json(socket).await
    })
    .await
    .map_err(|_| TransportError::Timeout(limit.as_millis() as u64))?
}

impl GatewayConnector {
    /// Connects and logs `credentials` in on a new socket.
    async fn open(&self, provider: AuthProvider, credentials: &Credentials) -> Result<Socket, AuthError> {
        let (mut socket, _) = timeout(self.request_timeout, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| AuthError::Unavailable(format!("connecting to {} timed out", self.endpoint)))?
            .map_err(|e| AuthError::Unavailable(format!("{}: {}", self.endpoint, e)))?;

        let request = ClientMessage::Login {
            provider: provider.as_str(),
            username: &credentials.username,
            password: &credentials.password,
        };
        let reply = round_trip(&mut socket, &request, self.request_timeout)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        let result: LoginResult =
            serde_json::from_value(reply).map_err(|e| AuthError::Unavailable(format!("bad login reply: {e}")))?;

        if !result.success {
            let _ = socket.close(None).await;
            return Err(AuthError::Rejected {
                username: credentials.username.clone(),
                reason: result.message,
            });
        }

        Ok(socket)
    }
}

#[async_trait]
impl ServiceConnector for GatewayConnector {
    async fn login(
        &self,
        provider: AuthProvider,
        credentials: &Credentials,
    ) -> Result<Box<dyn ServiceSession>, AuthError> {
        let socket = self.open(provider, credentials).await?;
        Ok(Box::new(GatewaySession {
            connector: self.clone(),
            provider,
            credentials: credentials.clone(),
            socket: Some(socket),
        }))
    }
}

impl GatewaySession {
    async fn socket(&mut self) -> Result<&mut Socket, TransportError> {
        if self.socket.is_none() {
            info!("🔄 Reconnecting gateway session for {}", self.credentials.username);
            let socket = self
                .connector
                .open(self.provider, &self.credentials)
                .await
                .map_err(|e| TransportError::Connection(format!("reconnect failed: {e}")))?;
            self.socket = Some(socket);
        }
        self.socket.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl ServiceSession for GatewaySession {
    async fn query(&mut self, query: &MapQuery) -> Result<RawResponse, TransportError> {
        let cell_ids = query.cell_ids.ids();
        let request = ClientMessage::GetMapObjects {
            latitude: query.position.latitude,
            longitude: query.position.longitude,
            altitude: query.position.altitude,
            cell_ids,
            since_timestamp_ms: vec![query.since_timestamp_ms; cell_ids.len()],
        };
        let limit = self.connector.request_timeout;
        let socket = self.socket().await?;
        match round_trip(socket, &request, limit).await {
            Ok(body) => Ok(RawResponse::from_body(body)),
            Err(e) => {
                debug!("Dropping gateway connection for {} after: {}", self.credentials.username, e);
                self.socket = None;
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                warn!("Error closing gateway connection: {}", e);
            }
        }
    }
}
