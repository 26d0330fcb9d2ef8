//! Types for the ledger gateway boundary

use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A chaincode event as delivered by the gateway's event feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLedgerEvent {
    /// The name the chaincode raised the event under.
    #[serde(rename = "eventName")]
    pub name: String,
    /// The event payload (JSON produced by the chaincode).
    pub payload: Vec<u8>,
    /// The block the emitting transaction was committed in.
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
    /// The id of the emitting transaction.
    #[serde(rename = "transactionId")]
    pub tx_id: String,
}

/// Ordered stream of events from one subscription.
pub type EventStream =
    Pin<Box<dyn futures_util::Stream<Item = Result<RawLedgerEvent, GatewayError>> + Send>>;

/// The two RPCs and the block-ordered event subscription the sync core needs from the ledger.
#[async_trait::async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Submit a write transaction and return its result payload.
    async fn submit(&self, name: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError>;

    /// Evaluate a read-only transaction and return its result payload.
    async fn evaluate(&self, name: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError>;

    /// Open the event feed starting at `from_block` (inclusive).
    ///
    /// Dropping the returned stream closes the underlying connection.
    async fn events(&self, from_block: u64) -> Result<EventStream, GatewayError>;
}

/// Error types for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Payload decode error: {0}")]
    PayloadError(#[from] hex::FromHexError),

    #[error("Transaction '{name}' rejected by the ledger: {message}")]
    Rejected { name: String, message: String },

    #[error("Event stream closed by the gateway")]
    StreamClosed,

    #[error("Connection failed: {0}")]
    Unavailable(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl GatewayError {
    /// Whether this error is a transport failure that a reconnect may cure.
    pub fn is_transport(&self) -> bool {
        match self {
            GatewayError::WebSocketError(_)
            | GatewayError::StreamClosed
            | GatewayError::Unavailable(_) => true,
            GatewayError::HttpError(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            GatewayError::JsonError(_)
            | GatewayError::PayloadError(_)
            | GatewayError::Rejected { .. }
            | GatewayError::ProtocolError(_) => false,
        }
    }
}
