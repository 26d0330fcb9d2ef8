//!
//! HTTP + WebSocket client for the ledger gateway.
//!
//! Transactions are evaluated and submitted over HTTP; chaincode events arrive over a WebSocket
//! subscription that starts at a caller-chosen block. All methods are async and designed for use
//! with Tokio.

use super::types::*;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

/// Event frame as sent by the gateway.
#[derive(Debug, Deserialize)]
struct WireEvent {
	#[serde(rename = "eventName")]
	event_name: String,
	/// Hex-encoded payload bytes.
	#[serde(default)]
	payload: String,
	#[serde(rename = "blockNumber")]
	block_number: u64,
	#[serde(rename = "transactionId", default)]
	transaction_id: String,
}

impl TryFrom<WireEvent> for RawLedgerEvent {
	type Error = GatewayError;

	fn try_from(event: WireEvent) -> Result<Self, Self::Error> {
		Ok(RawLedgerEvent {
			payload: hex::decode(&event.payload)?,
			name: event.event_name,
			block_number: event.block_number,
			tx_id: event.transaction_id,
		})
	}
}

/// Ledger gateway client
#[derive(Clone)]
pub struct LedgerGatewayClient {
	/// The underlying HTTP client for transaction calls.
	http_client: Client,
	/// The base URL of the gateway's HTTP endpoint.
	gateway_url: String,
	/// The WebSocket URL for the event feed.
	ws_url: String,
	/// The chaincode all calls and subscriptions are scoped to.
	chaincode: String,
}

impl LedgerGatewayClient {
	/// Create a new gateway client.
	///
	/// # Arguments
	/// * `gateway_url` - The HTTP endpoint for submit/evaluate.
	/// * `ws_url` - The WebSocket endpoint for the event feed.
	/// * `chaincode` - The chaincode name.
	/// * `timeout` - Per-request timeout for HTTP calls.
	pub fn new(
		gateway_url: String,
		ws_url: String,
		chaincode: String,
		timeout: Duration,
	) -> Result<Self, GatewayError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			gateway_url: gateway_url.trim_end_matches('/').to_string(),
			ws_url,
			chaincode,
		})
	}

	/// Execute a transaction call against `/chaincodes/{chaincode}/transactions/{mode}`.
	///
	/// # Returns
	/// The raw result payload, or `GatewayError::Rejected` if the ledger refused the call.
	async fn call(&self, mode: &str, name: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError> {
		let url = format!(
			"{}/chaincodes/{}/transactions/{}",
			self.gateway_url, self.chaincode, mode
		);
		let request_body = json!({
			"name": name,
			"args": args,
		});

		let response = self
			.http_client
			.post(&url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		let status = response.status();
		let body = response.bytes().await?;

		if !status.is_success() {
			let message = String::from_utf8_lossy(&body).into_owned();
			error!("Transaction '{}' ({}) failed with {}: {}", name, mode, status, message);
			return Err(GatewayError::Rejected {
				name: name.to_string(),
				message: format!("HTTP {}: {}", status, message),
			});
		}

		debug!("Transaction '{}' ({}) returned {} bytes", name, mode, body.len());
		Ok(body.to_vec())
	}
}

#[async_trait::async_trait]
impl LedgerGateway for LedgerGatewayClient {
	async fn submit(&self, name: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError> {
		let result = self.call("submit", name, args).await?;
		info!("Transaction '{}' submitted", name);
		Ok(result)
	}

	async fn evaluate(&self, name: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError> {
		self.call("evaluate", name, args).await
	}

	/// Subscribe to chaincode events from a given block.
	///
	/// # Errors
	/// Returns `GatewayError` if the WebSocket connection or the subscription handshake fails.
	async fn events(&self, from_block: u64) -> Result<EventStream, GatewayError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		let (ws_stream, response) = connect_async(self.ws_url.as_str()).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let subscribe_message = json!({
			"type": "subscribe",
			"chaincode": self.chaincode,
			"startBlock": from_block,
		});
		ws_sender
			.send(Message::Text(subscribe_message.to_string()))
			.await?;

		// Wait for subscription ack
		match ws_receiver.next().await {
			Some(msg) => match msg? {
				Message::Text(text) => {
					let parsed: serde_json::Value = serde_json::from_str(&text)?;
					match parsed.get("type").and_then(|t| t.as_str()) {
						Some("subscribed") => {}
						Some("error") => {
							let error_msg = parsed
								.get("message")
								.and_then(|m| m.as_str())
								.unwrap_or("Unknown subscription error");
							return Err(GatewayError::ProtocolError(error_msg.to_string()));
						}
						_ => {
							return Err(GatewayError::ProtocolError(
								"Subscription not acknowledged".to_string(),
							));
						}
					}
				}
				_ => {
					return Err(GatewayError::ProtocolError(
						"Unexpected message type during handshake".to_string(),
					));
				}
			},
			None => return Err(GatewayError::StreamClosed),
		}

		info!(
			"Subscribed to events of chaincode '{}' from block {}",
			self.chaincode, from_block
		);

		// The sender half must live as long as the stream, otherwise the socket is closed.
		let stream = ws_receiver.filter_map(move |msg| {
			let _keep_open = &ws_sender;
			let item = match msg {
				Ok(Message::Text(text)) => parse_frame(&text),
				Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
				Ok(Message::Close(frame)) => {
					debug!("Event stream closed by gateway: {:?}", frame);
					Some(Err(GatewayError::StreamClosed))
				}
				Ok(_) => Some(Err(GatewayError::ProtocolError(
					"Unexpected message type".to_string(),
				))),
				Err(e) => Some(Err(GatewayError::WebSocketError(e))),
			};
			futures_util::future::ready(item)
		});

		Ok(Box::pin(stream))
	}
}

/// Turn one text frame into a stream item; `None` for frames that carry no event.
fn parse_frame(text: &str) -> Option<Result<RawLedgerEvent, GatewayError>> {
	let parsed: serde_json::Value = match serde_json::from_str(text) {
		Ok(parsed) => parsed,
		Err(e) => return Some(Err(GatewayError::JsonError(e))),
	};

	match parsed.get("type").and_then(|t| t.as_str()) {
		Some("event") => Some(
			serde_json::from_value::<WireEvent>(parsed)
				.map_err(GatewayError::JsonError)
				.and_then(RawLedgerEvent::try_from),
		),
		Some("error") => {
			let error_msg = parsed
				.get("message")
				.and_then(|m| m.as_str())
				.unwrap_or("Unknown subscription error");
			Some(Err(GatewayError::ProtocolError(error_msg.to_string())))
		}
		Some(other) => {
			debug!("Ignoring message type: {}", other);
			None
		}
		None => Some(Err(GatewayError::ProtocolError(
			"Message missing type field".to_string(),
		))),
	}
}
