//! Ledger event subscriber.
//!
//! Keeps one event feed open from the checkpoint onwards and hands every event to an
//! `EventHandler` in delivery order. Transport failures and handler failures both end the current
//! feed; the subscriber then waits out an exponential backoff and reopens the feed at whatever
//! block the handler reports. Any other error stops it.

use crate::config::SyncConfig;
use crate::gateway::{EventStream, LedgerGateway};
use crate::sync::SyncError;
use crate::sync::events::{Delivery, EventHandler, LedgerEvent};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconnect delays: `initial`, doubling per failed attempt, capped at `max`. A successful
/// connection starts the sequence over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub initial: Duration,
	pub max: Duration,
}

impl BackoffPolicy {
	pub fn from_config(config: &SyncConfig) -> Self {
		Self {
			initial: Duration::from_millis(config.backoff_initial_ms),
			max: Duration::from_millis(config.backoff_max_ms),
		}
	}

	/// Deterministic exponential backoff that never gives up.
	pub fn build(&self) -> ExponentialBackoff {
		ExponentialBackoff {
			current_interval: self.initial,
			initial_interval: self.initial,
			randomization_factor: 0.0,
			multiplier: 2.0,
			max_interval: self.max,
			max_elapsed_time: None,
			..ExponentialBackoff::default()
		}
	}
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self::from_config(&SyncConfig::default())
	}
}

/// How one connection ended.
enum FeedEnd {
	Cancelled,
	Reconnect(String),
	Fatal(SyncError),
}

/// Long-lived consumer of the ledger event feed
pub struct EventSubscriber {
	gateway: Arc<dyn LedgerGateway>,
	policy: BackoffPolicy,
	cancel: CancellationToken,
}

impl EventSubscriber {
	pub fn new(gateway: Arc<dyn LedgerGateway>, policy: BackoffPolicy, cancel: CancellationToken) -> Self {
		Self {
			gateway,
			policy,
			cancel,
		}
	}

	/// Run until cancelled or a non-transport error occurs.
	///
	/// Each (re)connection starts at `handler.resume_from_block()`. Cancellation is observed
	/// while connecting, while waiting for the next event and during backoff; an event already
	/// handed to the handler is finished first.
	pub async fn run<H: EventHandler + ?Sized>(&self, handler: &H) -> Result<(), SyncError> {
		let mut backoff = self.policy.build();

		loop {
			if self.cancel.is_cancelled() {
				break;
			}

			let from_block = handler.resume_from_block().await;
			debug!("Subscribing to ledger events from block {}", from_block);

			let connected = tokio::select! {
				_ = self.cancel.cancelled() => break,
				connected = self.gateway.events(from_block) => connected,
			};

			let reason = match connected {
				Ok(stream) => {
					info!("Connected to ledger event feed at block {}", from_block);
					backoff.reset();
					match self.consume(stream, handler).await {
						FeedEnd::Cancelled => break,
						FeedEnd::Reconnect(reason) => reason,
						FeedEnd::Fatal(e) => {
							error!("Event subscriber stopping: {}", e);
							return Err(e);
						}
					}
				}
				Err(e) if e.is_transport() => format!("Could not connect to event feed: {}", e),
				Err(e) => {
					error!("Event subscription rejected, stopping: {}", e);
					return Err(e.into());
				}
			};

			let delay = backoff.next_backoff().unwrap_or(self.policy.max);
			warn!("{}. Reconnecting in {}ms", reason, delay.as_millis());

			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = tokio::time::sleep(delay) => {}
			}
		}

		info!("Event subscriber stopped");
		Ok(())
	}

	/// Drive one connection until it ends. The stream is dropped on return.
	async fn consume<H: EventHandler + ?Sized>(&self, mut stream: EventStream, handler: &H) -> FeedEnd {
		loop {
			let next = tokio::select! {
				_ = self.cancel.cancelled() => return FeedEnd::Cancelled,
				next = stream.next() => next,
			};

			match next {
				Some(Ok(raw)) => {
					let event = LedgerEvent::decode(raw);
					let block = event.block_number;
					if handler.handle(event).await == Delivery::Retry {
						return FeedEnd::Reconnect(format!(
							"Event at block {} could not be applied",
							block
						));
					}
				}
				Some(Err(e)) if e.is_transport() => {
					return FeedEnd::Reconnect(format!("Event feed failed: {}", e));
				}
				Some(Err(e)) => return FeedEnd::Fatal(e.into()),
				None => return FeedEnd::Reconnect("Event feed closed".to_string()),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gateway::GatewayError;
	use crate::store::Actor;
	use crate::testing::{ConnectionScript, FakeLedger, Harness, actor, raw_event, wait_until_async};
	use serde_json::json;
	use std::sync::Mutex;

	/// Records events and asks for a resubscribe on the blocks listed in `fail_once`.
	#[derive(Default)]
	struct RecordingHandler {
		resume_from: Mutex<u64>,
		seen: Mutex<Vec<u64>>,
		fail_once: Mutex<Vec<u64>>,
	}

	#[async_trait::async_trait]
	impl EventHandler for RecordingHandler {
		async fn resume_from_block(&self) -> u64 {
			*self.resume_from.lock().unwrap()
		}

		async fn handle(&self, event: LedgerEvent) -> Delivery {
			let block = event.block_number;
			let mut fail_once = self.fail_once.lock().unwrap();
			if let Some(pos) = fail_once.iter().position(|b| *b == block) {
				fail_once.remove(pos);
				return Delivery::Retry;
			}
			self.seen.lock().unwrap().push(block);
			*self.resume_from.lock().unwrap() = block + 1;
			Delivery::Applied
		}
	}

	fn policy() -> BackoffPolicy {
		BackoffPolicy {
			initial: Duration::from_secs(1),
			max: Duration::from_secs(20),
		}
	}

	#[test]
	fn backoff_doubles_up_to_cap_and_resets() {
		let mut backoff = policy().build();
		let delays: Vec<u64> = (0..7)
			.map(|_| backoff.next_backoff().unwrap().as_secs())
			.collect();
		assert_eq!(delays, vec![1, 2, 4, 8, 16, 20, 20]);

		backoff.reset();
		assert_eq!(backoff.next_backoff().map(|d| d.as_secs()), Some(1));
	}

	#[tokio::test(start_paused = true)]
	async fn reconnects_with_backoff_until_connected() {
		let ledger = Arc::new(FakeLedger::new());
		for _ in 0..3 {
			ledger.script(ConnectionScript::Refuse(GatewayError::Unavailable(
				"connection refused".to_string(),
			)));
		}
		ledger.publish_raw(raw_event("ActorCreated", r#"{"actorId":"apotheke-1"}"#, 0));

		let cancel = CancellationToken::new();
		let subscriber = EventSubscriber::new(ledger.clone(), policy(), cancel.clone());
		let handler = Arc::new(RecordingHandler::default());

		let started = tokio::time::Instant::now();
		let task = {
			let handler = handler.clone();
			tokio::spawn(async move { subscriber.run(handler.as_ref()).await })
		};

		crate::testing::wait_until(|| !handler.seen.lock().unwrap().is_empty()).await;
		// 1s + 2s + 4s of backoff before the fourth attempt
		assert!(started.elapsed() >= Duration::from_secs(7));
		assert_eq!(ledger.subscriptions(), vec![0, 0, 0, 0]);

		cancel.cancel();
		task.await.unwrap().unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn dropped_feed_resumes_after_last_handled_block() {
		let ledger = Arc::new(FakeLedger::new());
		for block in [3, 4, 5] {
			ledger.publish_raw(raw_event("ActorCreated", r#"{"actorId":"apotheke-1"}"#, block));
		}
		ledger.script(ConnectionScript::DropAfter(1, GatewayError::StreamClosed));

		let cancel = CancellationToken::new();
		let subscriber = EventSubscriber::new(ledger.clone(), policy(), cancel.clone());
		let handler = Arc::new(RecordingHandler::default());
		let task = {
			let handler = handler.clone();
			tokio::spawn(async move { subscriber.run(handler.as_ref()).await })
		};

		crate::testing::wait_until(|| handler.seen.lock().unwrap().len() == 3).await;
		assert_eq!(*handler.seen.lock().unwrap(), vec![3, 4, 5]);
		assert_eq!(ledger.subscriptions(), vec![0, 4]);

		cancel.cancel();
		task.await.unwrap().unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn feed_dropped_inside_a_block_replays_the_whole_block() {
		let harness = Harness::new();
		harness.ledger.put_actor(actor("hersteller-1"));
		harness.ledger.put_actor(actor("apotheke-1"));
		harness.ledger.publish("ActorCreated", json!({"actorId": "hersteller-1"}), 5);
		harness.ledger.publish("ActorCreated", json!({"actorId": "apotheke-1"}), 5);
		harness.ledger.script(ConnectionScript::DropAfter(1, GatewayError::StreamClosed));

		let reconciler = Arc::new(tokio::sync::Mutex::new(harness.reconciler(5).await));
		let cancel = CancellationToken::new();
		let subscriber = EventSubscriber::new(harness.ledger.clone(), policy(), cancel.clone());
		let task = {
			let reconciler = reconciler.clone();
			tokio::spawn(async move { subscriber.run(reconciler.as_ref()).await })
		};

		let entities = harness.entities.clone();
		wait_until_async(move || {
			let entities = entities.clone();
			async move { entities.count::<Actor>().await.unwrap() == 2 }
		})
		.await;

		let actors: Vec<Actor> = harness.entities.list().await.unwrap();
		let ids: Vec<&str> = actors.iter().map(|a| a.id.as_str()).collect();
		assert_eq!(ids, vec!["apotheke-1", "hersteller-1"]);
		// the drop came after the first event of block 5, so block 5 was requested again
		assert_eq!(harness.ledger.subscriptions(), vec![0, 5]);

		cancel.cancel();
		task.await.unwrap().unwrap();
		let reconciler = reconciler.lock().await;
		reconciler.persist_checkpoint().await.unwrap();
		assert_eq!(reconciler.resume_from_block(), 5);
		assert_eq!(harness.saved_checkpoint().await.last_processed_block, None);
	}

	#[tokio::test(start_paused = true)]
	async fn handler_retry_reopens_feed_at_same_block() {
		let ledger = Arc::new(FakeLedger::new());
		for block in [1, 2] {
			ledger.publish_raw(raw_event("ActorCreated", r#"{"actorId":"apotheke-1"}"#, block));
		}

		let cancel = CancellationToken::new();
		let subscriber = EventSubscriber::new(ledger.clone(), policy(), cancel.clone());
		let handler = Arc::new(RecordingHandler::default());
		handler.fail_once.lock().unwrap().push(2);
		let task = {
			let handler = handler.clone();
			tokio::spawn(async move { subscriber.run(handler.as_ref()).await })
		};

		crate::testing::wait_until(|| handler.seen.lock().unwrap().len() == 2).await;
		assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2]);
		assert_eq!(ledger.subscriptions(), vec![0, 2]);

		cancel.cancel();
		task.await.unwrap().unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn non_transport_error_stops_subscriber() {
		let ledger = Arc::new(FakeLedger::new());
		ledger.script(ConnectionScript::Refuse(GatewayError::ProtocolError(
			"unknown chaincode".to_string(),
		)));

		let subscriber = EventSubscriber::new(ledger.clone(), policy(), CancellationToken::new());
		let handler = RecordingHandler::default();

		let result = subscriber.run(&handler).await;
		assert!(matches!(result, Err(SyncError::GatewayError(GatewayError::ProtocolError(_)))));
		assert_eq!(ledger.subscriptions(), vec![0]);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_interrupts_backoff() {
		let ledger = Arc::new(FakeLedger::new());
		ledger.script(ConnectionScript::Refuse(GatewayError::StreamClosed));

		let cancel = CancellationToken::new();
		let subscriber = EventSubscriber::new(
			ledger.clone(),
			BackoffPolicy {
				initial: Duration::from_secs(3600),
				max: Duration::from_secs(3600),
			},
			cancel.clone(),
		);
		let task = tokio::spawn(async move { subscriber.run(&RecordingHandler::default()).await });

		crate::testing::wait_until(|| ledger.subscriptions().len() == 1).await;
		cancel.cancel();
		task.await.unwrap().unwrap();
		assert_eq!(ledger.subscriptions(), vec![0]);
	}
}
