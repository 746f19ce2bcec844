// SPDX-License-Identifier: GPL-3.0

//! Event publication and source listening.
//!
//! Every provider owns an [`EventBus`]. Wrappers additionally run one listener task
//! that receives their source's events and hands them to a [`SourceEventHandler`].
//!
//! ```text
//! source.subscribe() ──► listener task ──► handler.on_mutate / on_refresh
//!                                                  │
//!                                                  ▼
//!                                      wrapper EventBus::publish ──► consumers
//! ```

use crate::models::{DataProviderEvent, MutationDetail, ProviderData, ProviderKey};
use async_trait::async_trait;
use std::sync::Weak;
use tokio::{
	sync::broadcast::{self, error::RecvError},
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Capacity for provider event broadcast channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe hub owned by a provider.
#[derive(Debug)]
pub struct EventBus<E: Clone> {
	sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
	/// Create a bus buffering up to `capacity` events per subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	/// Receive every event published from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<E> {
		self.sender.subscribe()
	}

	/// Publish an event. Returns the number of subscribers that will see it.
	pub fn publish(&self, event: E) -> usize {
		// No subscribers is OK.
		self.sender.send(event).unwrap_or(0)
	}

	/// Number of live subscribers.
	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl<E: Clone> Default for EventBus<E> {
	fn default() -> Self {
		Self::new(EVENT_CHANNEL_CAPACITY)
	}
}

/// Reaction of a wrapper to its source's events.
#[async_trait]
pub(crate) trait SourceEventHandler<K: ProviderKey, D: ProviderData>: Send + Sync + 'static {
	/// The source added, removed or updated rows.
	async fn on_mutate(&self, detail: MutationDetail<K, D>);

	/// The source asked consumers to discard everything fetched so far.
	async fn on_refresh(&self);

	/// Any other source event.
	async fn on_other(&self, _event: DataProviderEvent<K, D>) {}
}

/// Spawn the task feeding `receiver`'s events to `handler`.
///
/// The task stops when `shutdown` fires, the handler is dropped, or the source closes
/// its channel. Lost events are reported to the handler as a refresh.
pub(crate) fn spawn_source_listener<K, D, H>(
	mut receiver: broadcast::Receiver<DataProviderEvent<K, D>>,
	handler: Weak<H>,
	shutdown: CancellationToken,
	target: &'static str,
) -> JoinHandle<()>
where
	K: ProviderKey,
	D: ProviderData,
	H: SourceEventHandler<K, D>,
{
	tokio::spawn(async move {
		loop {
			tokio::select! {
				biased;

				_ = shutdown.cancelled() => break,

				event = receiver.recv() => {
					let Some(handler) = handler.upgrade() else { break };
					match event {
						Ok(DataProviderEvent::Mutate(detail)) => handler.on_mutate(detail).await,
						Ok(DataProviderEvent::Refresh) => handler.on_refresh().await,
						Ok(other) => handler.on_other(other).await,
						Err(RecvError::Lagged(missed)) => {
							log::warn!(target: target, "Missed {missed} source events, treating as refresh");
							handler.on_refresh().await;
						},
						Err(RecvError::Closed) => break,
					}
				}
			}
		}
		log::trace!(target: target, "Source listener stopped");
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn publish_without_subscribers_is_not_an_error() {
		let bus: EventBus<u32> = EventBus::default();
		assert_eq!(bus.publish(1), 0);
	}

	#[tokio::test]
	async fn subscribers_receive_published_events() {
		let bus: EventBus<u32> = EventBus::new(4);
		let mut first = bus.subscribe();
		let mut second = bus.subscribe();

		assert_eq!(bus.publish(7), 2);

		assert_eq!(first.recv().await.unwrap(), 7);
		assert_eq!(second.recv().await.unwrap(), 7);
		assert_eq!(bus.subscriber_count(), 2);
	}
}
