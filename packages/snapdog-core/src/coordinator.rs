//! C9 — integration coordinator: subscribes once to the shared change-event
//! bus and fans each event out to every enabled publisher in parallel,
//! isolating one publisher's failure from the others.
//!
//! Grounded directly on `sonos/subscription_arbiter.rs`'s
//! `futures::future::join_all`-based parallel per-IP fan-out, and on
//! `events::BroadcastEventBridge`/`GenaEventProcessor::start_event_forwarder`'s
//! spawn-a-drain-loop-over-a-channel shape (SPEC_FULL.md §4.9 Rust
//! realisation).

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::model::ChangeEvent;
use crate::publisher::Publisher;
use crate::runtime::TaskSpawner;

pub struct IntegrationCoordinator {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl IntegrationCoordinator {
    #[must_use]
    pub fn new(publishers: Vec<Arc<dyn Publisher>>) -> Self {
        Self { publishers }
    }

    async fn dispatch(&self, event: ChangeEvent) {
        let enabled: Vec<_> = self.publishers.iter().filter(|p| p.is_enabled()).collect();
        join_all(enabled.into_iter().map(|publisher| {
            let event = event.clone();
            async move {
                publisher.publish(event).await;
            }
        }))
        .await;
    }

    /// Spawns the subscribe-and-fan-out loop. Exits cleanly when `cancel` is
    /// triggered (SPEC_FULL.md §4.9 "on shutdown the coordinator
    /// unsubscribes cleanly").
    pub fn start(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ChangeEvent>,
        spawner: Arc<dyn TaskSpawner>,
        cancel: CancellationToken,
    ) {
        spawner.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    received = events.recv() => {
                        match received {
                            Ok(event) => self.dispatch(event).await,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "coordinator lagged behind change-event bus");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingPublisher {
        enabled: bool,
        seen: Arc<Mutex<Vec<ChangeEvent>>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
        async fn publish(&self, event: ChangeEvent) {
            self.seen.lock().push(event);
        }
    }

    #[tokio::test]
    async fn dispatch_skips_disabled_publishers() {
        let seen_enabled = Arc::new(Mutex::new(Vec::new()));
        let seen_disabled = Arc::new(Mutex::new(Vec::new()));
        let coordinator = IntegrationCoordinator::new(vec![
            Arc::new(RecordingPublisher { enabled: true, seen: seen_enabled.clone() }),
            Arc::new(RecordingPublisher { enabled: false, seen: seen_disabled.clone() }),
        ]);

        coordinator
            .dispatch(ChangeEvent::ZoneVolumeChanged { index: 1, value: 50 })
            .await;

        assert_eq!(seen_enabled.lock().len(), 1);
        assert_eq!(seen_disabled.lock().len(), 0);
    }

    #[tokio::test]
    async fn dispatch_fans_out_to_every_enabled_publisher() {
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let coordinator = IntegrationCoordinator::new(vec![
            Arc::new(RecordingPublisher { enabled: true, seen: a.clone() }),
            Arc::new(RecordingPublisher { enabled: true, seen: b.clone() }),
        ]);
        coordinator
            .dispatch(ChangeEvent::ZoneMuteChanged { index: 1, value: true })
            .await;
        assert_eq!(a.lock().len(), 1);
        assert_eq!(b.lock().len(), 1);
    }
}
