//! C10 — the smart publisher: a hybrid direct/queue publish path with a
//! per-(publisher, scope) circuit breaker.
//!
//! Circuit state is `AtomicBool` (direct_enabled) + `AtomicU32`
//! (consecutive_failures) + `parking_lot::Mutex<Option<Instant>>`
//! (last_failure) — exactly the shared-resource policy SPEC_FULL.md §5
//! prescribes, grounded on the atomic-state-before-I/O pattern of
//! `sonos/subscription_arbiter.rs`'s `sync_ips: DashSet` (mutate shared
//! state before I/O to close TOCTOU windows). The fallback queue is a
//! `DashMap<Scope, mpsc::UnboundedSender<_>>` with a background drainer per
//! scope spawned via `TaskSpawner`, grounded on
//! `GenaEventProcessor::start_event_forwarder`'s drain-an-mpsc-receiver shape.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SnapDogError;
use crate::model::{ChangeEvent, Scope};
use crate::runtime::TaskSpawner;

const FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// A transport-specific adapter the publisher drives. Implemented by an MQTT
/// adapter (topic/payload derivation, §6) and a KNX adapter (group-address +
/// DPT encode, §4.12); the publisher itself knows nothing about either wire
/// format.
#[async_trait]
pub trait TransportPublish: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_connected(&self) -> bool;
    async fn publish_event(&self, event: &ChangeEvent) -> Result<(), SnapDogError>;
}

/// The C9-facing interface: every enabled publisher the coordinator fans
/// events out to.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_enabled(&self) -> bool;
    async fn publish(&self, event: ChangeEvent);
}

struct CircuitState {
    direct_enabled: AtomicBool,
    consecutive_failures: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            direct_enabled: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_failure: Mutex::new(None),
        }
    }
}

struct QueuedPublish {
    event: ChangeEvent,
}

/// Wraps one [`TransportPublish`] behind the hybrid direct/queue algorithm
/// (SPEC_FULL.md §4.10). One instance per transport (MQTT, KNX, ...).
pub struct SmartPublisher {
    inner: Arc<dyn TransportPublish>,
    circuit: CircuitState,
    cooldown: Duration,
    queues: DashMap<Scope, mpsc::UnboundedSender<QueuedPublish>>,
}

impl SmartPublisher {
    #[must_use]
    pub fn new(inner: Arc<dyn TransportPublish>, spawner: Arc<dyn TaskSpawner>) -> Arc<Self> {
        let publisher = Arc::new(Self {
            inner,
            circuit: CircuitState::default(),
            cooldown: DEFAULT_COOLDOWN,
            queues: DashMap::new(),
        });
        for scope in [Scope::Zone, Scope::Client, Scope::Global] {
            publisher.spawn_drainer(scope, &spawner);
        }
        publisher
    }

    fn spawn_drainer(self: &Arc<Self>, scope: Scope, spawner: &Arc<dyn TaskSpawner>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedPublish>();
        self.queues.insert(scope, tx);
        let publisher = self.clone();
        spawner.spawn(async move {
            while let Some(queued) = rx.recv().await {
                publisher.check_circuit_breaker_reset();
                if let Err(err) = publisher.inner.publish_event(&queued.event).await {
                    tracing::warn!(publisher = publisher.inner.name(), %err, "queued publish retry failed, re-enqueuing");
                    publisher.enqueue(scope, queued.event);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        });
    }

    fn enqueue(&self, scope: Scope, event: ChangeEvent) {
        if let Some(tx) = self.queues.get(&scope) {
            // Enqueue is lock-free and cannot fail the caller's publish
            // (SPEC_FULL.md §4.10 step 4); a closed receiver only happens at
            // shutdown, at which point dropping the event is correct.
            let _ = tx.send(QueuedPublish { event });
        }
    }

    /// Re-opens the direct path if the cooldown has elapsed since the last
    /// failure (SPEC_FULL.md §4.10 step 5).
    pub fn check_circuit_breaker_reset(&self) {
        let should_reset = self
            .circuit
            .last_failure
            .lock()
            .is_some_and(|at| at.elapsed() > self.cooldown);
        if should_reset {
            self.circuit.direct_enabled.store(true, Ordering::SeqCst);
            self.circuit.consecutive_failures.store(0, Ordering::SeqCst);
            *self.circuit.last_failure.lock() = None;
            tracing::info!(publisher = self.inner.name(), "circuit breaker reset, direct path re-enabled");
        }
    }

    fn record_failure(&self) {
        let count = self.circuit.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.circuit.last_failure.lock() = Some(Instant::now());
        tracing::warn!(publisher = self.inner.name(), count, "direct publish failed");
        if count >= FAILURE_THRESHOLD {
            self.circuit.direct_enabled.store(false, Ordering::SeqCst);
            tracing::warn!(publisher = self.inner.name(), "circuit opened, falling back to queue");
        }
    }

    fn record_success(&self) {
        self.circuit.consecutive_failures.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Publisher for SmartPublisher {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn is_enabled(&self) -> bool {
        true
    }

    /// Never fails: every event leads to at least one publish attempt,
    /// either now (direct) or later (queued) — SPEC_FULL.md §4.10's
    /// at-least-one-attempt guarantee.
    async fn publish(&self, event: ChangeEvent) {
        self.check_circuit_breaker_reset();

        let direct_ok = self.circuit.direct_enabled.load(Ordering::SeqCst) && self.inner.is_connected();
        if direct_ok {
            match self.inner.publish_event(&event).await {
                Ok(()) => {
                    self.record_success();
                    return;
                }
                Err(err) => {
                    tracing::warn!(publisher = self.inner.name(), %err, "direct publish failed");
                    self.record_failure();
                }
            }
        }
        self.enqueue(event.scope(), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;
    use std::sync::atomic::AtomicU32 as CountAtomic;

    struct FlakyTransport {
        connected: AtomicBool,
        failures_remaining: CountAtomic,
    }

    #[async_trait]
    impl TransportPublish for FlakyTransport {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn publish_event(&self, _event: &ChangeEvent) -> Result<(), SnapDogError> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(SnapDogError::Transport("simulated failure".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let transport = Arc::new(FlakyTransport {
            connected: AtomicBool::new(true),
            failures_remaining: CountAtomic::new(10),
        });
        let publisher = SmartPublisher::new(transport, Arc::new(TokioSpawner::current()));

        for _ in 0..FAILURE_THRESHOLD {
            publisher
                .publish(ChangeEvent::ZoneVolumeChanged { index: 1, value: 10 })
                .await;
        }
        assert!(!publisher.circuit.direct_enabled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn successful_publish_resets_failure_counter() {
        let transport = Arc::new(FlakyTransport {
            connected: AtomicBool::new(true),
            failures_remaining: CountAtomic::new(0),
        });
        let publisher = SmartPublisher::new(transport, Arc::new(TokioSpawner::current()));
        publisher
            .publish(ChangeEvent::ZoneVolumeChanged { index: 1, value: 10 })
            .await;
        assert_eq!(publisher.circuit.consecutive_failures.load(Ordering::SeqCst), 0);
        assert!(publisher.circuit.direct_enabled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disconnected_transport_routes_straight_to_queue() {
        let transport = Arc::new(FlakyTransport {
            connected: AtomicBool::new(false),
            failures_remaining: CountAtomic::new(0),
        });
        let publisher = SmartPublisher::new(transport, Arc::new(TokioSpawner::current()));
        // Must not panic or block even though the transport is never tried.
        publisher
            .publish(ChangeEvent::ZoneVolumeChanged { index: 1, value: 10 })
            .await;
    }
}
