//! Explicit multi-producer/multi-consumer event fan-out between the state stores
//! (C7, C8, C1) and the integration coordinator (C9), replacing the
//! ambient-mediator "Event += handler" pattern named in SPEC_FULL.md §9 with a
//! broadcast channel the coordinator owns the subscription lifetime of.

use tokio::sync::broadcast;

use crate::model::ChangeEvent;

/// Emits [`ChangeEvent`]s to every current subscriber. Implemented by
/// [`ChangeEventBus`]; a `NoopEventEmitter` exists for components under test
/// that don't care about fan-out.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: ChangeEvent);
}

/// Broadcasts [`ChangeEvent`]s from C1/C7/C8 to every subscriber (C9 being the
/// primary one, but tests and future transports can subscribe independently).
#[derive(Clone)]
pub struct ChangeEventBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl EventEmitter for ChangeEventBus {
    fn emit(&self, event: ChangeEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::trace!(?err, "no change-event subscribers");
        }
    }
}

/// Test double that records nothing and emits nowhere; used where a store needs
/// an `EventEmitter` but the test only cares about the store's own state.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: ChangeEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct CountingEventEmitter {
        events: Arc<Mutex<Vec<ChangeEvent>>>,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, event: ChangeEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn counting_emitter_records_every_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let emitter = CountingEventEmitter {
            events: events.clone(),
        };
        emitter.emit(ChangeEvent::ZoneVolumeChanged { index: 1, value: 10 });
        emitter.emit(ChangeEvent::ZoneVolumeChanged { index: 1, value: 20 });
        assert_eq!(events.lock().len(), 2);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers_present_at_emit_time() {
        let bus = ChangeEventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(ChangeEvent::ZoneMuteChanged { index: 1, value: true });
        let received = rx.recv().await.unwrap();
        matches!(received, ChangeEvent::ZoneMuteChanged { index: 1, value: true });
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let bus = ChangeEventBus::new(8);
        bus.emit(ChangeEvent::ZoneMuteChanged { index: 1, value: true });
    }
}
