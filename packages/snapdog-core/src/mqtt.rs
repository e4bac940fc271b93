//! C4 — MQTT transport, wrapping `rumqttc`'s `AsyncClient`/`EventLoop` behind
//! the same connect/publish/subscribe/lifecycle-event contract C2 presents for
//! Snapcast.
//!
//! The `EventLoop::poll()` reader loop is shaped exactly like C2's reader
//! loop and C3's notification dispatch, and is drained by a spawned task the
//! same way `GenaEventProcessor::start_event_forwarder` drains its
//! `mpsc::Receiver`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;

use crate::error::SnapDogError;
use crate::model::{ChangeEvent, PlaybackState};
use crate::policy::{retry, RetryPolicy};
use crate::publisher::TransportPublish;
use crate::runtime::TaskSpawner;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("mqtt connect error: {0}")]
    Connect(String),
    #[error("mqtt publish error: {0}")]
    Publish(String),
}

#[derive(Debug, Clone)]
pub enum MqttEvent {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
}

/// QoS/retain policy for a single publish (SPEC_FULL.md §4.4 invariants):
/// status topics default to at-least-once + retained, error/ephemeral topics
/// are non-retained.
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    #[must_use]
    pub fn retained_status() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }

    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// MQTT transport. `subscribe_filters` is replayed on every successful
/// reconnect (SPEC_FULL.md §4.4).
pub struct MqttTransport {
    client: AsyncClient,
    events: broadcast::Sender<MqttEvent>,
    subscribe_filters: parking_lot::Mutex<Vec<String>>,
    connected: AtomicBool,
}

impl MqttTransport {
    #[must_use]
    pub fn new(host: &str, port: u16, client_id: &str, username: Option<&str>, password: Option<&str>, keep_alive_secs: u16) -> (Self, broadcast::Receiver<MqttEvent>, rumqttc::EventLoop) {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(u64::from(keep_alive_secs)));
        if let (Some(user), Some(pass)) = (username, password) {
            options.set_credentials(user, pass);
        }
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = broadcast::channel(256);
        (
            Self {
                client,
                events: tx,
                subscribe_filters: parking_lot::Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
            },
            rx,
            eventloop,
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MqttEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        self.client
            .publish(topic, options.qos, options.retain, payload)
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    pub async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::Connect(e.to_string()))?;
        self.subscribe_filters.lock().push(filter.to_string());
        Ok(())
    }

    async fn resubscribe_all(&self) {
        let filters: Vec<String> = self.subscribe_filters.lock().clone();
        for filter in filters {
            if let Err(err) = self
                .client
                .subscribe(&filter, QoS::AtLeastOnce)
                .await
            {
                tracing::warn!(%err, filter, "mqtt resubscribe after reconnect failed");
            }
        }
    }

    /// Drives `eventloop.poll()` and republishes `MqttEvent`s; reconnection
    /// itself is handled internally by `rumqttc`'s event loop, so this task
    /// only needs to notice `ConnAck`/disconnect transitions and re-apply
    /// subscriptions (SPEC_FULL.md §4.4: "Subscriptions are re-applied on
    /// every successful reconnect").
    pub fn spawn_event_loop(self: Arc<Self>, mut eventloop: rumqttc::EventLoop, spawner: Arc<dyn TaskSpawner>) {
        spawner.spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.connected.store(true, Ordering::SeqCst);
                        let _ = self.events.send(MqttEvent::Connected);
                        self.resubscribe_all().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let _ = self.events.send(MqttEvent::Message {
                            topic: p.topic.clone(),
                            payload: p.payload.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.connected.store(false, Ordering::SeqCst);
                        let _ = self.events.send(MqttEvent::Disconnected(err.to_string()));
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });
    }

    /// Waits for the first `Connected` event after construction, retrying the
    /// wait window under `policy` — used by C11 to gate bring-up on a live
    /// broker session rather than the eventloop object merely existing.
    pub async fn wait_until_connected(
        &self,
        policy: RetryPolicy,
    ) -> Result<(), MqttError> {
        let rx = tokio::sync::Mutex::new(self.subscribe_events());
        retry(
            policy,
            "mqtt-wait-connected",
            |_e: &MqttError| true,
            |attempt, max, err| {
                tracing::warn!(attempt, max, %err, "mqtt not yet connected");
            },
            || async {
                let mut rx = rx.lock().await;
                match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                    Ok(Ok(MqttEvent::Connected)) => Ok(()),
                    _ => Err(MqttError::Connect("broker not reachable".to_string())),
                }
            },
        )
        .await
    }
}

/// Derives the outbound status topic and scalar payload for a change event
/// (SPEC_FULL.md §6 outbound topic surface, §9-OQ2's singular `zone`/`client`
/// grammar).
#[must_use]
pub fn topic_and_payload(base: &str, event: &ChangeEvent) -> (String, String) {
    match event {
        ChangeEvent::ZoneVolumeChanged { index, value } => (format!("{base}/zone/{index}/volume"), value.to_string()),
        ChangeEvent::ZoneMuteChanged { index, value } => (format!("{base}/zone/{index}/mute"), value.to_string()),
        ChangeEvent::ZonePlaybackChanged { index, value } => (
            format!("{base}/zone/{index}/playback"),
            match value {
                PlaybackState::Stopped => "stopped",
                PlaybackState::Playing => "playing",
                PlaybackState::Paused => "paused",
            }
            .to_string(),
        ),
        ChangeEvent::ZoneTrackChanged { index, value } => (
            format!("{base}/zone/{index}/track"),
            value.as_ref().map(|t| t.index.to_string()).unwrap_or_default(),
        ),
        ChangeEvent::ZonePlaylistChanged { index, value } => (
            format!("{base}/zone/{index}/playlist"),
            value.as_ref().map(|p| p.index.to_string()).unwrap_or_default(),
        ),
        ChangeEvent::ZoneTrackRepeatChanged { index, value } => {
            (format!("{base}/zone/{index}/track_repeat"), value.to_string())
        }
        ChangeEvent::ZonePlaylistRepeatChanged { index, value } => {
            (format!("{base}/zone/{index}/playlist/repeat"), value.to_string())
        }
        ChangeEvent::ZonePlaylistShuffleChanged { index, value } => {
            (format!("{base}/zone/{index}/playlist/shuffle"), value.to_string())
        }
        ChangeEvent::ClientVolumeChanged { index, value } => {
            (format!("{base}/client/{index}/volume"), value.to_string())
        }
        ChangeEvent::ClientMuteChanged { index, value } => (format!("{base}/client/{index}/mute"), value.to_string()),
        ChangeEvent::ClientLatencyChanged { index, value } => {
            (format!("{base}/client/{index}/latency"), value.to_string())
        }
        ChangeEvent::ClientNameChanged { index, value } => (format!("{base}/client/{index}/name"), value.clone()),
        ChangeEvent::ClientConnectedChanged { index, value } => {
            (format!("{base}/client/{index}/connected"), value.to_string())
        }
        ChangeEvent::ClientZoneChanged { index, value } => (
            format!("{base}/client/{index}/zone"),
            value.map(|z| z.to_string()).unwrap_or_default(),
        ),
    }
}

/// The [`TransportPublish`] adapter C10 drives for the MQTT leg: derives the
/// topic/payload from the event and publishes retained, at-least-once.
pub struct MqttPublisher {
    transport: Arc<MqttTransport>,
    base_topic: String,
}

impl MqttPublisher {
    #[must_use]
    pub fn new(transport: Arc<MqttTransport>, base_topic: impl Into<String>) -> Self {
        Self {
            transport,
            base_topic: base_topic.into(),
        }
    }
}

#[async_trait]
impl TransportPublish for MqttPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn publish_event(&self, event: &ChangeEvent) -> Result<(), SnapDogError> {
        let (topic, payload) = topic_and_payload(&self.base_topic, event);
        self.transport
            .publish(&topic, payload, PublishOptions::retained_status())
            .await
            .map_err(SnapDogError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_status_defaults_are_at_least_once_and_retained() {
        let opts = PublishOptions::retained_status();
        assert!(opts.retain);
        assert_eq!(opts.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn ephemeral_is_not_retained() {
        let opts = PublishOptions::ephemeral();
        assert!(!opts.retain);
    }

    #[test]
    fn new_transport_starts_with_no_subscriptions() {
        let (transport, _rx, _eventloop) =
            MqttTransport::new("localhost", 1883, "snapdog-test", None, None, 30);
        assert!(transport.subscribe_filters.lock().is_empty());
    }
}
