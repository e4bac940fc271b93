//! Composition root: wires every component (C1-C12) together from a
//! [`Config`] value, runs C11's bring-up, and returns whatever is left
//! running.
//!
//! Grounded on `bootstrap::bootstrap_services`'s numbered-comment,
//! dependency-ordered wiring style: construct shared infrastructure first,
//! then state stores, then transports, then the components that depend on
//! all of the above. Unlike the teacher (sync, no network I/O), this root is
//! `async` because C11's bring-up step (SPEC_FULL.md §4.11) must complete
//! before the command/publish loops have anything to talk to.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::CommandBus;
use crate::client_store::ClientStateStore;
use crate::config::Config;
use crate::coordinator::IntegrationCoordinator;
use crate::decoder::Decoder;
use crate::error::{SnapDogError, SnapDogResult};
use crate::events::{ChangeEventBus, EventEmitter};
use crate::knx::{DptCodec, KnxEvent, KnxPublisher, KnxTransport};
use crate::model::{MacAddress, Source};
use crate::mqtt::{MqttEvent, MqttPublisher, MqttTransport};
use crate::policy::RetryPolicy;
use crate::publisher::{Publisher, SmartPublisher, TransportPublish};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::snapcast::{RpcClient, SnapcastService, SnapcastState};
use crate::startup::{bring_up, IntegrationHandle, StartupOutcome};
use crate::zone_store::ZoneStateStore;

/// Every wired component, held for the lifetime of the process.
#[derive(Clone)]
pub struct Services {
    pub zones: Arc<ZoneStateStore>,
    pub clients: Arc<ClientStateStore>,
    pub snapcast: Arc<SnapcastService>,
    pub mqtt: Arc<MqttTransport>,
    pub knx: Option<Arc<KnxTransport>>,
    pub decoder: Arc<Decoder>,
    pub bus: Arc<CommandBus>,
    pub coordinator: Arc<IntegrationCoordinator>,
    pub events: Arc<ChangeEventBus>,
    pub spawner: Arc<dyn TaskSpawner>,
    pub cancel: CancellationToken,
}

struct MqttHandle {
    transport: Arc<MqttTransport>,
    base_topic: String,
    retry_policy: RetryPolicy,
}

#[async_trait]
impl IntegrationHandle for MqttHandle {
    fn name(&self) -> &'static str {
        "mqtt"
    }
    fn critical(&self) -> bool {
        true
    }
    async fn initialize(&self) -> Result<(), SnapDogError> {
        self.transport.wait_until_connected(self.retry_policy).await.map_err(SnapDogError::from)?;
        self.transport
            .subscribe(&format!("{}/+/+/+", self.base_topic))
            .await
            .map_err(SnapDogError::from)?;
        self.transport
            .subscribe(&format!("{}/+/+/+/set", self.base_topic))
            .await
            .map_err(SnapDogError::from)
    }
}

struct SnapcastHandle {
    service: Arc<SnapcastService>,
    rpc: RpcClient,
    spawner: Arc<dyn TaskSpawner>,
    retry_policy: RetryPolicy,
}

#[async_trait]
impl IntegrationHandle for SnapcastHandle {
    fn name(&self) -> &'static str {
        "snapcast"
    }
    fn critical(&self) -> bool {
        true
    }
    async fn initialize(&self) -> Result<(), SnapDogError> {
        self.rpc
            .connect_with_retry(self.spawner.clone(), self.retry_policy)
            .await
            .map_err(SnapDogError::from)?;
        self.service.refresh_full_status().await
    }
}

/// KNX is non-critical: a failed bring-up only disables the KNX leg
/// (SPEC_FULL.md §4.11). The connected transport is stashed in `connected`
/// so the composition root can build a [`KnxPublisher`] after bring-up.
struct KnxHandle {
    gateway: SocketAddr,
    retry_policy: RetryPolicy,
    connected: Arc<Mutex<Option<KnxTransport>>>,
    spawner: Arc<dyn TaskSpawner>,
}

#[async_trait]
impl IntegrationHandle for KnxHandle {
    fn name(&self) -> &'static str {
        "knx"
    }
    fn critical(&self) -> bool {
        false
    }
    async fn initialize(&self) -> Result<(), SnapDogError> {
        let (transport, _rx) = KnxTransport::connect_with_retry(self.gateway, self.retry_policy)
            .await
            .map_err(SnapDogError::from)?;
        transport.spawn_read_loop(self.spawner.clone());
        *self.connected.lock() = Some(transport);
        Ok(())
    }
}

/// Wires every component from `config`, runs C11's bring-up, and returns the
/// resulting [`Services`] alongside the bring-up verdict. `codec` is the
/// external DPT codec collaborator (SPEC_FULL.md §6) — the core never
/// implements one itself.
pub async fn bootstrap(config: &Config, codec: Arc<dyn DptCodec>) -> SnapDogResult<(Services, StartupOutcome)> {
    let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::current());
    let cancel = CancellationToken::new();

    let events = Arc::new(ChangeEventBus::new(256));
    let emitter: Arc<dyn EventEmitter> = events.clone();

    let zones = Arc::new(ZoneStateStore::new(
        config.zones.iter().map(|z| (z.index, z.name.clone())),
        emitter.clone(),
    ));
    let clients = Arc::new(ClientStateStore::new(
        config.clients.iter().map(|c| (c.index, c.name.clone())),
        emitter.clone(),
    ));

    let mac_to_index = config
        .clients
        .iter()
        .filter_map(|c| {
            let mac = c.mac.as_deref()?;
            MacAddress::normalize(mac).map(|m| (m, c.index))
        })
        .collect();
    let snapcast_state = Arc::new(SnapcastState::new(mac_to_index));
    let (rpc, _rpc_events) = RpcClient::new(config.snapcast.host.clone(), config.snapcast.json_rpc_port);
    let snapcast = Arc::new(SnapcastService::new(rpc.clone(), snapcast_state, emitter.clone()));
    snapcast.start_notification_bridge(spawner.clone());

    let (mqtt_transport, mqtt_events, mqtt_eventloop) = MqttTransport::new(
        &config.mqtt.host,
        config.mqtt.port,
        "snapdog",
        config.mqtt.username.as_deref(),
        config.mqtt.password.as_deref(),
        config.mqtt.keep_alive_secs,
    );
    let mqtt = Arc::new(mqtt_transport);
    mqtt.clone().spawn_event_loop(mqtt_eventloop, spawner.clone());

    let decoder = Arc::new(Decoder::with_knx_mappings(&config.base_topic, &config.knx.group_addresses));
    let bus = Arc::new(CommandBus::new(zones.clone(), clients.clone(), snapcast.clone()));

    let retry_policy: RetryPolicy = config.resilience.into();
    snapcast.start_health_check(spawner.clone(), retry_policy);
    snapcast.start_grouping_reconciliation(zones.clone(), clients.clone(), spawner.clone());

    let knx_slot: Arc<Mutex<Option<KnxTransport>>> = Arc::new(Mutex::new(None));
    let gateway: SocketAddr = format!("{}:{}", config.knx.gateway, config.knx.port)
        .parse()
        .map_err(|e| SnapDogError::Validation(format!("invalid knx gateway address: {e}")))?;

    let handles: Vec<Box<dyn IntegrationHandle>> = vec![
        Box::new(SnapcastHandle {
            service: snapcast.clone(),
            rpc,
            spawner: spawner.clone(),
            retry_policy,
        }),
        Box::new(MqttHandle {
            transport: mqtt.clone(),
            base_topic: config.base_topic.clone(),
            retry_policy,
        }),
        Box::new(KnxHandle {
            gateway,
            retry_policy,
            connected: knx_slot.clone(),
            spawner: spawner.clone(),
        }),
    ];

    let outcome = bring_up(handles).await;

    let mqtt_publisher: Arc<dyn TransportPublish> = Arc::new(MqttPublisher::new(mqtt.clone(), config.base_topic.clone()));
    let mut publishers: Vec<Arc<dyn Publisher>> = vec![SmartPublisher::new(mqtt_publisher, spawner.clone())];

    let knx = knx_slot.lock().take().map(Arc::new);
    if let Some(knx) = &knx {
        let knx_publisher: Arc<dyn TransportPublish> =
            Arc::new(KnxPublisher::new((**knx).clone(), codec.clone(), &config.knx.group_addresses));
        publishers.push(SmartPublisher::new(knx_publisher, spawner.clone()));
    }

    let coordinator = Arc::new(IntegrationCoordinator::new(publishers));

    let services = Services {
        zones,
        clients,
        snapcast,
        mqtt,
        knx: knx.clone(),
        decoder: decoder.clone(),
        bus: bus.clone(),
        coordinator,
        events,
        spawner: spawner.clone(),
        cancel,
    };
    services.start_coordinator();
    services.start_mqtt_command_loop(mqtt_events);
    if let Some(knx) = &knx {
        services.start_knx_command_loop(knx.subscribe_events(), codec);
    }

    Ok((services, outcome))
}

impl Services {
    /// Starts the coordinator's subscribe-and-fan-out loop over the shared
    /// change-event bus.
    fn start_coordinator(&self) {
        self.coordinator.clone().start(self.events.subscribe(), self.spawner.clone(), self.cancel.child_token());
    }

    /// Decodes inbound MQTT messages into commands and dispatches them on
    /// the command bus (SPEC_FULL.md §4.5/§4.6 data flow: "MQTT frame → C5
    /// decoder → typed command → C6 bus").
    fn start_mqtt_command_loop(&self, mut events: tokio::sync::broadcast::Receiver<MqttEvent>) {
        let decoder = self.decoder.clone();
        let bus = self.bus.clone();
        let cancel = self.cancel.child_token();
        self.spawner.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    received = events.recv() => {
                        let event = match received {
                            Ok(event) => event,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        };
                        let MqttEvent::Message { topic, payload } = event else {
                            continue;
                        };
                        let payload = String::from_utf8_lossy(&payload).into_owned();
                        if let Some(command) = decoder.decode_mqtt(&topic, &payload, Source::Mqtt) {
                            if let Err(err) = bus.dispatch(command).await {
                                tracing::warn!(topic, %err, "command dispatch failed");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Decodes inbound KNX group-value-write telegrams into commands and
    /// dispatches them on the command bus, mirroring
    /// [`Services::start_mqtt_command_loop`] for the KNX leg (SPEC_FULL.md
    /// §4.12: "a parallel declarative map associates KNX group-address to
    /// the same command set"). Only runs when KNX bring-up succeeded.
    fn start_knx_command_loop(&self, mut events: tokio::sync::broadcast::Receiver<KnxEvent>, codec: Arc<dyn DptCodec>) {
        let decoder = self.decoder.clone();
        let bus = self.bus.clone();
        let cancel = self.cancel.child_token();
        self.spawner.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    received = events.recv() => {
                        let event = match received {
                            Ok(event) => event,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        };
                        let KnxEvent::GroupValueWrite { address, raw } = event else {
                            continue;
                        };
                        let Some(dpt) = decoder.dpt_for_address(address) else { continue };
                        let Some(value) = codec.decode(dpt, &raw) else { continue };
                        if let Some(command) = decoder.decode_knx(address, &value, Source::Knx) {
                            if let Err(err) = bus.dispatch(command).await {
                                tracing::warn!(%address, %err, "knx command dispatch failed");
                            }
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
    use crate::config::{ClientConfig, KnxConfig, MqttConfig, ResiliencePolicyConfig, SnapcastConfig, ZoneConfig};
    use crate::knx::DptValue;

    struct NoopCodec;
    impl DptCodec for NoopCodec {
        fn decode(&self, _dpt: &str, _bytes: &[u8]) -> Option<DptValue> {
            None
        }
        fn encode(&self, _dpt: &str, _value: &DptValue) -> Vec<u8> {
            Vec::new()
        }
    }

    fn sample_config() -> Config {
        Config {
            base_topic: "snapdog".to_string(),
            mqtt: MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                username: None,
                password: None,
                keep_alive_secs: 30,
                base_topic: "snapdog".to_string(),
            },
            snapcast: SnapcastConfig {
                host: "127.0.0.1".to_string(),
                json_rpc_port: 1,
                websocket_url: None,
            },
            knx: KnxConfig {
                gateway: "127.0.0.1".to_string(),
                port: 1,
                group_addresses: vec![],
            },
            zones: vec![ZoneConfig { index: 1, name: "Living Room".to_string() }],
            clients: vec![ClientConfig { index: 1, name: "Kitchen".to_string(), mac: None }],
            resilience: ResiliencePolicyConfig {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                backoff: crate::config::BackoffConfig::Constant,
                use_jitter: false,
                timeout_seconds: 2,
            },
        }
    }

    #[tokio::test]
    async fn bootstrap_wires_zones_and_clients_and_reports_terminate_when_unreachable() {
        let config = sample_config();
        let (services, outcome) = bootstrap(&config, Arc::new(NoopCodec)).await.unwrap();
        assert_eq!(services.zones.indices(), vec![1]);
        assert_eq!(services.clients.indices(), vec![1]);
        assert!(matches!(outcome, StartupOutcome::Terminate { .. }));
        services.cancel.cancel();
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_knx_gateway() {
        let mut config = sample_config();
        config.knx.gateway = "not-an-ip".to_string();
        assert!(bootstrap(&config, Arc::new(NoopCodec)).await.is_err());
    }
}
