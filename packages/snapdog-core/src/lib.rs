//! SnapDog Core - the integration hub bridging a Snapcast server, an MQTT
//! broker and a KNX bus behind a single Zone/Client/Playlist/Track/Stream
//! model.
//!
//! # Architecture
//!
//! The crate is organized into one module per numbered component:
//!
//! - [`model`]: shared identities, entities, commands and change events (C-wide)
//! - [`config`]: the immutable configuration value the core is built against
//! - [`error`]: centralized error taxonomy
//! - [`events`]: change-event fan-out bus between state stores and the coordinator
//! - [`policy`] / [`runtime`] / [`utils`]: shared resilience, task-spawning and
//!   validation helpers
//! - [`snapcast`]: state repository (C1), JSON-RPC client (C2), service facade (C3)
//! - [`mqtt`]: MQTT transport (C4) and its outbound publisher adapter
//! - [`decoder`]: topic/telegram decoder (C5)
//! - [`bus`]: command dispatch (C6)
//! - [`zone_store`] / [`client_store`]: zone and client state repositories (C7, C8)
//! - [`coordinator`]: integration coordinator fan-out (C9)
//! - [`publisher`]: the hybrid direct/queue smart publisher (C10)
//! - [`startup`]: startup orchestrator (C11)
//! - [`knx`]: KNXnet/IP transport, decoder map and publisher adapter (C12)
//! - [`bootstrap`]: composition root wiring every component together
//!
//! # Abstraction Traits
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks
//! - [`EventEmitter`](events::EventEmitter): emitting domain change events
//! - [`Publisher`](publisher::Publisher) / [`TransportPublish`](publisher::TransportPublish):
//!   decoupling the coordinator from any one wire transport
//! - [`DptCodec`](knx::DptCodec): the external KNX DPT encode/decode boundary

#![warn(clippy::all)]

pub mod bootstrap;
pub mod bus;
pub mod client_store;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod events;
pub mod knx;
pub mod model;
pub mod mqtt;
pub mod policy;
pub mod publisher;
pub mod runtime;
pub mod snapcast;
pub mod startup;
pub mod utils;
pub mod zone_store;

pub use bootstrap::{bootstrap, Services};
pub use bus::CommandBus;
pub use client_store::{ClientState, ClientStateStore};
pub use config::Config;
pub use coordinator::IntegrationCoordinator;
pub use decoder::Decoder;
pub use error::{ErrorCode, SnapDogError, SnapDogResult};
pub use events::{ChangeEventBus, EventEmitter};
pub use knx::{DptCodec, DptValue, KnxPublisher, KnxTransport};
pub use model::{ChangeEvent, Command, MacAddress, PlaybackState, Scope, Source};
pub use mqtt::{MqttPublisher, MqttTransport};
pub use policy::RetryPolicy;
pub use publisher::{Publisher, SmartPublisher, TransportPublish};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use snapcast::{RpcClient, SnapcastService, SnapcastState};
pub use startup::{Environment, IntegrationHandle, StartupOutcome};
pub use zone_store::{ZoneState, ZoneStateStore};
