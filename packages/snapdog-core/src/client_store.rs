//! C8 — client state store. Structurally identical to [`crate::zone_store`]:
//! one `Mutex<ClientState>` per client index inside a `DashMap`, plus a
//! shared fan-out emitter (SPEC_FULL.md §4.8 Rust realisation).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::SnapDogError;
use crate::events::EventEmitter;
use crate::model::{ChangeEvent, ClientIndex, ZoneIndex};
use crate::utils::validate_volume;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    pub name: String,
    pub volume: u8,
    pub muted: bool,
    pub volume_before_mute: u8,
    pub latency_ms: u32,
    pub connected: bool,
    pub assigned_zone: Option<ZoneIndex>,
}

impl ClientState {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volume: 0,
            muted: false,
            volume_before_mute: 0,
            latency_ms: 0,
            connected: false,
            assigned_zone: None,
        }
    }
}

pub struct ClientStateStore {
    clients: DashMap<ClientIndex, Mutex<ClientState>>,
    emitter: Arc<dyn EventEmitter>,
}

impl ClientStateStore {
    #[must_use]
    pub fn new(clients: impl IntoIterator<Item = (ClientIndex, String)>, emitter: Arc<dyn EventEmitter>) -> Self {
        let map = DashMap::new();
        for (index, name) in clients {
            map.insert(index, Mutex::new(ClientState::new(name)));
        }
        Self { clients: map, emitter }
    }

    #[must_use]
    pub fn get(&self, index: ClientIndex) -> Option<ClientState> {
        self.clients.get(&index).map(|c| c.lock().clone())
    }

    fn with_client<T>(
        &self,
        index: ClientIndex,
        f: impl FnOnce(&mut ClientState) -> Option<T>,
    ) -> Result<Option<T>, SnapDogError> {
        let entry = self
            .clients
            .get(&index)
            .ok_or_else(|| SnapDogError::NotFound(format!("client {index}")))?;
        let mut client = entry.lock();
        Ok(f(&mut client))
    }

    pub fn set_volume(&self, index: ClientIndex, raw: i32) -> Result<(), SnapDogError> {
        let value = validate_volume(raw).map_err(|_| SnapDogError::Validation(format!("volume {raw} out of range")))?;
        self.with_client(index, |client| {
            if client.volume == value {
                return None;
            }
            client.volume = value;
            if !client.muted {
                client.volume_before_mute = value;
            }
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ClientVolumeChanged { index, value });
        Ok(())
    }

    /// Mutes by zeroing volume while preserving the prior value for restore
    /// (SPEC_FULL.md §8 invariant 2).
    pub fn set_mute(&self, index: ClientIndex, muted: bool) -> Result<(), SnapDogError> {
        let changed = self.with_client(index, |client| {
            if client.muted == muted {
                return None;
            }
            client.muted = muted;
            if muted {
                client.volume_before_mute = client.volume;
                client.volume = 0;
            } else {
                client.volume = client.volume_before_mute;
            }
            Some(client.volume)
        })?;
        if let Some(volume) = changed {
            self.emitter.emit(ChangeEvent::ClientMuteChanged { index, value: muted });
            self.emitter.emit(ChangeEvent::ClientVolumeChanged { index, value: volume });
        }
        Ok(())
    }

    pub fn toggle_mute(&self, index: ClientIndex) -> Result<(), SnapDogError> {
        let muted = self
            .get(index)
            .ok_or_else(|| SnapDogError::NotFound(format!("client {index}")))?
            .muted;
        self.set_mute(index, !muted)
    }

    pub fn set_latency(&self, index: ClientIndex, latency_ms: u32) -> Result<(), SnapDogError> {
        self.with_client(index, |client| {
            if client.latency_ms == latency_ms {
                return None;
            }
            client.latency_ms = latency_ms;
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ClientLatencyChanged { index, value: latency_ms });
        Ok(())
    }

    pub fn set_name(&self, index: ClientIndex, name: String) -> Result<(), SnapDogError> {
        self.with_client(index, |client| {
            if client.name == name {
                return None;
            }
            client.name = name.clone();
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ClientNameChanged { index, value: name });
        Ok(())
    }

    pub fn set_connected(&self, index: ClientIndex, connected: bool) -> Result<(), SnapDogError> {
        self.with_client(index, |client| {
            if client.connected == connected {
                return None;
            }
            client.connected = connected;
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ClientConnectedChanged { index, value: connected });
        Ok(())
    }

    /// `AssignZone(None)` is explicitly allowed and means unassigned
    /// (SPEC_FULL.md §4.8 invariants).
    pub fn assign_zone(&self, index: ClientIndex, zone: Option<ZoneIndex>) -> Result<(), SnapDogError> {
        self.with_client(index, |client| {
            if client.assigned_zone == zone {
                return None;
            }
            client.assigned_zone = zone;
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ClientZoneChanged { index, value: zone });
        Ok(())
    }

    /// All client indices currently assigned to `zone`, used by C9's grouping
    /// reconciliation (SPEC_FULL.md §9-OQ3).
    #[must_use]
    pub fn indices_assigned_to(&self, zone: ZoneIndex) -> Vec<ClientIndex> {
        self.clients
            .iter()
            .filter(|e| e.value().lock().assigned_zone == Some(zone))
            .map(|e| *e.key())
            .collect()
    }

    #[must_use]
    pub fn indices(&self) -> Vec<ClientIndex> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    /// Re-emits every current fact for every client (SPEC_FULL.md §4.11
    /// post-startup full-state publish).
    pub fn emit_full_snapshot(&self) {
        for entry in &self.clients {
            let index = *entry.key();
            let client = entry.value().lock().clone();
            self.emitter.emit(ChangeEvent::ClientVolumeChanged { index, value: client.volume });
            self.emitter.emit(ChangeEvent::ClientMuteChanged { index, value: client.muted });
            self.emitter.emit(ChangeEvent::ClientLatencyChanged { index, value: client.latency_ms });
            self.emitter.emit(ChangeEvent::ClientNameChanged { index, value: client.name });
            self.emitter.emit(ChangeEvent::ClientConnectedChanged { index, value: client.connected });
            self.emitter.emit(ChangeEvent::ClientZoneChanged { index, value: client.assigned_zone });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;

    fn store() -> ClientStateStore {
        ClientStateStore::new(vec![(1, "Kitchen".to_string())], Arc::new(NoopEventEmitter))
    }

    #[test]
    fn toggle_mute_twice_restores_prior_volume_and_muted_flag() {
        let store = store();
        store.set_volume(1, 66).unwrap();
        store.toggle_mute(1).unwrap();
        assert_eq!(store.get(1).unwrap().volume, 0);
        store.toggle_mute(1).unwrap();
        let state = store.get(1).unwrap();
        assert_eq!(state.volume, 66);
        assert!(!state.muted);
    }

    #[test]
    fn assign_zone_accepts_none_as_unassigned() {
        let store = store();
        store.assign_zone(1, Some(2)).unwrap();
        store.assign_zone(1, None).unwrap();
        assert_eq!(store.get(1).unwrap().assigned_zone, None);
    }

    #[test]
    fn indices_assigned_to_filters_by_zone() {
        let store = ClientStateStore::new(
            vec![(1, "A".to_string()), (2, "B".to_string())],
            Arc::new(NoopEventEmitter),
        );
        store.assign_zone(1, Some(5)).unwrap();
        store.assign_zone(2, Some(6)).unwrap();
        assert_eq!(store.indices_assigned_to(5), vec![1]);
    }

    #[test]
    fn set_volume_is_idempotent_and_emits_nothing_on_repeat() {
        let store = store();
        store.set_volume(1, 10).unwrap();
        store.set_volume(1, 10).unwrap();
        assert_eq!(store.get(1).unwrap().volume, 10);
    }

    #[test]
    fn emit_full_snapshot_does_not_panic() {
        let store = store();
        store.emit_full_snapshot();
    }
}
