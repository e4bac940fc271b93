//! C6 — command bus: dispatches a typed [`Command`] to the zone/client
//! stores and, where the command targets a Snapcast-owned fact, to C3.
//!
//! A plain `match` over [`Command`] is sufficient — no reflection, no
//! handler registry (SPEC_FULL.md §4.6 Rust realisation) — generalising
//! `GenaEventProcessor::process_event_with_deps`'s "match notification,
//! mutate state" shape to "match command, call store method, propagate
//! `Result`".
//!
//! Snapcast is the single source of truth for client volume/mute/latency
//! (SPEC_FULL.md §1 Non-goals: "does not attempt cross-broker consensus"),
//! so client-scoped commands that Snapcast also owns are sent to C3 for the
//! authoritative RPC call *and* applied optimistically to C8 so a caller
//! polling the store immediately after dispatch sees the new value; the
//! later Snapcast notification confirms (or corrects) it. Commands with no
//! Snapcast equivalent (`ClientAssignZone`, all zone playback/playlist
//! controls — real audio routing is an external collaborator per §1) are
//! handled purely by the stores.

use std::sync::Arc;

use crate::client_store::ClientStateStore;
use crate::error::{SnapDogError, SnapDogResult};
use crate::model::Command;
use crate::snapcast::SnapcastService;
use crate::zone_store::ZoneStateStore;

pub struct CommandBus {
    zones: Arc<ZoneStateStore>,
    clients: Arc<ClientStateStore>,
    snapcast: Arc<SnapcastService>,
}

impl CommandBus {
    #[must_use]
    pub fn new(zones: Arc<ZoneStateStore>, clients: Arc<ClientStateStore>, snapcast: Arc<SnapcastService>) -> Self {
        Self { zones, clients, snapcast }
    }

    fn resolve_snapcast_id(&self, client: crate::model::ClientIndex) -> SnapDogResult<String> {
        self.snapcast
            .state()
            .get_client_by_index(client)
            .map(|c| c.id)
            .ok_or_else(|| SnapDogError::NotFound(format!("no snapcast client for index {client}")))
    }

    /// Dispatches `command`, returning `Ok` once the local store mutation
    /// (and, where applicable, the Snapcast RPC call) has completed. Handler
    /// failures are returned, never thrown (SPEC_FULL.md §4.6 error policy).
    pub async fn dispatch(&self, command: Command) -> SnapDogResult<()> {
        match command {
            Command::ZonePlay { zone, track, .. } => {
                if let Some(track_index) = track {
                    self.zones.set_track(
                        zone,
                        Some(crate::model::Track {
                            index: track_index,
                            title: String::new(),
                            artist: None,
                            album: None,
                            duration_ms: None,
                            uri: String::new(),
                        }),
                    )?;
                }
                self.zones
                    .set_playback_state(zone, crate::model::PlaybackState::Playing, crate::utils::now_millis())
            }
            Command::ZonePause { zone, .. } => {
                self.zones
                    .set_playback_state(zone, crate::model::PlaybackState::Paused, crate::utils::now_millis())
            }
            Command::ZoneStop { zone, .. } => {
                self.zones
                    .set_playback_state(zone, crate::model::PlaybackState::Stopped, crate::utils::now_millis())
            }
            Command::ZoneNextTrack { zone, .. } => self.zones.next_track(zone),
            Command::ZonePreviousTrack { zone, .. } => self.zones.previous_track(zone, crate::utils::now_millis()),
            Command::ZoneNextPlaylist { zone, .. } => self.zones.next_playlist(zone),
            Command::ZonePreviousPlaylist { zone, .. } => self.zones.previous_playlist(zone),
            Command::ZoneSetVolume { zone, volume, .. } => self.zones.set_volume(zone, i32::from(volume)),
            Command::ZoneAdjustVolume { zone, delta, .. } => self.zones.adjust_volume(zone, i32::from(delta)),
            Command::ZoneSetMute { zone, muted, .. } => self.zones.set_mute(zone, muted),
            Command::ZoneToggleMute { zone, .. } => self.zones.toggle_mute(zone),
            Command::ZoneSetTrackRepeat { zone, enabled, .. } => self.zones.set_track_repeat(zone, enabled),
            Command::ZoneToggleTrackRepeat { zone, .. } => self.zones.toggle_track_repeat(zone),
            Command::ZoneSetShuffle { zone, enabled, .. } => self.zones.set_shuffle(zone, enabled),
            Command::ZoneToggleShuffle { zone, .. } => self.zones.toggle_shuffle(zone),
            Command::ZoneSetPlaylistRepeat { zone, enabled, .. } => self.zones.set_playlist_repeat(zone, enabled),
            Command::ZoneToggleRepeat { zone, .. } => self.zones.toggle_playlist_repeat(zone),
            Command::ZoneSetTrack { zone, track, .. } => self.zones.set_track(
                zone,
                Some(crate::model::Track {
                    index: track,
                    title: String::new(),
                    artist: None,
                    album: None,
                    duration_ms: None,
                    uri: String::new(),
                }),
            ),
            Command::ZoneSetPlaylist { zone, playlist, .. } => self.zones.set_playlist(
                zone,
                Some(crate::model::Playlist {
                    index: playlist,
                    name: String::new(),
                    track_count: 0,
                }),
            ),
            Command::ClientSetVolume { client, volume, .. } => {
                self.clients.set_volume(client, i32::from(volume))?;
                let snapcast_id = self.resolve_snapcast_id(client)?;
                self.snapcast.set_client_volume(&snapcast_id, volume).await?;
                Ok(())
            }
            Command::ClientSetMute { client, muted, .. } => {
                self.clients.set_mute(client, muted)?;
                let snapcast_id = self.resolve_snapcast_id(client)?;
                self.snapcast.set_client_mute(&snapcast_id, muted).await?;
                Ok(())
            }
            Command::ClientToggleMute { client, .. } => {
                let currently_muted = self
                    .clients
                    .get(client)
                    .ok_or_else(|| SnapDogError::NotFound(format!("client {client}")))?
                    .muted;
                self.clients.set_mute(client, !currently_muted)?;
                let snapcast_id = self.resolve_snapcast_id(client)?;
                self.snapcast.set_client_mute(&snapcast_id, !currently_muted).await?;
                Ok(())
            }
            Command::ClientAssignZone { client, zone, .. } => self.clients.assign_zone(client, zone),
            Command::ClientSetLatency { client, latency_ms, .. } => {
                self.clients.set_latency(client, latency_ms)?;
                let snapcast_id = self.resolve_snapcast_id(client)?;
                self.snapcast.set_client_latency(&snapcast_id, latency_ms).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::model::Source;
    use crate::snapcast::rpc::RpcClient;
    use crate::snapcast::state::SnapcastState;
    use std::collections::HashMap;

    fn bus() -> CommandBus {
        let zones = Arc::new(ZoneStateStore::new(vec![(1, "Living Room".into())], Arc::new(NoopEventEmitter)));
        let clients = Arc::new(ClientStateStore::new(vec![(1, "Kitchen".into())], Arc::new(NoopEventEmitter)));
        let (rpc, _rx) = RpcClient::new("localhost", 1705);
        let state = Arc::new(SnapcastState::new(HashMap::new()));
        let snapcast = Arc::new(SnapcastService::new(rpc, state, Arc::new(NoopEventEmitter)));
        CommandBus::new(zones, clients, snapcast)
    }

    #[tokio::test]
    async fn zone_playback_commands_mutate_zone_store_without_snapcast() {
        let bus = bus();
        bus.dispatch(Command::ZonePause { zone: 1, source: Source::Mqtt }).await.unwrap();
        assert_eq!(bus.zones.get(1).unwrap().playback, crate::model::PlaybackState::Paused);
    }

    #[tokio::test]
    async fn client_volume_command_without_snapcast_mapping_fails_not_found() {
        let bus = bus();
        let result = bus
            .dispatch(Command::ClientSetVolume { client: 1, volume: 50, source: Source::Mqtt })
            .await;
        assert!(matches!(result, Err(SnapDogError::NotFound(_))));
    }

    #[tokio::test]
    async fn client_assign_zone_needs_no_snapcast_mapping() {
        let bus = bus();
        bus.dispatch(Command::ClientAssignZone { client: 1, zone: Some(1), source: Source::Mqtt })
            .await
            .unwrap();
        assert_eq!(bus.clients.get(1).unwrap().assigned_zone, Some(1));
    }

    #[tokio::test]
    async fn zone_next_track_dispatch_advances_track_store() {
        let bus = bus();
        bus.zones
            .set_track(
                1,
                Some(crate::model::Track {
                    index: 1,
                    title: String::new(),
                    artist: None,
                    album: None,
                    duration_ms: None,
                    uri: String::new(),
                }),
            )
            .unwrap();
        bus.zones
            .set_playlist(1, Some(crate::model::Playlist { index: 1, name: String::new(), track_count: 3 }))
            .unwrap();
        bus.dispatch(Command::ZoneNextTrack { zone: 1, source: Source::Mqtt }).await.unwrap();
        assert_eq!(bus.zones.get(1).unwrap().track.unwrap().index, 2);
    }

    #[tokio::test]
    async fn unknown_zone_command_returns_not_found() {
        let bus = bus();
        let result = bus.dispatch(Command::ZoneStop { zone: 99, source: Source::Mqtt }).await;
        assert!(matches!(result, Err(SnapDogError::NotFound(_))));
    }
}
