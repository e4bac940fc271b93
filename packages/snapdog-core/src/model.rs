//! Shared data model: identities, entities, commands and change events (SPEC_FULL.md §3).

use serde::{Deserialize, Serialize};

/// 1-based zone identity, defined by configuration, immutable for a run.
pub type ZoneIndex = u32;

/// 1-based client identity, defined by configuration.
pub type ClientIndex = u32;

/// Opaque id assigned by the Snapcast server.
pub type SnapcastClientId = String;

/// Opaque ids owned by Snapcast.
pub type GroupId = String;
pub type StreamId = String;

/// Canonical lower-case hex MAC address, the stable bridge between [`ClientIndex`]
/// (config) and [`SnapcastClientId`] (runtime).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(String);

impl MacAddress {
    /// Normalises into canonical lower-case hex form. Returns `None` for empty input.
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub index: u32,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_ms: Option<u64>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub index: u32,
    pub name: String,
    pub track_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Playing,
    Disabled,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub status: StreamStatus,
    pub uri: String,
    pub properties: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapcastGroup {
    pub id: GroupId,
    pub name: String,
    pub muted: bool,
    pub stream_id: StreamId,
    pub clients: Vec<SnapcastClientId>,
}

/// Origin tag on a command; informational, never a dispatch filter (SPEC_FULL.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Mqtt,
    Knx,
    Api,
    Internal,
}

/// One of `zone`, `client`, `global`; used for publish-queue partitioning in C10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Zone,
    Client,
    Global,
}

/// Typed change notification emitted by C1/C7/C8. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeEvent {
    ZoneVolumeChanged {
        index: ZoneIndex,
        value: u8,
    },
    ZoneMuteChanged {
        index: ZoneIndex,
        value: bool,
    },
    ZonePlaybackChanged {
        index: ZoneIndex,
        value: PlaybackState,
    },
    ZoneTrackChanged {
        index: ZoneIndex,
        value: Option<Track>,
    },
    ZonePlaylistChanged {
        index: ZoneIndex,
        value: Option<Playlist>,
    },
    ZoneTrackRepeatChanged {
        index: ZoneIndex,
        value: bool,
    },
    ZonePlaylistRepeatChanged {
        index: ZoneIndex,
        value: bool,
    },
    ZonePlaylistShuffleChanged {
        index: ZoneIndex,
        value: bool,
    },
    ClientVolumeChanged {
        index: ClientIndex,
        value: u8,
    },
    ClientMuteChanged {
        index: ClientIndex,
        value: bool,
    },
    ClientLatencyChanged {
        index: ClientIndex,
        value: u32,
    },
    ClientNameChanged {
        index: ClientIndex,
        value: String,
    },
    ClientConnectedChanged {
        index: ClientIndex,
        value: bool,
    },
    ClientZoneChanged {
        index: ClientIndex,
        value: Option<ZoneIndex>,
    },
}

impl ChangeEvent {
    /// Publish-queue partition this event belongs to (SPEC_FULL.md §4.10, Scope).
    pub fn scope(&self) -> Scope {
        match self {
            Self::ZoneVolumeChanged { .. }
            | Self::ZoneMuteChanged { .. }
            | Self::ZonePlaybackChanged { .. }
            | Self::ZoneTrackChanged { .. }
            | Self::ZonePlaylistChanged { .. }
            | Self::ZoneTrackRepeatChanged { .. }
            | Self::ZonePlaylistRepeatChanged { .. }
            | Self::ZonePlaylistShuffleChanged { .. } => Scope::Zone,
            _ => Scope::Client,
        }
    }
}

/// Tagged union of every inbound command (SPEC_FULL.md §4.5/§4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    ZonePlay {
        zone: ZoneIndex,
        track: Option<u32>,
        url: Option<String>,
        source: Source,
    },
    ZonePause {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneStop {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneNextTrack {
        zone: ZoneIndex,
        source: Source,
    },
    ZonePreviousTrack {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneNextPlaylist {
        zone: ZoneIndex,
        source: Source,
    },
    ZonePreviousPlaylist {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneSetVolume {
        zone: ZoneIndex,
        volume: u8,
        source: Source,
    },
    ZoneAdjustVolume {
        zone: ZoneIndex,
        delta: i16,
        source: Source,
    },
    ZoneSetMute {
        zone: ZoneIndex,
        muted: bool,
        source: Source,
    },
    ZoneToggleMute {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneSetTrackRepeat {
        zone: ZoneIndex,
        enabled: bool,
        source: Source,
    },
    ZoneToggleTrackRepeat {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneSetShuffle {
        zone: ZoneIndex,
        enabled: bool,
        source: Source,
    },
    ZoneToggleShuffle {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneSetPlaylistRepeat {
        zone: ZoneIndex,
        enabled: bool,
        source: Source,
    },
    ZoneToggleRepeat {
        zone: ZoneIndex,
        source: Source,
    },
    ZoneSetTrack {
        zone: ZoneIndex,
        track: u32,
        source: Source,
    },
    ZoneSetPlaylist {
        zone: ZoneIndex,
        playlist: u32,
        source: Source,
    },
    ClientSetVolume {
        client: ClientIndex,
        volume: u8,
        source: Source,
    },
    ClientSetMute {
        client: ClientIndex,
        muted: bool,
        source: Source,
    },
    ClientToggleMute {
        client: ClientIndex,
        source: Source,
    },
    ClientAssignZone {
        client: ClientIndex,
        zone: Option<ZoneIndex>,
        source: Source,
    },
    ClientSetLatency {
        client: ClientIndex,
        latency_ms: u32,
        source: Source,
    },
}

impl Command {
    pub fn source(&self) -> Source {
        match self {
            Command::ZonePlay { source, .. }
            | Command::ZonePause { source, .. }
            | Command::ZoneStop { source, .. }
            | Command::ZoneNextTrack { source, .. }
            | Command::ZonePreviousTrack { source, .. }
            | Command::ZoneNextPlaylist { source, .. }
            | Command::ZonePreviousPlaylist { source, .. }
            | Command::ZoneSetVolume { source, .. }
            | Command::ZoneAdjustVolume { source, .. }
            | Command::ZoneSetMute { source, .. }
            | Command::ZoneToggleMute { source, .. }
            | Command::ZoneSetTrackRepeat { source, .. }
            | Command::ZoneToggleTrackRepeat { source, .. }
            | Command::ZoneSetShuffle { source, .. }
            | Command::ZoneToggleShuffle { source, .. }
            | Command::ZoneSetPlaylistRepeat { source, .. }
            | Command::ZoneToggleRepeat { source, .. }
            | Command::ZoneSetTrack { source, .. }
            | Command::ZoneSetPlaylist { source, .. }
            | Command::ClientSetVolume { source, .. }
            | Command::ClientSetMute { source, .. }
            | Command::ClientToggleMute { source, .. }
            | Command::ClientAssignZone { source, .. }
            | Command::ClientSetLatency { source, .. } => *source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_normalizes_case() {
        let mac = MacAddress::normalize("AB:CD:EF:01:02:03").unwrap();
        assert_eq!(mac.as_str(), "ab:cd:ef:01:02:03");
    }

    #[test]
    fn mac_address_rejects_empty() {
        assert!(MacAddress::normalize("   ").is_none());
    }

    #[test]
    fn change_event_scope_partitions_by_entity_kind() {
        let zone_ev = ChangeEvent::ZoneVolumeChanged { index: 1, value: 50 };
        let client_ev = ChangeEvent::ClientVolumeChanged { index: 1, value: 50 };
        assert_eq!(zone_ev.scope(), Scope::Zone);
        assert_eq!(client_ev.scope(), Scope::Client);
    }

    #[test]
    fn command_source_is_informational_not_filtered() {
        let cmd = Command::ZoneSetVolume {
            zone: 1,
            volume: 75,
            source: Source::Mqtt,
        };
        assert_eq!(cmd.source(), Source::Mqtt);
    }
}
