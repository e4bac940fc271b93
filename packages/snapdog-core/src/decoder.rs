//! C5 — topic/telegram decoder: maps MQTT topics (and, via the same command
//! vocabulary, KNX group addresses) onto typed [`Command`]s.
//!
//! Resolves SPEC_FULL.md §9-OQ1 to the attribute/registry model: each
//! accepted topic shape is one entry in a `Vec<(CompiledPattern, Ctor)>`
//! built once in [`Decoder::new`], matched segment-wise and case-insensitive,
//! first match wins — no parallel constants-string `match` duplicating the
//! same vocabulary. Grounded on the teacher's declarative composition style
//! in `bootstrap.rs` (construct a table once, consult it many times).

use std::collections::HashMap;

use crate::config::{KnxEntity, KnxGroupMapping, KnxSignal};
use crate::knx::{dpt_for_signal, DptValue, GroupAddress};
use crate::model::{ClientIndex, Command, Source, ZoneIndex};
use crate::utils::validate_positive_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entity {
    Zone,
    Client,
}

type Ctor = fn(u32, Option<&str>, Source) -> Option<Command>;

struct CompiledPattern {
    entity: Entity,
    command: &'static str,
}

/// Builds and holds the registry of accepted `{entity}/{command}` shapes.
pub struct Decoder {
    base: String,
    patterns: Vec<(CompiledPattern, Ctor)>,
    knx_map: HashMap<GroupAddress, (KnxEntity, u32, KnxSignal)>,
}

impl Decoder {
    #[must_use]
    pub fn new(base_topic: impl Into<String>) -> Self {
        Self::with_knx_mappings(base_topic, &[])
    }

    /// Same as [`Decoder::new`] plus the declarative KNX group-address map
    /// (SPEC_FULL.md §4.12: "a parallel declarative map associates
    /// KNX group-address to the same command set").
    #[must_use]
    pub fn with_knx_mappings(base_topic: impl Into<String>, mappings: &[KnxGroupMapping]) -> Self {
        let knx_map = mappings
            .iter()
            .filter_map(|m| GroupAddress::parse(&m.address).map(|addr| (addr, (m.entity, m.index, m.signal))))
            .collect();
        Self {
            base: base_topic.into(),
            patterns: build_registry(),
            knx_map,
        }
    }

    /// DPT identifier to use when decoding a raw telegram received on
    /// `address`, or `None` if `address` is not in the configured map. Lets
    /// callers turn raw gateway bytes into a [`DptValue`] before calling
    /// [`Decoder::decode_knx`].
    #[must_use]
    pub fn dpt_for_address(&self, address: GroupAddress) -> Option<&'static str> {
        self.knx_map.get(&address).map(|(_, _, signal)| dpt_for_signal(*signal))
    }

    /// Decodes an inbound KNX group-value-write telegram into a [`Command`],
    /// using the configured group-address map. Unmapped addresses and
    /// type-mismatched DPT values produce no command (same "silently ignore
    /// unknowns" policy as [`Decoder::decode_mqtt`]).
    #[must_use]
    pub fn decode_knx(&self, address: GroupAddress, value: &DptValue, source: Source) -> Option<Command> {
        let (entity, index, signal) = *self.knx_map.get(&address)?;
        match (entity, signal, value) {
            (KnxEntity::Zone, KnxSignal::Volume, DptValue::Scaled(v)) => {
                Some(Command::ZoneSetVolume { zone: index, volume: *v, source })
            }
            (KnxEntity::Zone, KnxSignal::Mute, DptValue::Bool(v)) => {
                Some(Command::ZoneSetMute { zone: index, muted: *v, source })
            }
            (KnxEntity::Zone, KnxSignal::Playback, DptValue::Bool(true)) => {
                Some(Command::ZonePlay { zone: index, track: None, url: None, source })
            }
            (KnxEntity::Zone, KnxSignal::Playback, DptValue::Bool(false)) => {
                Some(Command::ZoneStop { zone: index, source })
            }
            (KnxEntity::Client, KnxSignal::Volume, DptValue::Scaled(v)) => {
                Some(Command::ClientSetVolume { client: index, volume: *v, source })
            }
            (KnxEntity::Client, KnxSignal::Mute, DptValue::Bool(v)) => {
                Some(Command::ClientSetMute { client: index, muted: *v, source })
            }
            _ => None,
        }
    }

    /// Decodes `{base}/{entity}/{index}/{command}[/set]` plus `payload` into
    /// a [`Command`]. Returns `None` for anything outside the accepted
    /// vocabulary — unknown commands produce no command and no error
    /// (SPEC_FULL.md §4.5 validation note).
    #[must_use]
    pub fn decode_mqtt(&self, topic: &str, payload: &str, source: Source) -> Option<Command> {
        let stripped = topic.strip_suffix("/set").unwrap_or(topic);
        let mut segments = stripped.split('/');

        let base = segments.next()?;
        if !base.eq_ignore_ascii_case(&self.base) {
            return None;
        }
        let entity_raw = segments.next()?;
        let entity = if entity_raw.eq_ignore_ascii_case("zone") {
            Entity::Zone
        } else if entity_raw.eq_ignore_ascii_case("client") {
            Entity::Client
        } else {
            return None;
        };
        let index_raw = segments.next()?;
        let index: u32 = validate_positive_index(index_raw.parse().ok()?).ok()?;
        let command = segments.next()?;
        if segments.next().is_some() {
            return None;
        }

        let (_, ctor) = self
            .patterns
            .iter()
            .find(|(p, _)| p.entity == entity && p.command.eq_ignore_ascii_case(command))?;
        tracing::debug!(topic, command, "decoder matched pattern");
        ctor(index, non_empty(payload), source)
    }
}

fn non_empty(payload: &str) -> Option<&str> {
    let trimmed = payload.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Accepted boolean payload tokens (SPEC_FULL.md §4.5 payload binding).
fn parse_bool(token: &str) -> Option<bool> {
    match token.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Default step for bare `+`/`-` volume adjustments (no explicit magnitude).
const DEFAULT_VOLUME_STEP: i16 = 5;

enum VolumeOp {
    Absolute(u8),
    Delta(i16),
}

/// `volume` payload grammar: plain int, `+`, `-`, `+n`, `-n`.
fn parse_volume(token: &str) -> Option<VolumeOp> {
    if token == "+" {
        return Some(VolumeOp::Delta(DEFAULT_VOLUME_STEP));
    }
    if token == "-" {
        return Some(VolumeOp::Delta(-DEFAULT_VOLUME_STEP));
    }
    if let Some(rest) = token.strip_prefix('+') {
        return rest.parse::<i16>().ok().map(VolumeOp::Delta);
    }
    if let Some(rest) = token.strip_prefix('-') {
        return rest.parse::<i16>().ok().map(|n: i16| VolumeOp::Delta(-n));
    }
    token.parse::<u8>().ok().map(VolumeOp::Absolute)
}

fn build_registry() -> Vec<(CompiledPattern, Ctor)> {
    fn zone(command: &'static str, ctor: Ctor) -> (CompiledPattern, Ctor) {
        (CompiledPattern { entity: Entity::Zone, command }, ctor)
    }
    fn client(command: &'static str, ctor: Ctor) -> (CompiledPattern, Ctor) {
        (CompiledPattern { entity: Entity::Client, command }, ctor)
    }

    vec![
        zone("play", |zone: ZoneIndex, payload, source| {
            let (track, url) = match payload {
                None => (None, None),
                Some(p) => {
                    if let Some(rest) = p.strip_prefix("track ") {
                        (rest.trim().parse().ok(), None)
                    } else if let Some(rest) = p.strip_prefix("url ") {
                        (None, Some(rest.trim().to_string()))
                    } else {
                        (None, None)
                    }
                }
            };
            Some(Command::ZonePlay { zone, track, url, source })
        }),
        zone("pause", |zone, _, source| Some(Command::ZonePause { zone, source })),
        zone("stop", |zone, _, source| Some(Command::ZoneStop { zone, source })),
        zone("next", |zone, _, source| Some(Command::ZoneNextTrack { zone, source })),
        zone("previous", |zone, _, source| Some(Command::ZonePreviousTrack { zone, source })),
        zone("playlist_next", |zone, _, source| Some(Command::ZoneNextPlaylist { zone, source })),
        zone("playlist_previous", |zone, _, source| {
            Some(Command::ZonePreviousPlaylist { zone, source })
        }),
        zone("volume", |zone, payload, source| {
            match parse_volume(payload?)? {
                VolumeOp::Absolute(volume) => Some(Command::ZoneSetVolume { zone, volume, source }),
                VolumeOp::Delta(delta) => Some(Command::ZoneAdjustVolume { zone, delta, source }),
            }
        }),
        zone("volume_up", |zone, _, source| Some(Command::ZoneAdjustVolume {
            zone,
            delta: DEFAULT_VOLUME_STEP,
            source,
        })),
        zone("volume_down", |zone, _, source| Some(Command::ZoneAdjustVolume {
            zone,
            delta: -DEFAULT_VOLUME_STEP,
            source,
        })),
        zone("mute_on", |zone, _, source| Some(Command::ZoneSetMute { zone, muted: true, source })),
        zone("mute_off", |zone, _, source| Some(Command::ZoneSetMute { zone, muted: false, source })),
        zone("mute_toggle", |zone, _, source| Some(Command::ZoneToggleMute { zone, source })),
        zone("track_repeat_on", |zone, _, source| {
            Some(Command::ZoneSetTrackRepeat { zone, enabled: true, source })
        }),
        zone("track_repeat_off", |zone, _, source| {
            Some(Command::ZoneSetTrackRepeat { zone, enabled: false, source })
        }),
        zone("track_repeat_toggle", |zone, _, source| {
            Some(Command::ZoneToggleTrackRepeat { zone, source })
        }),
        zone("shuffle_on", |zone, _, source| Some(Command::ZoneSetShuffle { zone, enabled: true, source })),
        zone("shuffle_off", |zone, _, source| Some(Command::ZoneSetShuffle { zone, enabled: false, source })),
        zone("shuffle_toggle", |zone, _, source| Some(Command::ZoneToggleShuffle { zone, source })),
        zone("repeat_on", |zone, _, source| {
            Some(Command::ZoneSetPlaylistRepeat { zone, enabled: true, source })
        }),
        zone("repeat_off", |zone, _, source| {
            Some(Command::ZoneSetPlaylistRepeat { zone, enabled: false, source })
        }),
        zone("repeat_toggle", |zone, _, source| Some(Command::ZoneToggleRepeat { zone, source })),
        zone("track", |zone, payload, source| {
            Some(Command::ZoneSetTrack { zone, track: payload?.parse().ok()?, source })
        }),
        zone("playlist", |zone, payload, source| {
            Some(Command::ZoneSetPlaylist { zone, playlist: payload?.parse().ok()?, source })
        }),
        client("volume", |client_index: ClientIndex, payload, source| {
            match parse_volume(payload?)? {
                VolumeOp::Absolute(volume) => Some(Command::ClientSetVolume { client: client_index, volume, source }),
                VolumeOp::Delta(_) => None,
            }
        }),
        client("mute_on", |client_index, _, source| {
            Some(Command::ClientSetMute { client: client_index, muted: true, source })
        }),
        client("mute_off", |client_index, _, source| {
            Some(Command::ClientSetMute { client: client_index, muted: false, source })
        }),
        client("mute_toggle", |client_index, _, source| {
            Some(Command::ClientToggleMute { client: client_index, source })
        }),
        client("zone", |client_index, payload, source| {
            let zone = match payload {
                None => None,
                Some(p) if p.eq_ignore_ascii_case("none") => None,
                Some(p) => Some(p.parse().ok()?),
            };
            Some(Command::ClientAssignZone { client: client_index, zone, source })
        }),
        client("latency", |client_index, payload, source| {
            let latency_ms = payload?.parse().ok()?;
            Some(Command::ClientSetLatency { client: client_index, latency_ms, source })
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_zone_volume_absolute() {
        let decoder = Decoder::new("snapdog");
        let cmd = decoder.decode_mqtt("snapdog/zone/1/volume/set", "75", Source::Mqtt).unwrap();
        assert_eq!(cmd, Command::ZoneSetVolume { zone: 1, volume: 75, source: Source::Mqtt });
    }

    #[test]
    fn decodes_zone_volume_bare_plus_as_default_step() {
        let decoder = Decoder::new("snapdog");
        let cmd = decoder.decode_mqtt("snapdog/zone/1/volume", "+", Source::Mqtt).unwrap();
        assert_eq!(cmd, Command::ZoneAdjustVolume { zone: 1, delta: DEFAULT_VOLUME_STEP, source: Source::Mqtt });
    }

    #[test]
    fn decodes_client_mute_toggle() {
        let decoder = Decoder::new("snapdog");
        let cmd = decoder.decode_mqtt("snapdog/client/2/mute_toggle", "", Source::Mqtt).unwrap();
        assert_eq!(cmd, Command::ClientToggleMute { client: 2, source: Source::Mqtt });
    }

    #[test]
    fn base_prefix_is_case_insensitive() {
        let decoder = Decoder::new("snapdog");
        assert!(decoder.decode_mqtt("SnapDog/zone/1/stop", "", Source::Mqtt).is_some());
    }

    #[test]
    fn unknown_command_produces_no_command() {
        let decoder = Decoder::new("snapdog");
        assert!(decoder.decode_mqtt("snapdog/zone/1/not_a_command", "", Source::Mqtt).is_none());
    }

    #[test]
    fn non_positive_index_is_rejected() {
        let decoder = Decoder::new("snapdog");
        assert!(decoder.decode_mqtt("snapdog/zone/0/stop", "", Source::Mqtt).is_none());
    }

    #[test]
    fn client_zone_none_unassigns() {
        let decoder = Decoder::new("snapdog");
        let cmd = decoder.decode_mqtt("snapdog/client/1/zone", "none", Source::Mqtt).unwrap();
        assert_eq!(cmd, Command::ClientAssignZone { client: 1, zone: None, source: Source::Mqtt });
    }

    #[test]
    fn decodes_knx_zone_volume_from_group_address_map() {
        let decoder = Decoder::with_knx_mappings(
            "snapdog",
            &[KnxGroupMapping {
                entity: KnxEntity::Zone,
                index: 1,
                signal: KnxSignal::Volume,
                address: "1/1/1".to_string(),
            }],
        );
        let address = GroupAddress::parse("1/1/1").unwrap();
        let cmd = decoder.decode_knx(address, &DptValue::Scaled(60), Source::Knx).unwrap();
        assert_eq!(cmd, Command::ZoneSetVolume { zone: 1, volume: 60, source: Source::Knx });
    }

    #[test]
    fn decode_knx_ignores_unmapped_group_address() {
        let decoder = Decoder::new("snapdog");
        let address = GroupAddress::parse("1/1/1").unwrap();
        assert!(decoder.decode_knx(address, &DptValue::Bool(true), Source::Knx).is_none());
    }

    #[test]
    fn dpt_for_address_resolves_configured_mapping_and_nothing_else() {
        let decoder = Decoder::with_knx_mappings(
            "snapdog",
            &[KnxGroupMapping {
                entity: KnxEntity::Zone,
                index: 1,
                signal: KnxSignal::Volume,
                address: "1/1/1".to_string(),
            }],
        );
        let mapped = GroupAddress::parse("1/1/1").unwrap();
        let unmapped = GroupAddress::parse("2/2/2").unwrap();
        assert_eq!(decoder.dpt_for_address(mapped), Some("5.001"));
        assert_eq!(decoder.dpt_for_address(unmapped), None);
    }
}
