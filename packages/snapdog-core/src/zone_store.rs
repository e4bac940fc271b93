//! C7 — zone state store: one short-held mutex per zone serialises mutation
//! and emission, with a `DashMap` keyed by zone index avoiding a global lock.
//! Structurally the same shape as [`crate::client_store`]; both are grounded
//! on `events::BroadcastEventBridge`'s `broadcast::Sender` + `EventEmitter`
//! forwarding.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::SnapDogError;
use crate::events::EventEmitter;
use crate::model::{ChangeEvent, Playlist, PlaybackState, Track, ZoneIndex};
use crate::utils::{clamp_volume_delta, validate_volume};

const PREVIOUS_TRACK_RESTART_WINDOW_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneState {
    pub name: String,
    pub volume: u8,
    pub muted: bool,
    pub volume_before_mute: u8,
    pub playback: PlaybackState,
    pub track: Option<Track>,
    pub playlist: Option<Playlist>,
    pub track_repeat: bool,
    pub playlist_repeat: bool,
    pub shuffle: bool,
    pub playback_started_at_ms: Option<u64>,
    pub associated_group_id: Option<String>,
}

impl ZoneState {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volume: 0,
            muted: false,
            volume_before_mute: 0,
            playback: PlaybackState::Stopped,
            track: None,
            playlist: None,
            track_repeat: false,
            playlist_repeat: false,
            shuffle: false,
            playback_started_at_ms: None,
            associated_group_id: None,
        }
    }
}

/// `DashMap<ZoneIndex, Mutex<ZoneState>>` plus a fan-out emitter
/// (SPEC_FULL.md §4.7 Rust realisation).
pub struct ZoneStateStore {
    zones: DashMap<ZoneIndex, Mutex<ZoneState>>,
    emitter: Arc<dyn EventEmitter>,
}

impl ZoneStateStore {
    #[must_use]
    pub fn new(zones: impl IntoIterator<Item = (ZoneIndex, String)>, emitter: Arc<dyn EventEmitter>) -> Self {
        let map = DashMap::new();
        for (index, name) in zones {
            map.insert(index, Mutex::new(ZoneState::new(name)));
        }
        Self { zones: map, emitter }
    }

    #[must_use]
    pub fn get(&self, index: ZoneIndex) -> Option<ZoneState> {
        self.zones.get(&index).map(|z| z.lock().clone())
    }

    fn with_zone<T>(
        &self,
        index: ZoneIndex,
        f: impl FnOnce(&mut ZoneState) -> Option<T>,
    ) -> Result<Option<T>, SnapDogError> {
        let entry = self
            .zones
            .get(&index)
            .ok_or_else(|| SnapDogError::NotFound(format!("zone {index}")))?;
        let mut zone = entry.lock();
        Ok(f(&mut zone))
    }

    pub fn set_volume(&self, index: ZoneIndex, raw: i32) -> Result<(), SnapDogError> {
        let value = validate_volume(raw).map_err(|_| SnapDogError::Validation(format!("volume {raw} out of range")))?;
        self.with_zone(index, |zone| {
            if zone.volume == value {
                return None;
            }
            zone.volume = value;
            if !zone.muted {
                zone.volume_before_mute = value;
            }
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ZoneVolumeChanged { index, value });
        Ok(())
    }

    /// `AdjustVolume` never rejects: the delta clamps into `[0,100]`
    /// (SPEC_FULL.md §8 invariant 3).
    pub fn adjust_volume(&self, index: ZoneIndex, delta: i32) -> Result<(), SnapDogError> {
        let new_value = self.with_zone(index, |zone| {
            let value = clamp_volume_delta(zone.volume, delta);
            if value == zone.volume {
                return None;
            }
            zone.volume = value;
            if !zone.muted {
                zone.volume_before_mute = value;
            }
            Some(value)
        })?;
        if let Some(value) = new_value {
            self.emitter.emit(ChangeEvent::ZoneVolumeChanged { index, value });
        }
        Ok(())
    }

    pub fn set_mute(&self, index: ZoneIndex, muted: bool) -> Result<(), SnapDogError> {
        let changed = self.with_zone(index, |zone| {
            if zone.muted == muted {
                return None;
            }
            zone.muted = muted;
            if muted {
                zone.volume_before_mute = zone.volume;
                zone.volume = 0;
            } else {
                zone.volume = zone.volume_before_mute;
            }
            Some(zone.volume)
        })?;
        if let Some(volume) = changed {
            self.emitter.emit(ChangeEvent::ZoneMuteChanged { index, value: muted });
            self.emitter.emit(ChangeEvent::ZoneVolumeChanged { index, value: volume });
        }
        Ok(())
    }

    pub fn toggle_mute(&self, index: ZoneIndex) -> Result<(), SnapDogError> {
        let muted = self
            .get(index)
            .ok_or_else(|| SnapDogError::NotFound(format!("zone {index}")))?
            .muted;
        self.set_mute(index, !muted)
    }

    pub fn set_playback_state(&self, index: ZoneIndex, state: PlaybackState, now_ms: u64) -> Result<(), SnapDogError> {
        self.with_zone(index, |zone| {
            zone.playback = state;
            if state == PlaybackState::Playing {
                zone.playback_started_at_ms = Some(now_ms);
            }
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ZonePlaybackChanged { index, value: state });
        Ok(())
    }

    pub fn set_track(&self, index: ZoneIndex, track: Option<Track>) -> Result<(), SnapDogError> {
        self.with_zone(index, |zone| {
            zone.track = track.clone();
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ZoneTrackChanged { index, value: track });
        Ok(())
    }

    pub fn set_playlist(&self, index: ZoneIndex, playlist: Option<Playlist>) -> Result<(), SnapDogError> {
        self.with_zone(index, |zone| {
            zone.playlist = playlist.clone();
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ZonePlaylistChanged { index, value: playlist });
        Ok(())
    }

    pub fn set_track_repeat(&self, index: ZoneIndex, enabled: bool) -> Result<(), SnapDogError> {
        self.with_zone(index, |zone| {
            if zone.track_repeat == enabled {
                return None;
            }
            zone.track_repeat = enabled;
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ZoneTrackRepeatChanged { index, value: enabled });
        Ok(())
    }

    pub fn toggle_track_repeat(&self, index: ZoneIndex) -> Result<(), SnapDogError> {
        let enabled = self
            .get(index)
            .ok_or_else(|| SnapDogError::NotFound(format!("zone {index}")))?
            .track_repeat;
        self.set_track_repeat(index, !enabled)
    }

    pub fn set_playlist_repeat(&self, index: ZoneIndex, enabled: bool) -> Result<(), SnapDogError> {
        self.with_zone(index, |zone| {
            if zone.playlist_repeat == enabled {
                return None;
            }
            zone.playlist_repeat = enabled;
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ZonePlaylistRepeatChanged { index, value: enabled });
        Ok(())
    }

    pub fn toggle_playlist_repeat(&self, index: ZoneIndex) -> Result<(), SnapDogError> {
        let enabled = self
            .get(index)
            .ok_or_else(|| SnapDogError::NotFound(format!("zone {index}")))?
            .playlist_repeat;
        self.set_playlist_repeat(index, !enabled)
    }

    pub fn set_shuffle(&self, index: ZoneIndex, enabled: bool) -> Result<(), SnapDogError> {
        self.with_zone(index, |zone| {
            if zone.shuffle == enabled {
                return None;
            }
            zone.shuffle = enabled;
            Some(())
        })?;
        self.emitter.emit(ChangeEvent::ZonePlaylistShuffleChanged { index, value: enabled });
        Ok(())
    }

    pub fn toggle_shuffle(&self, index: ZoneIndex) -> Result<(), SnapDogError> {
        let enabled = self
            .get(index)
            .ok_or_else(|| SnapDogError::NotFound(format!("zone {index}")))?
            .shuffle;
        self.set_shuffle(index, !enabled)
    }

    /// `PreviousTrack` within the first 2s of playback moves to the previous
    /// track; once that window has elapsed it restarts the current track
    /// instead (SPEC_FULL.md §4.7 invariants). No playback start time at all
    /// (never played) is treated as "elapsed", since there is nothing to move
    /// back to.
    #[must_use]
    pub fn should_restart_on_previous(&self, index: ZoneIndex, now_ms: u64) -> bool {
        self.get(index)
            .and_then(|z| z.playback_started_at_ms)
            .map(|started| now_ms.saturating_sub(started) >= PREVIOUS_TRACK_RESTART_WINDOW_MS)
            .unwrap_or(true)
    }

    /// `NextTrack` wraps to the first track only if `track_repeat` is set;
    /// otherwise it clamps at the last track of the current playlist
    /// (SPEC_FULL.md §4.7: "NextTrack wraps only if trackRepeat"). A no-op
    /// (already at the last track, repeat off) emits nothing.
    pub fn next_track(&self, index: ZoneIndex) -> Result<(), SnapDogError> {
        let advanced = self.with_zone(index, |zone| {
            let current_index = zone.track.as_ref()?.index;
            let track_count = zone.playlist.as_ref().map_or(0, |p| p.track_count);
            let next_index = if track_count == 0 {
                return None;
            } else if current_index >= track_count {
                if zone.track_repeat {
                    1
                } else {
                    return None;
                }
            } else {
                current_index + 1
            };
            let track = Track { index: next_index, ..zone.track.clone()? };
            zone.track = Some(track.clone());
            Some(track)
        })?;
        if let Some(track) = advanced {
            self.emitter.emit(ChangeEvent::ZoneTrackChanged { index, value: Some(track) });
        }
        Ok(())
    }

    /// `PreviousTrack`'s public entry point: decides restart-vs-go-back via
    /// [`Self::should_restart_on_previous`], then either resets the playback
    /// timer (restart) or steps the track index back by one (go back). Never
    /// wraps below the first track.
    pub fn previous_track(&self, index: ZoneIndex, now_ms: u64) -> Result<(), SnapDogError> {
        if self.should_restart_on_previous(index, now_ms) {
            return self.set_playback_state(index, PlaybackState::Playing, now_ms);
        }
        let moved = self.with_zone(index, |zone| {
            let current_index = zone.track.as_ref()?.index;
            if current_index <= 1 {
                return None;
            }
            let track = Track { index: current_index - 1, ..zone.track.clone()? };
            zone.track = Some(track.clone());
            Some(track)
        })?;
        if let Some(track) = moved {
            self.emitter.emit(ChangeEvent::ZoneTrackChanged { index, value: Some(track) });
        }
        Ok(())
    }

    /// `NextPlaylist` advances to the next playlist. Unlike `NextTrack`, the
    /// store has no total-playlist count to wrap against (only the current
    /// playlist's `track_count` is tracked, per SPEC_FULL.md §1 Non-goals —
    /// playlist enumeration is the media-source collaborator's concern), so
    /// this always steps forward by one; `playlist_repeat` governs whatever
    /// the collaborator does once it runs out, not this store.
    pub fn next_playlist(&self, index: ZoneIndex) -> Result<(), SnapDogError> {
        let advanced = self.with_zone(index, |zone| {
            let current = zone.playlist.clone()?;
            let playlist = Playlist { index: current.index + 1, ..current };
            zone.playlist = Some(playlist.clone());
            Some(playlist)
        })?;
        if let Some(playlist) = advanced {
            self.emitter.emit(ChangeEvent::ZonePlaylistChanged { index, value: Some(playlist) });
        }
        Ok(())
    }

    /// `PreviousPlaylist` steps back one playlist; never wraps below the
    /// first.
    pub fn previous_playlist(&self, index: ZoneIndex) -> Result<(), SnapDogError> {
        let moved = self.with_zone(index, |zone| {
            let current = zone.playlist.clone()?;
            if current.index <= 1 {
                return None;
            }
            let playlist = Playlist { index: current.index - 1, ..current };
            zone.playlist = Some(playlist.clone());
            Some(playlist)
        })?;
        if let Some(playlist) = moved {
            self.emitter.emit(ChangeEvent::ZonePlaylistChanged { index, value: Some(playlist) });
        }
        Ok(())
    }

    pub fn set_associated_group(&self, index: ZoneIndex, group_id: Option<String>) -> Result<(), SnapDogError> {
        self.with_zone(index, |zone| {
            zone.associated_group_id = group_id;
            Some(())
        })?;
        Ok(())
    }

    #[must_use]
    pub fn indices(&self) -> Vec<ZoneIndex> {
        self.zones.iter().map(|e| *e.key()).collect()
    }

    /// Re-emits every current fact for every zone, used by C11's post-startup
    /// full-state publish (SPEC_FULL.md §4.11: "downstream consumers converge
    /// without needing historical retained topics").
    pub fn emit_full_snapshot(&self) {
        for entry in &self.zones {
            let index = *entry.key();
            let zone = entry.value().lock().clone();
            self.emitter.emit(ChangeEvent::ZoneVolumeChanged { index, value: zone.volume });
            self.emitter.emit(ChangeEvent::ZoneMuteChanged { index, value: zone.muted });
            self.emitter.emit(ChangeEvent::ZonePlaybackChanged { index, value: zone.playback });
            self.emitter.emit(ChangeEvent::ZoneTrackChanged { index, value: zone.track });
            self.emitter.emit(ChangeEvent::ZonePlaylistChanged { index, value: zone.playlist });
            self.emitter.emit(ChangeEvent::ZoneTrackRepeatChanged { index, value: zone.track_repeat });
            self.emitter.emit(ChangeEvent::ZonePlaylistRepeatChanged { index, value: zone.playlist_repeat });
            self.emitter.emit(ChangeEvent::ZonePlaylistShuffleChanged { index, value: zone.shuffle });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;

    fn store() -> ZoneStateStore {
        ZoneStateStore::new(
            vec![(1, "Living Room".to_string())],
            Arc::new(NoopEventEmitter),
        )
    }

    #[test]
    fn set_volume_rejects_out_of_range_and_leaves_state_unchanged() {
        let store = store();
        store.set_volume(1, 50).unwrap();
        assert!(store.set_volume(1, 101).is_err());
        assert_eq!(store.get(1).unwrap().volume, 50);
    }

    #[test]
    fn toggle_mute_twice_restores_prior_volume() {
        let store = store();
        store.set_volume(1, 42).unwrap();
        store.toggle_mute(1).unwrap();
        assert_eq!(store.get(1).unwrap().volume, 0);
        store.toggle_mute(1).unwrap();
        assert_eq!(store.get(1).unwrap().volume, 42);
        assert!(!store.get(1).unwrap().muted);
    }

    #[test]
    fn adjust_volume_clamps_rather_than_rejects() {
        let store = store();
        store.set_volume(1, 95).unwrap();
        store.adjust_volume(1, 50).unwrap();
        assert_eq!(store.get(1).unwrap().volume, 100);
    }

    #[test]
    fn unknown_zone_is_not_found() {
        let store = store();
        assert!(matches!(store.set_volume(99, 10), Err(SnapDogError::NotFound(_))));
    }

    #[test]
    fn previous_track_goes_back_within_grace_window_then_restarts() {
        let store = store();
        store.set_playback_state(1, PlaybackState::Playing, 1_000).unwrap();
        assert!(!store.should_restart_on_previous(1, 1_500));
        assert!(store.should_restart_on_previous(1, 5_000));
    }

    #[test]
    fn never_played_zone_restarts_on_previous() {
        let store = store();
        assert!(store.should_restart_on_previous(1, 1_000));
    }

    #[test]
    fn next_track_wraps_only_with_track_repeat_enabled() {
        let store = store();
        store.set_playlist(1, Some(Playlist { index: 1, name: "Mix".into(), track_count: 2 })).unwrap();
        store.set_track(1, Some(Track { index: 2, title: String::new(), artist: None, album: None, duration_ms: None, uri: String::new() })).unwrap();

        store.next_track(1).unwrap();
        assert_eq!(store.get(1).unwrap().track.unwrap().index, 2);

        store.set_track_repeat(1, true).unwrap();
        store.next_track(1).unwrap();
        assert_eq!(store.get(1).unwrap().track.unwrap().index, 1);
    }

    #[test]
    fn previous_track_moves_back_inside_window_and_restarts_outside_it() {
        let store = store();
        store.set_track(1, Some(Track { index: 3, title: String::new(), artist: None, album: None, duration_ms: None, uri: String::new() })).unwrap();
        store.set_playback_state(1, PlaybackState::Playing, 1_000).unwrap();

        store.previous_track(1, 1_500).unwrap();
        assert_eq!(store.get(1).unwrap().track.unwrap().index, 2);

        store.set_playback_state(1, PlaybackState::Playing, 1_000).unwrap();
        store.previous_track(1, 5_000).unwrap();
        assert_eq!(store.get(1).unwrap().track.unwrap().index, 2);
        assert_eq!(store.get(1).unwrap().playback_started_at_ms, Some(5_000));
    }

    #[test]
    fn previous_track_does_not_wrap_below_the_first_track() {
        let store = store();
        store.set_track(1, Some(Track { index: 1, title: String::new(), artist: None, album: None, duration_ms: None, uri: String::new() })).unwrap();
        store.previous_track(1, 10_000).unwrap();
        assert_eq!(store.get(1).unwrap().track.unwrap().index, 1);
    }

    #[test]
    fn playlist_next_and_previous_step_without_wrapping_below_one() {
        let store = store();
        store.set_playlist(1, Some(Playlist { index: 1, name: "Mix".into(), track_count: 5 })).unwrap();

        store.next_playlist(1).unwrap();
        assert_eq!(store.get(1).unwrap().playlist.unwrap().index, 2);

        store.previous_playlist(1).unwrap();
        store.previous_playlist(1).unwrap();
        assert_eq!(store.get(1).unwrap().playlist.unwrap().index, 1);
    }

    #[test]
    fn emit_full_snapshot_does_not_panic_on_empty_or_populated_store() {
        let store = store();
        store.set_volume(1, 30).unwrap();
        store.emit_full_snapshot();
    }
}
