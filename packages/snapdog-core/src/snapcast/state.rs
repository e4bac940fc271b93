//! C1 — the authoritative in-memory projection of Snapcast server state.
//!
//! Three keyed collections (clients, groups, streams) plus a server-info
//! record, mirroring `thaumic-core::state::SonosState`'s per-field
//! `DashMap`/`RwLock<Vec<_>>` split: groups are replaced wholesale on every
//! topology-shaped update (so they're a `RwLock<Vec<_>>`, read as a unit),
//! clients and streams are mutated one-at-a-time by notifications (so they're
//! `DashMap`s, read/written per key without a global lock).

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::model::{ClientIndex, GroupId, MacAddress, SnapcastClientId, SnapcastGroup, Stream, StreamId};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapcastClient {
    pub id: SnapcastClientId,
    pub name: String,
    pub mac: Option<MacAddress>,
    pub connected: bool,
    pub volume: u8,
    pub muted: bool,
    pub latency_ms: u32,
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    pub version: String,
}

/// A full `Server.GetStatus` result, applied as one differential update.
#[derive(Debug, Clone, Default)]
pub struct ServerSnapshot {
    pub clients: Vec<SnapcastClient>,
    pub groups: Vec<SnapcastGroup>,
    pub streams: Vec<Stream>,
    pub server_info: Option<ServerInfo>,
}

/// Snapcast-mirror state. Every operation is total: missing entries return
/// `None`, never an error (SPEC_FULL.md §4.1 failure semantics).
pub struct SnapcastState {
    clients: DashMap<SnapcastClientId, SnapcastClient>,
    groups: RwLock<Vec<SnapcastGroup>>,
    streams: DashMap<StreamId, Stream>,
    server_info: RwLock<Option<ServerInfo>>,
    /// Built once from configuration at construction; immutable for the run.
    mac_to_index: HashMap<MacAddress, ClientIndex>,
}

impl SnapcastState {
    #[must_use]
    pub fn new(mac_to_index: HashMap<MacAddress, ClientIndex>) -> Self {
        Self {
            clients: DashMap::new(),
            groups: RwLock::new(Vec::new()),
            streams: DashMap::new(),
            server_info: RwLock::new(None),
            mac_to_index,
        }
    }

    /// Atomically replaces all three keyed collections with a full snapshot,
    /// computing `to_remove = current_keys - new_keys` and applying removals
    /// before upserts. Generalises `SonosState::cleanup_stale_entries` from a
    /// single `DashMap<String, _>` to three independent collections.
    pub fn update_server_state(&self, snapshot: ServerSnapshot) {
        let new_client_ids: std::collections::HashSet<_> =
            snapshot.clients.iter().map(|c| c.id.clone()).collect();
        self.clients.retain(|id, _| new_client_ids.contains(id));
        for client in snapshot.clients {
            self.clients.insert(client.id.clone(), client);
        }

        let new_stream_ids: std::collections::HashSet<_> =
            snapshot.streams.iter().map(|s| s.id.clone()).collect();
        self.streams.retain(|id, _| new_stream_ids.contains(id));
        for stream in snapshot.streams {
            self.streams.insert(stream.id.clone(), stream);
        }

        *self.groups.write() = snapshot.groups;

        if let Some(info) = snapshot.server_info {
            *self.server_info.write() = Some(info);
        }
    }

    pub fn update_client(&self, client: SnapcastClient) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove_client(&self, id: &str) -> Option<SnapcastClient> {
        self.clients.remove(id).map(|(_, c)| c)
    }

    pub fn update_group(&self, group: SnapcastGroup) {
        let mut groups = self.groups.write();
        if let Some(existing) = groups.iter_mut().find(|g| g.id == group.id) {
            *existing = group;
        } else {
            groups.push(group);
        }
    }

    pub fn remove_group(&self, id: &str) {
        self.groups.write().retain(|g| g.id != id);
    }

    pub fn update_stream(&self, stream: Stream) {
        self.streams.insert(stream.id.clone(), stream);
    }

    pub fn remove_stream(&self, id: &str) -> Option<Stream> {
        self.streams.remove(id).map(|(_, s)| s)
    }

    #[must_use]
    pub fn get_client(&self, id: &str) -> Option<SnapcastClient> {
        self.clients.get(id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn get_group(&self, id: &str) -> Option<SnapcastGroup> {
        self.groups.read().iter().find(|g| g.id == id).cloned()
    }

    #[must_use]
    pub fn get_stream(&self, id: &str) -> Option<Stream> {
        self.streams.get(id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn groups(&self) -> Vec<SnapcastGroup> {
        self.groups.read().clone()
    }

    #[must_use]
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    /// Resolves a configuration MAC to the Snapcast client whose host MAC
    /// matches case-insensitively. Absent if no MAC is configured for this
    /// index, or no currently-known client carries it.
    #[must_use]
    pub fn get_client_by_index(&self, index: ClientIndex) -> Option<SnapcastClient> {
        let mac = self
            .mac_to_index
            .iter()
            .find(|(_, idx)| **idx == index)
            .map(|(mac, _)| mac)?;
        self.clients
            .iter()
            .find(|r| r.value().mac.as_ref() == Some(mac))
            .map(|r| r.value().clone())
    }

    /// Reverse resolution: Snapcast client id -> configured index, via MAC.
    #[must_use]
    pub fn get_client_index_by_snapcast_id(&self, id: &str) -> Option<ClientIndex> {
        let client = self.clients.get(id)?;
        let mac = client.mac.as_ref()?;
        self.mac_to_index.get(mac).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamStatus;

    fn client(id: &str, mac: Option<&str>) -> SnapcastClient {
        SnapcastClient {
            id: id.to_string(),
            name: id.to_string(),
            mac: mac.and_then(MacAddress::normalize),
            connected: true,
            volume: 50,
            muted: false,
            latency_ms: 0,
            group_id: None,
        }
    }

    fn stream(id: &str) -> Stream {
        Stream {
            id: id.to_string(),
            status: StreamStatus::Idle,
            uri: "pipe:///tmp/foo".to_string(),
            properties: Default::default(),
        }
    }

    #[test]
    fn full_snapshot_removes_entries_absent_from_new_set() {
        let state = SnapcastState::new(HashMap::new());
        state.update_client(client("c1", None));
        state.update_client(client("c2", None));
        state.update_server_state(ServerSnapshot {
            clients: vec![client("c2", None)],
            ..Default::default()
        });
        assert!(state.get_client("c1").is_none());
        assert!(state.get_client("c2").is_some());
    }

    #[test]
    fn full_snapshot_replaces_groups_wholesale() {
        let state = SnapcastState::new(HashMap::new());
        state.update_group(SnapcastGroup {
            id: "g1".into(),
            name: "Old".into(),
            muted: false,
            stream_id: "s1".into(),
            clients: vec![],
        });
        state.update_server_state(ServerSnapshot {
            groups: vec![SnapcastGroup {
                id: "g2".into(),
                name: "New".into(),
                muted: false,
                stream_id: "s1".into(),
                clients: vec![],
            }],
            ..Default::default()
        });
        let groups = state.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "g2");
    }

    #[test]
    fn stream_lookup_is_total() {
        let state = SnapcastState::new(HashMap::new());
        state.update_stream(stream("s1"));
        assert!(state.get_stream("s1").is_some());
        assert!(state.get_stream("missing").is_none());
        assert!(state.remove_stream("s1").is_some());
        assert!(state.get_stream("s1").is_none());
    }

    #[test]
    fn mac_resolution_round_trips_by_index() {
        let mac = MacAddress::normalize("AA:BB:CC:DD:EE:FF").unwrap();
        let mut mac_to_index = HashMap::new();
        mac_to_index.insert(mac, 1u32);
        let state = SnapcastState::new(mac_to_index);
        state.update_client(client("snap-1", Some("aa:bb:cc:dd:ee:ff")));

        let resolved = state.get_client_by_index(1).unwrap();
        assert_eq!(resolved.id, "snap-1");
        assert_eq!(state.get_client_index_by_snapcast_id("snap-1"), Some(1));
    }

    #[test]
    fn mac_resolution_is_absent_without_configured_mac() {
        let state = SnapcastState::new(HashMap::new());
        state.update_client(client("snap-1", Some("aa:bb:cc:dd:ee:ff")));
        assert!(state.get_client_by_index(1).is_none());
        assert_eq!(state.get_client_index_by_snapcast_id("snap-1"), None);
    }
}
