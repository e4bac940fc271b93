//! C3 — translates domain operations into Snapcast JSON-RPC calls and bridges
//! incoming notifications back into [`ChangeEvent`]s.
//!
//! Grounded on `services::gena_event_processor::GenaEventProcessor::process_event_with_deps`
//! (match each notification variant, mutate the shared state repository, then
//! unconditionally emit) and `services::discovery_service::DiscoveryService`'s
//! facade-over-a-connection-lifecycle-component shape (C2 plays the role its
//! `TopologyMonitor` plays; C3 is the composed facade).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};

use crate::client_store::ClientStateStore;
use crate::error::SnapDogResult;
use crate::events::EventEmitter;
use crate::model::{ChangeEvent, ClientIndex, GroupId, SnapcastClientId, StreamId};
use crate::policy::RetryPolicy;
use crate::runtime::TaskSpawner;
use crate::zone_store::ZoneStateStore;

use super::rpc::{RpcClient, RpcEvent};
use super::state::{ServerInfo, ServerSnapshot, SnapcastClient, SnapcastState};

/// SPEC_FULL.md §4.2 item 4: "Health check every 30s via `Server.GetRPCVersion`".
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// SPEC_FULL.md §9-OQ3: "a periodic 'ensure grouping' tick (interval
/// configurable, default 10s, ...)".
const GROUPING_RECONCILIATION_INTERVAL: Duration = Duration::from_secs(10);

/// Thin facade composing C1 (state) and C2 (RPC transport) into the domain
/// operations the command bus (C6) and startup orchestrator (C11) call.
pub struct SnapcastService {
    rpc: RpcClient,
    state: Arc<SnapcastState>,
    emitter: Arc<dyn EventEmitter>,
    /// Last known non-zero volume per client, for mute/unmute restore
    /// (SPEC_FULL.md §4.3's "preserve current volume" note).
    volume_cache: DashMap<SnapcastClientId, u8>,
}

impl SnapcastService {
    #[must_use]
    pub fn new(rpc: RpcClient, state: Arc<SnapcastState>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            rpc,
            state,
            emitter,
            volume_cache: DashMap::new(),
        }
    }

    /// Fetches `Server.GetStatus` and pushes the result into C1 as a full
    /// snapshot (SPEC_FULL.md §4.3's "state-of-truth reconciliation").
    pub async fn refresh_full_status(&self) -> SnapDogResult<()> {
        let raw: Value = self.rpc.send_request("Server.GetStatus", json!({})).await?;
        self.state.update_server_state(parse_server_status(&raw));
        Ok(())
    }

    /// Exposes C1 for read-only resolution (e.g. C6 resolving `ClientIndex`
    /// to the current `SnapcastClientId` before issuing an RPC call).
    #[must_use]
    pub fn state(&self) -> &Arc<SnapcastState> {
        &self.state
    }

    pub async fn get_rpc_version(&self) -> SnapDogResult<String> {
        let raw: Value = self
            .rpc
            .send_request("Server.GetRPCVersion", json!({}))
            .await?;
        Ok(raw.to_string())
    }

    pub async fn set_client_volume(&self, client_id: &str, percent: u8) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>(
                "Client.SetVolume",
                json!({ "id": client_id, "volume": { "percent": percent, "muted": false } }),
            )
            .await?;
        self.volume_cache.insert(client_id.to_string(), percent);
        if let Some(mut c) = self.state.get_client(client_id) {
            c.volume = percent;
            self.state.update_client(c);
        }
        Ok(())
    }

    /// Mutes set volume to 0 while retaining the cached prior value; unmute
    /// restores it.
    pub async fn set_client_mute(&self, client_id: &str, muted: bool) -> SnapDogResult<()> {
        let restore_volume = if muted {
            0
        } else {
            self.volume_cache.get(client_id).map(|v| *v).unwrap_or(50)
        };
        self.rpc
            .send_request::<Value>(
                "Client.SetVolume",
                json!({ "id": client_id, "volume": { "percent": restore_volume, "muted": muted } }),
            )
            .await?;
        if let Some(mut c) = self.state.get_client(client_id) {
            c.muted = muted;
            if !muted {
                c.volume = restore_volume;
            }
            self.state.update_client(c);
        }
        Ok(())
    }

    pub async fn set_client_latency(&self, client_id: &str, latency_ms: u32) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>(
                "Client.SetLatency",
                json!({ "id": client_id, "latency": latency_ms }),
            )
            .await?;
        if let Some(mut c) = self.state.get_client(client_id) {
            c.latency_ms = latency_ms;
            self.state.update_client(c);
        }
        Ok(())
    }

    pub async fn set_client_name(&self, client_id: &str, name: &str) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>("Client.SetName", json!({ "id": client_id, "name": name }))
            .await?;
        if let Some(mut c) = self.state.get_client(client_id) {
            c.name = name.to_string();
            self.state.update_client(c);
        }
        Ok(())
    }

    pub async fn delete_client(&self, client_id: &str) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>("Server.DeleteClient", json!({ "id": client_id }))
            .await?;
        self.state.remove_client(client_id);
        Ok(())
    }

    pub async fn set_group_mute(&self, group_id: &str, muted: bool) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>("Group.SetMute", json!({ "id": group_id, "mute": muted }))
            .await?;
        Ok(())
    }

    pub async fn set_group_stream(&self, group_id: &str, stream_id: &StreamId) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>(
                "Group.SetStream",
                json!({ "id": group_id, "stream_id": stream_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn set_group_name(&self, group_id: &str, name: &str) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>("Group.SetName", json!({ "id": group_id, "name": name }))
            .await?;
        Ok(())
    }

    /// Called by §9-OQ3's reconciliation pass; only when live membership
    /// (from C1) differs from `wanted`.
    pub async fn set_group_clients(
        &self,
        group_id: &GroupId,
        wanted: &[SnapcastClientId],
    ) -> SnapDogResult<()> {
        self.rpc
            .send_request::<Value>(
                "Group.SetClients",
                json!({ "id": group_id, "clients": wanted }),
            )
            .await?;
        Ok(())
    }

    /// Spawns the long-lived notification-bridging loop over `rpc`'s event
    /// channel, mirroring `GenaEventProcessor::start_event_forwarder`'s
    /// spawn-a-drain-loop-over-a-channel shape.
    pub fn start_notification_bridge(self: &Arc<Self>, spawner: Arc<dyn TaskSpawner>) {
        let mut events = self.rpc.subscribe_events();
        let service = self.clone_handle();
        spawner.spawn(async move {
            while let Ok(event) = events.recv().await {
                service.handle_rpc_event(event).await;
            }
        });
    }

    fn clone_handle(self: &Arc<Self>) -> Arc<Self> {
        self.clone()
    }

    /// Spawns the 30s liveness loop (SPEC_FULL.md §4.2 item 4): a failed
    /// `Server.GetRPCVersion` call triggers a reconnect under `retry_policy`.
    /// The first tick is consumed immediately so the loop's first real check
    /// lands a full interval after bring-up, not right on top of it.
    pub fn start_health_check(self: &Arc<Self>, spawner: Arc<dyn TaskSpawner>, retry_policy: RetryPolicy) {
        let service = self.clone_handle();
        let reconnect_spawner = spawner.clone();
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = service.get_rpc_version().await {
                    tracing::warn!(%err, "snapcast health check failed, reconnecting");
                    if let Err(err) = service
                        .rpc
                        .connect_with_retry(reconnect_spawner.clone(), retry_policy)
                        .await
                    {
                        tracing::warn!(%err, "snapcast reconnect after failed health check gave up");
                    }
                }
            }
        });
    }

    /// Spawns the periodic "ensure grouping" tick (SPEC_FULL.md §9-OQ3).
    pub fn start_grouping_reconciliation(
        self: &Arc<Self>,
        zones: Arc<ZoneStateStore>,
        clients: Arc<ClientStateStore>,
        spawner: Arc<dyn TaskSpawner>,
    ) {
        let service = self.clone_handle();
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(GROUPING_RECONCILIATION_INTERVAL);
            loop {
                ticker.tick().await;
                service.reconcile_zone_groups(&zones, &clients).await;
            }
        });
    }

    /// Runs one reconciliation pass over every zone; failures are logged and
    /// skipped rather than aborting the whole pass (SPEC_FULL.md §9-OQ3).
    pub async fn reconcile_zone_groups(&self, zones: &ZoneStateStore, clients: &ClientStateStore) {
        for index in zones.indices() {
            if let Err(err) = self.reconcile_zone_group(index, zones, clients).await {
                tracing::warn!(zone = index, %err, "zone/group reconciliation failed");
            }
        }
    }

    async fn reconcile_zone_group(
        &self,
        index: crate::model::ZoneIndex,
        zones: &ZoneStateStore,
        clients: &ClientStateStore,
    ) -> SnapDogResult<()> {
        let zone = zones
            .get(index)
            .ok_or_else(|| crate::error::SnapDogError::NotFound(format!("zone {index}")))?;

        let wanted: Vec<SnapcastClientId> = clients
            .indices_assigned_to(index)
            .into_iter()
            .filter_map(|client_index| self.state.get_client_by_index(client_index).map(|c| c.id))
            .collect();

        if wanted.is_empty() {
            return Ok(());
        }

        if let Some(group_id) = &zone.associated_group_id {
            let live = self.state.get_group(group_id).map(|g| g.clients).unwrap_or_default();
            if !same_membership(&live, &wanted) {
                self.set_group_clients(group_id, &wanted).await?;
            }
            self.set_group_name(group_id, &zone.name).await?;
            return Ok(());
        }

        let groups = self.state.groups();
        if let Some(exact) = groups.iter().find(|g| same_membership(&g.clients, &wanted)) {
            zones.set_associated_group(index, Some(exact.id.clone()))?;
            return Ok(());
        }

        if let Some(best) = groups.iter().max_by_key(|g| overlap_count(&g.clients, &wanted)) {
            self.set_group_clients(&best.id, &wanted).await?;
            zones.set_associated_group(index, Some(best.id.clone()))?;
        }
        Ok(())
    }

    async fn handle_rpc_event(&self, event: RpcEvent) {
        match event {
            RpcEvent::ConnectionEstablished => {
                if let Err(err) = self.refresh_full_status().await {
                    tracing::warn!(%err, "snapcast full-status refresh after connect failed");
                }
            }
            RpcEvent::ConnectionLost(reason) => {
                tracing::warn!(reason, "snapcast connection lost");
            }
            RpcEvent::Notification { method, params } => {
                self.handle_notification(&method, &params);
            }
        }
    }

    /// Matches each notification variant, updates C1, then resolves
    /// `SnapcastClientId -> ClientIndex` to emit a domain event. If
    /// resolution fails the event is dropped with a warning; the
    /// notification itself never fails (SPEC_FULL.md §4.3).
    fn handle_notification(&self, method: &str, params: &Value) {
        match method {
            "Client.OnVolumeChanged" => {
                let Some(id) = params.get("id").and_then(Value::as_str) else {
                    return;
                };
                let percent = params
                    .pointer("/volume/percent")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u8;
                let muted = params
                    .pointer("/volume/muted")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let Some(mut c) = self.state.get_client(id) {
                    c.volume = percent;
                    c.muted = muted;
                    self.state.update_client(c);
                }
                self.emit_for_client(id, |index| ChangeEvent::ClientVolumeChanged {
                    index,
                    value: percent,
                });
                self.emit_for_client(id, |index| ChangeEvent::ClientMuteChanged {
                    index,
                    value: muted,
                });
            }
            "Client.OnLatencyChanged" => {
                let Some(id) = params.get("id").and_then(Value::as_str) else {
                    return;
                };
                let latency = params.get("latency").and_then(Value::as_u64).unwrap_or(0) as u32;
                if let Some(mut c) = self.state.get_client(id) {
                    c.latency_ms = latency;
                    self.state.update_client(c);
                }
                self.emit_for_client(id, |index| ChangeEvent::ClientLatencyChanged {
                    index,
                    value: latency,
                });
            }
            "Client.OnNameChanged" => {
                let Some(id) = params.get("id").and_then(Value::as_str) else {
                    return;
                };
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(mut c) = self.state.get_client(id) {
                    c.name = name.clone();
                    self.state.update_client(c);
                }
                self.emit_for_client(id, |index| ChangeEvent::ClientNameChanged {
                    index,
                    value: name.clone(),
                });
            }
            "Client.OnConnect" | "Client.OnDisconnect" => {
                let Some(id) = params.get("id").and_then(Value::as_str) else {
                    return;
                };
                let connected = method == "Client.OnConnect";
                if let Some(mut c) = self.state.get_client(id) {
                    c.connected = connected;
                    self.state.update_client(c);
                }
                self.emit_for_client(id, |index| ChangeEvent::ClientConnectedChanged {
                    index,
                    value: connected,
                });
            }
            "Server.OnUpdate" => {
                tracing::debug!("snapcast server update notification received, triggering full refresh on next poll");
            }
            "Group.OnMute" | "Group.OnStreamChanged" | "Group.OnNameChanged"
            | "Stream.OnUpdate" | "Stream.OnProperties" => {
                tracing::debug!(method, "snapcast group/stream notification, state mirrored on next full-status refresh");
            }
            other => {
                tracing::debug!(method = other, "unhandled snapcast notification");
            }
        }
    }

    fn emit_for_client(&self, snapcast_id: &str, make_event: impl FnOnce(ClientIndex) -> ChangeEvent) {
        match self.state.get_client_index_by_snapcast_id(snapcast_id) {
            Some(index) => self.emitter.emit(make_event(index)),
            None => tracing::warn!(
                snapcast_id,
                "snapcast notification for client with no configured index, dropped"
            ),
        }
    }
}

/// Set equality ignoring order/duplicates, used to decide whether a live
/// group's membership already matches the wanted client set (SPEC_FULL.md
/// §9-OQ3 step c's idempotence guarantee).
fn same_membership(live: &[SnapcastClientId], wanted: &[SnapcastClientId]) -> bool {
    live.len() == wanted.len() && wanted.iter().all(|id| live.contains(id))
}

/// How many of `wanted` are already in `group` — used to pick the group with
/// the largest overlap when no group exactly matches (SPEC_FULL.md §9-OQ3
/// step b: "minimises audible regrouping clicks").
fn overlap_count(group: &[SnapcastClientId], wanted: &[SnapcastClientId]) -> usize {
    wanted.iter().filter(|id| group.contains(id)).count()
}

fn parse_server_status(raw: &Value) -> ServerSnapshot {
    let server_info = raw
        .pointer("/server/host/name")
        .and_then(Value::as_str)
        .map(|name| ServerInfo {
            version: name.to_string(),
        });

    let mut clients = Vec::new();
    let mut groups = Vec::new();
    let streams = raw
        .pointer("/streams")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|s| {
                    let id = s.get("id")?.as_str()?.to_string();
                    Some(crate::model::Stream {
                        id,
                        status: crate::model::StreamStatus::Unknown,
                        uri: s
                            .pointer("/uri/raw")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        properties: Default::default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(raw_groups) = raw.pointer("/server/groups").and_then(Value::as_array) {
        for g in raw_groups {
            let Some(group_id) = g.get("id").and_then(Value::as_str) else {
                continue;
            };
            let client_ids: Vec<SnapcastClientId> = g
                .get("clients")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|c| {
                            let id = c.get("id")?.as_str()?.to_string();
                            clients.push(parse_client(c, group_id));
                            Some(id)
                        })
                        .collect()
                })
                .unwrap_or_default();

            groups.push(crate::model::SnapcastGroup {
                id: group_id.to_string(),
                name: g.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                muted: g.get("muted").and_then(Value::as_bool).unwrap_or(false),
                stream_id: g
                    .get("stream_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                clients: client_ids,
            });
        }
    }

    ServerSnapshot {
        clients,
        groups,
        streams,
        server_info,
    }
}

fn parse_client(raw: &Value, group_id: &str) -> SnapcastClient {
    SnapcastClient {
        id: raw.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
        name: raw
            .pointer("/config/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        mac: raw
            .pointer("/host/mac")
            .and_then(Value::as_str)
            .and_then(crate::model::MacAddress::normalize),
        connected: raw.get("connected").and_then(Value::as_bool).unwrap_or(false),
        volume: raw
            .pointer("/config/volume/percent")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u8,
        muted: raw
            .pointer("/config/volume/muted")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        latency_ms: raw
            .pointer("/config/latency")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        group_id: Some(group_id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_store::ClientStateStore;
    use crate::events::NoopEventEmitter;
    use crate::zone_store::ZoneStateStore;
    use std::collections::HashMap;

    fn service() -> SnapcastService {
        let (rpc, _rx) = RpcClient::new("localhost", 1705);
        let state = Arc::new(SnapcastState::new(HashMap::new()));
        SnapcastService::new(rpc, state, Arc::new(NoopEventEmitter))
    }

    #[test]
    fn parse_server_status_extracts_groups_and_clients() {
        let raw = json!({
            "server": {
                "host": { "name": "snapserver" },
                "groups": [{
                    "id": "g1",
                    "name": "Living Room",
                    "muted": false,
                    "stream_id": "s1",
                    "clients": [{
                        "id": "ab:cd:ef:01:02:03",
                        "connected": true,
                        "config": { "name": "Kitchen", "volume": { "percent": 40, "muted": false }, "latency": 10 },
                        "host": { "mac": "ab:cd:ef:01:02:03" }
                    }]
                }]
            },
            "streams": [{ "id": "s1", "uri": { "raw": "pipe:///tmp/s1" } }]
        });
        let snapshot = parse_server_status(&raw);
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.clients.len(), 1);
        assert_eq!(snapshot.clients[0].volume, 40);
        assert_eq!(snapshot.streams.len(), 1);
        assert_eq!(snapshot.server_info.unwrap().version, "snapserver");
    }

    #[test]
    fn handle_notification_drops_event_for_unresolved_client() {
        let svc = service();
        // No panic, no emitted event, despite no configured MAC mapping.
        svc.handle_notification(
            "Client.OnVolumeChanged",
            &json!({ "id": "unknown", "volume": { "percent": 10, "muted": false } }),
        );
    }

    #[test]
    fn handle_notification_updates_client_state() {
        let svc = service();
        svc.state.update_client(SnapcastClient {
            id: "c1".to_string(),
            name: "Kitchen".to_string(),
            mac: None,
            connected: true,
            volume: 10,
            muted: false,
            latency_ms: 0,
            group_id: None,
        });
        svc.handle_notification(
            "Client.OnVolumeChanged",
            &json!({ "id": "c1", "volume": { "percent": 88, "muted": true } }),
        );
        let client = svc.state.get_client("c1").unwrap();
        assert_eq!(client.volume, 88);
        assert!(client.muted);
    }

    #[test]
    fn same_membership_ignores_order() {
        let live = vec!["a".to_string(), "b".to_string()];
        let wanted = vec!["b".to_string(), "a".to_string()];
        assert!(same_membership(&live, &wanted));
        assert!(!same_membership(&live, &["a".to_string()]));
    }

    #[test]
    fn overlap_count_counts_shared_members() {
        let group = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let wanted = vec!["b".to_string(), "c".to_string(), "d".to_string()];
        assert_eq!(overlap_count(&group, &wanted), 2);
    }

    #[tokio::test]
    async fn reconciliation_skips_zone_with_no_assigned_clients() {
        let svc = service();
        let zones = ZoneStateStore::new(vec![(1, "Living Room".to_string())], Arc::new(NoopEventEmitter));
        let clients = ClientStateStore::new(vec![(1, "Kitchen".to_string())], Arc::new(NoopEventEmitter));
        // No client is assigned to zone 1, so reconciliation must not touch
        // the RPC client (which isn't connected and would error).
        svc.reconcile_zone_groups(&zones, &clients).await;
        assert!(zones.get(1).unwrap().associated_group_id.is_none());
    }

    #[tokio::test]
    async fn reconciliation_skips_when_wanted_client_has_no_snapcast_mapping() {
        let svc = service();
        let zones = ZoneStateStore::new(vec![(1, "Living Room".to_string())], Arc::new(NoopEventEmitter));
        let clients = ClientStateStore::new(vec![(1, "Kitchen".to_string())], Arc::new(NoopEventEmitter));
        clients.assign_zone(1, Some(1)).unwrap();
        // Client 1 has no configured MAC, so it never resolves to a
        // SnapcastClientId; the wanted set stays empty and no RPC call fires.
        svc.reconcile_zone_groups(&zones, &clients).await;
        assert!(zones.get(1).unwrap().associated_group_id.is_none());
    }
}
