//! C12 — KNXnet/IP tunnelling over raw UDP.
//!
//! No KNX-specific crate exists anywhere in the retrieval pack. KNXnet/IP
//! tunnelling is a UDP protocol with its own framing, so this module follows
//! the same pattern the teacher uses for SSDP discovery
//! (`socket2::Socket` + `tokio::net::UdpSocket` hand-rolling a bespoke framed
//! protocol with no off-the-shelf crate) rather than fabricating a dependency.
//!
//! DPT encode/decode stays a trait boundary ([`DptCodec`]) the core calls but
//! never implements, per the spec naming it an external collaborator.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::config::{KnxEntity, KnxGroupMapping, KnxSignal};
use crate::error::SnapDogError;
use crate::model::{ChangeEvent, PlaybackState};
use crate::policy::{retry, RetryPolicy};
use crate::publisher::TransportPublish;
use crate::runtime::TaskSpawner;

#[derive(Debug, thiserror::Error)]
pub enum KnxError {
    #[error("knx socket error: {0}")]
    Socket(String),
    #[error("knx frame error: {0}")]
    Frame(String),
}

/// Three-level KNX group address (`main/middle/sub`), packed into the 16-bit
/// wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupAddress(pub u16);

impl GroupAddress {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        let (main, middle, sub) = match parts.as_slice() {
            [m, mid, s] => (m.parse::<u16>().ok()?, mid.parse::<u16>().ok()?, s.parse::<u16>().ok()?),
            [m, s] => (m.parse::<u16>().ok()?, 0, s.parse::<u16>().ok()?),
            _ => return None,
        };
        if main > 0x1f || middle > 0x7 || sub > 0xff {
            return None;
        }
        Some(Self((main << 11) | (middle << 8) | sub))
    }

    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            (self.0 >> 11) & 0x1f,
            (self.0 >> 8) & 0x7,
            self.0 & 0xff
        )
    }
}

/// A decoded DPT value; kept deliberately untyped (the codec implementation
/// is an external collaborator, §6).
#[derive(Debug, Clone, PartialEq)]
pub enum DptValue {
    Bool(bool),
    Scaled(u8),
    Raw(Vec<u8>),
}

/// External DPT codec boundary. The core calls `decode`/`encode` but never
/// implements them.
pub trait DptCodec: Send + Sync {
    fn decode(&self, dpt: &str, bytes: &[u8]) -> Option<DptValue>;
    fn encode(&self, dpt: &str, value: &DptValue) -> Vec<u8>;
}

#[derive(Debug, Clone)]
pub enum KnxEvent {
    ConnectionEstablished,
    ConnectionLost(String),
    GroupValueWrite { address: GroupAddress, raw: Vec<u8> },
}

const CONNECT_REQUEST: u16 = 0x0205;
const CONNECT_RESPONSE: u16 = 0x0206;
const DISCONNECT_REQUEST: u16 = 0x0209;
const TUNNELING_REQUEST: u16 = 0x0420;
const TUNNELING_ACK: u16 = 0x0421;

fn knx_header(service_type: u16, body_len: usize) -> Vec<u8> {
    let total = 6 + body_len;
    vec![
        0x06,
        0x10,
        (service_type >> 8) as u8,
        (service_type & 0xff) as u8,
        (total >> 8) as u8,
        (total & 0xff) as u8,
    ]
}

/// Builds a `TUNNELING_REQUEST` frame carrying an `L_Data.req` cEMI APDU
/// for a group-value-write on `address`.
fn build_tunneling_request(channel_id: u8, seq: u8, address: GroupAddress, payload: &[u8]) -> Vec<u8> {
    let mut cemi = vec![
        0x11, // L_Data.req message code
        0x00, // additional info length
        0xbc, // control field 1
        0xe0, // control field 2
        0x00, 0x00, // source address (filled by gateway)
        (address.as_u16() >> 8) as u8,
        (address.as_u16() & 0xff) as u8,
        payload.len() as u8 + 1, // npdu length
        0x00,                    // TPCI/APCI high (group value write = 0x00, 0x80 variants)
        0x80 | payload.first().copied().unwrap_or(0),
    ];
    cemi.extend_from_slice(&payload[1.min(payload.len())..]);

    let mut body = vec![0x04, channel_id, seq, 0x00];
    body.extend_from_slice(&cemi);

    let mut frame = knx_header(TUNNELING_REQUEST, body.len());
    frame.extend_from_slice(&body);
    frame
}

fn build_tunneling_ack(channel_id: u8, seq: u8) -> Vec<u8> {
    let body = vec![0x04, channel_id, seq, 0x00];
    let mut frame = knx_header(TUNNELING_ACK, body.len());
    frame.extend_from_slice(&body);
    frame
}

fn parse_service_type(frame: &[u8]) -> Option<u16> {
    if frame.len() < 6 || frame[0] != 0x06 {
        return None;
    }
    Some(u16::from_be_bytes([frame[2], frame[3]]))
}

/// Parses an inbound `TUNNELING_REQUEST` into a group-address + raw payload,
/// if its cEMI APDU is a group-value-write.
fn parse_tunneling_request(frame: &[u8]) -> Option<(u8, u8, GroupAddress, Vec<u8>)> {
    if frame.len() < 10 + 11 {
        return None;
    }
    let channel_id = frame[7];
    let seq = frame[8];
    let cemi = &frame[10..];
    if cemi.len() < 11 || cemi[0] != 0x29 && cemi[0] != 0x11 {
        return None;
    }
    let group = GroupAddress(u16::from_be_bytes([cemi[6], cemi[7]]));
    let npdu_len = cemi[8] as usize;
    if cemi.len() < 10 + npdu_len.saturating_sub(1) {
        return None;
    }
    let apci_low = cemi[10];
    let mut payload = vec![apci_low & 0x3f];
    payload.extend_from_slice(&cemi[11..11 + npdu_len.saturating_sub(1).min(cemi.len() - 11)]);
    Some((channel_id, seq, group, payload))
}

struct Shared {
    socket: UdpSocket,
    gateway: SocketAddr,
    channel_id: AtomicU8,
    send_seq: AtomicU8,
    events: broadcast::Sender<KnxEvent>,
    connected: AtomicBool,
}

/// A KNXnet/IP tunnelling connection to a single gateway.
#[derive(Clone)]
pub struct KnxTransport {
    shared: Arc<Shared>,
}

impl KnxTransport {
    /// Binds a local UDP socket (SO_REUSEADDR, matching the teacher's SSDP
    /// socket setup) and performs the KNXnet/IP `CONNECT_REQUEST` handshake.
    pub async fn connect(gateway: SocketAddr) -> Result<(Self, broadcast::Receiver<KnxEvent>), KnxError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| KnxError::Socket(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| KnxError::Socket(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| KnxError::Socket(e.to_string()))?;
        socket
            .bind(&"0.0.0.0:0".parse::<SocketAddr>().unwrap().into())
            .map_err(|e| KnxError::Socket(e.to_string()))?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|e| KnxError::Socket(e.to_string()))?;
        socket
            .connect(gateway)
            .await
            .map_err(|e| KnxError::Socket(e.to_string()))?;

        let connect_req = {
            let mut body = vec![0x08, 0x01, 0, 0, 0, 0, 0, 0]; // HPAI control placeholder
            body.extend_from_slice(&[0x08, 0x01, 0, 0, 0, 0, 0, 0]); // HPAI data placeholder
            body.extend_from_slice(&[0x04, 0x04, 0x02, 0x00]); // CRI: tunnel connection, link layer
            let mut frame = knx_header(CONNECT_REQUEST, body.len());
            frame.extend_from_slice(&body);
            frame
        };
        socket
            .send(&connect_req)
            .await
            .map_err(|e| KnxError::Socket(e.to_string()))?;

        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
            .await
            .map_err(|_| KnxError::Frame("connect response timed out".to_string()))?
            .map_err(|e| KnxError::Socket(e.to_string()))?;
        let response = &buf[..n];
        if parse_service_type(response) != Some(CONNECT_RESPONSE) {
            return Err(KnxError::Frame("unexpected connect response".to_string()));
        }
        let channel_id = *response.get(6).ok_or_else(|| KnxError::Frame("short connect response".to_string()))?;

        let (tx, rx) = broadcast::channel(64);
        let _ = tx.send(KnxEvent::ConnectionEstablished);
        let shared = Arc::new(Shared {
            socket,
            gateway,
            channel_id: AtomicU8::new(channel_id),
            send_seq: AtomicU8::new(0),
            events: tx,
            connected: AtomicBool::new(true),
        });
        Ok((Self { shared }, rx))
    }

    pub async fn connect_with_retry(
        gateway: SocketAddr,
        policy: RetryPolicy,
    ) -> Result<(Self, broadcast::Receiver<KnxEvent>), KnxError> {
        retry(
            policy,
            "knx-connect",
            |_e: &KnxError| true,
            |attempt, max, err| tracing::warn!(attempt, max, %err, "knx connect attempt failed"),
            || async move { Self::connect(gateway).await },
        )
        .await
    }

    /// Encodes and sends a group-value-write telegram, awaiting the
    /// gateway's `TUNNELING_ACK` within a short timeout.
    pub async fn send_group_value(&self, address: GroupAddress, payload: &[u8]) -> Result<(), KnxError> {
        let channel_id = self.shared.channel_id.load(Ordering::SeqCst);
        let seq = self.shared.send_seq.fetch_add(1, Ordering::SeqCst);
        let frame = build_tunneling_request(channel_id, seq, address, payload);
        self.shared
            .socket
            .send(&frame)
            .await
            .map_err(|e| KnxError::Socket(e.to_string()))?;

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(3), self.shared.socket.recv(&mut buf))
            .await
            .map_err(|_| KnxError::Frame("tunneling ack timed out".to_string()))?
            .map_err(|e| KnxError::Socket(e.to_string()))?;
        if parse_service_type(&buf[..n]) != Some(TUNNELING_ACK) {
            return Err(KnxError::Frame("expected tunneling ack".to_string()));
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<KnxEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Spawns the inbound read loop: parses `TUNNELING_REQUEST`s from the
    /// gateway, ACKs each one, and emits [`KnxEvent::GroupValueWrite`].
    pub fn spawn_read_loop(&self, spawner: Arc<dyn TaskSpawner>) {
        let shared = self.shared.clone();
        spawner.spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match shared.socket.recv(&mut buf).await {
                    Ok(n) => {
                        let frame = &buf[..n];
                        if parse_service_type(frame) != Some(TUNNELING_REQUEST) {
                            continue;
                        }
                        if let Some((channel_id, seq, address, payload)) = parse_tunneling_request(frame) {
                            let ack = build_tunneling_ack(channel_id, seq);
                            if let Err(err) = shared.socket.send(&ack).await {
                                tracing::warn!(%err, "failed to ack knx tunneling request");
                            }
                            let _ = shared.events.send(KnxEvent::GroupValueWrite {
                                address,
                                raw: payload,
                            });
                        }
                    }
                    Err(err) => {
                        shared.connected.store(false, Ordering::SeqCst);
                        let _ = shared.events.send(KnxEvent::ConnectionLost(err.to_string()));
                        return;
                    }
                }
            }
        });
    }

    pub async fn disconnect(&self) {
        let channel_id = self.shared.channel_id.load(Ordering::SeqCst);
        let body = vec![channel_id, 0x00, 0x08, 0x01, 0, 0, 0, 0];
        let mut frame = knx_header(DISCONNECT_REQUEST, body.len());
        frame.extend_from_slice(&body);
        let _ = self.shared.socket.send(&frame).await;
    }

    #[must_use]
    pub fn gateway(&self) -> SocketAddr {
        self.shared.gateway
    }
}

/// DPT identifier for a given signal kind (SPEC_FULL.md §6: "5.001 0-100%" for
/// volume, "1.001 boolean" for mute/playback).
pub(crate) fn dpt_for_signal(signal: KnxSignal) -> &'static str {
    match signal {
        KnxSignal::Volume => "5.001",
        KnxSignal::Mute | KnxSignal::Playback => "1.001",
    }
}

/// Maps a [`ChangeEvent`] onto the `(entity, index, signal, value)` triple
/// the group-address map is keyed by. Events with no KNX equivalent (track,
/// playlist, name, connectivity, zone-assignment) return `None`.
fn event_signal(event: &ChangeEvent) -> Option<(KnxEntity, u32, KnxSignal, DptValue)> {
    match event {
        ChangeEvent::ZoneVolumeChanged { index, value } => {
            Some((KnxEntity::Zone, *index, KnxSignal::Volume, DptValue::Scaled(*value)))
        }
        ChangeEvent::ZoneMuteChanged { index, value } => {
            Some((KnxEntity::Zone, *index, KnxSignal::Mute, DptValue::Bool(*value)))
        }
        ChangeEvent::ZonePlaybackChanged { index, value } => Some((
            KnxEntity::Zone,
            *index,
            KnxSignal::Playback,
            DptValue::Bool(*value == PlaybackState::Playing),
        )),
        ChangeEvent::ClientVolumeChanged { index, value } => {
            Some((KnxEntity::Client, *index, KnxSignal::Volume, DptValue::Scaled(*value)))
        }
        ChangeEvent::ClientMuteChanged { index, value } => {
            Some((KnxEntity::Client, *index, KnxSignal::Mute, DptValue::Bool(*value)))
        }
        _ => None,
    }
}

/// The [`TransportPublish`] adapter C10 drives for the KNX leg: resolves the
/// configured group address for an event and sends a DPT-encoded
/// group-value-write. Events outside the configured map, or outside the
/// handful of signals KNX mirrors at all, are silently skipped — not every
/// `ChangeEvent` has a KNX equivalent (SPEC_FULL.md §4.12).
pub struct KnxPublisher {
    transport: KnxTransport,
    codec: Arc<dyn DptCodec>,
    status_map: HashMap<(KnxEntity, u32, KnxSignal), GroupAddress>,
}

impl KnxPublisher {
    #[must_use]
    pub fn new(transport: KnxTransport, codec: Arc<dyn DptCodec>, mappings: &[KnxGroupMapping]) -> Self {
        let status_map = mappings
            .iter()
            .filter_map(|m| GroupAddress::parse(&m.address).map(|addr| ((m.entity, m.index, m.signal), addr)))
            .collect();
        Self { transport, codec, status_map }
    }
}

#[async_trait]
impl TransportPublish for KnxPublisher {
    fn name(&self) -> &'static str {
        "knx"
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn publish_event(&self, event: &ChangeEvent) -> Result<(), SnapDogError> {
        let Some((entity, index, signal, value)) = event_signal(event) else {
            return Ok(());
        };
        let Some(address) = self.status_map.get(&(entity, index, signal)).copied() else {
            return Ok(());
        };
        let bytes = self.codec.encode(dpt_for_signal(signal), &value);
        self.transport
            .send_group_value(address, &bytes)
            .await
            .map_err(SnapDogError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_address_parses_three_level() {
        let addr = GroupAddress::parse("1/2/3").unwrap();
        assert_eq!(addr.to_string(), "1/2/3");
    }

    #[test]
    fn group_address_rejects_out_of_range() {
        assert!(GroupAddress::parse("32/0/0").is_none());
        assert!(GroupAddress::parse("0/8/0").is_none());
    }

    #[test]
    fn group_address_rejects_malformed() {
        assert!(GroupAddress::parse("not-an-address").is_none());
        assert!(GroupAddress::parse("1/2/3/4").is_none());
    }

    #[test]
    fn tunneling_request_roundtrips_group_address_and_payload() {
        let address = GroupAddress::parse("1/2/3").unwrap();
        let frame = build_tunneling_request(7, 1, address, &[0x01]);
        let (channel_id, seq, parsed_address, _payload) = parse_tunneling_request(&frame).unwrap();
        assert_eq!(channel_id, 7);
        assert_eq!(seq, 1);
        assert_eq!(parsed_address, address);
    }

    #[test]
    fn parse_service_type_reads_header() {
        let frame = knx_header(TUNNELING_ACK, 4);
        assert_eq!(parse_service_type(&frame), Some(TUNNELING_ACK));
    }

    #[test]
    fn parse_service_type_rejects_bad_magic() {
        let mut frame = knx_header(TUNNELING_ACK, 4);
        frame[0] = 0xff;
        assert_eq!(parse_service_type(&frame), None);
    }

    #[test]
    fn event_signal_maps_zone_volume_to_scaled_dpt() {
        let event = ChangeEvent::ZoneVolumeChanged { index: 1, value: 42 };
        let (entity, index, signal, value) = event_signal(&event).unwrap();
        assert_eq!(entity, KnxEntity::Zone);
        assert_eq!(index, 1);
        assert_eq!(signal, KnxSignal::Volume);
        assert_eq!(value, DptValue::Scaled(42));
        assert_eq!(dpt_for_signal(signal), "5.001");
    }

    #[test]
    fn event_signal_ignores_events_with_no_knx_equivalent() {
        let event = ChangeEvent::ClientNameChanged { index: 1, value: "Kitchen".into() };
        assert!(event_signal(&event).is_none());
    }

    #[test]
    fn event_signal_maps_playback_to_boolean() {
        let playing = ChangeEvent::ZonePlaybackChanged { index: 1, value: PlaybackState::Playing };
        let (_, _, signal, value) = event_signal(&playing).unwrap();
        assert_eq!(signal, KnxSignal::Playback);
        assert_eq!(value, DptValue::Bool(true));
    }
}
