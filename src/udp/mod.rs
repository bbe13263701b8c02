pub mod protocol;

use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::band::{Eu868, UplinkTxInfo};
use crate::config::Config;
use crate::downlink::{DownlinkFrame, GatewayBackend};
use crate::gateway::{GatewayId, ReceptionRecord};
use crate::storage::MemoryStore;
use crate::uplink::{UplinkEvent, UplinkHandler};
use protocol::{GwmpPacket, PushDataPayload, Txpk};

/// Gateway backend that queues downlink frames for the UDP server task,
/// which sends them as PULL_RESP to the gateway.
#[derive(Clone)]
pub struct DownlinkSender {
    tx: mpsc::UnboundedSender<DownlinkFrame>,
}

impl GatewayBackend for DownlinkSender {
    fn send_tx_packet(&self, frame: DownlinkFrame) -> anyhow::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("UDP server is not running"))
    }
}

/// A gateway that has not acknowledged a PULL_RESP by then never will
const IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receptions of one uplink collected from all gateways
struct PendingUplink {
    first_seen: Instant,
    received_at: DateTime<Utc>,
    tx_info: UplinkTxInfo,
    rx_info: Vec<ReceptionRecord>,
}

/// A downlink frame waiting for the gateway's TX_ACK
struct InFlight {
    frame: DownlinkFrame,
    /// Index of the item last sent
    item: usize,
    sent_at: Instant,
}

struct Server {
    socket: UdpSocket,
    /// Where each gateway's last PULL_DATA came from
    gateways: HashMap<GatewayId, SocketAddr>,
    /// Keyed by PHY payload
    pending: HashMap<Vec<u8>, PendingUplink>,
    in_flight: HashMap<u16, InFlight>,
    next_token: u16,
    dedup_delay: Duration,
    in_flight_timeout: Duration,
}

/// Run the Semtech UDP Packet Forwarder server
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(&config.udp.bind).await?;
    info!("UDP server listening on {}", config.udp.bind);

    let (tx, mut downlink_rx) = mpsc::unbounded_channel();
    let backend = Arc::new(DownlinkSender { tx });

    let store = MemoryStore::from_devices(&config.devices);
    info!("Loaded {} device session(s)", store.len());

    let mut handler = UplinkHandler::new(
        config.network_server.clone(),
        Arc::new(Eu868),
        backend,
        Box::new(store),
    );

    let dedup_delay = Duration::from_millis(config.network_server.deduplication_delay_ms);
    let mut server = Server::new(socket, dedup_delay);

    let mut flush = tokio::time::interval(Duration::from_millis(50));
    let mut buf = vec![0u8; 65535];

    loop {
        tokio::select! {
            recv = server.socket.recv_from(&mut buf) => {
                let (len, src) = recv?;
                debug!("Received {} bytes from {}", len, src);

                match GwmpPacket::parse(&buf[..len]) {
                    Ok(packet) => server.handle_packet(src, packet).await,
                    Err(e) => warn!("Failed to parse GWMP packet from {}: {}", src, e),
                }
            }
            Some(frame) = downlink_rx.recv() => {
                server.send_frame(frame, 0).await;
            }
            _ = flush.tick() => {
                server.expire_in_flight();
                for event in server.take_ready() {
                    match handler.handle(&event) {
                        Ok(outcome) => debug!(
                            "Uplink {} of {:08X} done (downlink: {})",
                            event.id, outcome.dev_addr, outcome.downlink_scheduled
                        ),
                        Err(e) => warn!("Uplink {} dropped: {:#}", event.id, e),
                    }
                }
            }
        }
    }
}

impl Server {
    fn new(socket: UdpSocket, dedup_delay: Duration) -> Self {
        Self {
            socket,
            gateways: HashMap::new(),
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            next_token: 0,
            dedup_delay,
            in_flight_timeout: IN_FLIGHT_TIMEOUT,
        }
    }

    async fn handle_packet(&mut self, src: SocketAddr, packet: GwmpPacket) {
        match packet {
            GwmpPacket::PushData {
                random_token,
                gateway_eui,
                json_payload,
            } => {
                debug!(
                    "PUSH_DATA from gateway {} (token: 0x{:04x})",
                    hex::encode(gateway_eui),
                    random_token
                );

                let ack = GwmpPacket::push_ack(random_token);
                if let Err(e) = self.socket.send_to(&ack, src).await {
                    error!("Failed to send PUSH_ACK to {}: {}", src, e);
                }

                match serde_json::from_str::<PushDataPayload>(&json_payload) {
                    Ok(payload) => {
                        for rxpk in payload.rxpk.unwrap_or_default() {
                            if let Err(e) = self.collect(gateway_eui, &rxpk) {
                                warn!("  Skipping rxpk from {}: {}", hex::encode(gateway_eui), e);
                            }
                        }
                        if let Some(stat) = payload.stat {
                            debug!("  Gateway status: {}", stat);
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse PUSH_DATA JSON: {}", e);
                        debug!("  Raw JSON: {}", json_payload);
                    }
                }
            }
            GwmpPacket::PullData {
                random_token,
                gateway_eui,
            } => {
                debug!(
                    "PULL_DATA from gateway {} (token: 0x{:04x})",
                    hex::encode(gateway_eui),
                    random_token
                );
                self.gateways.insert(gateway_eui, src);

                let ack = GwmpPacket::pull_ack(random_token);
                if let Err(e) = self.socket.send_to(&ack, src).await {
                    error!("Failed to send PULL_ACK to {}: {}", src, e);
                }
            }
            GwmpPacket::TxAck {
                random_token,
                gateway_eui,
                json_payload,
            } => {
                let Some(in_flight) = self.in_flight.remove(&random_token) else {
                    debug!("TX_ACK with unknown token 0x{:04x}", random_token);
                    return;
                };

                match protocol::tx_ack_error(json_payload.as_deref()) {
                    Ok(None) => debug!(
                        "Downlink {} accepted by {}",
                        in_flight.frame.downlink_id,
                        hex::encode(gateway_eui)
                    ),
                    Ok(Some(err)) => {
                        warn!(
                            "Downlink {} item {} rejected by {}: {}",
                            in_flight.frame.downlink_id,
                            in_flight.item,
                            hex::encode(gateway_eui),
                            err
                        );
                        self.send_frame(in_flight.frame, in_flight.item + 1).await;
                    }
                    Err(e) => warn!("Failed to parse TX_ACK: {}", e),
                }
            }
        }
    }

    /// Add one gateway's reception to the uplink it belongs to
    fn collect(&mut self, gateway_eui: GatewayId, rxpk: &protocol::Rxpk) -> anyhow::Result<()> {
        let phy_payload = base64::engine::general_purpose::STANDARD
            .decode(&rxpk.data)
            .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))?;
        let reception = rxpk.reception(gateway_eui)?;
        debug!("  rxpk: freq={} MHz, datr={:?}, {}", rxpk.freq, rxpk.datr, reception);

        match self.pending.get_mut(&phy_payload) {
            Some(pending) => pending.rx_info.push(reception),
            None => {
                let tx_info = rxpk.tx_info()?;
                self.pending.insert(
                    phy_payload,
                    PendingUplink {
                        first_seen: Instant::now(),
                        received_at: Utc::now(),
                        tx_info,
                        rx_info: vec![reception],
                    },
                );
            }
        }
        Ok(())
    }

    /// Uplinks whose deduplication window has closed
    fn take_ready(&mut self) -> Vec<UplinkEvent> {
        let dedup_delay = self.dedup_delay;
        let ready: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, p)| p.first_seen.elapsed() >= dedup_delay)
            .map(|(k, _)| k.clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|phy_payload| {
                let pending = self.pending.remove(&phy_payload)?;
                Some(UplinkEvent {
                    id: Uuid::new_v4(),
                    phy_payload,
                    tx_info: pending.tx_info,
                    rx_info: pending.rx_info,
                    received_at: pending.received_at,
                })
            })
            .collect()
    }

    /// Forget downlinks the gateway never acknowledged
    fn expire_in_flight(&mut self) {
        let timeout = self.in_flight_timeout;
        self.in_flight.retain(|token, in_flight| {
            let keep = in_flight.sent_at.elapsed() < timeout;
            if !keep {
                warn!(
                    "No TX_ACK for downlink {} (token: 0x{:04x})",
                    in_flight.frame.downlink_id, token
                );
            }
            keep
        });
    }

    /// Send item `item` of a downlink frame as PULL_RESP
    async fn send_frame(&mut self, frame: DownlinkFrame, item: usize) {
        let gw = hex::encode(frame.gateway_id);
        let Some(downlink) = frame.items.get(item) else {
            if item == 0 {
                warn!("Downlink {} for {} has no items", frame.downlink_id, gw);
            } else {
                warn!("Downlink {} for {} failed in every window", frame.downlink_id, gw);
            }
            return;
        };

        let Some(&addr) = self.gateways.get(&frame.gateway_id) else {
            error!("No PULL_DATA seen from gateway {}, downlink dropped", gw);
            return;
        };

        let packet = Txpk::try_from(downlink)
            .and_then(|txpk| GwmpPacket::pull_resp(self.next_token, &txpk));
        let packet = match packet {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to build PULL_RESP for {}: {}", frame.downlink_id, e);
                return;
            }
        };

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        match self.socket.send_to(&packet, addr).await {
            Ok(_) => {
                info!(
                    "PULL_RESP {} item {} to {} (token: 0x{:04x})",
                    frame.downlink_id, item, gw, token
                );
                self.in_flight.insert(
                    token,
                    InFlight {
                        frame,
                        item,
                        sent_at: Instant::now(),
                    },
                );
            }
            Err(e) => error!("Failed to send PULL_RESP to {}: {}", addr, e),
        }
    }
}
