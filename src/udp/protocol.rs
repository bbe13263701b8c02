//! Semtech UDP Packet Forwarder Protocol (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! The protocol uses a simple binary header followed by JSON payload.
//! All multi-byte integers are big-endian (network byte order).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::band::{DataRate, LoraModulationInfo, Modulation, UplinkTxInfo};
use crate::downlink::{DownlinkFrameItem, Timing};
use crate::gateway::{GatewayId, ReceptionRecord};

/// Protocol version (always 0x02)
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// GWMP packet sent by a gateway
#[derive(Debug)]
pub enum GwmpPacket {
    PushData {
        random_token: u16,
        gateway_eui: GatewayId,
        json_payload: String,
    },
    PullData {
        random_token: u16,
        gateway_eui: GatewayId,
    },
    TxAck {
        random_token: u16,
        gateway_eui: GatewayId,
        json_payload: Option<String>,
    },
}

/// LoRa datarate identifier ("SF7BW125") or FSK bitrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datr {
    Lora(String),
    Fsk(u32),
}

impl Datr {
    pub fn to_data_rate(&self) -> anyhow::Result<DataRate> {
        match self {
            Datr::Fsk(bitrate) => Ok(DataRate::Fsk { bitrate: *bitrate }),
            Datr::Lora(s) => {
                let (sf, bw) = s
                    .strip_prefix("SF")
                    .and_then(|rest| rest.split_once("BW"))
                    .ok_or_else(|| anyhow::anyhow!("Invalid LoRa datr: {}", s))?;
                Ok(DataRate::Lora {
                    spreading_factor: sf.parse()?,
                    bandwidth: bw.parse()?,
                })
            }
        }
    }
}

impl From<DataRate> for Datr {
    fn from(dr: DataRate) -> Self {
        match dr {
            DataRate::Lora { .. } => Datr::Lora(dr.to_string()),
            DataRate::Fsk { bitrate } => Datr::Fsk(bitrate),
        }
    }
}

/// Rxpk (received packet) from gateway JSON payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of packet reception
    pub time: Option<String>,
    /// Concentrator timestamp (microseconds, wraps around)
    pub tmst: Option<u32>,
    /// Concentrator IF channel
    pub chan: Option<u32>,
    /// RF chain the packet was received on
    pub rfch: Option<u32>,
    /// Frequency in MHz
    pub freq: f64,
    /// Modulation (LORA or FSK)
    pub modu: Option<String>,
    pub datr: Datr,
    /// LoRa coding rate (e.g., "4/5")
    pub codr: Option<String>,
    /// LoRa signal-to-noise ratio
    pub lsnr: Option<f32>,
    /// RSSI in dBm
    pub rssi: i32,
    /// RF packet payload size in bytes
    pub size: u16,
    /// Base64 encoded RF packet payload
    pub data: String,
}

impl Rxpk {
    /// Transmission parameters of the uplink
    pub fn tx_info(&self) -> anyhow::Result<UplinkTxInfo> {
        let frequency = (self.freq * 1_000_000.0).round() as u32;

        match self.datr.to_data_rate()? {
            DataRate::Lora {
                spreading_factor,
                bandwidth,
            } => Ok(UplinkTxInfo {
                frequency,
                modulation: Modulation::Lora,
                lora_modulation_info: Some(LoraModulationInfo {
                    bandwidth,
                    spreading_factor,
                    code_rate: self.codr.clone().unwrap_or_else(|| "4/5".to_string()),
                }),
            }),
            DataRate::Fsk { .. } => Ok(UplinkTxInfo {
                frequency,
                modulation: Modulation::Fsk,
                lora_modulation_info: None,
            }),
        }
    }

    /// This gateway's reception of the uplink. The concentrator timestamp
    /// becomes the radio context used to time the downlink.
    pub fn reception(&self, gateway_eui: GatewayId) -> anyhow::Result<ReceptionRecord> {
        let tmst = self
            .tmst
            .ok_or_else(|| anyhow::anyhow!("rxpk without tmst cannot be answered"))?;

        Ok(ReceptionRecord {
            gateway_id: gateway_eui,
            snr: self.lsnr.unwrap_or(0.0),
            rssi: self.rssi,
            antenna: self.rfch.unwrap_or(0),
            board: 0,
            context: tmst.to_be_bytes().to_vec(),
        })
    }
}

/// Push data JSON wrapper
#[derive(Debug, Deserialize)]
pub struct PushDataPayload {
    pub rxpk: Option<Vec<Rxpk>>,
    pub stat: Option<serde_json::Value>,
}

/// Txpk (packet to transmit) for a PULL_RESP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring tmst
    pub imme: bool,
    /// Concentrator timestamp to transmit at
    pub tmst: u32,
    /// Frequency in MHz
    pub freq: f64,
    pub rfch: u32,
    /// TX power in dBm
    pub powe: i32,
    pub modu: String,
    pub datr: Datr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// FSK frequency deviation (Hz)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fdev: Option<u32>,
    /// Polarity inversion, always set for LoRa downlinks to devices
    pub ipol: bool,
    pub size: u16,
    pub data: String,
}

impl TryFrom<&DownlinkFrameItem> for Txpk {
    type Error = anyhow::Error;

    fn try_from(item: &DownlinkFrameItem) -> Result<Self, Self::Error> {
        use base64::Engine;

        let tx = &item.tx_info;
        let context: [u8; 4] = tx.context.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("Invalid gateway context length: {} bytes", tx.context.len())
        })?;
        let Timing::Delay(delay) = tx.timing;
        let delay_us = u32::try_from(delay.as_micros())
            .map_err(|_| anyhow::anyhow!("Downlink delay {:?} out of range", delay))?;

        let (modu, codr, fdev, ipol) = match tx.data_rate {
            DataRate::Lora { .. } => ("LORA", Some("4/5".to_string()), None, true),
            DataRate::Fsk { bitrate } => ("FSK", None, Some(bitrate / 2), false),
        };

        Ok(Txpk {
            imme: false,
            tmst: u32::from_be_bytes(context).wrapping_add(delay_us),
            freq: f64::from(tx.frequency) / 1_000_000.0,
            rfch: tx.antenna,
            powe: tx.power,
            modu: modu.to_string(),
            datr: Datr::from(tx.data_rate),
            codr,
            fdev,
            ipol,
            size: item.phy_payload.len() as u16,
            data: base64::engine::general_purpose::STANDARD.encode(&item.phy_payload),
        })
    }
}

#[derive(Debug, Serialize)]
struct PullRespPayload<'a> {
    txpk: &'a Txpk,
}

#[derive(Debug, Deserialize)]
struct TxAckPayload {
    txpk_ack: Option<TxAckResult>,
}

#[derive(Debug, Deserialize)]
struct TxAckResult {
    error: Option<String>,
}

/// Error reported in a TX_ACK, `None` if the gateway accepted the packet
pub fn tx_ack_error(json_payload: Option<&str>) -> anyhow::Result<Option<String>> {
    let Some(json) = json_payload.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    let payload: TxAckPayload = serde_json::from_str(json.trim_end_matches('\0'))?;
    Ok(payload
        .txpk_ack
        .and_then(|ack| ack.error)
        .filter(|e| e != "NONE"))
}

impl GwmpPacket {
    /// Parse a raw UDP datagram into a GWMP packet
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("Packet too short: {} bytes", data.len()));
        }

        let mut buf = data;

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported protocol version: 0x{:02x}",
                version
            ));
        }

        let random_token = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;

        if !matches!(
            packet_type,
            PacketType::PushData | PacketType::PullData | PacketType::TxAck
        ) {
            return Err(anyhow::anyhow!(
                "Unexpected packet type for parsing: {:?}",
                packet_type
            ));
        }

        if buf.remaining() < 8 {
            return Err(anyhow::anyhow!(
                "{:?} too short for gateway EUI",
                packet_type
            ));
        }
        let mut gateway_eui = [0u8; 8];
        buf.copy_to_slice(&mut gateway_eui);

        let json_payload = if buf.has_remaining() {
            Some(
                String::from_utf8(buf.to_vec())
                    .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in JSON payload: {}", e))?,
            )
        } else {
            None
        };

        match packet_type {
            PacketType::PushData => Ok(GwmpPacket::PushData {
                random_token,
                gateway_eui,
                json_payload: json_payload.unwrap_or_default(),
            }),
            PacketType::PullData => Ok(GwmpPacket::PullData {
                random_token,
                gateway_eui,
            }),
            _ => Ok(GwmpPacket::TxAck {
                random_token,
                gateway_eui,
                json_payload,
            }),
        }
    }

    /// Build a PUSH_ACK response
    pub fn push_ack(random_token: u16) -> Vec<u8> {
        header(random_token, PacketType::PushAck).to_vec()
    }

    /// Build a PULL_ACK response
    pub fn pull_ack(random_token: u16) -> Vec<u8> {
        header(random_token, PacketType::PullAck).to_vec()
    }

    /// Build a PULL_RESP carrying one txpk
    pub fn pull_resp(random_token: u16, txpk: &Txpk) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(&PullRespPayload { txpk })?;
        let mut buf = header(random_token, PacketType::PullResp);
        buf.put_slice(&json);
        Ok(buf.to_vec())
    }
}

fn header(random_token: u16, packet_type: PacketType) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(random_token);
    buf.put_u8(packet_type as u8);
    buf
}
