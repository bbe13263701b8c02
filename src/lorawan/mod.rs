//! LoRaWAN PHY payload handling
//!
//! Only the MAC header fields the link-control flow needs are decoded:
//! DevAddr, FCtrl, FCnt and FOpts. FRMPayload and MIC stay opaque.

pub mod encoder;

use std::fmt;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

impl MType {
    /// MHDR byte for this message type, LoRaWAN R1
    pub fn mhdr(self) -> u8 {
        let bits = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }

    pub fn is_data_uplink(self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frame Control byte (FCtrl) of an uplink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub class_b: bool,
    pub f_opts_len: u8,
}

impl From<u8> for FCtrl {
    fn from(b: u8) -> Self {
        Self {
            adr: (b & 0x80) != 0,
            adr_ack_req: (b & 0x40) != 0,
            ack: (b & 0x20) != 0,
            class_b: (b & 0x10) != 0,
            f_opts_len: b & 0x0F,
        }
    }
}

/// Decoded data frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    /// Piggybacked MAC commands
    pub f_opts: Vec<u8>,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} DevAddr={:08X} FCnt={} FPort={} FOpts={} Payload={} bytes ADR={}",
            self.mtype,
            self.dev_addr,
            self.fcnt,
            self.f_port.map(|p| p.to_string()).unwrap_or("-".to_string()),
            hex::encode(&self.f_opts),
            self.frm_payload.len(),
            self.fctrl.adr,
        )
    }
}

/// Decode a data frame from a PHY payload.
///
/// Join, rejoin and proprietary messages are handled by other flows and
/// rejected here.
pub fn decode_data_frame(data: &[u8]) -> anyhow::Result<DataFrame> {
    let Some(&mhdr) = data.first() else {
        return Err(anyhow::anyhow!("Empty PHY payload"));
    };

    let mtype = MType::from(mhdr);
    if !matches!(
        mtype,
        MType::UnconfirmedDataUp
            | MType::UnconfirmedDataDown
            | MType::ConfirmedDataUp
            | MType::ConfirmedDataDown
    ) {
        return Err(anyhow::anyhow!("{} is not a data frame", mtype));
    }

    // Minimum: MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4) = 12 bytes
    if data.len() < 12 {
        return Err(anyhow::anyhow!(
            "Data frame too short: {} bytes (minimum 12)",
            data.len()
        ));
    }

    let dev_addr = u32::from_le_bytes(data[1..5].try_into()?);
    let fctrl = FCtrl::from(data[5]);
    let fcnt = u16::from_le_bytes(data[6..8].try_into()?);

    let mic_start = data.len() - 4;
    let f_opts_end = 8 + fctrl.f_opts_len as usize;
    if f_opts_end > mic_start {
        return Err(anyhow::anyhow!(
            "FOpts length {} exceeds available data",
            fctrl.f_opts_len
        ));
    }
    let f_opts = data[8..f_opts_end].to_vec();

    let (f_port, frm_payload) = if f_opts_end < mic_start {
        (Some(data[f_opts_end]), data[f_opts_end + 1..mic_start].to_vec())
    } else {
        (None, vec![])
    };

    Ok(DataFrame {
        mtype,
        dev_addr,
        fctrl,
        fcnt,
        f_opts,
        f_port,
        frm_payload,
    })
}
