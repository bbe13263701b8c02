//! LoRaWAN MAC commands
//!
//! Only the commands the network server answers are modelled; other uplink
//! commands are skipped over using their fixed payload sizes.
//!
//! FOpts layout: CID(1) | payload(N) | CID(1) | payload(N) ...

pub mod link_check;

pub use link_check::handle_link_check_req;

/// MAC command identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cid {
    LinkCheck = 0x02,
    LinkAdr = 0x03,
    DutyCycle = 0x04,
    RxParamSetup = 0x05,
    DevStatus = 0x06,
    NewChannel = 0x07,
    RxTimingSetup = 0x08,
    TxParamSetup = 0x09,
    DlChannel = 0x0A,
    DeviceTime = 0x0D,
}

impl TryFrom<u8> for Cid {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(Cid::LinkCheck),
            0x03 => Ok(Cid::LinkAdr),
            0x04 => Ok(Cid::DutyCycle),
            0x05 => Ok(Cid::RxParamSetup),
            0x06 => Ok(Cid::DevStatus),
            0x07 => Ok(Cid::NewChannel),
            0x08 => Ok(Cid::RxTimingSetup),
            0x09 => Ok(Cid::TxParamSetup),
            0x0A => Ok(Cid::DlChannel),
            0x0D => Ok(Cid::DeviceTime),
            _ => Err(anyhow::anyhow!("Unknown MAC command CID: 0x{:02x}", value)),
        }
    }
}

impl Cid {
    /// Payload size of the uplink (end-device to network) variant
    fn uplink_payload_len(self) -> usize {
        match self {
            Cid::LinkCheck => 0,
            Cid::LinkAdr => 1,
            Cid::DutyCycle => 0,
            Cid::RxParamSetup => 1,
            Cid::DevStatus => 2,
            Cid::NewChannel => 1,
            Cid::RxTimingSetup => 0,
            Cid::TxParamSetup => 0,
            Cid::DlChannel => 1,
            Cid::DeviceTime => 0,
        }
    }
}

/// LinkCheckAns payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCheckAnsPayload {
    /// Link margin (dB) above the demodulation floor
    pub margin: u8,
    /// Number of gateways that received the LinkCheckReq
    pub gw_cnt: u8,
}

/// A decoded MAC command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacCommand {
    LinkCheckReq,
    LinkCheckAns(LinkCheckAnsPayload),
    /// Uplink command this server does not act on
    Other { cid: Cid, payload: Vec<u8> },
}

impl MacCommand {
    pub fn cid(&self) -> Cid {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns(_) => Cid::LinkCheck,
            MacCommand::Other { cid, .. } => *cid,
        }
    }
}

/// A group of MAC commands sharing one CID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacCommandBlock {
    pub cid: Cid,
    pub mac_commands: Vec<MacCommand>,
}

/// Parse the MAC commands carried in an uplink's FOpts
pub fn parse_uplink_fopts(data: &[u8]) -> anyhow::Result<Vec<MacCommand>> {
    let mut commands = Vec::new();
    let mut rest = data;

    while let Some((&cid_byte, tail)) = rest.split_first() {
        let cid = Cid::try_from(cid_byte)?;
        let len = cid.uplink_payload_len();
        if tail.len() < len {
            return Err(anyhow::anyhow!(
                "MAC command {:?} needs {} payload bytes, {} left",
                cid,
                len,
                tail.len()
            ));
        }

        let (payload, tail) = tail.split_at(len);
        commands.push(match cid {
            Cid::LinkCheck => MacCommand::LinkCheckReq,
            _ => MacCommand::Other {
                cid,
                payload: payload.to_vec(),
            },
        });
        rest = tail;
    }

    Ok(commands)
}

/// Encode downlink MAC command blocks into FOpts bytes.
///
/// Only answers originated by this server are encoded; anything else is
/// skipped.
pub fn encode_downlink_fopts(blocks: &[MacCommandBlock]) -> Vec<u8> {
    let mut out = Vec::new();

    for command in blocks.iter().flat_map(|b| b.mac_commands.iter()) {
        if let MacCommand::LinkCheckAns(pl) = command {
            out.push(Cid::LinkCheck as u8);
            out.push(pl.margin);
            out.push(pl.gw_cnt);
        }
    }

    out
}
