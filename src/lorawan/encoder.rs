//! LoRaWAN data-downlink encoder
//!
//! Frame structure:
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | FOpts(0..15) | [FPort(1) | FRMPayload(N)] | MIC(4,LE)
//!
//! Session keys are not handled by this server, so the MIC is left zeroed
//! for the gateway-side stack to fill in.

use super::MType;

/// FOpts can carry at most 15 bytes of MAC commands
pub const MAX_FOPTS_LEN: usize = 15;

/// Parameters for building a LoRaWAN data downlink
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    pub mtype: MType,
    pub dev_addr: u32,
    /// Downlink frame counter (lower 16 bits are transmitted)
    pub fcnt: u32,
    pub adr: bool,
    /// Acknowledges a confirmed uplink
    pub ack: bool,
    /// MAC commands piggybacked in FOpts
    pub f_opts: Vec<u8>,
    pub f_port: u8,
    pub payload: Vec<u8>,
}

impl FrameBuilder {
    /// Unconfirmed downlink without application payload
    pub fn new_downlink(dev_addr: u32, fcnt: u32) -> Self {
        Self {
            mtype: MType::UnconfirmedDataDown,
            dev_addr,
            fcnt,
            adr: false,
            ack: false,
            f_opts: Vec::new(),
            f_port: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_f_opts(mut self, f_opts: Vec<u8>) -> Self {
        self.f_opts = f_opts;
        self
    }

    pub fn with_adr(mut self, adr: bool) -> Self {
        self.adr = adr;
        self
    }

    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    /// Build the raw PHY payload bytes
    pub fn build(&self) -> anyhow::Result<Vec<u8>> {
        if self.f_opts.len() > MAX_FOPTS_LEN {
            anyhow::bail!(
                "FOpts too long: {} bytes (maximum {})",
                self.f_opts.len(),
                MAX_FOPTS_LEN
            );
        }

        let mut frame = Vec::with_capacity(12 + self.f_opts.len() + 1 + self.payload.len());
        frame.push(self.mtype.mhdr());
        frame.extend_from_slice(&self.dev_addr.to_le_bytes());

        // FCtrl: ADR | RFU | ACK | FPending | FOptsLen
        let mut fctrl = self.f_opts.len() as u8;
        if self.adr {
            fctrl |= 0x80;
        }
        if self.ack {
            fctrl |= 0x20;
        }
        frame.push(fctrl);

        frame.extend_from_slice(&(self.fcnt as u16).to_le_bytes());
        frame.extend_from_slice(&self.f_opts);

        if !self.payload.is_empty() {
            frame.push(self.f_port);
            frame.extend_from_slice(&self.payload);
        }

        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::decode_data_frame;

    #[test]
    fn test_build_mac_only_downlink() {
        let frame = FrameBuilder::new_downlink(0x260B1234, 0x1_0005)
            .with_adr(true)
            .with_f_opts(vec![0x02, 20, 3])
            .build()
            .unwrap();

        // MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + FOpts(3) + MIC(4) = 15
        assert_eq!(frame.len(), 15);
        assert_eq!(frame[0], 0x60);
        assert_eq!(&frame[1..5], &0x260B1234u32.to_le_bytes());
        assert_eq!(frame[5], 0x83);
        assert_eq!(&frame[6..8], &5u16.to_le_bytes());
        assert_eq!(&frame[8..11], &[0x02, 20, 3]);
    }

    #[test]
    fn test_build_with_payload_decodes() {
        let mut builder = FrameBuilder::new_downlink(0xDEADBEEF, 100).with_ack(true);
        builder.mtype = MType::ConfirmedDataDown;
        builder.f_port = 42;
        builder.payload = vec![0x01, 0x02, 0x03];

        let decoded = decode_data_frame(&builder.build().unwrap()).unwrap();
        assert_eq!(decoded.mtype, MType::ConfirmedDataDown);
        assert_eq!(decoded.dev_addr, 0xDEADBEEF);
        assert!(decoded.fctrl.ack);
        assert_eq!(decoded.f_port, Some(42));
        assert_eq!(decoded.frm_payload, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_fopts_too_long() {
        let result = FrameBuilder::new_downlink(1, 0)
            .with_f_opts(vec![0x02; 16])
            .build();
        assert!(result.is_err());
    }
}
