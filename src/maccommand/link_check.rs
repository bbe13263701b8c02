//! LinkCheckReq handling
//!
//! Answers with the margin of the best reception above the demodulation
//! floor of the uplink's spreading factor, and the number of gateways that
//! heard it.

use tracing::debug;

use super::{Cid, LinkCheckAnsPayload, MacCommand, MacCommandBlock};
use crate::band::{self, Modulation, UplinkTxInfo};
use crate::error::LinkError;
use crate::gateway::{RankedReceptions, ReceptionRecord};

/// Build the LinkCheckAns for an uplink carrying a LinkCheckReq.
pub fn handle_link_check_req(
    rx_info: &[ReceptionRecord],
    tx_info: &UplinkTxInfo,
) -> Result<MacCommandBlock, LinkError> {
    if rx_info.is_empty() {
        return Err(LinkError::EmptyReceptionSet);
    }

    if tx_info.modulation != Modulation::Lora {
        return Err(LinkError::UnsupportedModulation(tx_info.modulation));
    }

    let mod_info = tx_info
        .lora_modulation_info
        .as_ref()
        .ok_or(LinkError::MissingModulationInfo)?;

    let required_snr = band::required_snr(mod_info.spreading_factor)
        .ok_or(LinkError::UnknownSpreadingFactor(mod_info.spreading_factor))?;

    let ranked = RankedReceptions::rank(rx_info.to_vec())?;
    let margin = (ranked.best().snr - required_snr).clamp(0.0, f32::from(u8::MAX));
    let gw_cnt = u8::try_from(ranked.len()).unwrap_or(u8::MAX);

    let payload = LinkCheckAnsPayload {
        margin: margin as u8,
        gw_cnt,
    };
    debug!(
        "LinkCheckAns: margin={} gw_cnt={} (best {})",
        payload.margin,
        payload.gw_cnt,
        ranked.best()
    );

    Ok(MacCommandBlock {
        cid: Cid::LinkCheck,
        mac_commands: vec![MacCommand::LinkCheckAns(payload)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band::LoraModulationInfo;
    use crate::gateway::record;

    fn lora(sf: u8) -> UplinkTxInfo {
        UplinkTxInfo {
            frequency: 868_100_000,
            modulation: Modulation::Lora,
            lora_modulation_info: Some(LoraModulationInfo {
                bandwidth: 125,
                spreading_factor: sf,
                code_rate: "4/5".to_string(),
            }),
        }
    }

    fn answer(block: &MacCommandBlock) -> LinkCheckAnsPayload {
        assert_eq!(block.cid, Cid::LinkCheck);
        assert_eq!(block.mac_commands.len(), 1);
        match block.mac_commands[0] {
            MacCommand::LinkCheckAns(pl) => pl,
            ref other => panic!("Expected LinkCheckAns, got {:?}", other),
        }
    }

    #[test]
    fn test_link_check_answer() {
        // best SNR 5.0 at SF10 (-15 dB floor)
        let rx = vec![record(1, -2.0, -100), record(2, 5.0, -90)];
        let block = handle_link_check_req(&rx, &lora(10)).unwrap();

        let pl = answer(&block);
        assert_eq!(pl.margin, 20);
        assert_eq!(pl.gw_cnt, 2);
    }

    #[test]
    fn test_negative_margin_is_zero() {
        let rx = vec![record(1, -12.0, -120)];
        let pl = answer(&handle_link_check_req(&rx, &lora(7)).unwrap());
        assert_eq!(pl.margin, 0);
        assert_eq!(pl.gw_cnt, 1);
    }

    #[test]
    fn test_margin_saturates() {
        let rx = vec![record(1, 400.0, -20)];
        let pl = answer(&handle_link_check_req(&rx, &lora(12)).unwrap());
        assert_eq!(pl.margin, 255);
    }

    #[test]
    fn test_gateway_count_saturates() {
        let rx: Vec<_> = (0..300).map(|i| record((i % 256) as u8, 1.0, -90)).collect();
        let pl = answer(&handle_link_check_req(&rx, &lora(7)).unwrap());
        assert_eq!(pl.gw_cnt, 255);
    }

    #[test]
    fn test_empty_reception_set_fails() {
        let result = handle_link_check_req(&[], &lora(7));
        assert!(matches!(result, Err(LinkError::EmptyReceptionSet)));
    }

    #[test]
    fn test_fsk_not_supported() {
        let tx_info = UplinkTxInfo {
            modulation: Modulation::Fsk,
            lora_modulation_info: None,
            ..lora(7)
        };
        let result = handle_link_check_req(&[record(1, 1.0, -90)], &tx_info);
        assert!(matches!(
            result,
            Err(LinkError::UnsupportedModulation(Modulation::Fsk))
        ));
    }

    #[test]
    fn test_missing_modulation_info() {
        let tx_info = UplinkTxInfo {
            lora_modulation_info: None,
            ..lora(7)
        };
        let result = handle_link_check_req(&[record(1, 1.0, -90)], &tx_info);
        assert!(matches!(result, Err(LinkError::MissingModulationInfo)));
    }

    #[test]
    fn test_unknown_spreading_factor() {
        let result = handle_link_check_req(&[record(1, 1.0, -90)], &lora(5));
        assert!(matches!(result, Err(LinkError::UnknownSpreadingFactor(5))));
    }
}
