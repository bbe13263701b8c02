//! Regional band plan
//!
//! Pure lookups: downlink TX power per frequency, data-rate index to
//! modulation parameters and back, and the required SNR per spreading factor.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BandError;

/// Minimum demodulation SNR (dB) per LoRa spreading factor
const REQUIRED_SNR_TABLE: [(u8, f32); 7] = [
    (6, -5.0),
    (7, -7.5),
    (8, -10.0),
    (9, -12.5),
    (10, -15.0),
    (11, -17.5),
    (12, -20.0),
];

/// Required SNR (dB) for a spreading factor, `None` if unknown.
pub fn required_snr(spreading_factor: u8) -> Option<f32> {
    REQUIRED_SNR_TABLE
        .iter()
        .find(|(sf, _)| *sf == spreading_factor)
        .map(|(_, snr)| *snr)
}

/// Modulation kind of a transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modulation {
    Lora,
    Fsk,
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modulation::Lora => write!(f, "LORA"),
            Modulation::Fsk => write!(f, "FSK"),
        }
    }
}

/// LoRa-specific modulation parameters of an uplink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraModulationInfo {
    /// Bandwidth in kHz
    pub bandwidth: u32,
    pub spreading_factor: u8,
    /// Coding rate (e.g., "4/5")
    pub code_rate: String,
}

/// Transmission parameters of a received uplink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkTxInfo {
    /// Frequency in Hz
    pub frequency: u32,
    pub modulation: Modulation,
    pub lora_modulation_info: Option<LoraModulationInfo>,
}

impl UplinkTxInfo {
    /// Modulation parameters as a data rate, if they are complete.
    pub fn data_rate(&self) -> Option<DataRate> {
        match self.modulation {
            Modulation::Lora => self.lora_modulation_info.as_ref().map(|m| DataRate::Lora {
                spreading_factor: m.spreading_factor,
                bandwidth: m.bandwidth,
            }),
            Modulation::Fsk => None,
        }
    }
}

/// Modulation parameters of a data-rate index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRate {
    Lora { spreading_factor: u8, bandwidth: u32 },
    Fsk { bitrate: u32 },
}

impl DataRate {
    pub fn modulation(&self) -> Modulation {
        match self {
            DataRate::Lora { .. } => Modulation::Lora,
            DataRate::Fsk { .. } => Modulation::Fsk,
        }
    }
}

/// Packet-forwarder `datr` notation ("SF7BW125" or the FSK bitrate)
impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataRate::Lora {
                spreading_factor,
                bandwidth,
            } => write!(f, "SF{}BW{}", spreading_factor, bandwidth),
            DataRate::Fsk { bitrate } => write!(f, "{}", bitrate),
        }
    }
}

/// A regional band plan.
pub trait Band: Send + Sync {
    /// Downlink TX power (dBm) for a frequency in Hz
    fn downlink_tx_power(&self, frequency: u32) -> Result<i32, BandError>;

    /// Modulation parameters for a data-rate index
    fn data_rate(&self, dr: u8) -> Result<DataRate, BandError>;

    /// Data-rate index for modulation parameters
    fn data_rate_index(&self, data_rate: &DataRate) -> Result<u8, BandError>;
}

/// EU 863-870 MHz band plan
#[derive(Debug, Default, Clone, Copy)]
pub struct Eu868;

impl Eu868 {
    const DATA_RATES: [DataRate; 8] = [
        DataRate::Lora { spreading_factor: 12, bandwidth: 125 },
        DataRate::Lora { spreading_factor: 11, bandwidth: 125 },
        DataRate::Lora { spreading_factor: 10, bandwidth: 125 },
        DataRate::Lora { spreading_factor: 9, bandwidth: 125 },
        DataRate::Lora { spreading_factor: 8, bandwidth: 125 },
        DataRate::Lora { spreading_factor: 7, bandwidth: 125 },
        DataRate::Lora { spreading_factor: 7, bandwidth: 250 },
        DataRate::Fsk { bitrate: 50_000 },
    ];

    const MIN_FREQUENCY: u32 = 863_000_000;
    const MAX_FREQUENCY: u32 = 870_000_000;
}

impl Band for Eu868 {
    fn downlink_tx_power(&self, frequency: u32) -> Result<i32, BandError> {
        if !(Self::MIN_FREQUENCY..=Self::MAX_FREQUENCY).contains(&frequency) {
            return Err(BandError::UnsupportedFrequency(frequency));
        }

        // g3 sub-band (869.4 - 869.65 MHz) allows 500 mW ERP
        if (869_400_000..=869_650_000).contains(&frequency) {
            Ok(27)
        } else {
            Ok(14)
        }
    }

    fn data_rate(&self, dr: u8) -> Result<DataRate, BandError> {
        Self::DATA_RATES
            .get(usize::from(dr))
            .copied()
            .ok_or(BandError::UnknownDataRate(dr))
    }

    fn data_rate_index(&self, data_rate: &DataRate) -> Result<u8, BandError> {
        Self::DATA_RATES
            .iter()
            .position(|d| d == data_rate)
            .map(|i| i as u8)
            .ok_or_else(|| BandError::UnknownModulation(data_rate.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_snr_table() {
        assert_eq!(required_snr(7), Some(-7.5));
        assert_eq!(required_snr(12), Some(-20.0));
        assert_eq!(required_snr(6), Some(-5.0));
        assert_eq!(required_snr(5), None);
        assert_eq!(required_snr(13), None);
    }

    #[test]
    fn test_eu868_downlink_power() {
        assert_eq!(Eu868.downlink_tx_power(868_100_000), Ok(14));
        assert_eq!(Eu868.downlink_tx_power(869_525_000), Ok(27));
        assert_eq!(
            Eu868.downlink_tx_power(902_300_000),
            Err(BandError::UnsupportedFrequency(902_300_000))
        );
    }

    #[test]
    fn test_eu868_data_rates() {
        assert_eq!(
            Eu868.data_rate(0),
            Ok(DataRate::Lora {
                spreading_factor: 12,
                bandwidth: 125
            })
        );
        assert_eq!(Eu868.data_rate(7), Ok(DataRate::Fsk { bitrate: 50_000 }));
        assert_eq!(Eu868.data_rate(8), Err(BandError::UnknownDataRate(8)));

        let sf7 = DataRate::Lora {
            spreading_factor: 7,
            bandwidth: 125,
        };
        assert_eq!(Eu868.data_rate_index(&sf7), Ok(5));
        assert_eq!(sf7.to_string(), "SF7BW125");

        let sf7_500 = DataRate::Lora {
            spreading_factor: 7,
            bandwidth: 500,
        };
        assert!(Eu868.data_rate_index(&sf7_500).is_err());
    }

    #[test]
    fn test_uplink_tx_info_data_rate() {
        let tx_info = UplinkTxInfo {
            frequency: 868_300_000,
            modulation: Modulation::Lora,
            lora_modulation_info: Some(LoraModulationInfo {
                bandwidth: 125,
                spreading_factor: 9,
                code_rate: "4/5".to_string(),
            }),
        };
        assert_eq!(Eu868.data_rate_index(&tx_info.data_rate().unwrap()), Ok(3));

        let fsk = UplinkTxInfo {
            modulation: Modulation::Fsk,
            lora_modulation_info: None,
            ..tx_info
        };
        assert_eq!(fsk.data_rate(), None);
    }
}
