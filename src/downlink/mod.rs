//! Downlink frame construction for the RX1 / RX2 receive windows
//!
//! A class-A device opens two receive windows after each uplink. The frame
//! handed to the gateway backend carries one item per window whose timing
//! metadata is complete; the gateway tries them in order.
//!
//! Two entry points share the window construction:
//! - [`DownlinkBuilder::handle_data_downlink`] for downlinks originated here
//! - [`DownlinkBuilder::emit_roaming_downlink`] for downlinks forwarded on
//!   behalf of a roaming partner

pub mod data;
pub mod roaming;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::band::{Band, DataRate};
use crate::error::LinkError;
use crate::gateway::{GatewayId, ReceptionRecord};

pub use roaming::{ClassMode, RoamingDownlinkRequest};

/// RX2 opens one second after RX1
const RX2_DELAY_OFFSET: Duration = Duration::from_secs(1);

/// Receive-window timing and radio parameters for one downlink.
///
/// A window is only scheduled if its frequency, its data rate and the RX1
/// delay are all present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WindowMetadata {
    /// RX1 frequency in MHz
    #[serde(rename = "DLFreq1")]
    pub dl_freq1: Option<f64>,
    pub data_rate1: Option<u8>,
    /// RX1 delay in seconds
    #[serde(rename = "RXDelay1")]
    pub rx_delay1: Option<u32>,
    /// RX2 frequency in MHz
    #[serde(rename = "DLFreq2")]
    pub dl_freq2: Option<f64>,
    pub data_rate2: Option<u8>,
}

/// When the gateway transmits an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// Fixed delay relative to the end of the uplink
    Delay(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkTxInfo {
    /// Frequency in Hz
    pub frequency: u32,
    /// TX power in dBm
    pub power: i32,
    pub data_rate: DataRate,
    pub antenna: u32,
    pub board: u32,
    /// Radio context of the gateway that received the uplink
    pub context: Vec<u8>,
    pub timing: Timing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrameItem {
    pub phy_payload: Vec<u8>,
    pub tx_info: DownlinkTxInfo,
}

/// A downlink for a single gateway, one item per receive window
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrame {
    pub downlink_id: Uuid,
    pub gateway_id: GatewayId,
    pub items: Vec<DownlinkFrameItem>,
}

/// Transmits downlink frames over the gateway network.
///
/// Delivery and retries belong to the implementation.
pub trait GatewayBackend: Send + Sync {
    fn send_tx_packet(&self, frame: DownlinkFrame) -> anyhow::Result<()>;
}

/// Builds RX1/RX2 downlink frames and hands them to the gateway backend.
pub struct DownlinkBuilder<'a> {
    band: &'a dyn Band,
    backend: &'a dyn GatewayBackend,
}

impl<'a> DownlinkBuilder<'a> {
    pub fn new(band: &'a dyn Band, backend: &'a dyn GatewayBackend) -> Self {
        Self { band, backend }
    }

    /// Build the items for every window with complete metadata, in RX1, RX2
    /// order.
    fn build_items(
        &self,
        gateway: &ReceptionRecord,
        phy_payload: &[u8],
        meta: &WindowMetadata,
    ) -> Result<Vec<DownlinkFrameItem>, LinkError> {
        let mut items = Vec::with_capacity(2);

        if let (Some(freq), Some(dr), Some(delay)) =
            (meta.dl_freq1, meta.data_rate1, meta.rx_delay1)
        {
            let delay = Duration::from_secs(u64::from(delay));
            items.push(self.build_item(gateway, phy_payload, freq, dr, delay)?);
        }

        // RX2 has no delay of its own
        if let (Some(freq), Some(dr), Some(delay)) =
            (meta.dl_freq2, meta.data_rate2, meta.rx_delay1)
        {
            let delay = Duration::from_secs(u64::from(delay)) + RX2_DELAY_OFFSET;
            items.push(self.build_item(gateway, phy_payload, freq, dr, delay)?);
        }

        Ok(items)
    }

    fn build_item(
        &self,
        gateway: &ReceptionRecord,
        phy_payload: &[u8],
        freq_mhz: f64,
        dr: u8,
        delay: Duration,
    ) -> Result<DownlinkFrameItem, LinkError> {
        let frequency = mhz_to_hz(freq_mhz);
        let power = self.band.downlink_tx_power(frequency)?;
        let data_rate = self.band.data_rate(dr)?;

        debug!(
            "Downlink item: freq={} Hz, dr={} ({}), power={} dBm, delay={:?}",
            frequency, dr, data_rate, power, delay
        );

        Ok(DownlinkFrameItem {
            phy_payload: phy_payload.to_vec(),
            tx_info: DownlinkTxInfo {
                frequency,
                power,
                data_rate,
                antenna: gateway.antenna,
                board: gateway.board,
                context: gateway.context.clone(),
                timing: Timing::Delay(delay),
            },
        })
    }

    fn send_downlink_frame(&self, frame: DownlinkFrame) -> Result<(), LinkError> {
        self.backend
            .send_tx_packet(frame)
            .map_err(LinkError::TransportSendFailed)
    }
}

fn mhz_to_hz(freq_mhz: f64) -> u32 {
    (freq_mhz * 1_000_000.0).round() as u32
}

/// Gateway backend that keeps every frame it is given
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingBackend {
    pub frames: std::sync::Mutex<Vec<DownlinkFrame>>,
    pub fail: bool,
}

#[cfg(test)]
impl GatewayBackend for RecordingBackend {
    fn send_tx_packet(&self, frame: DownlinkFrame) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("gateway offline");
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

#[cfg(test)]
impl RecordingBackend {
    pub fn sent(&self) -> Vec<DownlinkFrame> {
        self.frames.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::band::Eu868;
    use crate::gateway::record;

    fn full_meta() -> WindowMetadata {
        WindowMetadata {
            dl_freq1: Some(868.1),
            data_rate1: Some(5),
            rx_delay1: Some(1),
            dl_freq2: Some(869.525),
            data_rate2: Some(0),
        }
    }

    #[test]
    fn test_mhz_to_hz() {
        assert_eq!(mhz_to_hz(868.1), 868_100_000);
        assert_eq!(mhz_to_hz(869.525), 869_525_000);
        assert_eq!(mhz_to_hz(868.3), 868_300_000);
    }

    #[test]
    fn test_both_windows() {
        let backend = RecordingBackend::default();
        let builder = DownlinkBuilder::new(&Eu868, &backend);
        let gw = ReceptionRecord {
            antenna: 1,
            board: 2,
            ..record(9, 3.0, -70)
        };

        let items = builder.build_items(&gw, &[0x60, 0x01], &full_meta()).unwrap();
        assert_eq!(items.len(), 2);

        let rx1 = &items[0].tx_info;
        assert_eq!(rx1.frequency, 868_100_000);
        assert_eq!(rx1.power, 14);
        assert_eq!(
            rx1.data_rate,
            DataRate::Lora {
                spreading_factor: 7,
                bandwidth: 125
            }
        );
        assert_eq!(rx1.timing, Timing::Delay(Duration::from_secs(1)));
        assert_eq!(rx1.antenna, 1);
        assert_eq!(rx1.board, 2);
        assert_eq!(rx1.context, gw.context);

        let rx2 = &items[1].tx_info;
        assert_eq!(rx2.frequency, 869_525_000);
        assert_eq!(rx2.power, 27);
        assert_eq!(
            rx2.data_rate,
            DataRate::Lora {
                spreading_factor: 12,
                bandwidth: 125
            }
        );
        assert_eq!(rx2.timing, Timing::Delay(Duration::from_secs(2)));
        assert_eq!(items[1].phy_payload, vec![0x60, 0x01]);
    }

    #[test]
    fn test_partial_metadata_suppresses_window() {
        let backend = RecordingBackend::default();
        let builder = DownlinkBuilder::new(&Eu868, &backend);
        let gw = record(1, 0.0, -90);

        let no_freq1 = WindowMetadata {
            dl_freq1: None,
            ..full_meta()
        };
        let items = builder.build_items(&gw, &[], &no_freq1).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tx_info.frequency, 869_525_000);

        let no_dr2 = WindowMetadata {
            data_rate2: None,
            ..full_meta()
        };
        let items = builder.build_items(&gw, &[], &no_dr2).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tx_info.frequency, 868_100_000);

        // Without the RX1 delay neither window can be timed
        let no_delay = WindowMetadata {
            rx_delay1: None,
            ..full_meta()
        };
        assert!(builder.build_items(&gw, &[], &no_delay).unwrap().is_empty());
    }

    #[test]
    fn test_band_errors_propagate() {
        let backend = RecordingBackend::default();
        let builder = DownlinkBuilder::new(&Eu868, &backend);
        let gw = record(1, 0.0, -90);

        let bad_dr = WindowMetadata {
            data_rate1: Some(15),
            ..full_meta()
        };
        assert!(matches!(
            builder.build_items(&gw, &[], &bad_dr),
            Err(LinkError::Band(crate::error::BandError::UnknownDataRate(15)))
        ));

        let bad_freq = WindowMetadata {
            dl_freq2: Some(923.3),
            ..full_meta()
        };
        assert!(matches!(
            builder.build_items(&gw, &[], &bad_freq),
            Err(LinkError::Band(crate::error::BandError::UnsupportedFrequency(923_300_000)))
        ));
    }

    #[test]
    fn test_window_metadata_json() {
        let meta: WindowMetadata = serde_json::from_str(
            r#"{"DLFreq1":868.1,"DataRate1":5,"RXDelay1":1,"DLFreq2":869.525,"DataRate2":0}"#,
        )
        .unwrap();
        assert_eq!(meta, full_meta());

        let partial: WindowMetadata = serde_json::from_str(r#"{"DLFreq1":868.1}"#).unwrap();
        assert_eq!(partial.data_rate1, None);
    }
}
