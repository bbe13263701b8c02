//! Gateway diversity selection
//!
//! An uplink is usually heard by more than one gateway. Every component that
//! needs a single reference gateway (radio context, antenna, board) takes the
//! first entry of the reception set after it has been ranked here.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::LinkError;

/// Gateway identifier (EUI-64, 8 bytes)
pub type GatewayId = [u8; 8];

/// One gateway's reception of an uplink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceptionRecord {
    pub gateway_id: GatewayId,
    /// LoRa signal-to-noise ratio (dB)
    pub snr: f32,
    /// RSSI in dBm
    pub rssi: i32,
    pub antenna: u32,
    pub board: u32,
    /// Gateway-specific timing token, passed back verbatim on downlink
    pub context: Vec<u8>,
}

impl fmt::Display for ReceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gw={} snr={:.1} rssi={}",
            hex::encode(self.gateway_id),
            self.snr,
            self.rssi
        )
    }
}

/// Ordering used for diversity selection: SNR descending, ties broken by
/// RSSI descending.
pub fn by_signal(a: &ReceptionRecord, b: &ReceptionRecord) -> Ordering {
    snr_key(b.snr)
        .total_cmp(&snr_key(a.snr))
        .then_with(|| b.rssi.cmp(&a.rssi))
}

/// -0.0 and 0.0 are the same SNR
fn snr_key(snr: f32) -> f32 {
    if snr == 0.0 {
        0.0
    } else {
        snr
    }
}

/// A non-empty reception set, ranked best-first.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedReceptions {
    records: Vec<ReceptionRecord>,
}

impl RankedReceptions {
    /// Rank a reception set. Fails with [`LinkError::EmptyReceptionSet`] if
    /// no gateway heard the uplink.
    pub fn rank(mut records: Vec<ReceptionRecord>) -> Result<Self, LinkError> {
        if records.is_empty() {
            return Err(LinkError::EmptyReceptionSet);
        }

        // Stable: records equal on both keys keep their arrival order
        records.sort_by(by_signal);
        Ok(Self { records })
    }

    /// The gateway with the lowest-noise reception
    pub fn best(&self) -> &ReceptionRecord {
        &self.records[0]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReceptionRecord> {
        self.records.iter()
    }

    pub fn into_inner(self) -> Vec<ReceptionRecord> {
        self.records
    }
}

impl<'a> IntoIterator for &'a RankedReceptions {
    type Item = &'a ReceptionRecord;
    type IntoIter = std::slice::Iter<'a, ReceptionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
pub(crate) fn record(id: u8, snr: f32, rssi: i32) -> ReceptionRecord {
    ReceptionRecord {
        gateway_id: [id, 0, 0, 0, 0, 0, 0, id],
        snr,
        rssi,
        antenna: 0,
        board: 0,
        context: vec![0x00, 0x0F, 0x42, id],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_fails() {
        let result = RankedReceptions::rank(vec![]);
        assert!(matches!(result, Err(LinkError::EmptyReceptionSet)));
    }

    #[test]
    fn test_sorted_by_snr_descending() {
        let ranked = RankedReceptions::rank(vec![
            record(1, -3.0, -110),
            record(2, 9.5, -100),
            record(3, 4.25, -60),
        ])
        .unwrap();

        let snrs: Vec<f32> = ranked.iter().map(|r| r.snr).collect();
        assert_eq!(snrs, vec![9.5, 4.25, -3.0]);
        assert_eq!(ranked.best().gateway_id[0], 2);
    }

    #[test]
    fn test_snr_tie_broken_by_rssi() {
        // gwB has the same SNR but a stronger signal
        let ranked =
            RankedReceptions::rank(vec![record(0xA, 7.0, -80), record(0xB, 7.0, -60)]).unwrap();

        assert_eq!(ranked.best().gateway_id[0], 0xB);
        assert_eq!(ranked.best().rssi, -60);
    }

    #[test]
    fn test_signed_zero_snr_tie_broken_by_rssi() {
        let ranked =
            RankedReceptions::rank(vec![record(0xA, 0.0, -100), record(0xB, -0.0, -70)]).unwrap();
        assert_eq!(ranked.best().gateway_id[0], 0xB);

        let ranked =
            RankedReceptions::rank(vec![record(0xA, -0.0, -100), record(0xB, 0.0, -70)]).unwrap();
        assert_eq!(ranked.best().gateway_id[0], 0xB);
    }

    #[test]
    fn test_output_is_permutation_of_input() {
        let input = vec![
            record(1, 2.0, -90),
            record(2, 2.0, -95),
            record(3, 10.0, -120),
            record(4, -7.5, -40),
            record(5, 2.0, -90),
        ];
        let ranked = RankedReceptions::rank(input.clone()).unwrap();
        assert_eq!(ranked.len(), input.len());

        for r in &input {
            assert!(ranked.iter().any(|x| x == r));
        }

        let out = ranked.into_inner();
        for pair in out.windows(2) {
            assert_ne!(by_signal(&pair[0], &pair[1]), Ordering::Greater);
        }

        // Fully equal records keep arrival order
        let ids: Vec<u8> = out.iter().map(|r| r.gateway_id[0]).collect();
        assert_eq!(ids, vec![3, 1, 5, 2, 4]);
    }

    #[test]
    fn test_single_record() {
        let ranked = RankedReceptions::rank(vec![record(7, -20.0, -130)]).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked.best().gateway_id[0], 7);
    }
}
