//! Adaptive Data Rate (ADR)
//!
//! Balances a device's data rate and transmit power against the link margin
//! observed over its recent uplinks, and picks the number of transmissions
//! per frame (NbTrans) from the packet-loss rate.
//!
//! The engine is a pure function of [`LinkState`]: the same type is used as
//! request and response so the caller can persist the result directly.

use serde::{Deserialize, Serialize};

/// Number of history entries required before loss is computed and before
/// transmit power is ever raised.
pub const REQUIRED_HISTORY_COUNT: usize = 20;

/// Max-SNR placeholder used when no uplink history is available
const NO_SNR: f32 = -999.0;

/// NbTrans lookup, rows by loss bucket (<5%, <10%, <30%, >=30%),
/// columns by current NbTrans (1, 2, 3).
const PKT_LOSS_RATE_TABLE: [[u8; 3]; 4] = [[1, 1, 2], [1, 2, 3], [2, 3, 3], [3, 3, 3]];

/// One uplink in a device's history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UplinkHistoryEntry {
    pub fcnt: u32,
    /// Best SNR over all gateways that received this uplink
    pub max_snr: f32,
}

/// Radio-link state of a device, as seen by the ADR engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkState {
    pub dr: u8,
    pub tx_power_index: u8,
    pub nb_trans: u8,
    /// ADR bit as set by the device on its last uplink
    pub adr: bool,
    pub max_dr: u8,
    pub max_tx_power_index: u8,
    /// Required SNR (dB) for the current data rate
    pub required_snr_for_dr: f32,
    /// Installation margin (dB)
    pub installation_margin: f32,
    /// Snapshot of the device's uplink history, oldest first
    pub uplink_history: Vec<UplinkHistoryEntry>,
}

/// An ADR algorithm.
pub trait AdrHandler: Send + Sync {
    /// Short identifier of the algorithm
    fn id(&self) -> &'static str;

    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Decide new DR, TX power index and NbTrans for the given state.
    fn handle(&self, req: &LinkState) -> LinkState;
}

/// The default ADR algorithm
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl AdrHandler for DefaultHandler {
    fn id(&self) -> &'static str {
        "default"
    }

    fn name(&self) -> &'static str {
        "Default ADR algorithm"
    }

    fn handle(&self, req: &LinkState) -> LinkState {
        // Without ADR the device keeps its current settings
        let mut resp = req.clone();
        if !req.adr {
            return resp;
        }

        // The DR is only ever lowered here when it exceeds the max. allowed DR
        if resp.dr > req.max_dr {
            resp.dr = req.max_dr;
        }

        resp.nb_trans = nb_trans(req.nb_trans, packet_loss_percentage(&req.uplink_history));

        let snr_margin =
            max_snr(&req.uplink_history) - req.required_snr_for_dr - req.installation_margin;
        let n_step = (snr_margin / 3.0) as i32;

        // Raising TX power before a full history window is available makes
        // the power oscillate up / down between uplinks.
        if n_step < 0 && req.uplink_history.len() != REQUIRED_HISTORY_COUNT {
            return resp;
        }

        let (tx_power_index, dr) = ideal_tx_power_index_and_dr(
            n_step,
            resp.tx_power_index,
            resp.dr,
            req.max_tx_power_index,
            req.max_dr,
        );
        resp.tx_power_index = tx_power_index;
        resp.dr = dr;

        resp
    }
}

/// Resolve `n_step` margin steps into a (TX power index, DR) pair, one unit
/// per step. Positive steps first raise the DR, then the TX power index
/// (lower power); negative steps lower the TX power index (higher power).
/// A step that hits both limits is consumed without effect.
fn ideal_tx_power_index_and_dr(
    n_step: i32,
    mut tx_power_index: u8,
    mut dr: u8,
    max_tx_power_index: u8,
    max_dr: u8,
) -> (u8, u8) {
    // Steps beyond the full DR and TX power range cannot change anything
    let mut n_step = n_step.clamp(
        -i32::from(tx_power_index),
        i32::from(max_dr) + i32::from(max_tx_power_index),
    );

    while n_step > 0 {
        if dr < max_dr {
            dr += 1;
        } else if tx_power_index < max_tx_power_index {
            tx_power_index += 1;
        }
        n_step -= 1;
    }

    while n_step < 0 {
        if tx_power_index > 0 {
            tx_power_index -= 1;
        }
        n_step += 1;
    }

    (tx_power_index, dr)
}

fn max_snr(history: &[UplinkHistoryEntry]) -> f32 {
    history.iter().map(|h| h.max_snr).fold(NO_SNR, f32::max)
}

fn nb_trans(current: u8, pkt_loss_rate: f32) -> u8 {
    let column = usize::from(current.clamp(1, 3)) - 1;

    let row = if pkt_loss_rate < 5.0 {
        0
    } else if pkt_loss_rate < 10.0 {
        1
    } else if pkt_loss_rate < 30.0 {
        2
    } else {
        3
    };

    PKT_LOSS_RATE_TABLE[row][column]
}

/// Packet loss (%) over the history window. Zero until the window is full.
///
/// Consecutive frame counters are expected to differ by one; a counter that
/// does not advance contributes no loss.
fn packet_loss_percentage(history: &[UplinkHistoryEntry]) -> f32 {
    if history.len() < REQUIRED_HISTORY_COUNT {
        return 0.0;
    }

    let lost_packets: u64 = history
        .windows(2)
        .map(|w| u64::from(w[1].fcnt.saturating_sub(w[0].fcnt).saturating_sub(1)))
        .sum();

    lost_packets as f32 / history.len() as f32 * 100.0
}
