//! Device-session storage
//!
//! Holds the per-device radio-link state the ADR engine reads and writes,
//! including a bounded uplink history. The store itself is a collaborator:
//! the uplink flow only needs [`DeviceSessionStore`].

use std::collections::{HashMap, VecDeque};

use crate::adr::{LinkState, UplinkHistoryEntry, REQUIRED_HISTORY_COUNT};
use crate::config::DeviceConfig;

/// The most recent uplinks of a device, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UplinkHistory {
    entries: VecDeque<UplinkHistoryEntry>,
}

impl UplinkHistory {
    pub const CAPACITY: usize = REQUIRED_HISTORY_COUNT;

    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(Self::CAPACITY),
        }
    }

    /// Append an uplink, evicting the oldest entry when full.
    ///
    /// Retransmissions (a frame counter that does not advance) are not
    /// recorded again.
    pub fn push(&mut self, entry: UplinkHistoryEntry) {
        if let Some(last) = self.entries.back() {
            if entry.fcnt <= last.fcnt {
                return;
            }
        }

        if self.entries.len() == Self::CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<UplinkHistoryEntry> {
        self.entries.iter().copied().collect()
    }
}

/// Network-side session of an activated device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSession {
    pub dev_addr: u32,
    pub dr: u8,
    pub tx_power_index: u8,
    pub nb_trans: u8,
    pub adr: bool,
    pub max_dr: u8,
    pub max_tx_power_index: u8,
    /// Next expected 32-bit uplink frame counter
    pub f_cnt_up: u32,
    /// Downlink frame counter
    pub n_f_cnt_down: u32,
    pub uplink_history: UplinkHistory,
}

impl DeviceSession {
    pub fn new(dev_addr: u32, max_dr: u8, max_tx_power_index: u8) -> Self {
        Self {
            dev_addr,
            dr: 0,
            tx_power_index: 0,
            nb_trans: 1,
            adr: false,
            max_dr,
            max_tx_power_index,
            f_cnt_up: 0,
            n_f_cnt_down: 0,
            uplink_history: UplinkHistory::new(),
        }
    }

    /// ADR input for this session
    pub fn link_state(&self, required_snr_for_dr: f32, installation_margin: f32) -> LinkState {
        LinkState {
            dr: self.dr,
            tx_power_index: self.tx_power_index,
            nb_trans: self.nb_trans,
            adr: self.adr,
            max_dr: self.max_dr,
            max_tx_power_index: self.max_tx_power_index,
            required_snr_for_dr,
            installation_margin,
            uplink_history: self.uplink_history.snapshot(),
        }
    }

    /// Full 32-bit frame counter of an uplink carrying the 16 least
    /// significant bits `fcnt`. A repeat of the previous counter is a
    /// retransmission, anything else is assumed to lie ahead of the next
    /// expected value.
    pub fn full_f_cnt_up(&self, fcnt: u16) -> u32 {
        let expected = self.f_cnt_up as u16;
        if self.f_cnt_up > 0 && fcnt == expected.wrapping_sub(1) {
            return self.f_cnt_up - 1;
        }
        self.f_cnt_up
            .wrapping_add(u32::from(fcnt.wrapping_sub(expected)))
    }

    /// Record an accepted uplink counter
    pub fn set_f_cnt_up(&mut self, full_fcnt: u32) {
        if full_fcnt >= self.f_cnt_up {
            self.f_cnt_up = full_fcnt.wrapping_add(1);
        }
    }

    /// Persist the outcome of an ADR decision
    pub fn apply_link_state(&mut self, state: &LinkState) {
        self.dr = state.dr;
        self.tx_power_index = state.tx_power_index;
        self.nb_trans = state.nb_trans;
    }
}

impl From<&DeviceConfig> for DeviceSession {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            dr: cfg.dr,
            tx_power_index: cfg.tx_power_index,
            nb_trans: cfg.nb_trans,
            ..Self::new(cfg.dev_addr, cfg.max_dr, cfg.max_tx_power_index)
        }
    }
}

/// Device-session persistence
pub trait DeviceSessionStore: Send {
    fn get(&self, dev_addr: u32) -> Option<DeviceSession>;
    fn save(&mut self, session: DeviceSession);
}

/// Session store kept in memory, keyed by DevAddr
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: HashMap<u32, DeviceSession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Seed a store from configured devices
    pub fn from_devices(devices: &[DeviceConfig]) -> Self {
        let sessions = devices
            .iter()
            .map(|d| (d.dev_addr, DeviceSession::from(d)))
            .collect();
        Self { sessions }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl DeviceSessionStore for MemoryStore {
    fn get(&self, dev_addr: u32) -> Option<DeviceSession> {
        self.sessions.get(&dev_addr).cloned()
    }

    fn save(&mut self, session: DeviceSession) {
        self.sessions.insert(session.dev_addr, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fcnt: u32) -> UplinkHistoryEntry {
        UplinkHistoryEntry {
            fcnt,
            max_snr: fcnt as f32 / 10.0,
        }
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut h = UplinkHistory::new();
        for fcnt in 0..25 {
            h.push(entry(fcnt));
        }

        assert_eq!(h.len(), UplinkHistory::CAPACITY);
        let snap = h.snapshot();
        assert_eq!(snap.first().unwrap().fcnt, 5);
        assert_eq!(snap.last().unwrap().fcnt, 24);
    }

    #[test]
    fn test_history_skips_retransmissions() {
        let mut h = UplinkHistory::new();
        h.push(entry(10));
        h.push(entry(10));
        h.push(entry(9));
        h.push(entry(12));

        let fcnts: Vec<u32> = h.snapshot().iter().map(|e| e.fcnt).collect();
        assert_eq!(fcnts, vec![10, 12]);
    }

    #[test]
    fn test_link_state_round_trip() {
        let mut session = DeviceSession::new(0x260B1234, 5, 7);
        session.adr = true;
        session.uplink_history.push(entry(1));

        let mut state = session.link_state(-7.5, 10.0);
        assert_eq!(state.required_snr_for_dr, -7.5);
        assert_eq!(state.uplink_history.len(), 1);

        state.dr = 4;
        state.tx_power_index = 2;
        state.nb_trans = 3;
        session.apply_link_state(&state);
        assert_eq!((session.dr, session.tx_power_index, session.nb_trans), (4, 2, 3));
        assert_eq!(session.max_dr, 5);
    }

    #[test]
    fn test_full_f_cnt_up() {
        let mut session = DeviceSession::new(1, 5, 7);
        assert_eq!(session.full_f_cnt_up(0), 0);
        assert_eq!(session.full_f_cnt_up(7), 7);

        session.f_cnt_up = 65_536;
        assert_eq!(session.full_f_cnt_up(0), 65_536);
        assert_eq!(session.full_f_cnt_up(3), 65_539);
        // Retransmission of 65535
        assert_eq!(session.full_f_cnt_up(65_535), 65_535);

        session.f_cnt_up = 65_530;
        assert_eq!(session.full_f_cnt_up(2), 65_538);

        session.f_cnt_up = 0x0002_0005;
        assert_eq!(session.full_f_cnt_up(4), 0x0002_0004);
        assert_eq!(session.full_f_cnt_up(9), 0x0002_0009);
    }

    #[test]
    fn test_set_f_cnt_up_ignores_retransmissions() {
        let mut session = DeviceSession::new(1, 5, 7);
        session.set_f_cnt_up(10);
        assert_eq!(session.f_cnt_up, 11);
        session.set_f_cnt_up(10);
        assert_eq!(session.f_cnt_up, 11);
        session.set_f_cnt_up(65_536);
        assert_eq!(session.f_cnt_up, 65_537);
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        assert!(store.get(1).is_none());

        let mut session = DeviceSession::new(1, 5, 7);
        store.save(session.clone());
        session.dr = 3;
        store.save(session);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1).unwrap().dr, 3);
    }
}
