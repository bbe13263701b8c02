//! Link-control core of a LoRaWAN network server.
//!
//! Picks the downlink gateway among all receptions of an uplink, runs the
//! ADR algorithm, answers LinkCheckReq and builds the downlink frames sent
//! back over the Semtech UDP Packet Forwarder protocol.

pub mod adr;
pub mod band;
pub mod config;
pub mod downlink;
pub mod error;
pub mod gateway;
pub mod lorawan;
pub mod maccommand;
pub mod storage;
pub mod udp;
pub mod uplink;

pub use error::{BandError, LinkError};
