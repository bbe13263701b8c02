//! Error kinds returned by the link-control components.
//!
//! Every variant aborts processing of a single uplink event only; none of
//! them are retried here.

use thiserror::Error;

use crate::band::Modulation;

/// Errors returned by the band-plan lookups.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BandError {
    /// The data-rate index has no entry in the band plan.
    #[error("unknown data-rate: {0}")]
    UnknownDataRate(u8),

    /// The frequency (Hz) is outside the band.
    #[error("unsupported frequency: {0} Hz")]
    UnsupportedFrequency(u32),

    /// The modulation parameters do not map to a data-rate index.
    #[error("no data-rate for modulation {0}")]
    UnknownModulation(String),
}

/// Errors returned by the selector, the MAC-command processor and the
/// downlink frame builder.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("rx info-set contains zero items")]
    EmptyReceptionSet,

    #[error("modulation {0} not supported for LinkCheckReq mac-command")]
    UnsupportedModulation(Modulation),

    #[error("lora modulation info must not be empty")]
    MissingModulationInfo,

    #[error("sf {0} not in sf to required snr table")]
    UnknownSpreadingFactor(u8),

    #[error("band-plan lookup error: {0}")]
    Band(#[from] BandError),

    #[error("send downlink-frame to gateway error: {0}")]
    TransportSendFailed(#[source] anyhow::Error),
}
