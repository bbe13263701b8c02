//! Per-uplink link-control flow
//!
//! For every deduplicated data uplink:
//! 1. rank the gateways that heard it
//! 2. record the uplink in the device session and run ADR
//! 3. answer MAC commands carried in FOpts
//! 4. schedule a downlink in RX1 / RX2 if there is something to send

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adr::{AdrHandler, DefaultHandler, LinkState, UplinkHistoryEntry};
use crate::band::{self, Band, UplinkTxInfo};
use crate::config::NetworkServerConfig;
use crate::downlink::{DownlinkBuilder, GatewayBackend, WindowMetadata};
use crate::gateway::{RankedReceptions, ReceptionRecord};
use crate::lorawan::encoder::FrameBuilder;
use crate::lorawan::{self, MType};
use crate::maccommand::{self, MacCommand, MacCommandBlock};
use crate::storage::DeviceSessionStore;

/// An uplink as heard by one or more gateways
#[derive(Debug, Clone)]
pub struct UplinkEvent {
    /// Correlation id, reused for the downlink answering this uplink
    pub id: Uuid,
    pub phy_payload: Vec<u8>,
    pub tx_info: UplinkTxInfo,
    pub rx_info: Vec<ReceptionRecord>,
    /// When the first reception arrived
    pub received_at: DateTime<Utc>,
}

impl UplinkEvent {
    /// Time since the first gateway reported the uplink
    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.received_at)
    }
}

/// What the flow decided for one uplink
#[derive(Debug, Clone)]
pub struct UplinkOutcome {
    pub dev_addr: u32,
    pub link_state: LinkState,
    pub mac_answers: Vec<MacCommandBlock>,
    pub downlink_scheduled: bool,
}

pub struct UplinkHandler {
    config: NetworkServerConfig,
    band: Arc<dyn Band>,
    backend: Arc<dyn GatewayBackend>,
    adr: Box<dyn AdrHandler>,
    store: Box<dyn DeviceSessionStore>,
}

impl UplinkHandler {
    pub fn new(
        config: NetworkServerConfig,
        band: Arc<dyn Band>,
        backend: Arc<dyn GatewayBackend>,
        store: Box<dyn DeviceSessionStore>,
    ) -> Self {
        Self {
            config,
            band,
            backend,
            adr: Box::new(DefaultHandler),
            store,
        }
    }

    pub fn with_adr_handler(mut self, adr: Box<dyn AdrHandler>) -> Self {
        info!("Using ADR algorithm: {} ({})", adr.name(), adr.id());
        self.adr = adr;
        self
    }

    pub fn store(&self) -> &dyn DeviceSessionStore {
        self.store.as_ref()
    }

    /// Run the link-control flow for one uplink
    pub fn handle(&mut self, event: &UplinkEvent) -> anyhow::Result<UplinkOutcome> {
        let frame = lorawan::decode_data_frame(&event.phy_payload)?;
        if !frame.mtype.is_data_uplink() {
            anyhow::bail!("{} is not an uplink", frame.mtype);
        }

        let ranked = RankedReceptions::rank(event.rx_info.clone())?;
        debug!(
            "Uplink {} heard by {} gateway(s), best {}",
            event.id,
            ranked.len(),
            ranked.best()
        );

        let mut session = self
            .store
            .get(frame.dev_addr)
            .ok_or_else(|| anyhow::anyhow!("Unknown DevAddr {:08X}", frame.dev_addr))?;

        let full_fcnt = session.full_f_cnt_up(frame.fcnt);
        session.set_f_cnt_up(full_fcnt);
        session.adr = frame.fctrl.adr;
        session.uplink_history.push(UplinkHistoryEntry {
            fcnt: full_fcnt,
            max_snr: ranked.best().snr,
        });

        // ADR
        let uplink_dr = event
            .tx_info
            .data_rate()
            .and_then(|dr| self.band.data_rate_index(&dr).ok());
        if let Some(dr) = uplink_dr {
            session.dr = dr;
        }

        let link_state = match self.required_snr_for_dr(session.dr) {
            Some(required_snr) => {
                let req = session.link_state(required_snr, self.config.installation_margin);
                let resp = self.adr.handle(&req);
                if (resp.dr, resp.tx_power_index, resp.nb_trans)
                    != (req.dr, req.tx_power_index, req.nb_trans)
                {
                    info!(
                        "ADR {:08X}: dr {} -> {}, tx_power_index {} -> {}, nb_trans {} -> {}",
                        frame.dev_addr,
                        req.dr,
                        resp.dr,
                        req.tx_power_index,
                        resp.tx_power_index,
                        req.nb_trans,
                        resp.nb_trans
                    );
                }
                session.apply_link_state(&resp);
                resp
            }
            None => {
                warn!(
                    "No required SNR for DR {} of {:08X}, ADR skipped",
                    session.dr, frame.dev_addr
                );
                session.link_state(0.0, self.config.installation_margin)
            }
        };
        self.store.save(session.clone());

        // MAC commands
        let mac_commands = maccommand::parse_uplink_fopts(&frame.f_opts).unwrap_or_else(|e| {
            warn!("Ignoring FOpts of {:08X}: {}", frame.dev_addr, e);
            Vec::new()
        });

        let mut mac_answers = Vec::new();
        if mac_commands.contains(&MacCommand::LinkCheckReq) {
            mac_answers.push(maccommand::handle_link_check_req(&event.rx_info, &event.tx_info)?);
        }

        // Downlink
        let ack = frame.mtype == MType::ConfirmedDataUp;
        if mac_answers.is_empty() && !ack {
            return Ok(UplinkOutcome {
                dev_addr: frame.dev_addr,
                link_state,
                mac_answers,
                downlink_scheduled: false,
            });
        }

        let phy_payload = FrameBuilder::new_downlink(frame.dev_addr, session.n_f_cnt_down)
            .with_adr(session.adr)
            .with_ack(ack)
            .with_f_opts(maccommand::encode_downlink_fopts(&mac_answers))
            .build()?;

        let meta = self.window_metadata(&event.tx_info, uplink_dr);
        DownlinkBuilder::new(self.band.as_ref(), self.backend.as_ref()).handle_data_downlink(
            event.id,
            &event.rx_info,
            &phy_payload,
            &meta,
        )?;

        session.n_f_cnt_down = session.n_f_cnt_down.wrapping_add(1);
        self.store.save(session);

        info!(
            "Downlink {} scheduled for {:08X} via {} ({} ms after reception)",
            event.id,
            frame.dev_addr,
            hex::encode(ranked.best().gateway_id),
            event.elapsed().num_milliseconds()
        );

        Ok(UplinkOutcome {
            dev_addr: frame.dev_addr,
            link_state,
            mac_answers,
            downlink_scheduled: true,
        })
    }

    fn required_snr_for_dr(&self, dr: u8) -> Option<f32> {
        match self.band.data_rate(dr).ok()? {
            band::DataRate::Lora {
                spreading_factor, ..
            } => band::required_snr(spreading_factor),
            band::DataRate::Fsk { .. } => None,
        }
    }

    /// RX1 on the uplink channel and data rate, RX2 on the configured
    /// channel.
    fn window_metadata(&self, tx_info: &UplinkTxInfo, uplink_dr: Option<u8>) -> WindowMetadata {
        WindowMetadata {
            dl_freq1: Some(f64::from(tx_info.frequency) / 1_000_000.0),
            data_rate1: uplink_dr,
            rx_delay1: Some(self.config.rx1_delay),
            dl_freq2: Some(self.config.rx2_frequency),
            data_rate2: Some(self.config.rx2_data_rate),
        }
    }
}
