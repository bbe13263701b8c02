//! Downlinks forwarded on behalf of a roaming partner
//!
//! When this server acts as forwarding network server for a roaming device,
//! the home network hands over the PHY payload together with the receive
//! window metadata and the gateways that heard the uplink. Only class-A
//! downlinks are scheduled immediately.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{DownlinkBuilder, DownlinkFrame, WindowMetadata};
use crate::error::LinkError;
use crate::gateway::{RankedReceptions, ReceptionRecord};

/// Device class the home network asks the downlink to be sent for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassMode {
    A,
    B,
    C,
}

/// Decoded downlink request from a roaming partner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoamingDownlinkRequest {
    pub phy_payload: Vec<u8>,
    pub class_mode: Option<ClassMode>,
    pub dl_meta_data: WindowMetadata,
    /// Gateways that received the uplink being answered
    pub gw_info: Vec<ReceptionRecord>,
}

impl DownlinkBuilder<'_> {
    /// Schedule a roaming partner's downlink through the best gateway.
    ///
    /// Returns the downlink id when a frame was handed to the gateway
    /// backend, `None` when no window could be built.
    pub fn emit_roaming_downlink(
        &self,
        req: &RoamingDownlinkRequest,
    ) -> Result<Option<Uuid>, LinkError> {
        let ranked = RankedReceptions::rank(req.gw_info.clone())?;
        let gateway = ranked.best();

        let mut frame = DownlinkFrame {
            downlink_id: Uuid::new_v4(),
            gateway_id: gateway.gateway_id,
            items: Vec::new(),
        };

        if req.class_mode == Some(ClassMode::A) {
            frame.items = self.build_items(gateway, &req.phy_payload, &req.dl_meta_data)?;
        }

        if frame.items.is_empty() {
            debug!(
                "Roaming downlink not scheduled (class mode {:?})",
                req.class_mode
            );
            return Ok(None);
        }

        debug!(
            "Roaming downlink {}: gateway={} items={}",
            frame.downlink_id,
            hex::encode(frame.gateway_id),
            frame.items.len()
        );

        let id = frame.downlink_id;
        self.send_downlink_frame(frame)?;
        Ok(Some(id))
    }
}
