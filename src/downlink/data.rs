//! Data downlinks originated by this network server

use tracing::debug;
use uuid::Uuid;

use super::{DownlinkBuilder, DownlinkFrame, WindowMetadata};
use crate::error::LinkError;
use crate::gateway::{RankedReceptions, ReceptionRecord};

impl DownlinkBuilder<'_> {
    /// Schedule `phy_payload` in the receive windows described by `meta`,
    /// through the gateway with the best reception of the uplink.
    ///
    /// The frame is sent even when no window could be built.
    // TODO: confirm whether an item-less frame should reach the gateway
    // backend at all; the roaming path skips it.
    pub fn handle_data_downlink(
        &self,
        downlink_id: Uuid,
        rx_info: &[ReceptionRecord],
        phy_payload: &[u8],
        meta: &WindowMetadata,
    ) -> Result<(), LinkError> {
        let ranked = RankedReceptions::rank(rx_info.to_vec())?;
        let gateway = ranked.best();

        let frame = DownlinkFrame {
            downlink_id,
            gateway_id: gateway.gateway_id,
            items: self.build_items(gateway, phy_payload, meta)?,
        };

        debug!(
            "Data downlink {}: gateway={} items={}",
            downlink_id,
            hex::encode(frame.gateway_id),
            frame.items.len()
        );

        self.send_downlink_frame(frame)
    }
}
