//! Generic OnOff server.
//!
//! GET is answered by the stack itself, so only SET and SET_UNACK reach the
//! element state. A set addressed to this node updates the state, publishes
//! a status when the sender is not the configured publish target, and then
//! asks the HAL to drive the output.

use log::{debug, warn};

use super::HalOnOff;
use crate::control::{to_hal, Code};
use crate::error::{MeshxError, Result};
use crate::node::Device;
use crate::port::{addr, opcode, GenServerEvent, MeshPort, ModelRef};

/// Whether a state-changing message to `dst` is meant for `model`.
pub fn destination_accepted(port: &dyn MeshPort, model: &ModelRef, dst: u16) -> bool {
    addr::is_unicast(dst)
        || addr::is_broadcast(dst)
        || (addr::is_group(dst) && port.is_group_subscribed(model, dst))
}

pub fn status_payload(on_off: u8) -> [u8; 1] {
    [on_off]
}

/// Apply one incoming OnOff message to `on_off`. Returns the HAL command
/// that was posted, if any.
pub fn handle(dev: &Device, ev: &GenServerEvent, on_off: &mut u8) -> Result<Option<HalOnOff>> {
    debug!(
        "onoff srv op=0x{:04x} src=0x{:04x} dst=0x{:04x} el={}",
        ev.ctx.opcode, ev.ctx.src_addr, ev.ctx.dst_addr, ev.model.element_idx
    );
    match ev.ctx.opcode {
        opcode::GEN_ONOFF_GET => Ok(None),
        opcode::GEN_ONOFF_SET | opcode::GEN_ONOFF_SET_UNACK => {
            if ev.onoff > 1 {
                return Err(MeshxError::invalid_arg(format!("onoff value {}", ev.onoff)));
            }
            if !destination_accepted(dev.port.as_ref(), &ev.model, ev.ctx.dst_addr) {
                return Err(MeshxError::NotAllowed(ev.ctx.dst_addr));
            }
            *on_off = ev.onoff;

            let pub_addr = ev.model.pub_addr;
            if !addr::is_unassigned(pub_addr) && ev.ctx.dst_addr != pub_addr {
                dev.port
                    .publish(&ev.model, opcode::GEN_ONOFF_STATUS, &status_payload(*on_off))?;
            }

            let hal = HalOnOff {
                element_id: ev.model.element_idx,
                on_off: *on_off,
            };
            dev.bus.try_publish_value(Code::ToHal, to_hal::SET_ON_OFF, &hal)?;
            Ok(Some(hal))
        }
        other => {
            warn!("onoff srv: unhandled opcode 0x{:04x}", other);
            Ok(None)
        }
    }
}
