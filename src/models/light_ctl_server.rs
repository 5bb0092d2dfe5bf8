//! Light CTL server and CTL setup server.
//!
//! Status bodies are packed big-endian pair by pair. The temperature range
//! status keeps the deployed layout, which writes `range_max` low byte first.

use log::{debug, warn};

use super::onoff_server::destination_accepted;
use super::HalCtl;
use crate::control::{to_hal, Code, EventMask};
use crate::error::{MeshxError, Result};
use crate::node::Device;
use crate::port::{addr, opcode, LightCtlParams, LightServerEvent, MsgCtx};

/// Status code carried in every temperature range status.
pub const RANGE_STATUS_CODE: u8 = 1;

pub fn pack_ctl_status(state: &LightCtlParams) -> [u8; 4] {
    let [t_hi, t_lo] = state.temperature.to_be_bytes();
    let [l_hi, l_lo] = state.lightness.to_be_bytes();
    [t_hi, t_lo, l_hi, l_lo]
}

pub fn pack_temperature_status(state: &LightCtlParams) -> [u8; 4] {
    let [t_hi, t_lo] = state.temperature.to_be_bytes();
    let [d_hi, d_lo] = state.delta_uv.to_be_bytes();
    [t_hi, t_lo, d_hi, d_lo]
}

pub fn pack_default_status(default: &LightCtlParams) -> [u8; 6] {
    let [l_hi, l_lo] = default.lightness.to_be_bytes();
    let [t_hi, t_lo] = default.temperature.to_be_bytes();
    let [d_hi, d_lo] = default.delta_uv.to_be_bytes();
    [l_hi, l_lo, t_hi, t_lo, d_hi, d_lo]
}

pub fn pack_range_status(state: &LightCtlParams) -> [u8; 5] {
    let [min_hi, min_lo] = state.range_min.to_be_bytes();
    let [max_hi, max_lo] = state.range_max.to_be_bytes();
    [RANGE_STATUS_CODE, min_hi, min_lo, max_lo, max_hi]
}

/// What one incoming CTL message resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlOutcome {
    pub status_opcode: u32,
    pub status: Vec<u8>,
    /// Reply to the sender (false for unacknowledged sets).
    pub reply: bool,
    /// HAL event and command, for messages that change the output.
    pub hal: Option<(EventMask, HalCtl)>,
}

/// Opcodes that modify server state.
pub fn is_state_change(op: u32) -> bool {
    matches!(
        op,
        opcode::LIGHT_CTL_SET
            | opcode::LIGHT_CTL_SET_UNACK
            | opcode::LIGHT_CTL_TEMPERATURE_SET
            | opcode::LIGHT_CTL_TEMPERATURE_SET_UNACK
            | opcode::LIGHT_CTL_DEFAULT_SET
            | opcode::LIGHT_CTL_DEFAULT_SET_UNACK
            | opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET
            | opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET_UNACK
    )
}

/// Update `current`/`default` for `op` and build the status to send back.
/// `None` for status opcodes and anything this server does not handle.
pub fn apply(
    element_id: u16,
    op: u32,
    incoming: &LightCtlParams,
    current: &mut LightCtlParams,
    default: &mut LightCtlParams,
) -> Option<CtlOutcome> {
    let hal_cmd = |s: &LightCtlParams| HalCtl {
        element_id,
        lightness: s.lightness,
        temperature: s.temperature,
        delta_uv: s.delta_uv,
    };
    match op {
        opcode::LIGHT_CTL_GET => Some(CtlOutcome {
            status_opcode: opcode::LIGHT_CTL_STATUS,
            status: pack_ctl_status(current).to_vec(),
            reply: true,
            hal: None,
        }),
        opcode::LIGHT_CTL_SET | opcode::LIGHT_CTL_SET_UNACK => {
            current.lightness = incoming.lightness;
            current.temperature = incoming.temperature;
            current.delta_uv = incoming.delta_uv;
            Some(CtlOutcome {
                status_opcode: opcode::LIGHT_CTL_STATUS,
                status: pack_ctl_status(current).to_vec(),
                reply: op == opcode::LIGHT_CTL_SET,
                hal: Some((to_hal::SET_CTL, hal_cmd(current))),
            })
        }
        opcode::LIGHT_CTL_TEMPERATURE_GET => Some(CtlOutcome {
            status_opcode: opcode::LIGHT_CTL_TEMPERATURE_STATUS,
            status: pack_temperature_status(current).to_vec(),
            reply: true,
            hal: None,
        }),
        opcode::LIGHT_CTL_TEMPERATURE_SET | opcode::LIGHT_CTL_TEMPERATURE_SET_UNACK => {
            current.temperature = incoming.temperature;
            current.delta_uv = incoming.delta_uv;
            Some(CtlOutcome {
                status_opcode: opcode::LIGHT_CTL_TEMPERATURE_STATUS,
                status: pack_temperature_status(current).to_vec(),
                reply: op == opcode::LIGHT_CTL_TEMPERATURE_SET,
                hal: Some((to_hal::SET_TEMP, hal_cmd(current))),
            })
        }
        opcode::LIGHT_CTL_DEFAULT_GET
        | opcode::LIGHT_CTL_DEFAULT_SET
        | opcode::LIGHT_CTL_DEFAULT_SET_UNACK => {
            if op != opcode::LIGHT_CTL_DEFAULT_GET {
                default.lightness = incoming.lightness;
                default.temperature = incoming.temperature;
                default.delta_uv = incoming.delta_uv;
            }
            Some(CtlOutcome {
                status_opcode: opcode::LIGHT_CTL_DEFAULT_STATUS,
                status: pack_default_status(default).to_vec(),
                reply: op != opcode::LIGHT_CTL_DEFAULT_SET_UNACK,
                hal: None,
            })
        }
        opcode::LIGHT_CTL_TEMPERATURE_RANGE_GET
        | opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET
        | opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET_UNACK => {
            if op != opcode::LIGHT_CTL_TEMPERATURE_RANGE_GET {
                current.range_min = incoming.range_min;
                current.range_max = incoming.range_max;
            }
            Some(CtlOutcome {
                status_opcode: opcode::LIGHT_CTL_TEMPERATURE_RANGE_STATUS,
                status: pack_range_status(current).to_vec(),
                reply: op != opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET_UNACK,
                hal: None,
            })
        }
        opcode::LIGHT_CTL_STATUS
        | opcode::LIGHT_CTL_TEMPERATURE_STATUS
        | opcode::LIGHT_CTL_DEFAULT_STATUS
        | opcode::LIGHT_CTL_TEMPERATURE_RANGE_STATUS => {
            debug!("ctl srv: ignoring status opcode 0x{:04x}", op);
            None
        }
        other => {
            warn!("ctl srv: unhandled opcode 0x{:04x}", other);
            None
        }
    }
}

/// Apply one incoming CTL message, emit its HAL command and send the status.
/// Returns the outcome so the element can persist and notify.
pub fn handle(
    dev: &Device,
    ev: &LightServerEvent,
    current: &mut LightCtlParams,
    default: &mut LightCtlParams,
) -> Result<Option<CtlOutcome>> {
    let op = ev.ctx.opcode;
    if is_state_change(op) && !destination_accepted(dev.port.as_ref(), &ev.model, ev.ctx.dst_addr) {
        return Err(MeshxError::NotAllowed(ev.ctx.dst_addr));
    }

    let outcome = match apply(ev.model.element_idx, op, &ev.params, current, default) {
        Some(o) => o,
        None => return Ok(None),
    };

    if let Some((evt, hal)) = &outcome.hal {
        dev.bus.try_publish_value(Code::ToHal, *evt, hal)?;
    }

    if outcome.reply {
        let reply = MsgCtx {
            src_addr: ev.ctx.dst_addr,
            dst_addr: ev.ctx.src_addr,
            opcode: outcome.status_opcode,
            ..ev.ctx.clone()
        };
        dev.port
            .send_msg(&ev.model, &reply, outcome.status_opcode, &outcome.status)?;
    }

    let pub_addr = ev.model.pub_addr;
    if is_state_change(op) && !addr::is_unassigned(pub_addr) && ev.ctx.src_addr != pub_addr {
        dev.port
            .publish(&ev.model, outcome.status_opcode, &outcome.status)?;
    }
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(lightness: u16, temperature: u16, delta_uv: u16) -> LightCtlParams {
        LightCtlParams {
            lightness,
            temperature,
            delta_uv,
            ..LightCtlParams::default()
        }
    }

    #[test]
    fn ctl_status_is_temperature_then_lightness() {
        let s = params(0x8000, 0x1F40, 0);
        assert_eq!(pack_ctl_status(&s), [0x1F, 0x40, 0x80, 0x00]);
    }

    #[test]
    fn temperature_and_default_layouts() {
        let s = params(0x1234, 0x0BB8, 0x00FF);
        assert_eq!(pack_temperature_status(&s), [0x0B, 0xB8, 0x00, 0xFF]);
        assert_eq!(pack_default_status(&s), [0x12, 0x34, 0x0B, 0xB8, 0x00, 0xFF]);
    }

    #[test]
    fn range_status_keeps_max_low_byte_first() {
        let s = LightCtlParams {
            range_min: 0x0320,
            range_max: 0x4E20,
            ..LightCtlParams::default()
        };
        assert_eq!(pack_range_status(&s), [1, 0x03, 0x20, 0x20, 0x4E]);
    }

    #[test]
    fn unack_set_changes_state_without_reply() {
        let mut cur = LightCtlParams::default();
        let mut def = LightCtlParams::default();
        let out = apply(
            3,
            opcode::LIGHT_CTL_SET_UNACK,
            &params(0x8000, 0x1F40, 0),
            &mut cur,
            &mut def,
        )
        .unwrap();
        assert!(!out.reply);
        assert_eq!(cur.lightness, 0x8000);
        let (evt, hal) = out.hal.unwrap();
        assert_eq!(evt, to_hal::SET_CTL);
        assert_eq!(hal.element_id, 3);
    }

    #[test]
    fn default_set_leaves_current_state_alone() {
        let mut cur = params(1, 2, 3);
        let mut def = LightCtlParams::default();
        let out = apply(
            1,
            opcode::LIGHT_CTL_DEFAULT_SET,
            &params(0x0100, 0x0200, 0x0300),
            &mut cur,
            &mut def,
        )
        .unwrap();
        assert_eq!(cur, params(1, 2, 3));
        assert_eq!(def.temperature, 0x0200);
        assert!(out.hal.is_none());
        assert_eq!(out.status_opcode, opcode::LIGHT_CTL_DEFAULT_STATUS);
    }

    #[test]
    fn status_and_unknown_opcodes_are_ignored() {
        let mut cur = LightCtlParams::default();
        let mut def = LightCtlParams::default();
        let p = LightCtlParams::default();
        assert!(apply(1, opcode::LIGHT_CTL_STATUS, &p, &mut cur, &mut def).is_none());
        assert!(apply(1, 0x9999, &p, &mut cur, &mut def).is_none());
    }
}
