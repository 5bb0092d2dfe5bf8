//! Light CTL client.
//!
//! `arg_bmap` picks the message family: any range bit selects the
//! temperature range messages, temperature and delta UV without lightness
//! select the temperature messages, everything else is plain CTL. Set bodies
//! use the little-endian access layout followed by the transaction id.

use bytes::BufMut;
use log::debug;

use super::{arg_bmap, BleRequest, ElStateChange};
use crate::composition::{sig, ModelId, TTL_DEFAULT};
use crate::error::{err_code, Result};
use crate::node::Device;
use crate::port::{opcode, ClientEvt, LightClientEvent, LightCtlParams, ModelRef, MsgCtx};
use crate::txcm::TxMsg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Ctl,
    Temperature,
    Range,
}

fn family(bmap: u8) -> Family {
    if bmap & arg_bmap::TEMPERATURE_RANGE_SET != 0 {
        Family::Range
    } else if bmap & arg_bmap::LIGHTNESS_SET == 0
        && bmap & (arg_bmap::TEMPERATURE_SET | arg_bmap::DELTA_UV_SET) != 0
    {
        Family::Temperature
    } else {
        Family::Ctl
    }
}

pub fn opcode_for(req: &BleRequest) -> u32 {
    match (family(req.arg_bmap), req.is_get(), req.ack) {
        (Family::Ctl, true, _) => opcode::LIGHT_CTL_GET,
        (Family::Ctl, false, true) => opcode::LIGHT_CTL_SET,
        (Family::Ctl, false, false) => opcode::LIGHT_CTL_SET_UNACK,
        (Family::Temperature, true, _) => opcode::LIGHT_CTL_TEMPERATURE_GET,
        (Family::Temperature, false, true) => opcode::LIGHT_CTL_TEMPERATURE_SET,
        (Family::Temperature, false, false) => opcode::LIGHT_CTL_TEMPERATURE_SET_UNACK,
        (Family::Range, true, _) => opcode::LIGHT_CTL_TEMPERATURE_RANGE_GET,
        (Family::Range, false, true) => opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET,
        (Family::Range, false, false) => opcode::LIGHT_CTL_TEMPERATURE_RANGE_SET_UNACK,
    }
}

/// Message body for the request; empty for GETs.
pub fn body_for(req: &BleRequest, tid: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7);
    if req.is_get() {
        return buf;
    }
    let c = &req.ctl;
    match family(req.arg_bmap) {
        Family::Ctl => {
            buf.put_u16_le(c.lightness);
            buf.put_u16_le(c.temperature);
            buf.put_u16_le(c.delta_uv);
            buf.put_u8(tid);
        }
        Family::Temperature => {
            buf.put_u16_le(c.temperature);
            buf.put_u16_le(c.delta_uv);
            buf.put_u8(tid);
        }
        Family::Range => {
            buf.put_u16_le(c.range_min);
            buf.put_u16_le(c.range_max);
        }
    }
    buf
}

pub fn send(dev: &Device, req: &BleRequest, pub_addr: u16, app_id: u16, tid: u8) -> Result<u32> {
    let op = opcode_for(req);
    let model = ModelRef {
        element_idx: req.element_id,
        model_id: ModelId::Sig(sig::LIGHT_CTL_CLI),
        pub_addr,
    };
    let ctx = MsgCtx {
        net_idx: dev.net_key_id(),
        app_idx: app_id,
        src_addr: 0,
        dst_addr: pub_addr,
        opcode: op,
        ttl: TTL_DEFAULT,
    };
    debug!("ctl cli el={} op=0x{:04x} dst=0x{:04x}", req.element_id, op, pub_addr);
    dev.txcm.submit(
        dev.port.as_ref(),
        TxMsg {
            model,
            ctx,
            opcode: op,
            body: body_for(req, tid),
        },
    )?;
    Ok(op)
}

pub fn state_change(ev: &LightClientEvent) -> ElStateChange {
    ElStateChange {
        element_id: ev.model.element_idx,
        err_code: match ev.evt {
            ClientEvt::Timeout => err_code::TIMEOUT,
            _ => err_code::SUCCESS,
        },
        opcode: ev.ctx.opcode,
        on_off: 0,
        ctl: ev.params,
    }
}

/// Fold a status into the cached state. Only the fields the status opcode
/// carries are taken; returns whether anything changed.
pub fn merge_status(
    cached: &mut LightCtlParams,
    status_opcode: u32,
    status: &LightCtlParams,
) -> bool {
    let before = *cached;
    match status_opcode {
        opcode::LIGHT_CTL_STATUS => {
            cached.lightness = status.lightness;
            cached.temperature = status.temperature;
        }
        opcode::LIGHT_CTL_TEMPERATURE_STATUS => {
            cached.temperature = status.temperature;
            cached.delta_uv = status.delta_uv;
        }
        opcode::LIGHT_CTL_TEMPERATURE_RANGE_STATUS => {
            cached.range_min = status.range_min;
            cached.range_max = status.range_max;
        }
        other => debug!("ctl cli: status 0x{:04x} leaves cached state alone", other),
    }
    *cached != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MSG_GET, MSG_SET};

    fn req(bmap: u8, set_get: u8, ack: bool) -> BleRequest {
        BleRequest {
            element_id: 3,
            set_get,
            ack,
            arg_bmap: bmap,
            on_off: 0,
            ctl: LightCtlParams {
                lightness: 0x8000,
                temperature: 0x1F40,
                delta_uv: 0x0001,
                range_min: 0x0320,
                range_max: 0x4E20,
            },
        }
    }

    #[test]
    fn bitmap_selects_message_family() {
        assert_eq!(opcode_for(&req(arg_bmap::CTL_SET, MSG_SET, true)), opcode::LIGHT_CTL_SET);
        assert_eq!(
            opcode_for(&req(arg_bmap::TEMPERATURE_SET, MSG_SET, false)),
            opcode::LIGHT_CTL_TEMPERATURE_SET_UNACK
        );
        assert_eq!(
            opcode_for(&req(arg_bmap::TEMPERATURE_RANGE_SET, MSG_GET, true)),
            opcode::LIGHT_CTL_TEMPERATURE_RANGE_GET
        );
        assert_eq!(opcode_for(&req(arg_bmap::CTL_SET, MSG_GET, false)), opcode::LIGHT_CTL_GET);
    }

    #[test]
    fn ctl_set_body_is_little_endian_with_tid() {
        let body = body_for(&req(arg_bmap::CTL_SET, MSG_SET, true), 7);
        assert_eq!(body, vec![0x00, 0x80, 0x40, 0x1F, 0x01, 0x00, 7]);
        assert!(body_for(&req(arg_bmap::CTL_SET, MSG_GET, true), 7).is_empty());
    }

    #[test]
    fn temperature_status_keeps_lightness_and_range() {
        let mut cached = LightCtlParams {
            lightness: 0x8000,
            temperature: 0x1F40,
            delta_uv: 0,
            range_min: 0x0400,
            range_max: 0x3000,
        };
        let status = LightCtlParams {
            lightness: 0,
            temperature: 0x0FA0,
            delta_uv: 0x0010,
            ..LightCtlParams::default()
        };
        assert!(merge_status(&mut cached, opcode::LIGHT_CTL_TEMPERATURE_STATUS, &status));
        assert_eq!(cached.lightness, 0x8000);
        assert_eq!(cached.temperature, 0x0FA0);
        assert_eq!(cached.delta_uv, 0x0010);
        assert_eq!((cached.range_min, cached.range_max), (0x0400, 0x3000));

        let range = LightCtlParams {
            range_min: 0x0500,
            range_max: 0x2000,
            ..LightCtlParams::default()
        };
        assert!(merge_status(&mut cached, opcode::LIGHT_CTL_TEMPERATURE_RANGE_STATUS, &range));
        assert_eq!(cached.lightness, 0x8000);
        assert_eq!(cached.temperature, 0x0FA0);
        assert_eq!((cached.range_min, cached.range_max), (0x0500, 0x2000));

        let same = cached;
        assert!(!merge_status(&mut cached, opcode::LIGHT_CTL_STATUS, &same));
        assert!(!merge_status(&mut cached, opcode::LIGHT_CTL_DEFAULT_STATUS, &status));
    }
}
