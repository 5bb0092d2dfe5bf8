//! Tunable-white light client element: Generic OnOff and Light CTL clients
//! per instance.

use std::sync::Arc;

use log::{debug, warn};

use super::{
    settle_client_event, subscribe_block, subscribe_config_server, ElementBlock, ElementCtx,
    ElementFactory,
};
use crate::api::{func_id, unpack_element, ApiPayload, CwwwClientEvt, CwwwClientReq};
use crate::composition::{sig, ElementType};
use crate::control::{api, el_state, frm_ble, system, to_ble, Code, EventMask};
use crate::error::{err_code, MeshxError, Result};
use crate::models::{
    arg_bmap, decode, light_ctl_client, onoff_client, BleRequest, ElStateChange, MSG_GET,
};
use crate::node::Device;
use crate::port::{addr, GenClientEvent, LightClientEvent};

pub struct CwwwClientFactory;

impl ElementFactory for CwwwClientFactory {
    fn element_type(&self) -> ElementType {
        ElementType::CwwwClient
    }

    fn sig_models(&self) -> &'static [u16] {
        &[sig::GEN_ONOFF_CLI, sig::LIGHT_CTL_CLI]
    }

    fn subscribe(&self, dev: &Device, block: Arc<ElementBlock>) -> Result<()> {
        subscribe_block(
            dev,
            Code::FrmBle,
            frm_ble::GEN_ONOFF_CLI | frm_ble::LIGHT_CTL_CLI,
            &block,
            on_client_event,
        )?;
        subscribe_block(
            dev,
            Code::ElStateCh,
            el_state::SET_ON_OFF | el_state::SET_CTL,
            &block,
            on_state_change,
        )?;
        subscribe_block(dev, Code::ToMeshx, api::DATA, &block, on_app_request)?;
        subscribe_block(
            dev,
            Code::ToBle,
            to_ble::SET_ON_OFF | to_ble::SET_CTL,
            &block,
            on_ble_request,
        )?;
        subscribe_block(dev, Code::System, system::FRESH_BOOT, &block, on_fresh_boot)?;
        subscribe_config_server(dev, &block)
    }
}

fn on_client_event(block: &ElementBlock, dev: &Device, evt: EventMask, payload: &[u8]) -> Result<()> {
    if evt & frm_ble::GEN_ONOFF_CLI != 0 {
        let ev: GenClientEvent = decode(payload)?;
        if block.contains(ev.model.element_idx)
            && settle_client_event(dev, ev.model.element_idx, ev.evt, ev.ctx.src_addr)
        {
            dev.bus.try_publish_value(
                Code::ElStateCh,
                el_state::SET_ON_OFF,
                &onoff_client::state_change(&ev),
            )?;
        }
    } else if evt & frm_ble::LIGHT_CTL_CLI != 0 {
        let ev: LightClientEvent = decode(payload)?;
        if block.contains(ev.model.element_idx)
            && settle_client_event(dev, ev.model.element_idx, ev.evt, ev.ctx.src_addr)
        {
            dev.bus.try_publish_value(
                Code::ElStateCh,
                el_state::SET_CTL,
                &light_ctl_client::state_change(&ev),
            )?;
        }
    }
    Ok(())
}

fn on_state_change(block: &ElementBlock, dev: &Device, evt: EventMask, payload: &[u8]) -> Result<()> {
    let change: ElStateChange = decode(payload)?;
    let element_id = change.element_id;
    let is_ctl = evt & el_state::SET_CTL != 0;
    let report = block.with_ctx(element_id, |ctx| {
        if change.err_code != err_code::SUCCESS {
            return Some((change.err_code, *ctx));
        }
        let changed = if is_ctl {
            light_ctl_client::merge_status(&mut ctx.ctl, change.opcode, &change.ctl)
        } else {
            let changed = ctx.on_off != change.on_off;
            ctx.on_off = change.on_off;
            changed
        };
        changed.then_some((err_code::SUCCESS, *ctx))
    });
    let (code, ctx) = match report.flatten() {
        Some(r) => r,
        None => return Ok(()),
    };
    if code == err_code::SUCCESS {
        block.persist(dev, element_id);
    } else {
        warn!("cwww client {}: request failed with code {}", element_id, code);
    }
    let out = CwwwClientEvt {
        err_code: code,
        on_off: ctx.on_off,
        ctl: ctx.ctl.into(),
    };
    let func = if is_ctl { func_id::CTL } else { func_id::ONOFF };
    dev.api
        .try_send_to_app(element_id, ElementType::CwwwClient, func, &out.to_bytes())
}

fn on_app_request(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let (hdr, body) = unpack_element(payload)?;
    if hdr.element_type != ElementType::CwwwClient.as_u16() || !block.contains(hdr.element_id) {
        return Ok(());
    }
    let req = CwwwClientReq::from_bytes(body)?;
    let mut ble = BleRequest {
        element_id: hdr.element_id,
        set_get: req.set_get,
        ack: req.ack != 0,
        arg_bmap: req.arg_bmap,
        on_off: req.on_off,
        ctl: req.ctl.into(),
    };
    let evt = match hdr.func_id {
        func_id::ONOFF => {
            ble.arg_bmap = arg_bmap::ONOFF_SET;
            to_ble::SET_ON_OFF
        }
        func_id::CTL => to_ble::SET_CTL,
        other => {
            return Err(MeshxError::NotSupported(format!("cwww client func {}", other)));
        }
    };
    dev.bus.try_publish_value(Code::ToBle, evt, &ble)
}

/// Fold an unacknowledged CTL set into the cached state.
fn apply_unacked_ctl(ctx: &mut ElementCtx, req: &BleRequest) {
    let b = req.arg_bmap;
    if b & arg_bmap::LIGHTNESS_SET != 0 {
        ctx.ctl.lightness = req.ctl.lightness;
    }
    if b & arg_bmap::TEMPERATURE_SET != 0 {
        ctx.ctl.temperature = req.ctl.temperature;
    }
    if b & arg_bmap::DELTA_UV_SET != 0 {
        ctx.ctl.delta_uv = req.ctl.delta_uv;
    }
    if b & arg_bmap::TEMPERATURE_RANGE_SET_MIN != 0 {
        ctx.ctl.range_min = req.ctl.range_min;
    }
    if b & arg_bmap::TEMPERATURE_RANGE_SET_MAX != 0 {
        ctx.ctl.range_max = req.ctl.range_max;
    }
}

fn on_ble_request(block: &ElementBlock, dev: &Device, evt: EventMask, payload: &[u8]) -> Result<()> {
    let req: BleRequest = decode(payload)?;
    let sent = block.with_ctx(req.element_id, |ctx| -> Result<bool> {
        if addr::is_unassigned(ctx.pub_addr) {
            return Err(MeshxError::invalid_state(format!(
                "cwww client {} has no publication address",
                req.element_id
            )));
        }
        let unacked_set = !req.is_get() && !req.ack;
        if evt & to_ble::SET_CTL != 0 {
            light_ctl_client::send(dev, &req, ctx.pub_addr, ctx.app_id, ctx.tid)?;
            if unacked_set {
                apply_unacked_ctl(ctx, &req);
            }
        } else {
            onoff_client::send(dev, &req, ctx.pub_addr, ctx.app_id, ctx.tid)?;
            if unacked_set {
                ctx.on_off = req.on_off;
            }
        }
        ctx.tid = ctx.tid.wrapping_add(1);
        Ok(unacked_set)
    });
    if sent.transpose()?.unwrap_or(false) {
        block.persist(dev, req.element_id);
    }
    Ok(())
}

fn on_fresh_boot(block: &ElementBlock, dev: &Device, _evt: EventMask, _payload: &[u8]) -> Result<()> {
    for snap in block.snapshot() {
        if addr::is_unassigned(snap.ctx.pub_addr) {
            continue;
        }
        debug!("cwww client {}: syncing state", snap.element_id);
        let onoff = BleRequest::onoff(snap.element_id, MSG_GET, true, 0);
        dev.bus.try_publish_value(Code::ToBle, to_ble::SET_ON_OFF, &onoff)?;
        let ctl = BleRequest {
            arg_bmap: arg_bmap::CTL_SET,
            ..onoff
        };
        dev.bus.try_publish_value(Code::ToBle, to_ble::SET_CTL, &ctl)?;
    }
    Ok(())
}
