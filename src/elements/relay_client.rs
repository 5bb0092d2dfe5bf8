//! Relay (switch) client element: one Generic OnOff client per instance.
//!
//! Requests arrive from the application as `TO_MESHX` envelopes and from
//! inside the core (console, fresh-boot sync) as `TO_BLE` requests. Client
//! model events are turned into `EL_STATE_CH` notifications, which this
//! element then reports to the application. Acknowledged requests to a
//! unicast destination are resent by [`crate::txcm`]; a timeout reaches the
//! application only once the retries are spent.

use std::sync::Arc;

use log::{debug, info, warn};

use super::{
    settle_client_event, subscribe_block, subscribe_config_server, ElementBlock, ElementFactory,
};
use crate::api::{func_id, unpack_element, ApiPayload, RelayClientEvt, RelayClientReq};
use crate::composition::{sig, ElementType};
use crate::control::{api, el_state, frm_ble, system, to_ble, Code, EventMask};
use crate::error::{err_code, MeshxError, Result};
use crate::models::{decode, onoff_client, BleRequest, ElStateChange, MSG_GET};
use crate::node::Device;
use crate::port::{addr, GenClientEvent};

pub struct RelayClientFactory;

impl ElementFactory for RelayClientFactory {
    fn element_type(&self) -> ElementType {
        ElementType::RelayClient
    }

    fn sig_models(&self) -> &'static [u16] {
        &[sig::GEN_ONOFF_CLI]
    }

    fn subscribe(&self, dev: &Device, block: Arc<ElementBlock>) -> Result<()> {
        subscribe_block(dev, Code::FrmBle, frm_ble::GEN_ONOFF_CLI, &block, on_client_event)?;
        subscribe_block(dev, Code::ElStateCh, el_state::SET_ON_OFF, &block, on_state_change)?;
        subscribe_block(dev, Code::ToMeshx, api::DATA, &block, on_app_request)?;
        subscribe_block(dev, Code::ToBle, to_ble::SET_ON_OFF, &block, on_ble_request)?;
        subscribe_block(dev, Code::System, system::FRESH_BOOT, &block, on_fresh_boot)?;
        subscribe_config_server(dev, &block)
    }
}

fn on_client_event(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let ev: GenClientEvent = decode(payload)?;
    if !block.contains(ev.model.element_idx)
        || !settle_client_event(dev, ev.model.element_idx, ev.evt, ev.ctx.src_addr)
    {
        return Ok(());
    }
    let change = onoff_client::state_change(&ev);
    dev.bus
        .try_publish_value(Code::ElStateCh, el_state::SET_ON_OFF, &change)
}

fn on_state_change(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let change: ElStateChange = decode(payload)?;
    let element_id = change.element_id;
    let report = block.with_ctx(element_id, |ctx| {
        if change.err_code != err_code::SUCCESS {
            return Some(RelayClientEvt {
                err_code: change.err_code,
                on_off: ctx.on_off,
            });
        }
        if ctx.on_off == change.on_off {
            return None;
        }
        ctx.on_off = change.on_off;
        Some(RelayClientEvt {
            err_code: err_code::SUCCESS,
            on_off: ctx.on_off,
        })
    });
    match report.flatten() {
        Some(evt) => {
            if evt.err_code == err_code::SUCCESS {
                block.persist(dev, element_id);
            } else {
                warn!("relay client {}: request failed with code {}", element_id, evt.err_code);
            }
            dev.api
                .try_send_to_app(element_id, ElementType::RelayClient, func_id::ONOFF, &evt.to_bytes())
        }
        None => Ok(()),
    }
}

fn on_app_request(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let (hdr, body) = unpack_element(payload)?;
    if hdr.element_type != ElementType::RelayClient.as_u16() || !block.contains(hdr.element_id) {
        return Ok(());
    }
    if hdr.func_id != func_id::ONOFF {
        return Err(MeshxError::NotSupported(format!("relay client func {}", hdr.func_id)));
    }
    let req = RelayClientReq::from_bytes(body)?;
    let ble = BleRequest::onoff(hdr.element_id, req.set_get, req.ack != 0, req.on_off);
    dev.bus.try_publish_value(Code::ToBle, to_ble::SET_ON_OFF, &ble)
}

fn on_ble_request(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let req: BleRequest = decode(payload)?;
    let sent = block.with_ctx(req.element_id, |ctx| -> Result<()> {
        if addr::is_unassigned(ctx.pub_addr) {
            return Err(MeshxError::invalid_state(format!(
                "relay client {} has no publication address",
                req.element_id
            )));
        }
        onoff_client::send(dev, &req, ctx.pub_addr, ctx.app_id, ctx.tid)?;
        ctx.tid = ctx.tid.wrapping_add(1);
        if !req.is_get() && !req.ack {
            ctx.on_off = req.on_off;
        }
        Ok(())
    });
    match sent {
        Some(r) => r,
        None => Ok(()),
    }
}

fn on_fresh_boot(block: &ElementBlock, dev: &Device, _evt: EventMask, _payload: &[u8]) -> Result<()> {
    for snap in block.snapshot() {
        if addr::is_unassigned(snap.ctx.pub_addr) {
            debug!("relay client {}: no publication address, skipping sync", snap.element_id);
            continue;
        }
        info!("relay client {}: syncing state from 0x{:04x}", snap.element_id, snap.ctx.pub_addr);
        let req = BleRequest::onoff(snap.element_id, MSG_GET, true, 0);
        dev.bus.try_publish_value(Code::ToBle, to_ble::SET_ON_OFF, &req)?;
    }
    Ok(())
}
