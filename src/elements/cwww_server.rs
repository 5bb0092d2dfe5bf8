//! Tunable-white light server element.
//!
//! Each instance carries a Generic OnOff server, a Light CTL server and the
//! CTL setup server that owns the default and range state.

use std::sync::Arc;

use log::debug;

use super::{subscribe_block, subscribe_config_server, ElementBlock, ElementFactory};
use crate::api::CwwwServerEvt;
use crate::composition::{sig, ElementType};
use crate::control::{frm_ble, Code, EventMask};
use crate::error::Result;
use crate::models::{decode, light_ctl_server, onoff_server};
use crate::node::Device;
use crate::port::{GenServerEvent, LightServerEvent};

pub struct CwwwServerFactory;

impl ElementFactory for CwwwServerFactory {
    fn element_type(&self) -> ElementType {
        ElementType::CwwwServer
    }

    fn sig_models(&self) -> &'static [u16] {
        &[sig::GEN_ONOFF_SRV, sig::LIGHT_CTL_SRV, sig::LIGHT_CTL_SETUP_SRV]
    }

    fn subscribe(&self, dev: &Device, block: Arc<ElementBlock>) -> Result<()> {
        subscribe_block(dev, Code::FrmBle, frm_ble::GEN_ONOFF_SRV, &block, on_onoff)?;
        subscribe_block(dev, Code::FrmBle, frm_ble::LIGHT_CTL_SRV, &block, on_ctl)?;
        subscribe_config_server(dev, &block)
    }
}

fn notify(dev: &Device, element_id: u16, evt: CwwwServerEvt) -> Result<()> {
    dev.api
        .try_send_to_app(element_id, ElementType::CwwwServer, evt.func_id(), &evt.to_bytes())
}

fn on_onoff(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let ev: GenServerEvent = decode(payload)?;
    let element_id = ev.model.element_idx;
    let hal = match block.with_ctx(element_id, |ctx| onoff_server::handle(dev, &ev, &mut ctx.on_off)) {
        Some(r) => r?,
        None => return Ok(()),
    };
    if let Some(hal) = hal {
        block.persist(dev, element_id);
        notify(dev, element_id, CwwwServerEvt::OnOff { state: hal.on_off })?;
    }
    Ok(())
}

fn on_ctl(block: &ElementBlock, dev: &Device, _evt: EventMask, payload: &[u8]) -> Result<()> {
    let ev: LightServerEvent = decode(payload)?;
    let element_id = ev.model.element_idx;
    let outcome = match block.with_ctx(element_id, |ctx| {
        light_ctl_server::handle(dev, &ev, &mut ctx.ctl, &mut ctx.ctl_default)
    }) {
        Some(r) => r?,
        None => return Ok(()),
    };
    if outcome.is_some() && light_ctl_server::is_state_change(ev.ctx.opcode) {
        if let Some(ctx) = block.ctx(element_id) {
            debug!(
                "cwww server {} -> l=0x{:04x} t=0x{:04x} duv=0x{:04x}",
                element_id, ctx.ctl.lightness, ctx.ctl.temperature, ctx.ctl.delta_uv
            );
            block.persist(dev, element_id);
            notify(dev, element_id, CwwwServerEvt::Ctl(ctx.ctl.into()))?;
        }
    }
    Ok(())
}
